use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use catalog_ranker::gateway::openrouter::{ChatProvider, OpenRouterAdapter, MAX_INPUT_CHARS};
use catalog_ranker::gateway::{
    Attribution, ChatModel, ChatRequest, FinishReason, GatewayConfig, MemoryUsageSink, Message,
    ProviderError, ProviderGateway,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None).unwrap()
}

fn hello_request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("openai/gpt-4o-mini"),
        vec![Message::user("hi")],
        Attribution::new("test"),
    )
}

fn ok_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    })
}

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "{\"rank\": 3}" },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&hello_request()).await.unwrap();
    assert_eq!(resp.content, "{\"rank\": 3}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(
        resp.cost_nanodollars,
        catalog_ranker::gateway::chat_cost("openai/gpt-4o-mini", 10, 20)
    );
}

#[tokio::test]
async fn json_mode_sets_response_format() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "type": "json_object" },
            "temperature": 0.5
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{}")))
        .expect(1)
        .mount(&server)
        .await;

    let req = hello_request().json().temperature(0.5);
    adapter(&server).chat(&req).await.unwrap();
}

#[tokio::test]
async fn openrouter_falls_back_to_tool_call_arguments_when_content_empty() {
    let server = MockServer::start().await;
    let args = r#"{"rankings": []}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server)
        .chat(&hello_request().json())
        .await
        .unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn openrouter_detects_refusal_from_content() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body("I cannot comply with that request.")),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&hello_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openrouter_classifies_http_429_and_keeps_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "abc123")
                .insert_header("retry-after", "7")
                .set_body_json(json!({
                    "error": { "message": "rate limited", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&hello_request()).await.unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.code(), "rate_limited");
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(7));
            let ctx = context.expect("expected error context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("abc123"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn oversized_prompt_is_rejected_without_a_request() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{}")))
        .expect(0)
        .mount(&server)
        .await;

    let req = ChatRequest::new(
        ChatModel::openrouter("openai/gpt-4o-mini"),
        vec![Message::user("x".repeat(MAX_INPUT_CHARS + 1))],
        Attribution::new("test"),
    );
    let err = adapter(&server).chat(&req).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
}

#[tokio::test]
async fn multibyte_prompt_at_the_limit_is_sent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(ok_body("{}")))
        .expect(1)
        .mount(&server)
        .await;

    // Twice MAX_INPUT_CHARS in bytes, exactly MAX_INPUT_CHARS in characters.
    let req = ChatRequest::new(
        ChatModel::openrouter("openai/gpt-4o-mini"),
        vec![Message::user("é".repeat(MAX_INPUT_CHARS))],
        Attribution::new("test"),
    );
    adapter(&server).chat(&req).await.unwrap();
}

#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn fast_gateway_config(max_retries: u32) -> GatewayConfig {
    GatewayConfig {
        max_retries,
        retry_base_delay: Duration::from_millis(0),
        max_delay: Duration::from_millis(10),
    }
}

#[tokio::test]
async fn provider_gateway_retries_on_retryable_errors_and_records_usage() {
    let server = MockServer::start().await;

    let first = ResponseTemplate::new(500).set_body_json(json!({
        "error": { "message": "transient error", "code": "internal" }
    }));

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first,
            second: ResponseTemplate::new(200).set_body_json(ok_body("ok")),
        })
        .mount(&server)
        .await;

    let usage = Arc::new(MemoryUsageSink::new());
    let gateway =
        ProviderGateway::with_config(adapter(&server), usage.clone(), fast_gateway_config(1));

    let resp = gateway.chat(hello_request()).await.unwrap();
    assert_eq!(resp.content, "ok");

    let received = server.received_requests().await.unwrap();
    assert_eq!(received.len(), 2);

    let records = usage.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].error_code.as_deref(), Some("provider_error"));
    assert_eq!(records[1].attempt, 2);
    assert!(records[1].error_code.is_none());
}

#[tokio::test]
async fn provider_gateway_does_not_retry_client_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model" }
        })))
        .mount(&server)
        .await;

    let gateway = ProviderGateway::with_config(
        adapter(&server),
        Arc::new(MemoryUsageSink::new()),
        fast_gateway_config(3),
    );

    let err = gateway.chat(hello_request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }));
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}
