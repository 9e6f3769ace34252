use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use catalog_ranker::catalog::{CatalogStore, Item, SqliteCatalogStore};
use catalog_ranker::category::Category;
use catalog_ranker::gateway::openrouter::OpenRouterAdapter;
use catalog_ranker::gateway::{GatewayConfig, NoopUsageSink, ProviderGateway};
use catalog_ranker::oracle::{LlmOracle, RankingOracle};
use catalog_ranker::ranking::{progress_channel, Phase, ProgressEvent, Ranker, RankerOptions};
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn chat_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 40 }
    })
}

async fn seeded_store(ids: &[&str]) -> (TempDir, Arc<SqliteCatalogStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteCatalogStore::new(dir.path().join("catalog.sqlite")).unwrap();
    let items = ids
        .iter()
        .map(|id| Item::new(*id, format!("Course {id}")).with_key_skills(["skill"]))
        .collect();
    store.upsert_items(items).await.unwrap();
    (dir, Arc::new(store))
}

fn llm_ranker(server: &MockServer, store: Arc<SqliteCatalogStore>) -> Ranker {
    let adapter =
        OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None)
            .unwrap();
    let gateway = ProviderGateway::with_config(
        adapter,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries: 0,
            retry_base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        },
    );
    let oracle: Arc<dyn RankingOracle> =
        Arc::new(LlmOracle::new(Arc::new(gateway), "openai/gpt-4o-mini"));
    Ranker::new(store, Some(oracle), RankerOptions::default())
}

async fn ranks(store: &SqliteCatalogStore, category: Category) -> HashMap<String, u32> {
    store
        .select_ranked(category.rank_column(), None, None)
        .await
        .unwrap()
        .into_iter()
        .map(|r| (r.item.id, r.rank))
        .collect()
}

async fn mount_answer(server: &MockServer, answer: serde_json::Value) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(&answer.to_string())))
        .mount(server)
        .await;
}

/// Reads the ids out of the bulk prompt and ranks them in reverse order.
struct ReverseRanker;

impl Respond for ReverseRanker {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap();
        let start = user.find("<request>").unwrap() + "<request>".len();
        let end = user.find("</request>").unwrap();
        let payload: serde_json::Value = serde_json::from_str(&user[start..end]).unwrap();
        let ids: Vec<&str> = payload["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap())
            .collect();
        let rankings: Vec<_> = ids
            .iter()
            .rev()
            .enumerate()
            .map(|(pos, id)| json!({ "courseId": id, "rank": pos + 1 }))
            .collect();
        let answer = json!({ "rankings": rankings });
        ResponseTemplate::new(200).set_body_json(chat_body(&answer.to_string()))
    }
}

#[tokio::test]
async fn full_rerank_assigns_a_permutation_of_one_to_n() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ReverseRanker)
        .expect(1)
        .mount(&server)
        .await;

    let ids = ["c1", "c2", "c3", "c4", "c5", "c6"];
    let (_dir, store) = seeded_store(&ids).await;
    let (reporter, stream) = progress_channel();
    let ranker = llm_ranker(&server, store.clone()).with_progress(reporter);

    let outcome = ranker.rerank_category(Category::Business).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.ranked, ids.len());
    drop(ranker);

    let ranks = ranks(&store, Category::Business).await;
    let mut values: Vec<u32> = ranks.values().copied().collect();
    values.sort_unstable();
    assert_eq!(values, (1..=ids.len() as u32).collect::<Vec<_>>());
    assert_eq!(ranks["c6"], 1);
    assert_eq!(ranks["c1"], 6);

    let events: Vec<ProgressEvent> = stream.collect().await;
    assert_eq!(events.first().unwrap().phase, Phase::SelectingCandidates);
    assert_eq!(events.last().unwrap().phase, Phase::Completed);
    assert_eq!(events.last().unwrap().processed, ids.len());
}

#[tokio::test]
async fn complete_answer_is_persisted_verbatim() {
    let server = MockServer::start().await;
    mount_answer(
        &server,
        json!({ "rankings": [
            { "courseId": "B", "rank": 1 },
            { "courseId": "C", "rank": 2 },
            { "courseId": "A", "rank": 3 }
        ]}),
    )
    .await;

    let (_dir, store) = seeded_store(&["A", "B", "C"]).await;
    let ranker = llm_ranker(&server, store.clone());
    ranker.rerank_category(Category::Technology).await.unwrap();

    let ranks = ranks(&store, Category::Technology).await;
    assert_eq!(ranks["A"], 3);
    assert_eq!(ranks["B"], 1);
    assert_eq!(ranks["C"], 2);
}

#[tokio::test]
async fn missing_candidate_is_ranked_after_returned_ones() {
    let server = MockServer::start().await;
    mount_answer(
        &server,
        json!({ "rankings": [
            { "courseId": "B", "rank": 1 },
            { "courseId": "A", "rank": 2 }
        ]}),
    )
    .await;

    let (_dir, store) = seeded_store(&["A", "B", "C"]).await;
    let ranker = llm_ranker(&server, store.clone());
    let outcome = ranker.rerank_category(Category::Healthcare).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.missing_repaired, 1);

    let ranks = ranks(&store, Category::Healthcare).await;
    assert_eq!(ranks["B"], 1);
    assert_eq!(ranks["A"], 2);
    assert_eq!(ranks["C"], 3);
}

#[tokio::test]
async fn hallucinated_ids_are_never_persisted() {
    let server = MockServer::start().await;
    mount_answer(
        &server,
        json!({ "rankings": [
            { "courseId": "A", "rank": 1 },
            { "courseId": "X", "rank": 2 }
        ]}),
    )
    .await;

    let (_dir, store) = seeded_store(&["A", "B"]).await;
    let ranker = llm_ranker(&server, store.clone());
    let outcome = ranker.rerank_category(Category::Creative).await.unwrap();
    assert_eq!(outcome.hallucinated_dropped, 1);
    assert_eq!(outcome.ranked, 2);

    let ranks = ranks(&store, Category::Creative).await;
    assert_eq!(ranks.len(), 2);
    assert_eq!(ranks["A"], 1);
    assert_eq!(ranks["B"], 2);
    assert!(store.get_item("X").await.unwrap().is_none());
}

#[tokio::test]
async fn malformed_answer_leaves_existing_ranks_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(chat_body("{\"rankings\": [{\"courseId\": ")),
        )
        .mount(&server)
        .await;

    let (_dir, store) = seeded_store(&["A", "B", "C"]).await;
    store
        .update_rank("A", Category::PublicSector.rank_column(), 2)
        .await
        .unwrap();
    let before = ranks(&store, Category::PublicSector).await;

    let ranker = llm_ranker(&server, store.clone());
    let outcome = ranker.rerank_category(Category::PublicSector).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.ranked, 0);
    assert_eq!(ranks(&store, Category::PublicSector).await, before);
}

#[tokio::test]
async fn transport_failure_reports_failure_without_writes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({
            "error": { "message": "upstream overloaded" }
        })))
        .mount(&server)
        .await;

    let (_dir, store) = seeded_store(&["A", "B"]).await;
    let ranker = llm_ranker(&server, store.clone());
    let outcomes = ranker.rerank_all().await;
    assert_eq!(outcomes.len(), Category::ALL.len());
    assert!(outcomes.iter().all(|o| !o.success && o.ranked == 0));
    for category in Category::ALL {
        assert!(ranks(&store, category).await.is_empty());
    }
}

#[tokio::test]
async fn initializing_a_category_fills_every_null_rank_densely() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ReverseRanker)
        .expect(1)
        .mount(&server)
        .await;

    let ids = ["n1", "n2", "n3", "n4"];
    let (_dir, store) = seeded_store(&ids).await;
    assert!(ranks(&store, Category::Creative).await.is_empty());

    let ranker = llm_ranker(&server, store.clone());
    let outcome = ranker.initialize_category(Category::Creative).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.error.is_none());

    let unranked = store
        .select_unranked(Category::Creative.rank_column())
        .await
        .unwrap();
    assert!(unranked.is_empty());
    let mut values: Vec<u32> = ranks(&store, Category::Creative)
        .await
        .into_values()
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2, 3, 4]);
}
