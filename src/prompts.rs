//! Prompt templates for oracle ranking requests.
//!
//! Two variants: bulk (rank every candidate at once) and comparative (place
//! one new item against already-ranked references). The structured request is
//! serialized as JSON inside the user message; ids are passed verbatim and
//! must be echoed verbatim.

use serde::Serialize;

use crate::catalog::{Item, RankedItem};
use crate::category::Category;
use crate::gateway::Message;

/// At most this many already-ranked items are shown to the comparative prompt.
pub const MAX_REFERENCE_ITEMS: usize = 20;

/// Comparative ranks are bounded by `max(existing max rank, this)`.
pub const MIN_COMPARATIVE_UPPER_BOUND: u32 = 100;

// =============================================================================
// Rendered prompt
// =============================================================================

/// Rendered prompt ready for the oracle.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Serialize a payload for embedding between XML tags.
///
/// Angle brackets become JSON unicode escapes, so the payload can't close the
/// surrounding tag and still decodes to the original text.
fn embed_json<T: Serialize>(payload: &T) -> String {
    let json = serde_json::to_string_pretty(payload).unwrap_or_else(|_| "{}".to_string());
    json.replace('<', "\\u003c").replace('>', "\\u003e")
}

// =============================================================================
// Request payloads
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PromptItem<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    key_skills: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'a str>,
}

impl<'a> From<&'a Item> for PromptItem<'a> {
    fn from(item: &'a Item) -> Self {
        Self {
            id: &item.id,
            title: &item.title,
            description: item.description.as_deref(),
            key_skills: &item.key_skills,
            provider: item.provider.as_deref(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BulkPayload<'a> {
    category: &'static str,
    context_description: &'static str,
    items: Vec<PromptItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReferenceItem<'a> {
    id: &'a str,
    title: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
    rank: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ComparativePayload<'a> {
    category: &'static str,
    context_description: &'static str,
    new_item: PromptItem<'a>,
    reference_items: Vec<ReferenceItem<'a>>,
}

// =============================================================================
// Templates
// =============================================================================

const BULK_SYSTEM: &str = r#"You rank online courses by how relevant they are to one audience segment. Rank 1 is the most relevant. You judge only from the course data you are given.

Output only valid JSON of the form:
{"rankings": [{"courseId": "<id exactly as given>", "rank": 1}, ...]}
Ranks are positive integers. Every course id you were given appears exactly once. Never invent ids."#;

const COMPARATIVE_SYSTEM: &str = r#"You place one new online course into an existing relevance ordering for one audience segment. Rank 1 is the most relevant. The reference courses are listed most relevant first with their current ranks.

Output only valid JSON of the form:
{"rank": <integer>}"#;

/// Request a full ranking of `items` for `category`.
pub fn bulk_ranking_prompt(category: Category, items: &[Item]) -> PromptInstance {
    let payload = BulkPayload {
        category: category.name(),
        context_description: category.context_description(),
        items: items.iter().map(PromptItem::from).collect(),
    };
    let count = items.len();

    let user = format!(
        "<category>{name}</category>\n\
         <category_context>\n{context}\n</category_context>\n\n\
         <request>\n{json}\n</request>\n\n\
         Rank all {count} courses above for the {name} audience. \
         Your \"rankings\" array must contain exactly {count} entries, one per course id, \
         with every supplied id appearing exactly once and ranks 1 through {count}.\n\
         json:",
        name = escape_xml_chars(category.name()),
        context = escape_xml_chars(category.context_description()),
        json = embed_json(&payload),
    );

    PromptInstance {
        template_slug: "bulk_v1",
        system: BULK_SYSTEM.to_string(),
        user,
    }
}

/// The leading references a comparative prompt actually shows.
pub fn shown_references(references: &[RankedItem]) -> &[RankedItem] {
    &references[..references.len().min(MAX_REFERENCE_ITEMS)]
}

/// Highest rank a comparative answer may take against `references`.
pub fn comparative_upper_bound(references: &[RankedItem]) -> u32 {
    references
        .iter()
        .map(|r| r.rank)
        .max()
        .unwrap_or(0)
        .max(MIN_COMPARATIVE_UPPER_BOUND)
}

/// Request a single rank for `new_item` relative to `references` (best first).
pub fn comparative_ranking_prompt(
    category: Category,
    new_item: &Item,
    references: &[RankedItem],
) -> PromptInstance {
    let references = shown_references(references);
    let upper = comparative_upper_bound(references);
    let payload = ComparativePayload {
        category: category.name(),
        context_description: category.context_description(),
        new_item: PromptItem::from(new_item),
        reference_items: references
            .iter()
            .map(|r| ReferenceItem {
                id: &r.item.id,
                title: &r.item.title,
                description: r.item.description.as_deref(),
                rank: r.rank,
            })
            .collect(),
    };

    let guidance = if references.is_empty() {
        "No courses are ranked yet for this audience; estimate where the new course would fall."
            .to_string()
    } else {
        format!(
            "Compare the new course with the {} reference courses and choose the rank it deserves.",
            references.len()
        )
    };

    let user = format!(
        "<category>{name}</category>\n\
         <category_context>\n{context}\n</category_context>\n\n\
         <request>\n{json}\n</request>\n\n\
         {guidance} Answer with one integer rank between 1 and {upper}.\n\
         json:",
        name = escape_xml_chars(category.name()),
        context = escape_xml_chars(category.context_description()),
        json = embed_json(&payload),
    );

    PromptInstance {
        template_slug: "comparative_v1",
        system: COMPARATIVE_SYSTEM.to_string(),
        user,
    }
}

// =============================================================================
// TESTS
// =============================================================================
