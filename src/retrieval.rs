//! Retrieval-augmented context.
//!
//! Vector search is external; the turn engine only asks a `ContextRetriever`
//! for passages relevant to the user message and injects them as a system
//! message. Failures degrade to no context plus a warning on `meta`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tower::BoxError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedContext {
    pub content: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalQuery {
    pub owner: String,
    pub conversation_id: String,
    pub text: String,
    pub top_k: usize,
}

#[async_trait]
pub trait ContextRetriever: Send + Sync {
    async fn retrieve(&self, query: RetrievalQuery) -> Result<Vec<RetrievedContext>, BoxError>;
}

/// Returns a fixed set of passages, best score first, truncated to `top_k`.
#[derive(Debug, Clone, Default)]
pub struct StaticRetriever {
    items: Vec<RetrievedContext>,
}

impl StaticRetriever {
    pub fn new(mut items: Vec<RetrievedContext>) -> Self {
        items.sort_by(|a, b| b.score.total_cmp(&a.score));
        Self { items }
    }
}

#[async_trait]
impl ContextRetriever for StaticRetriever {
    async fn retrieve(&self, query: RetrievalQuery) -> Result<Vec<RetrievedContext>, BoxError> {
        Ok(self.items.iter().take(query.top_k).cloned().collect())
    }
}
