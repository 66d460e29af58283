//! Tool catalog: embeds broker tool descriptors into a namespaced vector
//! index (one namespace per app) and serves cosine-similarity search.

pub mod embedding;
pub mod index;

pub use embedding::{EmbeddingProvider, EmbeddingResult, OpenAiEmbeddingProvider, StubEmbeddingProvider};
pub use index::{VectorEntry, VectorHit, VectorIndex, UPSERT_BATCH_SIZE};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

pub const EMBEDDING_DIMENSIONS: usize = 1536;
const SEARCH_DEADLINE: Duration = Duration::from_secs(5);

/// A tool descriptor as ingested: symbolic name plus a human description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogTool {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMatch {
    pub name: String,
    pub description: String,
    pub score: f64,
}

#[derive(Clone)]
pub struct ToolCatalog {
    index: VectorIndex,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl ToolCatalog {
    pub fn new(index: VectorIndex, embedder: Arc<dyn EmbeddingProvider>) -> Result<Self> {
        index.ensure_index(embedder.dimensions())?;
        Ok(Self { index, embedder })
    }

    /// Embed and upsert tool descriptors into the app's namespace. The
    /// embedded string is `"<toolName>: <description>"`.
    pub async fn ingest(&self, app_name: &str, tools: &[CatalogTool]) -> Result<usize> {
        if tools.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = tools
            .iter()
            .map(|t| format!("{}: {}", t.name, t.description))
            .collect();
        let embedded = self.embedder.embed(&texts).await?;
        if embedded.embeddings.len() != tools.len() {
            return Err(anyhow!(
                "embedding count mismatch during ingest: expected {}, got {}",
                tools.len(),
                embedded.embeddings.len()
            ));
        }

        let entries: Vec<VectorEntry> = tools
            .iter()
            .zip(embedded.embeddings)
            .map(|(tool, vector)| VectorEntry {
                id: tool.name.clone(),
                vector,
                metadata: serde_json::json!({
                    "toolName": tool.name,
                    "description": tool.description,
                    "appName": app_name,
                }),
            })
            .collect();

        self.index.upsert(app_name, entries).await
    }

    /// Cosine search within the app's namespace, bounded by a 5-second
    /// deadline covering both the query embedding and the index lookup.
    pub async fn search(
        &self,
        app_name: &str,
        query: &str,
        top_k: usize,
    ) -> Result<Vec<ToolMatch>> {
        let result = tokio::time::timeout(SEARCH_DEADLINE, async {
            let embedded = self.embedder.embed(&[query.to_string()]).await?;
            let vector = embedded
                .embeddings
                .into_iter()
                .next()
                .ok_or_else(|| anyhow!("embedding provider returned no query embedding"))?;
            self.index.query(app_name, vector, top_k, false).await
        })
        .await
        .map_err(|_| anyhow!("tool search timed out after {}s", SEARCH_DEADLINE.as_secs()))??;

        Ok(result
            .into_iter()
            .map(|hit| ToolMatch {
                name: hit.metadata["toolName"]
                    .as_str()
                    .unwrap_or(hit.id.as_str())
                    .to_string(),
                description: hit.metadata["description"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                score: hit.score,
            })
            .collect())
    }
}
