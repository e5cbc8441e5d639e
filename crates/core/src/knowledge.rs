//! Knowledge Base Gateway
//!
//! Wraps a [`SemanticIndex`] behind the capability contract. The gateway turns
//! a free-text query into ranked excerpts with provenance and a spoken-ready
//! summary; the index decides what "nearest" means.

use crate::capability::{
    CapabilityDeclaration, CapabilityError, CapabilityProvider, parameters_schema,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fuzzy_matcher::{FuzzyMatcher, skim::SkimMatcherV2};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const SEARCH_CAPABILITY: &str = "search_knowledge_base";

const CHUNK_SIZE: usize = 1000;
const CHUNK_OVERLAP: usize = 200;
const MAX_TOP_K: usize = 20;
const RETRY_KEYWORDS: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("Knowledge base not initialized")]
    Unavailable,
    #[error("Document '{0}' not found")]
    DocumentNotFound(String),
    #[error("Document '{0}' contains no indexable text")]
    EmptyDocument(String),
}

/// One stored slice of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub file_id: String,
    pub file_name: String,
    pub chunk_index: usize,
    pub content: String,
}

/// A ranked search hit. `rank` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnowledgeExcerpt {
    pub content: String,
    pub source_file: String,
    pub chunk_index: usize,
    pub rank: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentInfo {
    pub file_id: String,
    pub file_name: String,
    pub chunks: usize,
    pub indexed_at: DateTime<Utc>,
}

/// The retrieval collaborator: query in, nearest chunks out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SemanticIndex: Send + Sync {
    fn is_ready(&self) -> bool;

    /// Up to `k` chunks, nearest first.
    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<IndexedChunk>, KnowledgeError>;

    /// Indexes a document, replacing any earlier version with the same id.
    /// Returns the number of chunks stored.
    async fn add_document(
        &self,
        file_id: &str,
        file_name: &str,
        text: &str,
    ) -> Result<usize, KnowledgeError>;

    async fn remove_document(&self, file_id: &str) -> Result<usize, KnowledgeError>;

    async fn list_documents(&self) -> Vec<DocumentInfo>;
}

/// Splits text into overlapping windows of roughly `size` characters,
/// preferring to cut at whitespace.
pub fn split_into_chunks(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            if let Some(cut) = (start + size / 2..end).rev().find(|&i| chars[i].is_whitespace()) {
                end = cut;
            }
        }

        let chunk: String = chars[start..end].iter().collect();
        let chunk = chunk.trim();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }

        if end >= chars.len() {
            break;
        }
        let next = end.saturating_sub(overlap);
        start = if next > start { next } else { end };
    }

    chunks
}

fn query_terms(query: &str) -> Vec<String> {
    query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

#[derive(Default)]
struct IndexState {
    chunks: Vec<IndexedChunk>,
    documents: HashMap<String, DocumentInfo>,
}

/// A process-local index ranking chunks by exact term hits, then by fuzzy
/// term similarity. Like a vector store it always answers with the nearest
/// `k` chunks when it holds any.
pub struct InMemoryIndex {
    state: RwLock<IndexState>,
    matcher: SkimMatcherV2,
}

impl Default for InMemoryIndex {
    fn default() -> Self {
        Self {
            state: RwLock::new(IndexState::default()),
            matcher: SkimMatcherV2::default().ignore_case(),
        }
    }
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn score(&self, content: &str, terms: &[String]) -> i64 {
        let lowered = content.to_lowercase();
        terms
            .iter()
            .map(|term| {
                let exact = lowered.matches(term.as_str()).count() as i64;
                if exact > 0 {
                    1_000 * exact
                } else {
                    self.matcher.fuzzy_match(&lowered, term).unwrap_or(0) / 10
                }
            })
            .sum()
    }
}

#[async_trait]
impl SemanticIndex for InMemoryIndex {
    fn is_ready(&self) -> bool {
        true
    }

    async fn similarity_search(
        &self,
        query: &str,
        k: usize,
    ) -> Result<Vec<IndexedChunk>, KnowledgeError> {
        let terms = query_terms(query);
        let state = self.state.read().await;

        let mut scored: Vec<(i64, &IndexedChunk)> = state
            .chunks
            .iter()
            .map(|chunk| (self.score(&chunk.content, &terms), chunk))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, chunk)| chunk.clone())
            .collect())
    }

    async fn add_document(
        &self,
        file_id: &str,
        file_name: &str,
        text: &str,
    ) -> Result<usize, KnowledgeError> {
        let pieces = split_into_chunks(text, CHUNK_SIZE, CHUNK_OVERLAP);
        if pieces.is_empty() {
            return Err(KnowledgeError::EmptyDocument(file_name.to_string()));
        }

        let mut state = self.state.write().await;
        state.chunks.retain(|c| c.file_id != file_id);
        let count = pieces.len();
        state
            .chunks
            .extend(pieces.into_iter().enumerate().map(|(chunk_index, content)| IndexedChunk {
                file_id: file_id.to_string(),
                file_name: file_name.to_string(),
                chunk_index,
                content,
            }));
        state.documents.insert(
            file_id.to_string(),
            DocumentInfo {
                file_id: file_id.to_string(),
                file_name: file_name.to_string(),
                chunks: count,
                indexed_at: Utc::now(),
            },
        );
        Ok(count)
    }

    async fn remove_document(&self, file_id: &str) -> Result<usize, KnowledgeError> {
        let mut state = self.state.write().await;
        let info = state
            .documents
            .remove(file_id)
            .ok_or_else(|| KnowledgeError::DocumentNotFound(file_id.to_string()))?;
        state.chunks.retain(|c| c.file_id != file_id);
        Ok(info.chunks)
    }

    async fn list_documents(&self) -> Vec<DocumentInfo> {
        let state = self.state.read().await;
        let mut documents: Vec<DocumentInfo> = state.documents.values().cloned().collect();
        documents.sort_by(|a, b| a.indexed_at.cmp(&b.indexed_at));
        documents
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub excerpt: KnowledgeExcerpt,
    pub file_id: String,
    /// Human-readable provenance, e.g. `policies.txt (chunk 2)`.
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub query: String,
    pub results: Vec<SearchHit>,
    pub count: usize,
    pub sources: Vec<String>,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl SearchOutcome {
    fn from_chunks(query: &str, chunks: Vec<IndexedChunk>) -> Self {
        if chunks.is_empty() {
            return Self {
                query: query.to_string(),
                results: Vec::new(),
                count: 0,
                sources: Vec::new(),
                summary: "No results found.".to_string(),
                message: Some(
                    "No relevant documents found. Please make sure documents are uploaded to the knowledge base."
                        .to_string(),
                ),
            };
        }

        let mut sources: Vec<String> = Vec::new();
        let results: Vec<SearchHit> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                if !sources.contains(&chunk.file_name) {
                    sources.push(chunk.file_name.clone());
                }
                SearchHit {
                    source: format!("{} (chunk {})", chunk.file_name, chunk.chunk_index + 1),
                    file_id: chunk.file_id,
                    excerpt: KnowledgeExcerpt {
                        content: chunk.content,
                        source_file: chunk.file_name,
                        chunk_index: chunk.chunk_index,
                        rank: i + 1,
                    },
                }
            })
            .collect();

        let content = results
            .iter()
            .take(2)
            .map(|hit| hit.excerpt.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let summary = format!(
            "Found {} relevant chunks from {} document(s): {}. Content: {}",
            results.len(),
            sources.len(),
            sources.join(", "),
            content
        );

        Self {
            query: query.to_string(),
            count: results.len(),
            results,
            sources,
            summary,
            message: None,
        }
    }

    pub fn excerpts(&self) -> impl Iterator<Item = &KnowledgeExcerpt> {
        self.results.iter().map(|hit| &hit.excerpt)
    }
}

/// The gateway in front of the retrieval collaborator.
#[derive(Clone)]
pub struct KnowledgeBase {
    index: Arc<dyn SemanticIndex>,
}

impl KnowledgeBase {
    pub fn new(index: Arc<dyn SemanticIndex>) -> Self {
        Self { index }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryIndex::new()))
    }

    pub fn is_ready(&self) -> bool {
        self.index.is_ready()
    }

    /// Ranked excerpts for `query`. An empty first pass is retried once with
    /// the query's leading keywords; zero hits is still an `Ok`.
    pub async fn search(&self, query: &str, top_k: usize) -> Result<SearchOutcome, KnowledgeError> {
        if !self.index.is_ready() {
            return Err(KnowledgeError::Unavailable);
        }
        let top_k = top_k.clamp(1, MAX_TOP_K);
        info!(%query, top_k, "Searching knowledge base");

        let mut chunks = self.index.similarity_search(query, top_k).await?;
        if chunks.is_empty() {
            let reduced = query
                .to_lowercase()
                .split_whitespace()
                .take(RETRY_KEYWORDS)
                .collect::<Vec<_>>()
                .join(" ");
            if !reduced.is_empty() {
                debug!(%reduced, "No hits, retrying with keywords");
                chunks = self
                    .index
                    .similarity_search(&reduced, top_k)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Keyword retry failed");
                        Vec::new()
                    });
            }
        }

        let outcome = SearchOutcome::from_chunks(query, chunks);
        info!(count = outcome.count, sources = ?outcome.sources, "Knowledge search finished");
        Ok(outcome)
    }

    pub async fn index_document(
        &self,
        file_id: &str,
        file_name: &str,
        text: &str,
    ) -> Result<usize, KnowledgeError> {
        if !self.index.is_ready() {
            return Err(KnowledgeError::Unavailable);
        }
        let chunks = self.index.add_document(file_id, file_name, text).await?;
        info!(%file_id, %file_name, chunks, "Indexed document");
        Ok(chunks)
    }

    pub async fn remove_document(&self, file_id: &str) -> Result<usize, KnowledgeError> {
        self.index.remove_document(file_id).await
    }

    pub async fn list_documents(&self) -> Vec<DocumentInfo> {
        self.index.list_documents().await
    }
}

fn default_top_k() -> usize {
    3
}

/// Arguments of `search_knowledge_base`.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// The search query
    pub query: String,
    /// Number of results to return
    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

pub struct KnowledgeSearchCapability {
    knowledge: KnowledgeBase,
}

impl KnowledgeSearchCapability {
    pub fn new(knowledge: KnowledgeBase) -> Self {
        Self { knowledge }
    }
}

#[async_trait]
impl CapabilityProvider for KnowledgeSearchCapability {
    fn name(&self) -> &str {
        SEARCH_CAPABILITY
    }

    fn declaration(&self) -> CapabilityDeclaration {
        CapabilityDeclaration {
            name: SEARCH_CAPABILITY.to_string(),
            description: "Search the uploaded knowledge base for relevant information".to_string(),
            parameters: parameters_schema::<SearchArgs>(),
        }
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, CapabilityError> {
        let args: SearchArgs = serde_json::from_value(arguments)
            .map_err(|e| CapabilityError::InvalidArguments(e.to_string()))?;
        let outcome = self.knowledge.search(&args.query, args.top_k).await?;
        serde_json::to_value(outcome).map_err(|e| CapabilityError::InvalidArguments(e.to_string()))
    }
}
