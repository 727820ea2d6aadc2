//! Technical documentation search.
//!
//! Documents carry an embedding; a query is embedded with an [`Embedder`]
//! and matched by cosine similarity. The shipped [`ZeroEmbedder`] is a stub
//! that returns the zero vector, so it never clears the threshold.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Dimension of the stub embedding space.
pub const EMBEDDING_DIM: usize = 1536;

/// Default minimum similarity for a match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Default number of matches returned.
pub const DEFAULT_MATCH_COUNT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TechnicalDoc {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocMatch {
    pub id: Uuid,
    pub title: String,
    pub content: String,
    pub similarity: f32,
}

/// Turns query text into an embedding vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Stub embedder: every query maps to the zero vector.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZeroEmbedder;

impl Embedder for ZeroEmbedder {
    fn embed(&self, _text: &str) -> Vec<f32> {
        vec![0.0; EMBEDDING_DIM]
    }
}

/// In-memory documentation index.
pub struct DocsIndex {
    docs: Vec<TechnicalDoc>,
    embedder: Box<dyn Embedder>,
}

impl DocsIndex {
    pub fn new(embedder: impl Embedder + 'static) -> Self {
        Self {
            docs: Vec::new(),
            embedder: Box::new(embedder),
        }
    }

    /// Index backed by the zero-vector stub.
    pub fn stub() -> Self {
        Self::new(ZeroEmbedder)
    }

    /// Add a document, embedding its content with the index's embedder.
    pub fn insert(&mut self, title: impl Into<String>, content: impl Into<String>) -> Uuid {
        let content = content.into();
        let doc = TechnicalDoc {
            id: Uuid::new_v4(),
            title: title.into(),
            embedding: self.embedder.embed(&content),
            content,
        };
        let id = doc.id;
        self.docs.push(doc);
        id
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Matches with similarity `>= threshold`, best first, at most `limit`.
    pub fn search(&self, query: &str, threshold: f32, limit: usize) -> Vec<DocMatch> {
        let query_embedding = self.embedder.embed(query);
        let mut matches: Vec<DocMatch> = self
            .docs
            .iter()
            .filter_map(|doc| {
                let similarity = cosine_similarity(&query_embedding, &doc.embedding)?;
                (similarity >= threshold).then(|| DocMatch {
                    id: doc.id,
                    title: doc.title.clone(),
                    content: doc.content.clone(),
                    similarity,
                })
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        matches.truncate(limit);
        matches
    }

    /// [`DocsIndex::search`] with the default threshold and limit.
    pub fn search_default(&self, query: &str) -> Vec<DocMatch> {
        self.search(query, DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_MATCH_COUNT)
    }
}

/// `None` when either vector has zero norm or the lengths differ.
fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}
