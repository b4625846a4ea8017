//! Context retrieval for task prompts.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;

use crate::Result;

/// Number of documents retrieved per query unless configured otherwise.
pub const DEFAULT_RESULTS: usize = 5;

/// Source of context documents for a query.
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `n` documents relevant to `query`, most relevant first.
    async fn retrieve_context(&self, query: &str, n: usize) -> Result<Vec<String>>;
}

/// In-memory retriever ranking documents by query token overlap.
///
/// Documents sharing no token with the query are never returned. Ties keep
/// indexing order.
#[derive(Debug, Clone, Default)]
pub struct KeywordRetriever {
    documents: Vec<(String, HashSet<String>)>,
}

impl KeywordRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents<I, S>(documents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut retriever = Self::new();
        retriever.index_documents(documents);
        retriever
    }

    /// Index every file in `paths` as one document.
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        let mut retriever = Self::new();
        for path in paths {
            let text = std::fs::read_to_string(path.as_ref())?;
            tracing::debug!(path = %path.as_ref().display(), bytes = text.len(), "indexed context file");
            retriever.index(text);
        }
        Ok(retriever)
    }

    pub fn index(&mut self, document: impl Into<String>) {
        let document = document.into();
        let tokens = tokenize(&document);
        self.documents.push((document, tokens));
    }

    pub fn index_documents<I, S>(&mut self, documents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for doc in documents {
            self.index(doc);
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn rank(&self, query: &str, n: usize) -> Vec<String> {
        let query = tokenize(query);
        let mut scored: Vec<(usize, usize)> = self
            .documents
            .iter()
            .enumerate()
            .map(|(i, (_, tokens))| (i, query.intersection(tokens).count()))
            .filter(|(_, score)| *score > 0)
            .collect();
        // Stable sort keeps indexing order among equal scores.
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored
            .into_iter()
            .take(n)
            .map(|(i, _)| self.documents[i].0.clone())
            .collect()
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve_context(&self, query: &str, n: usize) -> Result<Vec<String>> {
        let found = self.rank(query, n);
        tracing::debug!(query, requested = n, found = found.len(), "retrieved context");
        Ok(found)
    }
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}
