//! Knowledge document store.
//!
//! The store is a directory on disk: a reference is either a single file
//! (`policies/escalation.md`) or a folder whose text files are concatenated
//! in name order (`classifier/`).

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::KnowledgeError;

/// File extensions the store treats as documents.
const DOCUMENT_EXTENSIONS: &[&str] = &["md", "txt"];

/// Text fetched from the store plus where it came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchedKnowledge {
    pub text: String,
    pub doc_count: usize,
    /// Store-relative paths of the documents, in concatenation order.
    pub sources: Vec<String>,
}

/// Read-only source of knowledge documents.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Fetch one document.
    async fn fetch_document(&self, reference: &str) -> Result<FetchedKnowledge, KnowledgeError>;

    /// Fetch up to `max_docs` documents from a folder.
    async fn fetch_folder(
        &self,
        reference: &str,
        max_docs: usize,
    ) -> Result<FetchedKnowledge, KnowledgeError>;

    /// Fetch `reference` as a folder if it is one, otherwise as a document.
    async fn fetch(
        &self,
        reference: &str,
        max_docs: usize,
    ) -> Result<FetchedKnowledge, KnowledgeError>;
}

/// File-backed knowledge store rooted at a directory.
pub struct DirKnowledgeStore {
    base_path: PathBuf,
}

impl DirKnowledgeStore {
    /// Create a store rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Resolve a store reference, refusing anything that climbs out of the root.
    fn resolve_path(&self, reference: &str) -> Result<PathBuf, KnowledgeError> {
        let relative = Path::new(reference.trim_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(KnowledgeError::InvalidPath(reference.to_string()));
        }
        Ok(self.base_path.join(relative))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.base_path)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

fn is_document(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| DOCUMENT_EXTENSIONS.contains(&ext))
}

#[async_trait]
impl KnowledgeStore for DirKnowledgeStore {
    async fn fetch_document(&self, reference: &str) -> Result<FetchedKnowledge, KnowledgeError> {
        let full_path = self.resolve_path(reference)?;
        if !full_path.is_file() {
            return Err(KnowledgeError::NotFound(reference.to_string()));
        }
        let text = fs::read_to_string(&full_path).await?;
        Ok(FetchedKnowledge {
            text: text.trim().to_string(),
            doc_count: 1,
            sources: vec![self.relative(&full_path)],
        })
    }

    async fn fetch_folder(
        &self,
        reference: &str,
        max_docs: usize,
    ) -> Result<FetchedKnowledge, KnowledgeError> {
        let dir = self.resolve_path(reference)?;
        if !dir.is_dir() {
            return Err(KnowledgeError::NotFound(reference.to_string()));
        }

        let mut paths = Vec::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if entry.metadata().await?.is_file() && is_document(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        paths.truncate(max_docs);

        let mut fetched = FetchedKnowledge::default();
        let mut parts = Vec::new();
        for path in paths {
            let content = fs::read_to_string(&path).await?;
            let content = content.trim();
            if content.is_empty() {
                continue;
            }
            let source = self.relative(&path);
            parts.push(format!("## {source}\n\n{content}"));
            fetched.sources.push(source);
        }
        fetched.doc_count = fetched.sources.len();
        fetched.text = parts.join("\n\n");
        Ok(fetched)
    }

    async fn fetch(
        &self,
        reference: &str,
        max_docs: usize,
    ) -> Result<FetchedKnowledge, KnowledgeError> {
        if self.resolve_path(reference)?.is_dir() {
            self.fetch_folder(reference, max_docs).await
        } else {
            self.fetch_document(reference).await
        }
    }
}
