//! Document ingestion boundary

use crate::document::{Document, DocumentId};
use crate::error::IngestionError;
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};

/// Source of requirements documents
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    /// Load and ingest one document
    async fn load(&self, id: &DocumentId) -> Result<Document, IngestionError>;
}

/// Loads documents from files under a root directory
///
/// The document id is the path relative to the root. Ids that are absolute
/// or climb out with `..` are refused.
#[derive(Debug, Clone)]
pub struct FsDocumentLoader {
    root: PathBuf,
}

impl FsDocumentLoader {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl DocumentLoader for FsDocumentLoader {
    async fn load(&self, id: &DocumentId) -> Result<Document, IngestionError> {
        let relative = Path::new(id.as_str());
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(IngestionError::Unreadable {
                id: id.to_string(),
                reason: "id must stay inside the loader root".to_string(),
            });
        }
        let path = self.root.join(relative);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => IngestionError::NotFound(path.display().to_string()),
            _ => IngestionError::Unreadable {
                id: id.to_string(),
                reason: e.to_string(),
            },
        })?;

        let document = Document::new(id.clone(), content);
        if document.is_empty() {
            return Err(IngestionError::Empty(id.to_string()));
        }
        tracing::debug!(
            document = %id,
            bytes = document.metadata().byte_len,
            requirements = document.metadata().requirement_ids.len(),
            "document ingested"
        );
        Ok(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("urs.md"), "# Scope\nURS-7 shall hold.\n").unwrap();

        let loader = FsDocumentLoader::new(dir.path());
        let doc = loader.load(&DocumentId::new("urs.md")).await.unwrap();
        assert_eq!(doc.id.as_str(), "urs.md");
        assert!(doc.metadata().requirement_ids.contains("URS-7"));
    }

    #[tokio::test]
    async fn missing_and_empty_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blank.md"), "\n\n").unwrap();
        let loader = FsDocumentLoader::new(dir.path());

        assert!(matches!(
            loader.load(&DocumentId::new("absent.md")).await,
            Err(IngestionError::NotFound(_))
        ));
        assert!(matches!(
            loader.load(&DocumentId::new("blank.md")).await,
            Err(IngestionError::Empty(_))
        ));
    }

    #[tokio::test]
    async fn ids_escaping_the_root_are_refused() {
        let outer = tempfile::tempdir().unwrap();
        std::fs::write(outer.path().join("secret.md"), "URS-1 outside.\n").unwrap();
        let root = outer.path().join("docs");
        std::fs::create_dir(&root).unwrap();
        std::fs::write(root.join("urs.md"), "URS-2 inside.\n").unwrap();
        let loader = FsDocumentLoader::new(&root);

        let absolute = outer.path().join("secret.md");
        for id in ["../secret.md", "nested/../../secret.md", absolute.to_str().unwrap()] {
            assert!(
                matches!(
                    loader.load(&DocumentId::new(id)).await,
                    Err(IngestionError::Unreadable { .. })
                ),
                "{id} was not refused"
            );
        }
        assert!(loader.load(&DocumentId::new("./urs.md")).await.is_ok());
    }
}
