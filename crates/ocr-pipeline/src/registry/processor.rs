//! Document processor trait and metadata

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Trait for document-type specific recognition
///
/// Implementations are registered with a
/// [`ProcessorRegistry`](super::ProcessorRegistry) under their document type.
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    /// Registry key, e.g. `"receipt"`
    fn document_type(&self) -> &str;

    /// Whether this processor understands the raw data
    fn can_process(&self, data: &[u8]) -> Result<bool>;

    /// Recognize the document
    async fn process(&self, data: &[u8], cancel: &CancellationToken) -> Result<serde_json::Value>;
}

/// Registration metadata for a processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    /// Registry key (normalized to lowercase)
    pub document_type: String,
    pub display_name: String,
    pub description: String,
    pub version: String,
    /// Higher wins when several processors accept the same data
    pub priority: i32,
    pub capabilities: Vec<String>,
    /// File extensions without the leading dot
    pub supported_extensions: Vec<String>,
    pub enabled: bool,
}

impl ProcessorInfo {
    /// Defaults for a processor registered without metadata
    pub fn for_type(document_type: &str) -> Self {
        Self {
            document_type: document_type.to_string(),
            display_name: document_type.to_string(),
            description: format!("Processor for {} documents", document_type),
            version: "1.0.0".to_string(),
            priority: 0,
            capabilities: Vec::new(),
            supported_extensions: Vec::new(),
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.supported_extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    /// Case-insensitive extension check; a leading dot is ignored
    pub fn supports_extension(&self, extension: &str) -> bool {
        let extension = extension.trim().trim_start_matches('.');
        self.supported_extensions
            .iter()
            .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(extension))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_info() {
        let info = ProcessorInfo::for_type("receipt");
        assert_eq!(info.display_name, "receipt");
        assert!(info.description.contains("receipt"));
        assert_eq!(info.version, "1.0.0");
        assert_eq!(info.priority, 0);
        assert!(info.enabled);
    }

    #[test]
    fn test_supports_extension() {
        let info = ProcessorInfo::for_type("invoice").with_extensions(["pdf", ".PNG"]);
        assert!(info.supports_extension(".pdf"));
        assert!(info.supports_extension("png"));
        assert!(!info.supports_extension("jpg"));
    }
}
