//! Case-insensitive registry of document processors
//!
//! A single map backs both views: every registered entry is visible to
//! metadata queries, only enabled entries are visible to lookup and
//! auto-detection.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::processor::{DocumentProcessor, ProcessorInfo};
use crate::error::{Error, Result};

struct Entry {
    processor: Arc<dyn DocumentProcessor>,
    info: ProcessorInfo,
}

/// Registry of processors keyed by document type
#[derive(Default)]
pub struct ProcessorRegistry {
    entries: RwLock<HashMap<String, Entry>>,
}

fn normalize(document_type: &str) -> Option<String> {
    let trimmed = document_type.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor; an existing registration for the same type is replaced
    pub fn register(&self, processor: Arc<dyn DocumentProcessor>, info: Option<ProcessorInfo>) -> Result<()> {
        let key = normalize(processor.document_type())
            .ok_or_else(|| Error::invalid_argument("Processor document type cannot be empty"))?;

        let mut info = info.unwrap_or_else(|| ProcessorInfo::for_type(&key));
        info.document_type = key.clone();

        let replaced = self
            .entries
            .write()
            .insert(key.clone(), Entry { processor, info })
            .is_some();

        if replaced {
            tracing::info!("Replaced processor registration for '{}'", key);
        } else {
            tracing::info!("Registered processor for '{}'", key);
        }
        Ok(())
    }

    /// Remove a registration; `false` for blank or unknown types
    pub fn unregister(&self, document_type: &str) -> bool {
        let Some(key) = normalize(document_type) else {
            return false;
        };
        let removed = self.entries.write().remove(&key).is_some();
        if removed {
            tracing::info!("Unregistered processor for '{}'", key);
        }
        removed
    }

    /// Enabled processor for the type
    pub fn get(&self, document_type: &str) -> Option<Arc<dyn DocumentProcessor>> {
        let key = normalize(document_type)?;
        self.entries
            .read()
            .get(&key)
            .filter(|e| e.info.enabled)
            .map(|e| e.processor.clone())
    }

    /// Metadata for any registered processor, enabled or not
    pub fn get_processor_info(&self, document_type: &str) -> Option<ProcessorInfo> {
        let key = normalize(document_type)?;
        self.entries.read().get(&key).map(|e| e.info.clone())
    }

    pub fn set_enabled(&self, document_type: &str, enabled: bool) -> bool {
        self.modify_info(document_type, |info| info.enabled = enabled)
    }

    pub fn update_priority(&self, document_type: &str, priority: i32) -> bool {
        self.modify_info(document_type, |info| info.priority = priority)
    }

    fn modify_info(&self, document_type: &str, change: impl FnOnce(&mut ProcessorInfo)) -> bool {
        let Some(key) = normalize(document_type) else {
            return false;
        };
        match self.entries.write().get_mut(&key) {
            Some(entry) => {
                change(&mut entry.info);
                tracing::debug!("Updated processor '{}': {:?}", key, entry.info);
                true
            }
            None => false,
        }
    }

    /// Every registration, highest priority first
    pub fn list(&self) -> Vec<ProcessorInfo> {
        let mut infos: Vec<ProcessorInfo> = self.entries.read().values().map(|e| e.info.clone()).collect();
        infos.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.document_type.cmp(&b.document_type))
        });
        infos
    }

    /// Enabled registrations that declare the file extension
    pub fn processors_for_extension(&self, extension: &str) -> Vec<ProcessorInfo> {
        self.list()
            .into_iter()
            .filter(|info| info.enabled && info.supports_extension(extension))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Enabled processors, highest priority first; ties broken by type name
    fn enabled_candidates(&self) -> Vec<(String, Arc<dyn DocumentProcessor>)> {
        let entries = self.entries.read();
        let mut candidates: Vec<(i32, &String, &Entry)> = entries
            .iter()
            .filter(|(_, e)| e.info.enabled)
            .map(|(k, e)| (e.info.priority, k, e))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
        candidates
            .into_iter()
            .map(|(_, k, e)| (k.clone(), e.processor.clone()))
            .collect()
    }

    /// Enabled processors that accept the data, highest priority first.
    /// A processor whose check fails is skipped.
    pub fn compatible_processors(&self, data: &[u8]) -> Vec<Arc<dyn DocumentProcessor>> {
        if data.is_empty() {
            return Vec::new();
        }
        self.enabled_candidates()
            .into_iter()
            .filter(|(key, processor)| match processor.can_process(data) {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Compatibility check for '{}' failed, skipping: {}", key, e);
                    false
                }
            })
            .map(|(_, processor)| processor)
            .collect()
    }

    /// First processor that accepts the data
    pub fn find_for_data(&self, data: &[u8]) -> Option<Arc<dyn DocumentProcessor>> {
        if data.is_empty() {
            return None;
        }
        for (key, processor) in self.enabled_candidates() {
            match processor.can_process(data) {
                Ok(true) => return Some(processor),
                Ok(false) => {}
                Err(e) => tracing::warn!("Compatibility check for '{}' failed, skipping: {}", key, e),
            }
        }
        None
    }

    /// Compatible processor with the greatest priority
    pub fn highest_priority_processor(&self, data: &[u8]) -> Option<Arc<dyn DocumentProcessor>> {
        self.compatible_processors(data).into_iter().next()
    }

    /// Run the named processor, or auto-detect one when `document_type` is `None`
    pub async fn process_document(
        &self,
        data: &[u8],
        document_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        if data.is_empty() {
            return Err(Error::invalid_argument("Document data cannot be empty"));
        }

        let processor = match document_type {
            Some(document_type) => self.get(document_type).ok_or_else(|| {
                Error::invalid_operation(format!(
                    "No enabled processor registered for '{}'",
                    document_type
                ))
            })?,
            None => self
                .find_for_data(data)
                .ok_or_else(|| Error::invalid_operation("No processor can handle this document"))?,
        };

        let processor_type = processor.document_type().to_string();
        tracing::debug!("Processing {} bytes with '{}'", data.len(), processor_type);

        match processor.process(data, cancel).await {
            Ok(result) => Ok(result),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(source) => {
                tracing::warn!("Processor '{}' failed: {}", processor_type, source);
                Err(Error::ProcessorFailed {
                    document_type: processor_type,
                    source: Box::new(source),
                })
            }
        }
    }
}
