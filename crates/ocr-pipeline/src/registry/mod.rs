//! Document-type processors and their registry

mod processor;
mod processor_registry;

pub use processor::{DocumentProcessor, ProcessorInfo};
pub use processor_registry::ProcessorRegistry;
