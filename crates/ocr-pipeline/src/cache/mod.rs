//! Content-addressed cache of OCR results

mod result_cache;

pub use result_cache::{CacheStatistics, CachedResult, ResultCache};
