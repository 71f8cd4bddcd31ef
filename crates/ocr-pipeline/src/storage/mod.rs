//! Storage backends for cached results and failed requests

pub mod byte_store;
pub mod failed_requests;
pub mod sqlite;

pub use byte_store::{ByteStore, InMemoryByteStore};
pub use failed_requests::{FailedRequest, FailedRequestStore, InMemoryFailedRequestStore};
pub use sqlite::SqliteFailedRequestStore;
