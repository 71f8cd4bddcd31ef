//! Collaborator abstractions consumed by the pipeline
//!
//! The pipeline never talks to a concrete OCR service, network monitor or
//! hash implementation directly; each is injected behind one of these traits.

pub mod connectivity;
pub mod hasher;
pub mod ocr_client;

pub use connectivity::{ConnectivityService, ManualConnectivity};
pub use hasher::{ContentHasher, Sha256Hasher};
pub use ocr_client::{OcrResponse, OcrSubmissionClient, SubmissionResponse, SubmissionStatus};
