//! Background resubmission of failed requests

mod processor;

pub use processor::{
    FailedRequestSink, RetryPassSummary, RetryQueueEvent, RetryQueueProcessor, RetryQueueStatus,
};
