//! Per-delivery middleware: retry classification, dispatch and dead-letter
//! publication.

mod dead_letter;
mod dispatch;
mod retry;

pub use dead_letter::DeadLetterPublisher;
pub use dispatch::{task_key, DispatchReport, Dispatcher};
pub use retry::{
    should_retry, BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy, RetryState,
};
