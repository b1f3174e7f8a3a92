//! Cooperative cancellation for graceful worker shutdown.

mod token;

pub use token::CancellationToken;
