//! Cooperative cancellation for workers and handler invocations.

mod token;

pub use token::CancellationToken;
