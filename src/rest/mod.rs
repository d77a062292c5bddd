pub mod client;
pub mod retry;

pub use client::RestClient;
pub use retry::{RestError, RetryPolicy};
