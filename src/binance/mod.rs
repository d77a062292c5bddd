pub mod client;
pub mod rate_limit;

pub use client::{FuturesClient, DEFAULT_REST_URL};
