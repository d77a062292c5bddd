pub mod market_data;
pub mod store;

pub use market_data::MarketDataCache;
pub use store::{KeyValueStore, MemoryStore, RedisStore};
