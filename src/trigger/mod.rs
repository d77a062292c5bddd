pub mod engine;
pub mod predicate;

pub use engine::{EngineStats, TickReport, TriggerEngine};
