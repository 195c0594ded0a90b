pub mod bucket;
pub mod collector;
pub mod manager;
pub mod registry;
pub mod ring;

pub use collector::Collector;
pub use manager::{ManagerConfig, MetricsManager};
pub use registry::Metrics;
