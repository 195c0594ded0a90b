pub mod config;
pub mod error;
pub mod events;
pub mod matcher;
pub mod metrics;
pub mod outbound;
pub mod proxy;
pub mod route;
pub mod server;
pub mod storage;
pub mod transport;
