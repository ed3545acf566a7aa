//! Session lifecycle: periodic ticking and idle eviction

pub mod service;
pub mod types;

pub use service::LifecycleManager;
pub use types::LifecycleConfig;
