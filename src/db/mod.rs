pub mod error;
pub mod main_store;
mod schema;
mod service;
mod stats;
mod token;
mod user_env;

pub use error::StoreError;
pub use main_store::MainStore;
pub use service::{HealthStatus, ServiceRecord, ServiceType, ServiceUpdate};
pub use stats::{utc_day, ProxyRequestStat};
