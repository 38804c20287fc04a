//! Out-of-band background tasks operating on the shared caches.

pub mod health;
pub mod sync;

pub use health::HealthMonitor;
pub use sync::StartupSynchronizer;
