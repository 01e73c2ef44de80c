pub mod health;

pub use health::{health_router, HealthServer, HealthState, HealthStatus};
