pub mod adapters;
pub mod agents;
pub mod api;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod entitlement;
pub mod error;
pub mod runtime;
pub mod services;
pub mod streams;
pub mod vault;

pub use config::AppConfig;
pub use error::{OrraError, Result};
