//! Shared primitives for the webtask harness: the service catalog,
//! public/private URL translation, and task configuration types.

use std::path::PathBuf;

pub mod config;
pub mod services;

pub use config::{
    BashBrowserTaskConfig, BashTaskConfig, BrowserTaskConfig, EarlyStopConfig, EvalSpec, EvalType,
    ProgramHtmlTarget, ReferenceAnswers, TaskConfig, UrlMatchRule, Viewport,
};
pub use services::{private_to_public, public_to_private, Service};

/// Name of the isolated bridge network every session provisions.
pub const DEFAULT_NETWORK: &str = "webtask_network";

/// Shared secret expected by the browser-bridge HTTP endpoints. Only our
/// harness knows it, which keeps agent code running inside the network
/// from driving the bridge directly.
pub const DEFAULT_BRIDGE_API_KEY: &str = "key-WEBTASKBRIDGEKEY";

pub const WEBTASK_CACHE_DIR_ENV: &str = "WEBTASK_CACHE_DIR";

/// Directory where downloaded image archives are cached between runs.
pub fn cache_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(WEBTASK_CACHE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".cache").join("webtask")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown service '{0}' (known services: {})", services::Service::ALL_NAMES)]
    UnknownService(String),
    #[error("task config is not valid: {0}")]
    Invalid(#[from] serde_json::Error),
}
