//! # script-runtime
//!
//! Hot-reloading runtime for sandboxed `rhai` scripts embedded in a
//! long-running host application.
//!
//! This crate provides:
//! - **Script Lifecycle** - Load, enable, disable, and hot-reload script files
//! - **Capability Registries** - Commands, event listeners, and timers owned
//!   per script and revoked in a fixed order when the script goes away
//! - **Host Adapter** - One narrow trait between the runtime and the host,
//!   including primary-thread marshaling
//! - **Directory Watching** - Add, reload, and remove scripts as files change
//! - **Metrics Hooks** - Track script lifecycle activity
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use script_runtime::{LocalHost, ManagerConfig, ScriptManager};
//!
//! let host = Arc::new(LocalHost::new());
//! let config = ManagerConfig::new().with_scripts_dir("scripts");
//! let manager = ScriptManager::new(host.clone(), config)?;
//!
//! // Add every script in the directory, then follow changes.
//! manager.load_directory(true)?;
//! manager.enable_all();
//!
//! host.fire_event("join", serde_json::json!({ "player": "alex" }));
//! ```
//!
//! ## Feature Flags
//!
//! - `watch` (default): `notify`-backed directory watcher thread
//! - `metrics-prometheus`: Prometheus metrics integration

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

mod capability;
mod config;
mod context;
mod error;
mod lifecycle;
mod manager;
mod script;
mod watcher;

pub mod host;

#[cfg(feature = "metrics-prometheus")]
mod metrics;

pub use capability::{
    Capability, CapabilityRegistry, CommandRegistry, Commands, EventRegistry, Listeners, Liveness,
    Registries, ResourceId, TimerRegistry, TimerSpec, Timers,
};
pub use config::{EngineLimits, ManagerConfig};
pub use context::{ExecutionContext, ON_DISABLE, ON_ENABLE};
pub use error::{Error, Result};
pub use host::{
    Callback, CommandRequest, CommandSpec, HostAdapter, HostHandle, ListenerRequest, LocalHost,
    Priority, TimerRequest,
};
pub use lifecycle::{LifecycleHooks, ScriptEvent, ScriptState};
pub use manager::{ManagerStats, ScriptManager};
pub use script::{Script, ScriptHandle, ScriptInfo};
pub use watcher::WatchEvent;

#[cfg(feature = "watch")]
pub use watcher::ScriptWatcher;

#[cfg(feature = "metrics-prometheus")]
pub use metrics::{MetricsConfig, ScriptMetrics};

// Engine types that appear in the public API.
pub use rhai::{Dynamic, FnPtr};

/// Crate version for compatibility checks.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
