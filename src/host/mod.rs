//! Host adapter contract.
//!
//! Everything the runtime does to the host application goes through
//! [`HostAdapter`]. Adapters own any host-specific workaround (private table
//! access, tick conversion, thread marshaling); the core only sees opaque
//! [`HostHandle`]s and JSON payloads.

mod local;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

pub use local::LocalHost;

/// Callback handed to the host. Arguments and return value are JSON so that
/// adapters never depend on engine types.
pub type Callback = Arc<dyn Fn(&[Value]) -> Result<Value> + Send + Sync>;

/// Opaque host-assigned reference to a registered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostHandle(u64);

impl HostHandle {
    /// Wrap a raw host identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw host identifier.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static description of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Command name, unique per host.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: Option<String>,
    /// Usage string.
    #[serde(default)]
    pub usage: Option<String>,
    /// Permission node required to run it.
    #[serde(default)]
    pub permission: Option<String>,
    /// Alternative names.
    #[serde(default)]
    pub aliases: Vec<String>,
}

impl CommandSpec {
    /// Spec with only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

/// Listener ordering relative to other listeners of the same event type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    /// Runs first.
    Lowest,
    /// Runs before normal listeners.
    Low,
    /// Default.
    #[default]
    Normal,
    /// Runs after normal listeners.
    High,
    /// Runs after high listeners.
    Highest,
    /// Observes the final outcome; runs last.
    Monitor,
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lowest" => Ok(Self::Lowest),
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "highest" => Ok(Self::Highest),
            "monitor" => Ok(Self::Monitor),
            other => Err(Error::invalid_spec(
                "listener",
                format!("unknown priority '{}'", other),
            )),
        }
    }
}

/// Request to register a command.
#[derive(Clone)]
pub struct CommandRequest {
    /// Command description.
    pub spec: CommandSpec,
    /// Called with `[sender, label, args]`; returns whether the command was handled.
    pub executor: Callback,
    /// Called with `[sender, alias, args]`; returns a list of completions.
    pub tab_completer: Option<Callback>,
}

/// Request to subscribe to an event type.
#[derive(Clone)]
pub struct ListenerRequest {
    /// Host event type name.
    pub event_type: String,
    /// Called with `[event]`.
    pub callback: Callback,
    /// Ordering among listeners.
    pub priority: Priority,
}

/// Request to schedule a callback.
#[derive(Clone)]
pub struct TimerRequest {
    /// Called with no arguments on every firing.
    pub callback: Callback,
    /// Delay before the first firing.
    pub delay: Duration,
    /// Repeat period; `None` for a one-shot timer.
    pub period: Option<Duration>,
}

macro_rules! debug_without_callbacks {
    ($ty:ident { $($field:ident),* }) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))*
                    .finish_non_exhaustive()
            }
        }
    };
}

debug_without_callbacks!(CommandRequest { spec });
debug_without_callbacks!(ListenerRequest { event_type, priority });
debug_without_callbacks!(TimerRequest { delay, period });

/// The narrow interface the runtime requires from its host application.
///
/// Implementations must be callable from any thread. Operations on
/// thread-affine host state should be marshaled by the caller through
/// [`HostAdapter::run_on_primary_thread`]; the command registry does this
/// for every command registration and removal.
///
/// A host that offers no public way to remove a command may implement
/// [`HostAdapter::unregister_command`] as best effort (hidden rather than
/// removed). The runtime forgets the handle either way.
pub trait HostAdapter: Send + Sync + 'static {
    /// Add a command to the host command table.
    fn register_command(&self, request: CommandRequest) -> Result<HostHandle>;

    /// Remove a command previously added with [`HostAdapter::register_command`].
    fn unregister_command(&self, handle: HostHandle) -> Result<()>;

    /// Subscribe a callback to an event type.
    fn register_event_listener(&self, request: ListenerRequest) -> Result<HostHandle>;

    /// Remove a listener.
    fn unregister_event_listener(&self, handle: HostHandle) -> Result<()>;

    /// Schedule a one-shot or repeating callback.
    fn schedule_timer(&self, request: TimerRequest) -> Result<HostHandle>;

    /// Cancel a timer. Cancelling a one-shot timer that already fired is not an error.
    fn cancel_timer(&self, handle: HostHandle) -> Result<()>;

    /// Run `task` on the host's primary thread and block until it completes.
    /// Runs inline when already on the primary thread.
    fn run_on_primary_thread(&self, task: Box<dyn FnOnce() + Send>);

    /// Whether the calling thread is the host's primary thread.
    fn current_thread_is_primary(&self) -> bool;
}

/// Run `f` on the host's primary thread and hand back its result.
pub fn on_primary<T, F>(host: &dyn HostAdapter, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    if host.current_thread_is_primary() {
        return Ok(f());
    }

    let slot = Arc::new(Mutex::new(None));
    let out = slot.clone();
    host.run_on_primary_thread(Box::new(move || {
        *out.lock() = Some(f());
    }));

    let result = slot.lock().take();
    result.ok_or_else(|| Error::host("primary thread task was dropped before it ran"))
}
