//! Script lifecycle states and events.

use std::time::Instant;

/// Script lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptState {
    /// No execution context exists.
    Unloaded,
    /// Source evaluated, hooks not yet run.
    Loaded,
    /// `onEnable` has run; resources are live.
    Enabled,
    /// Resources released and context closed.
    Disabled,
}

impl ScriptState {
    /// Check if the script can be loaded.
    pub fn can_load(&self) -> bool {
        matches!(self, Self::Unloaded)
    }

    /// Check if the script can be disabled.
    pub fn can_disable(&self) -> bool {
        matches!(self, Self::Enabled)
    }

}

impl std::fmt::Display for ScriptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unloaded => "unloaded",
            Self::Loaded => "loaded",
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle event delivered to manager observers.
#[derive(Debug, Clone)]
pub enum ScriptEvent {
    /// Script was added to the manager.
    Added {
        /// Script name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Script was enabled.
    Enabled {
        /// Script name.
        name: String,
        /// Event time.
        at: Instant,
        /// Times this instance has been enabled.
        count: u64,
    },
    /// Script was disabled.
    Disabled {
        /// Script name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// Script was removed from the manager.
    Removed {
        /// Script name.
        name: String,
        /// Event time.
        at: Instant,
    },
    /// A lifecycle operation on the script failed.
    Failed {
        /// Script name.
        name: String,
        /// Error message.
        message: String,
        /// Event time.
        at: Instant,
    },
}

impl ScriptEvent {
    /// Get the script name.
    pub fn script_name(&self) -> &str {
        match self {
            Self::Added { name, .. }
            | Self::Enabled { name, .. }
            | Self::Disabled { name, .. }
            | Self::Removed { name, .. }
            | Self::Failed { name, .. } => name,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Added { at, .. }
            | Self::Enabled { at, .. }
            | Self::Disabled { at, .. }
            | Self::Removed { at, .. }
            | Self::Failed { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Added { .. } => "added",
            Self::Enabled { .. } => "enabled",
            Self::Disabled { .. } => "disabled",
            Self::Removed { .. } => "removed",
            Self::Failed { .. } => "failed",
        }
    }
}

type Handler = Box<dyn Fn(&ScriptEvent) + Send + Sync>;

/// Observers of script lifecycle events.
pub struct LifecycleHooks {
    handlers: Vec<Handler>,
}

impl LifecycleHooks {
    /// Create empty hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add an event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&ScriptEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handlers are installed.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Deliver an event to every handler.
    pub fn emit(&self, event: ScriptEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    /// Emit an added event.
    pub fn emit_added(&self, name: &str) {
        self.emit(ScriptEvent::Added {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an enabled event.
    pub fn emit_enabled(&self, name: &str, count: u64) {
        self.emit(ScriptEvent::Enabled {
            name: name.to_string(),
            at: Instant::now(),
            count,
        });
    }

    /// Emit a disabled event.
    pub fn emit_disabled(&self, name: &str) {
        self.emit(ScriptEvent::Disabled {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a removed event.
    pub fn emit_removed(&self, name: &str) {
        self.emit(ScriptEvent::Removed {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a failure event.
    pub fn emit_failed(&self, name: &str, message: &str) {
        self.emit(ScriptEvent::Failed {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}
