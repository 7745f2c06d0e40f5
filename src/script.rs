//! Script representation and its load / enable / disable state machine.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};

use crate::capability::Registries;
use crate::config::EngineLimits;
use crate::context::{ExecutionContext, ON_DISABLE, ON_ENABLE};
use crate::error::{Error, Result};
use crate::host::HostAdapter;
use crate::lifecycle::ScriptState;

static NEXT_SCRIPT_ID: AtomicU64 = AtomicU64::new(1);

/// Snapshot of a script.
#[derive(Debug, Clone)]
pub struct ScriptInfo {
    /// Process-unique instance ID; a reloaded script gets a new one.
    pub id: u64,
    /// File name including extension.
    pub name: String,
    /// Backing file.
    pub path: PathBuf,
    /// Current lifecycle state.
    pub state: ScriptState,
    /// When the current context was loaded.
    pub loaded_at: Option<Instant>,
    /// When the script was last enabled.
    pub last_enabled: Option<Instant>,
    /// Times this instance has been enabled.
    pub enable_count: u64,
    /// Commands currently registered.
    pub commands: usize,
    /// Event listeners currently registered.
    pub listeners: usize,
    /// Timers currently registered.
    pub timers: usize,
}

impl ScriptInfo {
    /// Total host resources currently held.
    pub fn resources(&self) -> usize {
        self.commands + self.listeners + self.timers
    }
}

/// A loaded context and the registries bound into it.
struct Instance {
    context: ExecutionContext,
    registries: Registries,
}

impl Instance {
    /// Release resources in fixed order, then the context.
    fn close(&self) -> usize {
        let released = self.registries.close_all();
        self.context.close();
        released
    }
}

struct ScriptInner {
    state: ScriptState,
    instance: Option<Arc<Instance>>,
    loaded_at: Option<Instant>,
    last_enabled: Option<Instant>,
    enable_count: u64,
}

/// One script file and its runtime state.
pub struct Script {
    id: u64,
    name: String,
    path: PathBuf,
    host: Arc<dyn HostAdapter>,
    limits: EngineLimits,
    /// Serializes transitions; `inner` is only held briefly so snapshots
    /// never wait on script code.
    transition: Mutex<()>,
    inner: RwLock<ScriptInner>,
}

impl Script {
    /// Create an unloaded script over `path`.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        host: Arc<dyn HostAdapter>,
        limits: EngineLimits,
    ) -> Self {
        Self {
            id: NEXT_SCRIPT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            path: path.into(),
            host,
            limits,
            transition: Mutex::new(()),
            inner: RwLock::new(ScriptInner {
                state: ScriptState::Unloaded,
                instance: None,
                loaded_at: None,
                last_enabled: None,
                enable_count: 0,
            }),
        }
    }

    /// Get the instance ID.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the script name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> ScriptState {
        self.inner.read().state
    }

    /// Get a snapshot of the script.
    pub fn info(&self) -> ScriptInfo {
        let inner = self.inner.read();
        let (commands, listeners, timers) = inner
            .instance
            .as_ref()
            .map(|i| {
                (
                    i.registries.commands.len(),
                    i.registries.events.len(),
                    i.registries.timers.len(),
                )
            })
            .unwrap_or_default();

        ScriptInfo {
            id: self.id,
            name: self.name.clone(),
            path: self.path.clone(),
            state: inner.state,
            loaded_at: inner.loaded_at,
            last_enabled: inner.last_enabled,
            enable_count: inner.enable_count,
            commands,
            listeners,
            timers,
        }
    }

    /// Evaluate the backing file in a fresh context.
    ///
    /// Only valid while unloaded. On failure the script stays unloaded and
    /// anything the partial evaluation registered is released.
    pub fn load(&self) -> Result<()> {
        let _transition = self.transition.lock();

        let state = self.state();
        if !state.can_load() {
            return Err(Error::invalid_state(ScriptState::Unloaded.to_string(), state.to_string()));
        }
        self.load_fresh()
    }

    /// Enable the script, loading it first when needed.
    ///
    /// Returns `Ok(false)` if it was already enabled. A failing `onEnable`
    /// hook is logged and does not stop the transition.
    pub fn enable(&self) -> Result<bool> {
        let _transition = self.transition.lock();

        match self.state() {
            ScriptState::Enabled => return Ok(false),
            ScriptState::Unloaded | ScriptState::Disabled => self.load_fresh()?,
            ScriptState::Loaded => {}
        }

        let Some(instance) = self.instance() else {
            return Err(Error::invalid_state(
                ScriptState::Loaded.to_string(),
                self.state().to_string(),
            ));
        };

        if let Err(e) = instance.context.call_hook(ON_ENABLE) {
            tracing::error!(script = %self.name, "{}", e);
        }

        let mut inner = self.inner.write();
        inner.state = ScriptState::Enabled;
        inner.last_enabled = Some(Instant::now());
        inner.enable_count += 1;
        drop(inner);

        tracing::info!(script = %self.name, "Enabled script");
        Ok(true)
    }

    /// Disable the script: run `onDisable`, release timers, listeners, and
    /// commands in that order, then close the context.
    ///
    /// Returns false if the script was not enabled.
    pub fn disable(&self) -> bool {
        let _transition = self.transition.lock();

        if !self.state().can_disable() {
            return false;
        }

        if let Some(instance) = self.instance() {
            if let Err(e) = instance.context.call_hook(ON_DISABLE) {
                tracing::error!(script = %self.name, "{}", e);
            }
            let released = instance.close();
            tracing::debug!(script = %self.name, "Released {} resource(s)", released);
        }

        let mut inner = self.inner.write();
        inner.instance = None;
        inner.state = ScriptState::Disabled;
        drop(inner);

        tracing::info!(script = %self.name, "Disabled script");
        true
    }

    /// Release everything without running hooks and return to unloaded.
    ///
    /// Used for scripts removed before they were ever enabled.
    pub fn teardown(&self) -> bool {
        let _transition = self.transition.lock();
        self.teardown_locked()
    }

    fn teardown_locked(&self) -> bool {
        let instance = {
            let mut inner = self.inner.write();
            inner.state = ScriptState::Unloaded;
            inner.instance.take()
        };

        match instance {
            Some(instance) => {
                let released = instance.close();
                tracing::debug!(
                    script = %self.name,
                    "Tore down script, released {} resource(s)",
                    released
                );
                true
            }
            None => false,
        }
    }

    fn instance(&self) -> Option<Arc<Instance>> {
        self.inner.read().instance.clone()
    }

    fn load_fresh(&self) -> Result<()> {
        let source = match std::fs::read_to_string(&self.path) {
            Ok(source) => source,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::ScriptFileMissing(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let registries = Registries::new(&self.name, self.host.clone());
        let context = ExecutionContext::new(&self.name, &self.limits, registries.clone());
        let instance = Instance {
            context,
            registries,
        };

        if let Err(e) = instance.context.evaluate(&source) {
            tracing::error!(script = %self.name, "{}", e);
            let released = instance.close();
            if released > 0 {
                tracing::debug!(
                    script = %self.name,
                    "Released {} resource(s) from failed load",
                    released
                );
            }
            return Err(e);
        }

        let mut inner = self.inner.write();
        inner.instance = Some(Arc::new(instance));
        inner.state = ScriptState::Loaded;
        inner.loaded_at = Some(Instant::now());
        drop(inner);

        tracing::debug!(script = %self.name, "Loaded script");
        Ok(())
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        if self.inner.get_mut().instance.is_some() {
            tracing::warn!(script = %self.name, "Script dropped while active; tearing down");
            self.teardown_locked();
        }
    }
}

/// Shared handle to a tracked script.
#[derive(Clone)]
pub struct ScriptHandle {
    script: Arc<Script>,
}

impl ScriptHandle {
    /// Wrap a script.
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
        }
    }

    /// Get the instance ID.
    pub fn id(&self) -> u64 {
        self.script.id()
    }

    /// Get the script name.
    pub fn name(&self) -> &str {
        self.script.name()
    }

    /// Get the backing file path.
    pub fn path(&self) -> &Path {
        self.script.path()
    }

    /// Get the script state.
    pub fn state(&self) -> ScriptState {
        self.script.state()
    }

    /// Whether the script is enabled.
    pub fn is_enabled(&self) -> bool {
        self.state() == ScriptState::Enabled
    }

    /// Get script info.
    pub fn info(&self) -> ScriptInfo {
        self.script.info()
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(&self, other: &ScriptHandle) -> bool {
        Arc::ptr_eq(&self.script, &other.script)
    }

    /// Get the underlying script.
    pub fn inner(&self) -> &Script {
        &self.script
    }
}

impl std::fmt::Debug for ScriptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHandle")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn script(dir: &tempfile::TempDir, name: &str, source: &str) -> (Script, Arc<LocalHost>) {
        let path = dir.path().join(name);
        std::fs::write(&path, source).unwrap();
        let host = Arc::new(LocalHost::new());
        let script = Script::new(name, path, host.clone(), EngineLimits::default());
        (script, host)
    }

    #[test]
    fn test_script_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(
            &dir,
            "greet.rhai",
            r#"
            addCommand("greet", |sender, label, args| "hello");
            addEventListener("join", |e| ());
            setInterval(|| (), 20);
            fn onEnable() { print("up"); }
            fn onDisable() { print("down"); }
            "#,
        );

        assert!(script.id() > 0);
        assert_eq!(script.state(), ScriptState::Unloaded);

        script.load().unwrap();
        assert_eq!(script.state(), ScriptState::Loaded);
        assert!(matches!(script.load(), Err(Error::InvalidState { .. })));
        assert_eq!(script.info().resources(), 3);

        assert!(script.enable().unwrap());
        assert!(!script.enable().unwrap());
        assert_eq!(script.state(), ScriptState::Enabled);
        assert_eq!(script.info().enable_count, 1);
        assert_eq!(host.dispatch_command("greet", json!("console"), &[]).unwrap(), json!("hello"));

        assert!(script.disable());
        assert!(!script.disable());
        assert_eq!(script.state(), ScriptState::Disabled);
        assert_eq!(script.info().resources(), 0);
        assert!(!host.has_command("greet"));
        assert_eq!(host.listener_count("join"), 0);
        assert_eq!(host.timer_count(), 0);
    }

    #[test]
    fn test_reenable_reloads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(&dir, "v.rhai", r#"addCommand("v1", || 1);"#);

        script.enable().unwrap();
        assert!(host.has_command("v1"));
        script.disable();

        std::fs::write(script.path(), r#"addCommand("v2", || 2);"#).unwrap();
        assert!(script.enable().unwrap());
        assert!(!host.has_command("v1"));
        assert!(host.has_command("v2"));
        assert_eq!(script.info().enable_count, 2);
    }

    #[test]
    fn test_failed_load_releases_partial_registrations() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(
            &dir,
            "broken.rhai",
            r#"
            addEventListener("join", |e| ());
            setTimeout(|| (), 10);
            throw "boom";
            "#,
        );

        let err = script.enable().unwrap_err();
        assert!(matches!(err, Error::Evaluation { ref script, .. } if script == "broken.rhai"));
        assert_eq!(script.state(), ScriptState::Unloaded);
        assert_eq!(host.listener_count("join"), 0);
        assert_eq!(host.timer_count(), 0);
    }

    #[test]
    fn test_failing_enable_hook_still_enables() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _host) = script(&dir, "hook.rhai", r#"fn onEnable() { throw "nope"; }"#);

        assert!(script.enable().unwrap());
        assert_eq!(script.state(), ScriptState::Enabled);
    }

    #[test]
    fn test_failing_disable_hook_still_tears_down() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(
            &dir,
            "stubborn.rhai",
            r#"
            addCommand("stay", || 1);
            addEventListener("join", |e| ());
            setInterval(|| (), 10);
            fn onDisable() { throw "not leaving"; }
            "#,
        );

        script.enable().unwrap();
        assert!(script.disable());
        assert_eq!(script.state(), ScriptState::Disabled);
        assert_eq!(script.info().resources(), 0);
        assert!(!host.has_command("stay"));
        assert_eq!(host.listener_count("join"), 0);
        assert_eq!(host.timer_count(), 0);
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let host = Arc::new(LocalHost::new());
        let script = Script::new(
            "gone.rhai",
            dir.path().join("gone.rhai"),
            host,
            EngineLimits::default(),
        );

        assert!(matches!(script.load(), Err(Error::ScriptFileMissing(_))));
        assert_eq!(script.state(), ScriptState::Unloaded);
    }

    #[test]
    fn test_teardown_skips_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(
            &dir,
            "t.rhai",
            r#"
            addEventListener("tick", |e| ());
            fn onDisable() { addEventListener("late", |e| ()); }
            "#,
        );

        script.load().unwrap();
        assert!(script.teardown());
        assert!(!script.teardown());
        assert_eq!(script.state(), ScriptState::Unloaded);
        assert_eq!(host.listener_count("tick"), 0);
        assert_eq!(host.listener_count("late"), 0);
    }

    #[test]
    fn test_timer_does_not_fire_after_disable() {
        let dir = tempfile::tempdir().unwrap();
        let (script, host) = script(
            &dir,
            "tick.rhai",
            r#"
            setInterval(|| { addEventListener("from-timer", |e| ()); }, 10);
            "#,
        );

        script.enable().unwrap();
        host.advance(Duration::from_millis(10));
        assert_eq!(host.listener_count("from-timer"), 1);

        script.disable();
        assert_eq!(host.advance(Duration::from_millis(100)), 0);
        assert_eq!(host.listener_count("from-timer"), 0);
        assert_eq!(host.fire_event("from-timer", Value::Null), 0);
    }

    #[test]
    fn test_handle() {
        let dir = tempfile::tempdir().unwrap();
        let (script, _host) = script(&dir, "h.rhai", "");
        let handle = ScriptHandle::new(script);
        let other = handle.clone();

        assert!(handle.ptr_eq(&other));
        assert_eq!(handle.name(), "h.rhai");
        assert!(!handle.is_enabled());
        handle.inner().enable().unwrap();
        assert!(other.is_enabled());
    }
}
