//! Script manager: the set of tracked scripts, keyed by file name.
//!
//! Every mutation (add, remove, enable, disable, reload) runs under one
//! lifecycle lock, so at most one transition is in flight for the whole
//! manager. Lookups go through a concurrent map and never take that lock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::config::ManagerConfig;
use crate::error::{Error, Result};
use crate::host::HostAdapter;
use crate::lifecycle::{LifecycleHooks, ScriptEvent, ScriptState};
use crate::script::{Script, ScriptHandle};
use crate::watcher::WatchEvent;

#[cfg(feature = "metrics-prometheus")]
use crate::metrics::ScriptMetrics;
#[cfg(feature = "watch")]
use crate::watcher::ScriptWatcher;

/// Counts of tracked scripts by state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Scripts tracked.
    pub total: usize,
    /// Loaded but never enabled.
    pub loaded: usize,
    /// Enabled.
    pub enabled: usize,
    /// Disabled.
    pub disabled: usize,
}

#[derive(Default)]
struct Telemetry {
    #[cfg(feature = "metrics-prometheus")]
    metrics: RwLock<Option<Arc<ScriptMetrics>>>,
}

#[cfg(feature = "metrics-prometheus")]
impl Telemetry {
    fn with(&self, f: impl FnOnce(&ScriptMetrics)) {
        if let Some(metrics) = self.metrics.read().as_ref() {
            f(metrics);
        }
    }

    fn added(&self, started: Instant) {
        self.with(|m| m.record_added(started.elapsed().as_secs_f64()));
    }

    fn removed(&self) {
        self.with(ScriptMetrics::record_removed);
    }

    fn enabled(&self) {
        self.with(ScriptMetrics::record_enabled);
    }

    fn failed(&self) {
        self.with(ScriptMetrics::record_failure);
    }
}

#[cfg(not(feature = "metrics-prometheus"))]
impl Telemetry {
    fn added(&self, _started: Instant) {}
    fn removed(&self) {}
    fn enabled(&self) {}
    fn failed(&self) {}
}

struct ManagerInner {
    config: ManagerConfig,
    host: Arc<dyn HostAdapter>,
    scripts: DashMap<String, ScriptHandle>,
    lifecycle: Mutex<()>,
    hooks: RwLock<LifecycleHooks>,
    loaded: AtomicBool,
    telemetry: Telemetry,
    #[cfg(feature = "watch")]
    watcher: Mutex<Option<ScriptWatcher>>,
}

impl ManagerInner {
    fn add_locked(&self, name: &str, auto_enable: bool) -> Option<ScriptHandle> {
        match self.try_add(name, auto_enable) {
            Ok(handle) => Some(handle),
            Err(e @ Error::ScriptAlreadyExists(_)) => {
                tracing::warn!(script = %name, "Not adding script: {}", e);
                None
            }
            Err(e) => {
                match &e {
                    Error::InvalidExtension(_) | Error::ScriptFileMissing(_) => {
                        tracing::warn!(script = %name, "Not adding script: {}", e)
                    }
                    _ => tracing::error!(script = %name, "Failed to add script: {}", e),
                }
                self.telemetry.failed();
                self.hooks.read().emit_failed(name, &e.to_string());
                None
            }
        }
    }

    fn try_add(&self, name: &str, auto_enable: bool) -> Result<ScriptHandle> {
        if !self.config.is_script_name(name) {
            return Err(Error::InvalidExtension(name.to_string()));
        }
        if self.scripts.contains_key(name) {
            return Err(Error::ScriptAlreadyExists(name.to_string()));
        }
        let path = self.config.script_path(name);
        if !path.is_file() {
            return Err(Error::ScriptFileMissing(path));
        }

        let started = Instant::now();
        let script = Script::new(name, path, self.host.clone(), self.config.limits.clone());
        if auto_enable {
            script.enable()?;
        } else {
            script.load()?;
        }

        let handle = ScriptHandle::new(script);
        self.scripts.insert(name.to_string(), handle.clone());
        self.telemetry.added(started);
        tracing::info!(script = %name, "Added script");

        let hooks = self.hooks.read();
        hooks.emit_added(name);
        if auto_enable {
            self.telemetry.enabled();
            hooks.emit_enabled(name, handle.info().enable_count);
        }
        Ok(handle)
    }

    fn remove_locked(&self, name: &str) -> bool {
        let Some((_, handle)) = self.scripts.remove(name) else {
            return false;
        };

        let script = handle.inner();
        if script.disable() {
            self.hooks.read().emit_disabled(name);
        }
        script.teardown();

        self.telemetry.removed();
        tracing::info!(script = %name, "Removed script");
        self.hooks.read().emit_removed(name);
        true
    }

    fn reload_locked(&self, name: &str) -> bool {
        let removed = self.remove_locked(name);
        let added = self.add_locked(name, true).is_some();
        if removed && added {
            tracing::info!(script = %name, "Reloaded script");
        }
        removed || added
    }

    fn enable_locked(&self, name: &str) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };

        match handle.inner().enable() {
            Ok(true) => {
                self.telemetry.enabled();
                self.hooks.read().emit_enabled(name, handle.info().enable_count);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::error!(script = %name, "Failed to enable script: {}", e);
                self.telemetry.failed();
                self.hooks.read().emit_failed(name, &e.to_string());
                false
            }
        }
    }

    fn disable_locked(&self, name: &str) -> bool {
        let Some(handle) = self.get(name) else {
            return false;
        };

        let disabled = handle.inner().disable();
        if disabled {
            self.hooks.read().emit_disabled(name);
        }
        disabled
    }

    fn get(&self, name: &str) -> Option<ScriptHandle> {
        self.scripts.get(name).map(|r| r.clone())
    }

    fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scripts.iter().map(|r| r.key().clone()).collect();
        names.sort();
        names
    }

    /// Script file names in the scripts directory, creating it if missing.
    fn scan(&self) -> Result<Vec<String>> {
        let dir = &self.config.scripts_dir;
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
            tracing::info!("Created scripts directory {}", dir.display());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.path().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            if self.config.is_script_name(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// File name of `path` if it names an allowed script.
    fn script_name(&self, path: &Path) -> Option<String> {
        let name = path.file_name().and_then(|n| n.to_str())?;
        if self.config.is_script_name(name) {
            Some(name.to_string())
        } else {
            tracing::debug!("Ignored change to {}", path.display());
            None
        }
    }

    fn handle_watch_event(&self, event: WatchEvent) -> bool {
        match event {
            WatchEvent::Created { path } => {
                let Some(name) = self.script_name(&path) else {
                    return false;
                };
                let _lifecycle = self.lifecycle.lock();
                // A file renamed over a tracked script arrives as a create.
                if self.scripts.contains_key(&name) {
                    self.reload_locked(&name)
                } else {
                    self.add_locked(&name, true).is_some()
                }
            }
            WatchEvent::Modified { path } => {
                let Some(name) = self.script_name(&path) else {
                    return false;
                };
                let _lifecycle = self.lifecycle.lock();
                self.reload_locked(&name)
            }
            WatchEvent::Removed { path } => {
                let Some(name) = self.script_name(&path) else {
                    return false;
                };
                let _lifecycle = self.lifecycle.lock();
                self.remove_locked(&name)
            }
            WatchEvent::Renamed { from, to } => {
                let from = self.script_name(&from);
                let to = self.script_name(&to);
                let _lifecycle = self.lifecycle.lock();
                let removed = from.map_or(false, |name| self.remove_locked(&name));
                let added = to.map_or(false, |name| self.add_locked(&name, true).is_some());
                removed || added
            }
        }
    }

    #[cfg(feature = "watch")]
    fn stop_watching(&self) -> bool {
        // Taken out first: the watcher thread may be waiting on the
        // lifecycle lock, and joining it must not hold anything it needs.
        let watcher = self.watcher.lock().take();
        match watcher {
            Some(mut watcher) => watcher.stop(),
            None => false,
        }
    }

    fn shutdown(&self) -> usize {
        #[cfg(feature = "watch")]
        self.stop_watching();

        let _lifecycle = self.lifecycle.lock();
        let removed = self
            .sorted_names()
            .iter()
            .filter(|name| self.remove_locked(name))
            .count();
        self.loaded.store(false, Ordering::Release);

        if removed > 0 {
            tracing::info!("Script manager shut down, removed {} script(s)", removed);
        }
        removed
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Tracks scripts by file name and drives their lifecycle.
///
/// Cloning yields another handle to the same manager. Scripts are shut down
/// when the last handle is dropped.
#[derive(Clone)]
pub struct ScriptManager {
    inner: Arc<ManagerInner>,
}

impl ScriptManager {
    /// Create a manager over `host`.
    pub fn new(host: Arc<dyn HostAdapter>, config: ManagerConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                host,
                scripts: DashMap::new(),
                lifecycle: Mutex::new(()),
                hooks: RwLock::new(LifecycleHooks::new()),
                loaded: AtomicBool::new(false),
                telemetry: Telemetry::default(),
                #[cfg(feature = "watch")]
                watcher: Mutex::new(None),
            }),
        })
    }

    /// Record lifecycle metrics into `metrics`.
    #[cfg(feature = "metrics-prometheus")]
    pub fn with_metrics(self, metrics: Arc<ScriptMetrics>) -> Self {
        *self.inner.telemetry.metrics.write() = Some(metrics);
        self
    }

    /// Get the manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Get the host adapter.
    pub fn host(&self) -> &Arc<dyn HostAdapter> {
        &self.inner.host
    }

    /// Add a lifecycle event handler.
    ///
    /// Handlers run while the manager's lifecycle lock is held and must not
    /// call back into manager operations that change scripts.
    pub fn on_event<F>(&self, handler: F)
    where
        F: Fn(&ScriptEvent) + Send + Sync + 'static,
    {
        self.inner.hooks.write().on_event(handler);
    }

    /// Track the script file `name`, load it, and enable it if
    /// `auto_enable`.
    ///
    /// Returns `None` if the name is already tracked, the file is missing or
    /// has a disallowed extension, or loading fails. A failed add leaves
    /// nothing behind.
    pub fn add(&self, name: &str, auto_enable: bool) -> Option<ScriptHandle> {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.add_locked(name, auto_enable)
    }

    /// Disable (or tear down) and forget a script. Returns false if it was
    /// not tracked.
    pub fn remove(&self, name: &str) -> bool {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.remove_locked(name)
    }

    /// Get a tracked script.
    pub fn get(&self, name: &str) -> Option<ScriptHandle> {
        self.inner.get(name)
    }

    /// Check if a script is tracked.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.scripts.contains_key(name)
    }

    /// All tracked scripts, ordered by name.
    pub fn scripts(&self) -> Vec<ScriptHandle> {
        self.names()
            .iter()
            .filter_map(|name| self.inner.get(name))
            .collect()
    }

    /// Names of all tracked scripts, sorted.
    pub fn names(&self) -> Vec<String> {
        self.inner.sorted_names()
    }

    /// Number of tracked scripts.
    pub fn len(&self) -> usize {
        self.inner.scripts.len()
    }

    /// Whether no scripts are tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.scripts.is_empty()
    }

    /// Counts of tracked scripts by state.
    pub fn stats(&self) -> ManagerStats {
        let mut stats = ManagerStats::default();
        for entry in self.inner.scripts.iter() {
            stats.total += 1;
            match entry.value().state() {
                ScriptState::Loaded => stats.loaded += 1,
                ScriptState::Enabled => stats.enabled += 1,
                ScriptState::Disabled => stats.disabled += 1,
                ScriptState::Unloaded => {}
            }
        }
        stats
    }

    /// Enable one script. Returns false if it is unknown, already enabled,
    /// or failed to load.
    pub fn enable(&self, name: &str) -> bool {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.enable_locked(name)
    }

    /// Disable one script. Returns false if it is unknown or not enabled.
    pub fn disable(&self, name: &str) -> bool {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner.disable_locked(name)
    }

    /// Enable every tracked script. Returns how many changed state.
    pub fn enable_all(&self) -> usize {
        let _lifecycle = self.inner.lifecycle.lock();
        self.inner
            .sorted_names()
            .iter()
            .filter(|name| self.inner.enable_locked(name))
            .count()
    }

    /// Stop watching, then disable every tracked script. Returns how many
    /// changed state.
    pub fn disable_all(&self) -> usize {
        #[cfg(feature = "watch")]
        self.inner.stop_watching();

        let _lifecycle = self.inner.lifecycle.lock();
        self.inner
            .sorted_names()
            .iter()
            .filter(|name| self.inner.disable_locked(name))
            .count()
    }

    /// Add every script in the scripts directory without enabling it, and
    /// start watching if `watch`. Returns the number of scripts added.
    ///
    /// Runs once; later calls return `Ok(0)` until [`ScriptManager::shutdown`].
    /// A failed scan or watcher start leaves it free to run again.
    pub fn load_directory(&self, watch: bool) -> Result<usize> {
        if self.inner.loaded.swap(true, Ordering::AcqRel) {
            tracing::warn!("Scripts directory already loaded");
            return Ok(0);
        }

        let added = {
            let _lifecycle = self.inner.lifecycle.lock();
            let names = match self.inner.scan() {
                Ok(names) => names,
                Err(e) => {
                    self.inner.loaded.store(false, Ordering::Release);
                    return Err(e);
                }
            };
            names
                .iter()
                .filter(|name| self.inner.add_locked(name, false).is_some())
                .count()
        };
        tracing::info!(
            "Loaded {} script(s) from {}",
            added,
            self.inner.config.scripts_dir.display()
        );

        if watch {
            if let Err(e) = self.start_watching() {
                self.inner.loaded.store(false, Ordering::Release);
                return Err(e);
            }
        }
        Ok(added)
    }

    /// Remove every script, then add and enable everything currently in the
    /// scripts directory. Returns the number of scripts enabled.
    pub fn sync(&self) -> Result<usize> {
        let _lifecycle = self.inner.lifecycle.lock();
        for name in self.inner.sorted_names() {
            self.inner.remove_locked(&name);
        }

        let enabled = self
            .inner
            .scan()?
            .iter()
            .filter(|name| self.inner.add_locked(name, true).is_some())
            .count();
        tracing::info!("Synced scripts, {} enabled", enabled);
        Ok(enabled)
    }

    /// Apply one filesystem change: created scripts are added and enabled,
    /// modified ones are removed and re-added, removed ones are removed.
    /// Files without an allowed extension are ignored.
    ///
    /// Returns whether any script changed.
    pub fn handle_watch_event(&self, event: WatchEvent) -> bool {
        self.inner.handle_watch_event(event)
    }

    /// Start the background watcher over the scripts directory. Returns
    /// `Ok(false)` if already watching.
    #[cfg(feature = "watch")]
    pub fn start_watching(&self) -> Result<bool> {
        let mut slot = self.inner.watcher.lock();
        if slot.as_ref().map_or(false, |w| w.is_running()) {
            return Ok(false);
        }

        let dir = self.inner.config.scripts_dir.clone();
        std::fs::create_dir_all(&dir)?;

        let config = self.inner.config.clone();
        let filter = move |path: &Path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |name| config.is_script_name(name))
        };
        let manager = Arc::downgrade(&self.inner);
        let handler = move |event: WatchEvent| {
            if let Some(inner) = manager.upgrade() {
                inner.handle_watch_event(event);
            }
        };

        *slot = Some(ScriptWatcher::start(dir, self.inner.config.debounce, filter, handler)?);
        Ok(true)
    }

    /// Without the `watch` feature there is no watcher thread; hosts feed
    /// [`ScriptManager::handle_watch_event`] themselves.
    #[cfg(not(feature = "watch"))]
    pub fn start_watching(&self) -> Result<bool> {
        Err(Error::Config(
            "directory watching requires the `watch` feature".to_string(),
        ))
    }

    /// Stop the background watcher and wait for it. Returns false if it was
    /// not running.
    #[cfg(feature = "watch")]
    pub fn stop_watching(&self) -> bool {
        self.inner.stop_watching()
    }

    /// Check if the background watcher is running.
    #[cfg(feature = "watch")]
    pub fn is_watching(&self) -> bool {
        self.inner
            .watcher
            .lock()
            .as_ref()
            .map_or(false, |w| w.is_running())
    }

    /// Stop watching and remove every script. Returns how many were removed.
    /// Also runs when the last handle is dropped.
    pub fn shutdown(&self) -> usize {
        self.inner.shutdown()
    }
}

impl std::fmt::Debug for ScriptManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptManager")
            .field("config", &self.inner.config)
            .field("scripts", &self.len())
            .finish()
    }
}
