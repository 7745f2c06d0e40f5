//! Capability registries: per-script ownership of host resources.
//!
//! A [`CapabilityRegistry`] records every host resource one script asked
//! for and is the only thing that can give it back. The same registry type
//! is instantiated for commands, event listeners, and timers through the
//! [`Capability`] trait.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::host::{
    on_primary, Callback, CommandRequest, HostAdapter, HostHandle, ListenerRequest, TimerRequest,
};

/// Registry-local identifier handed to script code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw id.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Shared flag between a registry entry and the callback wrapper the host holds.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Whether the owning entry is still tracked.
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Wrap `callback` so firings after revocation are dropped.
    pub fn guard(&self, kind: &'static str, callback: Callback) -> Callback {
        let live = self.clone();
        Arc::new(move |args: &[Value]| {
            if !live.is_live() {
                tracing::debug!("Dropped firing of revoked {}", kind);
                return Ok(Value::Null);
            }
            callback(args)
        })
    }
}

/// A kind of host resource a script can own.
pub trait Capability: Send + Sync + 'static {
    /// What script code hands to [`CapabilityRegistry::register`].
    type Request: Send + 'static;

    /// Kind name used in errors and logs.
    const KIND: &'static str;

    /// Whether host calls for this kind must run on the primary thread.
    const PRIMARY_THREAD: bool = false;

    /// Check the request's required fields.
    fn validate(request: &Self::Request) -> Result<()>;

    /// Logical key the script asked for.
    fn key(request: &Self::Request, id: ResourceId) -> String;

    /// Route every callback in the request through `live`.
    fn guard(request: Self::Request, live: &Liveness) -> Self::Request;

    /// Create the resource on the host.
    fn create(host: &dyn HostAdapter, request: Self::Request) -> Result<HostHandle>;

    /// Remove the resource from the host.
    fn destroy(host: &dyn HostAdapter, handle: HostHandle) -> Result<()>;
}

/// Command capability.
#[derive(Debug)]
pub enum Commands {}

impl Capability for Commands {
    type Request = CommandRequest;
    const KIND: &'static str = "command";
    const PRIMARY_THREAD: bool = true;

    fn validate(request: &CommandRequest) -> Result<()> {
        let name = &request.spec.name;
        if name.is_empty() {
            return Err(Error::invalid_spec(Self::KIND, "name must not be empty"));
        }
        if name.chars().any(char::is_whitespace) {
            return Err(Error::invalid_spec(
                Self::KIND,
                format!("name '{}' contains whitespace", name),
            ));
        }
        if request.spec.aliases.iter().any(|a| a.trim().is_empty()) {
            return Err(Error::invalid_spec(Self::KIND, "aliases must not be empty"));
        }
        Ok(())
    }

    fn key(request: &CommandRequest, _id: ResourceId) -> String {
        request.spec.name.clone()
    }

    fn guard(mut request: CommandRequest, live: &Liveness) -> CommandRequest {
        request.executor = live.guard(Self::KIND, request.executor);
        request.tab_completer = request
            .tab_completer
            .map(|completer| live.guard(Self::KIND, completer));
        request
    }

    fn create(host: &dyn HostAdapter, request: CommandRequest) -> Result<HostHandle> {
        host.register_command(request)
    }

    fn destroy(host: &dyn HostAdapter, handle: HostHandle) -> Result<()> {
        host.unregister_command(handle)
    }
}

/// Event listener capability.
#[derive(Debug)]
pub enum Listeners {}

impl Capability for Listeners {
    type Request = ListenerRequest;
    const KIND: &'static str = "listener";

    fn validate(request: &ListenerRequest) -> Result<()> {
        if request.event_type.trim().is_empty() {
            return Err(Error::invalid_spec(Self::KIND, "event type must not be empty"));
        }
        Ok(())
    }

    fn key(request: &ListenerRequest, _id: ResourceId) -> String {
        request.event_type.clone()
    }

    fn guard(mut request: ListenerRequest, live: &Liveness) -> ListenerRequest {
        request.callback = live.guard(Self::KIND, request.callback);
        request
    }

    fn create(host: &dyn HostAdapter, request: ListenerRequest) -> Result<HostHandle> {
        host.register_event_listener(request)
    }

    fn destroy(host: &dyn HostAdapter, handle: HostHandle) -> Result<()> {
        host.unregister_event_listener(handle)
    }
}

/// Timer request as script code states it, in milliseconds.
#[derive(Clone)]
pub struct TimerSpec {
    /// Called on every firing.
    pub callback: Callback,
    /// Delay before the first firing.
    pub delay_ms: i64,
    /// Repeat period; `None` for one-shot.
    pub period_ms: Option<i64>,
}

impl TimerSpec {
    /// One-shot timer.
    pub fn timeout(callback: Callback, delay_ms: i64) -> Self {
        Self {
            callback,
            delay_ms,
            period_ms: None,
        }
    }

    /// Repeating timer whose period equals its initial delay.
    pub fn interval(callback: Callback, delay_ms: i64) -> Self {
        Self {
            callback,
            delay_ms,
            period_ms: Some(delay_ms),
        }
    }
}

impl fmt::Debug for TimerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSpec")
            .field("delay_ms", &self.delay_ms)
            .field("period_ms", &self.period_ms)
            .finish_non_exhaustive()
    }
}

/// Timer capability.
#[derive(Debug)]
pub enum Timers {}

impl Capability for Timers {
    type Request = TimerSpec;
    const KIND: &'static str = "timer";

    fn validate(request: &TimerSpec) -> Result<()> {
        if request.delay_ms < 0 {
            return Err(Error::invalid_spec(
                Self::KIND,
                format!("delay must be non-negative, got {}", request.delay_ms),
            ));
        }
        if let Some(period) = request.period_ms.filter(|p| *p < 0) {
            return Err(Error::invalid_spec(
                Self::KIND,
                format!("period must be non-negative, got {}", period),
            ));
        }
        Ok(())
    }

    fn key(_request: &TimerSpec, id: ResourceId) -> String {
        format!("timer-{}", id)
    }

    fn guard(mut request: TimerSpec, live: &Liveness) -> TimerSpec {
        request.callback = live.guard(Self::KIND, request.callback);
        request
    }

    fn create(host: &dyn HostAdapter, request: TimerSpec) -> Result<HostHandle> {
        // Validated non-negative before this point.
        let millis = |ms: i64| Duration::from_millis(ms.max(0) as u64);
        host.schedule_timer(TimerRequest {
            callback: request.callback,
            delay: millis(request.delay_ms),
            period: request.period_ms.map(millis),
        })
    }

    fn destroy(host: &dyn HostAdapter, handle: HostHandle) -> Result<()> {
        host.cancel_timer(handle)
    }
}

struct Entry {
    key: String,
    handle: HostHandle,
    live: Liveness,
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<ResourceId, Entry>,
    closed: bool,
}

/// Tracks the host resources of one kind owned by one script.
pub struct CapabilityRegistry<C: Capability> {
    owner: String,
    host: Arc<dyn HostAdapter>,
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    _kind: PhantomData<fn() -> C>,
}

/// Commands owned by one script.
pub type CommandRegistry = CapabilityRegistry<Commands>;
/// Event listeners owned by one script.
pub type EventRegistry = CapabilityRegistry<Listeners>;
/// Timers owned by one script.
pub type TimerRegistry = CapabilityRegistry<Timers>;

impl<C: Capability> CapabilityRegistry<C> {
    /// Create an empty registry for the script `owner`.
    pub fn new(owner: impl Into<String>, host: Arc<dyn HostAdapter>) -> Self {
        Self {
            owner: owner.into(),
            host,
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            _kind: PhantomData,
        }
    }

    /// Validate `request`, create it on the host, and track it.
    ///
    /// Nothing is tracked when this fails.
    pub fn register(&self, request: C::Request) -> Result<ResourceId> {
        if let Err(e) = C::validate(&request) {
            tracing::warn!(script = %self.owner, "Rejected {}: {}", C::KIND, e);
            return Err(e);
        }

        if self.state.lock().closed {
            return Err(Error::RegistryClosed(C::KIND));
        }

        let id = ResourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = C::key(&request, id);
        let live = Liveness::new();
        let request = C::guard(request, &live);

        let handle = match self.create(request) {
            Ok(handle) => handle,
            Err(e) => {
                live.revoke();
                let err = Error::host_registration(C::KIND, key, e);
                tracing::warn!(script = %self.owner, "{}", err);
                return Err(err);
            }
        };

        let mut state = self.state.lock();
        if state.closed {
            // Closed while the host was creating it.
            drop(state);
            live.revoke();
            if let Err(e) = self.destroy(handle) {
                tracing::warn!(
                    script = %self.owner,
                    "Failed to roll back {} '{}': {}",
                    C::KIND,
                    key,
                    e
                );
            }
            return Err(Error::RegistryClosed(C::KIND));
        }
        state.entries.insert(
            id,
            Entry {
                key: key.clone(),
                handle,
                live,
            },
        );
        drop(state);

        tracing::debug!(script = %self.owner, "Added {} '{}' ({})", C::KIND, key, handle);
        Ok(id)
    }

    /// Remove one resource. Returns false if `id` is not tracked.
    pub fn unregister(&self, id: ResourceId) -> bool {
        let entry = self.state.lock().entries.remove(&id);
        let Some(entry) = entry else {
            return false;
        };

        entry.live.revoke();
        match self.destroy(entry.handle) {
            Ok(()) => {
                tracing::debug!(script = %self.owner, "Removed {} '{}'", C::KIND, entry.key)
            }
            Err(e) => tracing::warn!(
                script = %self.owner,
                "Failed to remove {} '{}': {}",
                C::KIND,
                entry.key,
                e
            ),
        }
        true
    }

    /// Remove every tracked resource, attempting all of them even when some
    /// fail. Returns how many were tracked. A second call is a no-op.
    pub fn unregister_all(&self) -> usize {
        let entries = self.drain(false);
        self.teardown(entries)
    }

    /// Like [`CapabilityRegistry::unregister_all`], and refuse every later
    /// registration.
    pub fn close(&self) -> usize {
        let entries = self.drain(true);
        self.teardown(entries)
    }

    /// Whether [`CapabilityRegistry::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: ResourceId) -> bool {
        self.state.lock().entries.contains_key(&id)
    }

    /// Number of tracked resources.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Logical keys of tracked resources, in registration order.
    pub fn keys(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state.entries.iter().collect();
        entries.sort_by_key(|(id, _)| **id);
        entries.into_iter().map(|(_, e)| e.key.clone()).collect()
    }

    fn drain(&self, seal: bool) -> Vec<(ResourceId, Entry)> {
        let mut state = self.state.lock();
        if seal {
            state.closed = true;
        }
        let mut entries: Vec<_> = state.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    fn teardown(&self, entries: Vec<(ResourceId, Entry)>) -> usize {
        // Stop every firing before touching the host.
        for (_, entry) in &entries {
            entry.live.revoke();
        }

        let count = entries.len();
        let failures: Vec<(String, Error)> = entries
            .into_iter()
            .filter_map(|(_, entry)| self.destroy(entry.handle).err().map(|e| (entry.key, e)))
            .collect();

        for (key, e) in &failures {
            tracing::error!(script = %self.owner, "Failed to remove {} '{}': {}", C::KIND, key, e);
        }
        if count > 0 {
            tracing::debug!(
                script = %self.owner,
                "Removed {} {} resource(s), {} failure(s)",
                count,
                C::KIND,
                failures.len()
            );
        }
        count
    }

    fn create(&self, request: C::Request) -> Result<HostHandle> {
        if C::PRIMARY_THREAD {
            let host = self.host.clone();
            on_primary(&*self.host, move || C::create(&*host, request))?
        } else {
            C::create(&*self.host, request)
        }
    }

    fn destroy(&self, handle: HostHandle) -> Result<()> {
        if C::PRIMARY_THREAD {
            let host = self.host.clone();
            on_primary(&*self.host, move || C::destroy(&*host, handle))?
        } else {
            C::destroy(&*self.host, handle)
        }
    }
}

impl<C: Capability> fmt::Debug for CapabilityRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CapabilityRegistry")
            .field("kind", &C::KIND)
            .field("owner", &self.owner)
            .field("len", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// The three registries owned by one loaded script.
#[derive(Debug, Clone)]
pub struct Registries {
    /// Commands.
    pub commands: Arc<CommandRegistry>,
    /// Event listeners.
    pub events: Arc<EventRegistry>,
    /// Timers.
    pub timers: Arc<TimerRegistry>,
}

impl Registries {
    /// Fresh, empty registries for `owner`.
    pub fn new(owner: &str, host: Arc<dyn HostAdapter>) -> Self {
        Self {
            commands: Arc::new(CommandRegistry::new(owner, host.clone())),
            events: Arc::new(EventRegistry::new(owner, host.clone())),
            timers: Arc::new(TimerRegistry::new(owner, host)),
        }
    }

    /// Close all three: timers first, since a firing timer may use a
    /// listener or command, then listeners, then commands.
    pub fn close_all(&self) -> usize {
        self.timers.close() + self.events.close() + self.commands.close()
    }

    /// Total tracked resources.
    pub fn len(&self) -> usize {
        self.commands.len() + self.events.len() + self.timers.len()
    }

    /// Whether all three are empty.
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.events.is_empty() && self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{CommandSpec, Priority};
    use std::sync::atomic::AtomicUsize;

    /// Records every host call; fails registrations for names in `refuse`.
    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        refuse: Vec<String>,
        fail_removal: bool,
        next: AtomicU64,
        callbacks: Mutex<HashMap<HostHandle, Callback>>,
    }

    impl RecordingHost {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn fire(&self, handle: HostHandle) -> Option<Value> {
            let cb = self.callbacks.lock().get(&handle).cloned()?;
            cb(&[]).ok()
        }

        fn add(&self, label: String, cb: Callback) -> Result<HostHandle> {
            if self.refuse.contains(&label) {
                self.calls.lock().push(format!("refused {}", label));
                return Err(Error::host("refused"));
            }
            let handle = HostHandle::new(self.next.fetch_add(1, Ordering::SeqCst));
            self.calls.lock().push(format!("add {}", label));
            self.callbacks.lock().insert(handle, cb);
            Ok(handle)
        }

        fn remove(&self, kind: &str, handle: HostHandle) -> Result<()> {
            self.calls.lock().push(format!("remove {} {}", kind, handle.raw()));
            self.callbacks.lock().remove(&handle);
            if self.fail_removal {
                Err(Error::host("busy"))
            } else {
                Ok(())
            }
        }
    }

    impl HostAdapter for RecordingHost {
        fn register_command(&self, request: CommandRequest) -> Result<HostHandle> {
            self.add(request.spec.name.clone(), request.executor)
        }
        fn unregister_command(&self, handle: HostHandle) -> Result<()> {
            self.remove("command", handle)
        }
        fn register_event_listener(&self, request: ListenerRequest) -> Result<HostHandle> {
            self.add(request.event_type.clone(), request.callback)
        }
        fn unregister_event_listener(&self, handle: HostHandle) -> Result<()> {
            self.remove("listener", handle)
        }
        fn schedule_timer(&self, request: TimerRequest) -> Result<HostHandle> {
            self.add("timer".to_string(), request.callback)
        }
        fn cancel_timer(&self, handle: HostHandle) -> Result<()> {
            self.remove("timer", handle)
        }
        fn run_on_primary_thread(&self, task: Box<dyn FnOnce() + Send>) {
            task()
        }
        fn current_thread_is_primary(&self) -> bool {
            true
        }
    }

    fn noop() -> Callback {
        Arc::new(|_: &[Value]| Ok(Value::Null))
    }

    fn command(name: &str) -> CommandRequest {
        CommandRequest {
            spec: CommandSpec::named(name),
            executor: noop(),
            tab_completer: None,
        }
    }

    #[test]
    fn test_register_and_unregister() {
        let host = Arc::new(RecordingHost::default());
        let registry = CommandRegistry::new("a.rhai", host.clone());

        let id = registry.register(command("greet")).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.keys(), vec!["greet".to_string()]);

        assert!(registry.unregister(id));
        assert!(!registry.unregister(id));
        assert!(registry.is_empty());
        assert_eq!(host.calls(), vec!["add greet", "remove command 0"]);
    }

    #[test]
    fn test_invalid_specs_are_not_sent_to_host() {
        let host = Arc::new(RecordingHost::default());
        let commands = CommandRegistry::new("a.rhai", host.clone());
        let events = EventRegistry::new("a.rhai", host.clone());
        let timers = TimerRegistry::new("a.rhai", host.clone());

        assert!(matches!(commands.register(command("")), Err(Error::InvalidSpec { .. })));
        assert!(matches!(
            commands.register(command("two words")),
            Err(Error::InvalidSpec { .. })
        ));
        assert!(events
            .register(ListenerRequest {
                event_type: " ".to_string(),
                callback: noop(),
                priority: Priority::Normal,
            })
            .is_err());
        assert!(timers.register(TimerSpec::timeout(noop(), -1)).is_err());
        assert!(timers
            .register(TimerSpec {
                callback: noop(),
                delay_ms: 0,
                period_ms: Some(-5),
            })
            .is_err());

        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_host_failure_is_not_tracked() {
        let host = Arc::new(RecordingHost {
            refuse: vec!["x".to_string()],
            ..RecordingHost::default()
        });
        let registry = CommandRegistry::new("a.rhai", host.clone());

        let err = registry.register(command("x")).unwrap_err();
        assert!(matches!(err, Error::HostRegistrationFailed { .. }));
        assert!(err.is_recoverable());

        registry.register(command("y")).unwrap();
        assert_eq!(registry.unregister_all(), 1);
        assert_eq!(host.calls(), vec!["refused x", "add y", "remove command 0"]);
    }

    #[test]
    fn test_unregister_all_is_idempotent_and_best_effort() {
        let host = Arc::new(RecordingHost {
            fail_removal: true,
            ..RecordingHost::default()
        });
        let registry = EventRegistry::new("a.rhai", host.clone());
        for event_type in ["join", "quit", "chat"] {
            registry
                .register(ListenerRequest {
                    event_type: event_type.to_string(),
                    callback: noop(),
                    priority: Priority::Normal,
                })
                .unwrap();
        }

        assert_eq!(registry.unregister_all(), 3);
        assert!(registry.is_empty());
        assert_eq!(registry.unregister_all(), 0);
        assert!(registry.is_empty());

        let removals = host.calls().iter().filter(|c| c.starts_with("remove")).count();
        assert_eq!(removals, 3);
    }

    #[test]
    fn test_unregister_forgets_id_when_host_fails() {
        let host = Arc::new(RecordingHost {
            fail_removal: true,
            ..RecordingHost::default()
        });
        let registry = CommandRegistry::new("a.rhai", host.clone());
        let id = registry.register(command("sticky")).unwrap();
        let kept = registry.register(command("kept")).unwrap();

        assert!(registry.unregister(id));
        assert!(!registry.contains(id));
        assert!(registry.contains(kept));
        assert_eq!(registry.keys(), vec!["kept".to_string()]);

        assert!(!registry.unregister(id));
        let removals = host.calls().iter().filter(|c| c.starts_with("remove")).count();
        assert_eq!(removals, 1);
    }

    #[test]
    fn test_revoked_callbacks_do_not_fire() {
        let host = Arc::new(RecordingHost::default());
        let registry = TimerRegistry::new("a.rhai", host.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let callback: Callback = Arc::new(move |_: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        registry.register(TimerSpec::interval(callback, 10)).unwrap();

        // Keep the host-side wrapper alive past removal, as an in-flight firing would.
        let stale = host.callbacks.lock().get(&HostHandle::new(0)).cloned().unwrap();
        assert!(host.fire(HostHandle::new(0)).is_some());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        registry.unregister_all();
        stale(&[]).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_registry_refuses_registration() {
        let host = Arc::new(RecordingHost::default());
        let registries = Registries::new("a.rhai", host.clone());
        registries.commands.register(command("a")).unwrap();
        registries.timers.register(TimerSpec::timeout(noop(), 5)).unwrap();

        assert_eq!(registries.close_all(), 2);
        assert!(registries.is_empty());
        assert!(matches!(
            registries.commands.register(command("b")),
            Err(Error::RegistryClosed("command"))
        ));

        // Timers are removed before commands.
        let calls = host.calls();
        let timer = calls.iter().position(|c| c.starts_with("remove timer")).unwrap();
        let cmd = calls.iter().position(|c| c.starts_with("remove command")).unwrap();
        assert!(timer < cmd);
    }
}
