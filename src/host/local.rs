//! In-process host with its own command table, listener table, timer wheel,
//! and a dedicated primary thread.
//!
//! Timers run on a virtual clock driven by [`LocalHost::advance`], which lets
//! an embedding application tick them from its own loop and lets tests fire
//! them deterministically.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{
    Callback, CommandRequest, HostAdapter, HostHandle, ListenerRequest, Priority, TimerRequest,
};
use crate::error::{Error, Result};

/// Smallest repeat period; shorter periods are rounded up so a single
/// `advance` call always terminates.
const MIN_PERIOD: Duration = Duration::from_millis(1);

type Task = Box<dyn FnOnce() + Send>;

struct Command {
    request: CommandRequest,
}

#[derive(Default)]
struct CommandTable {
    by_handle: HashMap<HostHandle, Command>,
    /// Name and alias lookup.
    labels: HashMap<String, HostHandle>,
}

struct Listener {
    event_type: String,
    priority: Priority,
    callback: Callback,
}

struct Timer {
    callback: Callback,
    fire_at: Duration,
    period: Option<Duration>,
}

#[derive(Default)]
struct TimerWheel {
    now: Duration,
    timers: BTreeMap<HostHandle, Timer>,
}

impl TimerWheel {
    /// Pop the earliest due timer, rescheduling it if it repeats.
    fn next_due(&mut self) -> Option<(HostHandle, Callback)> {
        let (handle, _) = self
            .timers
            .iter()
            .filter(|(_, t)| t.fire_at <= self.now)
            .min_by_key(|(h, t)| (t.fire_at, **h))?;
        let handle = *handle;

        let timer = self.timers.get_mut(&handle)?;
        let callback = timer.callback.clone();
        match timer.period {
            Some(period) => timer.fire_at += period.max(MIN_PERIOD),
            None => {
                self.timers.remove(&handle);
            }
        }
        Some((handle, callback))
    }
}

/// A self-contained [`HostAdapter`].
pub struct LocalHost {
    next_handle: AtomicU64,
    commands: Mutex<CommandTable>,
    listeners: Mutex<BTreeMap<HostHandle, Listener>>,
    timers: Mutex<TimerWheel>,
    primary_id: ThreadId,
    primary_tx: Option<mpsc::Sender<Task>>,
    primary_thread: Option<JoinHandle<()>>,
}

impl LocalHost {
    /// Create a host and start its primary thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel::<Task>();
        let worker = thread::Builder::new()
            .name("host-primary".to_string())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .ok();

        // Without a primary thread the caller's thread takes the role.
        let primary_id = worker
            .as_ref()
            .map(|t| t.thread().id())
            .unwrap_or_else(|| thread::current().id());
        if worker.is_none() {
            tracing::warn!("Failed to spawn host primary thread, using the creating thread");
        }

        Self {
            next_handle: AtomicU64::new(1),
            commands: Mutex::new(CommandTable::default()),
            listeners: Mutex::new(BTreeMap::new()),
            timers: Mutex::new(TimerWheel::default()),
            primary_id,
            primary_tx: worker.as_ref().map(|_| tx),
            primary_thread: worker,
        }
    }

    fn next_handle(&self) -> HostHandle {
        HostHandle::new(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn require_primary(&self, op: &str) -> Result<()> {
        if self.current_thread_is_primary() {
            Ok(())
        } else {
            Err(Error::host(format!("{} must run on the primary thread", op)))
        }
    }

    /// Run a command by name or alias. `sender` identifies who ran it.
    pub fn dispatch_command(&self, label: &str, sender: Value, args: &[&str]) -> Result<Value> {
        let executor = {
            let table = self.commands.lock();
            let handle = table
                .labels
                .get(label)
                .ok_or_else(|| Error::host(format!("unknown command: {}", label)))?;
            table
                .by_handle
                .get(handle)
                .map(|c| c.request.executor.clone())
                .ok_or_else(|| Error::host(format!("unknown command: {}", label)))?
        };

        executor(&[sender, json!(label), json!(args)])
    }

    /// Ask a command for completions. Commands without a completer yield none.
    pub fn complete_command(
        &self,
        label: &str,
        sender: Value,
        args: &[&str],
    ) -> Result<Vec<String>> {
        let completer = {
            let table = self.commands.lock();
            let handle = table
                .labels
                .get(label)
                .ok_or_else(|| Error::host(format!("unknown command: {}", label)))?;
            table
                .by_handle
                .get(handle)
                .and_then(|c| c.request.tab_completer.clone())
        };

        let Some(completer) = completer else {
            return Ok(Vec::new());
        };

        let value = completer(&[sender, json!(label), json!(args)])?;
        serde_json::from_value(value).map_err(|e| Error::host(format!("bad completions: {}", e)))
    }

    /// Deliver an event to every listener of `event_type`, lowest priority
    /// first. Returns the number of listeners that ran successfully.
    pub fn fire_event(&self, event_type: &str, event: Value) -> usize {
        let mut targets: Vec<(Priority, HostHandle, Callback)> = self
            .listeners
            .lock()
            .iter()
            .filter(|(_, l)| l.event_type == event_type)
            .map(|(h, l)| (l.priority, *h, l.callback.clone()))
            .collect();
        targets.sort_by_key(|(p, h, _)| (*p, *h));

        let mut delivered = 0;
        for (_, handle, callback) in targets {
            match callback(std::slice::from_ref(&event)) {
                Ok(_) => delivered += 1,
                Err(e) => tracing::warn!(
                    "Listener {} for {} failed: {}",
                    handle,
                    event_type,
                    e
                ),
            }
        }
        delivered
    }

    /// Move the virtual clock forward and fire every timer that came due,
    /// in due order. Returns the number of firings.
    pub fn advance(&self, by: Duration) -> usize {
        self.timers.lock().now += by;

        let mut fired = 0;
        loop {
            // Lock released before the callback so it may schedule or cancel.
            let due = self.timers.lock().next_due();
            let Some((handle, callback)) = due else {
                break;
            };
            fired += 1;
            if let Err(e) = callback(&[]) {
                tracing::warn!("Timer {} failed: {}", handle, e);
            }
        }
        fired
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.timers.lock().now
    }

    /// Whether a command name or alias is registered.
    pub fn has_command(&self, label: &str) -> bool {
        self.commands.lock().labels.contains_key(label)
    }

    /// Number of registered commands.
    pub fn command_count(&self) -> usize {
        self.commands.lock().by_handle.len()
    }

    /// Number of listeners for an event type.
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners
            .lock()
            .values()
            .filter(|l| l.event_type == event_type)
            .count()
    }

    /// Number of scheduled timers.
    pub fn timer_count(&self) -> usize {
        self.timers.lock().timers.len()
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostAdapter for LocalHost {
    fn register_command(&self, request: CommandRequest) -> Result<HostHandle> {
        self.require_primary("register_command")?;

        let mut table = self.commands.lock();
        let labels: Vec<String> = std::iter::once(request.spec.name.clone())
            .chain(request.spec.aliases.iter().cloned())
            .collect();
        if let Some(taken) = labels.iter().find(|l| table.labels.contains_key(*l)) {
            return Err(Error::host(format!("command '{}' is already registered", taken)));
        }

        let handle = self.next_handle();
        for label in labels {
            table.labels.insert(label, handle);
        }
        table.by_handle.insert(handle, Command { request });
        Ok(handle)
    }

    fn unregister_command(&self, handle: HostHandle) -> Result<()> {
        self.require_primary("unregister_command")?;

        let mut table = self.commands.lock();
        if table.by_handle.remove(&handle).is_none() {
            return Err(Error::host(format!("unknown command handle {}", handle)));
        }
        table.labels.retain(|_, h| *h != handle);
        Ok(())
    }

    fn register_event_listener(&self, request: ListenerRequest) -> Result<HostHandle> {
        let handle = self.next_handle();
        self.listeners.lock().insert(
            handle,
            Listener {
                event_type: request.event_type,
                priority: request.priority,
                callback: request.callback,
            },
        );
        Ok(handle)
    }

    fn unregister_event_listener(&self, handle: HostHandle) -> Result<()> {
        self.listeners
            .lock()
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Error::host(format!("unknown listener handle {}", handle)))
    }

    fn schedule_timer(&self, request: TimerRequest) -> Result<HostHandle> {
        let handle = self.next_handle();
        let mut wheel = self.timers.lock();
        let fire_at = wheel.now + request.delay;
        wheel.timers.insert(
            handle,
            Timer {
                callback: request.callback,
                fire_at,
                period: request.period,
            },
        );
        Ok(handle)
    }

    fn cancel_timer(&self, handle: HostHandle) -> Result<()> {
        // Fired one-shots are already gone.
        self.timers.lock().timers.remove(&handle);
        Ok(())
    }

    fn run_on_primary_thread(&self, task: Box<dyn FnOnce() + Send>) {
        if self.current_thread_is_primary() {
            task();
            return;
        }

        let Some(tx) = &self.primary_tx else {
            task();
            return;
        };

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let wrapped: Task = Box::new(move || {
            task();
            let _ = done_tx.send(());
        });

        if tx.send(wrapped).is_err() {
            tracing::error!("Host primary thread is gone; task dropped");
            return;
        }
        // Err means the task was dropped unrun; on_primary reports that.
        let _ = done_rx.recv();
    }

    fn current_thread_is_primary(&self) -> bool {
        thread::current().id() == self.primary_id
    }
}

impl std::fmt::Debug for LocalHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalHost")
            .field("commands", &self.command_count())
            .field("listeners", &self.listeners.lock().len())
            .field("timers", &self.timer_count())
            .field("now", &self.now())
            .finish()
    }
}

impl Drop for LocalHost {
    fn drop(&mut self) {
        self.primary_tx = None;
        if let Some(worker) = self.primary_thread.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{on_primary, CommandSpec};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counter_callback(counter: &Arc<AtomicUsize>) -> Callback {
        let counter = counter.clone();
        Arc::new(move |_args: &[Value]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        })
    }

    #[test]
    fn test_commands_require_primary_thread() {
        let host = Arc::new(LocalHost::new());
        let request = CommandRequest {
            spec: CommandSpec::named("hello"),
            executor: Arc::new(|_: &[Value]| Ok(json!(true))),
            tab_completer: None,
        };

        assert!(host.register_command(request.clone()).is_err());
        assert_eq!(host.command_count(), 0);

        let h = host.clone();
        let registered = on_primary(&*host, move || h.register_command(request)).unwrap();
        assert!(registered.is_ok());
        assert!(host.has_command("hello"));
    }

    #[test]
    fn test_run_on_primary_thread_blocks_until_done() {
        let host = Arc::new(LocalHost::new());
        assert!(!host.current_thread_is_primary());

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let host_clone = host.clone();
        host.run_on_primary_thread(Box::new(move || {
            assert!(host_clone.current_thread_is_primary());
            seen_clone.store(1, Ordering::SeqCst);
        }));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_table() {
        let host = Arc::new(LocalHost::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let request = CommandRequest {
            spec: CommandSpec {
                name: "greet".to_string(),
                aliases: vec!["hi".to_string()],
                ..CommandSpec::default()
            },
            executor: counter_callback(&calls),
            tab_completer: None,
        };

        let h = host.clone();
        let handle = on_primary(&*host, move || h.register_command(request))
            .unwrap()
            .unwrap();

        assert!(host.has_command("greet"));
        assert!(host.has_command("hi"));
        host.dispatch_command("hi", json!("console"), &["a"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(host.complete_command("greet", json!("console"), &[]).unwrap().is_empty());

        let h = host.clone();
        on_primary(&*host, move || h.unregister_command(handle))
            .unwrap()
            .unwrap();
        assert!(!host.has_command("greet"));
        assert!(!host.has_command("hi"));
        assert!(host.dispatch_command("greet", json!("console"), &[]).is_err());
    }

    #[test]
    fn test_duplicate_command_rejected() {
        let host = Arc::new(LocalHost::new());
        let make = |name: &str| CommandRequest {
            spec: CommandSpec::named(name),
            executor: Arc::new(|_: &[Value]| Ok(Value::Null)),
            tab_completer: None,
        };

        let (h, first) = (host.clone(), make("x"));
        assert!(on_primary(&*host, move || h.register_command(first))
            .unwrap()
            .is_ok());
        let (h, second) = (host.clone(), make("x"));
        assert!(on_primary(&*host, move || h.register_command(second))
            .unwrap()
            .is_err());
        assert_eq!(host.command_count(), 1);
    }

    #[test]
    fn test_listener_priority_order() {
        let host = LocalHost::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let listeners = [
            ("high", Priority::High),
            ("low", Priority::Low),
            ("normal", Priority::Normal),
        ];
        for (tag, priority) in listeners {
            let order = order.clone();
            host.register_event_listener(ListenerRequest {
                event_type: "join".to_string(),
                callback: Arc::new(move |_: &[Value]| {
                    order.lock().push(tag);
                    Ok(Value::Null)
                }),
                priority,
            })
            .unwrap();
        }

        assert_eq!(host.fire_event("join", json!({"player": "steve"})), 3);
        assert_eq!(*order.lock(), vec!["low", "normal", "high"]);
        assert_eq!(host.fire_event("quit", Value::Null), 0);
    }

    #[test]
    fn test_timer_wheel() {
        let host = LocalHost::new();
        let once = Arc::new(AtomicUsize::new(0));
        let every = Arc::new(AtomicUsize::new(0));

        host.schedule_timer(TimerRequest {
            callback: counter_callback(&once),
            delay: Duration::from_millis(50),
            period: None,
        })
        .unwrap();
        let repeating = host
            .schedule_timer(TimerRequest {
                callback: counter_callback(&every),
                delay: Duration::from_millis(10),
                period: Some(Duration::from_millis(10)),
            })
            .unwrap();

        assert_eq!(host.advance(Duration::from_millis(5)), 0);
        host.advance(Duration::from_millis(45));
        assert_eq!(once.load(Ordering::SeqCst), 1);
        assert_eq!(every.load(Ordering::SeqCst), 5);
        assert_eq!(host.timer_count(), 1);

        host.cancel_timer(repeating).unwrap();
        host.advance(Duration::from_millis(100));
        assert_eq!(every.load(Ordering::SeqCst), 5);
        assert_eq!(host.timer_count(), 0);
    }
}
