//! File system watcher for script hot reload.
//!
//! [`WatchEvent`] is the input of [`ScriptManager::handle_watch_event`]
//! and is always available. The `notify`-backed [`ScriptWatcher`] thread
//! that produces it requires the `watch` feature.
//!
//! [`ScriptManager::handle_watch_event`]: crate::ScriptManager::handle_watch_event

use std::path::{Path, PathBuf};

/// A change to a file in the scripts directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A file appeared.
    Created {
        /// Path to the created file.
        path: PathBuf,
    },
    /// A file's content changed.
    Modified {
        /// Path to the modified file.
        path: PathBuf,
    },
    /// A file disappeared.
    Removed {
        /// Path to the removed file.
        path: PathBuf,
    },
    /// A file was renamed.
    Renamed {
        /// Old path.
        from: PathBuf,
        /// New path.
        to: PathBuf,
    },
}

impl WatchEvent {
    /// Get the primary path for this event.
    pub fn path(&self) -> &Path {
        match self {
            Self::Created { path } | Self::Modified { path } | Self::Removed { path } => path,
            Self::Renamed { to, .. } => to,
        }
    }
}

#[cfg(feature = "watch")]
pub use self::background::ScriptWatcher;

#[cfg(feature = "watch")]
mod background {
    use std::collections::HashMap;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, RecvTimeoutError};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use notify::event::{ModifyKind, RenameMode};
    use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

    use super::WatchEvent;
    use crate::error::{Error, Result};

    enum Message {
        Fs(notify::Result<Event>),
        Shutdown,
    }

    /// How a burst of raw events for one path started.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Origin {
        Created,
        Changed,
    }

    struct Pending {
        origin: Origin,
        last: Instant,
    }

    /// Split a raw notification into per-path events.
    fn translate(event: Event) -> Vec<WatchEvent> {
        let mut paths = event.paths.into_iter();
        match event.kind {
            EventKind::Create(_) => paths.map(|path| WatchEvent::Created { path }).collect(),
            EventKind::Remove(_) => paths.map(|path| WatchEvent::Removed { path }).collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => vec![
                        WatchEvent::Removed { path: from },
                        WatchEvent::Created { path: to },
                    ],
                    (Some(path), None) => vec![WatchEvent::Modified { path }],
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                paths.map(|path| WatchEvent::Removed { path }).collect()
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                paths.map(|path| WatchEvent::Created { path }).collect()
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
            EventKind::Modify(_) => paths.map(|path| WatchEvent::Modified { path }).collect(),
            _ => Vec::new(),
        }
    }

    /// Coalesces bursts of raw events per path and reports the net change
    /// once the path has been quiet for the debounce period.
    struct Debouncer {
        quiet: Duration,
        pending: HashMap<PathBuf, Pending>,
    }

    impl Debouncer {
        fn new(quiet: Duration) -> Self {
            Self {
                quiet,
                pending: HashMap::new(),
            }
        }

        fn push(&mut self, event: WatchEvent, now: Instant) {
            let origin = match event {
                WatchEvent::Created { .. } => Origin::Created,
                _ => Origin::Changed,
            };
            let path = event.path().to_path_buf();
            self.pending
                .entry(path)
                .and_modify(|p| p.last = now)
                .or_insert(Pending { origin, last: now });
        }

        /// Time until the earliest pending path is due.
        fn next_deadline(&self, now: Instant) -> Option<Duration> {
            self.pending
                .values()
                .map(|p| (p.last + self.quiet).saturating_duration_since(now))
                .min()
        }

        fn drain_due(&mut self, now: Instant) -> Vec<WatchEvent> {
            let due: Vec<PathBuf> = self
                .pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.last) >= self.quiet)
                .map(|(path, _)| path.clone())
                .collect();

            let mut events: Vec<WatchEvent> = due
                .into_iter()
                .filter_map(|path| {
                    let pending = self.pending.remove(&path)?;
                    Some(if !path.exists() {
                        WatchEvent::Removed { path }
                    } else if pending.origin == Origin::Created {
                        WatchEvent::Created { path }
                    } else {
                        WatchEvent::Modified { path }
                    })
                })
                .collect();
            events.sort_by(|a, b| a.path().cmp(b.path()));
            events
        }
    }

    /// Background thread that watches one directory and reports debounced
    /// [`WatchEvent`]s to a handler.
    pub struct ScriptWatcher {
        dir: PathBuf,
        running: Arc<AtomicBool>,
        tx: mpsc::Sender<Message>,
        thread: Option<JoinHandle<()>>,
    }

    impl ScriptWatcher {
        /// Watch `dir` (non-recursively). Events whose path fails `filter`
        /// are ignored; the rest reach `handler` on the watcher thread.
        pub fn start<P, F>(
            dir: impl Into<PathBuf>,
            debounce: Duration,
            filter: P,
            handler: F,
        ) -> Result<Self>
        where
            P: Fn(&Path) -> bool + Send + 'static,
            F: Fn(WatchEvent) + Send + 'static,
        {
            let dir = dir.into();
            let (tx, rx) = mpsc::channel::<Message>();

            let fs_tx = tx.clone();
            let mut watcher = RecommendedWatcher::new(
                move |res: notify::Result<Event>| {
                    let _ = fs_tx.send(Message::Fs(res));
                },
                Config::default(),
            )
            .map_err(|e| Error::Watch(e.to_string()))?;
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|e| Error::Watch(format!("{}: {}", dir.display(), e)))?;

            let running = Arc::new(AtomicBool::new(true));
            let flag = running.clone();
            let thread = thread::Builder::new()
                .name("script-watcher".to_string())
                .spawn(move || {
                    // Owned by the thread so notifications stop when it exits.
                    let _watcher = watcher;
                    run(rx, &flag, Debouncer::new(debounce), filter, handler);
                    flag.store(false, Ordering::Release);
                })?;

            tracing::info!("Started watching {}", dir.display());
            Ok(Self {
                dir,
                running,
                tx,
                thread: Some(thread),
            })
        }

        /// Check if the watcher thread is still running.
        pub fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }

        /// Stop the thread and wait for it, unless called from the thread
        /// itself. Returns false if it was already stopped.
        pub fn stop(&mut self) -> bool {
            let Some(thread) = self.thread.take() else {
                return false;
            };

            self.running.store(false, Ordering::Release);
            let _ = self.tx.send(Message::Shutdown);

            if thread.thread().id() != thread::current().id() && thread.join().is_err() {
                tracing::error!("Script watcher thread panicked");
            }
            tracing::info!("Stopped watching {}", self.dir.display());
            true
        }
    }

    fn run<P, F>(
        rx: mpsc::Receiver<Message>,
        running: &AtomicBool,
        mut debouncer: Debouncer,
        filter: P,
        handler: F,
    ) where
        P: Fn(&Path) -> bool,
        F: Fn(WatchEvent),
    {
        loop {
            let message = match debouncer.next_deadline(Instant::now()) {
                Some(wait) => rx.recv_timeout(wait),
                None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };

            match message {
                Ok(Message::Fs(Ok(event))) => {
                    let now = Instant::now();
                    for event in translate(event) {
                        if filter(event.path()) {
                            debouncer.push(event, now);
                        } else {
                            tracing::debug!("Ignored change to {}", event.path().display());
                        }
                    }
                }
                Ok(Message::Fs(Err(e))) => tracing::warn!("Watch error: {}", e),
                Ok(Message::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }

            if !running.load(Ordering::Acquire) {
                break;
            }

            for event in debouncer.drain_due(Instant::now()) {
                handler(event);
            }
        }
    }

    impl std::fmt::Debug for ScriptWatcher {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("ScriptWatcher")
                .field("dir", &self.dir)
                .field("running", &self.is_running())
                .finish()
        }
    }

    impl Drop for ScriptWatcher {
        fn drop(&mut self) {
            self.stop();
        }
    }

}
