//! The monitor owns the filesystem observer, the task set, and the cradle.
//!
//! Everything schedules onto one current-thread tokio runtime. The notify
//! watcher runs on its own thread and is the only foreign producer; it hands
//! matched events to the debouncer over a channel, and the debouncer drains
//! back into the run-queue. Each queued run starts executing as soon as it
//! is enqueued; the cradle joins the runs strictly in FIFO order. Starting
//! runs eagerly is what makes the active-set guard meaningful (a run that
//! begins while its task is still busy drops itself) and lets different
//! tasks interleave at their suspension points instead of queuing behind
//! one long-running batch.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ForemonConfig;
use crate::debounce::Debouncer;
use crate::display::{
    display_debug, display_error, display_error_with, display_info, display_success,
    display_warning,
};
use crate::errors::ForemonError;
use crate::event::{change_events, ChangeEvent, ChangeKind};
use crate::task::ForemonTask;

enum CradleItem {
    /// An already-running task run, joined by the cradle.
    Run(JoinHandle<()>),
    /// The null sentinel; terminates the cradle.
    Stop,
}

/// A glob pattern split on `/`, matched right-anchored against the trailing
/// components of a path (the way watchdog-style handlers match `*.py` or
/// `.git/*` against absolute event paths).
struct CompiledPattern {
    components: Vec<glob::Pattern>,
}

impl CompiledPattern {
    fn new(pattern: &str) -> Result<Self, ForemonError> {
        let components = pattern
            .split('/')
            .filter(|c| !c.is_empty())
            .map(glob::Pattern::new)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ForemonError::config(format!("bad pattern `{pattern}`: {e}")))?;
        Ok(CompiledPattern { components })
    }

    fn matches(&self, path: &Path, options: glob::MatchOptions) -> bool {
        if self.components.is_empty() {
            return false;
        }
        let parts: Vec<String> = path
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(p) => Some(p.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        if self.components.len() > parts.len() {
            return false;
        }
        let tail = &parts[parts.len() - self.components.len()..];
        self.components
            .iter()
            .zip(tail)
            .all(|(pat, part)| pat.matches_with(part, options))
    }
}

/// Per-task event filter: subscribed kinds, patterns, and ignore globs.
pub struct EventFilter {
    patterns: Vec<CompiledPattern>,
    ignore: Vec<CompiledPattern>,
    options: glob::MatchOptions,
    ignore_dirs: bool,
    events: Vec<ChangeKind>,
}

impl EventFilter {
    pub fn new(config: &ForemonConfig) -> Result<Self, ForemonError> {
        let compile = |list: &[String]| -> Result<Vec<CompiledPattern>, ForemonError> {
            list.iter().map(|p| CompiledPattern::new(p)).collect()
        };
        let mut ignore = compile(&config.ignore)?;
        ignore.extend(compile(&config.ignore_defaults)?);

        let options = glob::MatchOptions {
            case_sensitive: !config.ignore_case,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };

        Ok(EventFilter {
            patterns: compile(&config.patterns)?,
            ignore,
            options,
            ignore_dirs: config.ignore_dirs,
            events: config.events.clone(),
        })
    }

    pub fn matches(&self, ev: &ChangeEvent) -> bool {
        if !self.events.contains(&ev.kind) {
            return false;
        }
        if self.ignore_dirs && ev.path.is_dir() {
            return false;
        }
        if !self.patterns.iter().any(|p| p.matches(&ev.path, self.options)) {
            return false;
        }
        !self.ignore.iter().any(|p| p.matches(&ev.path, self.options))
    }
}

struct TaskWatch {
    task: Arc<ForemonTask>,
    filter: EventFilter,
}

pub struct Monitor {
    watches: Arc<Mutex<Vec<TaskWatch>>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    /// Tasks with a run in flight, keyed by task identity.
    active: Mutex<HashSet<usize>>,
    debouncer: Debouncer,
    queue_tx: UnboundedSender<CradleItem>,
    queue_rx: Mutex<Option<UnboundedReceiver<CradleItem>>>,
    read_stdin: AtomicBool,
    is_terminating: AtomicBool,
    is_paused: AtomicBool,
    observer_alive: AtomicBool,
}

/// While held, the monitor drops all new task events.
pub struct PauseGuard {
    monitor: Arc<Monitor>,
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        self.monitor.is_paused.store(false, Ordering::SeqCst);
    }
}

impl Monitor {
    /// Build a monitor and start its debounce drain loop. Must be called
    /// from within the runtime.
    pub fn new(dwell: f64) -> Arc<Monitor> {
        Arc::new_cyclic(|weak: &Weak<Monitor>| {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();

            let drain_target = weak.clone();
            let debouncer = Debouncer::spawn(
                dwell,
                Box::new(move |task, ev| {
                    if let Some(monitor) = drain_target.upgrade() {
                        monitor.queue_task_event(task, Some(ev));
                    }
                }),
            );

            Monitor {
                watches: Arc::new(Mutex::new(Vec::new())),
                watcher: Mutex::new(None),
                active: Mutex::new(HashSet::new()),
                debouncer,
                queue_tx,
                queue_rx: Mutex::new(Some(queue_rx)),
                read_stdin: AtomicBool::new(false),
                is_terminating: AtomicBool::new(false),
                is_paused: AtomicBool::new(false),
                observer_alive: AtomicBool::new(false),
            }
        })
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_terminating(&self) -> bool {
        self.is_terminating.load(Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    /// Attach (or detach) the interactive stdin command source.
    pub fn set_pipe(&self, read_stdin: bool) {
        self.read_stdin.store(read_stdin, Ordering::SeqCst);
    }

    /// Snapshot of the registered tasks.
    pub fn all_tasks(&self) -> Vec<Arc<ForemonTask>> {
        Self::lock(&self.watches)
            .iter()
            .map(|w| Arc::clone(&w.task))
            .collect()
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<ForemonTask>> {
        Self::lock(&self.watches)
            .iter()
            .find(|w| w.task.name() == name)
            .map(|w| Arc::clone(&w.task))
    }

    /// Register a task and schedule its paths with the observer.
    ///
    /// Fails on a duplicate alias, and when none of the configured paths
    /// exists. Missing paths are warned about and dropped.
    pub fn add_task(self: &Arc<Self>, task: Arc<ForemonTask>) -> Result<(), ForemonError> {
        let name = task.name().to_string();
        if Self::lock(&self.watches).iter().any(|w| w.task.name() == name) {
            return Err(ForemonError::duplicate_task(format!(
                "duplicate task alias: {name}"
            )));
        }

        let config = task.config();
        let mut existing: Vec<PathBuf> = Vec::new();
        for path in &config.paths {
            let p = PathBuf::from(path);
            if p.exists() {
                existing.push(p);
            } else {
                display_warning(format!("cannot watch {path}"));
            }
        }
        if existing.is_empty() {
            return Err(ForemonError::path_missing(
                "cannot find watch paths, nothing to do ...",
            ));
        }

        let filter = EventFilter::new(config)?;
        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        {
            let mut slot = Self::lock(&self.watcher);
            if slot.is_none() {
                *slot = Some(self.make_watcher().map_err(|e| {
                    ForemonError::new(format!("cannot start observer: {e}"), 1)
                })?);
            }
            let watcher = slot.as_mut().expect("observer present");
            let mut watched = 0usize;
            for path in &existing {
                match watcher.watch(path, mode) {
                    Ok(()) => watched += 1,
                    Err(e) => display_warning(format!("cannot watch {}: {e}", path.display())),
                }
            }
            if watched == 0 {
                return Err(ForemonError::path_missing(
                    "cannot find watch paths, nothing to do ...",
                ));
            }
        }

        Self::lock(&self.watches).push(TaskWatch { task, filter });
        Ok(())
    }

    /// The observer callback runs on the watcher's own thread; matching
    /// happens there and delivery crosses into the scheduler through the
    /// debouncer channel.
    fn make_watcher(&self) -> notify::Result<RecommendedWatcher> {
        let watches = Arc::clone(&self.watches);
        let debouncer = self.debouncer.clone();

        notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!(error = %e, "observer error");
                    return;
                }
            };
            let changes = change_events(&event);
            if changes.is_empty() {
                return;
            }
            let watches = watches.lock().unwrap_or_else(|e| e.into_inner());
            for change in changes {
                for watch in watches.iter() {
                    if watch.filter.matches(&change) {
                        debouncer.submit(Arc::clone(&watch.task), change.clone());
                    }
                }
            }
        })
    }

    /// Turn a task event into a run. Dropped while terminating or paused.
    ///
    /// The run is spawned immediately so it overlaps any run already in
    /// flight (that is what the active-set check in `run_task` arbitrates);
    /// the enqueued handle only gives the cradle FIFO join order.
    pub fn queue_task_event(self: &Arc<Self>, task: Arc<ForemonTask>, ev: Option<ChangeEvent>) {
        if self.is_terminating() || self.is_paused() {
            debug!(task = task.name(), "event dropped (terminating or paused)");
            return;
        }
        if ev.is_some() {
            display_success("restarting due to changes...");
        }

        let monitor = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            if let Some(monitor) = monitor.upgrade() {
                monitor.run_task(task, ev).await;
            }
        });
        let _ = self.queue_tx.send(CradleItem::Run(handle));
    }

    /// Enqueue a run for every registered task.
    pub fn queue_all_tasks(self: &Arc<Self>) {
        for task in self.all_tasks() {
            self.queue_task_event(task, None);
        }
    }

    /// At most one concurrent run per task: events arriving while the task
    /// runs are dropped, not queued behind it. The set is keyed by task
    /// identity, so a reloaded task is not suppressed by its predecessor.
    async fn run_task(&self, task: Arc<ForemonTask>, ev: Option<ChangeEvent>) {
        let key = Arc::as_ptr(&task) as usize;
        {
            let mut active = Self::lock(&self.active);
            if active.contains(&key) || task.running() {
                display_debug(format!("task {} busy - skipping restart", task.name()));
                return;
            }
            active.insert(key);
        }

        let result = task.run(ev.as_ref()).await;
        Self::lock(&self.active).remove(&key);

        if let Err(e) = result {
            display_error_with(format!("fatal error from task {}", task.name()), &e);
        }
    }

    /// Scoped pause: new task events are dropped while the guard lives.
    pub fn paused(self: &Arc<Self>) -> PauseGuard {
        self.is_paused.store(true, Ordering::SeqCst);
        PauseGuard {
            monitor: Arc::clone(self),
        }
    }

    /// Unschedule every observer handler and clear the task set.
    pub fn reset(&self) {
        *Self::lock(&self.watcher) = None;
        Self::lock(&self.watches).clear();
    }

    /// Send each task's terminal signal to its current child. Idempotent.
    pub fn terminate_tasks(&self) {
        for task in self.all_tasks() {
            task.terminate();
        }
    }

    /// Interactive command dispatch. Recognized prefixes, case-insensitive:
    /// `rs`/`restart` and `\q`/`quit`/`exit`.
    pub fn handle_input(self: &Arc<Self>, line: &str) {
        let line = line.trim().to_lowercase();

        if ["rs", "restart"].iter().any(|p| line.starts_with(p)) {
            self.terminate_tasks();
            self.queue_all_tasks();
            return;
        }
        if ["\\q", "quit", "exit"].iter().any(|p| line.starts_with(p)) {
            self.request_exit();
        }
    }

    /// Graceful shutdown: stop accepting events, wake the cradle with the
    /// sentinel, stop the observer.
    pub fn request_exit(&self) {
        display_info("stopping ...");
        self.is_terminating.store(true, Ordering::SeqCst);
        let _ = self.queue_tx.send(CradleItem::Stop);
        *Self::lock(&self.watcher) = None;
    }

    /// The cradle: join the already-running queued runs in FIFO order until
    /// the sentinel arrives. Returns false when there is nothing to
    /// supervise, the observer is already running, or the monitor is
    /// shutting down.
    pub async fn start_interactive(self: &Arc<Self>, run_on_start: bool) -> bool {
        if Self::lock(&self.watches).is_empty() || self.is_terminating() {
            return false;
        }
        if self.observer_alive.swap(true, Ordering::SeqCst) {
            return false;
        }
        let mut rx = match Self::lock(&self.queue_rx).take() {
            Some(rx) => rx,
            None => return false,
        };

        if run_on_start {
            self.queue_all_tasks();
        }
        if self.read_stdin.load(Ordering::SeqCst) {
            self.spawn_stdin_reader();
        }
        self.spawn_signal_handlers();

        loop {
            match rx.recv().await {
                Some(CradleItem::Run(handle)) => {
                    if let Err(e) = handle.await {
                        display_error(format!("fatal error, shutting down\n{e}"));
                        break;
                    }
                }
                Some(CradleItem::Stop) | None => break,
            }
        }

        self.is_terminating.store(true, Ordering::SeqCst);
        *Self::lock(&self.watcher) = None;
        self.observer_alive.store(false, Ordering::SeqCst);
        true
    }

    fn spawn_stdin_reader(self: &Arc<Self>) {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(monitor) = monitor.upgrade() else { break };
                        monitor.handle_input(&line);
                        if monitor.is_terminating() {
                            break;
                        }
                    }
                    // EOF on the pipe stops the supervisor, like ^D.
                    Ok(None) | Err(_) => {
                        if let Some(monitor) = monitor.upgrade() {
                            if !monitor.is_terminating() {
                                monitor.request_exit();
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    /// SIGINT and SIGTERM terminate children first (so their exits classify
    /// as deliberate) and then take the graceful quit path.
    fn spawn_signal_handlers(self: &Arc<Self>) {
        use tokio::signal::unix::{signal, SignalKind};

        for kind in [SignalKind::interrupt(), SignalKind::terminate()] {
            let monitor = Arc::downgrade(self);
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        if stream.recv().await.is_some() {
                            if let Some(monitor) = monitor.upgrade() {
                                monitor.terminate_tasks();
                                if !monitor.is_terminating() {
                                    monitor.request_exit();
                                }
                            }
                        }
                    });
                }
                Err(e) => warn!(error = %e, "cannot install signal handler"),
            }
        }
    }
}
