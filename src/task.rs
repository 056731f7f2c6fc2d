//! Task lifecycle: one config, one optional live child, serial script batch.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Weak};

use tokio::process::Command;
use tracing::debug;

use crate::config::ForemonConfig;
use crate::display::{
    display_error, display_error_with, display_info, display_success, display_warning,
};
use crate::event::ChangeEvent;
use crate::guard;
use crate::util::relative_if_cwd;

/// Hooks observe a run; errors are logged and never abort the run.
pub type Hook = Box<dyn Fn(&ForemonTask, Option<&ChangeEvent>) -> anyhow::Result<()> + Send + Sync>;

/// The capability the auto-reload task holds into the application. The task
/// keeps only a weak handle so it never extends the application's lifetime.
pub trait AppControl: Send + Sync {
    fn reload(&self) -> anyhow::Result<()>;
    fn request_exit(&self);
}

enum TaskKind {
    /// Run the config's script batch.
    Scripts,
    /// Re-parse configuration instead of spawning children.
    Reload(Weak<dyn AppControl>),
}

#[derive(Default)]
struct RunState {
    running: bool,
    child_pid: Option<u32>,
    pending_signals: Vec<i32>,
}

/// A named unit of work bound to one configuration.
///
/// At most one child of a task is alive at any instant; a `run` while a run
/// is in flight returns immediately (the monitor additionally coalesces
/// restarts through its active set).
pub struct ForemonTask {
    config: ForemonConfig,
    kind: TaskKind,
    state: Mutex<RunState>,
    run_count: AtomicU64,
    before: Mutex<Vec<Hook>>,
    after: Mutex<Vec<Hook>>,
}

impl ForemonTask {
    pub fn script(config: ForemonConfig) -> Self {
        Self::with_kind(config, TaskKind::Scripts)
    }

    pub fn reload(config: ForemonConfig, control: Weak<dyn AppControl>) -> Self {
        Self::with_kind(config, TaskKind::Reload(control))
    }

    fn with_kind(config: ForemonConfig, kind: TaskKind) -> Self {
        ForemonTask {
            config,
            kind,
            state: Mutex::new(RunState::default()),
            run_count: AtomicU64::new(0),
            before: Mutex::new(Vec::new()),
            after: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &ForemonConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn running(&self) -> bool {
        self.lock_state().running
    }

    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::Relaxed)
    }

    pub fn add_before_callback(&self, hook: Hook) {
        self.before.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    pub fn add_after_callback(&self, hook: Hook) {
        self.after.lock().unwrap_or_else(|e| e.into_inner()).push(hook);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append `sig` to the pending list and forward it to the current
    /// child, if any. A vanished child is not an error.
    pub fn send_signal(&self, sig: i32) {
        let pid = {
            let mut state = self.lock_state();
            match state.child_pid {
                Some(pid) => {
                    state.pending_signals.push(sig);
                    pid
                }
                None => return,
            }
        };
        guard::kill_pid(pid, sig, false);
    }

    /// Send the config's terminal signal to the current child.
    pub fn terminate(&self) {
        self.send_signal(self.config.term_signal);
    }

    /// Classify a child's exit: `(exit_ok, should_continue)`.
    pub fn process_returncode(&self, returncode: i32) -> (bool, bool) {
        if self.config.returncode == returncode {
            return (true, true);
        }

        // Deaths by signal surface as -SIGNAL.
        if returncode < 0 {
            let sig = -returncode;
            let is_pending = self.lock_state().pending_signals.contains(&sig);
            if is_pending && sig == self.config.term_signal {
                // good exit, but do not continue
                return (true, false);
            }
            if is_pending {
                return (true, true);
            }
        }

        // An unexpected signal or exit code; the batch must not continue.
        (false, false)
    }

    /// Run the task once. Returns immediately when a run is in flight.
    pub async fn run(&self, trigger: Option<&ChangeEvent>) -> anyhow::Result<()> {
        {
            let mut state = self.lock_state();
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.pending_signals.clear();
        }
        self.run_count.fetch_add(1, Ordering::Relaxed);

        self.run_hooks(&self.before, trigger, "pre");
        let result = match &self.kind {
            TaskKind::Scripts => self.run_batch().await,
            TaskKind::Reload(control) => self.run_reload(trigger, control),
        };
        self.run_hooks(&self.after, trigger, "post");

        self.lock_state().running = false;
        result
    }

    fn run_hooks(&self, hooks: &Mutex<Vec<Hook>>, trigger: Option<&ChangeEvent>, stage: &str) {
        let hooks = hooks.lock().unwrap_or_else(|e| e.into_inner());
        for hook in hooks.iter() {
            if let Err(e) = hook(self, trigger) {
                display_error_with(format!("encountered {stage} run error"), &e);
            }
        }
    }

    /// Execute the scripts serially. Any unexpected exit code or signal
    /// stops the batch.
    async fn run_batch(&self) -> anyhow::Result<()> {
        for script in &self.config.scripts {
            display_success(format!("starting `{script}`"));

            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c")
                .arg(script)
                .current_dir(&self.config.cwd)
                .envs(&self.config.environment)
                .stdin(Stdio::null())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit());
            // Children get their own process group so the guard can reach
            // descendants of the shell.
            unsafe {
                cmd.pre_exec(|| {
                    libc::setpgid(0, 0);
                    Ok(())
                });
            }

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    display_error_with("exec error", &e.into());
                    return Ok(());
                }
            };

            let pid = child.id().unwrap_or(0);
            if pid != 0 {
                guard::register_pid(pid, self.config.term_signal);
                self.lock_state().child_pid = Some(pid);
            }
            debug!(task = self.name(), pid, script = %script, "child started");

            let status = child.wait().await;

            self.lock_state().child_pid = None;
            if pid != 0 {
                guard::unregister_pid(pid);
            }

            let returncode = match status {
                Ok(status) => exit_code(&status),
                Err(e) => {
                    display_error_with("exec error", &e.into());
                    return Ok(());
                }
            };
            debug!(task = self.name(), pid, returncode, "child exited");

            let (exit_ok, should_continue) = self.process_returncode(returncode);
            if exit_ok && should_continue {
                continue;
            }
            if !exit_ok {
                display_error(format!(
                    "app crashed {returncode} - waiting for file changes before restart"
                ));
            } else {
                display_warning(format!("terminated {pid} - `{script}`"));
            }
            return Ok(());
        }

        display_success("clean exit - waiting for changes before restart");
        Ok(())
    }

    /// The auto-reload body: ignore the initial (trigger-less) run, then
    /// hand control back to the application.
    fn run_reload(
        &self,
        trigger: Option<&ChangeEvent>,
        control: &Weak<dyn AppControl>,
    ) -> anyhow::Result<()> {
        let Some(ev) = trigger else {
            return Ok(());
        };
        display_info(format!(
            "config {} was {}, reloading ...",
            relative_if_cwd(&ev.path).display(),
            ev.kind
        ));
        if let Some(control) = control.upgrade() {
            if let Err(e) = control.reload() {
                display_error_with("fatal error, stopping", &e);
                control.request_exit();
            }
        }
        Ok(())
    }
}

/// Python-style exit disposition: the code, or -SIGNAL for a signal death.
fn exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| -status.signal().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::capture;
    use std::sync::Arc;
    use std::time::Duration;

    fn config_with(scripts: &[&str]) -> ForemonConfig {
        ForemonConfig {
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
            ..ForemonConfig::default()
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn runs_one_script_to_clean_exit() {
        let out = capture::install();
        let task = ForemonTask::script(config_with(&["echo Hello"]));
        task.run(None).await.unwrap();

        assert!(out.contains("starting `echo Hello`"));
        assert!(out.contains("clean exit - waiting for changes before restart"));
        assert_eq!(task.run_count(), 1);
        assert!(!task.running());
    }

    #[tokio::test]
    async fn runs_scripts_in_order() {
        let out = capture::install();
        let task = ForemonTask::script(config_with(&["true", "echo second"]));
        task.run(None).await.unwrap();

        let text = out.text();
        let first = text.find("starting `true`").expect("first script");
        let second = text.find("starting `echo second`").expect("second script");
        assert!(first < second);
        assert!(out.contains("clean exit"));
    }

    #[tokio::test]
    async fn unexpected_returncode_crashes_batch() {
        let out = capture::install();
        let config = ForemonConfig {
            returncode: 1,
            ..config_with(&["true", "echo never"])
        };
        let task = ForemonTask::script(config);
        task.run(None).await.unwrap();

        assert!(out.contains("app crashed 0 - waiting for file changes before restart"));
        assert!(!out.contains("starting `echo never`"));
        assert!(!out.contains("clean exit"));
    }

    #[tokio::test]
    async fn expected_nonzero_returncode_is_clean() {
        let out = capture::install();
        let config = ForemonConfig {
            returncode: 1,
            ..config_with(&["false"])
        };
        let task = ForemonTask::script(config);
        task.run(None).await.unwrap();

        assert!(out.contains("clean exit"));
        assert!(!out.contains("app crashed"));
    }

    #[tokio::test]
    async fn terminate_stops_batch_without_error() {
        let out = capture::install();
        let task = Arc::new(ForemonTask::script(config_with(&["sleep 10", "echo never"])));

        let runner = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.run(None).await })
        };
        wait_until(|| task.running() && task.lock_state().child_pid.is_some()).await;
        task.terminate();
        runner.await.unwrap().unwrap();

        assert!(out.contains("terminated"));
        assert!(!out.contains("app crashed"));
        assert!(!out.contains("starting `echo never`"));
    }

    #[tokio::test]
    async fn external_kill_is_a_crash() {
        let out = capture::install();
        let task = Arc::new(ForemonTask::script(config_with(&["sleep 10"])));

        let runner = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.run(None).await })
        };
        wait_until(|| task.lock_state().child_pid.is_some()).await;
        let pid = task.lock_state().child_pid.unwrap();
        // Not sent through the task, so the signal is not pending.
        guard::kill_pid(pid, libc::SIGKILL, false);
        runner.await.unwrap().unwrap();

        assert!(out.contains("app crashed -9"));
    }

    #[tokio::test]
    async fn second_run_while_running_returns_immediately() {
        let out = capture::install();
        let task = Arc::new(ForemonTask::script(config_with(&["sleep 10"])));

        let runner = {
            let task = Arc::clone(&task);
            tokio::spawn(async move { task.run(None).await })
        };
        wait_until(|| task.running()).await;
        task.run(None).await.unwrap();
        assert_eq!(task.run_count(), 1);

        task.terminate();
        runner.await.unwrap().unwrap();
        assert_eq!(out.text().matches("starting `sleep 10`").count(), 1);
    }

    #[tokio::test]
    async fn hook_errors_are_contained() {
        let out = capture::install();
        let task = ForemonTask::script(config_with(&["true"]));
        task.add_before_callback(Box::new(|_, _| anyhow::bail!("hook exploded")));
        task.run(None).await.unwrap();

        assert!(out.contains("encountered pre run error"));
        assert!(out.contains("clean exit"));
    }

    #[tokio::test]
    async fn hooks_see_the_trigger() {
        let _out = capture::install();
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let task = ForemonTask::script(config_with(&["true"]));
        {
            let seen = Arc::clone(&seen);
            task.add_after_callback(Box::new(move |_, ev| {
                seen.lock()
                    .unwrap()
                    .push(ev.map(|e| e.kind.to_string()).unwrap_or_default());
                Ok(())
            }));
        }

        let ev = ChangeEvent::new("/tmp/trigger", crate::event::ChangeKind::Modified);
        task.run(Some(&ev)).await.unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), ["modified"]);
    }

    #[test]
    fn returncode_classification_matrix() {
        let config = ForemonConfig {
            returncode: 0,
            term_signal: libc::SIGTERM,
            ..ForemonConfig::default()
        };
        let task = ForemonTask::script(config);

        // Expected code always continues.
        assert_eq!(task.process_returncode(0), (true, true));

        // Pending terminal signal: good exit, stop the batch.
        task.lock_state().pending_signals.push(libc::SIGTERM);
        assert_eq!(task.process_returncode(-libc::SIGTERM), (true, false));

        // Pending non-terminal signal: good exit, keep going.
        task.lock_state().pending_signals.push(libc::SIGUSR1);
        assert_eq!(task.process_returncode(-libc::SIGUSR1), (true, true));

        // Unexpected signal or exit code.
        assert_eq!(task.process_returncode(-libc::SIGKILL), (false, false));
        assert_eq!(task.process_returncode(3), (false, false));
    }

    #[tokio::test]
    async fn reload_task_ignores_initial_run() {
        struct Probe(Mutex<u32>);
        impl AppControl for Probe {
            fn reload(&self) -> anyhow::Result<()> {
                *self.0.lock().unwrap() += 1;
                Ok(())
            }
            fn request_exit(&self) {}
        }

        let _out = capture::install();
        let probe = Arc::new(Probe(Mutex::new(0)));
        let control: Arc<dyn AppControl> = probe.clone();
        let task = ForemonTask::reload(ForemonConfig::default(), Arc::downgrade(&control));

        task.run(None).await.unwrap();
        assert_eq!(*probe.0.lock().unwrap(), 0);

        let ev = ChangeEvent::new("/tmp/pyproject.toml", crate::event::ChangeKind::Modified);
        task.run(Some(&ev)).await.unwrap();
        assert_eq!(*probe.0.lock().unwrap(), 1);
    }
}
