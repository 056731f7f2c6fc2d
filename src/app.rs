//! Application lifecycle: load configuration, materialize tasks, drive the
//! monitor to completion, and hot-reload when the config file changes.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::config::{default_config_file, parse_project, ForemonConfig, Options};
use crate::display::{
    display_debug, display_info, display_success, display_warning,
};
use crate::errors::ForemonError;
use crate::monitor::Monitor;
use crate::task::{AppControl, ForemonTask};
use crate::util::{guess_script, relative_if_cwd};

pub const AUTO_RELOAD_ALIAS: &str = "foremon-auto-reload";

pub struct Foremon {
    options: Options,
    monitor: Arc<Monitor>,
    config: Mutex<ForemonConfig>,
    read_stdin: AtomicBool,
    self_weak: Weak<Foremon>,
}

impl Foremon {
    /// Must be called from within the runtime (the monitor starts its
    /// debounce loop immediately).
    pub fn new(options: Options) -> Arc<Foremon> {
        Arc::new_cyclic(|weak| Foremon {
            monitor: Monitor::new(options.dwell),
            config: Mutex::new(ForemonConfig::default()),
            read_stdin: AtomicBool::new(true),
            self_weak: weak.clone(),
            options,
        })
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn tasks(&self) -> Vec<Arc<ForemonTask>> {
        self.monitor.all_tasks()
    }

    pub fn get_task(&self, name: &str) -> Option<Arc<ForemonTask>> {
        self.monitor.get_task(name)
    }

    /// Detach stdin; tests drive the monitor directly.
    pub fn set_pipe(&self, read_stdin: bool) {
        self.read_stdin.store(read_stdin, Ordering::SeqCst);
    }

    /// Load `self.config` from the config file and fold the command-line
    /// options into the default (root) config.
    pub fn load_config(&self) -> Result<(), ForemonError> {
        self.load_config_file()?;
        self.extend_default_config();
        Ok(())
    }

    fn load_config_file(&self) -> Result<(), ForemonError> {
        let config_file = &self.options.config_file;
        let explicit = *config_file != default_config_file();

        if !config_file.exists() {
            if explicit {
                return Err(ForemonError::path_missing(format!(
                    "cannot find config file {}",
                    config_file.display()
                )));
            }
            *self.lock_config() = ForemonConfig::default();
            return Ok(());
        }

        let text = std::fs::read_to_string(config_file).map_err(|e| {
            ForemonError::config(format!(
                "cannot read config file {}: {e}",
                config_file.display()
            ))
        })?;

        let shown = relative_if_cwd(config_file);
        match parse_project(&text)? {
            Some(config) => {
                display_success(format!(
                    "loaded [tool.foremon] config from {}",
                    shown.display()
                ));
                *self.lock_config() = config;
            }
            None => {
                display_debug(format!(
                    "no [tool.foremon] section specified in {}",
                    shown.display()
                ));
                *self.lock_config() = ForemonConfig::default();
            }
        }
        Ok(())
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, ForemonConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Options merge into the root config: `-x` scripts verbatim, the
    /// trailing positional through command-guessing (unless disabled),
    /// `--unsafe` clearing the default ignores, and the watch overrides.
    fn extend_default_config(&self) {
        let mut config = self.lock_config();
        let o = &self.options;

        config.scripts.extend(o.scripts.iter().cloned());
        if !o.args.is_empty() {
            let script = if o.no_guess {
                o.args.clone()
            } else {
                guess_script(&o.args, &mut config.environment)
            };
            config.scripts.push(script);
        }

        if o.use_unsafe {
            config.ignore_defaults.clear();
        }
        if let Some(cwd) = &o.cwd {
            config.cwd = PathBuf::from(cwd);
        }
        if !o.ignore.is_empty() {
            config.ignore = o.ignore.clone();
        }
        if !o.paths.is_empty() {
            config.paths = o.paths.clone();
        }
        if !o.patterns.is_empty() {
            config.patterns = o.patterns.clone();
        }
    }

    /// Run until the monitor exits. Returns the process exit code.
    pub async fn run_forever(self: &Arc<Self>) -> Result<i32, ForemonError> {
        self.load_config()?;
        self.reset_monitor()?;

        if self.monitor.all_tasks().is_empty() {
            display_warning("no scripts or executable specified, nothing to do ...");
            return Ok(2);
        }

        if self.options.dry_run {
            display_success("dry run complete");
            return Ok(0);
        }

        self.monitor.start_interactive(true).await;
        self.monitor.terminate_tasks();
        Ok(0)
    }

    /// Clear the monitor and register the currently-active tasks, plus the
    /// auto-reload pseudo-task when enabled.
    pub fn reset_monitor(self: &Arc<Self>) -> Result<(), ForemonError> {
        self.monitor.reset();
        self.monitor.set_pipe(self.read_stdin.load(Ordering::SeqCst));

        for task in self.make_tasks() {
            self.attach_trigger_logger(&task);
            self.monitor.add_task(Arc::clone(&task))?;
            display_debug(format!("task {} ready for monitor", task.name()));
        }

        if !self.monitor.all_tasks().is_empty() && self.options.auto_reload {
            self.monitor.add_task(self.new_reload_task())?;
        }
        Ok(())
    }

    /// Materialize tasks from the config tree.
    ///
    /// The default task is active unless its scripts list is empty. A task
    /// named with `-a` is always included, overriding `skip`; `--all`
    /// includes every non-skipped task.
    fn make_tasks(&self) -> Vec<Arc<ForemonTask>> {
        let configs: Vec<ForemonConfig> = self
            .lock_config()
            .get_configs()
            .into_iter()
            .cloned()
            .collect();
        let aliases = &self.options.aliases;
        let use_all = self.options.use_all;

        let mut tasks = Vec::new();
        for mut config in configs {
            let name = config.name().to_string();

            if config.scripts.is_empty() {
                display_debug(format!("task {name} was skipped because scripts is empty"));
                continue;
            }
            if aliases.contains(&name) {
                // Override skip when `-a` names the task explicitly.
                config.skip = false;
                tasks.push(Arc::new(ForemonTask::script(config)));
                continue;
            }
            if use_all && !config.skip {
                tasks.push(Arc::new(ForemonTask::script(config)));
                continue;
            }
            if config.skip {
                display_debug(format!("task {name} is skipped"));
            }
        }
        tasks
    }

    fn attach_trigger_logger(&self, task: &Arc<ForemonTask>) {
        let verbose = self.options.verbose;
        task.add_before_callback(Box::new(move |_task, ev| {
            if verbose {
                if let Some(ev) = ev {
                    display_info(format!(
                        "triggered because {} was {}",
                        relative_if_cwd(&ev.path).display(),
                        ev.kind
                    ));
                }
            }
            Ok(())
        }));
    }

    /// A pseudo-task watching the config file's directory for the config
    /// file itself; firing re-parses everything.
    fn new_reload_task(self: &Arc<Self>) -> Arc<ForemonTask> {
        let config_file = &self.options.config_file;
        let dir = config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let base = config_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pyproject.toml".to_string());

        let config = ForemonConfig {
            alias: AUTO_RELOAD_ALIAS.to_string(),
            paths: vec![dir.display().to_string()],
            patterns: vec![base],
            ..ForemonConfig::default()
        };

        let control: Weak<dyn AppControl> = {
            let strong: Arc<dyn AppControl> = self.clone() as Arc<dyn AppControl>;
            Arc::downgrade(&strong)
        };
        Arc::new(ForemonTask::reload(config, control))
    }
}

impl AppControl for Foremon {
    /// Pause events, rebuild everything from the config file, then queue
    /// every task for an initial run.
    fn reload(&self) -> anyhow::Result<()> {
        let this = self
            .self_weak
            .upgrade()
            .ok_or_else(|| anyhow::anyhow!("application is shutting down"))?;

        {
            let _pause = this.monitor.paused();
            this.monitor.reset();
            this.load_config()?;
            this.reset_monitor()?;
        }
        this.monitor.queue_all_tasks();
        Ok(())
    }

    fn request_exit(&self) {
        self.monitor.request_exit();
    }
}
