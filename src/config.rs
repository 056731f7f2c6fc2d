//! Task configuration model.
//!
//! Configs live under `[tool.foremon]` in a pyproject-style TOML document.
//! Typed fields are deserialized with serde; any other table-valued key
//! becomes a child config whose alias is the key, recursively. Unknown
//! scalar keys are rejected.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::ForemonError;
use crate::event::ChangeKind;
use crate::util::{expand_env_vars, signal_by_name};

pub const DEFAULT_IGNORES: &[&str] = &[
    // Some of these are redundant
    ".git/*",
    "__pycache__/*",
    ".*",
    ".tox/*",
    ".venv/*",
    ".pytest_cache/*",
];

pub const DEFAULT_EVENTS: &[ChangeKind] = &[ChangeKind::Modified, ChangeKind::Deleted];

/// Default debounce window in seconds.
pub const DEFAULT_DWELL: f64 = 0.1;

/// One task's configuration. `configs` holds nested child configurations.
#[derive(Debug, Clone)]
pub struct ForemonConfig {
    pub alias: String,
    // Script execution
    pub cwd: PathBuf,
    pub environment: HashMap<String, String>,
    pub returncode: i32,
    pub scripts: Vec<String>,
    pub term_signal: i32,
    // Change monitoring
    pub ignore_case: bool,
    pub ignore_defaults: Vec<String>,
    pub ignore_dirs: bool,
    pub ignore: Vec<String>,
    pub paths: Vec<String>,
    pub patterns: Vec<String>,
    pub recursive: bool,
    pub events: Vec<ChangeKind>,
    // Lifecycle
    pub skip: bool,
    pub order: u32,
    pub configs: Vec<ForemonConfig>,
}

impl Default for ForemonConfig {
    fn default() -> Self {
        ForemonConfig {
            alias: String::new(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            environment: HashMap::new(),
            returncode: 0,
            scripts: Vec::new(),
            term_signal: libc::SIGTERM,
            ignore_case: true,
            ignore_defaults: DEFAULT_IGNORES.iter().map(|s| s.to_string()).collect(),
            ignore_dirs: true,
            ignore: Vec::new(),
            paths: vec![".".to_string()],
            patterns: vec!["*".to_string()],
            recursive: true,
            events: DEFAULT_EVENTS.to_vec(),
            skip: false,
            order: 0,
            configs: Vec::new(),
        }
    }
}

impl ForemonConfig {
    /// Display name: the alias, or `default` for the root.
    pub fn name(&self) -> &str {
        if self.alias.is_empty() {
            "default"
        } else {
            &self.alias
        }
    }

    /// All configs in this subtree, ascending by `order`. Duplicate aliases
    /// are not deduplicated here; the monitor enforces uniqueness.
    pub fn get_configs(&self) -> Vec<&ForemonConfig> {
        let mut all = Vec::new();
        self.collect(&mut all);
        all.sort_by_key(|c| c.order);
        all
    }

    fn collect<'a>(&'a self, out: &mut Vec<&'a ForemonConfig>) {
        out.push(self);
        for child in &self.configs {
            child.collect(out);
        }
    }
}

/// Flattened command-line view, merged into the root config before task
/// materialization.
#[derive(Debug, Clone)]
pub struct Options {
    pub aliases: Vec<String>,
    pub config_file: PathBuf,
    pub cwd: Option<String>,
    pub dry_run: bool,
    pub ignore: Vec<String>,
    pub paths: Vec<String>,
    pub patterns: Vec<String>,
    pub no_guess: bool,
    pub scripts: Vec<String>,
    /// The trailing positional script; the only script command-guessing
    /// applies to.
    pub args: String,
    pub use_unsafe: bool,
    pub use_all: bool,
    pub verbose: bool,
    pub auto_reload: bool,
    pub dwell: f64,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            aliases: vec!["default".to_string()],
            config_file: default_config_file(),
            cwd: None,
            dry_run: false,
            ignore: Vec::new(),
            paths: Vec::new(),
            patterns: Vec::new(),
            no_guess: false,
            scripts: Vec::new(),
            args: String::new(),
            use_unsafe: false,
            use_all: false,
            verbose: false,
            auto_reload: true,
            dwell: DEFAULT_DWELL,
        }
    }
}

pub fn default_config_file() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("pyproject.toml")
}

/// The raw serde view of one config table. Typed fields are consumed here;
/// everything else lands in `rest` (order preserved) and must be a table,
/// which becomes a child config.
#[derive(Debug, Deserialize)]
struct RawConfig {
    alias: Option<String>,
    cwd: Option<String>,
    environment: Option<HashMap<String, String>>,
    returncode: Option<i32>,
    scripts: Option<Vec<String>>,
    term_signal: Option<toml::Value>,
    ignore_case: Option<bool>,
    ignore_defaults: Option<Vec<String>>,
    ignore_dirs: Option<bool>,
    ignore: Option<Vec<String>>,
    paths: Option<Vec<String>>,
    patterns: Option<Vec<String>>,
    recursive: Option<bool>,
    events: Option<Vec<ChangeKind>>,
    skip: Option<bool>,
    order: Option<u32>,
    #[serde(flatten)]
    rest: toml::Table,
}

/// Parse the `[tool.foremon]` section out of a pyproject-style document.
/// Returns `None` when the section is absent.
pub fn parse_project(text: &str) -> Result<Option<ForemonConfig>, ForemonError> {
    let value: toml::Value = toml::from_str(text)
        .map_err(|e| ForemonError::config(format!("config parse error: {e}")))?;

    let section = match value.get("tool").and_then(|t| t.get("foremon")) {
        Some(section) => section.clone(),
        None => return Ok(None),
    };

    if !section.is_table() {
        return Err(ForemonError::config(
            "[tool.foremon] must be a table".to_string(),
        ));
    }

    // The order counter is parse-local and restarts at zero so reloads
    // assign identical (alias, order) pairs.
    let mut counter: u32 = 0;
    let config = build_config(String::new(), section, &mut counter)?;
    Ok(Some(config))
}

fn build_config(
    alias: String,
    value: toml::Value,
    counter: &mut u32,
) -> Result<ForemonConfig, ForemonError> {
    let context = if alias.is_empty() {
        "[tool.foremon]".to_string()
    } else {
        format!("[tool.foremon.{alias}]")
    };

    let raw: RawConfig = value
        .try_into()
        .map_err(|e| ForemonError::config(format!("{context}: {e}")))?;

    let mut config = ForemonConfig {
        alias: raw.alias.unwrap_or(alias),
        ..ForemonConfig::default()
    };

    config.order = *counter;
    *counter += 1;

    if let Some(cwd) = raw.cwd.or_else(|| env_default("CWD")) {
        config.cwd = PathBuf::from(expand_env_vars(&cwd));
    }
    if let Some(env) = raw.environment {
        config.environment = env;
    }
    if let Some(rc) = raw.returncode {
        config.returncode = rc;
    } else if let Some(rc) = env_default("RETURNCODE") {
        config.returncode = rc
            .parse()
            .map_err(|_| ForemonError::config(format!("{context}: bad FOREMON_RETURNCODE")))?;
    }
    if let Some(scripts) = raw.scripts {
        config.scripts = scripts;
    } else if let Some(scripts) = env_default("SCRIPTS") {
        config.scripts = split_env_list(&scripts);
    }
    match raw.term_signal.or_else(|| env_default("TERM_SIGNAL").map(toml::Value::String)) {
        Some(value) => config.term_signal = parse_term_signal(&value, &context)?,
        None => {}
    }
    if let Some(v) = raw.ignore_case {
        config.ignore_case = v;
    }
    if let Some(v) = raw.ignore_defaults {
        config.ignore_defaults = v;
    }
    if let Some(v) = raw.ignore_dirs {
        config.ignore_dirs = v;
    }
    if let Some(v) = raw.ignore.or_else(|| env_default("IGNORE").map(|s| split_env_list(&s))) {
        config.ignore = v;
    }
    if let Some(v) = raw.paths.or_else(|| env_default("PATHS").map(|s| split_env_list(&s))) {
        config.paths = v;
    }
    if let Some(v) = raw
        .patterns
        .or_else(|| env_default("PATTERNS").map(|s| split_env_list(&s)))
    {
        config.patterns = v;
    }
    if let Some(v) = raw.recursive {
        config.recursive = v;
    }
    if let Some(v) = raw.events {
        config.events = v;
    }
    match raw.skip {
        Some(v) => config.skip = v,
        None => {
            if let Some(v) = env_default("SKIP") {
                config.skip = matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
            }
        }
    }
    if let Some(order) = raw.order {
        config.order = order;
    }

    // Entries in the watch lists go through environment expansion.
    for list in [&mut config.paths, &mut config.patterns, &mut config.ignore] {
        for item in list.iter_mut() {
            *item = expand_env_vars(item);
        }
    }

    // Whatever serde did not consume must be a nested child config.
    for (key, value) in raw.rest {
        if value.is_table() {
            let child = build_config(key, value, counter)?;
            config.configs.push(child);
        } else {
            return Err(ForemonError::config(format!(
                "{context}: unknown field `{key}`"
            )));
        }
    }

    Ok(config)
}

/// `term_signal` accepts an integer, a numeric string, or a `SIG*` name.
fn parse_term_signal(value: &toml::Value, context: &str) -> Result<i32, ForemonError> {
    let sig = match value {
        toml::Value::Integer(n) => *n as i32,
        toml::Value::String(s) => {
            let s = s.trim();
            if let Ok(n) = s.parse::<i32>() {
                n
            } else {
                signal_by_name(s).ok_or_else(|| {
                    ForemonError::config(format!("{context}: unknown signal `{s}`"))
                })?
            }
        }
        other => {
            return Err(ForemonError::config(format!(
                "{context}: term_signal must be a signal name or number, got {other:?}"
            )))
        }
    };
    if !(1..=64).contains(&sig) {
        return Err(ForemonError::config(format!(
            "{context}: term_signal {sig} out of range"
        )));
    }
    Ok(sig)
}

/// `FOREMON_*` environment variables supply defaults for absent fields.
fn env_default(field: &str) -> Option<String> {
    std::env::var(format!("FOREMON_{field}")).ok()
}

fn split_env_list(value: &str) -> Vec<String> {
    value
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Tests that set or observe FOREMON_* defaults must not interleave.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn parse(text: &str) -> ForemonConfig {
        parse_project(text).expect("parse").expect("section present")
    }

    #[test]
    fn missing_section_is_none() {
        assert!(parse_project("[tool.other]\nx = 1\n").unwrap().is_none());
        assert!(parse_project("").unwrap().is_none());
    }

    #[test]
    fn root_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let c = parse("[tool.foremon]\n");
        assert_eq!(c.name(), "default");
        assert_eq!(c.returncode, 0);
        assert_eq!(c.term_signal, libc::SIGTERM);
        assert_eq!(c.paths, vec!["."]);
        assert_eq!(c.patterns, vec!["*"]);
        assert_eq!(c.events, vec![ChangeKind::Modified, ChangeKind::Deleted]);
        assert!(c.recursive && c.ignore_dirs && c.ignore_case);
        assert!(!c.skip);
        assert_eq!(c.ignore_defaults.len(), DEFAULT_IGNORES.len());
    }

    #[test]
    fn nested_tables_become_children() {
        let c = parse(
            r#"
            [tool.foremon]
            scripts = ["true"]

            [tool.foremon.web]
            scripts = ["echo web"]

            [tool.foremon.web.assets]
            scripts = ["echo assets"]

            [tool.foremon.tests]
            scripts = ["echo tests"]
            skip = true
            "#,
        );
        assert_eq!(c.configs.len(), 2);
        assert_eq!(c.configs[0].alias, "web");
        assert_eq!(c.configs[0].configs[0].alias, "assets");
        assert_eq!(c.configs[1].alias, "tests");
        assert!(c.configs[1].skip);
    }

    #[test]
    fn order_follows_declaration_and_is_reload_stable() {
        let text = r#"
            [tool.foremon]
            scripts = ["true"]

            [tool.foremon.b]
            scripts = ["echo b"]

            [tool.foremon.a]
            scripts = ["echo a"]
        "#;
        let first: Vec<(String, u32)> = parse(text)
            .get_configs()
            .iter()
            .map(|c| (c.name().to_string(), c.order))
            .collect();
        let second: Vec<(String, u32)> = parse(text)
            .get_configs()
            .iter()
            .map(|c| (c.name().to_string(), c.order))
            .collect();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                ("default".to_string(), 0),
                ("b".to_string(), 1),
                ("a".to_string(), 2)
            ]
        );
    }

    #[test]
    fn explicit_order_overrides_counter() {
        let c = parse(
            r#"
            [tool.foremon]
            scripts = ["true"]

            [tool.foremon.late]
            order = 99
            scripts = ["echo late"]

            [tool.foremon.early]
            scripts = ["echo early"]
            "#,
        );
        let names: Vec<&str> = c.get_configs().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["default", "early", "late"]);
    }

    #[test]
    fn unknown_scalar_field_is_rejected() {
        let err = parse_project("[tool.foremon]\nbogus = 1\n").unwrap_err();
        assert!(err.message.contains("unknown field"), "{}", err.message);
        assert!(err.message.contains("bogus"));
    }

    #[test]
    fn term_signal_accepts_name_number_and_numeric_string() {
        let c = parse("[tool.foremon]\nterm_signal = \"SIGKILL\"\n");
        assert_eq!(c.term_signal, libc::SIGKILL);
        let c = parse("[tool.foremon]\nterm_signal = 2\n");
        assert_eq!(c.term_signal, 2);
        let c = parse("[tool.foremon]\nterm_signal = \"9\"\n");
        assert_eq!(c.term_signal, 9);

        let err = parse_project("[tool.foremon]\nterm_signal = \"SIGNOPE\"\n").unwrap_err();
        assert!(err.message.contains("unknown signal"));
        assert!(parse_project("[tool.foremon]\nterm_signal = 0\n").is_err());
    }

    #[test]
    fn watch_lists_are_env_expanded() {
        std::env::set_var("FOREMON_CFG_TEST_DIR", "/tmp/watchme");
        let c = parse("[tool.foremon]\npaths = [\"$FOREMON_CFG_TEST_DIR\"]\n");
        assert_eq!(c.paths, vec!["/tmp/watchme"]);
        std::env::remove_var("FOREMON_CFG_TEST_DIR");
    }

    #[test]
    fn environment_table_is_not_a_child_config() {
        let c = parse(
            r#"
            [tool.foremon]
            scripts = ["true"]

            [tool.foremon.environment]
            RUST_LOG = "debug"
            "#,
        );
        assert!(c.configs.is_empty());
        assert_eq!(c.environment.get("RUST_LOG").map(String::as_str), Some("debug"));
    }

    #[test]
    fn foremon_env_vars_provide_defaults() {
        let _env = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("FOREMON_RETURNCODE", "3");
        let c = parse("[tool.foremon]\nscripts = [\"true\"]\n");
        assert_eq!(c.returncode, 3);
        // Explicit values win over the environment.
        let c = parse("[tool.foremon]\nreturncode = 1\n");
        assert_eq!(c.returncode, 1);
        std::env::remove_var("FOREMON_RETURNCODE");
    }

    #[test]
    fn bad_events_value_is_a_config_error() {
        assert!(parse_project("[tool.foremon]\nevents = [\"exploded\"]\n").is_err());
    }

    #[test]
    fn duplicate_aliases_survive_parsing() {
        let c = parse(
            r#"
            [tool.foremon]
            scripts = ["true"]

            [tool.foremon.dup]
            scripts = ["echo one"]

            [tool.foremon.other]
            alias = "dup"
            scripts = ["echo two"]
            "#,
        );
        let dups = c
            .get_configs()
            .iter()
            .filter(|c| c.name() == "dup")
            .count();
        assert_eq!(dups, 2);
    }
}
