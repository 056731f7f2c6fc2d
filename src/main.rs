//! foremon — entry point.
//!
//! User-facing messages go through the display sink; tracing diagnostics go
//! to stderr behind an env-filter.

use clap::{ArgAction, Parser};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use foremon::app::Foremon;
use foremon::config::{default_config_file, Options, DEFAULT_DWELL};
use foremon::display::{display_error, set_display_verbose};

#[derive(Debug, Parser)]
#[command(name = "foremon")]
#[command(about = "Run scripts and restart them when watched files change.")]
struct Cli {
    /// Path to file config.
    #[arg(short = 'f', long = "config-file", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// File extensions to watch.
    #[arg(short = 'e', long = "ext", value_name = "GLOB", action = ArgAction::Append)]
    ext: Vec<String>,

    /// File or directory paths to watch for changes.
    #[arg(short = 'w', long = "watch", value_name = "PATH", action = ArgAction::Append)]
    watch: Vec<String>,

    /// File or directory patterns to ignore.
    #[arg(short = 'i', long = "ignore", value_name = "GLOB", action = ArgAction::Append)]
    ignore: Vec<String>,

    /// Show details on what is causing restarts.
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Script to execute.
    #[arg(short = 'x', long = "exec", value_name = "SCRIPT", action = ArgAction::Append)]
    exec: Vec<String>,

    /// Do not apply the default ignore list (.git, __pycache__/, etc...).
    #[arg(short = 'u', long = "unsafe")]
    use_unsafe: bool,

    /// Do not try to run commands as a script or module.
    #[arg(short = 'n', long = "no-guess")]
    no_guess: bool,

    /// Change to this directory before starting.
    #[arg(short = 'C', long = "chdir", value_name = "DIR")]
    chdir: Option<PathBuf>,

    /// Run all scripts in the config unless skipped.
    #[arg(short = 'A', long = "all")]
    all: bool,

    /// Run the alias from the config.
    #[arg(short = 'a', long = "alias", value_name = "NAME", action = ArgAction::Append)]
    alias: Vec<String>,

    /// Automatically reload the config if it changes.
    #[arg(long = "reload", overrides_with = "no_reload")]
    reload: bool,

    /// Do not reload the config when it changes.
    #[arg(long = "no-reload", overrides_with = "reload")]
    no_reload: bool,

    /// Materialize tasks but do not execute anything.
    #[arg(long = "dry-run", hide = true)]
    dry_run: bool,

    /// Seconds to wait for further changes before restarting.
    #[arg(long = "dwell", value_name = "SECONDS", default_value_t = DEFAULT_DWELL)]
    dwell: f64,

    /// Script and arguments to run.
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

/// Values for `-e`/`-w`/`-i` may pack several entries separated by spaces
/// or commas.
fn split_values(values: &[String]) -> Vec<String> {
    values
        .iter()
        .flat_map(|v| v.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// An extension without a leading `*` gets one, so `-e .py` means `*.py`.
fn expand_ext(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| {
            if v.starts_with('*') {
                v
            } else {
                format!("*{v}")
            }
        })
        .collect()
}

fn main() {
    // `--version` is eager; anything after `--` belongs to the task script.
    let argv: Vec<String> = std::env::args().collect();
    if argv
        .iter()
        .skip(1)
        .take_while(|a| a.as_str() != "--")
        .any(|a| a == "--version")
    {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let cli = Cli::parse();

    set_display_verbose(cli.verbose);
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Some(dir) = &cli.chdir {
        if let Err(e) = std::env::set_current_dir(dir) {
            display_error(format!("cannot change directory to {}: {e}", dir.display()));
            std::process::exit(libc::ENOENT);
        }
    }

    let aliases = if cli.alias.is_empty() {
        vec!["default".to_string()]
    } else {
        cli.alias.clone()
    };

    let options = Options {
        aliases,
        // Resolved after -C so the default follows the new cwd.
        config_file: cli.config_file.clone().unwrap_or_else(default_config_file),
        cwd: cli.chdir.as_ref().map(|d| d.display().to_string()),
        dry_run: cli.dry_run,
        ignore: split_values(&cli.ignore),
        paths: split_values(&cli.watch),
        patterns: expand_ext(split_values(&cli.ext)),
        no_guess: cli.no_guess,
        scripts: cli.exec.iter().filter(|s| !s.is_empty()).cloned().collect(),
        args: cli.args.join(" ").trim().to_string(),
        use_unsafe: cli.use_unsafe,
        use_all: cli.all,
        verbose: cli.verbose,
        auto_reload: cli.reload || !cli.no_reload,
        dwell: cli.dwell,
    };

    std::process::exit(run(options));
}

fn run(options: Options) -> i32 {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            display_error(format!("cannot start runtime: {e}"));
            return 1;
        }
    };

    runtime.block_on(async {
        let app = Foremon::new(options);
        match app.run_forever().await {
            Ok(code) => code,
            Err(e) => {
                display_error(format!("error {}: {}", e.code, e.message));
                e.code
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_values_handles_spaces_and_commas() {
        let values = vec!["a b".to_string(), "c,d".to_string(), "e".to_string()];
        assert_eq!(split_values(&values), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn extensions_gain_a_leading_star() {
        let out = expand_ext(vec![".py".to_string(), "*.rs".to_string(), "txt".to_string()]);
        assert_eq!(out, vec!["*.py", "*.rs", "*txt"]);
    }

    #[test]
    fn cli_parses_the_full_surface() {
        let cli = Cli::parse_from([
            "foremon", "-f", "cfg.toml", "-e", ".py", "-w", "src", "-i", ".git/*", "-V", "-x",
            "echo hi", "-u", "-n", "-A", "-a", "web", "--no-reload", "--dwell", "0.5", "--",
            "python", "app.py",
        ]);
        assert_eq!(cli.config_file, Some(PathBuf::from("cfg.toml")));
        assert_eq!(cli.ext, vec![".py"]);
        assert_eq!(cli.watch, vec!["src"]);
        assert!(cli.verbose && cli.use_unsafe && cli.no_guess && cli.all);
        assert_eq!(cli.exec, vec!["echo hi"]);
        assert_eq!(cli.alias, vec!["web"]);
        assert!(cli.no_reload);
        assert_eq!(cli.dwell, 0.5);
        assert_eq!(cli.args, vec!["python", "app.py"]);
    }

    #[test]
    fn reload_toggle_defaults_on() {
        let cli = Cli::parse_from(["foremon", "--", "true"]);
        assert!(!cli.no_reload);
        let cli = Cli::parse_from(["foremon", "--no-reload", "--reload", "--", "true"]);
        assert!(!cli.no_reload && cli.reload);
    }
}
