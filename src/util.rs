//! Small helpers shared across the crate: path shortening, word splitting,
//! environment expansion, signal names, and the command-guessing heuristics
//! applied to the trailing positional script.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Convert `path` to a relative path iff it is a child of the cwd.
pub fn relative_if_cwd(path: &Path) -> PathBuf {
    if let Ok(cwd) = std::env::current_dir() {
        if let Ok(rel) = path.strip_prefix(&cwd) {
            if rel.as_os_str().is_empty() {
                return PathBuf::from(".");
            }
            return rel.to_path_buf();
        }
    }
    path.to_path_buf()
}

/// Split a command line into words, honoring single quotes, double quotes,
/// and backslash escapes. Returns `None` on an unterminated quote.
pub fn shell_split(line: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(q) => current.push(q),
                        None => return None,
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) if e == '"' || e == '\\' || e == '$' => current.push(e),
                            Some(e) => {
                                current.push('\\');
                                current.push(e);
                            }
                            None => return None,
                        },
                        Some(q) => current.push(q),
                        None => return None,
                    }
                }
            }
            '\\' => match chars.next() {
                Some(e) => {
                    in_word = true;
                    current.push(e);
                }
                None => return None,
            },
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Some(words)
}

/// Join words back into a command line, single-quoting any word that the
/// shell would otherwise re-split.
pub fn shell_join(words: &[String]) -> String {
    words
        .iter()
        .map(|w| {
            if !w.is_empty()
                && w.chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c))
            {
                w.clone()
            } else {
                format!("'{}'", w.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Expand `$VAR` and `${VAR}` against the process environment. Unset
/// variables are left untouched, matching `os.path.expandvars`.
pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        // rest starts with '$'; work out the variable name and its extent.
        let (name, consumed) = if let Some(braced) = rest.strip_prefix("${") {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 3),
                None => ("", 0),
            }
        } else {
            let body = &rest[1..];
            let len = body
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .count();
            (&body[..len], len + 1)
        };

        let valid = !name.is_empty() && !name.starts_with(|c: char| c.is_ascii_digit());
        let value = if valid { std::env::var(name).ok() } else { None };
        match value {
            Some(val) => {
                out.push_str(&val);
                rest = &rest[consumed..];
            }
            None => {
                out.push('$');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("SIGHUP", libc::SIGHUP),
    ("SIGINT", libc::SIGINT),
    ("SIGQUIT", libc::SIGQUIT),
    ("SIGILL", libc::SIGILL),
    ("SIGTRAP", libc::SIGTRAP),
    ("SIGABRT", libc::SIGABRT),
    ("SIGBUS", libc::SIGBUS),
    ("SIGFPE", libc::SIGFPE),
    ("SIGKILL", libc::SIGKILL),
    ("SIGUSR1", libc::SIGUSR1),
    ("SIGSEGV", libc::SIGSEGV),
    ("SIGUSR2", libc::SIGUSR2),
    ("SIGPIPE", libc::SIGPIPE),
    ("SIGALRM", libc::SIGALRM),
    ("SIGTERM", libc::SIGTERM),
    ("SIGCHLD", libc::SIGCHLD),
    ("SIGCONT", libc::SIGCONT),
    ("SIGSTOP", libc::SIGSTOP),
    ("SIGTSTP", libc::SIGTSTP),
    ("SIGTTIN", libc::SIGTTIN),
    ("SIGTTOU", libc::SIGTTOU),
    ("SIGXCPU", libc::SIGXCPU),
    ("SIGXFSZ", libc::SIGXFSZ),
    ("SIGVTALRM", libc::SIGVTALRM),
    ("SIGPROF", libc::SIGPROF),
    ("SIGWINCH", libc::SIGWINCH),
    ("SIGSYS", libc::SIGSYS),
];

/// Look up a signal number by its symbolic name, e.g. `"SIGTERM"`.
pub fn signal_by_name(name: &str) -> Option<i32> {
    SIGNAL_NAMES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, num)| *num)
}

/// Symbolic name for a signal number, falling back to the number itself.
pub fn signal_name(sig: i32) -> String {
    SIGNAL_NAMES
        .iter()
        .find(|(_, num)| *num == sig)
        .map(|(n, _)| n.to_string())
        .unwrap_or_else(|| sig.to_string())
}

/// Resolve the interpreter used by command-guessing: `$PYTHON`, then
/// `python3`, then `python` on `PATH`.
pub fn find_interpreter() -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var("PYTHON") {
        let p = PathBuf::from(explicit);
        if is_executable(&p) {
            return Some(p);
        }
    }
    let path = std::env::var("PATH").ok()?;
    for dir in path.split(':').filter(|d| !d.is_empty()) {
        for name in ["python3", "python"] {
            let candidate = Path::new(dir).join(name);
            if is_executable(&candidate) {
                return Some(candidate);
            }
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.is_file()
        && path
            .metadata()
            .map(|m| m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
}

fn looks_like_module_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Ask the interpreter whether `name` is an importable module.
fn module_importable(interpreter: &Path, name: &str) -> bool {
    std::process::Command::new(interpreter)
        .arg("-c")
        .arg("import importlib.util, sys; raise SystemExit(0 if importlib.util.find_spec(sys.argv[1]) else 1)")
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn prepend_pythonpath(environment: &mut HashMap<String, String>, dir: &Path) {
    let existing = environment
        .get("PYTHONPATH")
        .cloned()
        .or_else(|| std::env::var("PYTHONPATH").ok())
        .unwrap_or_default();
    let value = if existing.is_empty() {
        dir.display().to_string()
    } else {
        format!("{}:{}", dir.display(), existing)
    };
    environment.insert("PYTHONPATH".to_string(), value);
}

/// Guess how to run `script` when its first word is a script file, a package
/// directory, or a module name rather than an executable. Applies only to
/// the trailing positional script; explicit `-x` scripts bypass this.
pub fn guess_script(script: &str, environment: &mut HashMap<String, String>) -> String {
    let Some(mut argv) = shell_split(script) else {
        return script.to_string();
    };
    if argv.is_empty() {
        return script.to_string();
    }
    let Some(interpreter) = find_interpreter() else {
        return script.to_string();
    };
    let interpreter = relative_if_cwd(&interpreter).display().to_string();

    let arg0 = argv[0].clone();
    let arg0_path = Path::new(&arg0);

    if arg0.ends_with(".py") {
        if !is_executable(arg0_path) {
            argv.insert(0, interpreter);
        }
        return shell_join(&argv);
    }

    if arg0_path.is_dir() {
        if arg0_path.join("__main__.py").is_file() {
            let module = match arg0_path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => return script.to_string(),
            };
            if let Some(parent) = arg0_path.parent() {
                if !parent.as_os_str().is_empty() {
                    prepend_pythonpath(environment, parent);
                }
            }
            argv.splice(0..1, [interpreter, "-m".to_string(), module]);
            return shell_join(&argv);
        }
        return script.to_string();
    }

    // dir:func form, e.g. `mypkg:serve`
    if let Some((dir, func)) = arg0.split_once(':') {
        let dir_path = Path::new(dir);
        if dir_path.is_dir() && dir_path.join("__init__.py").is_file() {
            let module = match dir_path.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => return script.to_string(),
            };
            if let Some(parent) = dir_path.parent() {
                if !parent.as_os_str().is_empty() {
                    prepend_pythonpath(environment, parent);
                }
            }
            let body = format!("from {} import {}; {}()", module, func, func);
            argv.splice(0..1, [interpreter, "-c".to_string(), body]);
            return shell_join(&argv);
        }
        return script.to_string();
    }

    if looks_like_module_name(&arg0) && module_importable(Path::new(&interpreter), &arg0) {
        argv.insert(0, "-m".to_string());
        argv.insert(0, interpreter);
        return shell_join(&argv);
    }

    script.to_string()
}
