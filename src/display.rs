//! User-facing output.
//!
//! Every line the supervisor prints for the user goes through this module,
//! always to stderr so child stdout stays untouched. Tracing diagnostics are
//! separate and use the normal subscriber.

use colored::Colorize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

static VERBOSE: AtomicBool = AtomicBool::new(false);
static WRITER: Mutex<Option<Box<dyn Write + Send>>> = Mutex::new(None);

const DISPLAY_NAME: &str = "foremon";

pub fn display_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn set_display_verbose(val: bool) {
    VERBOSE.store(val, Ordering::Relaxed);
}

/// Route display output somewhere other than stderr. Tests use this to
/// capture lines; `None` restores the default writer.
pub fn set_display_writer(writer: Option<Box<dyn Write + Send>>) {
    *WRITER.lock().unwrap_or_else(|e| e.into_inner()) = writer;
}

/// True when the terminal advertises 256-color support.
fn use_colors() -> bool {
    std::env::var("TERM").map(|t| t.contains("256")).unwrap_or(false)
}

fn write_line(text: String) {
    let mut slot = WRITER.lock().unwrap_or_else(|e| e.into_inner());
    match slot.as_mut() {
        Some(w) => {
            let _ = w.write_all(text.as_bytes());
            let _ = w.flush();
        }
        None => {
            let mut err = std::io::stderr();
            let _ = err.write_all(text.as_bytes());
            let _ = err.flush();
        }
    }
}

fn display(msg: &str, paint: fn(&str) -> colored::ColoredString) {
    let line = format!("[{}] {}", DISPLAY_NAME, msg);
    let text = if use_colors() {
        format!("{}\n", paint(&line))
    } else {
        format!("{}\n", line)
    };
    write_line(text);
}

pub fn display_success(msg: impl AsRef<str>) {
    display(msg.as_ref(), |s| s.green());
}

pub fn display_info(msg: impl AsRef<str>) {
    display(msg.as_ref(), |s| s.cyan());
}

pub fn display_warning(msg: impl AsRef<str>) {
    display(msg.as_ref(), |s| s.yellow());
}

pub fn display_error(msg: impl AsRef<str>) {
    display(msg.as_ref(), |s| s.red());
}

/// Error with the source chain appended, one frame per line.
pub fn display_error_with(msg: impl AsRef<str>, err: &anyhow::Error) {
    display(&format!("{}\n{:#}", msg.as_ref(), err), |s| s.red());
}

/// Only emitted when verbose output was requested.
pub fn display_debug(msg: impl AsRef<str>) {
    if display_verbose() {
        display(msg.as_ref(), |s| s.blue());
    }
}
