//! User-facing status lines. Everything goes to stderr so captured stdout stays
//! the program's own output.

use std::io::IsTerminal;
use std::io::Write;

use owo_colors::OwoColorize;

const PREFIX: &str = "runkit:";

pub fn termlog(message: &str) {
    emit(Level::Info, message);
}

pub fn termwarn(message: &str) {
    emit(Level::Warn, message);
}

pub fn termerror(message: &str) {
    emit(Level::Error, message);
}

#[derive(Clone, Copy)]
enum Level {
    Info,
    Warn,
    Error,
}

fn emit(level: Level, message: &str) {
    let mut stderr = std::io::stderr().lock();
    let line = if std::io::stderr().is_terminal() {
        let prefix = match level {
            Level::Info => PREFIX.blue().bold().to_string(),
            Level::Warn => format!("{} {}", PREFIX.blue().bold(), "WARNING".yellow()),
            Level::Error => format!("{} {}", PREFIX.blue().bold(), "ERROR".red()),
        };
        format!("{prefix} {message}")
    } else {
        match level {
            Level::Info => format!("{PREFIX} {message}"),
            Level::Warn => format!("{PREFIX} WARNING {message}"),
            Level::Error => format!("{PREFIX} ERROR {message}"),
        }
    };
    let _ = writeln!(stderr, "{line}");
}
