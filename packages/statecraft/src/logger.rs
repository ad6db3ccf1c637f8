//! Logging collaborator.
//!
//! Components never reach for a global logger. Each one is handed a
//! [`Logger`] at construction (a component name plus a [`LogSink`]) and
//! derives child loggers with [`Logger::named`].
//!
//! Messages are templates with `{name}` placeholders. Arguments are bound by
//! the order in which distinct placeholder names first appear, so a repeated
//! name reuses its argument:
//!
//! ```ignore
//! logger.info("saga {saga} started instance {id}", &[&"checkout", &id]);
//! ```
//!
//! Formatting happens only when the sink reports the level as enabled.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use tracing::Level;

/// Severity of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Backend that receives formatted messages.
pub trait LogSink: Send + Sync + 'static {
    /// Whether messages at `level` would be kept.
    fn enabled(&self, level: LogLevel) -> bool;

    /// Record a fully formatted message.
    fn emit(&self, component: &str, level: LogLevel, message: &str);
}

/// Sink that forwards to `tracing`.
///
/// The component name travels as a `component` field; level filtering is
/// whatever the installed subscriber decides.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn enabled(&self, level: LogLevel) -> bool {
        match level {
            LogLevel::Trace => tracing::enabled!(Level::TRACE),
            LogLevel::Debug => tracing::enabled!(Level::DEBUG),
            LogLevel::Info => tracing::enabled!(Level::INFO),
            LogLevel::Warn => tracing::enabled!(Level::WARN),
            LogLevel::Error => tracing::enabled!(Level::ERROR),
        }
    }

    fn emit(&self, component: &str, level: LogLevel, message: &str) {
        match level {
            LogLevel::Trace => tracing::event!(Level::TRACE, component, "{}", message),
            LogLevel::Debug => tracing::event!(Level::DEBUG, component, "{}", message),
            LogLevel::Info => tracing::event!(Level::INFO, component, "{}", message),
            LogLevel::Warn => tracing::event!(Level::WARN, component, "{}", message),
            LogLevel::Error => tracing::event!(Level::ERROR, component, "{}", message),
        }
    }
}

/// Named handle onto a [`LogSink`].
#[derive(Clone)]
pub struct Logger {
    name: Arc<str>,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    /// Logger writing to an arbitrary sink.
    pub fn new(name: impl Into<Arc<str>>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }

    /// Logger writing to `tracing`.
    pub fn tracing(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, Arc::new(TracingSink))
    }

    /// Same sink, different component name.
    pub fn named(&self, name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            sink: self.sink.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        self.sink.enabled(level)
    }

    /// Format `template` with `args` and emit it, if `level` is enabled.
    pub fn log(&self, level: LogLevel, template: &str, args: &[&dyn fmt::Display]) {
        if self.sink.enabled(level) {
            self.sink
                .emit(&self.name, level, &format_template(template, args));
        }
    }

    /// Build the message only if `level` is enabled.
    pub fn log_with(&self, level: LogLevel, message: impl FnOnce() -> String) {
        if self.sink.enabled(level) {
            self.sink.emit(&self.name, level, &message());
        }
    }

    pub fn trace(&self, template: &str, args: &[&dyn fmt::Display]) {
        self.log(LogLevel::Trace, template, args);
    }

    pub fn debug(&self, template: &str, args: &[&dyn fmt::Display]) {
        self.log(LogLevel::Debug, template, args);
    }

    pub fn info(&self, template: &str, args: &[&dyn fmt::Display]) {
        self.log(LogLevel::Info, template, args);
    }

    pub fn warn(&self, template: &str, args: &[&dyn fmt::Display]) {
        self.log(LogLevel::Warn, template, args);
    }

    pub fn error(&self, template: &str, args: &[&dyn fmt::Display]) {
        self.log(LogLevel::Error, template, args);
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::tracing("statecraft")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").field("name", &self.name).finish()
    }
}

/// Substitute `{name}` placeholders in `template`.
///
/// The first distinct placeholder name binds `args[0]`, the second distinct
/// name binds `args[1]`, and so on. Placeholders without a matching argument
/// are left as written. Braces that do not enclose an identifier are copied
/// verbatim.
pub fn format_template(template: &str, args: &[&dyn fmt::Display]) -> String {
    let mut out = String::with_capacity(template.len() + args.len() * 8);
    let mut names: Vec<&str> = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];

        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };

        let name = &after[..close];
        if !is_placeholder_name(name) {
            out.push('{');
            rest = after;
            continue;
        }

        let index = match names.iter().position(|n| *n == name) {
            Some(i) => i,
            None => {
                names.push(name);
                names.len() - 1
            }
        };

        match args.get(index) {
            Some(arg) => {
                let _ = write!(out, "{}", arg);
            }
            None => out.push_str(&rest[open..open + close + 2]),
        }
        rest = &after[close + 1..];
    }

    out.push_str(rest);
    out
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}
