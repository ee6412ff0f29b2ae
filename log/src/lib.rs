//! Syslog and stderr logging for the watchdog, inspired by OpenBSD's `log.c`
//!
//! The supervisor always logs to syslog and, until it has detached from
//! the terminal, echoes every message to stderr.  The stderr echo is a
//! process-global switch so that it can be turned off once the worker
//! finished its first initialization and turned on again while an
//! administrative restart redirects stderr into a status file.

mod envlogger;

use derive_more::{Display, From};
use serde_derive::{Deserialize, Serialize};
use slog::{Drain, Level, OwnedKVList, Record, KV};
use slog_scope::GlobalLoggerGuard;
use std::{
    ffi::{CStr, CString},
    fmt,
    io::{self, Write},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, Once,
    },
};

/// Re-export the scoped logging macros.
pub use slog_scope::{crit, debug, error, info, trace, warn};

static LOG_BRIDGE: Once = Once::new();

/// Echo log messages to stderr.
static STDERR: AtomicBool = AtomicBool::new(true);

/// Configuration for the logging crate.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    /// Initial state of the stderr echo.
    pub stderr: bool,
    /// Log to syslog.
    pub syslog: bool,
    /// Filter directives used when `RUST_LOG` is not set.
    pub filter: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stderr: true,
            syslog: true,
            filter: None,
        }
    }
}

impl From<bool> for Config {
    /// Foreground logging goes to stderr only.
    fn from(foreground: bool) -> Self {
        Self {
            stderr: true,
            syslog: !foreground,
            filter: None,
        }
    }
}

/// Logging errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "{}", "_0")]
    NulError(std::ffi::NulError),
    #[display(fmt = "{}", "_0")]
    IoError(io::Error),
}

impl std::error::Error for Error {}

/// Turn the stderr echo on or off.
pub fn set_stderr(enabled: bool) {
    STDERR.store(enabled, Ordering::SeqCst);
}

/// Returns true if log messages are echoed to stderr.
pub fn stderr_enabled() -> bool {
    STDERR.load(Ordering::SeqCst)
}

/// Install the global logger.
///
/// The returned guard must be kept alive for the lifetime of the process.
pub fn logger<C: Into<Config>>(name: &str, config: C) -> Result<GlobalLoggerGuard, Error> {
    let config = config.into();
    set_stderr(config.stderr);

    let syslog = if config.syslog {
        Some(Syslog::new(name)?)
    } else {
        None
    };
    let drain = Tee {
        stderr: Stderr::new(name)?,
        syslog,
    };
    let drain = envlogger::Logger::with_default_filter(
        drain,
        config.filter.as_deref().unwrap_or("info"),
    );

    // This is required to make the drain `UnwindSafe`.
    let drain = Mutex::new(drain.fuse());

    let logger = slog::Logger::root(drain.fuse(), slog::o!()).into_erased();

    let guard = slog_scope::set_global_logger(logger);
    LOG_BRIDGE.call_once(|| {
        // Another `log` implementation may already be installed.
        let _ = slog_stdlog::init();
    });

    Ok(guard)
}

/// Output target of a pre-formatted log line.
pub trait Target: Send + Sync {
    fn new(name: &str) -> Result<Self, Error>
    where
        Self: Sized;
    fn log_str(&self, level: Level, message: &str) -> Result<(), Error>;
}

/// Terminal logger that writes to stderr while the echo is enabled.
pub struct Stderr {
    _name: String,
}

impl Target for Stderr {
    fn new(name: &str) -> Result<Self, Error> {
        Ok(Self {
            _name: name.to_string(),
        })
    }

    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        if !stderr_enabled() {
            return Ok(());
        }
        let prefix = match level {
            Level::Critical | Level::Error => "failure",
            Level::Warning => "warning",
            Level::Info => "info",
            Level::Debug | Level::Trace => "debug",
        };
        let message = format!("{}: {}\n", prefix, message);
        io::stderr()
            .write_all(message.as_bytes())
            .map_err(Into::into)
    }
}

/// Background logger to log to syslog.
pub struct Syslog {
    /// We need to keep a reference to the const char * around.
    _name: Pin<CString>,
}

impl Target for Syslog {
    fn new(name: &str) -> Result<Self, Error> {
        let _name = CString::new(&name[..name.find('(').unwrap_or(name.len())])?;
        let c_str: &CStr = _name.as_c_str();

        unsafe {
            libc::openlog(
                c_str.as_ptr(),
                libc::LOG_PID | libc::LOG_NDELAY,
                libc::LOG_DAEMON,
            )
        };

        Ok(Self {
            _name: Pin::new(_name),
        })
    }

    fn log_str(&self, level: Level, message: &str) -> Result<(), Error> {
        let c_message = CString::new(message.as_bytes())?;
        let priority = match level {
            Level::Critical => libc::LOG_CRIT,
            Level::Error => libc::LOG_ERR,
            Level::Warning => libc::LOG_WARNING,
            Level::Info => libc::LOG_INFO,
            Level::Debug | Level::Trace => libc::LOG_DEBUG,
        };

        // Never pass the message as the format string.
        unsafe {
            libc::syslog(priority, b"%s\0".as_ptr() as *const _, c_message.as_ptr());
        }

        Ok(())
    }
}

impl Drop for Syslog {
    /// Close syslog on shutdown.
    fn drop(&mut self) {
        unsafe {
            libc::closelog();
        }
    }
}

/// Sends every record to stderr and, if configured, to syslog.
struct Tee {
    stderr: Stderr,
    syslog: Option<Syslog>,
}

impl Drain for Tee {
    type Ok = ();
    type Err = slog::Never;

    fn log(&self, record: &Record<'_>, values: &OwnedKVList) -> Result<Self::Ok, Self::Err> {
        let message = format_log(record, values);
        let _ = self.stderr.log_str(record.level(), &message);
        if let Some(syslog) = &self.syslog {
            let _ = syslog.log_str(record.level(), &message);
        }
        Ok(())
    }
}

/// Format the log message to a string.
#[inline]
fn format_log(record: &Record<'_>, values: &OwnedKVList) -> String {
    let mut formatter = Formatter::new(record);
    let _ = record.kv().serialize(record, &mut formatter);
    let _ = values.serialize(record, &mut formatter);
    formatter.buf
}

/// Formatter to create a log message from a record.
struct Formatter {
    buf: String,
}

impl Formatter {
    fn new(record: &Record<'_>) -> Self {
        let mut buf = format!("{}", record.msg());

        if record.level() >= Level::Debug {
            buf.push_str(&format!(
                ", source: {}:{}, module: {}",
                record.file(),
                record.line(),
                record.module()
            ));
        };

        Self { buf }
    }
}

/// Serializer for key-value fields.
impl slog::Serializer for Formatter {
    fn emit_arguments(&mut self, key: &str, val: &fmt::Arguments<'_>) -> slog::Result {
        self.buf.push_str(&format!(", {}: {}", key, val));
        Ok(())
    }
}
