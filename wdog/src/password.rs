//! Startup secrets requested by the worker.

use crate::error::Error;
use nix::{
    sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios},
    unistd::isatty,
};
use std::{
    collections::HashMap,
    io::{self, BufRead, Write},
    os::unix::io::{AsRawFd, RawFd},
};
use wdog_log::warn;
use zeroize::Zeroizing;

/// Cached passwords by prompt.
///
/// Serial numbers increase when the worker rejected a value; a cached
/// value only satisfies requests up to the serial it was entered for.
#[derive(Default)]
pub struct Passwords {
    entries: HashMap<String, (u32, Zeroizing<String>)>,
}

impl Passwords {
    pub fn lookup(&self, prompt: &str, serial: u32) -> Option<&str> {
        self.entries
            .get(prompt)
            .filter(|(cached, _)| serial <= *cached)
            .map(|(_, value)| value.as_str())
    }

    /// Returns true if any value was cached for `prompt`.
    pub fn contains(&self, prompt: &str) -> bool {
        self.entries.contains_key(prompt)
    }

    pub fn save(&mut self, prompt: &str, serial: u32, value: Zeroizing<String>) {
        self.entries.insert(prompt.to_string(), (serial, value));
    }
}

/// Source of passwords that are not cached.
pub trait Prompt {
    /// Ask for the password of `prompt`.  `retry` is set if a previous
    /// value was rejected by the worker.
    fn read(&mut self, prompt: &str, retry: bool) -> Result<Zeroizing<String>, Error>;
}

/// Prompts on the controlling terminal with echo turned off.
#[derive(Debug, Default)]
pub struct TtyPrompt;

impl Prompt for TtyPrompt {
    fn read(&mut self, prompt: &str, retry: bool) -> Result<Zeroizing<String>, Error> {
        let stdin = io::stdin();
        let fd = stdin.as_raw_fd();
        let tty = isatty(fd).unwrap_or(false);

        // A non-interactive stdin is unlikely to have a better answer.
        if !tty && retry {
            warn!("invalid password for {}", prompt);
            return Err(Error::PasswordUnavailable);
        }

        let _echo = if tty {
            let mut stdout = io::stdout();
            stdout.write_all(prompt.as_bytes())?;
            stdout.flush()?;
            Some(EchoOff::new(fd)?)
        } else {
            None
        };

        let mut line = Zeroizing::new(String::new());
        let count = stdin.lock().read_line(&mut line)?;
        if tty {
            println!();
        }
        if count == 0 {
            warn!("end-of-file while reading password");
            return Err(Error::PasswordUnavailable);
        }

        let value = Zeroizing::new(line.trim_end_matches(&['\r', '\n'][..]).to_string());
        Ok(value)
    }
}

/// Disables terminal echo until dropped.
struct EchoOff {
    fd: RawFd,
    saved: Termios,
}

impl EchoOff {
    fn new(fd: RawFd) -> Result<Self, Error> {
        let saved = tcgetattr(fd)?;
        let mut quiet = saved.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        tcsetattr(fd, SetArg::TCSAFLUSH, &quiet)?;
        Ok(Self { fd, saved })
    }
}

impl Drop for EchoOff {
    fn drop(&mut self) {
        let _ = tcsetattr(self.fd, SetArg::TCSAFLUSH, &self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_invalidates_cache() {
        let mut passwords = Passwords::default();
        assert_eq!(passwords.lookup("key", 0), None);

        passwords.save("key", 1, Zeroizing::new("secret".to_string()));
        assert_eq!(passwords.lookup("key", 0), Some("secret"));
        assert_eq!(passwords.lookup("key", 1), Some("secret"));
        assert_eq!(passwords.lookup("key", 2), None);
        assert_eq!(passwords.lookup("other", 0), None);
        assert!(passwords.contains("key"));

        passwords.save("key", 2, Zeroizing::new("better".to_string()));
        assert_eq!(passwords.lookup("key", 2), Some("better"));
    }
}
