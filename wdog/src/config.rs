//! Resolved supervisor options.

use std::{
    env,
    path::{Path, PathBuf},
    time::Duration,
};

/// Name of the supervisor socket in the temp directory.
pub const SOCKET_NAME: &str = "wdog.sock";
/// Default PID file name in the temp directory.
pub const PID_FILE_NAME: &str = "wdog.pid";
/// Marker file in the temp directory that disables automatic restarts.
pub const NO_AUTOSTART_MARKER: &str = "no-autostart";
/// Environment variable that disables automatic restarts.
pub const NO_AUTOSTART_ENV: &str = "WDOG_NO_AUTOSTART";
/// Default temp directory.
pub const DEFAULT_TEMP_DIR: &str = "/tmp/wdog";

#[derive(Debug, Clone)]
pub struct Config {
    pub temp_dir: PathBuf,
    /// PID file path, `<temp_dir>/wdog.pid` unless the worker sets one.
    pub pid_file: Option<PathBuf>,
    /// The worker binary.
    pub worker: PathBuf,
    pub args: Vec<String>,
    /// Owner of the temp directory when started as root.
    pub user: Option<String>,
    /// Stay attached to the terminal.
    pub foreground: bool,
    /// Run the worker once to validate its configuration.
    pub check: bool,
    pub capacity: usize,
    pub poll_interval: Duration,
    pub reconfigure_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from(DEFAULT_TEMP_DIR),
            pid_file: None,
            worker: PathBuf::new(),
            args: Vec::new(),
            user: None,
            foreground: false,
            check: false,
            capacity: 64,
            poll_interval: Duration::from_secs(10),
            reconfigure_timeout: Duration::from_secs(300),
        }
    }
}

impl Config {
    pub fn socket_path(&self) -> PathBuf {
        socket_path(&self.temp_dir)
    }

    pub fn pid_file(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| self.temp_dir.join(PID_FILE_NAME))
    }

    /// Automatic restarts are disabled by the environment or by the
    /// marker file, which may appear while the supervisor is running.
    pub fn auto_restart(&self) -> bool {
        env::var_os(NO_AUTOSTART_ENV).is_none()
            && !self.temp_dir.join(NO_AUTOSTART_MARKER).exists()
    }

    /// Detach from the terminal and notify the waiting parent.
    pub fn detach(&self) -> bool {
        !self.foreground && !self.check
    }
}

pub fn socket_path<P: AsRef<Path>>(temp_dir: P) -> PathBuf {
    temp_dir.as_ref().join(SOCKET_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_no_autostart_marker() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            temp_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert_eq!(config.pid_file(), dir.path().join(PID_FILE_NAME));
        assert_eq!(config.socket_path(), dir.path().join(SOCKET_NAME));

        let restart = config.auto_restart();
        fs::write(dir.path().join(NO_AUTOSTART_MARKER), b"").unwrap();
        assert!(!config.auto_restart());
        assert_eq!(restart, env::var_os(NO_AUTOSTART_ENV).is_none());
    }
}
