use nix::{
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use std::{
    fs,
    path::{Path, PathBuf},
    process::{Child, Command, Output, Stdio},
    thread,
    time::{Duration, Instant},
};
use wdog::config::{NO_AUTOSTART_MARKER, PID_FILE_NAME, SOCKET_NAME};

const WDOG: &str = env!("CARGO_BIN_EXE_wdog");
const WORKER: &str = env!("CARGO_BIN_EXE_wdog-demo-worker");
const TIMEOUT: Duration = Duration::from_secs(20);

struct Watchdog {
    child: Child,
    temp_dir: PathBuf,
}

impl Watchdog {
    fn start(temp_dir: &Path, worker_args: &[&str]) -> Self {
        let child = Command::new(WDOG)
            .arg("--temp-dir")
            .arg(temp_dir)
            .args(["run", "--foreground", "--poll-interval", "1", WORKER, "--"])
            .args(worker_args)
            .env_remove("WDOG_NO_AUTOSTART")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        Self {
            child,
            temp_dir: temp_dir.to_path_buf(),
        }
    }

    fn admin(&self, args: &[&str]) -> Output {
        Command::new(WDOG)
            .arg("--temp-dir")
            .arg(&self.temp_dir)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .unwrap()
    }

    fn wait_initialized(&self) {
        wait_for(|| self.temp_dir.join(PID_FILE_NAME).exists());
    }

    fn wait(&mut self) -> Option<i32> {
        let deadline = Instant::now() + TIMEOUT;
        while Instant::now() < deadline {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status.code();
            }
            thread::sleep(Duration::from_millis(50));
        }
        let _ = self.child.kill();
        panic!("watchdog did not exit");
    }

    fn assert_cleaned_up(&self) {
        assert!(!self.temp_dir.join(SOCKET_NAME).exists());
        assert!(!self.temp_dir.join(PID_FILE_NAME).exists());
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(50));
    }
}

fn read_pid(path: &Path) -> Option<i32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[test]
fn test_start_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let mut watchdog = Watchdog::start(dir.path(), &[]);
    watchdog.wait_initialized();

    let pid = read_pid(&dir.path().join(PID_FILE_NAME)).unwrap();
    assert_eq!(pid as u32, watchdog.child.id());

    let output = watchdog.admin(&["rotate"]);
    assert!(output.status.success());

    let output = watchdog.admin(&["stop"]);
    assert!(output.status.success());
    assert_eq!(watchdog.wait(), Some(0));
    watchdog.assert_cleaned_up();
}

#[test]
fn test_reconfigure() {
    let dir = tempfile::tempdir().unwrap();
    let mut watchdog = Watchdog::start(dir.path(), &["--workers", "2"]);
    watchdog.wait_initialized();

    let output = watchdog.admin(&["reconfigure"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ok\n");

    // Nothing to attach to once it is done.
    let output = watchdog.admin(&["reconfigure", "--attach"]);
    assert!(output.status.success());
    assert!(output.stdout.is_empty());

    watchdog.admin(&["stop"]);
    assert_eq!(watchdog.wait(), Some(0));
}

#[test]
fn test_restart_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let pid_out = dir.path().join("worker.pid");
    let mut watchdog = Watchdog::start(
        dir.path(),
        &["--pid-out", pid_out.to_str().unwrap()],
    );
    wait_for(|| read_pid(&pid_out).is_some());
    let first = read_pid(&pid_out).unwrap();

    kill(Pid::from_raw(first), Signal::SIGKILL).unwrap();
    wait_for(|| matches!(read_pid(&pid_out), Some(pid) if pid != first));

    watchdog.admin(&["stop"]);
    assert_eq!(watchdog.wait(), Some(0));
    watchdog.assert_cleaned_up();
}

#[test]
fn test_admin_restart() {
    let dir = tempfile::tempdir().unwrap();
    let pid_out = dir.path().join("worker.pid");
    let mut watchdog = Watchdog::start(
        dir.path(),
        &["--pid-out", pid_out.to_str().unwrap()],
    );
    wait_for(|| read_pid(&pid_out).is_some());
    let first = read_pid(&pid_out).unwrap();

    // Returns once the new worker is initialized.
    let output = watchdog.admin(&["restart"]);
    assert!(output.status.success());
    wait_for(|| matches!(read_pid(&pid_out), Some(pid) if pid != first));

    // The first restart was resolved, so another one is accepted.
    let output = watchdog.admin(&["restart"]);
    assert!(output.status.success());

    watchdog.admin(&["stop"]);
    assert_eq!(watchdog.wait(), Some(0));
}

#[test]
fn test_crash_loop_until_no_autostart() {
    let dir = tempfile::tempdir().unwrap();
    let pid_out = dir.path().join("worker.pid");
    let mut watchdog = Watchdog::start(
        dir.path(),
        &["--crash-after-init", "3", "--pid-out", pid_out.to_str().unwrap()],
    );

    // Every crash is followed by a new worker.
    wait_for(|| read_pid(&pid_out).is_some());
    let first = read_pid(&pid_out).unwrap();
    wait_for(|| matches!(read_pid(&pid_out), Some(pid) if pid != first));

    fs::write(dir.path().join(NO_AUTOSTART_MARKER), b"").unwrap();
    assert_eq!(watchdog.wait(), Some(3));
    watchdog.assert_cleaned_up();
}

#[test]
fn test_admin_without_watchdog() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::new(WDOG)
        .arg("--temp-dir")
        .arg(dir.path())
        .arg("stop")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
}
