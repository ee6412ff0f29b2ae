//! Process plumbing: spawning the worker, detaching, PID files and stdio.

use crate::{config::Config, error::Error, net::Fd, state::Exit};
use close_fds::close_open_fds;
use nix::{
    errno::Errno,
    fcntl::{open, OFlag},
    sys::{
        signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal},
        stat::Mode,
        wait::{waitpid, WaitPidFlag, WaitStatus},
    },
    unistd::{
        access, chown, dup, dup2, execve, fork, getpid, getuid, setsid, AccessFlags, ForkResult,
        Pid, User,
    },
};
use std::{
    borrow::Cow,
    env,
    ffi::{CString, OsStr},
    fs,
    os::unix::{
        ffi::OsStrExt,
        fs::PermissionsExt,
        io::{AsRawFd, IntoRawFd, RawFd},
    },
    path::Path,
};
use wdog_log::{info, warn};

/// Set in the worker's environment when started under supervision.
pub const ENV_STARTED: &str = "WD_STARTED";
/// Path of the supervisor socket.
pub const ENV_SOCKET: &str = "WD_SOCKET";
/// The worker should detach its stdio once initialized.
pub const ENV_DETACH: &str = "WD_DETACH";
/// The worker replaces a previous generation.
pub const ENV_RESTARTED: &str = "WD_RESTARTED";

const DEV_NULL: &str = "/dev/null";

/// Fork and exec the worker.
///
/// Everything the child needs is prepared before `fork`; the child only
/// rearranges descriptors and calls `execve`.
pub fn spawn(config: &Config, generation: u32, restarted: bool) -> Result<Pid, Error> {
    let program = path_to_cstr(&config.worker)?;
    let mut args = vec![program.clone()];
    for arg in &config.args {
        args.push(CString::new(arg.as_str()).map_err(|_| Error::InvalidPath(arg.into()))?);
    }

    let mut markers = vec![
        (ENV_STARTED, Cow::Borrowed(OsStr::new("1"))),
        (ENV_SOCKET, Cow::Owned(config.socket_path().into_os_string())),
    ];
    if generation == 0 && config.detach() {
        markers.push((ENV_DETACH, Cow::Borrowed(OsStr::new("1"))));
    }
    if restarted {
        markers.push((ENV_RESTARTED, Cow::Borrowed(OsStr::new("1"))));
    }

    let mut environment = Vec::new();
    for (key, value) in env::vars_os() {
        if key.as_bytes().starts_with(b"WD_") {
            continue;
        }
        environment.push(env_cstr(&key, &value)?);
    }
    for (key, value) in &markers {
        environment.push(env_cstr(OsStr::new(key), value)?);
    }

    let dev_null = if generation > 0 {
        Some(CString::new(DEV_NULL).map_err(|_| Error::InvalidPath(DEV_NULL.into()))?)
    } else {
        None
    };

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            info!("started worker {} (generation {})", child, generation);
            Ok(child)
        }
        ForkResult::Child => {
            let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

            // Only the first generation keeps the terminal.
            if let Some(dev_null) = dev_null {
                if let Ok(fd) = open(dev_null.as_c_str(), OFlag::O_RDWR, Mode::empty()) {
                    for target in 0..=2 {
                        let _ = dup2(fd, target);
                    }
                }
            }

            // Rust sets most file descriptors to close-on-exec but we
            // make sure that any additional file descriptors are closed.
            unsafe {
                close_open_fds(3, &[]);
            }

            let _ = execve(&program, &args, &environment);

            unsafe { libc::_exit(1) }
        }
    }
}

/// Non-blocking check if the worker exited.
pub fn reap(pid: Pid) -> Result<Option<Exit>, Error> {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::Exited(_, code)) => Ok(Some(Exit::Code(code))),
        Ok(WaitStatus::Signaled(_, signal, _)) => Ok(Some(Exit::Signal(signal as i32))),
        Ok(_) => Ok(None),
        Err(Errno::ECHILD) => Ok(Some(Exit::NoChild)),
        Err(Errno::EINTR) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Result of `detach` in the calling process.
#[derive(Debug)]
pub enum Detached {
    /// The original process; exit with this code.
    Parent(i32),
    /// The detached supervisor.  `parent` waits for a notification.
    Child { parent: Pid },
}

/// Fork into the background.
///
/// The parent waits until the child reports that the worker finished
/// its first initialization (SIGUSR1) or failed (SIGUSR2 or the death
/// of the child).
pub fn detach() -> Result<Detached, Error> {
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGUSR1);
    signals.add(Signal::SIGUSR2);
    signals.add(Signal::SIGCHLD);
    let mut previous = SigSet::empty();
    sigprocmask(SigmaskHow::SIG_BLOCK, Some(&signals), Some(&mut previous))?;

    let parent = getpid();
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => {
            let code = match signals.wait()? {
                Signal::SIGUSR1 => 0,
                _ => 1,
            };
            Ok(Detached::Parent(code))
        }
        ForkResult::Child => {
            sigprocmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)?;
            setsid()?;
            Ok(Detached::Child { parent })
        }
    }
}

/// Tell a waiting parent about the first initialization.
pub fn notify_parent(parent: Pid, success: bool) {
    let signal = if success {
        Signal::SIGUSR1
    } else {
        Signal::SIGUSR2
    };
    if let Err(err) = kill(parent, signal) {
        warn!("failed to notify parent {}: {}", parent, err);
    }
}

pub fn write_pid_file(path: &Path) -> Result<(), Error> {
    fs::write(path, format!("{}\n", getpid()))?;
    Ok(())
}

/// Returns true if a supervisor is running for this PID file and socket.
pub fn running(pid_file: &Path, socket: &Path) -> bool {
    let pid = match fs::read_to_string(pid_file)
        .ok()
        .and_then(|content| content.trim().parse::<i32>().ok())
    {
        Some(pid) if pid > 0 => Pid::from_raw(pid),
        _ => return false,
    };
    kill(pid, None).is_ok() && socket.exists()
}

/// Create the temp directory with mode 0700 and make sure it is writable.
pub fn prepare_temp_dir(dir: &Path, user: Option<&str>) -> Result<(), Error> {
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

    if let Some(name) = user {
        if getuid().is_root() {
            let user = User::from_name(name)?
                .ok_or_else(|| Error::UserNotFound(name.to_string().into()))?;
            chown(dir, Some(user.uid), Some(user.gid))?;
        }
    }

    access(dir, AccessFlags::W_OK).map_err(|_| Error::InvalidPath(dir.to_path_buf()))?;

    Ok(())
}

/// Send stderr into `path`.  Returns the previous stderr.
pub fn redirect_stderr(path: &Path) -> Result<Fd, Error> {
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let saved = Fd::from(dup(2)?);
    saved.set_cloexec(true)?;
    dup2(file.as_raw_fd(), 2)?;
    Ok(saved)
}

/// Put a saved stderr back in place.
pub fn restore_stderr(saved: Fd) -> Result<(), Error> {
    dup2(saved.as_raw_fd(), 2)?;
    Ok(())
}

/// Point stdio at /dev/null.
pub fn detach_stdio(targets: &[RawFd]) -> Result<(), Error> {
    let fd = Fd::from(open(DEV_NULL, OFlag::O_RDWR, Mode::empty())?);
    for target in targets {
        if fd.as_raw_fd() != *target {
            dup2(fd.as_raw_fd(), *target)?;
        }
    }
    if targets.contains(&fd.as_raw_fd()) {
        let _ = fd.into_raw_fd();
    }
    Ok(())
}

/// Remove a file we created, ignoring that it is already gone.
pub fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {}", path.display(), err);
        }
    }
}

fn path_to_cstr(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath(path.to_path_buf()))
}

fn env_cstr(key: &OsStr, value: &OsStr) -> Result<CString, Error> {
    let mut pair = key.as_bytes().to_vec();
    pair.push(b'=');
    pair.extend_from_slice(value.as_bytes());
    CString::new(pair).map_err(|_| Error::Setup("invalid environment".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    #[test]
    fn test_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("test.pid");
        let socket = dir.path().join("test.sock");

        assert!(!running(&pid_file, &socket));
        write_pid_file(&pid_file).unwrap();
        assert_eq!(
            fs::read_to_string(&pid_file).unwrap(),
            format!("{}\n", getpid())
        );
        // The socket is missing.
        assert!(!running(&pid_file, &socket));
        fs::write(&socket, b"").unwrap();
        assert!(running(&pid_file, &socket));

        remove_file(&pid_file);
        remove_file(&pid_file);
        assert!(!pid_file.exists());
    }

    #[test]
    fn test_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        let temp_dir = dir.path().join("wdog");
        prepare_temp_dir(&temp_dir, None).unwrap();
        let mode = fs::metadata(&temp_dir).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn test_spawn_and_reap() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            temp_dir: dir.path().to_path_buf(),
            worker: "/bin/sh".into(),
            args: vec![
                "-c".to_string(),
                "test \"$WD_STARTED\" = 1 && test -n \"$WD_SOCKET\" && exit 7".to_string(),
            ],
            foreground: true,
            ..Default::default()
        };

        let pid = spawn(&config, 1, true).unwrap();
        let exit = loop {
            if let Some(exit) = reap(pid).unwrap() {
                break exit;
            }
            thread::sleep(Duration::from_millis(10));
        };
        assert_eq!(exit, Exit::Code(7));
        assert_eq!(reap(pid).unwrap(), Some(Exit::NoChild));
    }
}
