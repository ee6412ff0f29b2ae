//! The watchdog main loop.
//!
//! The supervisor spawns the worker, serves requests on the connection
//! table and classifies the death of each worker generation.  Signals
//! and messages only produce `Event`s; the lifecycle is changed in one
//! place per event.

use crate::{
    channel::Channel,
    config::Config,
    error::Error,
    lsmgr::{ListenSockets, Registry},
    message::{Kind, ListenSocketKey, Message, PasswordRequest, ProtocolError},
    net::Fd,
    password::{Passwords, Prompt, TtyPrompt},
    process,
    relay::{AdminRelay, Done},
    signals::{self, SignalEvent},
    state::{classify, Event, Exit, Lifecycle, Policy, Verdict},
    table::{ChannelId, ConnectionTable, Ready},
};
use nix::{
    sys::{
        signal::{kill, Signal},
        wait::waitpid,
    },
    unistd::Pid,
};
use std::{
    fs,
    io,
    os::unix::{fs::PermissionsExt, io::RawFd},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};
use tokio::{
    net::{UnixListener, UnixStream},
    sync::mpsc,
    time,
};
use wdog_log::{debug, error, info, warn};
use zeroize::Zeroizing;

/// How long a worker gets to exit before it is killed at shutdown.
const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed request either closes the channel it arrived on or ends
/// the supervisor.
#[derive(Debug)]
enum Failure {
    Channel(Error),
    Fatal(Error),
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Failure::Channel(err)
    }
}

impl From<ProtocolError> for Failure {
    fn from(err: ProtocolError) -> Self {
        Failure::Channel(err.into())
    }
}

enum Wakeup {
    Accepted(io::Result<UnixStream>),
    Ready(Vec<Ready>),
    Signal(SignalEvent),
}

pub struct Supervisor<L = Registry, P = TtyPrompt> {
    config: Config,
    listener: UnixListener,
    table: ConnectionTable,
    relay: AdminRelay,
    sockets: L,
    passwords: Passwords,
    prompt: P,
    signals: mpsc::UnboundedReceiver<SignalEvent>,
    state: Lifecycle,
    worker: Option<Pid>,
    generation: u32,
    restarted: bool,
    /// The current worker was asked to exit.
    killed: bool,
    verdict: Option<Verdict>,
    pid_file: PathBuf,
    pid_file_created: bool,
    /// Detached parent waiting for the first initialization.
    parent: Option<Pid>,
    /// Terminal stderr while a restart status file is in place.
    saved_stderr: Option<Fd>,
}

impl Supervisor {
    pub fn new(config: Config, parent: Option<Pid>) -> Result<Self, Error> {
        Self::with_collaborators(config, parent, Registry::default(), TtyPrompt)
    }
}

impl<L: ListenSockets, P: Prompt> Supervisor<L, P> {
    /// Set up the temp directory and the supervisor socket.
    pub fn with_collaborators(
        config: Config,
        parent: Option<Pid>,
        sockets: L,
        prompt: P,
    ) -> Result<Self, Error> {
        process::prepare_temp_dir(&config.temp_dir, config.user.as_deref())?;

        let path = config.socket_path();
        process::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        let signals = signals::install()?;
        let pid_file = config.pid_file();

        Ok(Self {
            table: ConnectionTable::new(config.capacity),
            config,
            listener,
            relay: AdminRelay::default(),
            sockets,
            passwords: Passwords::default(),
            prompt,
            signals,
            state: Lifecycle::default(),
            worker: None,
            generation: 0,
            restarted: false,
            killed: false,
            verdict: None,
            pid_file,
            pid_file_created: false,
            parent,
            saved_stderr: None,
        })
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    /// Supervise worker generations until one ends the watchdog.
    /// Returns the exit code.
    pub async fn run(mut self) -> i32 {
        let code = match self.supervise().await {
            Ok(code) => code,
            Err(err) => {
                error!("{}", err);
                1
            }
        };
        self.shutdown(code).await;
        code
    }

    async fn supervise(&mut self) -> Result<i32, Error> {
        loop {
            self.start_worker().await?;

            while self.verdict.is_none() {
                self.poll_once().await?;
            }

            match self.verdict.take() {
                Some(Verdict::Restart) => {
                    self.state = self.state.next(Event::Respawn)?;
                    self.generation += 1;
                    self.restarted = true;
                }
                Some(Verdict::Exit(code)) => {
                    self.state = self.state.next(Event::Exit(code))?;
                    return Ok(code);
                }
                None => {}
            }
        }
    }

    async fn start_worker(&mut self) -> Result<(), Error> {
        self.killed = false;
        loop {
            match process::spawn(&self.config, self.generation, self.restarted) {
                Ok(pid) => {
                    self.worker = Some(pid);
                    break;
                }
                Err(err) if self.generation == 0 => return Err(err),
                Err(err) => {
                    error!("failed to restart worker: {}", err);
                    time::sleep(self.config.poll_interval).await;
                }
            }
        }
        self.state = self.state.next(Event::Spawned)?;
        Ok(())
    }

    /// Wait for one wakeup and handle it.
    pub async fn poll_once(&mut self) -> Result<(), Error> {
        let wakeup = tokio::select! {
            accepted = self.listener.accept() => {
                Wakeup::Accepted(accepted.map(|(stream, _)| stream))
            }
            ready = self.table.wait_ready(self.config.poll_interval) => {
                Wakeup::Ready(ready.into_iter().collect())
            }
            Some(event) = self.signals.recv() => Wakeup::Signal(event),
        };

        match wakeup {
            Wakeup::Accepted(Ok(stream)) => match self.table.register(Channel::from(stream)) {
                Ok(id) => debug!("channel {} connected", id),
                Err(err) => error!("rejected connection: {}", err),
            },
            Wakeup::Accepted(Err(err)) => warn!("accept failed: {}", err),
            Wakeup::Ready(ready) => {
                for ready in ready {
                    self.service(ready).await?;
                }
            }
            Wakeup::Signal(event) => self.on_signal(event).await?,
        }

        self.housekeeping().await
    }

    /// Read from a ready channel.  A hung-up channel is drained until
    /// it reports `EmptyRead`.
    async fn service(&mut self, ready: Ready) -> Result<(), Error> {
        let id = ready.id;
        loop {
            let received = match self.table.get_mut(id) {
                Ok(channel) => channel.recv().await,
                Err(_) => return Ok(()),
            };

            let kind = match received {
                Ok((message, fd)) => {
                    let kind = message.kind();
                    match self.dispatch(id, message, fd).await {
                        Ok(()) => kind,
                        Err(Failure::Channel(err)) => {
                            warn!("channel {}: {}", id, err);
                            self.close(id);
                            return Ok(());
                        }
                        Err(Failure::Fatal(err)) => return Err(err),
                    }
                }
                Err(err) => {
                    warn!("channel {}: {}", id, err);
                    self.close(id);
                    return Ok(());
                }
            };

            if !ready.closed || kind == Kind::EmptyRead {
                return Ok(());
            }
        }
    }

    async fn dispatch(
        &mut self,
        id: ChannelId,
        message: Message,
        fd: Option<Fd>,
    ) -> Result<(), Failure> {
        let kind = message.kind();
        debug!("channel {}: received {}", id, message);
        if fd.is_some() {
            warn!("channel {}: closing unexpected descriptor with {}", id, kind);
        }

        if kind != Kind::EmptyRead {
            if let Some(awaiting) = self.table.get_mut(id)?.awaiting_reply() {
                debug!("channel {} is waiting for {}", id, awaiting);
                return Err(ProtocolError::Unexpected(kind).into());
            }
        }

        match kind {
            Kind::EmptyRead => self.close(id),
            Kind::GetListenSocket => self.get_listen_socket(id, &message).await?,
            Kind::CloseListenSocket => self.close_listen_socket(id, &message).await?,
            Kind::GetPassword => self.get_password(id, &message).await?,
            Kind::EndInit => self.end_init(id, &message).await?,
            Kind::SetPidPath => self.set_pid_path(id, &message).await?,
            Kind::Restart => self.restart(id, &message).await?,
            Kind::Terminate => {
                self.reply(id, Message::empty(Kind::TerminateReply)).await?;
                self.request_terminate().await;
            }
            Kind::Reconfigure => self.reconfigure(id).await?,
            Kind::GetReconfigStatus => self.attach_reconfigure(id).await?,
            Kind::ReconfigStatus => self.reconfigure_status(id, &message).await?,
            Kind::ReconfigStatusDone => self.reconfigure_done(id).await?,
            Kind::Rotate => {
                self.rotate_worker().await;
                self.reply(id, Message::empty(Kind::RotateReply)).await?;
            }
            // Replies only come from the worker answering a command.
            kind if (kind == Kind::EndInitReplyAck || kind.is_reply())
                && self.relay.admin() == Some(id) =>
            {
                debug!("worker acknowledged with {}", kind);
            }
            Kind::IdentifyStatsChannel | Kind::PeerReconfigure | Kind::PeerReopenLogs => {
                debug!("ignoring {}", kind);
            }
            kind if kind.is_stats() => debug!("ignoring stats message {}", kind),
            kind => return Err(ProtocolError::Unexpected(kind).into()),
        }

        Ok(())
    }

    async fn get_listen_socket(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        let key = message.decode::<ListenSocketKey>()?;
        let result = self.sockets.allocate(&key);
        let failed = match &result {
            Ok(_) => false,
            Err(errno) => {
                error!("failed to bind listen socket {}: {}", key, errno);
                true
            }
        };
        self.table.get_mut(id)?.send_listen_socket(result).await?;

        if failed && self.state == Lifecycle::Initializing {
            error!("listen socket failure during initialization");
            self.kill_worker().await;
        }
        Ok(())
    }

    async fn close_listen_socket(
        &mut self,
        id: ChannelId,
        message: &Message,
    ) -> Result<(), Failure> {
        let key = message.decode::<ListenSocketKey>()?;
        if let Err(errno) = self.sockets.release(&key) {
            warn!("failed to close listen socket {}: {}", key, errno);
        }
        self.reply(id, Message::empty(Kind::CloseListenSocketReply))
            .await
    }

    async fn get_password(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        let request = message.decode::<PasswordRequest>()?;
        let cached = self
            .passwords
            .lookup(&request.prompt, request.serial)
            .map(|value| Zeroizing::new(value.to_string()));

        // Only the first generation may ask the operator.
        let value = match cached {
            Some(value) => Some(value),
            None if self.generation == 0 && self.state == Lifecycle::Initializing => {
                let retry = self.passwords.contains(&request.prompt);
                match self.prompt.read(&request.prompt, retry) {
                    Ok(value) => {
                        self.passwords
                            .save(&request.prompt, request.serial, value.clone());
                        Some(value)
                    }
                    Err(err) => {
                        error!("error while reading password: {}", err);
                        None
                    }
                }
            }
            None => None,
        };

        let reply = Message::encode(
            Kind::GetPasswordReply,
            &value.as_ref().map(|value| value.as_str()),
        );
        self.reply(id, reply).await
    }

    async fn end_init(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        let workers = message.decode::<u32>()?;
        let state = self
            .state
            .next(Event::EndInit)
            .map_err(|_| ProtocolError::Unexpected(Kind::EndInit))?;

        if let Err(err) = process::write_pid_file(&self.pid_file) {
            return Err(Failure::Fatal(Error::Setup(
                format!("could not log PID to {}: {}", self.pid_file.display(), err).into(),
            )));
        }
        self.pid_file_created = true;
        self.state = state;

        self.reply(id, Message::empty(Kind::EndInitReply)).await?;
        self.relay.bind_admin(id, workers);
        info!(
            "worker initialized with {} processes, admin channel {}",
            workers, id
        );

        self.on_steady().await;
        Ok(())
    }

    /// The worker generation finished its initialization.
    async fn on_steady(&mut self) {
        let first = self.generation == 0;
        if first {
            if let Some(parent) = self.parent.take() {
                process::notify_parent(parent, true);
            }
        }

        let saved = self.saved_stderr.take();
        if self.config.detach() {
            let targets: &[RawFd] = if first { &[0, 1, 2] } else { &[2] };
            if let Err(err) = process::detach_stdio(targets) {
                warn!("failed to detach stdio: {}", err);
            }
            wdog_log::set_stderr(false);
        } else if let Some(saved) = saved {
            if let Err(err) = process::restore_stderr(saved) {
                warn!("failed to restore stderr: {}", err);
            }
        }

        if let Some(owner) = self.relay.take_restart() {
            if let Ok(channel) = self.table.get_mut(owner) {
                channel.set_awaiting_reply(None);
            }
            if self
                .forward(owner, Message::empty(Kind::RestartReply))
                .await
            {
                info!("restart complete");
            }
        }
    }

    async fn set_pid_path(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        if self.state != Lifecycle::Initializing {
            return Err(ProtocolError::Unexpected(Kind::SetPidPath).into());
        }
        let path = message.as_str()?;
        if path.is_empty() {
            return Err(ProtocolError::Malformed(Kind::SetPidPath, "empty path".into()).into());
        }
        let path = PathBuf::from(path);
        // The next EndInit writes the file at its new location.
        if self.pid_file_created && path != self.pid_file {
            process::remove_file(&self.pid_file);
            self.pid_file_created = false;
        }
        self.pid_file = path;
        debug!("PID file set to {}", self.pid_file.display());
        self.reply(id, Message::empty(Kind::SetPidPathReply)).await
    }

    async fn restart(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        let status_file = message.as_str()?.to_string();
        let relay = &mut self.relay;
        let result = self.state.next(Event::Restart).and_then(|state| {
            relay.begin_restart(id)?;
            Ok(state)
        });

        let state = match result {
            Ok(state) => state,
            Err(err) => {
                warn!("restart rejected: {}", err);
                return self
                    .reply(id, Message::text(Kind::RestartReply, &err.to_string()))
                    .await;
            }
        };

        if !status_file.is_empty() {
            match process::redirect_stderr(Path::new(&status_file)) {
                Ok(saved) => {
                    self.saved_stderr.get_or_insert(saved);
                    wdog_log::set_stderr(true);
                }
                Err(err) => warn!("failed to open status file {}: {}", status_file, err),
            }
        }

        self.table.get_mut(id)?.set_awaiting_reply(Some(Kind::Restart));
        self.state = state;
        info!("restart requested by channel {}", id);
        self.kill_worker().await;
        Ok(())
    }

    async fn reconfigure(&mut self, id: ChannelId) -> Result<(), Failure> {
        let admin = self.relay.admin();
        let relay = &mut self.relay;
        let result = match admin {
            Some(admin) => self.state.next(Event::Reconfigure).and_then(|state| {
                relay.begin_reconfigure(id)?;
                Ok((state, admin))
            }),
            None => Err(Error::NotReady),
        };

        match result {
            Ok((state, admin)) => {
                self.state = state;
                info!("reconfiguration requested by channel {}", id);
                self.forward(admin, Message::empty(Kind::Reconfigure)).await;
                self.reply(id, Message::empty(Kind::ReconfigureReply)).await
            }
            Err(err) => {
                warn!("reconfiguration rejected: {}", err);
                self.reply(id, Message::empty(Kind::ReconfigureReply)).await?;
                self.reply(
                    id,
                    Message::text(Kind::GetReconfigStatusReply, &err.to_string()),
                )
                .await?;
                self.reply(id, Message::empty(Kind::GetReconfigStatusReply))
                    .await
            }
        }
    }

    /// Take over the status lines of a running reconfiguration.  A
    /// displaced owner is finished off with the terminal reply.
    async fn attach_reconfigure(&mut self, id: ChannelId) -> Result<(), Failure> {
        match self.relay.attach(id) {
            None => {
                self.reply(id, Message::empty(Kind::GetReconfigStatusReply))
                    .await
            }
            Some(Some(previous)) => {
                info!("channel {} took over reconfiguration status from {}", id, previous);
                let status = Message::text(
                    Kind::GetReconfigStatusReply,
                    "reconfiguration status taken over by another client",
                );
                if self.forward(previous, status).await {
                    self.forward(previous, Message::empty(Kind::GetReconfigStatusReply))
                        .await;
                }
                Ok(())
            }
            Some(None) => Ok(()),
        }
    }

    async fn reconfigure_status(&mut self, id: ChannelId, message: &Message) -> Result<(), Failure> {
        let status = message.as_str()?;
        if !status.is_empty() {
            info!("reconfiguration status: {}", status);
            if let Some(owner) = self.relay.status_owner() {
                self.forward(owner, Message::text(Kind::GetReconfigStatusReply, status))
                    .await;
            }
        }
        self.reply(id, Message::empty(Kind::ReconfigStatusReply)).await
    }

    async fn reconfigure_done(&mut self, id: ChannelId) -> Result<(), Failure> {
        match self.relay.status_done() {
            Done::Complete(owner) => {
                info!("reconfiguration complete");
                if let Some(owner) = owner {
                    self.forward(owner, Message::empty(Kind::GetReconfigStatusReply))
                        .await;
                }
                self.state = self.state.next(Event::ReconfigureDone)?;
            }
            Done::Pending(remaining) => debug!("waiting for {} more workers", remaining),
            Done::Unexpected => warn!("no reconfiguration in progress"),
        }
        self.reply(id, Message::empty(Kind::ReconfigStatusDoneReply))
            .await
    }

    async fn on_signal(&mut self, event: SignalEvent) -> Result<(), Error> {
        match event {
            SignalEvent::Terminate => {
                info!("received terminate signal");
                self.request_terminate().await;
            }
            SignalEvent::Restart => match self.state.next(Event::Restart) {
                Ok(state) => {
                    info!("received restart signal");
                    self.state = state;
                    self.kill_worker().await;
                }
                Err(err) => warn!("restart signal ignored: {}", err),
            },
            SignalEvent::Rotate => self.rotate_worker().await,
            SignalEvent::ChildDied => self.reap_worker()?,
        }
        Ok(())
    }

    async fn request_terminate(&mut self) {
        match self.state.next(Event::Terminate) {
            Ok(state) => self.state = state,
            Err(err) => warn!("terminate ignored: {}", err),
        }
        self.kill_worker().await;
    }

    async fn rotate_worker(&mut self) {
        match self.relay.admin() {
            Some(admin) if self.state.is_ready() => {
                self.forward(admin, Message::empty(Kind::Rotate)).await;
            }
            _ => debug!("worker not ready, not rotating logs"),
        }
    }

    /// Ask the worker to exit, via its admin channel if it has one.
    async fn kill_worker(&mut self) {
        let pid = match self.worker {
            Some(pid) if !self.killed => pid,
            _ => return,
        };
        self.killed = true;

        if let Some(admin) = self.relay.admin() {
            if self.forward(admin, Message::empty(Kind::Terminate)).await {
                return;
            }
        }
        if let Err(err) = kill(pid, Signal::SIGTERM) {
            warn!("failed to terminate worker {}: {}", pid, err);
        }
    }

    async fn housekeeping(&mut self) -> Result<(), Error> {
        if let Some(owner) = self
            .relay
            .expire(Instant::now(), self.config.reconfigure_timeout)
        {
            warn!("reconfiguration timed out");
            if let Some(owner) = owner {
                let status =
                    Message::text(Kind::GetReconfigStatusReply, "reconfiguration timed out");
                if self.forward(owner, status).await {
                    self.forward(owner, Message::empty(Kind::GetReconfigStatusReply))
                        .await;
                }
            }
            self.state = self.state.next(Event::ReconfigureDone)?;
        }

        self.reap_worker()
    }

    /// Collect the worker if it exited and decide what happens next.
    fn reap_worker(&mut self) -> Result<(), Error> {
        let pid = match self.worker {
            Some(pid) => pid,
            None => return Ok(()),
        };
        let exit = match process::reap(pid)? {
            Some(exit) => exit,
            None => return Ok(()),
        };
        self.worker = None;

        match exit {
            Exit::NoChild => error!("waitpid returned ECHILD unexpectedly"),
            Exit::Code(0) => info!("worker {} exited", pid),
            exit => error!("worker {} terminated with {}", pid, exit),
        }

        self.state = self.state.next(Event::ChildDied)?;

        let (owner, reconfiguring) = self.relay.reset();
        if reconfiguring && !self.killed {
            warn!("worker died during reconfiguration, unbinding all listen sockets");
            self.sockets.release_all();
        }
        // The requester observes the closed channel.
        if let Some(owner) = owner {
            self.close(owner);
        }

        if let Lifecycle::ShuttingDown(reason) = self.state {
            let policy = Policy {
                auto_restart: self.config.auto_restart(),
                check: self.config.check,
            };
            let verdict = classify(reason, exit, policy);
            match verdict {
                Verdict::Restart => info!("restarting worker after {}", reason),
                Verdict::Exit(code) => info!("watchdog exiting after {} ({})", reason, code),
            }
            self.verdict = Some(verdict);
        }

        Ok(())
    }

    /// Reply on the channel a request arrived on.
    async fn reply(
        &mut self,
        id: ChannelId,
        message: Result<Message, ProtocolError>,
    ) -> Result<(), Failure> {
        let message = message?;
        self.table.get_mut(id)?.send(&message).await?;
        Ok(())
    }

    /// Send to another channel.  A failure only closes that channel.
    async fn forward(&mut self, id: ChannelId, message: Result<Message, ProtocolError>) -> bool {
        let message = match message {
            Ok(message) => message,
            Err(err) => {
                error!("invalid message for channel {}: {}", id, err);
                return false;
            }
        };
        let result = match self.table.get_mut(id) {
            Ok(channel) => channel.send(&message).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(_) => true,
            Err(err) => {
                warn!("channel {}: failed to send {}: {}", id, message.kind(), err);
                self.close(id);
                false
            }
        }
    }

    fn close(&mut self, id: ChannelId) {
        if self.table.unregister(id).is_none() {
            return;
        }
        let released = self.relay.on_closed(id);
        if released.admin {
            info!("worker admin channel {} closed", id);
        }
        if released.restart {
            warn!("restart requester {} went away", id);
        }
        if released.reconfigure {
            debug!("reconfiguration requester {} went away", id);
        }
        debug!("channel {} closed", id);
    }

    /// Stop the worker and remove everything the watchdog created.
    async fn shutdown(&mut self, code: i32) {
        self.stop_worker().await;

        if let Some(owner) = self.relay.take_restart() {
            let status = format!("watchdog exited with status {}", code);
            self.forward(owner, Message::text(Kind::RestartReply, &status))
                .await;
        }
        if let Some(parent) = self.parent.take() {
            process::notify_parent(parent, code == 0);
        }

        self.sockets.release_all();
        if self.pid_file_created {
            process::remove_file(&self.pid_file);
        }
        process::remove_file(&self.config.socket_path());
    }

    async fn stop_worker(&mut self) {
        let pid = match self.worker {
            Some(pid) => pid,
            None => return,
        };
        self.kill_worker().await;

        let deadline = Instant::now() + STOP_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = process::reap(pid) {
                self.worker = None;
                return;
            }
            time::sleep(Duration::from_millis(100)).await;
        }

        warn!("worker {} did not exit, killing it", pid);
        let _ = kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
        self.worker = None;
    }
}
