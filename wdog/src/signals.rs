//! Signals are turned into events for the main loop.

use crate::error::Error;
use derive_more::Display;
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};
use wdog_log::debug;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGTERM or SIGINT.
    Terminate,
    /// SIGHUP.
    Restart,
    /// SIGUSR1.
    Rotate,
    /// SIGCHLD.
    ChildDied,
}

/// Install the handlers.  Must be called from within the runtime.
pub fn install() -> Result<mpsc::UnboundedReceiver<SignalEvent>, Error> {
    let (sender, receiver) = mpsc::unbounded_channel();

    let signals = [
        (SignalKind::terminate(), SignalEvent::Terminate),
        (SignalKind::interrupt(), SignalEvent::Terminate),
        (SignalKind::hangup(), SignalEvent::Restart),
        (SignalKind::user_defined1(), SignalEvent::Rotate),
        (SignalKind::child(), SignalEvent::ChildDied),
    ];

    for (kind, event) in signals {
        let mut stream = signal(kind)?;
        let sender = sender.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                debug!("received signal: {}", event);
                if sender.send(event).is_err() {
                    break;
                }
            }
        });
    }

    Ok(receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::{
        sys::signal::{kill, Signal},
        unistd::getpid,
    };
    use std::time::Duration;

    #[tokio::test]
    async fn test_rotate_signal() {
        let mut events = install().unwrap();
        kill(getpid(), Signal::SIGUSR1).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap();
        assert_eq!(event, Some(SignalEvent::Rotate));
    }
}
