//! The supervisor lifecycle as one explicit state machine.

use crate::error::Error;
use derive_more::Display;

/// Exit code a worker uses to ask for a restart.
pub const RESTART_ON_EXIT: i32 = 99;

/// Why the supervisor is waiting for the worker to go away.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Reason {
    #[display(fmt = "termination")]
    Terminate,
    #[display(fmt = "restart")]
    Restart,
    #[display(fmt = "initialization failure")]
    InitFailed,
    #[display(fmt = "crash")]
    Crashed,
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Spawning,
    Initializing,
    Steady,
    RestartRequested,
    ReconfigureRequested,
    TerminateRequested,
    #[display(fmt = "ShuttingDown({})", "_0")]
    ShuttingDown(Reason),
    #[display(fmt = "Stopped({})", "_0")]
    Stopped(i32),
}

/// Inputs of the state machine.  Signal handlers and the message
/// dispatcher only produce events; `Lifecycle::next` consumes them.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Spawned,
    EndInit,
    ChildDied,
    Restart,
    Reconfigure,
    ReconfigureDone,
    Terminate,
    Respawn,
    #[display(fmt = "Exit({})", "_0")]
    Exit(i32),
}

impl Default for Lifecycle {
    fn default() -> Self {
        Lifecycle::Spawning
    }
}

impl Lifecycle {
    /// Returns the next state or an error if `event` is not accepted.
    pub fn next(self, event: Event) -> Result<Lifecycle, Error> {
        use Lifecycle::*;

        let state = match (self, event) {
            (Stopped(_), _) => return Err(Error::NotReady),
            (_, Event::Exit(code)) => Stopped(code),
            (Spawning, Event::Spawned) => Initializing,
            (Initializing, Event::EndInit) => Steady,
            (Spawning | Initializing, Event::Restart | Event::Reconfigure) => {
                return Err(Error::NotReady)
            }
            (Steady | ReconfigureRequested, Event::Restart) => RestartRequested,
            (RestartRequested, Event::Restart) => return Err(Error::Busy("restart")),
            (Steady, Event::Reconfigure) => ReconfigureRequested,
            (ReconfigureRequested, Event::Reconfigure) => {
                return Err(Error::Busy("reconfiguration"))
            }
            (ReconfigureRequested, Event::ReconfigureDone) => Steady,
            (state, Event::ReconfigureDone) => state,
            (ShuttingDown(reason), Event::Terminate) => ShuttingDown(reason),
            (_, Event::Terminate) => TerminateRequested,
            (TerminateRequested, Event::ChildDied) => ShuttingDown(Reason::Terminate),
            (RestartRequested, Event::ChildDied) => ShuttingDown(Reason::Restart),
            (Spawning | Initializing, Event::ChildDied) => ShuttingDown(Reason::InitFailed),
            (Steady | ReconfigureRequested, Event::ChildDied) => ShuttingDown(Reason::Crashed),
            (ShuttingDown(_), Event::Respawn) => Spawning,
            (state, event) => {
                return Err(Error::Setup(
                    format!("{} not accepted in state {}", event, state).into(),
                ))
            }
        };

        Ok(state)
    }

    /// The worker finished initialization and is still running.
    pub fn is_ready(self) -> bool {
        matches!(
            self,
            Lifecycle::Steady | Lifecycle::ReconfigureRequested | Lifecycle::RestartRequested
        )
    }
}

/// How the worker process ended.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    #[display(fmt = "status {}", "_0")]
    Code(i32),
    #[display(fmt = "signal {}", "_0")]
    Signal(i32),
    /// `waitpid` reported that there is no such child.
    #[display(fmt = "no child")]
    NoChild,
}

/// Restart policy inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub auto_restart: bool,
    /// Transient child mode: the worker only validates its configuration.
    pub check: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            auto_restart: true,
            check: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Restart,
    Exit(i32),
}

/// Classify the death of a worker.
pub fn classify(reason: Reason, exit: Exit, policy: Policy) -> Verdict {
    match (reason, exit) {
        (Reason::Terminate, Exit::NoChild) => Verdict::Exit(1),
        (Reason::Terminate, _) => Verdict::Exit(0),
        (Reason::InitFailed, Exit::Code(0)) if policy.check => Verdict::Exit(0),
        (Reason::InitFailed, _) => Verdict::Exit(1),
        (Reason::Restart, _) => Verdict::Restart,
        (Reason::Crashed, Exit::Code(0)) => Verdict::Exit(0),
        (Reason::Crashed, Exit::Code(RESTART_ON_EXIT)) => Verdict::Restart,
        (Reason::Crashed, _) if policy.auto_restart => Verdict::Restart,
        (Reason::Crashed, Exit::Code(code)) => Verdict::Exit(code),
        (Reason::Crashed, Exit::Signal(_) | Exit::NoChild) => Verdict::Exit(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle() {
        let state = Lifecycle::default();
        let state = state.next(Event::Spawned).unwrap();
        assert_eq!(state, Lifecycle::Initializing);
        assert!(matches!(state.next(Event::Restart), Err(Error::NotReady)));
        assert!(matches!(state.next(Event::Reconfigure), Err(Error::NotReady)));

        let state = state.next(Event::EndInit).unwrap();
        assert!(state.is_ready());
        let state = state.next(Event::Reconfigure).unwrap();
        assert!(matches!(
            state.next(Event::Reconfigure),
            Err(Error::Busy("reconfiguration"))
        ));
        let state = state.next(Event::ReconfigureDone).unwrap();
        assert_eq!(state, Lifecycle::Steady);

        let state = state.next(Event::Restart).unwrap();
        assert!(matches!(state.next(Event::Restart), Err(Error::Busy("restart"))));
        let state = state.next(Event::ChildDied).unwrap();
        assert_eq!(state, Lifecycle::ShuttingDown(Reason::Restart));
        assert_eq!(state.next(Event::Respawn).unwrap(), Lifecycle::Spawning);
    }

    #[test]
    fn test_terminate_wins() {
        let state = Lifecycle::Steady.next(Event::Terminate).unwrap();
        assert_eq!(state, Lifecycle::TerminateRequested);
        let state = state.next(Event::ChildDied).unwrap();
        assert_eq!(state, Lifecycle::ShuttingDown(Reason::Terminate));
        assert_eq!(state.next(Event::Terminate).unwrap(), state);
        let state = state.next(Event::Exit(0)).unwrap();
        assert_eq!(state, Lifecycle::Stopped(0));
        assert!(state.next(Event::Respawn).is_err());
    }

    #[test]
    fn test_classify() {
        let policy = Policy::default();
        let strict = Policy {
            auto_restart: false,
            ..policy
        };
        let check = Policy {
            check: true,
            ..policy
        };

        assert_eq!(classify(Reason::Terminate, Exit::Signal(15), policy), Verdict::Exit(0));
        assert_eq!(classify(Reason::Terminate, Exit::NoChild, policy), Verdict::Exit(1));
        assert_eq!(classify(Reason::InitFailed, Exit::Code(0), policy), Verdict::Exit(1));
        assert_eq!(classify(Reason::InitFailed, Exit::Code(0), check), Verdict::Exit(0));
        assert_eq!(classify(Reason::InitFailed, Exit::Code(2), check), Verdict::Exit(1));
        assert_eq!(classify(Reason::Restart, Exit::Signal(15), strict), Verdict::Restart);
        assert_eq!(classify(Reason::Crashed, Exit::Code(0), policy), Verdict::Exit(0));
        assert_eq!(classify(Reason::Crashed, Exit::Code(3), policy), Verdict::Restart);
        assert_eq!(classify(Reason::Crashed, Exit::Code(3), strict), Verdict::Exit(3));
        assert_eq!(classify(Reason::Crashed, Exit::Signal(9), policy), Verdict::Restart);
        assert_eq!(classify(Reason::Crashed, Exit::Signal(9), strict), Verdict::Exit(1));
        assert_eq!(
            classify(Reason::Crashed, Exit::Code(RESTART_ON_EXIT), strict),
            Verdict::Restart
        );
        assert_eq!(classify(Reason::Crashed, Exit::NoChild, policy), Verdict::Restart);
    }
}
