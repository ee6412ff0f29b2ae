//! Routing between the worker's admin channel and transient admin clients.

use crate::{error::Error, table::ChannelId};
use std::time::{Duration, Instant};

/// An open reconfigure exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Countdown {
    /// Client that receives the status lines; cleared if it went away.
    owner: Option<ChannelId>,
    /// Outstanding `ReconfigStatusDone` messages.
    remaining: u32,
    started: Instant,
}

/// Outcome of a `ReconfigStatusDone`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Done {
    /// More completions are expected.
    Pending(u32),
    /// The countdown reached zero; the owner, if still present, gets
    /// the terminal reply.
    Complete(Option<ChannelId>),
    /// No reconfiguration was in progress.
    Unexpected,
}

/// Channels released by `AdminRelay::on_closed`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Released {
    pub admin: bool,
    pub restart: bool,
    pub reconfigure: bool,
}

#[derive(Debug, Default)]
pub struct AdminRelay {
    /// The worker's long-lived control channel, bound at `EndInit`.
    admin: Option<ChannelId>,
    /// Worker processes reported at `EndInit`.
    workers: u32,
    /// Client waiting for the deferred `RestartReply`.
    restart: Option<ChannelId>,
    reconfigure: Option<Countdown>,
}

impl AdminRelay {
    pub fn bind_admin(&mut self, id: ChannelId, workers: u32) {
        self.admin = Some(id);
        self.workers = workers.max(1);
    }

    pub fn admin(&self) -> Option<ChannelId> {
        self.admin
    }

    /// Forget every reference to a closed channel.
    pub fn on_closed(&mut self, id: ChannelId) -> Released {
        let mut released = Released::default();
        if self.admin == Some(id) {
            self.admin = None;
            released.admin = true;
        }
        if self.restart == Some(id) {
            self.restart = None;
            released.restart = true;
        }
        if let Some(countdown) = &mut self.reconfigure {
            if countdown.owner == Some(id) {
                countdown.owner = None;
                released.reconfigure = true;
            }
        }
        released
    }

    /// Stash the token for a deferred restart reply.
    pub fn begin_restart(&mut self, id: ChannelId) -> Result<(), Error> {
        if self.restart.is_some() {
            return Err(Error::Busy("restart"));
        }
        self.restart = Some(id);
        Ok(())
    }

    /// Resolve the restart token.  Returns the channel to reply to.
    pub fn take_restart(&mut self) -> Option<ChannelId> {
        self.restart.take()
    }

    /// Open a countdown of `workers` completions for `id`.
    pub fn begin_reconfigure(&mut self, id: ChannelId) -> Result<(), Error> {
        if self.reconfigure.is_some() {
            return Err(Error::Busy("reconfiguration"));
        }
        self.reconfigure = Some(Countdown {
            owner: Some(id),
            remaining: self.workers.max(1),
            started: Instant::now(),
        });
        Ok(())
    }

    pub fn reconfigure_pending(&self) -> bool {
        self.reconfigure.is_some()
    }

    /// Make `id` the receiver of the running countdown's status lines.
    /// Returns `None` if no reconfiguration is in progress, otherwise the
    /// previous owner that was displaced, if any.
    pub fn attach(&mut self, id: ChannelId) -> Option<Option<ChannelId>> {
        let countdown = self.reconfigure.as_mut()?;
        let previous = countdown.owner.replace(id);
        Some(previous.filter(|previous| *previous != id))
    }

    /// The client that receives relayed status lines.
    pub fn status_owner(&self) -> Option<ChannelId> {
        self.reconfigure.as_ref().and_then(|countdown| countdown.owner)
    }

    pub fn status_done(&mut self) -> Done {
        let remaining = match &mut self.reconfigure {
            Some(countdown) => {
                countdown.remaining = countdown.remaining.saturating_sub(1);
                countdown.remaining
            }
            None => return Done::Unexpected,
        };
        if remaining > 0 {
            return Done::Pending(remaining);
        }
        Done::Complete(self.reconfigure.take().and_then(|countdown| countdown.owner))
    }

    /// Close a countdown that has been open for longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Option<Option<ChannelId>> {
        let expired = self
            .reconfigure
            .as_ref()
            .map(|countdown| now.saturating_duration_since(countdown.started) >= timeout)
            .unwrap_or(false);
        if expired {
            self.reconfigure.take().map(|countdown| countdown.owner)
        } else {
            None
        }
    }

    /// The worker is gone: drop the admin channel and any open countdown.
    /// Returns the countdown owner, if any, and whether a countdown was open.
    pub fn reset(&mut self) -> (Option<ChannelId>, bool) {
        self.admin = None;
        self.workers = 0;
        match self.reconfigure.take() {
            Some(countdown) => (countdown.owner, true),
            None => (None, false),
        }
    }
}
