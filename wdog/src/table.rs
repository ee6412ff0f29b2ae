//! The bounded set of open channels and the multiplexed readiness wait.

use crate::{channel::Channel, error::Error};
use derive_more::Display;
use futures::{future::select_all, FutureExt};
use nix::sys::socket::{recv, MsgFlags};
use std::{
    collections::HashMap,
    io,
    os::unix::io::AsRawFd,
    time::Duration,
    vec,
};
use tokio::{io::Interest, time};

/// Identity of a registered channel.  Never reused within a process.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "#{}", "_0")]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// A channel reported by `ConnectionTable::wait_ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub id: ChannelId,
    /// The peer hung up.  Pending messages can still be read until
    /// the channel reports `EmptyRead`.
    pub closed: bool,
}

/// Channels that became ready in one wait.
#[derive(Debug, Default)]
pub struct ReadySet(Vec<Ready>);

impl ReadySet {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for ReadySet {
    type Item = Ready;
    type IntoIter = vec::IntoIter<Ready>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Open channels of the watchdog.
#[derive(Debug)]
pub struct ConnectionTable {
    channels: HashMap<ChannelId, Channel>,
    capacity: usize,
    next_id: u64,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: HashMap::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn register(&mut self, channel: Channel) -> Result<ChannelId, Error> {
        if self.channels.len() >= self.capacity {
            return Err(Error::TableFull(self.capacity));
        }
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        self.channels.insert(id, channel);
        Ok(id)
    }

    /// Remove a channel; dropping it closes the connection.
    pub fn unregister(&mut self, id: ChannelId) -> Option<Channel> {
        self.channels.remove(&id)
    }

    pub fn get_mut(&mut self, id: ChannelId) -> Result<&mut Channel, Error> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| Error::UnknownChannel(id.get()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Wait until at least one channel has data or hung up, or until
    /// `timeout` elapsed.  An empty set means the timeout expired.
    pub async fn wait_ready(&self, timeout: Duration) -> ReadySet {
        if self.channels.is_empty() {
            time::sleep(timeout).await;
            return ReadySet::default();
        }

        let waits = self.channels.iter().map(|(id, channel)| {
            async move {
                let closed = readable(channel).await.unwrap_or(true);
                Ready { id: *id, closed }
            }
            .boxed()
        });

        let mut ready = Vec::new();
        if let Ok((first, _, rest)) = time::timeout(timeout, select_all(waits)).await {
            ready.push(first);
            ready.extend(rest.into_iter().filter_map(FutureExt::now_or_never));
        }
        ready.sort_by_key(|ready| ready.id);

        ReadySet(ready)
    }
}

/// Wait for pending data or a hang-up.  Returns true if the peer closed.
///
/// tokio keeps the readiness of a socket until an operation reports
/// `WouldBlock`, so a peek confirms that a message is really pending.
async fn readable(channel: &Channel) -> io::Result<bool> {
    let socket = channel.socket();
    loop {
        socket.readable().await?;

        let mut buf = [0u8; 1];
        match socket.try_io(Interest::READABLE, || {
            recv(channel.as_raw_fd(), &mut buf, MsgFlags::MSG_PEEK).map_err(io::Error::from)
        }) {
            Ok(count) => return Ok(count == 0),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Kind, Message};

    #[tokio::test]
    async fn test_capacity() {
        let mut table = ConnectionTable::new(2);
        let (a, b) = Channel::pair().unwrap();
        let (c, _d) = Channel::pair().unwrap();

        let first = table.register(a).unwrap();
        let second = table.register(b).unwrap();
        assert_ne!(first, second);
        assert!(matches!(table.register(c), Err(Error::TableFull(2))));

        assert!(table.unregister(first).is_some());
        assert!(table.unregister(first).is_none());
        assert!(table.get_mut(first).is_err());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_wait_ready() {
        let mut table = ConnectionTable::new(8);
        let (mut peer1, local1) = Channel::pair().unwrap();
        let (peer2, local2) = Channel::pair().unwrap();
        let (_peer3, local3) = Channel::pair().unwrap();

        let id1 = table.register(local1).unwrap();
        let id2 = table.register(local2).unwrap();
        table.register(local3).unwrap();

        let ready = table.wait_ready(Duration::from_millis(50)).await;
        assert!(ready.is_empty());

        peer1
            .send(&Message::text(Kind::ReconfigStatus, "ok").unwrap())
            .await
            .unwrap();
        drop(peer2);
        time::sleep(Duration::from_millis(20)).await;

        let ready = table.wait_ready(Duration::from_secs(5)).await;
        let ready = ready.into_iter().collect::<Vec<_>>();
        assert_eq!(
            ready,
            vec![
                Ready {
                    id: id1,
                    closed: false
                },
                Ready {
                    id: id2,
                    closed: true
                }
            ]
        );

        // Consuming the message clears the readiness.
        let (message, _) = table.get_mut(id1).unwrap().recv().await.unwrap();
        assert_eq!(message.kind(), Kind::ReconfigStatus);
        table.unregister(id2);

        let ready = table.wait_ready(Duration::from_millis(50)).await;
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn test_wait_without_channels() {
        let table = ConnectionTable::new(1);
        let ready = table.wait_ready(Duration::from_millis(10)).await;
        assert_eq!(ready.len(), 0);
    }
}
