//! Listen sockets owned by the watchdog on behalf of the worker.

use crate::{
    message::{Family, ListenSocketKey},
    net::Fd,
};
use nix::{
    errno::Errno,
    sys::socket::{
        bind, listen, setsockopt, socket, sockopt, AddressFamily, SockFlag, SockType,
        SockaddrIn, SockaddrIn6, UnixAddr,
    },
};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6},
    os::unix::io::AsRawFd,
};
use wdog_log::{debug, info};

/// Allocation and release of bound listen sockets.
pub trait ListenSockets {
    /// Return the socket for `key`, binding it on first use.
    fn allocate(&mut self, key: &ListenSocketKey) -> Result<&Fd, Errno>;

    /// Close the socket for `key`.
    fn release(&mut self, key: &ListenSocketKey) -> Result<(), Errno>;

    /// Close all sockets.
    fn release_all(&mut self);
}

/// Sockets are identified by what they are bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Binding {
    family: Family,
    addr: Option<String>,
    port: u16,
}

impl From<&ListenSocketKey> for Binding {
    fn from(key: &ListenSocketKey) -> Self {
        Self {
            family: key.family,
            addr: key.addr.clone(),
            port: key.port,
        }
    }
}

/// The default listen socket registry.
#[derive(Debug, Default)]
pub struct Registry {
    sockets: HashMap<Binding, (ListenSocketKey, Fd)>,
}

impl Registry {
    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }
}

impl ListenSockets for Registry {
    fn allocate(&mut self, key: &ListenSocketKey) -> Result<&Fd, Errno> {
        let binding = Binding::from(key);
        if !self.sockets.contains_key(&binding) {
            let fd = open_listener(key)?;
            info!("bound listen socket {}", key);
            self.sockets.insert(binding.clone(), (key.clone(), fd));
        }
        self.sockets
            .get(&binding)
            .map(|(_, fd)| fd)
            .ok_or(Errno::ENOENT)
    }

    fn release(&mut self, key: &ListenSocketKey) -> Result<(), Errno> {
        let (key, _fd) = self
            .sockets
            .remove(&Binding::from(key))
            .ok_or(Errno::ENOENT)?;
        info!("closed listen socket {}", key);
        Ok(())
    }

    fn release_all(&mut self) {
        for (_, (key, _fd)) in self.sockets.drain() {
            debug!("unbinding listen socket {}", key);
        }
    }
}

fn open_listener(key: &ListenSocketKey) -> Result<Fd, Errno> {
    let family = match key.family {
        Family::Inet => AddressFamily::Inet,
        Family::Inet6 => AddressFamily::Inet6,
        Family::Unix => AddressFamily::Unix,
    };

    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "android", target_os = "freebsd",
                     target_os = "linux", target_os = "openbsd"))] {
            let fd = Fd::from(socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?);
        } else {
            let fd = Fd::from(socket(family, SockType::Stream, SockFlag::empty(), None)?);
            fd.set_cloexec(true).map_err(|_| Errno::EBADF)?;
        }
    }
    let raw = fd.as_raw_fd();

    if key.family != Family::Unix {
        setsockopt(raw, sockopt::ReuseAddr, &true)?;
    }
    if key.send_buffer > 0 {
        setsockopt(raw, sockopt::SndBuf, &key.send_buffer)?;
    }
    if key.recv_buffer > 0 {
        setsockopt(raw, sockopt::RcvBuf, &key.recv_buffer)?;
    }

    let addr = key.addr.as_deref();
    match key.family {
        Family::Inet => {
            let ip = match addr {
                Some(addr) => addr.parse::<Ipv4Addr>().map_err(|_| Errno::EINVAL)?,
                None => Ipv4Addr::UNSPECIFIED,
            };
            bind(raw, &SockaddrIn::from(SocketAddrV4::new(ip, key.port)))?;
        }
        Family::Inet6 => {
            let ip = match addr {
                Some(addr) => addr.parse::<Ipv6Addr>().map_err(|_| Errno::EINVAL)?,
                None => Ipv6Addr::UNSPECIFIED,
            };
            setsockopt(raw, sockopt::Ipv6V6Only, &true)?;
            bind(raw, &SockaddrIn6::from(SocketAddrV6::new(ip, key.port, 0, 0)))?;
        }
        Family::Unix => {
            let path = addr.ok_or(Errno::EINVAL)?;
            bind(raw, &UnixAddr::new(path)?)?;
        }
    }

    listen(raw, key.backlog.max(1) as usize)?;

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback(name: &str) -> ListenSocketKey {
        ListenSocketKey::new(name, Some("127.0.0.1"), 0, Family::Inet)
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let mut registry = Registry::default();

        let first = registry.allocate(&loopback("http")).unwrap().identity().unwrap();
        let second = registry.allocate(&loopback("http")).unwrap().identity().unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);

        registry.release(&loopback("http")).unwrap();
        assert_eq!(registry.release(&loopback("http")), Err(Errno::ENOENT));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_invalid_address() {
        let mut registry = Registry::default();
        let key = ListenSocketKey::new("bad", Some("not-an-address"), 0, Family::Inet);
        assert_eq!(registry.allocate(&key).map(|_| ()), Err(Errno::EINVAL));

        let key = ListenSocketKey::new("unix", None, 0, Family::Unix);
        assert_eq!(registry.allocate(&key).map(|_| ()), Err(Errno::EINVAL));
    }

    #[test]
    fn test_unix_listener_and_release_all() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ls.sock");
        let key = ListenSocketKey::new("local", path.to_str(), 0, Family::Unix);

        let mut registry = Registry::default();
        registry.allocate(&key).unwrap();
        registry.allocate(&loopback("http")).unwrap();
        assert!(path.exists());
        assert_eq!(registry.len(), 2);

        registry.release_all();
        assert!(registry.is_empty());
    }
}
