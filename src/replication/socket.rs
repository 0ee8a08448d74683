//! Non-blocking peer sockets.
//!
//! [`PeerSocket`] is the seam between the connection state machine and the
//! operating system; [`NixSocketFactory`] is the production implementation.

use crate::error::Result;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

/// Readiness to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
  Readable,
  Writable,
}

/// Non-fatal outcomes of a non-blocking connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
  /// The connect completed immediately.
  Connected,
  /// In progress (or a previous attempt still is); try again later.
  InProgress,
  /// A previous attempt finished; the socket is connected.
  AlreadyConnected,
  /// Interrupted by a signal; retry right away.
  Interrupted,
}

pub trait PeerSocket: Send {
  /// Hard failures are returned as errors.
  fn connect(&mut self, addr: &SocketAddr) -> io::Result<ConnectStatus>;

  fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

  /// `ErrorKind::WouldBlock` when nothing is buffered, `Ok(0)` on EOF.
  fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

  /// Wait up to `timeout` for readiness; `Ok(false)` on timeout.
  fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<bool>;
}

pub trait SocketFactory: Send {
  type Socket: PeerSocket;

  /// Create a non-blocking socket for the first usable address, returning
  /// it together with the address it should connect to.
  fn create(&mut self, addrs: &[SocketAddr]) -> Result<(Self::Socket, SocketAddr)>;
}

#[cfg(unix)]
pub use self::unix::{NixSocket, NixSocketFactory};

#[cfg(unix)]
mod unix {
  use super::{ConnectStatus, Interest, PeerSocket, SocketFactory};
  use crate::error::{EmberError, Result};
  use nix::errno::Errno;
  use nix::fcntl::{fcntl, FcntlArg, OFlag};
  use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
  use nix::sys::socket::{self, sockopt, AddressFamily, MsgFlags, SockFlag, SockType, SockaddrStorage};
  use std::io;
  use std::net::SocketAddr;
  use std::os::fd::{AsFd, AsRawFd, OwnedFd};
  use std::time::Duration;
  use tracing::debug;

  #[derive(Debug)]
  pub struct NixSocket {
    fd: OwnedFd,
  }

  impl NixSocket {
    fn open(addr: &SocketAddr) -> Result<Self> {
      let family = match addr {
        SocketAddr::V4(_) => AddressFamily::Inet,
        SocketAddr::V6(_) => AddressFamily::Inet6,
      };
      let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;

      let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(|errno| {
        EmberError::Connectivity(format!("failed to get current flags: {}", errno.desc()))
      })?;
      let flags = OFlag::from_bits_truncate(flags);
      if !flags.contains(OFlag::O_NONBLOCK) {
        fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK)).map_err(|errno| {
          EmberError::Connectivity(format!("failed to enable O_NONBLOCK: {}", errno.desc()))
        })?;
      }
      Ok(Self { fd })
    }
  }

  impl PeerSocket for NixSocket {
    fn connect(&mut self, addr: &SocketAddr) -> io::Result<ConnectStatus> {
      match socket::connect(self.fd.as_raw_fd(), &SockaddrStorage::from(*addr)) {
        Ok(()) => Ok(ConnectStatus::Connected),
        Err(Errno::EINPROGRESS | Errno::EALREADY) => Ok(ConnectStatus::InProgress),
        Err(Errno::EISCONN) => Ok(ConnectStatus::AlreadyConnected),
        Err(Errno::EINTR) => Ok(ConnectStatus::Interrupted),
        Err(errno) => Err(io::Error::from(errno)),
      }
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
      socket::send(self.fd.as_raw_fd(), buf, MsgFlags::empty()).map_err(io::Error::from)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      socket::recv(self.fd.as_raw_fd(), buf, MsgFlags::empty()).map_err(io::Error::from)
    }

    fn wait(&mut self, interest: Interest, timeout: Duration) -> Result<bool> {
      let events = match interest {
        Interest::Readable => PollFlags::POLLIN,
        Interest::Writable => PollFlags::POLLOUT,
      };
      let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);

      let mut fds = [PollFd::new(self.fd.as_fd(), events)];
      let ready = match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(ready) => ready,
        Err(Errno::EINTR) => return Ok(false),
        Err(errno) => {
          return Err(EmberError::Connectivity(format!(
            "poll on replication stream failed: {}",
            errno.desc()
          )))
        }
      };

      let revents = fds[0].revents().unwrap_or(PollFlags::empty());
      if revents.contains(PollFlags::POLLERR) {
        let error = socket::getsockopt(&self.fd, sockopt::SocketError).unwrap_or(0);
        return Err(EmberError::Connectivity(format!(
          "error on replication stream: {}",
          Errno::from_raw(error).desc()
        )));
      }
      Ok(ready == 1)
    }
  }

  /// Creates [`NixSocket`]s, trying each resolved address in turn.
  #[derive(Debug, Default, Clone, Copy)]
  pub struct NixSocketFactory;

  impl SocketFactory for NixSocketFactory {
    type Socket = NixSocket;

    fn create(&mut self, addrs: &[SocketAddr]) -> Result<(NixSocket, SocketAddr)> {
      let mut last_error = None;
      for addr in addrs {
        match NixSocket::open(addr) {
          Ok(socket) => return Ok((socket, *addr)),
          Err(error) => {
            debug!(%addr, %error, "socket creation failed, trying next address");
            last_error = Some(error);
          }
        }
      }
      Err(last_error.unwrap_or_else(|| {
        EmberError::Connectivity("failed to create socket: no addresses".to_string())
      }))
    }
  }
}
