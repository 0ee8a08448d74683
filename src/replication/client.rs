//! Outbound replication connection.
//!
//! A [`ReplicationClient`] resolves its peer, connects a non-blocking socket,
//! sends the connect handshake and then consumes frames, forwarding each
//! decoded event to an [`EngineIngest`]. Failures close the socket and are
//! retried according to the configured [`RetryPolicy`](crate::config::RetryPolicy).
//!
//! The client is driven one iteration at a time by [`ReplicationClient::step`],
//! or on a dedicated thread through [`ReplicationClient::spawn`].

use super::ingest::{EngineIngest, EngineStatus};
use super::socket::{ConnectStatus, Interest, PeerSocket, SocketFactory};
use crate::config::{ReplicationOptions, DEFAULT_PEER_PORT};
use crate::error::{EmberError, Result};
use crate::protocol::{encode_connect_frame, EngineCommand, Frame, HEADER_BYTES};
use crate::stats::EngineStats;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
  Unresolved,
  Resolved,
  SocketCreated,
  Connecting,
  Connected,
  Failed,
  Terminated,
}

/// Point-in-time view of a connection's control state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
  pub state: ConnectionState,
  /// Iterations left before reconnecting.
  pub backoff: u32,
  /// Write-readiness timeouts left for the connect in progress.
  pub connect_timeout: u32,
  pub retries_used: u32,
  pub running: bool,
}

#[derive(Debug)]
struct Control {
  terminate: bool,
  state: ConnectionState,
  backoff: u32,
  connect_timeout: u32,
  retries_used: u32,
  running: bool,
}

impl Control {
  fn status(&self) -> ConnectionStatus {
    ConnectionStatus {
      state: self.state,
      backoff: self.backoff,
      connect_timeout: self.connect_timeout,
      retries_used: self.retries_used,
      running: self.running,
    }
  }
}

type SharedControl = Arc<Mutex<Control>>;

pub struct ReplicationClient<F: SocketFactory, E> {
  options: ReplicationOptions,
  factory: F,
  engine: E,
  stats: Arc<EngineStats>,
  control: SharedControl,
  addrs: Vec<SocketAddr>,
  target: Option<SocketAddr>,
  socket: Option<F::Socket>,
  header: [u8; HEADER_BYTES],
  header_filled: usize,
  frame: Option<Frame>,
  body_filled: usize,
}

impl<F: SocketFactory, E: EngineIngest> ReplicationClient<F, E> {
  pub fn new(
    options: ReplicationOptions,
    factory: F,
    engine: E,
    stats: Arc<EngineStats>,
  ) -> Result<Self> {
    options.validate()?;
    Ok(Self {
      options,
      factory,
      engine,
      stats,
      control: Arc::new(Mutex::new(Control {
        terminate: false,
        state: ConnectionState::Unresolved,
        backoff: 0,
        connect_timeout: 0,
        retries_used: 0,
        running: false,
      })),
      addrs: Vec::new(),
      target: None,
      socket: None,
      header: [0u8; HEADER_BYTES],
      header_filled: 0,
      frame: None,
      body_filled: 0,
    })
  }

  pub fn options(&self) -> &ReplicationOptions {
    &self.options
  }

  pub fn state(&self) -> ConnectionState {
    self.control.lock().state
  }

  pub fn status(&self) -> ConnectionStatus {
    self.control.lock().status()
  }

  pub fn is_terminated(&self) -> bool {
    self.control.lock().terminate
  }

  /// Request termination; the control loop stops at its next check.
  pub fn terminate(&self) {
    self.control.lock().terminate = true;
  }

  fn set_state(&self, state: ConnectionState) {
    self.control.lock().state = state;
  }

  /// Resolve the peer once; later calls reuse the cached addresses.
  pub fn resolve(&mut self) -> Result<()> {
    if self.addrs.is_empty() {
      let (host, port) = split_peer(&self.options.peer)?;
      let addrs: Vec<SocketAddr> = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|error| {
          EmberError::Connectivity(format!("failed to resolve {}: {error}", self.options.peer))
        })?
        .collect();
      if addrs.is_empty() {
        return Err(EmberError::Connectivity(format!(
          "{} resolved to no addresses",
          self.options.peer
        )));
      }
      debug!(peer = %self.options.peer, count = addrs.len(), "resolved replication peer");
      self.addrs = addrs;
    }
    self.set_state(ConnectionState::Resolved);
    Ok(())
  }

  pub fn create_socket(&mut self) -> Result<()> {
    let (socket, target) = self.factory.create(&self.addrs)?;
    self.socket = Some(socket);
    self.target = Some(target);
    self.set_state(ConnectionState::SocketCreated);
    Ok(())
  }

  /// Advance the connection towards Connected.
  ///
  /// Returns `Ok(true)` once the handshake has been sent, `Ok(false)` while
  /// the connect is still in progress.
  pub fn connect(&mut self) -> Result<bool> {
    loop {
      match self.state() {
        ConnectionState::Connected => return Ok(true),
        ConnectionState::Terminated => return Ok(false),
        ConnectionState::Unresolved | ConnectionState::Failed => self.resolve()?,
        ConnectionState::Resolved => self.create_socket()?,
        ConnectionState::SocketCreated | ConnectionState::Connecting => break,
      }
    }

    let (Some(socket), Some(target)) = (self.socket.as_mut(), self.target) else {
      return Err(EmberError::Connectivity(
        "no socket to connect".to_string(),
      ));
    };

    loop {
      match socket.connect(&target) {
        Ok(ConnectStatus::Interrupted) => continue,
        Ok(ConnectStatus::InProgress) => {
          let mut control = self.control.lock();
          if control.state != ConnectionState::Connecting {
            control.state = ConnectionState::Connecting;
            control.connect_timeout = self.options.retry.connect_timeout_ticks;
          }
          return Ok(false);
        }
        Ok(ConnectStatus::Connected | ConnectStatus::AlreadyConnected) => {
          return self.send_handshake(target)
        }
        Err(error) => {
          return Err(EmberError::Connectivity(format!(
            "failed to connect to {target}: {error}"
          )))
        }
      }
    }
  }

  fn send_handshake(&mut self, target: SocketAddr) -> Result<bool> {
    let handshake = encode_connect_frame(
      &self.options.name,
      self.options.flags(),
      self.options.backfill_position,
    )?;
    let Some(socket) = self.socket.as_mut() else {
      return Ok(false);
    };

    let sent = socket.send(&handshake).map_err(|error| {
      EmberError::Connectivity(format!("failed to send connect request: {error}"))
    })?;
    if sent != handshake.len() {
      warn!(%target, sent, expected = handshake.len(), "short write of connect request");
      self.fail();
      return Ok(false);
    }

    let mut control = self.control.lock();
    control.state = ConnectionState::Connected;
    control.retries_used = 0;
    info!(%target, name = %self.options.name, "replication stream connected");
    Ok(true)
  }

  /// Read and dispatch frames until the socket would block.
  pub fn consume(&mut self) -> Result<()> {
    loop {
      if self.is_terminated() {
        return Ok(());
      }
      let Some(socket) = self.socket.as_mut() else {
        return Ok(());
      };

      match self.frame.as_mut() {
        None => {
          let Some(read) = read_chunk(socket, &mut self.header[self.header_filled..])? else {
            return Ok(());
          };
          self.header_filled += read;
          if self.header_filled < HEADER_BYTES {
            continue;
          }
          self.header_filled = 0;
          self.body_filled = 0;
          let frame = Frame::with_header(&self.header)?;
          if frame.body().is_empty() {
            self.dispatch(&frame)?;
          } else {
            self.frame = Some(frame);
          }
        }
        Some(frame) => {
          let Some(read) = read_chunk(socket, &mut frame.body_mut()[self.body_filled..])? else {
            return Ok(());
          };
          self.body_filled += read;
          if self.body_filled == frame.body().len() {
            if let Some(frame) = self.frame.take() {
              self.dispatch(&frame)?;
            }
          }
        }
      }
    }
  }

  fn dispatch(&mut self, frame: &Frame) -> Result<()> {
    self.stats.record_replication_fetched();
    let Some(mut message) = frame.tap_message()? else {
      let opcode = frame.header().opcode;
      match EngineCommand::from_u8(opcode) {
        Some(command) => debug!(?command, "engine command on replication stream dropped"),
        None => warn!(opcode, "unhandled replication opcode"),
      }
      self.stats.record_replication_ignored();
      return Ok(());
    };

    message.ttl = message.ttl.wrapping_sub(1);
    match self.engine.tap_notify(&message) {
      EngineStatus::Success => {}
      EngineStatus::Disconnect => {
        info!(peer = %self.options.peer, seqno = message.seqno, "engine requested disconnect");
        self.shutdown();
      }
      status => {
        debug!(?status, kind = ?message.kind, seqno = message.seqno, "event not applied");
      }
    }
    Ok(())
  }

  fn reset_stream(&mut self) {
    self.socket = None;
    self.frame = None;
    self.header_filled = 0;
    self.body_filled = 0;
  }

  fn shutdown(&mut self) {
    self.reset_stream();
    let mut control = self.control.lock();
    control.terminate = true;
    control.state = ConnectionState::Terminated;
  }

  /// Close the socket and either schedule a reconnect or give up.
  fn fail(&mut self) {
    self.reset_stream();
    let mut control = self.control.lock();
    if control.terminate {
      control.state = ConnectionState::Terminated;
      return;
    }

    let retry = self.options.retry;
    if retry.allows(control.retries_used) {
      control.retries_used += 1;
      control.backoff = retry.backoff_ticks;
      control.state = ConnectionState::Failed;
      self.stats.record_reconnect();
    } else {
      warn!(peer = %self.options.peer, retries = control.retries_used, "giving up on replication peer");
      control.terminate = true;
      control.state = ConnectionState::Terminated;
    }
  }

  fn iterate(&mut self) -> Result<()> {
    let backing_off = {
      let mut control = self.control.lock();
      if control.backoff > 0 {
        control.backoff -= 1;
        if control.backoff == 0 {
          control.state = ConnectionState::Unresolved;
        }
        true
      } else {
        false
      }
    };

    if !backing_off && self.connect()? {
      self.consume()?;
    }
    self.wait()
  }

  fn wait(&mut self) -> Result<()> {
    let interval = self.options.poll_interval();
    let state = self.state();
    let Some(socket) = self.socket.as_mut() else {
      if state != ConnectionState::Terminated {
        thread::sleep(interval);
      }
      return Ok(());
    };

    match state {
      ConnectionState::Connected => {
        socket.wait(Interest::Readable, interval)?;
      }
      ConnectionState::Connecting => {
        if !socket.wait(Interest::Writable, interval)? {
          let mut control = self.control.lock();
          control.connect_timeout = control.connect_timeout.saturating_sub(1);
          if control.connect_timeout == 0 {
            return Err(EmberError::Connectivity(format!(
              "timed out connecting to {}",
              self.options.peer
            )));
          }
        }
      }
      _ => {}
    }
    Ok(())
  }

  /// Run one control-loop iteration; errors fail the connection.
  pub fn step(&mut self) -> ConnectionState {
    if !self.is_terminated() {
      if let Err(error) = self.iterate() {
        warn!(peer = %self.options.peer, %error, "replication connection failed");
        self.fail();
      }
    }
    self.state()
  }

  /// Drive the connection until terminated.
  pub fn run(&mut self) {
    info!(peer = %self.options.peer, "replication client started");
    while !self.is_terminated() {
      self.step();
    }
    self.reset_stream();
    let mut control = self.control.lock();
    control.state = ConnectionState::Terminated;
    control.running = false;
    info!(peer = %self.options.peer, "replication client stopped");
  }
}

impl<F, E> ReplicationClient<F, E>
where
  F: SocketFactory + 'static,
  E: EngineIngest + 'static,
{
  /// Move the client onto its own thread.
  pub fn spawn(mut self) -> Result<ClientHandle> {
    let control = Arc::clone(&self.control);
    control.lock().running = true;

    let spawned = thread::Builder::new()
      .name(format!("emberkv-repl-{}", self.options.name))
      .spawn(move || self.run());
    match spawned {
      Ok(thread) => Ok(ClientHandle {
        control,
        thread: Some(thread),
      }),
      Err(error) => {
        control.lock().running = false;
        Err(EmberError::Io(error))
      }
    }
  }
}

#[cfg(unix)]
impl<E: EngineIngest> ReplicationClient<super::socket::NixSocketFactory, E> {
  /// A client over plain TCP sockets.
  pub fn tcp(options: ReplicationOptions, engine: E, stats: Arc<EngineStats>) -> Result<Self> {
    Self::new(options, super::socket::NixSocketFactory, engine, stats)
  }
}

/// Handle to a spawned [`ReplicationClient`]; dropping it stops the thread.
#[derive(Debug)]
pub struct ClientHandle {
  control: SharedControl,
  thread: Option<JoinHandle<()>>,
}

impl ClientHandle {
  pub fn state(&self) -> ConnectionState {
    self.control.lock().state
  }

  pub fn status(&self) -> ConnectionStatus {
    self.control.lock().status()
  }

  pub fn terminate(&self) {
    self.control.lock().terminate = true;
  }

  pub fn is_running(&self) -> bool {
    self.control.lock().running
  }

  /// Terminate and wait for the thread to exit.
  pub fn join(mut self) {
    self.stop();
  }

  fn stop(&mut self) {
    self.terminate();
    if let Some(thread) = self.thread.take() {
      if thread.join().is_err() {
        error!("replication thread panicked");
        self.control.lock().running = false;
      }
    }
  }
}

impl Drop for ClientHandle {
  fn drop(&mut self) {
    self.stop();
  }
}

fn read_chunk<S: PeerSocket>(socket: &mut S, buf: &mut [u8]) -> Result<Option<usize>> {
  loop {
    match socket.recv(buf) {
      Ok(0) => return Err(EmberError::StreamClosed),
      Ok(read) => return Ok(Some(read)),
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
      Err(error) if error.kind() == io::ErrorKind::Interrupted => continue,
      Err(error) => {
        return Err(EmberError::Connectivity(format!(
          "failed to read from replication stream: {error}"
        )))
      }
    }
  }
}

/// Split `host[:port]`; IPv6 literals with a port must be bracketed.
pub fn split_peer(peer: &str) -> Result<(String, u16)> {
  let peer = peer.trim();
  let parse_port = |raw: &str| {
    raw
      .parse::<u16>()
      .map_err(|_| EmberError::Config(format!("invalid port in peer {peer}")))
  };

  let (host, port) = if let Some(rest) = peer.strip_prefix('[') {
    let (host, tail) = rest
      .split_once(']')
      .ok_or_else(|| EmberError::Config(format!("unterminated address in peer {peer}")))?;
    match tail.strip_prefix(':') {
      Some(port) => (host, parse_port(port)?),
      None if tail.is_empty() => (host, DEFAULT_PEER_PORT),
      None => return Err(EmberError::Config(format!("malformed peer {peer}"))),
    }
  } else {
    match peer.split_once(':') {
      Some((host, port)) if !port.contains(':') => (host, parse_port(port)?),
      _ => (peer, DEFAULT_PEER_PORT),
    }
  };

  if host.is_empty() {
    return Err(EmberError::Config(format!("missing host in peer {peer}")));
  }
  Ok((host.to_string(), port))
}
