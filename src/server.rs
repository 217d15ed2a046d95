//! The russh side of the daemon: one [`ServerHandler`] per connection
//! answering the transport's callbacks with the policies, and handing session
//! channels to the [`Dispatcher`].
//!
//! SSH server flow for a shell (eg `ssh -T foo@bar`):
//! 1. Client connects and a new ServerHandler is created.
//! 2. auth method, eg. auth_publickey
//! 3. channel_open_session
//! 4. env_request (any number)
//! 5. shell_request
//!
//! For exec (eg `ssh foo@bar ls -la`) step 5 is an exec_request instead. Port
//! forwards arrive as channel_open_direct_tcpip (`ssh -L`) or tcpip_forward
//! (`ssh -R`) after authentication.

use crate::error::ListenerError;
use crate::policy::{AuthenticationPolicy, ForwardPolicy};
use crate::session::{split_command, Dispatcher, SessionOutput, SessionRequest};
use crate::task::AbortOnDrop;
use anyhow::{bail, Context};
use async_trait::async_trait;
use dashmap::DashMap;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

const FORWARD_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Builds a handler for every accepted connection. Cheap to clone.
#[derive(Clone)]
pub struct Server {
  authentication: Arc<dyn AuthenticationPolicy>,
  forwarding: Arc<dyn ForwardPolicy>,
  dispatcher: Arc<Dispatcher>,
  shutdown: CancellationToken,
  tracker: TaskTracker,
}

impl Server {
  /// `shutdown` is the daemon-wide cancellation signal and `tracker` collects
  /// every connection and session task so shutdown can wait for them.
  pub fn new(
    authentication: Arc<dyn AuthenticationPolicy>,
    forwarding: Arc<dyn ForwardPolicy>,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
  ) -> Self {
    Self {
      authentication,
      forwarding,
      dispatcher,
      shutdown,
      tracker,
    }
  }

  #[tracing::instrument(skip(self))]
  pub fn new_client(&self, client_address: Option<SocketAddr>) -> ServerHandler {
    let client_id = Uuid::new_v4();
    ServerHandler {
      // No need to add client_address as a field, since this span's parent will
      // be the one created by `tracing::instrument` on `new_client`.
      tracing_span: tracing::span!(tracing::Level::INFO, "connection", ?client_id),
      client_id,
      client_address,
      verified_username: None,
      authentication: self.authentication.clone(),
      forwarding: self.forwarding.clone(),
      dispatcher: self.dispatcher.clone(),
      tracker: self.tracker.clone(),
      cancel: self.shutdown.child_token(),
      channels: Arc::new(DashMap::new()),
      reverse_forwards: HashMap::new(),
    }
  }
}

/// Accept connections on every socket until the shutdown signal fires. Returns
/// early with an error if any socket fails, which also stops the others.
pub async fn serve(
  config: Arc<russh::server::Config>,
  sockets: Vec<TcpListener>,
  server: Server,
) -> Result<(), ListenerError> {
  // A task per address so a slow accept on one socket never stalls another.
  let mut loops = JoinSet::new();
  for socket in sockets {
    loops.spawn(accept_loop(config.clone(), socket, server.clone()));
  }
  while let Some(joined) = loops.join_next().await {
    joined.map_err(|error| ListenerError::Task(error.to_string()))??;
  }
  Ok(())
}

async fn accept_loop(
  config: Arc<russh::server::Config>,
  socket: TcpListener,
  server: Server,
) -> Result<(), ListenerError> {
  let address = socket
    .local_addr()
    .map(|address| address.to_string())
    .unwrap_or_else(|_| "<unknown>".to_owned());
  tracing::info!(%address, "accepting connections");

  loop {
    let accepted = tokio::select! {
      _ = server.shutdown.cancelled() => {
        tracing::info!(%address, "no longer accepting connections");
        return Ok(());
      }
      accepted = socket.accept() => accepted,
    };
    let (stream, peer) = accepted.map_err(|source| ListenerError::Accept {
      address: address.clone(),
      source,
    })?;

    let handler = server.new_client(Some(peer));
    let span = handler.tracing_span.clone();
    server.tracker.spawn(
      run_connection(config.clone(), stream, handler, server.shutdown.clone()).instrument(span),
    );
  }
}

async fn run_connection(
  config: Arc<russh::server::Config>,
  stream: TcpStream,
  handler: ServerHandler,
  shutdown: CancellationToken,
) {
  let started = tokio::select! {
    started = russh::server::run_stream(config, stream, handler) => started,
    _ = shutdown.cancelled() => {
      tracing::debug!("shutdown during handshake");
      return;
    }
  };
  let running = match started {
    Ok(running) => running,
    Err(error) => {
      tracing::warn!(?error, "handshake failed");
      return;
    }
  };
  let handle = running.handle();
  tokio::pin!(running);

  let finished = tokio::select! {
    result = &mut running => Some(result),
    _ = shutdown.cancelled() => None,
  };
  let result = match finished {
    Some(result) => result,
    None => {
      if let Err(error) = handle
        .disconnect(
          russh::Disconnect::ByApplication,
          "server shutting down".to_owned(),
          "en".to_owned(),
        )
        .await
      {
        tracing::debug!(?error, "sending disconnect failed");
      }
      running.await
    }
  };

  match result {
    Ok(()) => tracing::info!("connection closed"),
    Err(error) => tracing::error!(?error, "session error"),
  }
}

/// Session output over an SSH channel.
struct ChannelOutput {
  handle: Handle,
  channel_id: ChannelId,
}

#[async_trait]
impl SessionOutput for ChannelOutput {
  async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
    self
      .handle
      .data(self.channel_id, CryptoVec::from_slice(bytes))
      .await
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed"))
  }
}

#[tracing::instrument(skip(handle))]
async fn close_channel(handle: &Handle, channel_id: ChannelId, exit_status: u32) {
  // These fail when the peer already closed the channel, which is routine.
  if let Err(error) = handle.exit_status_request(channel_id, exit_status).await {
    tracing::debug!(?error, "sending exit status failed");
  }
  if let Err(error) = handle.eof(channel_id).await {
    tracing::debug!(?error, "sending eof failed");
  }
  if let Err(error) = handle.close(channel_id).await {
    tracing::debug!(?error, "sending close failed");
  }
}

/// Per-channel state. `ServerHandler` moves each session channel from
/// `Uninitialized` to `Running` when the client asks for a shell or command.
struct SessionChannel {
  /// Environment variables requested by the client via `env_request`.
  requested_environment_variables: Vec<(String, String)>,

  state: SessionChannelState,
}

enum SessionChannelState {
  /// Opened via `channel_open_session`, waiting for `shell_request` or
  /// `exec_request`.
  Uninitialized,

  /// A dispatcher task owns the session. Cancelling `cancel` ends it and
  /// kills any child process. Dropping `stdin_writer` closes the child's
  /// stdin.
  Running {
    cancel: CancellationToken,
    stdin_writer: Option<mpsc::Sender<Vec<u8>>>,
  },
}

pub struct ServerHandler {
  tracing_span: tracing::Span,

  /// A random UUID assigned to each client. Doubles as the session id in logs.
  client_id: Uuid,

  /// The IP address of the client.
  client_address: Option<SocketAddr>,

  /// Only `Some` after a successful authentication.
  verified_username: Option<String>,

  authentication: Arc<dyn AuthenticationPolicy>,
  forwarding: Arc<dyn ForwardPolicy>,
  dispatcher: Arc<Dispatcher>,
  tracker: TaskTracker,

  /// Connection scope, a child of the daemon-wide signal. Cancelled when the
  /// handler is dropped, ie when the client goes away.
  cancel: CancellationToken,

  channels: Arc<DashMap<ChannelId, SessionChannel>>,

  /// Listeners opened by `tcpip_forward`, keyed by the bound address and port.
  reverse_forwards: HashMap<(String, u32), AbortOnDrop>,
}

impl ServerHandler {
  fn verified_username(&self) -> anyhow::Result<String> {
    self.verified_username.clone().context("expected verified username")
  }

  fn auth_outcome(&mut self, username: &str, allowed: bool) -> Auth {
    if allowed {
      tracing::info!(username, client_address = ?self.client_address, "authenticated");
      self.verified_username = Some(username.to_owned());
      Auth::Accept
    } else {
      Auth::Reject {
        proceed_with_methods: None,
      }
    }
  }

  /// Hand a session channel to the dispatcher. The spawned task closes the
  /// channel with the session's exit status when it is done.
  async fn start_session(
    &mut self,
    channel_id: ChannelId,
    command_words: Vec<String>,
    session: &mut Session,
  ) -> anyhow::Result<()> {
    let user = self.verified_username()?;
    let cancel = self.cancel.child_token();
    let (stdin_writer, input) = mpsc::channel(64);

    let request = {
      let mut channel = self.channels.get_mut(&channel_id).context("channel_id not found")?;
      if !matches!(channel.state, SessionChannelState::Uninitialized) {
        bail!("expected Uninitialized channel");
      }
      channel.state = SessionChannelState::Running {
        cancel: cancel.clone(),
        stdin_writer: Some(stdin_writer),
      };
      SessionRequest {
        session_id: self.client_id.to_string(),
        user,
        environment: channel.requested_environment_variables.clone(),
        command_words,
        cancellation: cancel,
      }
    };

    let handle = session.handle();
    let dispatcher = self.dispatcher.clone();
    let channels = self.channels.clone();
    self.tracker.spawn(
      async move {
        let mut output = ChannelOutput {
          handle: handle.clone(),
          channel_id,
        };
        let outcome = dispatcher.run(request, Some(input), &mut output).await;
        close_channel(&handle, channel_id, outcome.exit_code).await;
        channels.remove(&channel_id);
      }
      .instrument(self.tracing_span.clone()),
    );
    Ok(())
  }
}

impl Drop for ServerHandler {
  fn drop(&mut self) {
    // Ends every session and forward that belongs to this connection.
    self.cancel.cancel();
    tracing::debug!(parent: &self.tracing_span, "handler dropped");
  }
}

#[async_trait]
impl russh::server::Handler for ServerHandler {
  type Error = anyhow::Error;

  // NOTE: we don't log `password`.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, password))]
  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    // bcrypt verification blocks, so it runs on the blocking pool.
    let authentication = self.authentication.clone();
    let (username, password) = (user.to_owned(), password.to_owned());
    let allowed = tokio::task::spawn_blocking(move || authentication.allow_password(&username, &password))
      .await
      .context("password check panicked")?;
    Ok(self.auth_outcome(user, allowed))
  }

  // `public_key` Debug prints in a format that is basically worthless.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, public_key))]
  async fn auth_publickey(
    &mut self,
    user: &str,
    public_key: &russh_keys::key::PublicKey,
  ) -> Result<Auth, Self::Error> {
    let allowed = self.authentication.allow_public_key(user, public_key);
    Ok(self.auth_outcome(user, allowed))
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_open_session(&mut self, channel: Channel<Msg>, _session: &mut Session) -> Result<bool, Self::Error> {
    self.channels.insert(
      channel.id(),
      SessionChannel {
        requested_environment_variables: Vec::new(),
        state: SessionChannelState::Uninitialized,
      },
    );
    Ok(true)
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn env_request(
    &mut self,
    channel_id: ChannelId,
    variable_name: &str,
    variable_value: &str,
    _session: &mut Session,
  ) -> Result<(), Self::Error> {
    let mut channel = self.channels.get_mut(&channel_id).context("channel_id not found")?;
    channel
      .requested_environment_variables
      .push((variable_name.to_owned(), variable_value.to_owned()));
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn shell_request(&mut self, channel_id: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
    self.start_session(channel_id, Vec::new(), session).await
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, command, session))]
  async fn exec_request(
    &mut self,
    channel_id: ChannelId,
    command: &[u8],
    session: &mut Session,
  ) -> Result<(), Self::Error> {
    let command_string = String::from_utf8_lossy(command);
    tracing::info!(%command_string);
    self.start_session(channel_id, split_command(&command_string), session).await
  }

  /// SSH client sends data, pipe it to the corresponding child's stdin.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session), level = "trace")]
  async fn data(&mut self, channel_id: ChannelId, data: &[u8], _session: &mut Session) -> Result<(), Self::Error> {
    // Clone the sender so no map guard is held across the await. Forward
    // channels have no entry here; their data goes through the channel stream.
    let writer = self.channels.get(&channel_id).and_then(|channel| match &channel.state {
      SessionChannelState::Running { stdin_writer, .. } => stdin_writer.clone(),
      SessionChannelState::Uninitialized => None,
    });
    if let Some(writer) = writer {
      if writer.send(data.to_vec()).await.is_err() {
        tracing::trace!("session no longer reads input");
      }
    }
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_eof(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    if let Some(mut channel) = self.channels.get_mut(&channel_id) {
      if let SessionChannelState::Running { stdin_writer, .. } = &mut channel.state {
        drop(stdin_writer.take());
      }
    }
    Ok(())
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_close(&mut self, channel_id: ChannelId, _session: &mut Session) -> Result<(), Self::Error> {
    if let Some((_, channel)) = self.channels.remove(&channel_id) {
      if let SessionChannelState::Running { cancel, .. } = channel.state {
        cancel.cancel();
      }
    }
    Ok(())
  }

  /// Arguments are such that on the client this looks like:
  ///
  ///   ssh -L 8080:<host_to_connect>:<port_to_connect> server
  ///
  /// russh opens a fresh channel for each connection made to the client's
  /// local socket. Bytes are relayed between that channel and a TCP
  /// connection to the destination.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn channel_open_direct_tcpip(
    &mut self,
    channel: Channel<Msg>,
    host_to_connect: &str,
    port_to_connect: u32,
    originator_address: &str,
    originator_port: u32,
    _session: &mut Session,
  ) -> Result<bool, Self::Error> {
    let user = self.verified_username()?;
    if !self.forwarding.allow_local_forward(&user, host_to_connect, port_to_connect) {
      return Ok(false);
    }
    let Ok(port) = u16::try_from(port_to_connect) else {
      tracing::warn!(port_to_connect, "destination port out of range");
      return Ok(false);
    };

    let connected = tokio::time::timeout(FORWARD_CONNECT_TIMEOUT, TcpStream::connect((host_to_connect, port))).await;
    let mut destination = match connected {
      Ok(Ok(destination)) => destination,
      Ok(Err(error)) => {
        tracing::warn!(?error, host_to_connect, port, "failed to connect forward destination");
        return Ok(false);
      }
      Err(_) => {
        tracing::warn!(host_to_connect, port, "timed out connecting forward destination");
        return Ok(false);
      }
    };

    let originator = format!("{originator_address}:{originator_port}");
    let cancel = self.cancel.clone();
    self.tracker.spawn(
      async move {
        let mut stream = channel.into_stream();
        tokio::select! {
          _ = cancel.cancelled() => tracing::debug!(%originator, "local forward cancelled"),
          relayed = copy_bidirectional(&mut stream, &mut destination) => match relayed {
            Ok((sent, received)) => tracing::debug!(sent, received, %originator, "local forward finished"),
            Err(error) => tracing::debug!(?error, %originator, "local forward ended"),
          },
        }
      }
      .instrument(self.tracing_span.clone()),
    );
    Ok(true)
  }

  /// `ssh -R [address:]port:host:hostport server`. Listen on `address:port`
  /// and open a `forwarded-tcpip` channel back to the client for every
  /// connection. A requested port of 0 binds an ephemeral port, which is
  /// reported back through `port`.
  #[tracing::instrument(parent = &self.tracing_span, skip(self, session))]
  async fn tcpip_forward(&mut self, address: &str, port: &mut u32, session: &mut Session) -> Result<bool, Self::Error> {
    let user = self.verified_username()?;
    if !self.forwarding.allow_reverse_forward(&user, address, *port) {
      return Ok(false);
    }
    let Ok(requested_port) = u16::try_from(*port) else {
      tracing::warn!(port = *port, "bind port out of range");
      return Ok(false);
    };

    let bind_host = match address {
      "" | "*" => "0.0.0.0",
      "localhost" => "127.0.0.1",
      other => other,
    };
    let listener = match TcpListener::bind((bind_host, requested_port)).await {
      Ok(listener) => listener,
      Err(error) => {
        tracing::warn!(?error, bind_host, requested_port, "failed to bind reverse forward");
        return Ok(false);
      }
    };
    let bound_port = listener
      .local_addr()
      .map(|local| local.port())
      .unwrap_or(requested_port);
    *port = u32::from(bound_port);

    let task = self.tracker.spawn(
      reverse_forward_listener(
        listener,
        session.handle(),
        address.to_owned(),
        *port,
        self.cancel.clone(),
      )
      .instrument(self.tracing_span.clone()),
    );
    self
      .reverse_forwards
      .insert((address.to_owned(), *port), AbortOnDrop::new(task));
    Ok(true)
  }

  #[tracing::instrument(parent = &self.tracing_span, skip(self, _session))]
  async fn cancel_tcpip_forward(&mut self, address: &str, port: u32, _session: &mut Session) -> Result<bool, Self::Error> {
    // Dropping the `AbortOnDrop` stops the listener.
    Ok(self.reverse_forwards.remove(&(address.to_owned(), port)).is_some())
  }
}

async fn reverse_forward_listener(
  listener: TcpListener,
  handle: Handle,
  address: String,
  port: u32,
  cancel: CancellationToken,
) {
  loop {
    let accepted = tokio::select! {
      _ = cancel.cancelled() => return,
      accepted = listener.accept() => accepted,
    };
    let (mut inbound, originator) = match accepted {
      Ok(accepted) => accepted,
      Err(error) => {
        tracing::warn!(?error, %address, port, "reverse forward listener failed");
        return;
      }
    };

    let handle = handle.clone();
    let address = address.clone();
    let cancel = cancel.clone();
    tokio::spawn(
      async move {
        let channel = match handle
          .channel_open_forwarded_tcpip(
            address,
            port,
            originator.ip().to_string(),
            u32::from(originator.port()),
          )
          .await
        {
          Ok(channel) => channel,
          Err(error) => {
            tracing::warn!(?error, "failed to open forwarded-tcpip channel");
            return;
          }
        };
        let mut stream = channel.into_stream();
        tokio::select! {
          _ = cancel.cancelled() => {}
          relayed = copy_bidirectional(&mut stream, &mut inbound) => {
            tracing::debug!(?relayed, %originator, "reverse forward connection finished");
          }
        }
      }
      .in_current_span(),
    );
  }
}
