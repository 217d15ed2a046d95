//! End-to-end tests: a real `serve` on 127.0.0.1 driven by a russh client.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use sshgate::credentials::IdentityRecord;
use sshgate::probe::IcmpProbe;
use sshgate::server::{serve, Server};
use sshgate::{
  AuthenticationPolicy, CapabilityGate, CredentialStore, DaemonConfig, Dispatcher, ForwardPolicy, ListenerError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

const WAIT: Duration = Duration::from_secs(5);

struct Daemon {
  address: SocketAddr,
  shutdown: CancellationToken,
  tracker: TaskTracker,
  serving: JoinHandle<Result<(), ListenerError>>,
}

fn gate(config: DaemonConfig) -> Arc<CapabilityGate> {
  let store = CredentialStore::from_records([
    IdentityRecord {
      username: "ops".to_owned(),
      password_hash: Some(bcrypt::hash("letmein", 4).unwrap()),
      public_key: None,
    },
    IdentityRecord {
      username: "guest".to_owned(),
      password_hash: Some(bcrypt::hash("guest", 4).unwrap()),
      public_key: None,
    },
  ])
  .unwrap();
  Arc::new(CapabilityGate::new(Arc::new(config), Arc::new(store)))
}

fn everything_enabled() -> DaemonConfig {
  DaemonConfig {
    allow_session: true,
    allow_local_forward: true,
    allow_reverse_forward: true,
    forward_allow_list: ["ops".to_owned()].into(),
    ..Default::default()
  }
}

async fn start(config: DaemonConfig) -> Daemon {
  let dispatcher = Arc::new(Dispatcher::new(&config, Arc::new(IcmpProbe::default())));
  let gate = gate(config);
  start_with(gate.clone(), gate, dispatcher).await
}

async fn start_with(
  authentication: Arc<dyn AuthenticationPolicy>,
  forwarding: Arc<dyn ForwardPolicy>,
  dispatcher: Arc<Dispatcher>,
) -> Daemon {
  let russh_config = russh::server::Config {
    auth_rejection_time: Duration::from_millis(10),
    auth_rejection_time_initial: Some(Duration::ZERO),
    methods: authentication.methods(),
    keys: vec![KeyPair::generate_ed25519().unwrap()],
    ..Default::default()
  };
  let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = socket.local_addr().unwrap();
  let shutdown = CancellationToken::new();
  let tracker = TaskTracker::new();
  let server = Server::new(authentication, forwarding, dispatcher, shutdown.clone(), tracker.clone());
  let serving = tokio::spawn(serve(Arc::new(russh_config), vec![socket], server));
  Daemon {
    address,
    shutdown,
    tracker,
    serving,
  }
}

/// Accepts any host key and hands `forwarded-tcpip` channels to the test.
struct Client {
  forwarded: mpsc::UnboundedSender<(Channel<client::Msg>, u32)>,
}

#[async_trait]
impl client::Handler for Client {
  type Error = anyhow::Error;

  async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
    Ok(true)
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<client::Msg>,
    _connected_address: &str,
    connected_port: u32,
    _originator_address: &str,
    _originator_port: u32,
    _session: &mut client::Session,
  ) -> Result<(), Self::Error> {
    let _ = self.forwarded.send((channel, connected_port));
    Ok(())
  }
}

async fn connect(address: SocketAddr) -> (Handle<Client>, mpsc::UnboundedReceiver<(Channel<client::Msg>, u32)>) {
  let (forwarded, forwarded_rx) = mpsc::unbounded_channel();
  let handle = client::connect(Arc::new(client::Config::default()), address, Client { forwarded })
    .await
    .unwrap();
  (handle, forwarded_rx)
}

async fn login(address: SocketAddr, user: &str, password: &str) -> Handle<Client> {
  let (mut handle, _) = connect(address).await;
  assert!(handle.authenticate_password(user, password).await.unwrap());
  handle
}

/// Everything the server sends on a session channel until it goes away.
async fn collect(channel: &mut Channel<client::Msg>) -> (String, Option<u32>) {
  let mut output = Vec::new();
  let mut exit_status = None;
  let drained = tokio::time::timeout(WAIT, async {
    while let Some(message) = channel.wait().await {
      match message {
        ChannelMsg::Data { data } => output.extend_from_slice(&data),
        ChannelMsg::ExitStatus { exit_status: status } => exit_status = Some(status),
        _ => {}
      }
    }
  })
  .await;
  assert!(drained.is_ok(), "channel did not close in time");
  (String::from_utf8(output).unwrap(), exit_status)
}

async fn echo_listener() -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let address = listener.local_addr().unwrap();
  tokio::spawn(async move {
    while let Ok((mut socket, _)) = listener.accept().await {
      tokio::spawn(async move {
        let (mut reader, mut writer) = socket.split();
        let _ = tokio::io::copy(&mut reader, &mut writer).await;
      });
    }
  });
  address
}

#[tokio::test]
async fn wrong_password_is_refused() {
  let daemon = start(everything_enabled()).await;
  let (mut handle, _) = connect(daemon.address).await;
  assert!(!handle.authenticate_password("ops", "hunter2").await.unwrap());
  assert!(!handle.authenticate_password("nobody", "letmein").await.unwrap());
  assert!(handle.authenticate_password("ops", "letmein").await.unwrap());
}

#[tokio::test]
async fn exec_runs_the_command() {
  let daemon = start(everything_enabled()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "echo hello world").await.unwrap();
  let (output, exit_status) = collect(&mut channel).await;
  assert_eq!(output, "hello world\n");
  assert_eq!(exit_status, Some(0));
}

#[tokio::test]
async fn failing_command_reports_its_exit_status() {
  let daemon = start(everything_enabled()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "sh -c 'exit 3'").await.unwrap();
  let (output, exit_status) = collect(&mut channel).await;
  assert!(output.starts_with("ERROR executing command - on wait: "), "{output:?}");
  assert_eq!(exit_status, Some(3));
}

#[tokio::test]
async fn client_data_reaches_stdin() {
  let daemon = start(everything_enabled()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "cat").await.unwrap();
  channel.data(&b"typed by the client\n"[..]).await.unwrap();
  channel.eof().await.unwrap();
  let (output, exit_status) = collect(&mut channel).await;
  assert_eq!(output, "typed by the client\n");
  assert_eq!(exit_status, Some(0));
}

#[tokio::test]
async fn disabled_sessions_are_turned_away() {
  let daemon = start(DaemonConfig::default()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "echo hello").await.unwrap();
  let (output, exit_status) = collect(&mut channel).await;
  assert_eq!(output, "SESSION DISALLOWED\n");
  assert_eq!(exit_status, Some(0));
}

#[tokio::test]
async fn second_exec_on_a_running_channel_ends_the_connection() {
  let daemon = start(everything_enabled()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "sleep 30").await.unwrap();
  channel.exec(true, "echo again").await.unwrap();
  let (output, _) = collect(&mut channel).await;
  assert!(!output.contains("again"));
}

#[tokio::test]
async fn local_forward_relays_to_the_destination() {
  let daemon = start(everything_enabled()).await;
  let destination = echo_listener().await;
  let handle = login(daemon.address, "ops", "letmein").await;

  let channel = handle
    .channel_open_direct_tcpip("127.0.0.1", u32::from(destination.port()), "127.0.0.1", 40000)
    .await
    .unwrap();
  let mut stream = channel.into_stream();
  stream.write_all(b"through the tunnel").await.unwrap();
  let mut echoed = [0; 18];
  tokio::time::timeout(WAIT, stream.read_exact(&mut echoed))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&echoed, b"through the tunnel");
}

#[tokio::test]
async fn local_forward_is_refused_for_unlisted_users() {
  let daemon = start(everything_enabled()).await;
  let destination = echo_listener().await;
  let handle = login(daemon.address, "guest", "guest").await;
  let opened = handle
    .channel_open_direct_tcpip("127.0.0.1", u32::from(destination.port()), "127.0.0.1", 40000)
    .await;
  assert!(opened.is_err());
}

#[tokio::test]
async fn local_forward_to_a_closed_port_is_refused() {
  let daemon = start(everything_enabled()).await;
  let closed = {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
  };
  let handle = login(daemon.address, "ops", "letmein").await;
  let opened = handle
    .channel_open_direct_tcpip("127.0.0.1", u32::from(closed), "127.0.0.1", 40000)
    .await;
  assert!(opened.is_err());
}

#[tokio::test]
async fn reverse_forward_reports_the_bound_port_and_can_be_cancelled() {
  let daemon = start(everything_enabled()).await;
  let (mut handle, mut forwarded) = connect(daemon.address).await;
  assert!(handle.authenticate_password("ops", "letmein").await.unwrap());

  let port = handle.tcpip_forward("127.0.0.1", 0).await.unwrap();
  assert_ne!(port, 0);
  let port = u16::try_from(port).unwrap();

  let mut inbound = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
  let (channel, connected_port) = tokio::time::timeout(WAIT, forwarded.recv()).await.unwrap().unwrap();
  assert_eq!(connected_port, u32::from(port));
  let mut stream = channel.into_stream();
  inbound.write_all(b"from outside").await.unwrap();
  let mut received = [0; 12];
  tokio::time::timeout(WAIT, stream.read_exact(&mut received))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&received, b"from outside");

  handle.cancel_tcpip_forward("127.0.0.1", u32::from(port)).await.unwrap();
  let deadline = Instant::now() + WAIT;
  while TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
    assert!(Instant::now() < deadline, "listener still open after cancel");
    tokio::time::sleep(Duration::from_millis(20)).await;
  }
}

#[tokio::test]
async fn reverse_forward_is_refused_for_unlisted_users() {
  let daemon = start(everything_enabled()).await;
  let (mut handle, _) = connect(daemon.address).await;
  assert!(handle.authenticate_password("guest", "guest").await.unwrap());
  assert!(handle.tcpip_forward("127.0.0.1", 0).await.is_err());
}

#[tokio::test]
async fn shutdown_disconnects_running_sessions() {
  let daemon = start(everything_enabled()).await;
  let handle = login(daemon.address, "guest", "guest").await;
  let mut channel = handle.channel_open_session().await.unwrap();
  channel.exec(true, "sleep 30").await.unwrap();
  tokio::time::sleep(Duration::from_millis(200)).await;

  let started = Instant::now();
  daemon.shutdown.cancel();
  collect(&mut channel).await;
  tokio::time::timeout(WAIT, daemon.serving).await.unwrap().unwrap().unwrap();
  daemon.tracker.close();
  tokio::time::timeout(WAIT, daemon.tracker.wait()).await.unwrap();
  assert!(started.elapsed() < WAIT);
}

/// Accepts any password after holding the calling thread.
struct SlowPasswords {
  entered: Arc<Notify>,
}

impl AuthenticationPolicy for SlowPasswords {
  fn allow_password(&self, _username: &str, _password: &str) -> bool {
    self.entered.notify_one();
    std::thread::sleep(Duration::from_millis(500));
    true
  }

  fn allow_public_key(&self, _username: &str, _key: &PublicKey) -> bool {
    false
  }

  fn methods(&self) -> MethodSet {
    MethodSet::PASSWORD
  }
}

impl ForwardPolicy for SlowPasswords {
  fn allow_local_forward(&self, _username: &str, _host: &str, _port: u32) -> bool {
    false
  }

  fn allow_reverse_forward(&self, _username: &str, _host: &str, _port: u32) -> bool {
    false
  }
}

// `#[tokio::test]` is single threaded, so a password check on the runtime
// thread would stall the timer below until it returns.
#[tokio::test]
async fn password_checks_do_not_stall_the_runtime() {
  let entered = Arc::new(Notify::new());
  let policy = Arc::new(SlowPasswords {
    entered: entered.clone(),
  });
  let dispatcher = Arc::new(Dispatcher::new(&DaemonConfig::default(), Arc::new(IcmpProbe::default())));
  let daemon = start_with(policy.clone(), policy, dispatcher).await;

  let address = daemon.address;
  let login = tokio::spawn(async move {
    let (mut handle, _) = connect(address).await;
    handle.authenticate_password("anyone", "anything").await.unwrap()
  });

  tokio::time::timeout(WAIT, entered.notified()).await.unwrap();
  let started = Instant::now();
  tokio::time::sleep(Duration::from_millis(20)).await;
  assert!(started.elapsed() < Duration::from_millis(250));

  assert!(tokio::time::timeout(WAIT, login).await.unwrap().unwrap());
}
