use anyhow::Context;
use clap::Parser;
use futures::future::join_all;
use sshgate::config::{DaemonConfig, DEFAULT_PORT, DEFAULT_SHELL, SHUTDOWN_TIMEOUT};
use sshgate::probe::IcmpProbe;
use sshgate::server::{serve, Server};
use sshgate::{AuthenticationPolicy, CapabilityGate, CredentialStore, Dispatcher, ShutdownCoordinator};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// A small SSH daemon with a static user table and per-user capability gating.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
  /// Port to listen on when no --listen address is given.
  #[arg(long, env = "SSH_PORT", default_value_t = DEFAULT_PORT)]
  port: u16,

  /// Path to the user table, YAML or JSON (by .json extension). Without one
  /// every login is refused.
  #[arg(short = 'u', long, env = "SSH_USERS")]
  users: Option<PathBuf>,

  /// Allow shells, commands and ping sessions.
  #[arg(short = 's', long, env = "SSH_ALLOW_SESSION")]
  allow_session: bool,

  #[arg(short = 'w', long, env = "SSH_DISALLOW_PWD_AUTH")]
  disallow_pwd_auth: bool,

  #[arg(short = 'k', long, env = "SSH_DISALLOW_PUBKEY_AUTH")]
  disallow_pubkey_auth: bool,

  /// Allow local port forwarding (ssh -L) for --forward-user users.
  #[arg(short = 'p', long, env = "SSH_ALLOW_PORT_FWD")]
  allow_port_forward: bool,

  /// Allow reverse port forwarding (ssh -R) for --forward-user users.
  #[arg(short = 'r', long, env = "SSH_ALLOW_REVERSE_PORT_FWD")]
  allow_reverse_forward: bool,

  /// Users that may forward ports. Can be specified multiple times or comma
  /// separated.
  #[arg(long, env = "SSH_FORWARD_USERS", value_delimiter = ',')]
  forward_user: Vec<String>,

  /// Addresses to listen on. [default: 0.0.0.0:<port>]
  #[arg(long, env = "SSH_LISTEN", value_delimiter = ',')]
  listen: Vec<SocketAddr>,

  /// Path to private key files for the host. Can be specified multiple times.
  /// Without one an ephemeral Ed25519 key is generated.
  #[arg(long, env = "SSH_HOST_KEYS", value_delimiter = ',')]
  host_key_path: Vec<PathBuf>,

  /// Program started for shell sessions.
  #[arg(long, env = "SSH_SHELL", default_value = DEFAULT_SHELL)]
  shell: String,

  /// Optionally drop privileges to this user after binding to the socket.
  #[arg(long)]
  setuid: Option<u32>,

  /// Optionally drop privileges to this group after binding to the socket.
  #[arg(long)]
  setgid: Option<u32>,

  /// Optionally send keepalive messages at this interval.
  #[arg(long)]
  keepalive_interval_seconds: Option<u64>,

  /// Close connections after this many unanswered keepalive messages.
  #[arg(long, default_value_t = 3)]
  keepalive_max_unanswered: usize,
}

impl Args {
  fn daemon_config(&self) -> DaemonConfig {
    DaemonConfig {
      port: self.port,
      listen: self.listen.clone(),
      credential_source_path: self.users.clone(),
      allow_session: self.allow_session,
      disallow_password_auth: self.disallow_pwd_auth,
      disallow_pubkey_auth: self.disallow_pubkey_auth,
      allow_local_forward: self.allow_port_forward,
      allow_reverse_forward: self.allow_reverse_forward,
      forward_allow_list: self
        .forward_user
        .iter()
        .map(|user| user.trim().to_owned())
        .filter(|user| !user.is_empty())
        .collect(),
      shell: self.shell.clone(),
      shutdown_timeout: SHUTDOWN_TIMEOUT,
    }
  }

  fn host_keys(&self) -> anyhow::Result<Vec<russh_keys::key::KeyPair>> {
    if self.host_key_path.is_empty() {
      tracing::warn!("no host key configured, generating an ephemeral Ed25519 key");
      let key = russh_keys::key::KeyPair::generate_ed25519().context("failed to generate an ephemeral host key")?;
      return Ok(vec![key]);
    }
    self
      .host_key_path
      .iter()
      .map(|path| {
        // NOTE: we don't support encrypted keys or "~/foo" paths yet.
        russh_keys::load_secret_key(path, None).with_context(|| format!("failed to load host key {}", path.display()))
      })
      .collect()
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::fmt::layer()
        .pretty()
        // Use span events to automatically log each of the SSH handlers.
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::NEW),
    )
    .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
    .init();

  let args = Args::parse();
  let config = Arc::new(args.daemon_config());
  tracing::debug!(?config, "configuration");

  let store = CredentialStore::load(config.credential_source_path.as_deref()).context("error opening users file")?;
  let gate = Arc::new(CapabilityGate::new(config.clone(), Arc::new(store)));
  let dispatcher = Arc::new(Dispatcher::new(&config, Arc::new(IcmpProbe::default())));

  let russh_config = russh::server::Config {
    auth_rejection_time: std::time::Duration::from_secs(1),
    auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
    methods: gate.methods(),
    keys: args.host_keys()?,
    keepalive_interval: args.keepalive_interval_seconds.map(std::time::Duration::from_secs),
    keepalive_max: args.keepalive_max_unanswered,
    ..Default::default()
  };

  let addresses = config.listen_addresses();
  tracing::debug!(?addresses, "binding to sockets");
  let sockets: Vec<TcpListener> = join_all(addresses.iter().map(TcpListener::bind))
    .await
    .into_iter()
    .collect::<Result<Vec<_>, _>>()
    .context("failed to bind sockets")?;

  // setgid before setuid, since generally speaking we won't have permission to
  // setgid after setuid.
  if let Some(gid) = args.setgid {
    tracing::info!(gid, "dropping gid privileges");
    nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("failed to drop privileges with setgid")?;
  }
  if let Some(uid) = args.setuid {
    tracing::info!(uid, "dropping uid privileges");
    nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).context("failed to drop privileges with setuid")?;
  }

  let coordinator = ShutdownCoordinator::new(config.shutdown_timeout);
  let signal = coordinator.signal();
  tokio::spawn(async move {
    match sshgate::shutdown::termination().await {
      Ok(()) => signal.cancel(),
      Err(error) => tracing::error!(?error, "failed to install signal handlers"),
    }
  });

  let server = Server::new(
    gate.clone(),
    gate,
    dispatcher,
    coordinator.signal(),
    coordinator.sessions(),
  );
  tracing::info!(?addresses, "listening on sockets");
  coordinator
    .run(serve(Arc::new(russh_config), sockets, server))
    .await
    .context("server failed")?;

  tracing::info!("server stopped");
  Ok(())
}
