use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 2222;

/// How long a graceful shutdown may take before the daemon gives up waiting on
/// in-flight connections.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_SHELL: &str = "sh";

/// Process-wide settings. Built once at startup and shared read-only, usually
/// behind an `Arc`.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
  pub port: u16,

  /// Explicit listen addresses. When empty the daemon listens on
  /// `0.0.0.0:<port>`.
  pub listen: Vec<SocketAddr>,

  /// Path to the user table. `None` means an empty table, so every login is
  /// refused.
  pub credential_source_path: Option<PathBuf>,

  pub allow_session: bool,
  pub disallow_password_auth: bool,
  pub disallow_pubkey_auth: bool,
  pub allow_local_forward: bool,
  pub allow_reverse_forward: bool,

  /// Users allowed to open local or reverse forwards. Everyone else is denied
  /// even when forwarding is enabled.
  pub forward_allow_list: BTreeSet<String>,

  /// Interpreter spawned for sessions that request a shell.
  pub shell: String,

  pub shutdown_timeout: Duration,
}

impl Default for DaemonConfig {
  fn default() -> Self {
    Self {
      port: DEFAULT_PORT,
      listen: Vec::new(),
      credential_source_path: None,
      allow_session: false,
      disallow_password_auth: false,
      disallow_pubkey_auth: false,
      allow_local_forward: false,
      allow_reverse_forward: false,
      forward_allow_list: BTreeSet::new(),
      shell: DEFAULT_SHELL.to_owned(),
      shutdown_timeout: SHUTDOWN_TIMEOUT,
    }
  }
}

impl DaemonConfig {
  pub fn listen_addresses(&self) -> Vec<SocketAddr> {
    if self.listen.is_empty() {
      vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port)]
    } else {
      self.listen.clone()
    }
  }

  pub fn may_forward(&self, username: &str) -> bool {
    self.forward_allow_list.contains(username)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_locked_down() {
    let config = DaemonConfig::default();
    assert_eq!(config.port, 2222);
    assert!(!config.allow_session);
    assert!(!config.allow_local_forward);
    assert!(!config.allow_reverse_forward);
    assert!(config.forward_allow_list.is_empty());
    assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
  }

  #[test]
  fn listen_addresses_fall_back_to_port() {
    let config = DaemonConfig {
      port: 2022,
      ..Default::default()
    };
    assert_eq!(config.listen_addresses(), vec!["0.0.0.0:2022".parse().unwrap()]);

    let explicit: SocketAddr = "127.0.0.1:9000".parse().unwrap();
    let config = DaemonConfig {
      listen: vec![explicit],
      ..Default::default()
    };
    assert_eq!(config.listen_addresses(), vec![explicit]);
  }
}
