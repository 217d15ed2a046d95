//! Yes/no decisions for logins and port forwards.
//!
//! The transport asks these questions at fixed points of the SSH exchange.
//! Every answer is logged, and a "no" is an ordinary outcome rather than an
//! error.

use crate::config::DaemonConfig;
use crate::credentials::CredentialStore;
use russh::MethodSet;
use russh_keys::key::PublicKey;
use std::sync::Arc;

pub trait AuthenticationPolicy: Send + Sync {
  fn allow_password(&self, username: &str, password: &str) -> bool;

  fn allow_public_key(&self, username: &str, key: &PublicKey) -> bool;

  /// Methods worth advertising to clients.
  fn methods(&self) -> MethodSet {
    MethodSet::PASSWORD | MethodSet::PUBLICKEY
  }
}

pub trait ForwardPolicy: Send + Sync {
  /// `direct-tcpip`: the client wants us to connect out to `host:port`.
  fn allow_local_forward(&self, username: &str, host: &str, port: u32) -> bool;

  /// `tcpip-forward`: the client wants us to listen on `host:port`.
  fn allow_reverse_forward(&self, username: &str, host: &str, port: u32) -> bool;
}

/// The daemon's only policy: feature flags from the configuration plus the
/// user table.
#[derive(Clone)]
pub struct CapabilityGate {
  config: Arc<DaemonConfig>,
  store: Arc<CredentialStore>,
}

impl CapabilityGate {
  pub fn new(config: Arc<DaemonConfig>, store: Arc<CredentialStore>) -> Self {
    Self { config, store }
  }
}

impl AuthenticationPolicy for CapabilityGate {
  #[tracing::instrument(level = "debug", skip(self, password))]
  fn allow_password(&self, username: &str, password: &str) -> bool {
    let allowed = !self.config.disallow_password_auth && self.store.authenticate_password(username, password);
    tracing::info!(
      username,
      enabled = !self.config.disallow_password_auth,
      allowed,
      "password auth"
    );
    allowed
  }

  #[tracing::instrument(level = "debug", skip(self, key))]
  fn allow_public_key(&self, username: &str, key: &PublicKey) -> bool {
    let allowed = !self.config.disallow_pubkey_auth && self.store.authenticate_pubkey(username, key);
    tracing::info!(
      username,
      key_type = key.name(),
      enabled = !self.config.disallow_pubkey_auth,
      allowed,
      "public key auth"
    );
    allowed
  }

  fn methods(&self) -> MethodSet {
    let mut methods = MethodSet::empty();
    if !self.config.disallow_password_auth {
      methods |= MethodSet::PASSWORD;
    }
    if !self.config.disallow_pubkey_auth {
      methods |= MethodSet::PUBLICKEY;
    }
    methods
  }
}

impl ForwardPolicy for CapabilityGate {
  fn allow_local_forward(&self, username: &str, host: &str, port: u32) -> bool {
    if !self.config.allow_local_forward {
      tracing::info!(username, host, port, "denied forward (disabled)");
      return false;
    }
    let allowed = self.config.may_forward(username);
    if allowed {
      tracing::info!(username, host, port, "accepted forward");
    } else {
      tracing::info!(username, host, port, "denied forward (bad user)");
    }
    allowed
  }

  fn allow_reverse_forward(&self, username: &str, host: &str, port: u32) -> bool {
    if !self.config.allow_reverse_forward {
      tracing::info!(username, host, port, "attempt to bind denied (disabled)");
      return false;
    }
    let allowed = self.config.may_forward(username);
    if allowed {
      tracing::info!(username, host, port, "attempt to bind granted");
    } else {
      tracing::info!(username, host, port, "attempt to bind denied (bad user)");
    }
    allowed
  }
}
