//! The static user table.
//!
//! Users are read once at startup from a YAML (or JSON) file and never change
//! afterwards, so the store can be shared between connections without locking.

use crate::error::LoadError;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// One entry of the user table as it appears on disk.
///
/// ```yaml
/// - username: alice
///   password_hash: $2b$12$...
///   public_key: ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... alice@laptop
/// ```
#[derive(Deserialize, Debug, Clone, Default)]
pub struct IdentityRecord {
  pub username: String,

  /// A bcrypt hash.
  #[serde(default, alias = "pwdhash")]
  pub password_hash: Option<String>,

  /// A single line in OpenSSH authorized_keys format.
  #[serde(default, alias = "pubkey")]
  pub public_key: Option<String>,
}

/// A user with whatever login factors they have. A missing factor always fails
/// authentication by that method.
#[derive(Debug, Clone)]
pub struct Identity {
  pub username: String,
  password_hash: Option<String>,
  public_key: Option<PublicKey>,
}

impl Identity {
  pub fn has_password(&self) -> bool {
    self.password_hash.is_some()
  }

  pub fn has_public_key(&self) -> bool {
    self.public_key.is_some()
  }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
  identities: HashMap<String, Identity>,
}

impl CredentialStore {
  pub fn empty() -> Self {
    Self::default()
  }

  /// Read the user table at `source`. No path (or an empty one) gives an empty
  /// store.
  pub fn load(source: Option<&Path>) -> Result<Self, LoadError> {
    let path = match source {
      Some(path) if !path.as_os_str().is_empty() => path,
      _ => {
        tracing::warn!("no user table configured, every login will be refused");
        return Ok(Self::empty());
      }
    };

    let contents = std::fs::read_to_string(path).map_err(|source| LoadError::Unreadable {
      path: path.to_owned(),
      source,
    })?;
    if contents.trim().is_empty() {
      return Ok(Self::empty());
    }

    let is_json = path.extension().is_some_and(|extension| extension == "json");
    let records: Vec<IdentityRecord> = if is_json {
      serde_json::from_str(&contents).map_err(|error| LoadError::Malformed {
        path: path.to_owned(),
        message: error.to_string(),
      })?
    } else {
      serde_yaml::from_str(&contents).map_err(|error| LoadError::Malformed {
        path: path.to_owned(),
        message: error.to_string(),
      })?
    };

    let store = Self::from_records(records)?;
    tracing::info!(?path, users = store.len(), "loaded user table");
    Ok(store)
  }

  /// Validate and index records. Keys are parsed eagerly so a bad key stops
  /// startup instead of failing at login time.
  pub fn from_records(records: impl IntoIterator<Item = IdentityRecord>) -> Result<Self, LoadError> {
    let mut identities = HashMap::new();
    for record in records {
      // Stored verbatim: " bob" is a different user from "bob".
      let username = record.username;
      if username.trim().is_empty() {
        return Err(LoadError::EmptyUsername);
      }

      let password_hash = record.password_hash.filter(|hash| !hash.is_empty());
      let public_key = match record.public_key.as_deref().map(str::trim) {
        Some(line) if !line.is_empty() => Some(
          parse_authorized_key(line).map_err(|reason| LoadError::MalformedKey {
            username: username.clone(),
            reason,
          })?,
        ),
        _ => None,
      };

      if identities.contains_key(&username) {
        return Err(LoadError::DuplicateUsername { username });
      }
      identities.insert(
        username.clone(),
        Identity {
          username,
          password_hash,
          public_key,
        },
      );
    }
    Ok(Self { identities })
  }

  pub fn len(&self) -> usize {
    self.identities.len()
  }

  pub fn is_empty(&self) -> bool {
    self.identities.is_empty()
  }

  pub fn get(&self, username: &str) -> Option<&Identity> {
    self.identities.get(username)
  }

  /// Check `password` against the user's bcrypt hash.
  pub fn authenticate_password(&self, username: &str, password: &str) -> bool {
    let Some(hash) = self.get(username).and_then(|identity| identity.password_hash.as_deref()) else {
      return false;
    };
    match bcrypt::verify(password, hash) {
      Ok(matches) => matches,
      Err(error) => {
        tracing::warn!(username, ?error, "stored password hash is unusable");
        false
      }
    }
  }

  /// Check whether `candidate` is the user's configured key. The transport
  /// has already verified the client holds the private half.
  pub fn authenticate_pubkey(&self, username: &str, candidate: &PublicKey) -> bool {
    let Some(stored) = self.get(username).and_then(|identity| identity.public_key.as_ref()) else {
      return false;
    };
    // The wire encoding carries both the key type and the key material.
    stored.public_key_bytes() == candidate.public_key_bytes()
  }
}

/// Parse one authorized_keys line: `[options] <type> <base64> [comment]`.
pub fn parse_authorized_key(line: &str) -> Result<PublicKey, String> {
  let fields: Vec<&str> = line.split_whitespace().collect();
  if fields.len() < 2 {
    return Err(format!("expected `<type> <base64-key>`, got {line:?}"));
  }
  let mut last_error = None;
  for pair in fields.windows(2) {
    let (algorithm, encoded) = (pair[0], pair[1]);
    match russh_keys::parse_public_key_base64(encoded) {
      Ok(key) => return Ok(key),
      Err(error) => {
        if algorithm.starts_with("ssh-") || algorithm.starts_with("ecdsa-") || algorithm.starts_with("sk-") {
          last_error = Some(format!("{algorithm}: {error}"));
        }
      }
    }
  }
  Err(last_error.unwrap_or_else(|| "no key found".to_owned()))
}
