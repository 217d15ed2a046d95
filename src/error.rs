use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Failure to build the user table. Always fatal, the daemon never starts
/// listening with a partial table.
#[derive(Error, Debug)]
pub enum LoadError {
  #[error("failed to read {path}: {source}")]
  Unreadable {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {message}")]
  Malformed { path: PathBuf, message: String },

  #[error("user {username:?} has a malformed public key: {reason}")]
  MalformedKey { username: String, reason: String },

  #[error("user {username:?} is defined more than once")]
  DuplicateUsername { username: String },

  #[error("user record with an empty username")]
  EmptyUsername,
}

#[derive(Error, Debug)]
pub enum ProbeError {
  #[error("cannot resolve {target}: {source}")]
  Resolve {
    target: String,
    #[source]
    source: std::io::Error,
  },

  #[error("no address found for {target}")]
  NoAddress { target: String },

  #[error("cannot open ICMP socket: {0}")]
  Socket(#[source] std::io::Error),

  #[error("{0}")]
  Echo(String),
}

/// Errors that end a single session. They are echoed to the peer and never
/// reach daemon-level state.
#[derive(Error, Debug)]
pub enum SessionError {
  #[error("executing command connecting to pipe: {0}")]
  Pipe(&'static str),

  #[error("executing command: {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("executing command - copy error: {0}")]
  Copy(#[source] std::io::Error),

  #[error("executing command - on wait: {0}")]
  Wait(#[source] std::io::Error),

  #[error("executing command - on wait: {0}")]
  ExitStatus(ExitStatus),

  #[error("executing ping: {0}")]
  Probe(#[from] ProbeError),

  #[error("session cancelled")]
  Cancelled,
}

impl SessionError {
  /// The line written back on the session's own stream.
  pub fn peer_message(&self) -> String {
    format!("ERROR {self}\n")
  }
}

#[derive(Error, Debug)]
pub enum ListenerError {
  #[error("failed to accept connection on {address}: {source}")]
  Accept {
    address: String,
    #[source]
    source: std::io::Error,
  },

  #[error("listener task failed: {0}")]
  Task(String),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn peer_messages_are_single_lines() {
    let error = SessionError::Spawn {
      program: "nope".to_owned(),
      source: std::io::Error::new(std::io::ErrorKind::NotFound, "No such file or directory"),
    };
    assert_eq!(
      error.peer_message(),
      "ERROR executing command: nope: No such file or directory\n"
    );

    let error = SessionError::from(ProbeError::NoAddress {
      target: "nowhere.invalid".to_owned(),
    });
    assert_eq!(
      error.peer_message(),
      "ERROR executing ping: no address found for nowhere.invalid\n"
    );
  }
}
