//! What happens on a session channel once the client asks for a shell or a
//! command.
//!
//! A request is first classified (see [`classify`]) and then executed by the
//! [`Dispatcher`], which streams the result back through a [`SessionOutput`].
//! Failures are reported to the peer as a single `ERROR ...` line and only end
//! that session.

use crate::config::DaemonConfig;
use crate::error::SessionError;
use crate::probe::{self, EchoProbe};
use crate::task::AbortOnDrop;
use async_trait::async_trait;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const SESSION_DISALLOWED: &str = "SESSION DISALLOWED\n";

/// Where session output goes. Implemented for SSH channels by the server and
/// for `Vec<u8>` so output can be collected in memory.
#[async_trait]
pub trait SessionOutput: Send {
  async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl SessionOutput for Vec<u8> {
  async fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
    self.extend_from_slice(bytes);
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
  /// Sessions are disabled. Nothing is spawned.
  Rejected,
  Shell,
  SingleCommand {
    program: String,
  },
  Probe {
    target: String,
  },
  MultiArgCommand {
    program: String,
    arguments: Vec<String>,
  },
}

/// Decide what a session will do. The rules are checked in order: disabled
/// sessions, no command, a single word, `ping <target>`, anything else.
pub fn classify(session_enabled: bool, words: &[String]) -> Classification {
  if !session_enabled {
    return Classification::Rejected;
  }
  match words {
    [] => Classification::Shell,
    [program] => Classification::SingleCommand {
      program: program.clone(),
    },
    [first, target, ..] if first == "ping" => Classification::Probe { target: target.clone() },
    [program, arguments @ ..] => Classification::MultiArgCommand {
      program: program.clone(),
      arguments: arguments.to_vec(),
    },
  }
}

/// Split an `exec` command line into words using shell quoting rules.
/// Unbalanced quotes fall back to plain whitespace splitting.
pub fn split_command(line: &str) -> Vec<String> {
  shlex::split(line).unwrap_or_else(|| {
    tracing::warn!(line, "unbalanced quoting in command, splitting on whitespace");
    line.split_whitespace().map(str::to_owned).collect()
  })
}

/// One accepted shell or exec request.
#[derive(Debug, Clone)]
pub struct SessionRequest {
  pub session_id: String,
  pub user: String,
  /// Variables the client sent with `env` requests, in arrival order. Only
  /// logged, never applied to the child.
  pub environment: Vec<(String, String)>,
  pub command_words: Vec<String>,
  /// Fires when the peer closes the channel, the connection drops, or the
  /// daemon shuts down.
  pub cancellation: CancellationToken,
}

#[derive(Debug)]
pub struct SessionOutcome {
  pub classification: Classification,
  /// Reported to the client as the channel's exit status.
  pub exit_code: u32,
  pub error: Option<SessionError>,
}

/// Map a child's exit status to the SSH exit-status convention: the exit code,
/// or 128 plus the signal number when the child was killed.
pub fn exit_code(status: &ExitStatus) -> u32 {
  match (status.code(), status.signal()) {
    (Some(code), _) => code.try_into().unwrap_or(1),
    (None, Some(signal)) => signal as u32 + 128,
    (None, None) => 1,
  }
}

pub struct Dispatcher {
  allow_session: bool,
  shell: String,
  probe: Arc<dyn EchoProbe>,
}

impl Dispatcher {
  pub fn new(config: &DaemonConfig, probe: Arc<dyn EchoProbe>) -> Self {
    Self {
      allow_session: config.allow_session,
      shell: config.shell.clone(),
      probe,
    }
  }

  /// Classify and execute `request`, writing everything the peer should see
  /// to `output`. `input` carries client data destined for the child's stdin;
  /// dropping its sender closes stdin.
  pub async fn run<O>(
    &self,
    request: SessionRequest,
    input: Option<mpsc::Receiver<Vec<u8>>>,
    output: &mut O,
  ) -> SessionOutcome
  where
    O: SessionOutput + ?Sized,
  {
    tracing::info!(
      user = %request.user,
      environ = ?request.environment,
      session_id = %request.session_id,
      command = ?request.command_words,
      "session started"
    );

    let classification = classify(self.allow_session, &request.command_words);
    tracing::debug!(?classification, "classified session");

    let (exit_code, error) = match self.execute(&classification, &request, input, output).await {
      Ok(code) => (code, None),
      Err(error) => {
        if !matches!(error, SessionError::Cancelled) {
          if let Err(write_error) = output.write(error.peer_message().as_bytes()).await {
            tracing::debug!(?write_error, "could not report session error to peer");
          }
        }
        let code = match &error {
          SessionError::ExitStatus(status) => exit_code(status),
          _ => 1,
        };
        (code, Some(error))
      }
    };

    tracing::info!(
      user = %request.user,
      environ = ?request.environment,
      session_id = %request.session_id,
      error = ?error,
      "session ended"
    );
    SessionOutcome {
      classification,
      exit_code,
      error,
    }
  }

  async fn execute<O>(
    &self,
    classification: &Classification,
    request: &SessionRequest,
    input: Option<mpsc::Receiver<Vec<u8>>>,
    output: &mut O,
  ) -> Result<u32, SessionError>
  where
    O: SessionOutput + ?Sized,
  {
    let cancel = &request.cancellation;
    match classification {
      Classification::Rejected => {
        if let Err(error) = output.write(SESSION_DISALLOWED.as_bytes()).await {
          tracing::debug!(?error, "could not send rejection");
        }
        Ok(0)
      }
      Classification::Shell => run_command(&self.shell, &[], input, output, cancel).await,
      Classification::SingleCommand { program } => run_command(program, &[], input, output, cancel).await,
      Classification::MultiArgCommand { program, arguments } => {
        run_command(program, arguments, input, output, cancel).await
      }
      Classification::Probe { target } => {
        probe::run(self.probe.as_ref(), target, output, cancel).await?;
        Ok(0)
      }
    }
  }
}

async fn copy_to_output<R, O>(reader: &mut R, output: &mut O) -> std::io::Result<u64>
where
  R: AsyncRead + Unpin,
  O: SessionOutput + ?Sized,
{
  let mut buffer = vec![0; 4096];
  let mut copied = 0;
  loop {
    let n = reader.read(&mut buffer).await?;
    if n == 0 {
      return Ok(copied);
    }
    output.write(&buffer[..n]).await?;
    copied += n as u64;
  }
}

async fn terminate(child: &mut tokio::process::Child) -> SessionError {
  if let Err(error) = child.kill().await {
    tracing::warn!(?error, pid = child.id(), "failed to kill child");
  }
  SessionError::Cancelled
}

/// Spawn `program` and stream its stdout until it exits or `cancel` fires.
/// The child never outlives this call: it is killed on cancellation and, as a
/// backstop, when dropped.
async fn run_command<O>(
  program: &str,
  arguments: &[String],
  input: Option<mpsc::Receiver<Vec<u8>>>,
  output: &mut O,
  cancel: &CancellationToken,
) -> Result<u32, SessionError>
where
  O: SessionOutput + ?Sized,
{
  let mut child = tokio::process::Command::new(program)
    .args(arguments)
    .kill_on_drop(true)
    .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
    .stdout(Stdio::piped())
    .stderr(Stdio::null())
    .spawn()
    .map_err(|source| SessionError::Spawn {
      program: program.to_owned(),
      source,
    })?;
  tracing::info!(pid = child.id(), program, "child spawned");

  let mut stdout = child.stdout.take().ok_or(SessionError::Pipe("stdout is not available"))?;

  let _stdin_pump = match (input, child.stdin.take()) {
    (Some(mut input), Some(mut stdin)) => Some(AbortOnDrop::new(tokio::spawn(async move {
      while let Some(chunk) = input.recv().await {
        if let Err(error) = stdin.write_all(&chunk).await {
          tracing::debug!(?error, "child stdin closed");
          break;
        }
      }
    }))),
    _ => None,
  };

  let copied = tokio::select! {
    _ = cancel.cancelled() => None,
    copied = copy_to_output(&mut stdout, output) => Some(copied),
  };
  let Some(copied) = copied else {
    return Err(terminate(&mut child).await);
  };
  let bytes = copied.map_err(SessionError::Copy)?;
  tracing::debug!(bytes, "child stdout closed");

  let waited = tokio::select! {
    _ = cancel.cancelled() => None,
    status = child.wait() => Some(status),
  };
  let Some(status) = waited else {
    return Err(terminate(&mut child).await);
  };
  let status = status.map_err(SessionError::Wait)?;
  tracing::info!(%status, "child exited");
  if status.success() {
    Ok(0)
  } else {
    Err(SessionError::ExitStatus(status))
  }
}
