//! `ping <target>` for sessions: a fixed number of ICMP echoes, one line per
//! reply and a statistics summary at the end, mimicking the usual `ping`
//! output.

use crate::error::{ProbeError, SessionError};
use crate::session::SessionOutput;
use async_trait::async_trait;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

/// Echo requests sent per probe.
pub const ECHO_COUNT: u16 = 3;

pub const ECHO_INTERVAL: Duration = Duration::from_secs(1);

pub const ECHO_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct Echo {
  pub bytes: usize,
  pub source: IpAddr,
  pub sequence: u16,
  pub rtt: Duration,
  pub ttl: Option<u8>,
}

/// Sends single echo requests. The ICMP details live behind this trait so
/// sessions can be exercised without raw sockets.
#[async_trait]
pub trait EchoProbe: Send + Sync {
  async fn resolve(&self, target: &str) -> Result<IpAddr, ProbeError>;

  /// Send one echo request. `identifier` is unique to the probe run, so runs
  /// against the same host never share a request. `Ok(None)` means no reply
  /// arrived in time.
  async fn echo(&self, address: IpAddr, identifier: u16, sequence: u16) -> Result<Option<Echo>, ProbeError>;
}

static NEXT_IDENTIFIER: AtomicU16 = AtomicU16::new(0);

/// A fresh ICMP identifier for one probe run.
fn next_identifier() -> u16 {
  (std::process::id() as u16).wrapping_add(NEXT_IDENTIFIER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone)]
pub struct ProbeStatistics {
  pub target: String,
  pub address: IpAddr,
  pub transmitted: u32,
  pub received: u32,
  pub duplicates: u32,
  rtts: Vec<Duration>,
  seen: HashSet<u16>,
}

impl ProbeStatistics {
  pub fn new(target: &str, address: IpAddr) -> Self {
    Self {
      target: target.to_owned(),
      address,
      transmitted: 0,
      received: 0,
      duplicates: 0,
      rtts: Vec::new(),
      seen: HashSet::new(),
    }
  }

  /// Record a reply. Returns false when its sequence number was already seen.
  /// Only first receipts count towards the round-trip statistics.
  pub fn record(&mut self, echo: &Echo) -> bool {
    if self.seen.insert(echo.sequence) {
      self.received += 1;
      self.rtts.push(echo.rtt);
      true
    } else {
      self.duplicates += 1;
      false
    }
  }

  pub fn packet_loss(&self) -> f64 {
    if self.transmitted == 0 {
      return 0.0;
    }
    (self.transmitted.saturating_sub(self.received)) as f64 * 100.0 / self.transmitted as f64
  }

  pub fn min_rtt(&self) -> Duration {
    self.rtts.iter().min().copied().unwrap_or_default()
  }

  pub fn max_rtt(&self) -> Duration {
    self.rtts.iter().max().copied().unwrap_or_default()
  }

  pub fn avg_rtt(&self) -> Duration {
    if self.rtts.is_empty() {
      return Duration::ZERO;
    }
    self.rtts.iter().sum::<Duration>() / self.rtts.len() as u32
  }

  /// Population standard deviation of the round-trip times.
  pub fn stddev_rtt(&self) -> Duration {
    if self.rtts.is_empty() {
      return Duration::ZERO;
    }
    let mean = self.avg_rtt().as_secs_f64();
    let variance = self
      .rtts
      .iter()
      .map(|rtt| (rtt.as_secs_f64() - mean).powi(2))
      .sum::<f64>()
      / self.rtts.len() as f64;
    Duration::from_secs_f64(variance.sqrt())
  }

  pub fn summary(&self) -> String {
    format!(
      "\n--- {} ping statistics ---\n\
       {} packets transmitted, {} packets received, {}% packet loss\n\
       round-trip min/avg/max/stddev = {:?}/{:?}/{:?}/{:?}\n",
      self.target,
      self.transmitted,
      self.received,
      self.packet_loss(),
      self.min_rtt(),
      self.avg_rtt(),
      self.max_rtt(),
      self.stddev_rtt(),
    )
  }
}

fn reply_line(echo: &Echo) -> String {
  format!(
    "{} bytes from {}: icmp_seq={} time={:?}\n",
    echo.bytes, echo.source, echo.sequence, echo.rtt
  )
}

fn duplicate_line(echo: &Echo) -> String {
  let ttl = echo.ttl.map_or_else(|| "?".to_owned(), |ttl| ttl.to_string());
  format!(
    "{} bytes from {}: icmp_seq={} time={:?} ttl={} (DUP!)\n",
    echo.bytes, echo.source, echo.sequence, echo.rtt, ttl
  )
}

// Probe lines are best effort, a vanished peer only shows up in the logs.
async fn emit<O: SessionOutput + ?Sized>(output: &mut O, text: &str) {
  if let Err(error) = output.write(text.as_bytes()).await {
    tracing::debug!(?error, "dropping probe output");
  }
}

/// Probe `target` and stream the results to `output`. Cancellation stops
/// sending but the summary is still written.
pub async fn run<P, O>(
  probe: &P,
  target: &str,
  output: &mut O,
  cancel: &CancellationToken,
) -> Result<ProbeStatistics, SessionError>
where
  P: EchoProbe + ?Sized,
  O: SessionOutput + ?Sized,
{
  let address = probe.resolve(target).await?;
  let identifier = next_identifier();
  let mut statistics = ProbeStatistics::new(target, address);
  emit(output, &format!("PING {target} ({address}):\n")).await;

  for sequence in 0..ECHO_COUNT {
    if sequence > 0 {
      tokio::select! {
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(ECHO_INTERVAL) => {}
      }
    }

    statistics.transmitted += 1;
    let reply = tokio::select! {
      _ = cancel.cancelled() => break,
      reply = probe.echo(address, identifier, sequence) => reply?,
    };
    let Some(echo) = reply else {
      tracing::debug!(host = target, sequence, "echo timed out");
      continue;
    };
    let line = if statistics.record(&echo) {
      reply_line(&echo)
    } else {
      duplicate_line(&echo)
    };
    emit(output, &line).await;
  }

  emit(output, &statistics.summary()).await;
  Ok(statistics)
}

/// ICMP echo over unprivileged datagram sockets where the OS allows them.
///
/// surge-ping hands each reply to the first waiter and drops later copies, so
/// this backend never reports duplicates and cannot see the reply's TTL.
pub struct IcmpProbe {
  timeout: Duration,
  /// Sequence numbers on the wire. Datagram sockets may rewrite the
  /// identifier, so every outstanding request also gets its own sequence.
  next_sequence: AtomicU16,
  v4: OnceCell<surge_ping::Client>,
  v6: OnceCell<surge_ping::Client>,
}

impl Default for IcmpProbe {
  fn default() -> Self {
    Self::new(ECHO_TIMEOUT)
  }
}

impl IcmpProbe {
  pub fn new(timeout: Duration) -> Self {
    Self {
      timeout,
      next_sequence: AtomicU16::new(0),
      v4: OnceCell::new(),
      v6: OnceCell::new(),
    }
  }

  async fn client(&self, address: IpAddr) -> Result<&surge_ping::Client, ProbeError> {
    let (cell, kind) = match address {
      IpAddr::V4(_) => (&self.v4, surge_ping::ICMP::V4),
      IpAddr::V6(_) => (&self.v6, surge_ping::ICMP::V6),
    };
    cell
      .get_or_try_init(|| async {
        let config = surge_ping::Config::builder().kind(kind).build();
        surge_ping::Client::new(&config).map_err(ProbeError::Socket)
      })
      .await
  }
}

#[async_trait]
impl EchoProbe for IcmpProbe {
  async fn resolve(&self, target: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(address) = target.parse::<IpAddr>() {
      return Ok(address);
    }
    let mut addresses = tokio::net::lookup_host((target, 0))
      .await
      .map_err(|source| ProbeError::Resolve {
        target: target.to_owned(),
        source,
      })?;
    addresses
      .next()
      .map(|address| address.ip())
      .ok_or_else(|| ProbeError::NoAddress {
        target: target.to_owned(),
      })
  }

  async fn echo(&self, address: IpAddr, identifier: u16, sequence: u16) -> Result<Option<Echo>, ProbeError> {
    let client = self.client(address).await?;
    let mut pinger = client.pinger(address, surge_ping::PingIdentifier(identifier)).await;
    pinger.timeout(self.timeout);
    let payload = [0u8; 56];
    let wire_sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
    // Replies are reported under the caller's sequence number.
    match pinger.ping(surge_ping::PingSequence(wire_sequence), &payload).await {
      Ok((surge_ping::IcmpPacket::V4(packet), rtt)) => Ok(Some(Echo {
        bytes: packet.get_size(),
        source: IpAddr::V4(packet.get_source()),
        sequence,
        rtt,
        ttl: None,
      })),
      Ok((surge_ping::IcmpPacket::V6(packet), rtt)) => Ok(Some(Echo {
        bytes: packet.get_size(),
        source: IpAddr::V6(packet.get_source()),
        sequence,
        rtt,
        ttl: None,
      })),
      Err(surge_ping::SurgeError::Timeout { .. }) => Ok(None),
      Err(error) => Err(ProbeError::Echo(error.to_string())),
    }
  }
}
