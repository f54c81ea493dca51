//! UDP hole punching
//!
//! Any outbound datagram to a specific remote endpoint opens the
//! local NAT's inbound path for that endpoint, so both sides send
//! probe bursts concurrently and either side's first inbound packet
//! proves the path is open. Send intervals are jittered to avoid the
//! two schedules staying synchronized and colliding with each other's
//! NAT state transitions.
//!
//! The socket owner routes inbound probe packets; when one arrives
//! from the target endpoint, it resolves the [`PunchHandle`] and the
//! burst stops early.

use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Tunables for a punch burst.
#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Number of probe datagrams to send before giving up.
    pub attempts: u32,
    /// Base spacing between probes.
    pub interval: Duration,
    /// Jitter fraction applied to each interval. `0.5` means each
    /// gap is drawn uniformly from 50% to 150% of `interval`.
    pub jitter: f64,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            attempts: 12,
            interval: Duration::from_millis(300),
            jitter: 0.5,
        }
    }
}

impl PunchConfig {
    /// One jittered gap between probes.
    #[must_use]
    pub fn jittered_interval(&self) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return self.interval;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        self.interval.mul_f64(factor)
    }
}

/// Completion side of an in-flight punch.
///
/// The socket read loop resolves it when any datagram arrives from
/// the punched endpoint.
pub struct PunchHandle {
    tx: oneshot::Sender<()>,
}

impl PunchHandle {
    /// Create a linked handle/receiver pair.
    #[must_use]
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Mark the path as open. Idempotence is the caller's concern;
    /// a handle can only resolve once.
    pub fn resolve(self) {
        let _ = self.tx.send(());
    }
}

/// Send a probe burst toward `peer` until the path opens or attempts
/// run out.
///
/// `probe` is the tagged datagram to repeat; `opened` resolves when
/// the read loop sees inbound traffic from `peer`. Returns `true`
/// when the path opened. Both sides must run this concurrently;
/// seeing the remote's probe before our own burst finishes is the
/// expected fast path.
///
/// # Errors
///
/// Returns an error only on socket failure. Exhausted attempts are
/// the `Ok(false)` outcome, not an error.
pub async fn punch(
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    probe: &[u8],
    config: &PunchConfig,
    mut opened: oneshot::Receiver<()>,
) -> Result<bool, std::io::Error> {
    for attempt in 0..config.attempts {
        socket.send_to(probe, peer).await?;
        trace!(%peer, attempt, "sent punch probe");

        let gap = config.jittered_interval();
        tokio::select! {
            outcome = &mut opened => {
                // A dropped handle means the owner cancelled the punch.
                if outcome.is_ok() {
                    debug!(%peer, attempt, "punch path open");
                    return Ok(true);
                }
                debug!(%peer, attempt, "punch cancelled");
                return Ok(false);
            }
            () = tokio::time::sleep(gap) => {}
        }
    }
    debug!(%peer, attempts = config.attempts, "punch exhausted");
    Ok(false)
}
