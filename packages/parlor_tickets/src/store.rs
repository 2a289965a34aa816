//! Ticket store: mint / verify / sweep behind a single lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How long an unused ticket stays redeemable.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(5);

/// How often the background sweeper looks for expired tickets.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_millis(400);

/// Tunables for a [`TicketStore`].
///
/// A ticket can remain redeemable for up to `retention + sweep_interval`,
/// since expiry is only enforced when the sweeper runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TicketConfig {
    pub retention: Duration,
    pub sweep_interval: Duration,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// A one-time token authorizing a single connection upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: String,
    pub issued_at: Instant,
}

impl Ticket {
    /// True once `issued_at + retention` lies strictly before `now`.
    pub fn is_expired(&self, retention: Duration, now: Instant) -> bool {
        self.issued_at + retention < now
    }
}

/// Shared ticket registry. Cloning is cheap; clones share the same map.
///
/// Mint, verify and sweep all take the same mutex, so a verify can never
/// observe a ticket the sweeper is halfway through deleting.
#[derive(Clone)]
pub struct TicketStore {
    tickets: Arc<Mutex<HashMap<String, Ticket>>>,
    config: TicketConfig,
}

impl TicketStore {
    pub fn new(config: TicketConfig) -> Self {
        Self {
            tickets: Arc::new(Mutex::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> TicketConfig {
        self.config
    }

    /// Issue a fresh ticket with a globally unique key.
    pub async fn mint(&self) -> Ticket {
        let ticket = Ticket {
            key: uuid::Uuid::new_v4().to_string(),
            issued_at: Instant::now(),
        };
        self.tickets
            .lock()
            .await
            .insert(ticket.key.clone(), ticket.clone());
        debug!(ticket = %ticket.key, "Minted ticket");
        ticket
    }

    /// Redeem a ticket. Returns true exactly once per minted key; the
    /// test-and-delete happens under the lock.
    pub async fn verify(&self, key: &str) -> bool {
        self.tickets.lock().await.remove(key).is_some()
    }

    /// Drop every ticket whose retention period has elapsed.
    /// Returns the number of tickets removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    async fn sweep_at(&self, now: Instant) -> usize {
        let retention = self.config.retention;
        let mut tickets = self.tickets.lock().await;
        let before = tickets.len();
        tickets.retain(|_, ticket| !ticket.is_expired(retention, now));
        before - tickets.len()
    }

    /// Number of outstanding (unredeemed, unswept) tickets.
    pub async fn len(&self) -> usize {
        self.tickets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.lock().await.is_empty()
    }

    /// Spawn the background sweeper. It runs every `sweep_interval` until
    /// `cancel` fires.
    pub fn spawn_sweeper(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            info!(
                "Starting ticket sweeper (retention {:?}, interval {:?})",
                store.config.retention, store.config.sweep_interval
            );
            let mut interval = tokio::time::interval(store.config.sweep_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("Ticket sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let removed = store.sweep().await;
                        if removed > 0 {
                            debug!(removed, "Swept expired tickets");
                        }
                    }
                }
            }
        })
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new(TicketConfig::default())
    }
}
