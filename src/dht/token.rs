use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

const TOKEN_LEN: usize = 8;
/// Outstanding tokens kept per address; the oldest is dropped beyond this.
const MAX_TOKENS_PER_ADDR: usize = 8;

struct IssuedToken {
    value: Bytes,
    issued_at: Instant,
}

/// Write tokens handed out in `get_peers` replies.
///
/// Tokens are bound to the requester's IP, as `announce_peer` may arrive
/// from a different source port than the `get_peers` that preceded it.
pub struct TokenManager {
    expiry: Duration,
    tokens: Mutex<HashMap<IpAddr, Vec<IssuedToken>>>,
}

impl TokenManager {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue(&self, ip: IpAddr) -> Bytes {
        let value = Bytes::copy_from_slice(&rand::random::<[u8; TOKEN_LEN]>());

        let mut tokens = self.tokens.lock();
        let issued = tokens.entry(ip).or_default();
        if issued.len() >= MAX_TOKENS_PER_ADDR {
            issued.remove(0);
        }
        issued.push(IssuedToken {
            value: value.clone(),
            issued_at: Instant::now(),
        });

        value
    }

    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        let tokens = self.tokens.lock();
        tokens.get(&ip).is_some_and(|issued| {
            issued
                .iter()
                .any(|t| t.value.as_ref() == token && t.issued_at.elapsed() <= self.expiry)
        })
    }

    /// Drops expired tokens. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut tokens = self.tokens.lock();
        let mut removed = 0;

        tokens.retain(|_, issued| {
            let before = issued.len();
            issued.retain(|t| t.issued_at.elapsed() <= self.expiry);
            removed += before - issued.len();
            !issued.is_empty()
        });

        removed
    }

    pub fn len(&self) -> usize {
        self.tokens.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweeps expired tokens every `period` until shutdown.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.clear();
                    if removed > 0 {
                        debug!("Cleared {} expired tokens", removed);
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}
