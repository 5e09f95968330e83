//! Admission control for provider calls.
//!
//! Every adapter call goes through a [`Permit`] handed out by the
//! [`Coordinator`]. A permit represents one concurrency slot for the provider,
//! one slot of the global cap, and one token of the provider's [`RateBudget`].
//! Waiters for the same provider are admitted in arrival order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::types::{ProviderKind, RateLimitSnapshot};
use crate::Error;

/// Shape of a provider's token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateBudgetConfig {
    pub capacity: u32,
    /// Tokens added every `refill_interval`, up to `capacity`.
    pub refill_amount: u32,
    pub refill_interval: Duration,
}

impl RateBudgetConfig {
    pub fn new(capacity: u32, refill_amount: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_amount,
            refill_interval,
        }
    }

    /// `requests` per minute, refilled one at a time.
    pub fn per_minute(requests: u32) -> Self {
        let requests = requests.max(1);
        Self::new(requests, 1, Duration::from_secs(60) / requests)
    }

    /// A budget that never runs dry in practice.
    pub fn unlimited() -> Self {
        Self::new(u32::MAX, u32::MAX, Duration::from_secs(1))
    }
}

/// Token bucket for one provider. Tokens are unsigned and only taken when
/// at least one is available.
#[derive(Debug)]
pub struct RateBudget {
    config: RateBudgetConfig,
    tokens: u32,
    next_refill: Instant,
}

impl RateBudget {
    pub fn new(config: RateBudgetConfig, now: Instant) -> Self {
        Self {
            config,
            tokens: config.capacity,
            next_refill: now + config.refill_interval,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens
    }

    fn refill(&mut self, now: Instant) {
        if now < self.next_refill {
            return;
        }
        if self.config.refill_interval.is_zero() {
            self.tokens = self.config.capacity;
            self.next_refill = now;
            return;
        }
        let elapsed = now.duration_since(self.next_refill);
        let periods = elapsed.as_nanos() / self.config.refill_interval.as_nanos() + 1;
        let added = (periods.min(u32::MAX as u128) as u32).saturating_mul(self.config.refill_amount);
        self.tokens = self.tokens.saturating_add(added).min(self.config.capacity);
        self.next_refill += self.config.refill_interval * periods.min(u32::MAX as u128) as u32;
    }

    /// Take one token, or report when the next refill happens.
    pub fn try_take(&mut self, now: Instant) -> Result<(), Instant> {
        self.refill(now);
        if self.tokens == 0 {
            return Err(self.next_refill);
        }
        self.tokens -= 1;
        Ok(())
    }

    /// Return a token taken for a call that was never issued.
    pub fn refund(&mut self) {
        self.tokens = self.tokens.saturating_add(1).min(self.config.capacity);
    }

    /// Fold in what the provider says about its own window.
    ///
    /// Only ever lowers the local count, and an exhausted provider window
    /// postpones the next local refill until the provider resets.
    pub fn reconcile(&mut self, snapshot: &RateLimitSnapshot, now: Instant) {
        if let Some(remaining) = snapshot.remaining {
            self.tokens = self.tokens.min(remaining);
        }
        if let (0, Some(reset_after)) = (self.tokens, snapshot.reset_after) {
            self.next_refill = self.next_refill.max(now + reset_after);
        }
    }
}

struct Lane {
    name: String,
    slots: Arc<Semaphore>,
    turn: tokio::sync::Mutex<()>,
    budget: Mutex<RateBudget>,
}

impl Lane {
    fn budget(&self) -> MutexGuard<'_, RateBudget> {
        self.budget.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A budget token held while waiting for the global cap. Dropped unspent,
/// it goes back to the lane.
struct HeldToken<'a> {
    lane: &'a Lane,
    spent: bool,
}

impl Drop for HeldToken<'_> {
    fn drop(&mut self) {
        if !self.spent {
            self.lane.budget().refund();
            tracing::trace!(provider = %self.lane.name, "budget token refunded");
        }
    }
}

/// Proof of admission. Dropping it gives the slots back.
#[derive(Debug)]
pub struct Permit {
    kind: ProviderKind,
    _slot: OwnedSemaphorePermit,
    _global: OwnedSemaphorePermit,
}

impl Permit {
    pub fn kind(&self) -> ProviderKind {
        self.kind
    }
}

/// Serializes all shared admission state: concurrency slots and rate budgets.
pub struct Coordinator {
    global: Arc<Semaphore>,
    lanes: HashMap<ProviderKind, Lane>,
}

impl Coordinator {
    /// Create a coordinator with a global cap and no providers.
    pub fn new(global_max_concurrency: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_max_concurrency.max(1))),
            lanes: HashMap::new(),
        }
    }

    /// Register a provider with its concurrency limit and budget.
    pub fn with_provider(
        mut self,
        kind: ProviderKind,
        name: impl Into<String>,
        max_concurrency: usize,
        budget: RateBudgetConfig,
    ) -> Self {
        self.lanes.insert(
            kind,
            Lane {
                name: name.into(),
                slots: Arc::new(Semaphore::new(max_concurrency.max(1))),
                turn: tokio::sync::Mutex::new(()),
                budget: Mutex::new(RateBudget::new(budget, Instant::now())),
            },
        );
        self
    }

    fn lane(&self, kind: ProviderKind) -> Result<&Lane, Error> {
        self.lanes
            .get(&kind)
            .ok_or_else(|| Error::config(format!("no admission lane for {kind}")))
    }

    /// Wait for a slot and a budget token, giving up at `deadline`.
    pub async fn acquire(&self, kind: ProviderKind, deadline: Instant) -> Result<Permit, Error> {
        let lane = self.lane(kind)?;
        match tokio::time::timeout_at(deadline, self.admit(kind, lane)).await {
            Ok(permit) => permit,
            Err(_) => {
                tracing::debug!(provider = %lane.name, "admission deadline passed");
                Err(Error::admission_timeout(lane.name.clone()))
            }
        }
    }

    async fn admit(&self, kind: ProviderKind, lane: &Lane) -> Result<Permit, Error> {
        // One waiter per lane at a time; tokio's mutex queues the rest FIFO.
        let _turn = lane.turn.lock().await;

        let slot = Arc::clone(&lane.slots)
            .acquire_owned()
            .await
            .map_err(|_| Error::config("coordinator closed"))?;

        let mut token = loop {
            let taken = lane.budget().try_take(Instant::now());
            let next_refill = match taken {
                Ok(()) => break HeldToken { lane, spent: false },
                Err(at) => at,
            };
            tracing::debug!(provider = %lane.name, "rate budget exhausted, waiting for refill");
            tokio::time::sleep_until(next_refill).await;
        };

        let global = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| Error::config("coordinator closed"))?;
        token.spent = true;

        Ok(Permit {
            kind,
            _slot: slot,
            _global: global,
        })
    }

    /// Give a permit back.
    pub fn release(&self, permit: Permit) {
        drop(permit);
    }

    /// Apply rate-limit information reported by a provider.
    pub fn reconcile(&self, kind: ProviderKind, snapshot: &RateLimitSnapshot) {
        if let Ok(lane) = self.lane(kind) {
            lane.budget().reconcile(snapshot, Instant::now());
        }
    }

    /// Tokens currently left in a provider's budget.
    pub fn remaining_budget(&self, kind: ProviderKind) -> Option<u32> {
        self.lanes.get(&kind).map(|lane| lane.budget().remaining())
    }

    /// Free concurrency slots for a provider.
    pub fn available_slots(&self, kind: ProviderKind) -> Option<usize> {
        self.lanes.get(&kind).map(|lane| lane.slots.available_permits())
    }
}
