//! Slot refresh.
//!
//! A refresh replaces the creative of a live slot without a visible gap:
//!
//! 1. the slot is torn down while the current frame is held,
//! 2. a new generation requests a new creative,
//! 3. once it is ready the loading placeholder is shown for a grace delay,
//! 4. a forced re-layout destroys the held frame and renders the new one.
//!
//! If the new generation produces nothing (or is superseded) the held
//! creative stays and the refresh ends early.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::slot::{AdPromiseOutcome, AdSlot, RefreshEndCallback};

/// How a refresh request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    /// A refresh was already in progress.
    Refused,
    /// The new ad request could not start; the old creative remains.
    NotStarted,
    /// The new generation was canceled or empty; the old creative remains.
    Canceled,
    /// A re-layout was scheduled; the callback fires after it.
    Scheduled,
}

/// Drives refresh cycles for one slot.
#[derive(Debug, Clone)]
pub struct RefreshController {
    slot: AdSlot,
    grace_delay: Duration,
}

impl RefreshController {
    /// Creates a controller using the slot's configured grace delay.
    #[must_use]
    pub fn new(slot: AdSlot) -> Self {
        let grace_delay = slot.engine().refresh.grace_delay();
        Self::with_grace_delay(slot, grace_delay)
    }

    /// Creates a controller with an explicit grace delay.
    #[must_use]
    pub const fn with_grace_delay(slot: AdSlot, grace_delay: Duration) -> Self {
        Self { slot, grace_delay }
    }

    /// Returns the slot.
    #[must_use]
    pub const fn slot(&self) -> &AdSlot {
        &self.slot
    }

    /// Refreshes the slot.
    ///
    /// `end` fires at most once: immediately if the refresh does not reach a
    /// re-layout, otherwise after the next layout of the slot. A refused
    /// refresh drops it without calling it.
    #[instrument(skip(self, end), fields(network = %self.slot.config().network_type))]
    pub async fn refresh(&self, end: RefreshEndCallback) -> RefreshOutcome {
        if !self.slot.begin_refresh() {
            debug!("refresh already in progress");
            return RefreshOutcome::Refused;
        }
        self.slot.teardown_slot();

        let pending = if self.slot.initiate_ad_request() {
            self.slot.pending()
        } else {
            None
        };
        let Some((generation, promise)) = pending else {
            info!("refresh could not start an ad request");
            self.slot.end_refresh();
            end();
            return RefreshOutcome::NotStarted;
        };

        let outcome = promise.await;
        if matches!(outcome, AdPromiseOutcome::Cancelled)
            || !self.slot.is_refreshing()
            || self.slot.generation() != generation
        {
            debug!(generation, "refresh canceled, keeping current creative");
            self.slot.end_refresh();
            end();
            return RefreshOutcome::Canceled;
        }

        self.slot.host().toggle_placeholder(true);
        tokio::time::sleep(self.grace_delay).await;
        self.slot.store_refresh_end(end);
        self.slot.host().require_layout_when_visible();
        RefreshOutcome::Scheduled
    }
}

impl AdSlot {
    /// Refreshes the slot with the configured grace delay.
    ///
    /// See [`RefreshController::refresh`].
    pub async fn refresh(&self, end: RefreshEndCallback) -> RefreshOutcome {
        RefreshController::new(self.clone()).refresh(end).await
    }
}
