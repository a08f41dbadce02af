//! Generation tracking and cooperative cancellation.
//!
//! Every pipeline (re)start, teardown and refresh issues a new generation.
//! Stages capture a [`GenerationToken`] and call [`GenerationToken::check`]
//! at entry and after every suspension point. A token whose generation has
//! been superseded fails the check with [`PipelineError::Cancelled`]; the
//! stage must then abort without touching slot state.
//!
//! There is no preemption: an in-flight fetch keeps running, its result is
//! simply discarded once the token goes stale.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PipelineError;

/// Monotonically increasing pipeline generation id.
pub type Generation = u64;

/// Issues generation ids for one slot.
#[derive(Debug, Default)]
pub struct GenerationTracker {
    latest: Arc<AtomicU64>,
}

impl GenerationTracker {
    /// Creates a tracker whose first issued generation is `1`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a new generation and returns a token bound to it.
    pub fn start(&self) -> GenerationToken {
        let id = self.latest.fetch_add(1, Ordering::SeqCst) + 1;
        GenerationToken {
            id,
            latest: Arc::clone(&self.latest),
        }
    }

    /// Advances the generation without starting a new pipeline.
    ///
    /// Used by teardown: every outstanding token becomes stale.
    pub fn invalidate(&self) -> Generation {
        self.latest.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the latest issued generation.
    #[must_use]
    pub fn current(&self) -> Generation {
        self.latest.load(Ordering::SeqCst)
    }

    /// Returns a token bound to an already issued generation.
    ///
    /// The token is immediately stale if `id` is not the latest generation.
    #[must_use]
    pub fn check_still_current(&self, id: Generation) -> GenerationToken {
        GenerationToken {
            id,
            latest: Arc::clone(&self.latest),
        }
    }

    /// Returns a token bound to the latest generation.
    #[must_use]
    pub fn current_token(&self) -> GenerationToken {
        self.check_still_current(self.current())
    }
}

/// Cancellation token for one generation.
#[derive(Debug, Clone)]
pub struct GenerationToken {
    id: Generation,
    latest: Arc<AtomicU64>,
}

impl GenerationToken {
    /// Returns the generation this token was issued for.
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.id
    }

    /// Returns `true` while no newer generation has been issued.
    #[must_use]
    pub fn is_current(&self) -> bool {
        self.latest.load(Ordering::SeqCst) == self.id
    }

    /// Fails with [`PipelineError::Cancelled`] once the generation is stale.
    pub fn check(&self) -> Result<(), PipelineError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(PipelineError::cancelled(self.id))
        }
    }
}
