//! Round boundary inference.
//!
//! The upstream merger publishes the same set of named objects over and
//! over, but nothing in the stream says where one round ends. The tracker
//! watches inter-arrival gaps: the object that precedes a long gap is the
//! candidate boundary, and seeing the same candidate again before another
//! long gap locks it in. Once locked, every arrival of the boundary name
//! counts a round and a flush is reported after `round_limit` rounds.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

/// Tuning for the boundary tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundaryConfig {
    /// Gaps must exceed this to count as evidence. Also the initial threshold.
    pub min_wait: Duration,
    /// Confirmations above this force a lock without repeated gap evidence.
    pub confirmation_limit: u32,
    /// Confirmations needed on a locked boundary before a flush.
    pub round_limit: u32,
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(1),
            confirmation_limit: 5,
            round_limit: 12,
        }
    }
}

/// What the caller should do after an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryDecision {
    Continue,
    /// A full round cycle completed on the locked boundary: merge and flush.
    Flush,
}

/// Timing state for boundary inference. Single instance per receiver.
#[derive(Debug)]
pub struct BoundaryTracker {
    cfg: BoundaryConfig,
    previous_name: Option<String>,
    candidate: Option<String>,
    confirmations: u32,
    locked_in: bool,
    gap_threshold: Duration,
    max_observed_gap: Duration,
    last_object_at: Option<Instant>,
    just_flushed: bool,
}

impl BoundaryTracker {
    pub fn new(cfg: BoundaryConfig) -> Self {
        Self {
            cfg,
            previous_name: None,
            candidate: None,
            confirmations: 0,
            locked_in: false,
            gap_threshold: cfg.min_wait,
            max_observed_gap: Duration::ZERO,
            last_object_at: None,
            just_flushed: true,
        }
    }

    /// Returns all fields to their initial values.
    pub fn reset(&mut self) {
        *self = Self::new(self.cfg);
    }

    /// Records the arrival of `name` at `at`.
    pub fn observe(&mut self, name: &str, at: Instant) -> BoundaryDecision {
        // The first object after a flush must not be charged with the
        // flush's own latency.
        if self.just_flushed {
            self.last_object_at = Some(at);
            self.just_flushed = false;
        }

        let last = *self.last_object_at.get_or_insert(at);
        let gap = at.saturating_duration_since(last);

        if gap >= self.gap_threshold && !self.locked_in {
            self.on_long_gap(gap);
        }

        if self.candidate.as_deref() == Some(name) && self.confirmations > 0 {
            self.confirmations += 1;
            if self.confirmations > self.cfg.confirmation_limit && !self.locked_in {
                warn!(
                    boundary = name,
                    confirmations = self.confirmations,
                    "boundary never confirmed by gap timing, forcing lock-in",
                );
                self.locked_in = true;
            }
        }

        self.previous_name = Some(name.to_string());
        self.last_object_at = Some(at);
        if gap > self.max_observed_gap {
            self.max_observed_gap = gap;
        }

        if self.locked_in
            && self.candidate.as_deref() == Some(name)
            && self.confirmations >= self.cfg.round_limit
        {
            info!(
                boundary = name,
                rounds = self.confirmations,
                max_gap = ?self.max_observed_gap,
                "round limit reached on locked boundary",
            );
            self.reset();
            return BoundaryDecision::Flush;
        }

        BoundaryDecision::Continue
    }

    fn on_long_gap(&mut self, gap: Duration) {
        match (&self.candidate, &self.previous_name) {
            (Some(candidate), previous) if previous.as_ref() != Some(candidate) => {
                info!(
                    from = %candidate,
                    to = previous.as_deref().unwrap_or(""),
                    ?gap,
                    "boundary candidate changed",
                );
            }
            (Some(candidate), Some(_)) if !candidate.is_empty() => {
                info!(boundary = %candidate, ?gap, "boundary locked in");
                self.locked_in = true;
            }
            _ => {}
        }

        self.candidate = self.previous_name.clone();
        self.gap_threshold = gap;
        if gap > self.cfg.min_wait && !self.locked_in {
            self.confirmations += 1;
        }

        debug!(
            candidate = self.candidate.as_deref().unwrap_or(""),
            confirmations = self.confirmations,
            threshold = ?self.gap_threshold,
            "long gap observed",
        );
    }

    pub fn locked_in(&self) -> bool {
        self.locked_in
    }

    pub fn candidate(&self) -> Option<&str> {
        self.candidate.as_deref()
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn gap_threshold(&self) -> Duration {
        self.gap_threshold
    }

    pub fn max_observed_gap(&self) -> Duration {
        self.max_observed_gap
    }

    pub fn config(&self) -> BoundaryConfig {
        self.cfg
    }
}
