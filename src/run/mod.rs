use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::decode::{RunDescriptor, RunInfo};
use crate::merge::boundary::BoundaryTracker;
use crate::merge::histogram::Histogram;
use crate::merge::store::{AggregationStore, MergeReport};
use crate::sink::Snapshot;

/// Run number written out when the run identity is not known yet.
pub const UNKNOWN_RUN_NUMBER: u32 = 12_345_678;

/// Mode reported before any INFO frame arrives.
pub const DEFAULT_MODE: &str = "B";

/// Run identity as reported by INFO, SOR and EOR frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum RunNumber {
    Known(u32),
    #[default]
    Unknown,
}

impl RunNumber {
    /// Zero and the sentinel both mean "not known".
    pub fn from_raw(raw: u32) -> Self {
        if raw == 0 || raw == UNKNOWN_RUN_NUMBER {
            Self::Unknown
        } else {
            Self::Known(raw)
        }
    }

    /// Parses a decimal run number. Anything malformed is `Unknown`.
    pub fn parse(text: &str) -> Self {
        text.trim()
            .parse::<u32>()
            .map(Self::from_raw)
            .unwrap_or(Self::Unknown)
    }

    pub fn is_known(self) -> bool {
        matches!(self, Self::Known(_))
    }

    /// Numeric form, with the sentinel standing in for `Unknown`.
    pub fn as_u32(self) -> u32 {
        match self {
            Self::Known(n) => n,
            Self::Unknown => UNKNOWN_RUN_NUMBER,
        }
    }
}

impl From<u32> for RunNumber {
    fn from(raw: u32) -> Self {
        Self::from_raw(raw)
    }
}

impl From<RunNumber> for u32 {
    fn from(run: RunNumber) -> Self {
        run.as_u32()
    }
}

impl fmt::Display for RunNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Data-taking phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    NoRun,
    Active,
    Ended,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoRun => "no_run",
            Self::Active => "active",
            Self::Ended => "ended",
        }
    }
}

/// Tracks run identity and forces flushes at run boundaries.
#[derive(Debug)]
pub struct RunLifecycle {
    run_number: RunNumber,
    phase: RunPhase,
    mode: String,
    /// An EOR snapshot went out under the unknown run number.
    awaiting_run_number: bool,
}

impl Default for RunLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl RunLifecycle {
    pub fn new() -> Self {
        Self {
            run_number: RunNumber::Unknown,
            phase: RunPhase::NoRun,
            mode: DEFAULT_MODE.to_string(),
            awaiting_run_number: false,
        }
    }

    pub fn run_number(&self) -> RunNumber {
        self.run_number
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    pub fn awaiting_run_number(&self) -> bool {
        self.awaiting_run_number
    }

    /// Applies an INFO frame.
    ///
    /// Returns the run number to reconcile an earlier unknown-run EOR
    /// snapshot with. Keeps returning it on every INFO that carries a known
    /// run until [`RunLifecycle::run_resolved`] is called.
    pub fn apply_info(&mut self, info: &RunInfo) -> Option<RunNumber> {
        if let Some(mode) = &info.mode {
            if *mode != self.mode {
                info!(mode = %mode, "mode changed");
                self.mode = mode.clone();
            }
        }

        if info.run_number != self.run_number {
            info!(from = %self.run_number, to = %info.run_number, "run number updated from INFO");
        }
        self.run_number = info.run_number;

        if self.awaiting_run_number && info.run_number.is_known() {
            return Some(info.run_number);
        }

        None
    }

    /// Marks the unknown-run snapshots as relabelled.
    pub fn run_resolved(&mut self) {
        self.awaiting_run_number = false;
    }

    /// Handles a start-of-run frame. Returns the number of discarded groups.
    ///
    /// Groups still held at SOR belong to a run whose EOR never arrived;
    /// they are dropped rather than attributed to the new run.
    pub fn start_of_run(
        &mut self,
        descriptor: &RunDescriptor,
        store: &mut AggregationStore,
        tracker: &mut BoundaryTracker,
    ) -> usize {
        if self.awaiting_run_number {
            warn!("new run started before the previous run was identified, leaving its snapshot unresolved");
            self.awaiting_run_number = false;
        }

        let discarded = if store.is_empty() {
            0
        } else {
            let groups = store.discard();
            warn!(
                groups,
                previous_run = %self.run_number,
                phase = self.phase.as_str(),
                "start of run with data still accumulated (missed end of run), discarding",
            );
            groups
        };
        tracker.reset();

        self.run_number = descriptor.run_number;
        self.phase = RunPhase::Active;
        info!(run = %self.run_number, "start of run");

        discarded
    }

    /// Handles an end-of-run frame.
    ///
    /// Always flushes, whatever the boundary tracker has inferred so far.
    pub fn end_of_run(
        &mut self,
        descriptor: &RunDescriptor,
        store: &mut AggregationStore,
        tracker: &mut BoundaryTracker,
        timestamp: i64,
    ) -> (Snapshot, MergeReport) {
        if self.phase == RunPhase::NoRun {
            warn!(run = %descriptor.run_number, "end of run without a start of run");
        }

        let missed_start_of_run = !self.run_number.is_known();
        let run_number = if missed_start_of_run {
            descriptor.run_number
        } else {
            if descriptor.run_number.is_known() && descriptor.run_number != self.run_number {
                warn!(
                    current = %self.run_number,
                    descriptor = %descriptor.run_number,
                    "end of run descriptor disagrees with current run",
                );
            }
            self.run_number
        };

        let (objects, report) = store.snapshot_and_reset();
        tracker.reset();

        self.phase = RunPhase::Ended;
        self.run_number = run_number;
        self.awaiting_run_number = !run_number.is_known();

        info!(
            run = %run_number,
            groups = objects.len(),
            missed_start_of_run,
            "end of run",
        );

        let snapshot = Snapshot {
            run_number,
            timestamp,
            mode: self.mode.clone(),
            objects,
            end_of_run: true,
            missed_start_of_run,
        };

        (snapshot, report)
    }

    /// Builds a snapshot for a flush that is not tied to a run boundary.
    pub fn snapshot(&self, objects: BTreeMap<String, Histogram>, timestamp: i64) -> Snapshot {
        Snapshot {
            run_number: self.run_number,
            timestamp,
            mode: self.mode.clone(),
            objects,
            end_of_run: false,
            missed_start_of_run: false,
        }
    }
}
