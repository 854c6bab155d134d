pub mod file;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::merge::histogram::Histogram;
use crate::run::RunNumber;

/// Errors raised while persisting snapshots.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoding snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The merged state of every group at one flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub run_number: RunNumber,
    /// Unix seconds at which the flush happened.
    pub timestamp: i64,
    pub mode: String,
    pub objects: BTreeMap<String, Histogram>,
    pub end_of_run: bool,
    /// Written at EOR without a known start of run.
    pub missed_start_of_run: bool,
}

/// Sink persists flushed snapshots.
pub trait PersistenceSink: Send {
    /// Returns the sink's name for logging.
    fn name(&self) -> &str;

    /// Persists a snapshot, returning where it went.
    fn write(
        &mut self,
        snapshot: &Snapshot,
    ) -> impl std::future::Future<Output = Result<PathBuf, SinkError>> + Send;

    /// Re-labels snapshots written under the unknown run number once the
    /// real run number is learned. Returns the new locations.
    fn resolve_unknown_run(
        &mut self,
        run: RunNumber,
    ) -> impl std::future::Future<Output = Result<Vec<PathBuf>, SinkError>> + Send;
}
