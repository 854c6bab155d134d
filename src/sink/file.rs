use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Timelike};
use tracing::{info, warn};

use super::{PersistenceSink, SinkError, Snapshot};
use crate::run::RunNumber;

const MISSED_START_SUFFIX: &str = "_missedSOR";

/// Writes each snapshot as a pretty-printed JSON file.
///
/// Files are named
/// `<subsystem>histos_<run>_<mode>_<Y>_<M>_<D>_<h>_<m>_<s>.json` from the
/// flush time in UTC, with no zero padding.
pub struct FileSink {
    dir: PathBuf,
    subsystem: String,
    /// EOR snapshots still waiting for their run number.
    unresolved: Vec<PathBuf>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>, subsystem: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            subsystem: subsystem.into(),
            unresolved: Vec::new(),
        }
    }

    /// Snapshots written under the unknown run number and not yet resolved.
    pub fn unresolved(&self) -> &[PathBuf] {
        &self.unresolved
    }

    /// File stem for `snapshot`, without collision counter or extension.
    pub fn file_stem(&self, snapshot: &Snapshot) -> String {
        let stamp = match DateTime::from_timestamp(snapshot.timestamp, 0) {
            Some(t) => format!(
                "{}_{}_{}_{}_{}_{}",
                t.year(),
                t.month(),
                t.day(),
                t.hour(),
                t.minute(),
                t.second()
            ),
            None => snapshot.timestamp.to_string(),
        };

        let suffix = if needs_resolution(snapshot) {
            MISSED_START_SUFFIX
        } else {
            ""
        };

        format!(
            "{}histos_{}_{}_{}{}",
            self.subsystem, snapshot.run_number, snapshot.mode, stamp, suffix
        )
    }

    /// First free `<stem>.json`, `<stem>_1.json`, ... in the output directory.
    async fn free_path(&self, stem: &str) -> Result<PathBuf, SinkError> {
        let mut candidate = self.dir.join(format!("{stem}.json"));
        let mut n = 0u32;
        while exists(&candidate).await? {
            n += 1;
            candidate = self.dir.join(format!("{stem}_{n}.json"));
        }
        Ok(candidate)
    }

    async fn store(&self, snapshot: &Snapshot) -> Result<PathBuf, SinkError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| SinkError::Io {
                op: "creating",
                path: self.dir.clone(),
                source,
            })?;

        let body = serde_json::to_vec_pretty(snapshot)?;
        let path = self.free_path(&self.file_stem(snapshot)).await?;

        tokio::fs::write(&path, body)
            .await
            .map_err(|source| SinkError::Io {
                op: "writing",
                path: path.clone(),
                source,
            })?;

        Ok(path)
    }

    async fn relabel(&self, old: &Path, run: RunNumber) -> Result<PathBuf, SinkError> {
        let body = tokio::fs::read(old).await.map_err(|source| SinkError::Io {
            op: "reading",
            path: old.to_path_buf(),
            source,
        })?;

        let mut snapshot: Snapshot = serde_json::from_slice(&body)?;
        snapshot.run_number = run;
        let new = self.store(&snapshot).await?;

        tokio::fs::remove_file(old)
            .await
            .map_err(|source| SinkError::Io {
                op: "removing",
                path: old.to_path_buf(),
                source,
            })?;

        Ok(new)
    }
}

impl PersistenceSink for FileSink {
    fn name(&self) -> &str {
        "file"
    }

    async fn write(&mut self, snapshot: &Snapshot) -> Result<PathBuf, SinkError> {
        let path = self.store(snapshot).await?;

        if needs_resolution(snapshot) {
            self.unresolved.push(path.clone());
        }

        info!(
            path = %path.display(),
            run = %snapshot.run_number,
            groups = snapshot.objects.len(),
            end_of_run = snapshot.end_of_run,
            "snapshot written",
        );

        Ok(path)
    }

    async fn resolve_unknown_run(&mut self, run: RunNumber) -> Result<Vec<PathBuf>, SinkError> {
        if !run.is_known() {
            return Ok(Vec::new());
        }

        let mut resolved = Vec::with_capacity(self.unresolved.len());
        let pending = std::mem::take(&mut self.unresolved);

        for (i, old) in pending.iter().enumerate() {
            match self.relabel(old, run).await {
                Ok(new) => {
                    info!(
                        from = %old.display(),
                        to = %new.display(),
                        run = %run,
                        "snapshot relabelled with resolved run number",
                    );
                    resolved.push(new);
                }
                Err(e) => {
                    warn!(error = %e, path = %old.display(), "relabelling snapshot failed");
                    self.unresolved.extend_from_slice(&pending[i..]);
                    return Err(e);
                }
            }
        }

        Ok(resolved)
    }
}

fn needs_resolution(snapshot: &Snapshot) -> bool {
    snapshot.missed_start_of_run && !snapshot.run_number.is_known()
}

async fn exists(path: &Path) -> Result<bool, SinkError> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|source| SinkError::Io {
            op: "checking",
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::merge::histogram::Histogram;

    // 2024-03-05T07:08:09Z
    const TS: i64 = 1_709_622_489;

    fn snapshot(run: RunNumber, missed: bool) -> Snapshot {
        let mut objects = BTreeMap::new();
        objects.insert("hA".to_string(), Histogram::new("hA", vec![1.0, 2.0]));
        Snapshot {
            run_number: run,
            timestamp: TS,
            mode: "B".to_string(),
            objects,
            end_of_run: missed,
            missed_start_of_run: missed,
        }
    }

    #[test]
    fn test_file_stem_format() {
        let sink = FileSink::new("out", "EMC");
        assert_eq!(
            sink.file_stem(&snapshot(RunNumber::Known(246_980), false)),
            "EMChistos_246980_B_2024_3_5_7_8_9"
        );
        assert_eq!(
            sink.file_stem(&snapshot(RunNumber::Unknown, true)),
            "EMChistos_12345678_B_2024_3_5_7_8_9_missedSOR"
        );
        // Only unresolved missed-start snapshots carry the marker.
        assert_eq!(
            sink.file_stem(&snapshot(RunNumber::Known(9), true)),
            "EMChistos_9_B_2024_3_5_7_8_9"
        );
    }

    #[tokio::test]
    async fn test_write_creates_directory_and_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("nested");
        let mut sink = FileSink::new(&dir, "EMC");

        let path = sink
            .write(&snapshot(RunNumber::Known(1), false))
            .await
            .expect("write");

        assert!(path.starts_with(&dir));
        let body = std::fs::read(&path).expect("read back");
        let back: Snapshot = serde_json::from_slice(&body).expect("decode");
        assert_eq!(back, snapshot(RunNumber::Known(1), false));
        assert!(sink.unresolved().is_empty());
    }

    #[tokio::test]
    async fn test_name_collisions_get_counter() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut sink = FileSink::new(tmp.path(), "EMC");
        let snap = snapshot(RunNumber::Known(2), false);

        let first = sink.write(&snap).await.expect("first");
        let second = sink.write(&snap).await.expect("second");

        assert_ne!(first, second);
        assert!(second
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with("_1.json")));
    }

    #[tokio::test]
    async fn test_resolve_unknown_run_relabels_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut sink = FileSink::new(tmp.path(), "EMC");

        let old = sink
            .write(&snapshot(RunNumber::Unknown, true))
            .await
            .expect("write");
        assert_eq!(sink.unresolved().len(), 1);

        let resolved = sink
            .resolve_unknown_run(RunNumber::Known(4242))
            .await
            .expect("resolve");

        assert_eq!(resolved.len(), 1);
        assert!(!old.exists());
        assert!(sink.unresolved().is_empty());

        let name = resolved[0].file_name().and_then(|n| n.to_str()).unwrap_or("");
        assert_eq!(name, "EMChistos_4242_B_2024_3_5_7_8_9.json");

        let back: Snapshot =
            serde_json::from_slice(&std::fs::read(&resolved[0]).expect("read")).expect("decode");
        assert_eq!(back.run_number, RunNumber::Known(4242));
        assert!(back.missed_start_of_run);
    }

    #[tokio::test]
    async fn test_resolve_with_unknown_run_is_noop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut sink = FileSink::new(tmp.path(), "EMC");
        sink.write(&snapshot(RunNumber::Unknown, true))
            .await
            .expect("write");

        let resolved = sink
            .resolve_unknown_run(RunNumber::Unknown)
            .await
            .expect("resolve");

        assert!(resolved.is_empty());
        assert_eq!(sink.unresolved().len(), 1);
    }
}
