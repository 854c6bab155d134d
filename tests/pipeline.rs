use std::time::{Duration, Instant};

use bytes::Bytes;

use zmq_receiver::decode::{Frame, FrameDecoder, RunDescriptor};
use zmq_receiver::merge::boundary::{BoundaryConfig, BoundaryDecision, BoundaryTracker};
use zmq_receiver::merge::store::AggregationStore;
use zmq_receiver::run::{RunLifecycle, RunNumber};
use zmq_receiver::sink::file::FileSink;
use zmq_receiver::sink::{PersistenceSink, Snapshot};

const TS: i64 = 1_709_622_489;

struct Pipeline {
    decoder: FrameDecoder,
    store: AggregationStore,
    tracker: BoundaryTracker,
    lifecycle: RunLifecycle,
    sink: FileSink,
}

impl Pipeline {
    fn new(dir: &std::path::Path, cfg: BoundaryConfig) -> Self {
        Self {
            decoder: FrameDecoder::new(),
            store: AggregationStore::new(),
            tracker: BoundaryTracker::new(cfg),
            lifecycle: RunLifecycle::new(),
            sink: FileSink::new(dir, "EMC"),
        }
    }

    /// Dispatches one message and returns the paths written.
    async fn feed(&mut self, parts: &[Bytes], at: Instant) -> Vec<std::path::PathBuf> {
        let decoded = self.decoder.decode(parts, at);
        assert!(decoded.errors.is_empty(), "{:?}", decoded.errors);

        let mut written = Vec::new();
        for frame in decoded.frames {
            match frame {
                Frame::Info(info) => {
                    if let Some(run) = self.lifecycle.apply_info(&info) {
                        written.extend(
                            self.sink
                                .resolve_unknown_run(run)
                                .await
                                .expect("resolve"),
                        );
                        self.lifecycle.run_resolved();
                    }
                }
                Frame::StartOfRun(d) => {
                    self.lifecycle
                        .start_of_run(&d, &mut self.store, &mut self.tracker);
                }
                Frame::EndOfRun(d) => {
                    let (snapshot, _) =
                        self.lifecycle
                            .end_of_run(&d, &mut self.store, &mut self.tracker, TS);
                    written.push(self.sink.write(&snapshot).await.expect("write"));
                }
                Frame::Data(object) => {
                    let name = object.name.clone();
                    let observed_at = object.observed_at;
                    self.store.add_object(object);
                    if self.tracker.observe(&name, observed_at) == BoundaryDecision::Flush {
                        let (objects, _) = self.store.snapshot_and_reset();
                        let snapshot = self.lifecycle.snapshot(objects, TS);
                        written.push(self.sink.write(&snapshot).await.expect("write"));
                    }
                }
                Frame::Schema { .. } | Frame::Unrecognized { .. } => {}
            }
        }
        written
    }
}

fn message(parts: &[(&str, Vec<u8>)]) -> Vec<Bytes> {
    parts
        .iter()
        .flat_map(|(tag, payload)| {
            [
                Bytes::copy_from_slice(tag.as_bytes()),
                Bytes::from(payload.clone()),
            ]
        })
        .collect()
}

fn hist(name: &str, bins: &[f64]) -> (&'static str, Vec<u8>) {
    let body = serde_json::json!({ "class": "TH1D", "name": name, "bins": bins });
    ("ROOTHIST", body.to_string().into_bytes())
}

fn descriptor(tag: &'static str, run: u32) -> (&'static str, Vec<u8>) {
    let d = RunDescriptor {
        run_number: RunNumber::from_raw(run),
        run_type: Some(1),
    };
    (tag, d.encode())
}

fn read(path: &std::path::Path) -> Snapshot {
    serde_json::from_slice(&std::fs::read(path).expect("read snapshot")).expect("decode snapshot")
}

fn file_name(path: &std::path::Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

#[tokio::test]
async fn test_full_run_written_to_disk() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let cfg = BoundaryConfig {
        round_limit: 3,
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(tmp.path(), cfg);

    let start = Instant::now();
    let info = ("INFO", b"run=246980 HLTmode=C".to_vec());
    let mut written = pipeline
        .feed(&message(&[info, descriptor("SOR", 246_980)]), start)
        .await;
    assert!(written.is_empty());

    // Three rounds of the same two objects, two seconds apart.
    for round in 0..3u64 {
        let at = start + Duration::from_secs(2 * round);
        let msg = message(&[hist("hE", &[1.0, 1.0]), hist("hT", &[2.0])]);
        written.extend(pipeline.feed(&msg, at).await);
    }
    assert_eq!(written.len(), 1, "boundary flush after three rounds");

    let periodic = read(&written[0]);
    assert!(!periodic.end_of_run);
    assert_eq!(periodic.run_number, RunNumber::Known(246_980));
    assert_eq!(periodic.mode, "C");
    assert_eq!(periodic.objects["hE"].bins, vec![3.0, 3.0]);

    // One more partial round, then end of run.
    let at = start + Duration::from_secs(8);
    pipeline
        .feed(&message(&[hist("hE", &[5.0, 5.0])]), at)
        .await;
    let eor = pipeline
        .feed(&message(&[descriptor("EOR", 246_980)]), at)
        .await;

    assert_eq!(eor.len(), 1);
    let final_snapshot = read(&eor[0]);
    assert!(final_snapshot.end_of_run);
    assert_eq!(final_snapshot.objects["hE"].bins, vec![5.0, 5.0]);
    assert!(!final_snapshot.objects.contains_key("hT"));
    assert_eq!(
        file_name(&eor[0]),
        "EMChistos_246980_C_2024_3_5_7_8_9_1.json"
    );
}

#[tokio::test]
async fn test_missed_start_of_run_file_is_relabelled() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let mut pipeline = Pipeline::new(tmp.path(), BoundaryConfig::default());
    let now = Instant::now();

    pipeline
        .feed(&message(&[hist("hE", &[1.0])]), now)
        .await;
    let written = pipeline
        .feed(&message(&[descriptor("EOR", 0)]), now)
        .await;
    assert_eq!(
        file_name(&written[0]),
        "EMChistos_12345678_B_2024_3_5_7_8_9_missedSOR.json"
    );

    let resolved = pipeline
        .feed(&message(&[("INFO", b"run=300".to_vec())]), now)
        .await;

    assert_eq!(resolved.len(), 1);
    assert!(!written[0].exists());
    assert_eq!(
        file_name(&resolved[0]),
        "EMChistos_300_B_2024_3_5_7_8_9.json"
    );
    let snapshot = read(&resolved[0]);
    assert_eq!(snapshot.run_number, RunNumber::Known(300));
    assert!(snapshot.missed_start_of_run);
}
