use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, MergeConfig};
use crate::decode::{Frame, FrameDecoder};
use crate::export::health::HealthMetrics;
use crate::merge::boundary::{BoundaryDecision, BoundaryTracker};
use crate::merge::store::{AggregationStore, MergeReport};
use crate::merge::NamedObject;
use crate::run::RunLifecycle;
use crate::sink::{PersistenceSink, Snapshot};
use crate::transport::request::RequestComposer;
use crate::transport::{self, Channel, ControlCommand, OpenOutcome, TransportError, WaitOutcome};

/// Errors that stop the receiver.
#[derive(Error, Debug)]
pub enum ReceiverError {
    #[error("opening channel")]
    Open(#[source] TransportError),

    #[error("reconnecting after peer timeout")]
    Reconnect(#[source] TransportError),

    #[error("unrecoverable transport failure")]
    Transport(#[source] TransportError),
}

/// Why a snapshot was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Boundary,
    EndOfRun,
    Control,
    Shutdown,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Boundary => "boundary",
            Self::EndOfRun => "end_of_run",
            Self::Control => "control",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Receiver owns the channels and all aggregation state, and drives the
/// request, wait, decode, merge and flush cycle.
pub struct Receiver<C: Channel, S: PersistenceSink> {
    inbound: C,
    control: Option<C>,
    sink: S,
    health: Arc<HealthMetrics>,
    composer: RequestComposer,
    decoder: FrameDecoder,
    tracker: BoundaryTracker,
    store: AggregationStore,
    lifecycle: RunLifecycle,
    merge: MergeConfig,
    poll_interval: Duration,
    reply_timeout: Option<Duration>,
    verbose: u32,
    flush_on_shutdown: bool,
}

impl<C: Channel, S: PersistenceSink> Receiver<C, S> {
    pub fn new(
        cfg: &Config,
        inbound: C,
        control: Option<C>,
        sink: S,
        health: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            inbound,
            control,
            sink,
            health,
            composer: RequestComposer::new(
                cfg.receiver.select.clone(),
                cfg.receiver.reset_merger,
                cfg.receiver.request_streamers,
            ),
            decoder: FrameDecoder::new(),
            tracker: BoundaryTracker::new(cfg.merge.boundary()),
            store: AggregationStore::new(),
            lifecycle: RunLifecycle::new(),
            merge: cfg.merge.clone(),
            poll_interval: cfg.receiver.sleep,
            reply_timeout: cfg.reply_timeout(),
            verbose: cfg.verbose,
            flush_on_shutdown: cfg.flush_on_shutdown,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn store(&self) -> &AggregationStore {
        &self.store
    }

    pub fn tracker(&self) -> &BoundaryTracker {
        &self.tracker
    }

    pub fn lifecycle(&self) -> &RunLifecycle {
        &self.lifecycle
    }

    /// Opens the channels and polls until cancelled or a fatal error.
    ///
    /// Accumulated groups are flushed on the way out when
    /// `flush_on_shutdown` is set, whatever the reason for stopping.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ReceiverError> {
        match self.open_channels(&cancel).await {
            Ok(OpenOutcome::Opened) => {}
            Ok(OpenOutcome::Cancelled) => {
                self.close_channels().await;
                info!("receiver cancelled before its channels opened");
                return Ok(());
            }
            Err(e) => {
                self.close_channels().await;
                return Err(e);
            }
        }

        let control = self
            .control
            .as_ref()
            .map(|c| c.address().to_string())
            .unwrap_or_default();
        info!(
            inbound = %self.inbound.address(),
            control = %control,
            sink = self.sink.name(),
            poll_interval = ?self.poll_interval,
            reply_timeout = ?self.reply_timeout,
            "receiver started",
        );

        let result = self.poll_loop(&cancel).await;

        if let Err(e) = &result {
            error!(error = %e, "receiver stopping on error");
        }

        if self.flush_on_shutdown && !self.store.is_empty() {
            self.flush(FlushReason::Shutdown).await;
        }

        self.close_channels().await;
        info!("receiver stopped");

        result
    }

    /// Waits for the peer as long as it takes, unless cancelled.
    async fn open_channels(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<OpenOutcome, ReceiverError> {
        let opened = transport::open_within(&mut self.inbound, None, cancel)
            .await
            .map_err(ReceiverError::Open)?;
        if opened == OpenOutcome::Cancelled {
            return Ok(opened);
        }

        match self.control.as_mut() {
            Some(control) => transport::open_within(control, None, cancel)
                .await
                .map_err(ReceiverError::Open),
            None => Ok(OpenOutcome::Opened),
        }
    }

    async fn close_channels(&mut self) {
        self.inbound.close().await;
        if let Some(control) = self.control.as_mut() {
            control.close().await;
        }
    }

    async fn poll_loop(&mut self, cancel: &CancellationToken) -> Result<(), ReceiverError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            if self.inbound.address().mode.sends_requests() {
                let request = self.composer.compose();
                if self.verbose > 0 {
                    debug!(directives = %request.directives, "sending request");
                }

                match self.inbound.send(request.into_frames()).await {
                    Ok(()) => self.health.requests_sent.inc(),
                    Err(e) => {
                        self.record_transport_error(&e);
                        if e.is_fatal() {
                            return Err(ReceiverError::Transport(e));
                        }
                        warn!(error = %e, "sending request failed, retrying next cycle");
                        if self.pause(cancel).await {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            let deadline = self.reply_timeout.map(|t| Instant::now() + t);
            let mut reconnected = false;

            loop {
                let outcome = transport::wait_readable(
                    &mut self.inbound,
                    self.control.as_mut(),
                    deadline,
                    cancel,
                )
                .await;

                match outcome {
                    Ok(WaitOutcome::Cancelled) => return Ok(()),
                    Ok(WaitOutcome::TimedOut) => {
                        self.health.peer_timeouts.inc();
                        warn!(
                            address = %self.inbound.address(),
                            timeout = ?self.reply_timeout,
                            "no reply before timeout (peer died?), reconnecting",
                        );
                        let reopened =
                            transport::reopen(&mut self.inbound, self.reply_timeout, cancel)
                                .await
                                .map_err(ReceiverError::Reconnect)?;
                        if reopened == OpenOutcome::Cancelled {
                            return Ok(());
                        }
                        self.health.reconnects.inc();
                        info!(address = %self.inbound.address(), "channel reopened");
                        reconnected = true;
                        break;
                    }
                    Ok(WaitOutcome::Control(command)) => {
                        self.apply_control(command).await;
                    }
                    Ok(WaitOutcome::Data(frames)) => {
                        self.health.replies_received.inc();
                        self.handle_message(&frames).await;
                        break;
                    }
                    Err(e) => {
                        self.record_transport_error(&e);
                        if e.is_fatal() {
                            return Err(ReceiverError::Transport(e));
                        }
                        warn!(error = %e, "receive failed, retrying next cycle");
                        break;
                    }
                }
            }

            if reconnected {
                continue;
            }

            if self.pause(cancel).await {
                return Ok(());
            }
        }
    }

    /// Sleeps for the poll interval. Returns true when cancelled.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        if self.poll_interval.is_zero() {
            return cancel.is_cancelled();
        }

        tokio::select! {
            _ = cancel.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    /// Decodes one multi-part message and dispatches every frame pair.
    pub async fn handle_message(&mut self, frames: &[Bytes]) {
        let observed_at = Instant::now().into_std();
        let decoded = self.decoder.decode(frames, observed_at);

        for e in &decoded.errors {
            self.health.decode_errors.inc();
            warn!(error = %e, "dropping undecodable frame pair");
        }

        for frame in decoded.frames {
            self.health
                .frames
                .with_label_values(&[frame.kind().as_str()])
                .inc();
            self.dispatch(frame).await;
        }

        self.update_gauges();
    }

    async fn dispatch(&mut self, frame: Frame) {
        match frame {
            Frame::Info(info) => {
                if let Some(run) = self.lifecycle.apply_info(&info) {
                    match self.sink.resolve_unknown_run(run).await {
                        Ok(paths) => {
                            self.lifecycle.run_resolved();
                            info!(run = %run, files = paths.len(), "resolved snapshots written without a run number");
                        }
                        Err(e) => {
                            self.health.sink_errors.inc();
                            warn!(error = %e, run = %run, "resolving unknown-run snapshots failed, retrying on next INFO");
                        }
                    }
                }
            }
            Frame::Schema { classes } => {
                debug!(classes, "schema map registered");
            }
            Frame::StartOfRun(descriptor) => {
                let discarded =
                    self.lifecycle
                        .start_of_run(&descriptor, &mut self.store, &mut self.tracker);
                self.health.discarded_groups.inc_by(discarded as f64);
            }
            Frame::EndOfRun(descriptor) => {
                let started = Instant::now();
                let (snapshot, report) = self.lifecycle.end_of_run(
                    &descriptor,
                    &mut self.store,
                    &mut self.tracker,
                    unix_now(),
                );
                self.record_merge(&report);
                self.persist(snapshot, FlushReason::EndOfRun, started).await;
            }
            Frame::Data(object) => self.handle_object(object).await,
            Frame::Unrecognized { tag } => {
                warn!(tag = %tag, "unrecognized frame tag, skipping pair");
            }
        }
    }

    async fn handle_object(&mut self, object: NamedObject) {
        self.health.objects_received.inc();

        if !self.merge.accepts(&object.name) {
            self.health.objects_filtered.inc();
            debug!(name = %object.name, "object filtered by identifier");
            return;
        }

        let name = object.name.clone();
        let observed_at = object.observed_at;
        let backlog = self.store.add_object(object);
        if self.verbose > 0 {
            debug!(name = %name, backlog, groups = self.store.len(), "object added");
        }

        if self.tracker.locked_in() && backlog >= self.merge.max_objects {
            debug!(name = %name, backlog, "backlog limit reached, merging early");
            let report = self.store.merge_all();
            self.record_merge(&report);
        }

        if self.tracker.observe(&name, observed_at) == BoundaryDecision::Flush {
            self.flush(FlushReason::Boundary).await;
        }
    }

    async fn apply_control(&mut self, command: ControlCommand) {
        let label = match &command {
            ControlCommand::Flush => "flush",
            ControlCommand::Reset => "reset",
            ControlCommand::Unknown(_) => "unknown",
        };
        self.health.control_commands.with_label_values(&[label]).inc();

        match command {
            ControlCommand::Flush => {
                if self.store.is_empty() {
                    info!("flush requested with nothing accumulated");
                    return;
                }
                info!(groups = self.store.len(), "flush requested on control channel");
                self.tracker.reset();
                self.flush(FlushReason::Control).await;
            }
            ControlCommand::Reset => {
                let groups = self.store.discard();
                self.tracker.reset();
                self.health.discarded_groups.inc_by(groups as f64);
                info!(groups, "reset requested on control channel");
                self.update_gauges();
            }
            ControlCommand::Unknown(text) => {
                warn!(command = %text, "ignoring unknown control command");
            }
        }
    }

    /// Merges and writes out every group, then starts over.
    async fn flush(&mut self, reason: FlushReason) {
        let started = Instant::now();
        let (objects, report) = self.store.snapshot_and_reset();
        self.record_merge(&report);
        let snapshot = self.lifecycle.snapshot(objects, unix_now());
        self.persist(snapshot, reason, started).await;
    }

    async fn persist(&mut self, snapshot: Snapshot, reason: FlushReason, started: Instant) {
        let groups = snapshot.objects.len();
        self.health
            .flushes
            .with_label_values(&[reason.as_str()])
            .inc();
        self.health.flushed_objects.inc_by(groups as f64);

        match self.sink.write(&snapshot).await {
            Ok(path) => {
                info!(
                    reason = reason.as_str(),
                    run = %snapshot.run_number,
                    groups,
                    path = %path.display(),
                    "flushed snapshot",
                );
            }
            Err(e) => {
                self.health.sink_errors.inc();
                error!(
                    error = %e,
                    reason = reason.as_str(),
                    groups,
                    "writing snapshot failed, snapshot lost",
                );
            }
        }

        self.health
            .flush_duration
            .observe(started.elapsed().as_secs_f64());
        self.update_gauges();
    }

    fn record_merge(&self, report: &MergeReport) {
        self.health
            .merge_errors
            .inc_by(report.dropped.len() as f64);
    }

    fn record_transport_error(&self, e: &TransportError) {
        self.health
            .transport_errors
            .with_label_values(&[e.kind()])
            .inc();
    }

    fn update_gauges(&self) {
        self.health.current_groups.set(self.store.len() as f64);
        self.health
            .boundary_locked
            .set(if self.tracker.locked_in() { 1.0 } else { 0.0 });
        self.health
            .current_run
            .set(f64::from(self.lifecycle.run_number().as_u32()));
    }
}

fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
