//! The per-frame pipeline: detector → tracker → fusion → alert gate →
//! snapshot/database/upload queue.
//!
//! The pipeline thread owns every per-track table and performs no
//! network I/O inline; uploads, heartbeats, monitoring snapshots,
//! whitelist refreshes and retention all run on their own workers,
//! coupled only through bounded queues and shared atomics.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{info, warn};

use crate::alert::event::AlertEvent;
use crate::alert::gate::{AlertCandidate, AlertGate, DEFAULT_CONSISTENT_FRAMES};
use crate::alert::snapshot::save_event_snapshot;
use crate::beacon::domain::scanner::BeaconScanner;
use crate::beacon::whitelist::{self, WhitelistHandle};
use crate::cloud::client::CloudClient;
use crate::cloud::heartbeat;
use crate::cloud::monitoring::{self, MonitoringWorkerConfig};
use crate::cloud::uploader::Uploader;
use crate::config::Config;
use crate::depth::domain::depth_reader::DepthReader;
use crate::detection::domain::vehicle_detector::VehicleDetector;
use crate::detection::infrastructure::byte_tracker::ByteTracker;
use crate::fusion::engine::FusionEngine;
use crate::lpr::domain::plate_recognizer::PlateRecognizer;
use crate::lpr::roi_workers::{RoiWorkerPool, DEFAULT_WORKERS};
use crate::pipeline::frame_source::FrameSource;
use crate::pipeline::stats::PipelineStats;
use crate::shared::frame::Frame;
use crate::storage::database::DetectionDatabase;
use crate::storage::retention::RetentionManager;

/// Beacon readings older than this are ignored at fusion time.
const BEACON_MAX_AGE: Duration = Duration::from_secs(5);

/// External collaborators handed to the pipeline at construction.
pub struct PipelineAdapters {
    pub detector: Box<dyn VehicleDetector>,
    pub scanner: Box<dyn BeaconScanner>,
    pub depth_reader: Box<dyn DepthReader>,
    pub recognizer: Arc<dyn PlateRecognizer>,
}

pub struct Pipeline {
    detector: Box<dyn VehicleDetector>,
    scanner: Box<dyn BeaconScanner>,
    depth_reader: Box<dyn DepthReader>,
    tracker: ByteTracker,
    engine: FusionEngine,
    gate: AlertGate,
    roi_pool: Option<RoiWorkerPool>,
    whitelist: WhitelistHandle,
    database: Option<Arc<DetectionDatabase>>,
    uploader: Option<Uploader>,
    retention: Option<RetentionManager>,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PipelineStats>,
    last_frame: Arc<Mutex<Option<Frame>>>,
    snapshot_dir: PathBuf,
    save_snapshots: bool,
    running: Arc<AtomicBool>,
}

impl Pipeline {
    /// Builds the pipeline and spawns its background workers. Only
    /// startup problems (bad database path, malformed cloud config)
    /// fail; a disabled cloud simply leaves the upload side off.
    pub fn new(
        config: &Config,
        adapters: PipelineAdapters,
        device_id: String,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(PipelineStats::new());
        let snapshot_dir = PathBuf::from(&config.paths.snapshot_dir);
        let whitelist = WhitelistHandle::new();
        let last_frame: Arc<Mutex<Option<Frame>>> = Arc::new(Mutex::new(None));

        let database = Some(Arc::new(DetectionDatabase::open(
            std::path::Path::new(&config.paths.database_path),
        )?));

        let roi_pool = config
            .lpr
            .best_frame_selection
            .enabled
            .then(|| RoiWorkerPool::spawn(adapters.recognizer.clone(), DEFAULT_WORKERS));

        let mut workers = Vec::new();
        let mut uploader = None;
        if config.cloud.enabled {
            let client = Arc::new(CloudClient::new(&config.cloud)?);
            uploader = Some(Uploader::spawn(client.clone()));

            let stats_fn = {
                let stats = stats.clone();
                Arc::new(move || stats.snapshot()) as heartbeat::StatsFn
            };
            workers.push(heartbeat::spawn(
                client.clone(),
                device_id.clone(),
                stats_fn,
                heartbeat::HEARTBEAT_INTERVAL,
                running.clone(),
            ));

            workers.push(whitelist::spawn_refresher(
                whitelist.clone(),
                client.clone(),
                Duration::from_secs_f64(config.cloud.upload_interval.max(1.0)),
                running.clone(),
            ));

            if config.cloud.enable_monitoring_snapshot {
                let frame_fn = {
                    let last_frame = last_frame.clone();
                    Arc::new(move || {
                        last_frame.lock().ok().and_then(|guard| guard.clone())
                    }) as monitoring::FrameFn
                };
                workers.push(monitoring::spawn(
                    client,
                    MonitoringWorkerConfig {
                        device_id,
                        interval: Duration::from_secs_f64(
                            config.cloud.monitoring_snapshot_interval.max(1.0),
                        ),
                        save_snapshots: config.cloud.save_snapshots,
                        snapshot_dir: snapshot_dir.clone(),
                    },
                    frame_fn,
                    running.clone(),
                ));
            }
        }

        let retention = Some(RetentionManager::spawn(
            config.data_retention.clone(),
            database.clone(),
            snapshot_dir.clone(),
        ));

        Ok(Self {
            detector: adapters.detector,
            scanner: adapters.scanner,
            depth_reader: adapters.depth_reader,
            tracker: ByteTracker::new(&config.tracking),
            engine: FusionEngine::new(config),
            gate: AlertGate::new(&config.alert.dedup, DEFAULT_CONSISTENT_FRAMES),
            roi_pool,
            whitelist,
            database,
            uploader,
            retention,
            workers,
            stats,
            last_frame,
            snapshot_dir,
            save_snapshots: config.cloud.save_snapshots,
            running,
        })
    }

    /// Shared stop flag; clearing it ends `run`.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    pub fn whitelist_handle(&self) -> WhitelistHandle {
        self.whitelist.clone()
    }

    /// Drives the pipeline until the source is exhausted or the running
    /// flag clears.
    pub fn run(
        &mut self,
        source: &mut dyn FrameSource,
    ) -> Result<(), Box<dyn std::error::Error>> {
        while self.running.load(Ordering::Relaxed) {
            match source.next_frame()? {
                Some(frame) => self.process_frame(frame),
                None => break,
            }
        }
        Ok(())
    }

    /// Runs one frame through the whole chain.
    pub fn process_frame(&mut self, frame: Frame) {
        // Completed plate recognitions apply before this frame fuses.
        if let Some(pool) = &self.roi_pool {
            for result in pool.drain_results() {
                self.engine.apply_plate_result(result.track_id, result.plate);
            }
        }

        // A failing detector means no observation this frame; tracks
        // are aged, not aborted.
        let detections = match self.detector.detect(&frame) {
            Ok(detections) => detections,
            Err(e) => {
                warn!("detector failed on frame {}: {e}", frame.index());
                return;
            }
        };

        let tracks = self.tracker.update(&detections, frame.index());
        let readings = self.scanner.snapshot(BEACON_MAX_AGE);
        let whitelist = self.whitelist.snapshot();

        let outcome = self.engine.process_frame(
            &tracks,
            &frame,
            &readings,
            &whitelist,
            &*self.depth_reader,
        );

        for (track_id, roi) in outcome.roi_requests {
            let submitted = self
                .roi_pool
                .as_ref()
                .is_some_and(|pool| pool.submit(track_id, roi));
            if !submitted {
                self.engine.plate_job_dropped(track_id);
            }
        }

        for candidate in &outcome.candidates {
            if self.gate.admit(candidate) {
                self.emit_alert(candidate, &frame);
            }
        }

        let live = self.tracker.live_track_ids();
        self.engine.cleanup(&live);
        self.gate.cleanup(&live);

        if let Ok(mut guard) = self.last_frame.lock() {
            *guard = Some(frame);
        }
        self.stats.frame_processed();
    }

    fn emit_alert(&mut self, candidate: &AlertCandidate, frame: &Frame) {
        let mut event = build_event(candidate);

        if self.save_snapshots {
            match save_event_snapshot(
                frame,
                &self.snapshot_dir,
                candidate.track_id,
                candidate.timestamp,
            ) {
                Ok(path) => {
                    self.engine
                        .record_snapshot(candidate.track_id, path.display().to_string());
                    event.local_snapshot = Some(path);
                }
                Err(e) => warn!("snapshot failed for track {}: {e}", candidate.track_id),
            }
        }

        if let Some(db) = &self.database {
            if let Err(e) = db.insert_event(&event) {
                warn!("database insert failed: {e}");
            }
        }

        if let Some(uploader) = &self.uploader {
            if !uploader.enqueue(event) {
                self.stats.alert_dropped();
            }
        }

        self.engine.mark_reported(candidate.track_id, candidate.status);
        self.tracker.mark_processed(candidate.track_id);
        self.stats.alert_emitted(candidate.class.label());
        info!(
            "alert: track {} {} {}",
            candidate.track_id,
            candidate.class.label(),
            candidate.status.as_str()
        );
    }

    /// Cooperative shutdown. ROI workers stop before frame resources
    /// are released; the uploader drains within its own deadline.
    pub fn shutdown(mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(pool) = self.roi_pool.take() {
            pool.stop();
        }
        if let Some(uploader) = self.uploader.take() {
            uploader.stop();
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        if let Some(retention) = self.retention.take() {
            retention.stop();
        }
        info!("pipeline stopped");
    }
}

fn build_event(candidate: &AlertCandidate) -> AlertEvent {
    let mut event = AlertEvent::new(
        candidate.timestamp,
        candidate.class,
        candidate.status,
        candidate.registered,
        candidate.track_id,
        Some(candidate.bbox),
    );
    event.confidence = Some(candidate.confidence);
    event.distance = candidate.distance_m;
    event.beacon_mac = candidate.beacon_mac.clone();
    event.company = candidate.company.clone();
    event.environment_code = candidate.environment_code.clone();
    event.plate_number = candidate.plate.as_ref().map(|(p, _)| p.clone());
    event
}
