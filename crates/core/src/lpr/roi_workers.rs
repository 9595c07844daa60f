//! Bounded worker pool running plate recognition off the pipeline thread.
//!
//! The pipeline submits `(track_id, roi)` jobs and drains completed
//! `(track_id, result)` messages on later frames; it never blocks on
//! recognition. A full job queue drops the newest submission with a
//! counter rather than stalling the pipeline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, warn};

use crate::lpr::domain::plate_recognizer::{PlateRecognizer, RoiImage};

/// Default number of recognition threads.
pub const DEFAULT_WORKERS: usize = 4;

/// Job queue capacity.
const QUEUE_CAPACITY: usize = 100;

/// How long workers block waiting for a job before re-checking the
/// running flag.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Per-worker join deadline on shutdown.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

struct RoiJob {
    track_id: u64,
    roi: RoiImage,
}

/// Outcome of one recognition task, delivered back to the pipeline.
pub struct RoiResult {
    pub track_id: u64,
    pub plate: Option<(String, f64)>,
}

pub struct RoiWorkerPool {
    job_tx: Sender<RoiJob>,
    result_rx: Receiver<RoiResult>,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    handles: Vec<JoinHandle<()>>,
}

impl RoiWorkerPool {
    pub fn spawn(recognizer: Arc<dyn PlateRecognizer>, workers: usize) -> Self {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<RoiJob>(QUEUE_CAPACITY);
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<RoiResult>();
        let running = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        let handles = (0..workers.max(1))
            .map(|_| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let running = running.clone();
                let recognizer = recognizer.clone();
                std::thread::spawn(move || worker_loop(&job_rx, &result_tx, &running, &*recognizer))
            })
            .collect();

        Self {
            job_tx,
            result_rx,
            running,
            dropped,
            handles,
        }
    }

    /// Enqueues a recognition job. A full queue drops the job (the
    /// best-frame selector will be told immediately so the track can
    /// try again later).
    pub fn submit(&self, track_id: u64, roi: RoiImage) -> bool {
        match self.job_tx.try_send(RoiJob { track_id, roi }) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("roi queue full, dropping recognition job for track {track_id}");
                false
            }
        }
    }

    /// Drains all recognition results completed since the last call.
    pub fn drain_results(&self) -> Vec<RoiResult> {
        let mut results = Vec::new();
        loop {
            match self.result_rx.try_recv() {
                Ok(r) => results.push(r),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        results
    }

    pub fn dropped_jobs(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Cooperative shutdown: workers finish their in-flight job and
    /// exit. Waiting is bounded; a worker stuck in the recogniser past
    /// the deadline is left to die with the process.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::Relaxed);
        drop(self.job_tx);
        let deadline = std::time::Instant::now() + SHUTDOWN_DEADLINE;
        for handle in self.handles.drain(..) {
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(
    job_rx: &Receiver<RoiJob>,
    result_tx: &Sender<RoiResult>,
    running: &AtomicBool,
    recognizer: &dyn PlateRecognizer,
) {
    loop {
        match job_rx.recv_timeout(POLL_INTERVAL) {
            Ok(job) => {
                let plate = match recognizer.recognize(&job.roi) {
                    Ok(plate) => plate,
                    Err(e) => {
                        debug!("plate recognition failed for track {}: {e}", job.track_id);
                        None
                    }
                };
                if result_tx
                    .send(RoiResult {
                        track_id: job.track_id,
                        plate,
                    })
                    .is_err()
                {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Relaxed) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct EchoRecognizer;

    impl PlateRecognizer for EchoRecognizer {
        fn recognize(
            &self,
            roi: &RoiImage,
        ) -> Result<Option<(String, f64)>, Box<dyn std::error::Error>> {
            Ok(Some((format!("W{}", roi.width), 0.9)))
        }
    }

    struct FailingRecognizer;

    impl PlateRecognizer for FailingRecognizer {
        fn recognize(
            &self,
            _roi: &RoiImage,
        ) -> Result<Option<(String, f64)>, Box<dyn std::error::Error>> {
            Err("engine crashed".into())
        }
    }

    fn roi(width: u32) -> RoiImage {
        RoiImage {
            data: vec![0u8; (width * 3) as usize],
            width,
            height: 1,
        }
    }

    fn wait_results(pool: &RoiWorkerPool, n: usize) -> Vec<RoiResult> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut results = Vec::new();
        while results.len() < n && Instant::now() < deadline {
            results.extend(pool.drain_results());
            std::thread::sleep(Duration::from_millis(5));
        }
        results
    }

    #[test]
    fn test_jobs_complete_and_results_drain() {
        let pool = RoiWorkerPool::spawn(Arc::new(EchoRecognizer), 2);
        assert!(pool.submit(1, roi(10)));
        assert!(pool.submit(2, roi(20)));

        let mut results = wait_results(&pool, 2);
        results.sort_by_key(|r| r.track_id);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].plate.as_ref().unwrap().0, "W10");
        assert_eq!(results[1].plate.as_ref().unwrap().0, "W20");
        pool.stop();
    }

    #[test]
    fn test_recognizer_error_becomes_none_result() {
        let pool = RoiWorkerPool::spawn(Arc::new(FailingRecognizer), 1);
        assert!(pool.submit(7, roi(4)));
        let results = wait_results(&pool, 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].track_id, 7);
        assert!(results[0].plate.is_none());
        pool.stop();
    }

    #[test]
    fn test_stop_is_bounded() {
        let pool = RoiWorkerPool::spawn(Arc::new(EchoRecognizer), 2);
        let start = Instant::now();
        pool.stop();
        assert!(start.elapsed() < Duration::from_secs(3));
    }
}
