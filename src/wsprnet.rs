//! WSPRNet spot submission.
//!
//! Deduped spots are posted one at a time to the legacy WSPRNet form endpoint
//! by a small pool of workers sharing a bounded queue. Transient failures
//! (transport errors, timeouts, 5xx) are retried with capped exponential
//! backoff; 4xx responses fail immediately.

use chrono::{DateTime, Utc};
use hdrhistogram::Histogram;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::{BatchSink, WindowBatch};
use crate::config::{ReceiverConfig, WsprNetConfig};
use crate::error::{Error, Result};
use crate::spot::{DedupedSpot, WsprSpot};

/// Program identifier sent with every report.
pub const VERSION: &str = crate::PROGRAM_NAME;

/// Per-request timeout.
pub const POST_TIMEOUT: Duration = Duration::from_secs(10);

/// Number of finished submissions kept for the status surface.
pub const RECENT_RESULTS: usize = 50;

/// Upper bound on draining the queue at shutdown.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Exponential backoff with jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fractional jitter applied to each delay, e.g. 0.2 for ±20%.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay before retry number `retry` (0-based).
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry` with jitter applied.
    pub fn delay(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(scale)
    }
}

/// Submitter runtime settings.
#[derive(Debug, Clone)]
pub struct WsprNetSettings {
    pub url: String,
    pub workers: usize,
    pub queue_size: usize,
    pub policy: RetryPolicy,
    pub timeout: Duration,
    /// Skip the POST and count every spot as a success.
    pub dry_run: bool,
}

impl WsprNetSettings {
    pub fn from_config(config: &WsprNetConfig, dry_run: bool) -> Self {
        Self {
            url: config.url.clone(),
            workers: config.workers,
            queue_size: config.queue_size,
            policy: RetryPolicy {
                max_retries: config.max_retries,
                ..Default::default()
            },
            timeout: POST_TIMEOUT,
            dry_run,
        }
    }
}

/// Counters persisted across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WsprNetStats {
    pub successful: u64,
    pub failed: u64,
    pub retries: u64,
}

/// Live submitter state for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct WsprNetStatus {
    #[serde(flatten)]
    pub stats: WsprNetStats,
    /// Spots rejected because the queue was full.
    pub dropped: u64,
    pub dry_run: bool,
    /// POST latency percentiles in milliseconds.
    pub latency_ms: Option<LatencyPercentiles>,
    /// Latest finished submissions, newest first.
    pub recent: Vec<DedupedSpot>,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencyPercentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

/// Build the WSPRNet form body for one spot.
pub fn build_form(receiver: &ReceiverConfig, spot: &WsprSpot) -> Vec<(&'static str, String)> {
    let time: DateTime<Utc> = spot.epoch_time;
    let qrg = format!("{:.6}", spot.frequency_mhz());
    vec![
        ("function", "wsprupdate".to_string()),
        ("rcall", receiver.callsign.clone()),
        ("rgrid", receiver.locator.clone()),
        ("rqrg", qrg.clone()),
        ("date", time.format("%y%m%d").to_string()),
        ("time", time.format("%H%M").to_string()),
        ("sig", spot.snr.to_string()),
        ("dt", format!("{:.1}", spot.dt)),
        ("drift", spot.drift.to_string()),
        ("tqrg", qrg),
        ("tcall", spot.callsign.clone()),
        ("tgrid", spot.grid.clone()),
        ("dbm", spot.dbm.to_string()),
        ("version", VERSION.to_string()),
    ]
}

struct Shared {
    client: reqwest::Client,
    url: String,
    receiver: ReceiverConfig,
    policy: RetryPolicy,
    dry_run: bool,
    successful: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    dropped: AtomicU64,
    latency: RwLock<Histogram<u64>>,
    recent: Mutex<VecDeque<DedupedSpot>>,
}

impl Shared {
    fn finish(&self, spot: DedupedSpot) {
        if let Ok(mut recent) = self.recent.lock() {
            if recent.len() == RECENT_RESULTS {
                recent.pop_back();
            }
            recent.push_front(spot);
        }
    }

    async fn post(&self, form: &[(&'static str, String)]) -> Result<()> {
        let started = Instant::now();
        let resp = self
            .client
            .post(&self.url)
            .form(form)
            .send()
            .await
            .map_err(|e| Error::TransportTransient(e.to_string()))?;

        if let Ok(mut h) = self.latency.write() {
            let _ = h.record((started.elapsed().as_millis() as u64).max(1));
        }

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(Error::TransportPermanent(format!("HTTP {}", status)))
        } else {
            Err(Error::TransportTransient(format!("HTTP {}", status)))
        }
    }

    async fn submit(&self, spot: &mut DedupedSpot) {
        if self.dry_run {
            self.successful.fetch_add(1, Ordering::Relaxed);
            spot.submitted = true;
            debug!("[dry run] WSPRNet {}", spot.spot);
            return;
        }

        let form = build_form(&self.receiver, &spot.spot);
        let mut retry = 0;
        loop {
            match self.post(&form).await {
                Ok(()) => {
                    self.successful.fetch_add(1, Ordering::Relaxed);
                    spot.submitted = true;
                    spot.error_msg = None;
                    debug!("WSPRNet accepted {}", spot.spot);
                    return;
                }
                Err(e) if e.is_retryable() && retry < self.policy.max_retries => {
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    let delay = self.policy.delay(retry);
                    warn!(
                        "WSPRNet post for {} failed ({}), retry {} in {:?}",
                        spot.spot.callsign,
                        e,
                        retry + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    warn!("WSPRNet gave up on {}: {}", spot.spot.callsign, e);
                    spot.error_msg = Some(e.to_string());
                    return;
                }
            }
        }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<DedupedSpot>>>;

async fn run_worker(id: usize, shared: Arc<Shared>, queue: SharedReceiver) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(mut spot) = next else {
            break;
        };
        shared.submit(&mut spot).await;
        shared.finish(spot);
    }
    debug!("WSPRNet worker {} stopped", id);
}

/// Handle to the WSPRNet worker pool.
pub struct WsprNetSubmitter {
    sender: Mutex<Option<mpsc::Sender<DedupedSpot>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl WsprNetSubmitter {
    /// Spawn the worker pool. Counters start from `seed`.
    pub fn start(
        settings: WsprNetSettings,
        receiver: ReceiverConfig,
        seed: WsprNetStats,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()
            .map_err(|e| Error::ConfigInvalid(format!("HTTP client: {}", e)))?;

        let latency = Histogram::new_with_bounds(1, 60_000, 3)
            .map_err(|e| Error::ConfigInvalid(format!("latency histogram: {}", e)))?;

        let shared = Arc::new(Shared {
            client,
            url: settings.url,
            receiver,
            policy: settings.policy,
            dry_run: settings.dry_run,
            successful: AtomicU64::new(seed.successful),
            failed: AtomicU64::new(seed.failed),
            retries: AtomicU64::new(seed.retries),
            dropped: AtomicU64::new(0),
            latency: RwLock::new(latency),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_RESULTS)),
        });

        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let queue: SharedReceiver = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = (0..settings.workers)
            .map(|id| tokio::spawn(run_worker(id, Arc::clone(&shared), Arc::clone(&queue))))
            .collect();

        info!(
            "WSPRNet submitter started: {} workers, queue {}{}",
            settings.workers,
            settings.queue_size,
            if settings.dry_run { " (dry run)" } else { "" }
        );

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            shared,
        })
    }

    /// Queue a spot without waiting.
    pub fn submit(&self, spot: DedupedSpot) -> Result<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| Error::TransportTransient("wsprnet sender poisoned".to_string()))?;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::TransportTransient("wsprnet stopped".to_string()));
        };
        match tx.try_send(spot) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(spot)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("WSPRNet queue full, dropping {}", spot.spot.callsign);
                Err(Error::QueueFull("wsprnet"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::TransportTransient("wsprnet stopped".to_string()))
            }
        }
    }

    /// Persisted counters.
    pub fn stats(&self) -> WsprNetStats {
        WsprNetStats {
            successful: self.shared.successful.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
            retries: self.shared.retries.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> WsprNetStatus {
        let latency_ms = self
            .shared
            .latency
            .read()
            .ok()
            .filter(|h| h.len() > 0)
            .map(|h| LatencyPercentiles {
                p50: h.value_at_quantile(0.50),
                p90: h.value_at_quantile(0.90),
                p99: h.value_at_quantile(0.99),
            });
        WsprNetStatus {
            stats: self.stats(),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            dry_run: self.shared.dry_run,
            latency_ms,
            recent: self.recent(),
        }
    }

    /// Latest finished submissions with their outcome, newest first.
    pub fn recent(&self) -> Vec<DedupedSpot> {
        self.shared
            .recent
            .lock()
            .map(|r| r.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close the queue and wait up to `limit` for workers to drain it.
    pub async fn shutdown(&self, limit: Duration) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();

        let drained = tokio::time::timeout(limit, async {
            for handle in workers {
                let _ = handle.await;
            }
        })
        .await;

        match drained {
            Ok(()) => info!("WSPRNet submitter drained"),
            Err(_) => warn!("WSPRNet drain timed out after {:?}", limit),
        }
    }
}

impl BatchSink for WsprNetSubmitter {
    fn name(&self) -> &'static str {
        "wsprnet"
    }

    fn deliver(&self, batch: &WindowBatch) {
        for spot in &batch.spots {
            let _ = self.submit(spot.clone());
        }
    }
}
