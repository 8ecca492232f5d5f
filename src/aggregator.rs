//! Window aggregation and cross-instance deduplication.
//!
//! Raw spots from every instance are bucketed by the 2-minute cycle their
//! `epoch_time` falls in. A bucket stays open until `cycle + 120 s + grace`,
//! which absorbs MQTT delivery jitter, and is then deduplicated: for every
//! `(band, callsign)` group the best report survives.
//!
//! The [`Aggregator`] owns the open-window map outright. Spots arrive on an
//! mpsc channel and queries about open windows go through a second
//! request/response channel, so nothing else ever touches the map.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::spot::{CYCLE_SECS, DedupedSpot, WsprSpot};
use crate::stats::{StatsTracker, WindowStats};

/// Default time a window stays open after its cycle ends.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(20);

/// The deduped output of one closed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowBatch {
    /// Cycle start in Unix seconds.
    pub cycle: i64,
    pub spots: Vec<DedupedSpot>,
}

/// A downstream consumer of deduped batches.
///
/// Implementations must not block: they enqueue and return.
pub trait BatchSink: Send + Sync {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Accept the deduped spots of one closed window.
    fn deliver(&self, batch: &WindowBatch);
}

/// Per-spot outcome of a dedup pass, forwarded to the stats tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupEvent {
    /// Only one instance reported the callsign.
    Unique { instance: String, band: String },
    /// The instance's report won against at least one other instance.
    BestSnr { instance: String, band: String },
    /// The instance matched the winner's SNR and lost the tie-break.
    TiedSnr {
        instance: String,
        band: String,
        winner: String,
    },
    /// The instance's report lost.
    Duplicate {
        instance: String,
        band: String,
        winner: String,
    },
}

/// Raw spots collected for one cycle.
#[derive(Debug, Clone)]
pub struct WindowBucket {
    /// Cycle start in Unix seconds.
    pub cycle: i64,

    /// When the bucket should be closed and emitted.
    pub close_after: DateTime<Utc>,

    /// `(band, callsign)` → reports, in arrival order.
    groups: BTreeMap<(String, String), Vec<WsprSpot>>,

    spot_count: usize,
}

impl WindowBucket {
    /// Create an empty bucket for `cycle`.
    pub fn new(cycle: i64, grace: Duration) -> Self {
        let grace = ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::seconds(20));
        Self {
            cycle,
            close_after: cycle_time(cycle + CYCLE_SECS) + grace,
            groups: BTreeMap::new(),
            spot_count: 0,
        }
    }

    /// Add a spot. The caller guarantees it belongs to this cycle.
    pub fn insert(&mut self, spot: WsprSpot) {
        debug_assert_eq!(spot.cycle_key(), self.cycle);
        self.spot_count += 1;
        self.groups
            .entry((spot.band.clone(), spot.callsign.clone()))
            .or_default()
            .push(spot);
    }

    /// Number of raw spots held.
    pub fn len(&self) -> usize {
        self.spot_count
    }

    pub fn is_empty(&self) -> bool {
        self.spot_count == 0
    }
}

/// Everything produced by deduplicating one bucket.
#[derive(Debug, Clone)]
pub struct DedupOutcome {
    pub batch: WindowBatch,
    pub events: Vec<DedupEvent>,
    pub window: WindowStats,
}

fn cycle_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Order two reports of the same callsign, better first.
///
/// Highest SNR wins; ties go to the smallest `|dt|`, then the smallest
/// `|drift|`, then the lexicographically lowest instance name.
pub fn compare_reports(a: &WsprSpot, b: &WsprSpot) -> Ordering {
    b.snr
        .cmp(&a.snr)
        .then_with(|| a.dt.abs().total_cmp(&b.dt.abs()))
        .then_with(|| a.drift.unsigned_abs().cmp(&b.drift.unsigned_abs()))
        .then_with(|| a.instance_name.cmp(&b.instance_name))
}

/// Index of the best report in `reports`, if any.
pub fn select_winner(reports: &[WsprSpot]) -> Option<usize> {
    reports
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| compare_reports(a, b))
        .map(|(i, _)| i)
}

/// Deduplicate a closed bucket.
pub fn dedup_window(bucket: WindowBucket) -> DedupOutcome {
    let mut window = WindowStats {
        window_time: cycle_time(bucket.cycle),
        total_spots: bucket.spot_count as u64,
        ..Default::default()
    };
    let mut spots = Vec::new();
    let mut events = Vec::new();

    for ((band, _callsign), reports) in bucket.groups {
        let reports: Vec<WsprSpot> = reports
            .into_iter()
            .filter(|s| {
                let keep = s.is_reportable();
                if !keep {
                    window.filtered_spots += 1;
                }
                keep
            })
            .collect();

        // One report per instance; redelivered copies never compete with themselves
        let mut best: BTreeMap<String, WsprSpot> = BTreeMap::new();
        for spot in reports {
            match best.get_mut(&spot.instance_name) {
                Some(kept) => {
                    window.repeat_spots += 1;
                    if compare_reports(&spot, kept) == Ordering::Less {
                        *kept = spot;
                    }
                }
                None => {
                    best.insert(spot.instance_name.clone(), spot);
                }
            }
        }
        let reports: Vec<WsprSpot> = best.into_values().collect();

        let Some(winner_idx) = select_winner(&reports) else {
            continue;
        };
        let winner = &reports[winner_idx];

        if reports.len() == 1 {
            *window
                .unique_by_instance
                .entry(winner.instance_name.clone())
                .or_insert(0) += 1;
            events.push(DedupEvent::Unique {
                instance: winner.instance_name.clone(),
                band: band.clone(),
            });
        } else {
            *window
                .best_snr_by_instance
                .entry(winner.instance_name.clone())
                .or_insert(0) += 1;
            events.push(DedupEvent::BestSnr {
                instance: winner.instance_name.clone(),
                band: band.clone(),
            });
        }

        for (i, loser) in reports.iter().enumerate() {
            if i == winner_idx {
                continue;
            }
            window.duplicate_spots += 1;
            if loser.snr == winner.snr {
                *window
                    .tied_snr_by_instance
                    .entry(loser.instance_name.clone())
                    .or_insert(0) += 1;
                events.push(DedupEvent::TiedSnr {
                    instance: loser.instance_name.clone(),
                    band: band.clone(),
                    winner: winner.instance_name.clone(),
                });
            }
            events.push(DedupEvent::Duplicate {
                instance: loser.instance_name.clone(),
                band: band.clone(),
                winner: winner.instance_name.clone(),
            });
        }

        window.deduped_spots += 1;
        *window.band_counts.entry(band).or_insert(0) += 1;
        spots.push(DedupedSpot::new(winner.clone(), reports.len()));
    }

    DedupOutcome {
        batch: WindowBatch {
            cycle: bucket.cycle,
            spots,
        },
        events,
        window,
    }
}

/// Summary of an open window, for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpenWindow {
    pub cycle: DateTime<Utc>,
    pub close_after: DateTime<Utc>,
    pub spot_count: usize,
    pub group_count: usize,
}

/// Requests answered by the aggregator task.
#[derive(Debug)]
pub enum AggregatorQuery {
    OpenWindows(oneshot::Sender<Vec<OpenWindow>>),
}

/// Cloneable handle for querying a running aggregator.
#[derive(Debug, Clone)]
pub struct AggregatorHandle {
    queries: mpsc::Sender<AggregatorQuery>,
}

impl AggregatorHandle {
    /// Open windows, oldest first. Empty if the aggregator has stopped.
    pub async fn open_windows(&self) -> Vec<OpenWindow> {
        let (tx, rx) = oneshot::channel();
        if self
            .queries
            .send(AggregatorQuery::OpenWindows(tx))
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Producer side of the ingest channel, used by the MQTT task.
#[derive(Debug, Clone)]
pub struct SpotIngest {
    tx: mpsc::Sender<WsprSpot>,
    stats: Arc<StatsTracker>,
}

impl SpotIngest {
    pub fn new(tx: mpsc::Sender<WsprSpot>, stats: Arc<StatsTracker>) -> Self {
        Self { tx, stats }
    }

    /// Offer a spot without waiting. A full channel drops the spot.
    pub fn offer(&self, spot: WsprSpot) -> Result<()> {
        match self.tx.try_send(spot) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(spot)) => {
                self.stats.record_dropped();
                warn!(
                    "Aggregator queue full, dropping {} from {}",
                    spot.callsign, spot.instance_name
                );
                Err(Error::QueueFull("aggregator"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::TransportTransient("aggregator stopped".to_string()))
            }
        }
    }
}

/// Owner of the open-window map.
pub struct Aggregator {
    grace: Duration,
    buckets: BTreeMap<i64, WindowBucket>,
    /// Newest cycle already emitted; older spots are late.
    last_closed: Option<i64>,
    stats: Arc<StatsTracker>,
    sinks: Vec<Arc<dyn BatchSink>>,
}

impl Aggregator {
    pub fn new(grace: Duration, stats: Arc<StatsTracker>, sinks: Vec<Arc<dyn BatchSink>>) -> Self {
        Self {
            grace,
            buckets: BTreeMap::new(),
            last_closed: None,
            stats,
            sinks,
        }
    }

    /// Place a spot in its window. Returns `false` if the window already closed.
    pub fn ingest(&mut self, spot: WsprSpot) -> bool {
        let cycle = spot.cycle_key();
        if self.last_closed.is_some_and(|closed| cycle <= closed) {
            self.stats.record_late(&spot);
            debug!(
                "Late spot {} from {} for closed cycle {}",
                spot.callsign, spot.instance_name, cycle
            );
            return false;
        }

        self.stats.record_spot(&spot);
        let grace = self.grace;
        self.buckets
            .entry(cycle)
            .or_insert_with(|| WindowBucket::new(cycle, grace))
            .insert(spot);
        true
    }

    /// Earliest pending close deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.buckets.values().map(|b| b.close_after).min()
    }

    /// Close and emit every bucket whose deadline is at or before `now`,
    /// oldest first. Returns the number of windows emitted.
    pub fn close_due(&mut self, now: DateTime<Utc>) -> usize {
        let due: Vec<i64> = self
            .buckets
            .values()
            .filter(|b| b.close_after <= now)
            .map(|b| b.cycle)
            .collect();
        for cycle in &due {
            if let Some(bucket) = self.buckets.remove(cycle) {
                self.emit(bucket);
            }
        }
        due.len()
    }

    /// Close and emit every open bucket regardless of deadline.
    pub fn flush_all(&mut self) -> usize {
        let buckets = std::mem::take(&mut self.buckets);
        let count = buckets.len();
        for (_, bucket) in buckets {
            self.emit(bucket);
        }
        count
    }

    fn emit(&mut self, bucket: WindowBucket) {
        let cycle = bucket.cycle;
        self.last_closed = Some(self.last_closed.map_or(cycle, |c| c.max(cycle)));

        let outcome = dedup_window(bucket);

        for event in &outcome.events {
            match event {
                DedupEvent::Unique { instance, band } => self.stats.record_unique(instance, band),
                DedupEvent::BestSnr { instance, band } => {
                    self.stats.record_best_snr(instance, band)
                }
                DedupEvent::TiedSnr {
                    instance,
                    band,
                    winner,
                } => self.stats.record_tied_snr(instance, band, winner),
                DedupEvent::Duplicate {
                    instance,
                    band,
                    winner,
                } => self.stats.record_duplicate(instance, band, winner),
            }
        }

        info!(
            "Window {} closed: {} raw, {} deduped, {} duplicates, {} repeats, {} filtered",
            outcome.window.window_time.format("%Y-%m-%d %H:%M"),
            outcome.window.total_spots,
            outcome.window.deduped_spots,
            outcome.window.duplicate_spots,
            outcome.window.repeat_spots,
            outcome.window.filtered_spots
        );

        if !outcome.batch.spots.is_empty() {
            for sink in &self.sinks {
                debug!(
                    "Delivering {} spots to {}",
                    outcome.batch.spots.len(),
                    sink.name()
                );
                sink.deliver(&outcome.batch);
            }
        }

        self.stats.finish_window(outcome.window);
    }

    /// Open windows, oldest first.
    pub fn open_windows(&self) -> Vec<OpenWindow> {
        self.buckets
            .values()
            .map(|b| OpenWindow {
                cycle: cycle_time(b.cycle),
                close_after: b.close_after,
                spot_count: b.len(),
                group_count: b.groups.len(),
            })
            .collect()
    }

    fn answer(&self, query: AggregatorQuery) {
        match query {
            AggregatorQuery::OpenWindows(reply) => {
                let _ = reply.send(self.open_windows());
            }
        }
    }

    /// Spawn the aggregator task.
    ///
    /// The task runs until every [`SpotIngest`] is dropped, then flushes all
    /// open windows and exits, dropping its sinks.
    pub fn spawn(
        self,
        queue_size: usize,
    ) -> (SpotIngest, AggregatorHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        let (query_tx, query_rx) = mpsc::channel(16);
        let ingest = SpotIngest::new(tx, Arc::clone(&self.stats));
        let handle = tokio::spawn(self.run(rx, query_rx));
        (
            ingest,
            AggregatorHandle { queries: query_tx },
            handle,
        )
    }

    async fn run(
        mut self,
        mut spots: mpsc::Receiver<WsprSpot>,
        mut queries: mpsc::Receiver<AggregatorQuery>,
    ) {
        loop {
            let wait = self
                .next_deadline()
                .map(|d| (d - Utc::now()).to_std().unwrap_or(Duration::ZERO));

            tokio::select! {
                spot = spots.recv() => match spot {
                    Some(spot) => {
                        self.ingest(spot);
                    }
                    None => break,
                },
                Some(query) = queries.recv() => self.answer(query),
                _ = sleep_or_forever(wait) => {
                    self.close_due(Utc::now());
                }
            }
        }

        let flushed = self.flush_all();
        info!("Aggregator stopped, flushed {} open windows", flushed);
    }
}

async fn sleep_or_forever(wait: Option<Duration>) {
    match wait {
        Some(d) => tokio::time::sleep(d).await,
        None => std::future::pending().await,
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use crate::spot::HASHED_CALLSIGN;
    use crate::spot::test_support::make_spot_at;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    const INSTANCES: [&str; 3] = ["kiwi-a", "kiwi-b", "kiwi-c"];
    const CALLS: [&str; 4] = ["G0XYZ", "K1ABC", "JA1ZZZ", HASHED_CALLSIGN];

    fn arb_spot() -> impl Strategy<Value = WsprSpot> {
        (0..3usize, 0..4usize, -30..10i32, -20..20i32, -3..3i32, 0..119i64).prop_map(
            |(inst, call, snr, dt_tenths, drift, offset)| {
                let mut spot = make_spot_at(INSTANCES[inst], CALLS[call], snr, offset);
                spot.dt = dt_tenths as f32 / 10.0;
                spot.drift = drift;
                spot
            },
        )
    }

    proptest! {
        #[test]
        fn prop_cycle_key_is_aligned(secs in -10_000_000_000i64..10_000_000_000i64) {
            let key = crate::spot::cycle_start(secs);
            prop_assert_eq!(key.rem_euclid(CYCLE_SECS), 0);
            prop_assert!(key <= secs && secs - key < CYCLE_SECS);
        }

        #[test]
        fn prop_one_winner_per_callsign(spots in prop::collection::vec(arb_spot(), 1..40)) {
            let mut bucket = WindowBucket::new(spots[0].cycle_key(), DEFAULT_GRACE);
            for spot in spots.iter().cloned() {
                bucket.insert(spot);
            }
            let outcome = dedup_window(bucket);

            let mut seen = BTreeSet::new();
            for deduped in &outcome.batch.spots {
                let spot = &deduped.spot;
                prop_assert!(spot.is_reportable());
                prop_assert!(seen.insert((spot.band.clone(), spot.callsign.clone())));

                // No other report of the same callsign beats the winner
                for other in spots.iter().filter(|s| s.callsign == spot.callsign && s.band == spot.band) {
                    prop_assert_ne!(compare_reports(other, spot), Ordering::Less);
                }
            }

            let reportable: BTreeSet<&str> = spots
                .iter()
                .filter(|s| s.is_reportable())
                .map(|s| s.callsign.as_str())
                .collect();
            prop_assert_eq!(outcome.batch.spots.len(), reportable.len());
            prop_assert_eq!(
                outcome.window.filtered_spots as usize,
                spots.len() - spots.iter().filter(|s| s.is_reportable()).count()
            );
        }

        #[test]
        fn prop_winner_independent_of_arrival_order(
            spots in prop::collection::vec(arb_spot(), 1..20),
            seed in any::<u64>(),
        ) {
            let mut shuffled = spots.clone();
            let len = shuffled.len();
            shuffled.rotate_left((seed as usize) % len);
            if seed % 2 == 0 {
                shuffled.reverse();
            }

            let run = |input: &[WsprSpot]| {
                let mut bucket = WindowBucket::new(input[0].cycle_key(), DEFAULT_GRACE);
                for spot in input.iter().cloned() {
                    bucket.insert(spot);
                }
                dedup_window(bucket)
                    .batch
                    .spots
                    .into_iter()
                    .map(|d| (d.spot.callsign, d.spot.instance_name, d.spot.snr))
                    .collect::<Vec<_>>()
            };
            prop_assert_eq!(run(&spots), run(&shuffled));
        }
    }
}
