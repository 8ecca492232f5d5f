//! Statistics tracking for aggregated WSPR spots.
//!
//! The tracker is fed by the aggregator: every raw spot as it arrives, one
//! outcome event per spot when a window closes, and one [`WindowStats`] per
//! closed window. Lifetime totals live in atomics; each coarse aggregate
//! (instances, windows, SNR history, countries, map spots) sits behind its
//! own `RwLock`, so no two locks are ever held at once.
//!
//! Time-stamped series are kept for a rolling 24 hours; [`StatsTracker::prune`]
//! enforces the horizon and is driven by a timer in the binary.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::grid::{grid_to_latlon, haversine};
use crate::spot::WsprSpot;

/// How long time-stamped series are retained.
pub const RETENTION_HOURS: i64 = 24;

/// SNR history points kept per band and instance (24 h of 2-minute windows).
pub const MAX_SNR_HISTORY: usize = 720;

/// Size of the per-instance recent callsign ring.
pub const RECENT_CALLSIGNS: usize = 10;

/// SNR values are offset into the histogram's positive range.
const SNR_OFFSET: i32 = 60;

/// Per-band breakdown for one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BandInstanceStats {
    pub total_spots: u64,
    pub unique_spots: u64,
    pub best_snr_wins: u64,
    pub tied_snr: u64,
    pub duplicates: u64,
    pub snr_sum: i64,
    pub min_snr: Option<i32>,
    pub max_snr: Option<i32>,
    pub min_distance_km: Option<f64>,
    pub max_distance_km: Option<f64>,
    pub distance_sum_km: f64,
    pub distance_count: u64,
}

impl BandInstanceStats {
    pub fn avg_snr(&self) -> Option<f64> {
        (self.total_spots > 0).then(|| self.snr_sum as f64 / self.total_spots as f64)
    }

    pub fn avg_distance_km(&self) -> Option<f64> {
        (self.distance_count > 0).then(|| self.distance_sum_km / self.distance_count as f64)
    }

    fn record_snr(&mut self, snr: i32) {
        self.total_spots += 1;
        self.snr_sum += snr as i64;
        self.min_snr = Some(self.min_snr.map_or(snr, |m| m.min(snr)));
        self.max_snr = Some(self.max_snr.map_or(snr, |m| m.max(snr)));
    }

    fn record_distance(&mut self, km: f64) {
        self.distance_sum_km += km;
        self.distance_count += 1;
        self.min_distance_km = Some(self.min_distance_km.map_or(km, |m| m.min(km)));
        self.max_distance_km = Some(self.max_distance_km.map_or(km, |m| m.max(km)));
    }
}

/// Counters for one receiver instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStats {
    pub name: String,
    pub total_spots: u64,
    pub unique_spots: u64,
    pub best_snr_wins: u64,
    pub tied_snr: u64,
    pub duplicates: u64,
    pub last_seen: Option<DateTime<Utc>>,
    /// Most recent callsigns first, at most [`RECENT_CALLSIGNS`].
    pub recent_callsigns: VecDeque<String>,
    /// Instance name → times this instance lost a duplicate to it.
    pub duplicate_with: BTreeMap<String, u64>,
    /// Instance name → times the two tied on SNR.
    pub tied_with: BTreeMap<String, u64>,
    pub bands: BTreeMap<String, BandInstanceStats>,
}

impl InstanceStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn band_mut(&mut self, band: &str) -> &mut BandInstanceStats {
        self.bands.entry(band.to_string()).or_default()
    }

    fn push_recent(&mut self, callsign: &str) {
        self.recent_callsigns.retain(|c| c != callsign);
        self.recent_callsigns.push_front(callsign.to_string());
        self.recent_callsigns.truncate(RECENT_CALLSIGNS);
    }
}

/// Counters for one closed window, produced by the aggregator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowStats {
    /// Cycle start.
    pub window_time: DateTime<Utc>,
    /// Raw spots placed in the window.
    pub total_spots: u64,
    /// Spots emitted after dedup.
    pub deduped_spots: u64,
    /// Losing spots of multi-report groups.
    pub duplicate_spots: u64,
    /// Spots dropped for an empty or hashed callsign.
    pub filtered_spots: u64,
    /// Extra reports of a callsign from an instance that already reported it.
    #[serde(default)]
    pub repeat_spots: u64,
    /// Emitted spots per band.
    pub band_counts: BTreeMap<String, u64>,
    pub unique_by_instance: BTreeMap<String, u64>,
    pub best_snr_by_instance: BTreeMap<String, u64>,
    pub tied_snr_by_instance: BTreeMap<String, u64>,
}

/// Average SNR and distance of one instance's spots on one band in one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnrHistoryPoint {
    pub window: DateTime<Utc>,
    pub avg_snr: f64,
    pub spot_count: u64,
    pub avg_distance: f64,
    pub distance_count: u64,
}

/// Per-band statistics for one transmitting country.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CountryStats {
    pub country: String,
    pub unique_callsigns: BTreeSet<String>,
    pub min_snr: i32,
    pub max_snr: i32,
    pub snr_sum: i64,
    pub count: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl CountryStats {
    pub fn mean_snr(&self) -> Option<f64> {
        (self.count > 0).then(|| self.snr_sum as f64 / self.count as f64)
    }
}

/// Where a callsign was heard, for map display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MapSpot {
    pub callsign: String,
    pub grid: String,
    pub country: String,
    /// Band → best SNR heard on it.
    pub band_snr: BTreeMap<String, i32>,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Lifetime totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalStats {
    pub total_spots: u64,
    pub total_submitted: u64,
    pub total_unique: u64,
    pub total_duplicates: u64,
    pub total_tied: u64,
    pub total_windows: u64,
    pub filtered_spots: u64,
    pub parse_failures: u64,
    pub dropped_spots: u64,
    pub late_spots: u64,
}

/// Atomic backing store for [`TotalStats`].
#[derive(Debug, Default)]
struct TotalCounters {
    total_spots: AtomicU64,
    total_submitted: AtomicU64,
    total_unique: AtomicU64,
    total_duplicates: AtomicU64,
    total_tied: AtomicU64,
    total_windows: AtomicU64,
    filtered_spots: AtomicU64,
    parse_failures: AtomicU64,
    dropped_spots: AtomicU64,
    late_spots: AtomicU64,
}

impl TotalCounters {
    fn load(&self) -> TotalStats {
        TotalStats {
            total_spots: self.total_spots.load(Ordering::Relaxed),
            total_submitted: self.total_submitted.load(Ordering::Relaxed),
            total_unique: self.total_unique.load(Ordering::Relaxed),
            total_duplicates: self.total_duplicates.load(Ordering::Relaxed),
            total_tied: self.total_tied.load(Ordering::Relaxed),
            total_windows: self.total_windows.load(Ordering::Relaxed),
            filtered_spots: self.filtered_spots.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            dropped_spots: self.dropped_spots.load(Ordering::Relaxed),
            late_spots: self.late_spots.load(Ordering::Relaxed),
        }
    }

    fn store(&self, t: &TotalStats) {
        self.total_spots.store(t.total_spots, Ordering::Relaxed);
        self.total_submitted.store(t.total_submitted, Ordering::Relaxed);
        self.total_unique.store(t.total_unique, Ordering::Relaxed);
        self.total_duplicates.store(t.total_duplicates, Ordering::Relaxed);
        self.total_tied.store(t.total_tied, Ordering::Relaxed);
        self.total_windows.store(t.total_windows, Ordering::Relaxed);
        self.filtered_spots.store(t.filtered_spots, Ordering::Relaxed);
        self.parse_failures.store(t.parse_failures, Ordering::Relaxed);
        self.dropped_spots.store(t.dropped_spots, Ordering::Relaxed);
        self.late_spots.store(t.late_spots, Ordering::Relaxed);
    }
}

/// Band → instance → series.
pub type SnrHistory = BTreeMap<String, BTreeMap<String, VecDeque<SnrHistoryPoint>>>;

/// Band → country → stats.
pub type CountryTable = BTreeMap<String, BTreeMap<String, CountryStats>>;

/// A deep copy of everything the tracker retains.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub windows: Vec<WindowStats>,
    pub instances: BTreeMap<String, InstanceStats>,
    pub country_stats: CountryTable,
    pub map_spots: BTreeMap<String, MapSpot>,
    pub snr_history: SnrHistory,
    pub total_stats: TotalStats,
}

/// Running sums for one (band, instance) pair in an open window.
#[derive(Debug, Default)]
struct WindowAccumulator {
    snr_sum: i64,
    spot_count: u64,
    distance_sum: f64,
    distance_count: u64,
}

/// Thread-safe statistics collector.
#[derive(Debug)]
pub struct StatsTracker {
    /// Receiver location for distance calculations.
    receiver_location: Option<(f64, f64)>,

    totals: TotalCounters,

    instances: RwLock<BTreeMap<String, InstanceStats>>,

    /// Oldest first.
    windows: RwLock<VecDeque<WindowStats>>,

    snr_history: RwLock<SnrHistory>,

    country_stats: RwLock<CountryTable>,

    map_spots: RwLock<BTreeMap<String, MapSpot>>,

    /// Cycle → (band, instance) → sums, drained by `finish_window`.
    pending: RwLock<BTreeMap<i64, BTreeMap<(String, String), WindowAccumulator>>>,

    /// Distribution of raw SNRs since process start; not persisted.
    snr_histogram: RwLock<Histogram<u64>>,

    start_time: Instant,
}

impl StatsTracker {
    /// Create a tracker measuring distances from `receiver_locator`.
    pub fn new(receiver_locator: &str) -> Self {
        Self {
            receiver_location: grid_to_latlon(receiver_locator),
            totals: TotalCounters::default(),
            instances: RwLock::new(BTreeMap::new()),
            windows: RwLock::new(VecDeque::new()),
            snr_history: RwLock::new(BTreeMap::new()),
            country_stats: RwLock::new(BTreeMap::new()),
            map_spots: RwLock::new(BTreeMap::new()),
            pending: RwLock::new(BTreeMap::new()),
            // SNR histogram: -59 to +40 dB after offsetting
            snr_histogram: RwLock::new(
                Histogram::new_with_bounds(1, 100, 2).expect("Failed to create SNR histogram"),
            ),
            start_time: Instant::now(),
        }
    }

    /// Register instances up front so they show in snapshots before any spot.
    pub fn register_instances<'a>(&self, names: impl IntoIterator<Item = &'a str>) {
        if let Ok(mut map) = self.instances.write() {
            for name in names {
                map.entry(name.to_string())
                    .or_insert_with(|| InstanceStats::new(name));
            }
        }
    }

    fn distance_to(&self, grid: &str) -> Option<f64> {
        let (rx_lat, rx_lon) = self.receiver_location?;
        let (lat, lon) = grid_to_latlon(grid)?;
        Some(haversine(rx_lat, rx_lon, lat, lon))
    }

    /// Record a raw spot as it arrives, before dedup.
    pub fn record_spot(&self, spot: &WsprSpot) {
        self.record_raw(spot, true);
    }

    /// Record a spot that arrived after its window was emitted.
    ///
    /// It counts like any raw spot but feeds no SNR history, since its
    /// window has already been finished.
    pub fn record_late(&self, spot: &WsprSpot) {
        self.totals.late_spots.fetch_add(1, Ordering::Relaxed);
        self.record_raw(spot, false);
    }

    fn record_raw(&self, spot: &WsprSpot, window_open: bool) {
        self.totals.total_spots.fetch_add(1, Ordering::Relaxed);

        let distance = self.distance_to(&spot.grid);
        let seen = spot.epoch_time;

        if let Ok(mut hist) = self.snr_histogram.write() {
            let _ = hist.record((spot.snr + SNR_OFFSET).clamp(1, 99) as u64);
        }

        if let Ok(mut map) = self.instances.write() {
            let inst = map
                .entry(spot.instance_name.clone())
                .or_insert_with(|| InstanceStats::new(&spot.instance_name));
            inst.total_spots += 1;
            inst.last_seen = Some(inst.last_seen.map_or(seen, |t| t.max(seen)));
            if spot.is_reportable() {
                inst.push_recent(&spot.callsign);
            }
            let band = inst.band_mut(&spot.band);
            band.record_snr(spot.snr);
            if let Some(km) = distance {
                band.record_distance(km);
            }
        }

        if window_open && let Ok(mut pending) = self.pending.write() {
            let acc = pending
                .entry(spot.cycle_key())
                .or_default()
                .entry((spot.band.clone(), spot.instance_name.clone()))
                .or_default();
            acc.snr_sum += spot.snr as i64;
            acc.spot_count += 1;
            if let Some(km) = distance {
                acc.distance_sum += km;
                acc.distance_count += 1;
            }
        }

        if !spot.is_reportable() {
            return;
        }

        if !spot.country.is_empty()
            && let Ok(mut table) = self.country_stats.write()
        {
            let entry = table
                .entry(spot.band.clone())
                .or_default()
                .entry(spot.country.clone())
                .or_insert_with(|| CountryStats {
                    country: spot.country.clone(),
                    min_snr: spot.snr,
                    max_snr: spot.snr,
                    ..Default::default()
                });
            entry.unique_callsigns.insert(spot.callsign.clone());
            entry.min_snr = entry.min_snr.min(spot.snr);
            entry.max_snr = entry.max_snr.max(spot.snr);
            entry.snr_sum += spot.snr as i64;
            entry.count += 1;
            entry.last_seen = Some(entry.last_seen.map_or(seen, |t| t.max(seen)));
        }

        if let Ok(mut map) = self.map_spots.write() {
            let entry = map
                .entry(spot.callsign.clone())
                .or_insert_with(|| MapSpot {
                    callsign: spot.callsign.clone(),
                    ..Default::default()
                });
            if !spot.grid.is_empty() {
                entry.grid = spot.grid.clone();
            }
            if !spot.country.is_empty() {
                entry.country = spot.country.clone();
            }
            entry
                .band_snr
                .entry(spot.band.clone())
                .and_modify(|best| *best = (*best).max(spot.snr))
                .or_insert(spot.snr);
            entry.last_seen = Some(entry.last_seen.map_or(seen, |t| t.max(seen)));
        }
    }

    fn with_instance(&self, instance: &str, f: impl FnOnce(&mut InstanceStats)) {
        if let Ok(mut map) = self.instances.write() {
            let inst = map
                .entry(instance.to_string())
                .or_insert_with(|| InstanceStats::new(instance));
            f(inst);
        }
    }

    /// The instance was the only one to report a callsign in a window.
    pub fn record_unique(&self, instance: &str, band: &str) {
        self.totals.total_unique.fetch_add(1, Ordering::Relaxed);
        self.with_instance(instance, |inst| {
            inst.unique_spots += 1;
            inst.band_mut(band).unique_spots += 1;
        });
    }

    /// The instance's spot beat at least one other instance's.
    pub fn record_best_snr(&self, instance: &str, band: &str) {
        self.with_instance(instance, |inst| {
            inst.best_snr_wins += 1;
            inst.band_mut(band).best_snr_wins += 1;
        });
    }

    /// The instance matched the winner's SNR but lost the tie-break to `winner`.
    pub fn record_tied_snr(&self, instance: &str, band: &str, winner: &str) {
        self.totals.total_tied.fetch_add(1, Ordering::Relaxed);
        self.with_instance(instance, |inst| {
            inst.tied_snr += 1;
            inst.band_mut(band).tied_snr += 1;
            *inst.tied_with.entry(winner.to_string()).or_insert(0) += 1;
        });
        self.with_instance(winner, |inst| {
            *inst.tied_with.entry(instance.to_string()).or_insert(0) += 1;
        });
    }

    /// The instance's spot lost to `winner`'s report of the same callsign.
    pub fn record_duplicate(&self, instance: &str, band: &str, winner: &str) {
        self.totals.total_duplicates.fetch_add(1, Ordering::Relaxed);
        self.with_instance(instance, |inst| {
            inst.duplicates += 1;
            inst.band_mut(band).duplicates += 1;
            *inst.duplicate_with.entry(winner.to_string()).or_insert(0) += 1;
        });
    }

    /// Close out a window: store its counters and fold its SNR sums into history.
    pub fn finish_window(&self, window: WindowStats) {
        self.totals.total_windows.fetch_add(1, Ordering::Relaxed);
        self.totals
            .total_submitted
            .fetch_add(window.deduped_spots, Ordering::Relaxed);
        self.totals
            .filtered_spots
            .fetch_add(window.filtered_spots, Ordering::Relaxed);

        let cycle = window.window_time.timestamp();
        let sums = self
            .pending
            .write()
            .ok()
            .and_then(|mut pending| pending.remove(&cycle))
            .unwrap_or_default();

        if let Ok(mut history) = self.snr_history.write() {
            for ((band, instance), acc) in sums {
                if acc.spot_count == 0 {
                    continue;
                }
                let series = history.entry(band).or_default().entry(instance).or_default();
                series.push_back(SnrHistoryPoint {
                    window: window.window_time,
                    avg_snr: acc.snr_sum as f64 / acc.spot_count as f64,
                    spot_count: acc.spot_count,
                    avg_distance: if acc.distance_count > 0 {
                        acc.distance_sum / acc.distance_count as f64
                    } else {
                        0.0
                    },
                    distance_count: acc.distance_count,
                });
                while series.len() > MAX_SNR_HISTORY {
                    series.pop_front();
                }
            }
        }

        if let Ok(mut windows) = self.windows.write() {
            windows.push_back(window);
        }
    }

    /// Record an MQTT payload that could not be parsed.
    pub fn record_parse_failure(&self) {
        self.totals.parse_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a spot dropped because the ingest queue was full.
    pub fn record_dropped(&self) {
        self.totals.dropped_spots.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop everything older than the retention horizon relative to `now`.
    pub fn prune(&self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::hours(RETENTION_HOURS);
        let stale = |seen: Option<DateTime<Utc>>| seen.is_none_or(|t| t < cutoff);

        if let Ok(mut windows) = self.windows.write() {
            windows.retain(|w| w.window_time >= cutoff);
        }

        if let Ok(mut history) = self.snr_history.write() {
            for instances in history.values_mut() {
                for series in instances.values_mut() {
                    series.retain(|p| p.window >= cutoff);
                }
                instances.retain(|_, series| !series.is_empty());
            }
            history.retain(|_, instances| !instances.is_empty());
        }

        if let Ok(mut table) = self.country_stats.write() {
            for countries in table.values_mut() {
                countries.retain(|_, c| !stale(c.last_seen));
            }
            table.retain(|_, countries| !countries.is_empty());
        }

        if let Ok(mut map) = self.map_spots.write() {
            map.retain(|_, m| !stale(m.last_seen));
        }

        if let Ok(mut pending) = self.pending.write() {
            let cutoff_secs = cutoff.timestamp();
            pending.retain(|cycle, _| *cycle >= cutoff_secs);
        }
    }

    /// Current lifetime totals.
    pub fn totals(&self) -> TotalStats {
        self.totals.load()
    }

    /// Deep copy of one instance's counters.
    pub fn instance(&self, name: &str) -> Option<InstanceStats> {
        self.instances.read().ok()?.get(name).cloned()
    }

    /// Deep copy of all retained state.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            windows: self
                .windows
                .read()
                .map(|w| w.iter().cloned().collect())
                .unwrap_or_default(),
            instances: self
                .instances
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
            country_stats: self
                .country_stats
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
            map_spots: self
                .map_spots
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
            snr_history: self
                .snr_history
                .read()
                .map(|m| m.clone())
                .unwrap_or_default(),
            total_stats: self.totals.load(),
        }
    }

    /// Replace all retained state with a previously saved snapshot.
    pub fn restore(&self, snapshot: StatsSnapshot) {
        self.totals.store(&snapshot.total_stats);
        if let Ok(mut w) = self.windows.write() {
            *w = snapshot.windows.into_iter().collect();
        }
        if let Ok(mut m) = self.instances.write() {
            *m = snapshot.instances;
        }
        if let Ok(mut m) = self.country_stats.write() {
            *m = snapshot.country_stats;
        }
        if let Ok(mut m) = self.map_spots.write() {
            *m = snapshot.map_spots;
        }
        if let Ok(mut m) = self.snr_history.write() {
            *m = snapshot.snr_history;
        }
    }

    /// Get the elapsed time since stats collection started.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Generate a summary report.
    pub fn summary(&self) -> StatsSummary {
        let snr_percentiles = self
            .snr_histogram
            .read()
            .ok()
            .filter(|h| h.len() > 0)
            .map(|h| SnrPercentiles {
                p50: h.value_at_quantile(0.50) as i32 - SNR_OFFSET,
                p90: h.value_at_quantile(0.90) as i32 - SNR_OFFSET,
                min: h.min() as i32 - SNR_OFFSET,
                max: h.max() as i32 - SNR_OFFSET,
                mean: h.mean() - SNR_OFFSET as f64,
            });

        let instances = self
            .instances
            .read()
            .map(|m| {
                m.values()
                    .map(|i| InstanceLine {
                        name: i.name.clone(),
                        total_spots: i.total_spots,
                        unique_spots: i.unique_spots,
                        best_snr_wins: i.best_snr_wins,
                        tied_snr: i.tied_snr,
                        duplicates: i.duplicates,
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut spots_by_band: Vec<(String, u64)> = self
            .windows
            .read()
            .map(|windows| {
                let mut bands: BTreeMap<String, u64> = BTreeMap::new();
                for w in windows.iter() {
                    for (band, count) in &w.band_counts {
                        *bands.entry(band.clone()).or_insert(0) += count;
                    }
                }
                bands.into_iter().collect()
            })
            .unwrap_or_default();
        spots_by_band.sort_by(|a, b| b.1.cmp(&a.1));

        StatsSummary {
            elapsed_secs: self.elapsed().as_secs_f64(),
            totals: self.totals.load(),
            snr_percentiles,
            spots_by_band,
            instances,
        }
    }
}

/// SNR distribution of raw spots, in dB.
#[derive(Debug, Clone, Serialize)]
pub struct SnrPercentiles {
    pub p50: i32,
    pub p90: i32,
    pub min: i32,
    pub max: i32,
    pub mean: f64,
}

/// One instance's headline counters.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceLine {
    pub name: String,
    pub total_spots: u64,
    pub unique_spots: u64,
    pub best_snr_wins: u64,
    pub tied_snr: u64,
    pub duplicates: u64,
}

/// Summary of collected statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
    pub elapsed_secs: f64,
    pub totals: TotalStats,
    pub snr_percentiles: Option<SnrPercentiles>,
    /// Deduped spots per band over the retained windows, busiest first.
    pub spots_by_band: Vec<(String, u64)>,
    pub instances: Vec<InstanceLine>,
}

impl fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = &self.totals;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f, "                WSPR AGGREGATOR STATISTICS")?;
        writeln!(f, "═══════════════════════════════════════════════════════")?;
        writeln!(f)?;
        writeln!(f, "Runtime: {:.1}s", self.elapsed_secs)?;
        writeln!(f, "Raw spots: {}", t.total_spots)?;
        writeln!(
            f,
            "Deduped spots: {} over {} windows",
            t.total_submitted, t.total_windows
        )?;
        writeln!(
            f,
            "Unique: {}, duplicates: {}, tied: {}",
            t.total_unique, t.total_duplicates, t.total_tied
        )?;
        writeln!(
            f,
            "Filtered: {}, parse failures: {}, dropped: {}, late: {}",
            t.filtered_spots, t.parse_failures, t.dropped_spots, t.late_spots
        )?;
        writeln!(f)?;

        if let Some(ref p) = self.snr_percentiles {
            writeln!(f, "SNR Distribution (dB):")?;
            writeln!(f, "  Min: {}, Max: {}, Mean: {:.1}", p.min, p.max, p.mean)?;
            writeln!(f, "  P50: {}, P90: {}", p.p50, p.p90)?;
            writeln!(f)?;
        }

        if !self.spots_by_band.is_empty() {
            writeln!(f, "Deduped Spots by Band (24h):")?;
            for (band, count) in &self.spots_by_band {
                writeln!(f, "  {}: {}", band, count)?;
            }
            writeln!(f)?;
        }

        if !self.instances.is_empty() {
            writeln!(f, "Instances:")?;
            for i in &self.instances {
                writeln!(
                    f,
                    "  {}: {} spots, {} unique, {} best SNR, {} tied, {} duplicates",
                    i.name, i.total_spots, i.unique_spots, i.best_snr_wins, i.tied_snr, i.duplicates
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::test_support::{make_spot, make_spot_at};
    use chrono::TimeZone;

    fn window_at(spot: &WsprSpot, deduped: u64) -> WindowStats {
        WindowStats {
            window_time: Utc.timestamp_opt(spot.cycle_key(), 0).unwrap(),
            total_spots: deduped,
            deduped_spots: deduped,
            ..Default::default()
        }
    }

    #[test]
    fn test_record_spot() {
        let stats = StatsTracker::new("FN42");
        let spot = make_spot("kiwi-a", "G0XYZ", -14);

        stats.record_spot(&spot);

        let totals = stats.totals();
        assert_eq!(totals.total_spots, 1);

        let inst = stats.instance("kiwi-a").unwrap();
        assert_eq!(inst.total_spots, 1);
        assert_eq!(inst.recent_callsigns, VecDeque::from(vec!["G0XYZ".to_string()]));
        let band = &inst.bands["20m"];
        assert_eq!(band.total_spots, 1);
        assert_eq!(band.min_snr, Some(-14));
        assert_eq!(band.avg_snr(), Some(-14.0));
        // FN42 to IO91 is a transatlantic path
        assert!(band.avg_distance_km().unwrap() > 5000.0);
    }

    #[test]
    fn test_recent_callsigns_ring() {
        let stats = StatsTracker::new("FN42");
        for i in 0..15 {
            stats.record_spot(&make_spot("kiwi-a", &format!("K{}ABC", i), -10));
        }
        // A repeat moves to the front without growing the ring
        stats.record_spot(&make_spot("kiwi-a", "K10ABC", -10));

        let inst = stats.instance("kiwi-a").unwrap();
        assert_eq!(inst.recent_callsigns.len(), RECENT_CALLSIGNS);
        assert_eq!(inst.recent_callsigns[0], "K10ABC");
        assert_eq!(inst.recent_callsigns[1], "K14ABC");
        assert!(!inst.recent_callsigns.contains(&"K4ABC".to_string()));
    }

    #[test]
    fn test_outcome_events() {
        let stats = StatsTracker::new("FN42");

        stats.record_best_snr("kiwi-b", "20m");
        stats.record_duplicate("kiwi-a", "20m", "kiwi-b");
        stats.record_unique("kiwi-a", "40m");
        stats.record_tied_snr("kiwi-c", "15m", "kiwi-a");

        let a = stats.instance("kiwi-a").unwrap();
        let b = stats.instance("kiwi-b").unwrap();
        let c = stats.instance("kiwi-c").unwrap();

        assert_eq!(b.best_snr_wins, 1);
        assert_eq!(a.duplicates, 1);
        assert_eq!(a.duplicate_with["kiwi-b"], 1);
        assert_eq!(a.unique_spots, 1);
        assert_eq!(a.bands["40m"].unique_spots, 1);
        assert_eq!(c.tied_snr, 1);
        assert_eq!(c.tied_with["kiwi-a"], 1);
        assert_eq!(a.tied_with["kiwi-c"], 1);

        let totals = stats.totals();
        assert_eq!(totals.total_unique, 1);
        assert_eq!(totals.total_duplicates, 1);
        assert_eq!(totals.total_tied, 1);
    }

    #[test]
    fn test_finish_window_builds_snr_history() {
        let stats = StatsTracker::new("FN42");
        let a1 = make_spot("kiwi-a", "G0XYZ", -10);
        let a2 = make_spot("kiwi-a", "M0ABC", -20);
        let b1 = make_spot("kiwi-b", "G0XYZ", -12);
        for s in [&a1, &a2, &b1] {
            stats.record_spot(s);
        }

        stats.finish_window(window_at(&a1, 2));

        let snap = stats.snapshot();
        let a_series = &snap.snr_history["20m"]["kiwi-a"];
        assert_eq!(a_series.len(), 1);
        assert_eq!(a_series[0].spot_count, 2);
        assert!((a_series[0].avg_snr - -15.0).abs() < 1e-9);
        assert_eq!(a_series[0].distance_count, 2);
        assert_eq!(snap.snr_history["20m"]["kiwi-b"][0].spot_count, 1);
        assert_eq!(snap.windows.len(), 1);
        assert_eq!(snap.total_stats.total_submitted, 2);
        assert_eq!(snap.total_stats.total_windows, 1);
    }

    #[test]
    fn test_snr_history_is_bounded() {
        let stats = StatsTracker::new("FN42");
        for i in 0..(MAX_SNR_HISTORY as i64 + 5) {
            let spot = make_spot_at("kiwi-a", "G0XYZ", -10, i * 120);
            stats.record_spot(&spot);
            stats.finish_window(window_at(&spot, 1));
        }
        let snap = stats.snapshot();
        assert_eq!(snap.snr_history["20m"]["kiwi-a"].len(), MAX_SNR_HISTORY);
    }

    #[test]
    fn test_country_and_map_stats() {
        let stats = StatsTracker::new("FN42");
        stats.record_spot(&make_spot("kiwi-a", "G0XYZ", -14));
        stats.record_spot(&make_spot("kiwi-b", "G0XYZ", -10));
        stats.record_spot(&make_spot("kiwi-a", "M0ABC", -20));

        let snap = stats.snapshot();
        let england = &snap.country_stats["20m"]["England"];
        assert_eq!(england.count, 3);
        assert_eq!(england.unique_callsigns.len(), 2);
        assert_eq!(england.min_snr, -20);
        assert_eq!(england.max_snr, -10);
        assert!((england.mean_snr().unwrap() - (-44.0 / 3.0)).abs() < 1e-9);

        let g0xyz = &snap.map_spots["G0XYZ"];
        assert_eq!(g0xyz.grid, "IO91");
        assert_eq!(g0xyz.band_snr["20m"], -10);
    }

    #[test]
    fn test_hashed_callsigns_skip_map_and_country() {
        let stats = StatsTracker::new("FN42");
        stats.record_spot(&make_spot("kiwi-a", "<...>", -14));

        let snap = stats.snapshot();
        assert!(snap.map_spots.is_empty());
        assert!(snap.country_stats.is_empty());
        assert_eq!(snap.total_stats.total_spots, 1);
        assert!(snap.instances["kiwi-a"].recent_callsigns.is_empty());
    }

    #[test]
    fn test_prune_enforces_retention() {
        let stats = StatsTracker::new("FN42");
        let old = make_spot("kiwi-a", "G0XYZ", -10);
        stats.record_spot(&old);
        stats.finish_window(window_at(&old, 1));

        let fresh = make_spot_at("kiwi-a", "K1ABC", -8, 25 * 3600);
        stats.record_spot(&fresh);
        stats.finish_window(window_at(&fresh, 1));

        let now = fresh.epoch_time + ChronoDuration::minutes(5);
        stats.prune(now);

        let snap = stats.snapshot();
        let cutoff = now - ChronoDuration::hours(RETENTION_HOURS);
        assert_eq!(snap.windows.len(), 1);
        assert!(snap.windows.iter().all(|w| w.window_time >= cutoff));
        for instances in snap.snr_history.values() {
            for series in instances.values() {
                assert!(series.iter().all(|p| p.window >= cutoff));
            }
        }
        for countries in snap.country_stats.values() {
            assert!(countries.values().all(|c| c.last_seen.unwrap() >= cutoff));
        }
        assert!(!snap.map_spots.contains_key("G0XYZ"));
        assert!(snap.map_spots.contains_key("K1ABC"));
        // Lifetime totals are not pruned
        assert_eq!(snap.total_stats.total_spots, 2);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let stats = StatsTracker::new("FN42");
        let spot = make_spot("kiwi-a", "G0XYZ", -14);
        stats.record_spot(&spot);
        stats.record_unique("kiwi-a", "20m");
        stats.finish_window(window_at(&spot, 1));
        stats.record_parse_failure();

        let snap = stats.snapshot();
        let restored = StatsTracker::new("FN42");
        restored.restore(snap.clone());
        assert_eq!(restored.snapshot(), snap);
    }

    #[test]
    fn test_summary_generation() {
        let stats = StatsTracker::new("FN42");
        let spot = make_spot("kiwi-a", "G0XYZ", -14);
        stats.record_spot(&spot);
        stats.record_dropped();
        stats.record_late(&make_spot("kiwi-b", "K1ABC", -20));
        let mut window = window_at(&spot, 1);
        window.band_counts.insert("20m".to_string(), 1);
        stats.finish_window(window);

        let summary = stats.summary();
        assert_eq!(summary.totals.total_spots, 2);
        assert_eq!(summary.totals.dropped_spots, 1);
        assert_eq!(summary.totals.late_spots, 1);
        assert_eq!(summary.snr_percentiles.as_ref().unwrap().min, -20);
        assert_eq!(summary.spots_by_band, vec![("20m".to_string(), 1)]);
        let text = summary.to_string();
        assert!(text.contains("kiwi-a"));
        assert!(text.contains("20m: 1"));
    }
}
