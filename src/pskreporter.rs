//! PSKReporter reporting over UDP.
//!
//! Deduped spots are queued as [`PskReport`]s. A single sender task wakes at
//! a random interval, drops reports that were already sent recently, packs
//! the rest into IPFIX packets (see [`crate::ipfix`]) and sends them to the
//! collector with a short gap between packets.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::{BatchSink, WindowBatch};
use crate::band::band_partition;
use crate::config::{PskReporterConfig, ReceiverConfig};
use crate::error::{Error, Result};
use crate::ipfix::{PacketHeader, ReceiverInfo, SenderReport, build_packet};
use crate::spot::WsprSpot;

/// Minimum spacing between two reports of the same station.
pub const MIN_SECONDS_BETWEEN_REPORTS: i64 = 120;

/// Default queue capacity.
pub const MAX_QUEUE_SIZE: usize = 10_000;

/// Packets at the start of a session that always carry descriptors.
pub const DESCRIPTOR_PACKETS: u32 = 4;

/// Descriptors are re-sent once this much time has passed.
pub const DESCRIPTOR_REFRESH_SECS: i64 = 500;

/// Pause between consecutive packets.
pub const PACKET_GAP: Duration = Duration::from_millis(180);

/// One report destined for PSKReporter.
#[derive(Debug, Clone, PartialEq)]
pub struct PskReport {
    pub callsign: String,
    pub frequency: u64,
    pub snr: i32,
    pub mode: String,
    pub locator: String,
    pub time: DateTime<Utc>,
}

impl PskReport {
    pub fn from_spot(spot: &WsprSpot) -> Self {
        Self {
            callsign: spot.callsign.clone(),
            frequency: spot.frequency,
            snr: spot.snr,
            mode: spot.mode.clone(),
            locator: spot.grid.clone(),
            time: spot.epoch_time,
        }
    }

    fn to_sender(&self) -> SenderReport {
        SenderReport {
            callsign: self.callsign.clone(),
            frequency: self.frequency,
            snr: self.snr,
            mode: self.mode.clone(),
            locator: self.locator.clone(),
            flow_start: self.time.timestamp().clamp(0, u32::MAX as i64) as u32,
        }
    }
}

#[derive(Debug, Clone)]
struct SentEntry {
    callsign: String,
    partition: (bool, u64),
    mode: String,
    sent_at: DateTime<Utc>,
}

/// Recently transmitted reports, for duplicate suppression.
#[derive(Debug, Default)]
pub struct SentLog {
    entries: VecDeque<SentEntry>,
}

impl SentLog {
    /// Whether `report` repeats one sent within the last
    /// [`MIN_SECONDS_BETWEEN_REPORTS`] seconds.
    pub fn is_duplicate(&self, report: &PskReport, now: DateTime<Utc>) -> bool {
        let partition = band_partition(report.frequency);
        let window = ChronoDuration::seconds(MIN_SECONDS_BETWEEN_REPORTS);
        self.entries.iter().any(|e| {
            e.callsign == report.callsign
                && e.partition == partition
                && e.mode == report.mode
                && now - e.sent_at <= window
        })
    }

    pub fn record(&mut self, report: &PskReport, now: DateTime<Utc>) {
        self.entries.push_back(SentEntry {
            callsign: report.callsign.clone(),
            partition: band_partition(report.frequency),
            mode: report.mode.clone(),
            sent_at: now,
        });
    }

    /// Forget entries older than twice the suppression window.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - ChronoDuration::seconds(2 * MIN_SECONDS_BETWEEN_REPORTS);
        self.entries.retain(|e| e.sent_at >= cutoff);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Packets produced by one planning pass.
#[derive(Debug, Default)]
pub struct Plan {
    pub packets: Vec<Vec<u8>>,
    pub reports: usize,
    pub suppressed: usize,
}

/// Packet sequencing, descriptor refresh and duplicate suppression.
#[derive(Debug)]
pub struct PacketPlanner {
    receiver: ReceiverInfo,
    observation_domain: u32,
    sequence: u32,
    descriptor_packets: u32,
    last_descriptors: Option<DateTime<Utc>>,
    sent: SentLog,
}

impl PacketPlanner {
    pub fn new(receiver: ReceiverInfo, observation_domain: u32) -> Self {
        Self {
            receiver,
            observation_domain,
            sequence: 0,
            descriptor_packets: 0,
            last_descriptors: None,
            sent: SentLog::default(),
        }
    }

    fn needs_descriptors(&self, now: DateTime<Utc>) -> bool {
        self.descriptor_packets < DESCRIPTOR_PACKETS
            || self
                .last_descriptors
                .is_none_or(|t| now - t > ChronoDuration::seconds(DESCRIPTOR_REFRESH_SECS))
    }

    fn next_header(&mut self, now: DateTime<Utc>) -> (PacketHeader, bool) {
        let with_descriptors = self.needs_descriptors(now);
        if with_descriptors {
            self.descriptor_packets = self.descriptor_packets.saturating_add(1);
            self.last_descriptors = Some(now);
        }
        let header = PacketHeader {
            export_time: now.timestamp().clamp(0, u32::MAX as i64) as u32,
            sequence: self.sequence,
            observation_domain: self.observation_domain,
        };
        self.sequence = self.sequence.wrapping_add(1);
        (header, with_descriptors)
    }

    /// Filter out recent repeats and pack the remaining reports.
    pub fn plan(&mut self, reports: Vec<PskReport>, now: DateTime<Utc>) -> Plan {
        self.sent.prune(now);

        let mut plan = Plan::default();
        let mut accepted = Vec::with_capacity(reports.len());
        for report in reports {
            if self.sent.is_duplicate(&report, now) {
                debug!("PSKReporter suppressing repeat of {}", report.callsign);
                plan.suppressed += 1;
                continue;
            }
            self.sent.record(&report, now);
            accepted.push(report.to_sender());
        }

        let mut rest = accepted.as_slice();
        while !rest.is_empty() {
            let (header, with_descriptors) = self.next_header(now);
            let (packet, consumed) = build_packet(header, with_descriptors, &self.receiver, rest);
            plan.packets.push(packet);
            plan.reports += consumed;
            rest = &rest[consumed..];
        }
        plan
    }
}

/// Sender runtime settings.
#[derive(Debug, Clone)]
pub struct PskReporterSettings {
    pub host: String,
    pub port: u16,
    pub queue_size: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub packet_gap: Duration,
    /// Assemble packets but do not send them.
    pub dry_run: bool,
}

impl PskReporterSettings {
    pub fn from_config(config: &PskReporterConfig, dry_run: bool) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            queue_size: MAX_QUEUE_SIZE,
            min_delay: Duration::from_secs(18),
            max_delay: Duration::from_secs(38),
            packet_gap: PACKET_GAP,
            dry_run,
        }
    }

    fn next_delay(&self) -> Duration {
        if self.max_delay <= self.min_delay {
            return self.min_delay;
        }
        rand::thread_rng().gen_range(self.min_delay..=self.max_delay)
    }
}

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicU64,
    sent_reports: AtomicU64,
    suppressed: AtomicU64,
    packets_sent: AtomicU64,
    send_errors: AtomicU64,
    queue_full: AtomicU64,
}

/// PSKReporter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PskReporterStats {
    pub queued: u64,
    pub sent_reports: u64,
    pub suppressed: u64,
    pub packets_sent: u64,
    pub send_errors: u64,
    pub queue_full: u64,
}

struct SenderTask {
    settings: PskReporterSettings,
    planner: PacketPlanner,
    socket: Option<UdpSocket>,
    counters: Arc<Counters>,
}

impl SenderTask {
    async fn run(mut self, mut rx: mpsc::Receiver<PskReport>, mut stop: watch::Receiver<bool>) {
        loop {
            let delay = self.settings.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
            self.drain(&mut rx).await;
        }

        self.drain(&mut rx).await;
        info!("PSKReporter sender stopped");
    }

    async fn drain(&mut self, rx: &mut mpsc::Receiver<PskReport>) {
        let mut reports = Vec::new();
        while let Ok(report) = rx.try_recv() {
            reports.push(report);
        }
        if reports.is_empty() {
            return;
        }

        let plan = self.planner.plan(reports, Utc::now());
        self.counters
            .suppressed
            .fetch_add(plan.suppressed as u64, Ordering::Relaxed);

        let total = plan.packets.len();
        for (i, packet) in plan.packets.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.packet_gap).await;
            }
            if self.send(packet).await {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.counters
            .sent_reports
            .fetch_add(plan.reports as u64, Ordering::Relaxed);

        debug!(
            "PSKReporter: {} reports in {} packets, {} suppressed",
            plan.reports, total, plan.suppressed
        );
    }

    async fn send(&self, packet: &[u8]) -> bool {
        let Some(socket) = self.socket.as_ref() else {
            debug!("[dry run] PSKReporter packet of {} bytes", packet.len());
            return true;
        };
        let target = (self.settings.host.as_str(), self.settings.port);
        match socket.send_to(packet, target).await {
            Ok(_) => true,
            Err(e) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                warn!("PSKReporter send failed: {}", e);
                false
            }
        }
    }
}

/// Handle to the PSKReporter sender task.
pub struct PskReporter {
    sender: Mutex<Option<mpsc::Sender<PskReport>>>,
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl PskReporter {
    /// Bind the UDP socket (unless dry run) and spawn the sender task.
    pub async fn start(settings: PskReporterSettings, receiver: ReceiverInfo) -> Result<Self> {
        let socket = if settings.dry_run {
            None
        } else {
            Some(
                UdpSocket::bind("0.0.0.0:0")
                    .await
                    .map_err(|e| Error::TransportTransient(format!("UDP bind: {}", e)))?,
            )
        };

        let observation_domain = rand::random::<u32>();
        info!(
            "PSKReporter sender started for {}:{} (session {:08x}){}",
            settings.host,
            settings.port,
            observation_domain,
            if settings.dry_run { " (dry run)" } else { "" }
        );

        let (tx, rx) = mpsc::channel(settings.queue_size.max(1));
        let (stop_tx, stop_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());
        let task = SenderTask {
            settings,
            planner: PacketPlanner::new(receiver, observation_domain),
            socket,
            counters: Arc::clone(&counters),
        };
        let handle = tokio::spawn(task.run(rx, stop_rx));

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            stop: stop_tx,
            task: Mutex::new(Some(handle)),
            counters,
        })
    }

    /// Queue a report without waiting.
    pub fn submit(&self, report: PskReport) -> Result<()> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| Error::TransportTransient("pskreporter sender poisoned".to_string()))?;
        let Some(tx) = guard.as_ref() else {
            return Err(Error::TransportTransient("pskreporter stopped".to_string()));
        };
        match tx.try_send(report) {
            Ok(()) => {
                self.counters.queued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.queue_full.fetch_add(1, Ordering::Relaxed);
                Err(Error::QueueFull("pskreporter"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::TransportTransient("pskreporter stopped".to_string()))
            }
        }
    }

    pub fn stats(&self) -> PskReporterStats {
        let c = &self.counters;
        PskReporterStats {
            queued: c.queued.load(Ordering::Relaxed),
            sent_reports: c.sent_reports.load(Ordering::Relaxed),
            suppressed: c.suppressed.load(Ordering::Relaxed),
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting reports, send what is queued and wait up to `limit`.
    pub async fn shutdown(&self, limit: Duration) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let _ = self.stop.send(true);

        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task
            && tokio::time::timeout(limit, task).await.is_err()
        {
            warn!("PSKReporter final drain timed out after {:?}", limit);
        }
    }
}

impl BatchSink for PskReporter {
    fn name(&self) -> &'static str {
        "pskreporter"
    }

    fn deliver(&self, batch: &WindowBatch) {
        for spot in &batch.spots {
            if let Err(e) = self.submit(PskReport::from_spot(&spot.spot)) {
                debug!("PSKReporter rejected {}: {}", spot.spot.callsign, e);
            }
        }
    }
}

/// Receiver record contents from configuration.
pub fn receiver_info(receiver: &ReceiverConfig, antenna: &str) -> ReceiverInfo {
    ReceiverInfo {
        callsign: receiver.callsign.clone(),
        locator: receiver.locator.clone(),
        program: crate::PROGRAM_NAME.to_string(),
        antenna: antenna.to_string(),
    }
}
