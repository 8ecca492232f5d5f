//! Data structures representing WSPR spots.
//!
//! A [`WsprSpot`] is one decode reported by one receiver instance. After the
//! aggregator has picked a winner for a `(cycle, band, callsign)` group, the
//! survivor travels downstream as a [`DedupedSpot`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Callsign WSPR decoders print when only the callsign hash is known.
pub const HASHED_CALLSIGN: &str = "<...>";

/// Length of a WSPR transmission cycle in seconds.
pub const CYCLE_SECS: i64 = 120;

/// A single WSPR decode as reported by one receiver instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsprSpot {
    /// Transmitting station's callsign.
    pub callsign: String,

    /// Transmitter's Maidenhead locator (4 or 6 characters, may be empty).
    pub grid: String,

    /// Signal-to-noise ratio in dB.
    pub snr: i32,

    /// Dial plus audio frequency in Hz.
    pub frequency: u64,

    /// Reported transmit power in dBm.
    pub dbm: i32,

    /// Frequency drift in Hz/minute.
    pub drift: i32,

    /// Time offset in seconds.
    pub dt: f32,

    /// Start of the decode cycle.
    pub epoch_time: DateTime<Utc>,

    /// Mode name, normally `"WSPR"`.
    pub mode: String,

    /// Band label derived from `frequency`.
    pub band: String,

    /// DXCC country name, empty if unknown.
    pub country: String,

    /// Receiver instance that reported this spot.
    pub instance_name: String,
}

impl WsprSpot {
    /// Start of the 2-minute cycle this spot belongs to, in Unix seconds.
    pub fn cycle_key(&self) -> i64 {
        cycle_start(self.epoch_time.timestamp())
    }

    /// Whether this spot may be forwarded to the spotting networks.
    pub fn is_reportable(&self) -> bool {
        !self.callsign.is_empty() && self.callsign != HASHED_CALLSIGN
    }

    /// Frequency in MHz.
    pub fn frequency_mhz(&self) -> f64 {
        self.frequency as f64 / 1_000_000.0
    }
}

impl fmt::Display for WsprSpot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:>10.6} {} {} {:+} dB dt {:+.1} drift {:+} {} dBm via {}",
            self.epoch_time.format("%H%M"),
            self.frequency_mhz(),
            self.band,
            self.callsign,
            self.snr,
            self.dt,
            self.drift,
            self.dbm,
            self.instance_name
        )
    }
}

/// Align a Unix timestamp to the start of its 2-minute WSPR cycle.
///
/// Uses floor division so pre-epoch timestamps still land on a cycle start.
pub fn cycle_start(epoch_secs: i64) -> i64 {
    epoch_secs.div_euclid(CYCLE_SECS) * CYCLE_SECS
}

/// The surviving spot for a `(cycle, band, callsign)` group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupedSpot {
    /// The winning spot.
    pub spot: WsprSpot,

    /// Cycle start in Unix seconds.
    pub cycle: i64,

    /// Number of instances that reported this callsign in the cycle.
    pub reporters: usize,

    /// Whether the spot has been accepted by WSPRNet.
    pub submitted: bool,

    /// Last submission error, if any.
    pub error_msg: Option<String>,
}

impl DedupedSpot {
    /// Wrap a winning spot.
    pub fn new(spot: WsprSpot, reporters: usize) -> Self {
        let cycle = spot.cycle_key();
        Self {
            spot,
            cycle,
            reporters,
            submitted: false,
            error_msg: None,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::make_spot;
    use super::*;

    #[test]
    fn test_cycle_start_alignment() {
        assert_eq!(cycle_start(0), 0);
        assert_eq!(cycle_start(119), 0);
        assert_eq!(cycle_start(120), 120);
        assert_eq!(cycle_start(1_717_243_321), 1_717_243_320);
        assert_eq!(cycle_start(-1), -120);
    }

    #[test]
    fn test_cycle_key_from_epoch_time() {
        let spot = make_spot("kiwi-a", "G0XYZ", -10);
        // 2024-06-01T12:00:00Z
        assert_eq!(spot.cycle_key(), 1_717_243_200);
    }

    #[test]
    fn test_reportable() {
        assert!(make_spot("a", "G0XYZ", -10).is_reportable());
        assert!(!make_spot("a", "", -10).is_reportable());
        assert!(!make_spot("a", HASHED_CALLSIGN, -10).is_reportable());
    }

    #[test]
    fn test_deduped_spot_carries_cycle() {
        let spot = make_spot("a", "G0XYZ", -10);
        let deduped = DedupedSpot::new(spot.clone(), 2);
        assert_eq!(deduped.cycle, spot.cycle_key());
        assert!(!deduped.submitted);
        assert!(deduped.error_msg.is_none());
    }

    #[test]
    fn test_display() {
        let spot = make_spot("kiwi-a", "G0XYZ", -10);
        let s = spot.to_string();
        assert!(s.contains("G0XYZ"));
        assert!(s.contains("14.097050"));
        assert!(s.contains("kiwi-a"));
    }
}
