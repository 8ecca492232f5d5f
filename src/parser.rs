//! Parser for WSPR spot messages published over MQTT.
//!
//! Each receiver instance publishes one JSON document per decode on
//! `{topic_prefix}/wspr/spot`:
//!
//! ```text
//! { "callsign": "G0XYZ", "grid": "IO91", "snr": -14, "frequency": 14097050,
//!   "dbm": 23, "drift": 0, "dt": 0.2,
//!   "epoch_time": "2024-06-01T12:00:00Z", "mode": "WSPR", "country": "England" }
//! ```
//!
//! Everything except `epoch_time` is optional and defaults to empty or zero.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::band::band_for_frequency;
use crate::error::{Error, Result};
use crate::grid::parse_grid;
use crate::spot::WsprSpot;

/// Mode assumed when the payload does not name one.
pub const DEFAULT_MODE: &str = "WSPR";

/// Wire shape of an inbound spot message.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SpotPayload {
    callsign: String,
    grid: String,
    snr: i32,
    frequency: u64,
    dbm: i32,
    drift: i32,
    dt: f32,
    epoch_time: Option<DateTime<Utc>>,
    mode: String,
    country: Option<String>,
}

/// Parse an MQTT payload into a [`WsprSpot`] tagged with `instance_name`.
///
/// Callsigns are upper-cased and grids canonicalised. A non-empty grid that
/// is not a valid Maidenhead locator rejects the whole spot.
///
/// # Example
///
/// ```
/// use wspr_aggregator::parser::parse_spot_payload;
///
/// let payload = br#"{"callsign":"k1abc","grid":"FN42","snr":-8,
///     "frequency":7040100,"epoch_time":"2024-06-01T12:02:00Z"}"#;
/// let spot = parse_spot_payload(payload, "kiwi-a").unwrap();
/// assert_eq!(spot.callsign, "K1ABC");
/// assert_eq!(spot.band, "40m");
/// assert_eq!(spot.mode, "WSPR");
/// ```
pub fn parse_spot_payload(payload: &[u8], instance_name: &str) -> Result<WsprSpot> {
    let raw: SpotPayload =
        serde_json::from_slice(payload).map_err(|e| Error::PayloadMalformed(e.to_string()))?;

    let epoch_time = raw
        .epoch_time
        .ok_or_else(|| Error::PayloadMalformed("missing epoch_time".to_string()))?;

    let grid = raw.grid.trim();
    let grid = if grid.is_empty() {
        String::new()
    } else {
        parse_grid(grid)
            .map(|l| l.to_canonical())
            .ok_or_else(|| Error::PayloadMalformed(format!("invalid grid: {}", grid)))?
    };

    let mode = match raw.mode.trim() {
        "" => DEFAULT_MODE.to_string(),
        m => m.to_ascii_uppercase(),
    };

    Ok(WsprSpot {
        callsign: raw.callsign.trim().to_ascii_uppercase(),
        grid,
        snr: raw.snr,
        frequency: raw.frequency,
        dbm: raw.dbm,
        drift: raw.drift,
        dt: raw.dt,
        epoch_time,
        mode,
        band: band_for_frequency(raw.frequency).to_string(),
        country: raw.country.unwrap_or_default().trim().to_string(),
        instance_name: instance_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spot::HASHED_CALLSIGN;
    use chrono::TimeZone;

    #[test]
    fn test_parse_full_payload() {
        let payload = br#"{
            "callsign": "G0XYZ", "grid": "IO91wm", "snr": -14,
            "frequency": 14097050, "dbm": 23, "drift": -1, "dt": 0.4,
            "epoch_time": "2024-06-01T12:00:00Z", "mode": "WSPR",
            "country": "England"
        }"#;
        let spot = parse_spot_payload(payload, "kiwi-a").expect("Should parse");

        assert_eq!(spot.callsign, "G0XYZ");
        assert_eq!(spot.grid, "IO91wm");
        assert_eq!(spot.snr, -14);
        assert_eq!(spot.frequency, 14_097_050);
        assert_eq!(spot.dbm, 23);
        assert_eq!(spot.drift, -1);
        assert!((spot.dt - 0.4).abs() < 1e-6);
        assert_eq!(
            spot.epoch_time,
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
        );
        assert_eq!(spot.band, "20m");
        assert_eq!(spot.country, "England");
        assert_eq!(spot.instance_name, "kiwi-a");
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let payload = br#"{"epoch_time": "2024-06-01T12:02:00Z"}"#;
        let spot = parse_spot_payload(payload, "kiwi-b").expect("Should parse");

        assert_eq!(spot.callsign, "");
        assert_eq!(spot.grid, "");
        assert_eq!(spot.snr, 0);
        assert_eq!(spot.frequency, 0);
        assert_eq!(spot.mode, DEFAULT_MODE);
        assert_eq!(spot.band, "unknown");
        assert_eq!(spot.country, "");
    }

    #[test]
    fn test_missing_epoch_time_is_malformed() {
        let payload = br#"{"callsign": "G0XYZ", "frequency": 14097050}"#;
        let err = parse_spot_payload(payload, "kiwi-a").unwrap_err();
        assert!(matches!(err, Error::PayloadMalformed(_)));
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_spot_payload(b"not json", "kiwi-a"),
            Err(Error::PayloadMalformed(_))
        ));
        assert!(matches!(
            parse_spot_payload(br#"{"epoch_time": "yesterday"}"#, "kiwi-a"),
            Err(Error::PayloadMalformed(_))
        ));
    }

    #[test]
    fn test_invalid_grid_rejected() {
        let payload = br#"{"callsign":"G0XYZ","grid":"ZZ99","epoch_time":"2024-06-01T12:00:00Z"}"#;
        assert!(matches!(
            parse_spot_payload(payload, "kiwi-a"),
            Err(Error::PayloadMalformed(_))
        ));
    }

    #[test]
    fn test_normalisation() {
        let payload = br#"{"callsign":" w1aw ","grid":"fn31PR","mode":"wspr",
            "epoch_time":"2024-06-01T12:00:00+00:00"}"#;
        let spot = parse_spot_payload(payload, "kiwi-a").expect("Should parse");
        assert_eq!(spot.callsign, "W1AW");
        assert_eq!(spot.grid, "FN31pr");
        assert_eq!(spot.mode, "WSPR");
    }

    #[test]
    fn test_hashed_callsign_is_parsed_not_filtered() {
        let payload = br#"{"callsign":"<...>","epoch_time":"2024-06-01T12:00:00Z"}"#;
        let spot = parse_spot_payload(payload, "kiwi-a").expect("Should parse");
        assert_eq!(spot.callsign, HASHED_CALLSIGN);
        assert!(!spot.is_reportable());
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let payload = br#"{"callsign":"K1ABC","epoch_time":"2024-06-01T12:00:00Z","extra":42}"#;
        assert!(parse_spot_payload(payload, "kiwi-a").is_ok());
    }
}
