//! WSPR band classification.
//!
//! WSPR transmissions live in narrow 200 Hz sub-bands, so the lookup table is
//! much tighter than the amateur band edges. Ranges are half-open `[lo, hi)`.

/// Label returned for frequencies outside every WSPR sub-band.
pub const UNKNOWN_BAND: &str = "unknown";

/// WSPR sub-band table in Hz, `(lo, hi, label)` with `hi` exclusive.
const WSPR_BANDS: &[(u64, u64, &str)] = &[
    (135_700, 137_800, "2200m"),
    (472_000, 479_000, "630m"),
    (1_836_600, 1_838_000, "160m"),
    (3_568_000, 3_570_000, "80m"),
    (5_287_000, 5_290_000, "60m"),
    (7_038_000, 7_042_000, "40m"),
    (10_138_000, 10_142_000, "30m"),
    (14_095_000, 14_098_000, "20m"),
    (18_104_000, 18_108_000, "17m"),
    (21_094_000, 21_098_000, "15m"),
    (24_924_000, 24_928_000, "12m"),
    (28_124_000, 28_128_000, "10m"),
];

/// Map a frequency in Hz to its WSPR band label, or `"unknown"`.
pub fn band_for_frequency(frequency_hz: u64) -> &'static str {
    WSPR_BANDS
        .iter()
        .find(|(lo, hi, _)| (*lo..*hi).contains(&frequency_hz))
        .map(|(_, _, label)| *label)
        .unwrap_or(UNKNOWN_BAND)
}

/// All known band labels, lowest frequency first.
pub fn band_labels() -> impl Iterator<Item = &'static str> {
    WSPR_BANDS.iter().map(|(_, _, label)| *label)
}

/// Coarse frequency partition used for PSKReporter duplicate suppression.
///
/// Above 1 MHz the partition is the whole megahertz; at or below it is the
/// 100 kHz step. The boolean keeps the two regimes from colliding.
///
/// This is coarser than the band label: 14.0956 MHz and 14.9 MHz share a
/// partition even though only the former is inside the 20m WSPR sub-band.
pub fn band_partition(frequency_hz: u64) -> (bool, u64) {
    if frequency_hz > 1_000_000 {
        (true, frequency_hz / 1_000_000)
    } else {
        (false, frequency_hz / 100_000)
    }
}

/// Whether two frequencies fall in the same suppression partition.
pub fn is_same_band(f1: u64, f2: u64) -> bool {
    band_partition(f1) == band_partition(f2)
}
