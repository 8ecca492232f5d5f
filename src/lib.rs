//! WSPR Aggregator - merge WSPR spots from several receivers into one report stream.
//!
//! This crate provides:
//! - An MQTT subscriber that parses spot messages from each receiver instance
//! - A 2-minute window aggregator that keeps the best report per callsign and band
//! - A WSPRNet submitter with retry and backoff
//! - A PSKReporter client speaking IPFIX over UDP
//! - Statistics tracking with a 24-hour horizon, persisted to JSON
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use wspr_aggregator::{aggregator::Aggregator, parser::parse_spot_payload, stats::StatsTracker};
//!
//! let stats = Arc::new(StatsTracker::new("FN42"));
//! let mut agg = Aggregator::new(Duration::from_secs(20), Arc::clone(&stats), Vec::new());
//!
//! let payload = br#"{"callsign":"G0XYZ","grid":"IO91","snr":-14,
//!     "frequency":14097050,"epoch_time":"2024-06-01T12:00:00Z"}"#;
//! agg.ingest(parse_spot_payload(payload, "kiwi-a").expect("Failed to parse spot"));
//! agg.flush_all();
//!
//! println!("{}", stats.summary());
//! ```

pub mod aggregator;
pub mod band;
pub mod config;
pub mod error;
pub mod grid;
pub mod ipfix;
pub mod metrics;
pub mod mqtt;
pub mod parser;
pub mod persistence;
pub mod pskreporter;
pub mod spot;
pub mod stats;
pub mod wsprnet;

/// Program name reported to WSPRNet and PSKReporter.
pub const PROGRAM_NAME: &str = "WSPR-MQTT-Agg-1.0";

pub use aggregator::{Aggregator, AggregatorHandle, BatchSink, SpotIngest, WindowBatch};
pub use band::band_for_frequency;
pub use config::Config;
pub use error::{Error, Result};
pub use grid::{grid_to_latlon, haversine, is_valid_grid};
pub use parser::parse_spot_payload;
pub use persistence::{PersistedState, Persister};
pub use pskreporter::PskReporter;
pub use spot::{DedupedSpot, WsprSpot};
pub use stats::{StatsSnapshot, StatsSummary, StatsTracker};
pub use wsprnet::{WsprNetStats, WsprNetSubmitter};
