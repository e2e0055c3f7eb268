//! Network Quality
//!
//! Shared types and utilities for network quality monitoring of remote-control
//! sessions. This crate provides:
//! - `NetworkSample` - one RTT / packet loss / jitter measurement
//! - `ConnectionQuality` - the pure four-level classifier
//! - `NetworkQualityMonitor` - ring-buffered samples, rolling and p95 latency
//! - `BitrateController` - fast-down / slow-up adaptive bitrate recommendation
//! - `QualityEvent` - events surfaced to the session layer and UI
//!
//! The monitor is push-based: the transport layer feeds it samples at a steady
//! cadence and the media pipeline reads the bitrate recommendation back.
//!
//! # Usage
//!
//! ```rust
//! use remotedesk_network_quality::{ConnectionQuality, NetworkQualityMonitor, NetworkSample, QualityConfig};
//!
//! let mut monitor = NetworkQualityMonitor::new(QualityConfig::default()).unwrap();
//! monitor.push(NetworkSample::now(40.0, 0.5, 3.0));
//!
//! assert_eq!(monitor.current_quality(), Some(ConnectionQuality::Excellent));
//! assert_eq!(monitor.average_rtt_ms(), Some(40.0));
//! ```

mod bitrate;
mod error;
mod events;
mod monitor;
mod sample;

pub use bitrate::{BitrateController, BitratePolicy};
pub use error::{QualityError, Result};
pub use events::QualityEvent;
pub use monitor::{NetworkQualityMonitor, QualityConfig};
pub use sample::{ConnectionQuality, NetworkSample};
