//! Monitor Flow Tests
//!
//! Feed realistic sample sequences through the monitor and check the
//! events and bitrate recommendations it produces.

use remotedesk_network_quality::{
    ConnectionQuality, NetworkQualityMonitor, NetworkSample, QualityConfig, QualityEvent,
};

/// Degrading link: quality steps down and bitrate drops on every sample
#[test]
fn test_degrading_link() {
    let mut monitor = NetworkQualityMonitor::new(QualityConfig {
        window_size: 1,
        ..Default::default()
    })
    .unwrap();

    let mut qualities = Vec::new();
    let mut last_bitrate = monitor.recommended_bitrate_kbps();

    for rtt in [30.0, 80.0, 160.0, 250.0] {
        for event in monitor.push(NetworkSample::now(rtt, 0.5, 5.0)) {
            if let QualityEvent::QualityChanged { to, .. } = event {
                qualities.push(to);
            }
        }
        if rtt > 100.0 {
            assert!(
                monitor.recommended_bitrate_kbps() < last_bitrate,
                "bitrate should drop at {}ms",
                rtt
            );
        }
        last_bitrate = monitor.recommended_bitrate_kbps();
    }

    assert_eq!(
        qualities,
        vec![
            ConnectionQuality::Excellent,
            ConnectionQuality::Good,
            ConnectionQuality::Fair,
            ConnectionQuality::Poor,
        ]
    );
}

/// Recovery is slower than degradation
#[test]
fn test_asymmetric_recovery() {
    let mut monitor = NetworkQualityMonitor::new(QualityConfig {
        window_size: 1,
        ..Default::default()
    })
    .unwrap();
    monitor.set_available_bandwidth(Some(10_000));

    // Two bad samples: 2000 -> 1600 -> 1280
    monitor.push(NetworkSample::now(300.0, 0.0, 0.0));
    monitor.push(NetworkSample::now(300.0, 0.0, 0.0));
    assert_eq!(monitor.recommended_bitrate_kbps(), 1280);

    // Two good samples do not restore the original bitrate
    monitor.push(NetworkSample::now(20.0, 0.0, 0.0));
    monitor.push(NetworkSample::now(20.0, 0.0, 0.0));
    assert!(monitor.recommended_bitrate_kbps() < 2000);
}

/// Configuration loads from TOML with partial overrides
#[test]
fn test_config_from_toml() {
    let config: QualityConfig = toml::from_str(
        r#"
window_size = 30

[bitrate]
min_bitrate_kbps = 500
max_bitrate_kbps = 4000
"#,
    )
    .unwrap();

    assert_eq!(config.window_size, 30);
    assert_eq!(config.bitrate.min_bitrate_kbps, 500);
    assert_eq!(config.bitrate.initial_bitrate_kbps, 2000);
    assert!(config.validate().is_ok());
}
