//! Shared fixtures for the Minstrel end-to-end tests

use minstrel_core::control::Notification;
use minstrel_core::domain::config::{DomainConfig, SinkConfig, SourceConfig};
use minstrel_core::domain::{ConnectionFormat, MinstrelConfig};
use std::time::Duration;
use tokio::sync::broadcast;

/// Upper bound for any single wait in the scenarios
pub const SETTLE: Duration = Duration::from_secs(5);

/// Factory topology with millisecond timings
pub fn fast_config() -> MinstrelConfig {
    let mut config = MinstrelConfig::factory_default();
    config.app.worker_threads = 4;
    config.app.job_latency_ms = 5;
    config.app.ramp_tick_ms = 2;
    config.app.default_ramp_time_ms = 20;
    config.app.connection_delay_ms = Some(4);
    config
}

/// Factory topology whose jobs only finish when aborted
pub fn stalled_config(workers: usize) -> MinstrelConfig {
    let mut config = fast_config();
    config.app.worker_threads = workers;
    config.app.job_latency_ms = 60_000;
    config.app.ramp_tick_ms = 60_000;
    config
}

/// One domain holding both endpoints
///
/// Source 1 speaks PCM and compressed audio, sink 1 only compressed.
pub fn single_domain_config() -> MinstrelConfig {
    let mut config = fast_config();
    config.topology.domains = vec![DomainConfig {
        id: 1,
        name: "head-unit".to_string(),
        bus_name: "minstrel.head-unit".to_string(),
        node_name: "head-unit".to_string(),
        early: false,
        sources: vec![SourceConfig {
            id: 1,
            name: "media".to_string(),
            class_id: 1,
            volume: 0,
            formats: vec![ConnectionFormat::Pcm, ConnectionFormat::Compressed],
            sound_properties: Vec::new(),
        }],
        sinks: vec![SinkConfig {
            id: 1,
            name: "cabin".to_string(),
            class_id: 1,
            volume: 0,
            main_volume: 0,
            formats: vec![ConnectionFormat::Compressed],
            sound_properties: Vec::new(),
        }],
        gateways: Vec::new(),
    }];
    config
}

/// Receive notifications until `pick` returns a value
///
/// Panics after [`SETTLE`].
pub async fn wait_for<T>(
    notifications: &mut broadcast::Receiver<Notification>,
    mut pick: impl FnMut(&Notification) -> Option<T>,
) -> T {
    let wait = async {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    if let Some(value) = pick(&notification) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    panic!("observer lagged by {skipped} notifications")
                }
                Err(broadcast::error::RecvError::Closed) => panic!("notification channel closed"),
            }
        }
    };
    match tokio::time::timeout(SETTLE, wait).await {
        Ok(value) => value,
        Err(_) => panic!("no matching notification within {SETTLE:?}"),
    }
}
