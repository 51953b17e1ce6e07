//! Integration tests for heartbeat and status-query cadence.

mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tuya_vacuum::{
    CommandDispatcher, CommandType, DeviceStateStore, DpMapping, PollingScheduler, Timing,
    Version,
};

async fn start(timing: Timing) -> (MockDevice, CommandDispatcher, PollingScheduler) {
    let device = MockDevice::start(Version::V3_3, answering(json!({ "38": 0, "39": 64 }))).await;
    let store = Arc::new(DeviceStateStore::new(DpMapping::prosenic().state));
    let dispatcher = CommandDispatcher::spawn(
        device.device_config(Version::V3_3),
        timing.clone(),
        store,
        CancellationToken::new(),
    )
    .unwrap();
    let scheduler = PollingScheduler::spawn(dispatcher.clone(), &timing, CancellationToken::new());
    (device, dispatcher, scheduler)
}

#[tokio::test]
async fn test_heartbeats_between_status_queries() {
    let timing = Timing {
        heartbeat_interval: Duration::from_millis(50),
        status_interval: Duration::from_secs(60),
        ..fast_timing()
    };
    let (device, dispatcher, scheduler) = start(timing).await;

    let heartbeats = device.wait_for_cmd(CommandType::HeartBeat, 3).await;
    assert!(heartbeats.len() >= 3);
    // Only the initial status query: the next one is a minute away.
    assert_eq!(device.received_cmd(CommandType::DpQuery).len(), 1);
    assert!(scheduler.is_available());
    assert_eq!(scheduler.consecutive_failures(), 0);

    scheduler.stop().await;
    dispatcher.close().await;
}

#[tokio::test]
async fn test_refresh_request_triggers_status_query() {
    let (device, dispatcher, scheduler) = start(fast_timing()).await;

    device.wait_for_cmd(CommandType::DpQuery, 1).await;
    scheduler.request_refresh();
    let queries = device.wait_for_cmd(CommandType::DpQuery, 2).await;
    assert_eq!(queries.len(), 2);

    scheduler.stop().await;
    dispatcher.close().await;
}

#[tokio::test]
async fn test_stop_halts_polling() {
    let timing = Timing {
        heartbeat_interval: Duration::from_millis(30),
        ..fast_timing()
    };
    let (device, dispatcher, scheduler) = start(timing).await;
    device.wait_for_cmd(CommandType::HeartBeat, 1).await;

    scheduler.stop().await;
    let seen = device.received().len();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(device.received().len(), seen);

    dispatcher.close().await;
}
