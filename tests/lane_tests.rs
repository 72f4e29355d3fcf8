//! Lane placement across GPUs and queued requests

mod common;

use common::{serial, FakeOp};
use devmux::lane::LaneManager;
use devmux::{DeviceSpec, DeviceType, DevmuxError, ExecConfig, RetryConfig};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn test_queued_requests_are_served_in_order() {
    common::init_logging();
    let mgr = LaneManager::new([(DeviceSpec::gpu(0), 100)]);
    let full = mgr.try_acquire(100, 100).unwrap().unwrap();

    let (tx, rx) = mpsc::channel();
    for (i, memory) in [60u64, 30, 10].into_iter().enumerate() {
        let tx = tx.clone();
        mgr.request(memory, memory, move |holder| tx.send((i, holder)).unwrap())
            .unwrap();
    }
    assert_eq!(mgr.pending_requests(), 3);

    drop(full);
    let served: Vec<_> = rx.try_iter().collect();
    assert_eq!(served.iter().map(|(i, _)| *i).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(mgr.pending_requests(), 0);
    assert_eq!(mgr.unassigned_memory(&DeviceSpec::gpu(0)), Some(0));
}

#[test]
fn test_head_of_queue_blocks_smaller_requests() {
    let mgr = LaneManager::new([(DeviceSpec::gpu(0), 100)]);
    let big = mgr.try_acquire(80, 80).unwrap().unwrap();

    let (tx, rx) = mpsc::channel();
    let tx2 = tx.clone();
    mgr.request(50, 50, move |h| tx.send(h.memory_limit()).unwrap()).unwrap();
    mgr.request(10, 10, move |h| tx2.send(h.memory_limit()).unwrap()).unwrap();

    // 20 bytes are free, enough for the second request but not the first
    assert!(rx.try_recv().is_err());
    assert_eq!(mgr.pending_requests(), 2);

    drop(big);
    let mut limits: Vec<_> = rx.try_iter().collect();
    limits.sort();
    assert_eq!(limits, vec![10, 50]);
}

#[test]
#[serial]
fn test_holders_dropped_on_other_threads() {
    let mgr = LaneManager::new([(DeviceSpec::gpu(0), 64), (DeviceSpec::gpu(1), 64)]);
    let (tx, rx) = mpsc::channel();

    for _ in 0..8 {
        let tx = tx.clone();
        mgr.request(64, 8, move |holder| {
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                tx.send(holder.gpu()).unwrap();
            });
        })
        .unwrap();
    }
    drop(tx);

    let gpus: Vec<_> = rx.iter().take(8).collect();
    assert_eq!(gpus.len(), 8);
    assert!(gpus.contains(&DeviceSpec::gpu(0)));

    // Every holder has been dropped by now
    thread::sleep(Duration::from_millis(10));
    assert!(mgr.lanes().is_empty());
    assert_eq!(mgr.unassigned_memory(&DeviceSpec::gpu(1)), Some(64));
}

#[test]
fn test_lane_caps_job_dispatcher() {
    let mgr = LaneManager::new([(DeviceSpec::gpu(0), 1000)]);
    let lane = mgr.try_acquire(300, 100).unwrap().unwrap();
    assert_eq!(lane.gpu(), DeviceSpec::gpu(0));

    let config = ExecConfig::new()
        .with_lane(&lane)
        .with_device_memory(DeviceSpec::cpu(0), 0)
        .with_retry(RetryConfig::no_retry());
    assert_eq!(config.device_memory["GPU:0"], 200);
    let d = common::dispatcher_with(config, 1);

    let mut too_big = d.create_task(Arc::new(FakeOp::new(50, 1, 250).on(&[DeviceType::Gpu])));
    let err = d.dispatch(&mut too_big, 0).unwrap_err();
    assert!(matches!(err, DevmuxError::ResourceExhausted { .. }));

    let mut fits = d.create_task(Arc::new(FakeOp::new(50, 2, 200).on(&[DeviceType::Gpu])));
    assert_eq!(d.dispatch(&mut fits, 0).unwrap().device, DeviceSpec::gpu(0));
}
