mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{supervisor, wait_until, FixedDetector, Script};
use traffic_sentinel::error::{SourceError, SupervisorError};
use traffic_sentinel::SupervisorState;

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn feed_one_count_stabilizes_at_three() {
    let script = Script::new();
    let sup = supervisor(4, script.clone(), FixedDetector::new());
    let store = sup.count_store();

    sup.start().unwrap();
    // 同一周期内各路依次发布,等整个周期完成
    assert!(wait_until(WAIT, || sup.stats().cycles >= 1));

    let c = store.get(1).unwrap();
    assert_eq!(c.count, 3);
    assert_eq!(c.by_label.get("car"), Some(&2));
    assert_eq!(c.by_label.get("truck"), Some(&1));
    assert!(c.by_label.get("person").is_none());
    assert_eq!(store.get(3).unwrap().count, 1);

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn second_start_is_a_conflict() {
    let script = Script::new();
    let sup = supervisor(4, script.clone(), FixedDetector::new());

    sup.start().unwrap();
    assert_eq!(sup.start(), Err(SupervisorError::AlreadyRunning));
    assert!(sup.start().unwrap_err().is_conflict());
    // 只打开过一组视频源
    assert_eq!(script.opened.load(Ordering::SeqCst), 4);

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn stop_is_idempotent_and_releases_once() {
    let script = Script::new();
    let sup = supervisor(4, script.clone(), FixedDetector::new());

    sup.start().unwrap();
    assert!(sup.is_running());
    sup.stop().unwrap();
    // 第二次: 仍在停止中则 Ok,已回到 Idle 则 NotRunning,两者都不是错误
    match sup.stop() {
        Ok(()) | Err(SupervisorError::NotRunning) => {}
        Err(e) => panic!("unexpected stop error: {}", e),
    }
    assert!(sup.wait_idle(WAIT));
    assert!(!sup.is_running());
    assert_eq!(sup.stop(), Err(SupervisorError::NotRunning));

    assert_eq!(script.opened.load(Ordering::SeqCst), 4);
    assert_eq!(script.closed.load(Ordering::SeqCst), 4);
}

#[test]
fn missing_source_fails_initialization() {
    let script = Script::new();
    script.fail_open.lock().unwrap().insert(3);
    let sup = supervisor(4, script.clone(), FixedDetector::new());

    let err = sup.start().unwrap_err();
    match &err {
        SupervisorError::InitializationFailed { failures } => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].feed_index, 3);
            assert!(matches!(failures[0].error, SourceError::Unavailable { .. }));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(!err.is_conflict());
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert!(!sup.is_running());
    // 已打开的视频源全部关闭
    assert_eq!(script.opened.load(Ordering::SeqCst), 3);
    assert_eq!(script.closed.load(Ordering::SeqCst), 3);
    assert!(sup.stats().last_error.is_some());

    // 修复后可以正常启动
    script.fail_open.lock().unwrap().clear();
    sup.start().unwrap();
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn degraded_feed_keeps_last_count_while_others_update() {
    let script = Script::new();
    let sup = supervisor(4, script.clone(), FixedDetector::new());
    let store = sup.count_store();

    sup.start().unwrap();
    assert!(wait_until(WAIT, || store.get(2).unwrap().cycle >= 1));

    script.fail_reads(2, true);
    // 等两个完整周期,确保之后的周期都看到故障
    let cycles = sup.stats().cycles;
    assert!(wait_until(WAIT, || sup.stats().cycles >= cycles + 2));

    let frozen = store.get(2).unwrap();
    let before: Vec<u64> = [1, 3, 4].iter().map(|&i| store.get(i).unwrap().cycle).collect();
    assert!(wait_until(WAIT, || {
        [1, 3, 4]
            .iter()
            .zip(&before)
            .all(|(&i, &b)| store.get(i).unwrap().cycle > b)
    }));

    assert_eq!(store.get(2).unwrap(), frozen);
    assert_eq!(frozen.count, 1);
    assert!(sup.stats().degraded_feeds.contains(&2));
    assert!(sup.is_running());

    // 恢复后继续更新
    script.fail_reads(2, false);
    assert!(wait_until(WAIT, || store.get(2).unwrap().cycle > frozen.cycle));

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn detection_failure_degrades_only_that_feed() {
    let script = Script::new();
    let detector = FixedDetector::new();
    let fail_feeds = detector.fail_feeds.clone();
    let sup = supervisor(3, script, detector);
    let store = sup.count_store();

    sup.start().unwrap();
    assert!(wait_until(WAIT, || store.get(3).unwrap().cycle >= 1));
    fail_feeds.lock().unwrap().insert(3);
    let cycles = sup.stats().cycles;
    assert!(wait_until(WAIT, || sup.stats().cycles >= cycles + 2));

    let frozen = store.get(3).unwrap();
    let feed1 = store.get(1).unwrap().cycle;
    assert!(wait_until(WAIT, || store.get(1).unwrap().cycle > feed1 + 1));
    assert_eq!(store.get(3).unwrap(), frozen);
    assert!(sup.stats().degraded_feeds.contains(&3));

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn fatal_acquisition_error_aborts_run_and_is_reported_once() {
    let script = Script::new();
    let sup = supervisor(2, script.clone(), FixedDetector::new());

    sup.start().unwrap();
    script.fatal_read.lock().unwrap().insert(2);
    assert!(sup.wait_idle(WAIT));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert_eq!(script.closed.load(Ordering::SeqCst), 2);

    script.fatal_read.lock().unwrap().clear();
    assert!(matches!(sup.start(), Err(SupervisorError::RunAborted(_))));
    assert!(sup.stats().last_error.is_some());
    // 只报告一次,随后可重新启动
    sup.start().unwrap();
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn counts_are_fresh_and_monotonic_for_readers() {
    let script = Script::new();
    let sup = supervisor(2, script, FixedDetector::new());
    let store = sup.count_store();
    sup.start().unwrap();

    let readers: Vec<_> = (0..3)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..500 {
                    let c = store.get(1).unwrap();
                    assert!(c.cycle >= last);
                    assert!(c.count == 0 || c.count == 3);
                    last = c.cycle;
                }
            })
        })
        .collect();
    for r in readers {
        r.join().unwrap();
    }

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn counts_persist_across_restart() {
    let script = Script::new();
    let sup = supervisor(1, script, FixedDetector::new());
    let store = sup.count_store();

    sup.start().unwrap();
    assert!(wait_until(WAIT, || store.get(1).unwrap().cycle >= 1));
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));

    let kept = store.get(1).unwrap();
    assert_eq!(kept.count, 3);

    sup.start().unwrap();
    assert!(wait_until(WAIT, || store.get(1).unwrap().cycle > kept.cycle));
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn throttled_loop_still_stops_promptly() {
    let script = Script::new();
    let sup = traffic_sentinel::StreamSupervisor::new(
        common::sources(1),
        common::scripted_factory(script),
        Box::new(FixedDetector::new()),
        traffic_sentinel::DetectionSettings::default(),
        Some(Duration::from_secs(30)),
    );
    sup.start().unwrap();
    assert!(wait_until(WAIT, || sup.stats().cycles >= 1));
    sup.stop().unwrap();
    assert!(sup.wait_idle(Duration::from_secs(2)));
}

#[test]
fn detector_panic_degrades_only_that_feed() {
    let script = Script::new();
    let detector = FixedDetector::new();
    detector.panic_feeds.lock().unwrap().insert(2);
    let sup = supervisor(3, script.clone(), detector);
    let store = sup.count_store();

    sup.start().unwrap();
    assert!(wait_until(WAIT, || sup.stats().cycles >= 2));
    assert!(sup.is_running());
    assert_eq!(store.get(1).unwrap().count, 3);
    assert_eq!(store.get(2).unwrap().cycle, 0);
    assert!(store.get(3).unwrap().cycle >= 2);
    assert!(sup.stats().degraded_feeds.contains(&2));

    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
    assert_eq!(script.closed.load(Ordering::SeqCst), 3);
    // 可以再次启动
    sup.start().unwrap();
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn loop_panic_releases_sources_and_returns_to_idle() {
    let script = Script::new();
    let sup = supervisor(2, script.clone(), FixedDetector::new());

    sup.start().unwrap();
    script.panic_read.lock().unwrap().insert(2);
    assert!(sup.wait_idle(WAIT));
    assert_eq!(sup.state(), SupervisorState::Idle);
    assert_eq!(script.closed.load(Ordering::SeqCst), 2);

    script.panic_read.lock().unwrap().clear();
    assert!(matches!(sup.start(), Err(SupervisorError::RunAborted(_))));
    sup.start().unwrap();
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}

#[test]
fn concurrent_start_conflicts_without_waiting_for_open() {
    let script = Script::new();
    *script.open_delay.lock().unwrap() = Duration::from_millis(300);
    let sup = Arc::new(supervisor(2, script.clone(), FixedDetector::new()));

    let first = {
        let sup = sup.clone();
        std::thread::spawn(move || sup.start())
    };
    // 第一个 start 正在打开视频源
    std::thread::sleep(Duration::from_millis(100));

    let t0 = Instant::now();
    assert_eq!(sup.start(), Err(SupervisorError::AlreadyRunning));
    assert!(t0.elapsed() < Duration::from_millis(200));

    first.join().unwrap().unwrap();
    assert_eq!(script.opened.load(Ordering::SeqCst), 2);
    sup.stop().unwrap();
    assert!(sup.wait_idle(WAIT));
}
