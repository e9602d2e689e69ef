use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::broadcast;
use tokio::time::{Instant, sleep};

use meshfleet::{
    DeviceAddress, DeviceScript, FakeTransport, FirmwarePayload, FleetDevice, HardwareIdResolver,
    QueueConfig, QueueEvent, RadioArbiter, UpdateQueueManager, UpdateStage,
};

const HARDWARE_ID: &str = "sensor-v2";

fn address(index: u8) -> DeviceAddress {
    format!("aa:bb:cc:dd:ee:{index:02x}")
        .parse()
        .expect("test address should parse")
}

fn fleet(count: u8) -> Vec<FleetDevice> {
    (0..count)
        .map(|index| FleetDevice::new(address(index), HARDWARE_ID))
        .collect()
}

fn resolver(payload_len: usize) -> HardwareIdResolver {
    HardwareIdResolver::new().with_firmware(FirmwarePayload::new(
        "2.0.0",
        HARDWARE_ID,
        vec![0x42; payload_len],
    ))
}

fn transport_for(count: u8, write_delay: Duration) -> Arc<FakeTransport> {
    Arc::new(FakeTransport::with_devices((0..count).map(|index| {
        DeviceScript::builder()
            .address(address(index))
            .write_delay(write_delay)
            .build()
    })))
}

fn queue_over(transport: Arc<FakeTransport>, max_concurrent: usize) -> UpdateQueueManager {
    UpdateQueueManager::new(
        transport,
        RadioArbiter::new(),
        QueueConfig::builder().max_concurrent(max_concurrent).build(),
    )
}

/// Collects events until every task in the run has settled.
async fn drain_until_settled(events: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut collected = Vec::new();
    loop {
        let event = events.recv().await.expect("queue events should keep flowing");
        collected.push(event.clone());
        let summary = event.summary;
        if summary.total > 0 && summary.completed + summary.failed == summary.total {
            break;
        }
    }
    collected
}

#[tokio::test]
async fn devices_without_matching_firmware_are_not_enqueued() {
    let transport = transport_for(3, Duration::ZERO);
    let queue = queue_over(transport, 3);

    let other_resolver =
        HardwareIdResolver::new().with_firmware(FirmwarePayload::new("1.0", "other-hw", vec![1]));
    let enqueued = queue.start_updates(&fleet(3), &other_resolver).await;

    assert_eq!(0, enqueued);
    assert_eq!(0, queue.summary().await.total);
    assert_eq!(false, queue.has_active_updates().await);
}

#[tokio::test]
async fn single_device_walks_to_complete_with_one_reset() {
    let transport = transport_for(1, Duration::ZERO);
    let queue = queue_over(transport.clone(), 3);
    let mut events = queue.events();

    let enqueued = queue.start_updates(&fleet(1), &resolver(1024)).await;
    assert_eq!(1, enqueued);

    let collected = drain_until_settled(&mut events).await;

    let stages: Vec<UpdateStage> = collected.iter().map(|event| event.stage).collect();
    assert_eq!(true, stages.contains(&UpdateStage::Connecting));
    assert_eq!(true, stages.contains(&UpdateStage::Uploading));
    assert_eq!(true, stages.contains(&UpdateStage::Verifying));
    assert_eq!(Some(&UpdateStage::Complete), stages.last());

    let summary = queue.summary().await;
    assert_eq!(1, summary.completed);
    assert_eq!(1.0, summary.overall_progress());
    // Intermediate stages fire observable notifications, not just completion.
    assert_eq!(true, collected.len() > summary.completed);
    assert_eq!(1, transport.reset_count(&address(0)));

    let tasks = queue.tasks().await;
    assert_eq!(1, tasks.len());
    assert_eq!(UpdateStage::Complete, tasks[0].stage());
    assert_eq!(true, tasks[0].completed_at().is_some());
}

#[tokio::test(start_paused = true)]
async fn concurrency_cap_holds_at_every_instant() {
    let transport = transport_for(10, Duration::from_millis(200));
    let queue = queue_over(transport, 3);
    let mut events = queue.events();

    let enqueued = queue.start_updates(&fleet(10), &resolver(1024)).await;
    assert_eq!(10, enqueued);

    sleep(Duration::from_millis(50)).await;
    let early = queue.summary().await;
    assert_eq!(3, early.in_progress);
    assert_eq!(0, early.completed);

    let collected = drain_until_settled(&mut events).await;
    for event in &collected {
        assert_eq!(
            true,
            event.summary.in_progress <= 3,
            "cap exceeded: {:?}",
            event.summary
        );
    }

    let summary = queue.summary().await;
    assert_eq!(10, summary.completed);
    assert_eq!(0, summary.failed);
    assert_eq!(1.0, summary.overall_progress());
}

#[tokio::test(start_paused = true)]
async fn failing_transport_retries_with_backoff_then_exhausts() {
    let transport = Arc::new(FakeTransport::with_devices([DeviceScript::builder()
        .address(address(0))
        .refuse_connects(DeviceScript::always())
        .build()]));
    let queue = queue_over(transport, 1);
    let mut events = queue.events();

    queue.start_updates(&fleet(1), &resolver(256)).await;

    let mut failed_retry_counts = Vec::new();
    let mut first_failure_at = None;
    let mut reattempt_after_failure = None;
    let mut terminal_message = None;
    loop {
        let event = events.recv().await.expect("queue events should keep flowing");
        match event.stage {
            UpdateStage::Failed => {
                failed_retry_counts.push(event.retry_count);
                if first_failure_at.is_none() {
                    first_failure_at = Some(Instant::now());
                    assert_eq!(
                        true,
                        event
                            .error_message
                            .as_deref()
                            .is_some_and(|message| message.contains("Retry 1/3")),
                        "unexpected failure message: {:?}",
                        event.error_message
                    );
                }
                if event.summary.failed == 1 {
                    terminal_message = event.error_message.clone();
                    break;
                }
            }
            UpdateStage::Connecting => {
                if let Some(failed_at) = first_failure_at
                    && reattempt_after_failure.is_none()
                {
                    reattempt_after_failure = Some(Instant::now() - failed_at);
                }
            }
            _other => {}
        }
    }

    // Strictly increasing retry counter, capped at the budget.
    assert_eq!(vec![1, 2, 3, 3], failed_retry_counts);
    // The re-attempt waited out the first 2s backoff window.
    let waited = reattempt_after_failure.expect("a re-attempt should have been observed");
    assert_eq!(true, waited >= Duration::from_secs(2), "waited only {waited:?}");
    assert_eq!(
        true,
        terminal_message
            .as_deref()
            .is_some_and(|message| message.contains("Retries exhausted")),
        "unexpected terminal message: {terminal_message:?}"
    );

    let tasks = queue.tasks().await;
    assert_eq!(UpdateStage::Failed, tasks[0].stage());
    assert_eq!(3, tasks[0].retry_count());
    assert_eq!(true, tasks[0].is_terminal());
}

#[tokio::test(start_paused = true)]
async fn pause_then_immediate_resume_matches_an_unpaused_run() {
    let baseline_transport = transport_for(4, Duration::from_millis(50));
    let baseline = queue_over(baseline_transport, 2);
    let mut baseline_events = baseline.events();
    baseline.start_updates(&fleet(4), &resolver(512)).await;
    drain_until_settled(&mut baseline_events).await;
    let baseline_summary = baseline.summary().await;

    let paused_transport = transport_for(4, Duration::from_millis(50));
    let paused = queue_over(paused_transport, 2);
    let mut paused_events = paused.events();
    paused.pause().await;
    paused.start_updates(&fleet(4), &resolver(512)).await;
    paused.resume().await;
    drain_until_settled(&mut paused_events).await;

    assert_eq!(baseline_summary, paused.summary().await);
}

#[tokio::test(start_paused = true)]
async fn pause_holds_admission_until_resume() {
    let transport = transport_for(2, Duration::from_millis(50));
    let queue = queue_over(transport, 1);
    let mut events = queue.events();

    queue.pause().await;
    let enqueued = queue.start_updates(&fleet(2), &resolver(256)).await;
    assert_eq!(2, enqueued);

    sleep(Duration::from_millis(100)).await;
    let held = queue.summary().await;
    assert_eq!(0, held.in_progress);
    assert_eq!(0, held.completed);

    // Idempotent from any state.
    queue.pause().await;
    queue.resume().await;
    queue.resume().await;

    drain_until_settled(&mut events).await;
    assert_eq!(2, queue.summary().await.completed);
}

#[tokio::test(start_paused = true)]
async fn cancel_all_fails_every_active_task_and_frees_the_queue() {
    let transport = transport_for(5, Duration::from_millis(200));
    let queue = queue_over(transport, 2);

    queue.start_updates(&fleet(5), &resolver(1024)).await;
    sleep(Duration::from_millis(50)).await;

    queue.cancel_all().await;

    assert_eq!(false, queue.has_active_updates().await);
    let summary = queue.summary().await;
    assert_eq!(5, summary.failed);
    assert_eq!(0, summary.completed);
    for task in queue.tasks().await {
        assert_eq!(UpdateStage::Failed, task.stage());
        assert_eq!(true, task.is_terminal());
        assert_eq!(
            true,
            task.error_message()
                .is_some_and(|message| message.contains("cancelled"))
        );
    }

    // A fresh run is admitted normally; no zombie connection blocks it.
    let mut events = queue.events();
    let enqueued = queue.start_updates(&fleet(5), &resolver(1024)).await;
    assert_eq!(5, enqueued);
    drain_until_settled(&mut events).await;
    assert_eq!(5, queue.summary().await.completed);
}
