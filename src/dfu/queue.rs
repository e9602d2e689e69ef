use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use time::OffsetDateTime;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use super::firmware::{FirmwarePayload, FirmwareResolver, FleetDevice};
use super::task::{UpdateError, UpdateStage, UpdateSummary, UpdateTask};
use super::transfer::{TransferClient, TransferConfig};
use crate::ble::{RadioArbiter, Transport};
use crate::mesh::DeviceAddress;

const DEFAULT_MAX_CONCURRENT: usize = 3;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 256;
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Tunables for the update queue.
#[derive(Debug, Clone, Builder)]
pub struct QueueConfig {
    /// Cap on simultaneously active tasks.
    #[builder(default = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,
    /// Retry budget per task.
    #[builder(default = DEFAULT_MAX_RETRIES)]
    max_retries: u32,
    /// Base of the exponential retry backoff.
    #[builder(default = DEFAULT_RETRY_BASE_DELAY)]
    retry_base_delay: Duration,
    /// Settings handed to each transfer.
    #[builder(default)]
    transfer: TransferConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// One observable queue notification; fired on every stage transition and
/// on upload progress, not just on completion.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    pub device: DeviceAddress,
    pub stage: UpdateStage,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub summary: UpdateSummary,
}

#[derive(Debug)]
struct QueueInner {
    tasks: HashMap<DeviceAddress, UpdateTask>,
    firmware: HashMap<DeviceAddress, FirmwarePayload>,
    backlog: VecDeque<DeviceAddress>,
    running: usize,
    paused: bool,
    cancel: CancellationToken,
    generation: u64,
}

impl QueueInner {
    fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            firmware: HashMap::new(),
            backlog: VecDeque::new(),
            running: 0,
            paused: false,
            cancel: CancellationToken::new(),
            generation: 0,
        }
    }
}

struct Shared {
    transfers: TransferClient,
    config: QueueConfig,
    inner: Mutex<QueueInner>,
    events: broadcast::Sender<QueueEvent>,
}

/// Schedules firmware transfers across the fleet under a concurrency cap,
/// owning retry, backoff, pause/resume, and cancellation.
pub struct UpdateQueueManager {
    shared: Arc<Shared>,
}

impl UpdateQueueManager {
    /// Creates a queue over the shared transport and radio gate.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, radio: RadioArbiter, config: QueueConfig) -> Self {
        let transfers = TransferClient::new(transport, radio, config.transfer.clone());
        let (events, _receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                transfers,
                config,
                inner: Mutex::new(QueueInner::new()),
                events,
            }),
        }
    }

    /// Subscribes to queue notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Resolves firmware per device and enqueues everything that matched.
    ///
    /// Devices with no applicable firmware are skipped silently. Returns the
    /// number of tasks enqueued.
    #[instrument(skip(self, devices, resolver), level = "info", fields(device_count = devices.len()))]
    pub async fn start_updates(
        &self,
        devices: &[FleetDevice],
        resolver: &dyn FirmwareResolver,
    ) -> usize {
        let mut inner = self.shared.inner.lock().await;

        let stale = inner.cancel.is_cancelled()
            || inner.tasks.values().all(UpdateTask::is_terminal);
        if stale && !inner.tasks.is_empty() {
            inner.tasks.clear();
            inner.firmware.clear();
            inner.backlog.clear();
            inner.cancel = CancellationToken::new();
            inner.generation += 1;
            debug!(generation = inner.generation, "starting a fresh update run");
        }

        let mut enqueued = 0usize;
        for device in devices {
            let Some(firmware) = resolver.resolve(device) else {
                trace!(address = %device.address(), "no applicable firmware; skipping device");
                continue;
            };
            if let Some(existing) = inner.tasks.get(device.address())
                && !existing.is_terminal()
            {
                debug!(address = %device.address(), "device already queued; skipping duplicate");
                continue;
            }

            let task = UpdateTask::new(
                device.address().clone(),
                firmware.total_bytes(),
                self.shared.config.max_retries,
            );
            inner.firmware.insert(device.address().clone(), firmware);
            inner.tasks.insert(device.address().clone(), task);
            inner.backlog.push_back(device.address().clone());
            enqueued += 1;
        }

        info!(enqueued, "update run enqueued");
        admit_locked(&self.shared, &mut inner);
        enqueued
    }

    /// Stops admitting new tasks; in-flight tasks continue. Idempotent.
    pub async fn pause(&self) {
        let mut inner = self.shared.inner.lock().await;
        if !inner.paused {
            info!("update queue paused");
        }
        inner.paused = true;
    }

    /// Resumes admission. Idempotent.
    pub async fn resume(&self) {
        let mut inner = self.shared.inner.lock().await;
        if inner.paused {
            info!("update queue resumed");
        }
        inner.paused = false;
        admit_locked(&self.shared, &mut inner);
    }

    /// Fails every active task immediately and aborts in-flight transfers.
    ///
    /// No further admissions happen until a fresh
    /// [`UpdateQueueManager::start_updates`] call.
    pub async fn cancel_all(&self) {
        let events = {
            let mut inner = self.shared.inner.lock().await;
            inner.cancel.cancel();
            inner.backlog.clear();

            let now = OffsetDateTime::now_utc();
            let mut cancelled = Vec::new();
            let devices: Vec<DeviceAddress> = inner.tasks.keys().cloned().collect();
            for device in devices {
                let Some(task) = inner.tasks.get_mut(&device) else {
                    continue;
                };
                if task.terminal {
                    continue;
                }
                task.stage = UpdateStage::Failed;
                task.terminal = true;
                task.completed_at = Some(now);
                task.error_message = Some(UpdateError::Cancelled.to_string());
                cancelled.push(device);
            }

            let summary = UpdateSummary::from_tasks(inner.tasks.values());
            cancelled
                .into_iter()
                .filter_map(|device| {
                    inner
                        .tasks
                        .get(&device)
                        .map(|task| event_from(task, summary))
                })
                .collect::<Vec<_>>()
        };

        warn!(cancelled = events.len(), "cancelled all active updates");
        for event in events {
            let _ = self.shared.events.send(event);
        }
    }

    /// Returns the derived aggregate over the current task set.
    pub async fn summary(&self) -> UpdateSummary {
        let inner = self.shared.inner.lock().await;
        UpdateSummary::from_tasks(inner.tasks.values())
    }

    /// Returns whether any task has not reached a terminal stage.
    pub async fn has_active_updates(&self) -> bool {
        let inner = self.shared.inner.lock().await;
        inner.tasks.values().any(|task| !task.is_terminal())
    }

    /// Returns a snapshot of every task in the current run.
    pub async fn tasks(&self) -> Vec<UpdateTask> {
        let inner = self.shared.inner.lock().await;
        inner.tasks.values().cloned().collect()
    }
}

fn event_from(task: &UpdateTask, summary: UpdateSummary) -> QueueEvent {
    QueueEvent {
        device: task.device.clone(),
        stage: task.stage,
        bytes_transferred: task.bytes_transferred,
        total_bytes: task.total_bytes,
        retry_count: task.retry_count,
        error_message: task.error_message.clone(),
        summary,
    }
}

/// Admits backlog tasks while slots are free; holds the queue lock.
fn admit_locked(shared: &Arc<Shared>, inner: &mut QueueInner) {
    while !inner.paused
        && !inner.cancel.is_cancelled()
        && inner.running < shared.config.max_concurrent
    {
        let Some(device) = inner.backlog.pop_front() else {
            break;
        };
        let Some(task) = inner.tasks.get(&device) else {
            continue;
        };
        if task.terminal {
            continue;
        }

        inner.running += 1;
        let generation = inner.generation;
        let cancel = inner.cancel.clone();
        tokio::spawn(run_worker(shared.clone(), device, generation, cancel));
    }
}

/// Applies one mutation to a live task and broadcasts the resulting event.
///
/// Returns `None` when the task is gone, terminal, or from a previous run;
/// stale workers stop at the first `None`.
async fn apply_task<R>(
    shared: &Arc<Shared>,
    device: &DeviceAddress,
    generation: u64,
    mutate: impl FnOnce(&mut UpdateTask) -> R,
) -> Option<R> {
    let (result, event) = {
        let mut inner = shared.inner.lock().await;
        if inner.generation != generation {
            return None;
        }
        let task = inner.tasks.get_mut(device)?;
        if task.terminal {
            return None;
        }
        let result = mutate(task);
        let task_snapshot = task.clone();
        let summary = UpdateSummary::from_tasks(inner.tasks.values());
        (result, event_from(&task_snapshot, summary))
    };
    let _ = shared.events.send(event);
    Some(result)
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RetryDecision {
    Backoff(u32),
    GiveUp,
}

async fn run_worker(
    shared: Arc<Shared>,
    device: DeviceAddress,
    generation: u64,
    cancel: CancellationToken,
) {
    let firmware = {
        let inner = shared.inner.lock().await;
        inner.firmware.get(&device).cloned()
    };

    if let Some(firmware) = firmware {
        drive_task(&shared, &device, generation, &firmware, &cancel).await;
    }

    let mut inner = shared.inner.lock().await;
    inner.running = inner.running.saturating_sub(1);
    admit_locked(&shared, &mut inner);
}

async fn drive_task(
    shared: &Arc<Shared>,
    device: &DeviceAddress,
    generation: u64,
    firmware: &FirmwarePayload,
    cancel: &CancellationToken,
) {
    loop {
        // Every attempt restarts the transfer from zero.
        let started = apply_task(shared, device, generation, |task| {
            task.stage = UpdateStage::Connecting;
            task.bytes_transferred = 0;
        })
        .await;
        if started.is_none() {
            return;
        }

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(forward_progress(
            shared.clone(),
            device.clone(),
            generation,
            progress_rx,
        ));

        let result = shared
            .transfers
            .run(device, firmware, &progress_tx, cancel)
            .await;
        drop(progress_tx);
        let _ = forwarder.await;

        match result {
            Ok(()) => {
                apply_task(shared, device, generation, |task| {
                    task.stage = UpdateStage::Complete;
                    task.terminal = true;
                    task.bytes_transferred = task.total_bytes;
                    task.completed_at = Some(OffsetDateTime::now_utc());
                })
                .await;
                return;
            }
            Err(UpdateError::Cancelled) => {
                apply_task(shared, device, generation, |task| {
                    task.stage = UpdateStage::Failed;
                    task.terminal = true;
                    task.completed_at = Some(OffsetDateTime::now_utc());
                    task.error_message = Some(UpdateError::Cancelled.to_string());
                })
                .await;
                return;
            }
            Err(error) => {
                let decision = apply_task(shared, device, generation, |task| {
                    if task.retry_count < task.max_retries {
                        task.retry_count += 1;
                        task.stage = UpdateStage::Failed;
                        task.error_message = Some(format!(
                            "Retry {}/{}: {error}",
                            task.retry_count, task.max_retries
                        ));
                        RetryDecision::Backoff(task.retry_count)
                    } else {
                        task.stage = UpdateStage::Failed;
                        task.terminal = true;
                        task.completed_at = Some(OffsetDateTime::now_utc());
                        task.error_message = Some(format!(
                            "Retries exhausted ({}/{}): {error}",
                            task.max_retries, task.max_retries
                        ));
                        RetryDecision::GiveUp
                    }
                })
                .await;

                match decision {
                    Some(RetryDecision::Backoff(retry)) => {
                        let delay = shared.config.retry_base_delay * 2u32.saturating_pow(retry - 1);
                        debug!(%device, retry, delay_ms = delay.as_millis() as u64, "backing off before re-attempt");
                        tokio::select! {
                            () = cancel.cancelled() => {
                                apply_task(shared, device, generation, |task| {
                                    task.stage = UpdateStage::Failed;
                                    task.terminal = true;
                                    task.completed_at = Some(OffsetDateTime::now_utc());
                                    task.error_message =
                                        Some(UpdateError::Cancelled.to_string());
                                })
                                .await;
                                return;
                            }
                            () = sleep(delay) => {}
                        }
                    }
                    Some(RetryDecision::GiveUp) | None => return,
                }
            }
        }
    }
}

/// Mirrors transfer progress into the task record; terminal stages are left
/// to the worker so completion bookkeeping stays in one place.
async fn forward_progress(
    shared: Arc<Shared>,
    device: DeviceAddress,
    generation: u64,
    mut receiver: mpsc::Receiver<super::transfer::TransferProgress>,
) {
    while let Some(progress) = receiver.recv().await {
        let stage = progress.stage();
        if matches!(
            stage,
            UpdateStage::Idle | UpdateStage::Complete | UpdateStage::Failed
        ) {
            continue;
        }
        apply_task(&shared, &device, generation, |task| {
            task.stage = stage;
            task.bytes_transferred = progress.bytes_transferred();
        })
        .await;
    }
}
