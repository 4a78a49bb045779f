//! Worker supervision.
//!
//! Every long-running task (dispatch workers, the broker connection loop,
//! the ESB bridge sides) runs in a supervised slot. A periodic sweep checks
//! liveness and unconditionally respawns any slot whose task has finished,
//! whatever the reason. There is no backoff and no give-up threshold: a
//! worker that keeps dying keeps getting restarted, loudly.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

/// Builds a fresh task for a slot. Called once at startup and again on every
/// respawn, so the closure must capture everything a restart needs.
pub type WorkerFactory = Arc<dyn Fn() -> JoinHandle<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Running,
    Dead,
    Respawning,
}

struct WorkerSlot {
    name: String,
    factory: WorkerFactory,
    handle: Option<JoinHandle<()>>,
    state: SlotState,
    restart_count: u64,
}

/// Spawns the configured workers and keeps them alive.
pub struct WorkerSupervisor {
    slots: Vec<WorkerSlot>,
    poll_interval: Duration,
    shutdown: broadcast::Sender<()>,
}

impl WorkerSupervisor {
    pub fn new(poll_interval: Duration, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            slots: Vec::new(),
            poll_interval,
            shutdown,
        }
    }

    /// Register `count` slots sharing one factory. Slot names get a numeric
    /// suffix so logs identify the instance.
    pub fn add_workers(&mut self, name: &str, count: usize, factory: WorkerFactory) {
        for i in 0..count {
            let slot_name = if count == 1 {
                name.to_string()
            } else {
                format!("{name}-{i}")
            };
            self.slots.push(WorkerSlot {
                name: slot_name,
                factory: factory.clone(),
                handle: None,
                state: SlotState::Dead,
                restart_count: 0,
            });
        }
    }

    /// Spawn every registered slot.
    pub fn start(&mut self) {
        for slot in &mut self.slots {
            if slot.handle.is_none() {
                info!(worker = %slot.name, "starting worker");
                slot.handle = Some((slot.factory)());
                slot.state = SlotState::Running;
            }
        }
    }

    /// One liveness pass: respawn every slot whose task has finished.
    pub fn sweep(&mut self) {
        for slot in &mut self.slots {
            let finished = slot
                .handle
                .as_ref()
                .map(|h| h.is_finished())
                .unwrap_or(true);
            if !finished {
                continue;
            }

            slot.state = SlotState::Dead;
            error!(
                worker = %slot.name,
                restarts = slot.restart_count,
                "worker task is not alive, respawning"
            );

            if let Some(handle) = slot.handle.take() {
                handle.abort();
            }

            slot.state = SlotState::Respawning;
            slot.handle = Some((slot.factory)());
            slot.restart_count += 1;
            slot.state = SlotState::Running;
        }
    }

    /// Number of slots whose task is currently alive.
    pub fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .count()
    }

    pub fn restart_count(&self, name: &str) -> Option<u64> {
        self.slots
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.restart_count)
    }

    /// Run the supervision loop until shutdown. Consumes the supervisor; all
    /// slot bookkeeping happens on this task from here on.
    pub async fn monitor(mut self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut ticker = interval(self.poll_interval);

        self.start();
        info!(workers = self.slots.len(), "worker supervision started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep();
                    debug!(live = self.live_count(), total = self.slots.len(), "liveness sweep complete");
                }
                _ = shutdown.recv() => {
                    info!("shutdown signal received, stopping workers");
                    for slot in &mut self.slots {
                        if let Some(handle) = slot.handle.take() {
                            handle.abort();
                        }
                        slot.state = SlotState::Dead;
                    }
                    break;
                }
            }
        }
    }
}
