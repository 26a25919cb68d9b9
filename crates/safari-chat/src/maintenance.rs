use crate::{ParticipantId, Result};
use crossbeam_channel::{select, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Emitted by the maintenance thread when a tick did something.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaintenanceEvent {
    /// Heartbeat or visibility grace ran out.
    PresenceExpired(ParticipantId),
    SubscriptionsRetried(usize),
}

/// Work done on every tick. Returning `false` stops the worker.
pub trait MaintenanceTask: Send + 'static {
    fn tick(&mut self, events: Option<&Sender<MaintenanceEvent>>) -> bool;
}

impl<F> MaintenanceTask for F
where
    F: FnMut(Option<&Sender<MaintenanceEvent>>) -> bool + Send + 'static,
{
    fn tick(&mut self, events: Option<&Sender<MaintenanceEvent>>) -> bool {
        self(events)
    }
}

/// Background thread running a [`MaintenanceTask`] on a fixed interval.
/// Dropping the worker stops it.
pub struct MaintenanceWorker {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceWorker {
    pub fn spawn<T: MaintenanceTask>(
        interval: Duration,
        mut task: T,
        events: Option<Sender<MaintenanceEvent>>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        let ticker = crossbeam_channel::tick(interval);

        let handle = thread::Builder::new()
            .name("safari-chat-maintenance".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis() as u64, "maintenance started");
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            if !task.tick(events.as_ref()) {
                                break;
                            }
                        }
                        recv(shutdown_rx) -> _ => break,
                    }
                }
                tracing::debug!("maintenance stopped");
            })?;

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stops the thread and waits for the current tick to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.try_send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
