//! Drives the streaming service from the caller's desired watch set.
//!
//! State machine: `Idle` and `Active(watch_set)`. A changed watch set always
//! stops the running subscription before the next one starts. Each
//! subscription gets its own event channel and dispatch task; stopping it
//! detaches the handler first, so anything still in flight from the old
//! session never reaches the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::streaming::StreamingService;
use crate::types::{AccountRef, EventReceiver, EventSender, SocketEvent, WatchSet};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

pub type EventHandler = Arc<dyn Fn(SocketEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Active(WatchSet),
}

/// Which transition a call produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOutcome {
    /// Same watch set as the active one; nothing touched.
    Unchanged,
    Started,
    /// Previous subscription stopped, new one started.
    Restarted,
    Stopped,
    /// Incomplete watch set while idle.
    Skipped,
    /// `clear` with nothing active.
    Idle,
}

type HandlerSlot = Arc<Mutex<Option<EventHandler>>>;

fn lock_slot(slot: &HandlerSlot) -> MutexGuard<'_, Option<EventHandler>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One registered handler plus the task draining its channel.
struct Listener {
    slot: HandlerSlot,
    task: JoinHandle<()>,
}

impl Listener {
    fn attach(capacity: usize, handler: EventHandler) -> (Self, EventSender) {
        let (tx, rx) = mpsc::channel(capacity);
        let slot: HandlerSlot = Arc::new(Mutex::new(Some(handler)));
        let task = tokio::spawn(Self::dispatch(rx, Arc::clone(&slot)));
        (Self { slot, task }, tx)
    }

    async fn dispatch(mut rx: EventReceiver, slot: HandlerSlot) {
        while let Some(event) = rx.recv().await {
            let delivered = {
                let guard = lock_slot(&slot);
                match guard.as_ref() {
                    Some(handler) => {
                        handler(event);
                        true
                    }
                    None => false,
                }
            };
            if !delivered {
                debug!("Dropping event for detached listener");
                break;
            }
        }
    }

    /// Once this returns the handler is never invoked again.
    fn detach(self) {
        lock_slot(&self.slot).take();
        self.task.abort();
    }
}

struct ActiveSubscription {
    watch_set: WatchSet,
    listener: Listener,
}

/// Must be used from within a tokio runtime; each start spawns a dispatch task.
pub struct SubscriptionController<S: StreamingService> {
    service: S,
    capacity: usize,
    active: Option<ActiveSubscription>,
}

impl<S: StreamingService> std::fmt::Debug for SubscriptionController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionController")
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .finish()
    }
}

impl<S: StreamingService> SubscriptionController<S> {
    pub fn new(service: S) -> Self {
        Self::with_capacity(service, DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(service: S, capacity: usize) -> Self {
        Self {
            service,
            capacity: capacity.max(1),
            active: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        match &self.active {
            Some(active) => ControllerState::Active(active.watch_set.clone()),
            None => ControllerState::Idle,
        }
    }

    pub fn active_watch_set(&self) -> Option<&WatchSet> {
        self.active.as_ref().map(|a| &a.watch_set)
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Bring the running subscription in line with `watch_set`.
    ///
    /// Errors from the streaming service are returned as-is. After a failed
    /// start or stop the controller is idle, so repeating the call retries.
    /// An unchanged watch set whose session died is restarted.
    pub fn set_desired<H>(&mut self, watch_set: WatchSet, on_event: H) -> Result<SubscriptionOutcome>
    where
        H: Fn(SocketEvent) + Send + Sync + 'static,
    {
        if watch_set.is_incomplete() {
            if self.active.is_some() {
                debug!(url = %watch_set.url, "Watch set incomplete; stopping active subscription");
                self.stop_active()?;
                return Ok(SubscriptionOutcome::Stopped);
            }
            debug!(url = %watch_set.url, "Watch set incomplete; nothing to start");
            return Ok(SubscriptionOutcome::Skipped);
        }

        if self.active_watch_set() == Some(&watch_set) {
            if self.service.is_running() {
                return Ok(SubscriptionOutcome::Unchanged);
            }
            warn!(url = %watch_set.url, "Streaming session ended on its own; restarting");
        }

        let restarting = self.active.is_some();
        if restarting {
            self.stop_active()?;
        }
        self.start(watch_set, Arc::new(on_event))?;

        Ok(if restarting {
            SubscriptionOutcome::Restarted
        } else {
            SubscriptionOutcome::Started
        })
    }

    /// Stop whatever is running. Safe to call repeatedly.
    pub fn clear(&mut self) -> Result<SubscriptionOutcome> {
        if self.active.is_none() {
            return Ok(SubscriptionOutcome::Idle);
        }
        self.stop_active()?;
        Ok(SubscriptionOutcome::Stopped)
    }

    fn start(&mut self, watch_set: WatchSet, handler: EventHandler) -> Result<()> {
        let (listener, sink) = Listener::attach(self.capacity, handler);
        let accounts: Vec<AccountRef> = watch_set.accounts.iter().cloned().collect();

        if let Err(e) = self.service.start(&watch_set.url, &accounts, sink) {
            listener.detach();
            return Err(e);
        }

        info!(url = %watch_set.url, accounts = accounts.len(), "Subscription started");
        self.active = Some(ActiveSubscription { watch_set, listener });
        Ok(())
    }

    fn stop_active(&mut self) -> Result<()> {
        if let Some(active) = self.active.take() {
            active.listener.detach();
            self.service.stop()?;
            info!(url = %active.watch_set.url, "Subscription stopped");
        }
        Ok(())
    }
}

impl<S: StreamingService> Drop for SubscriptionController<S> {
    fn drop(&mut self) {
        if let Err(e) = self.clear() {
            warn!(error = %e, "Stopping subscription on teardown failed");
        }
    }
}
