//! Event bus between the engine and its observers.
//!
//! The engine publishes everything observable (transitions, macro lifecycle,
//! output writes, mode and profile changes, device status) to a
//! `tokio::sync::broadcast` channel. Each subscriber has its own bounded
//! backlog: a slow subscriber loses its oldest events and is told how many,
//! and the publisher never blocks. The bus also keeps the live input state
//! and a short transition history for late joiners.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::buttons::{ButtonId, Mode};
use crate::comm::DeviceStatus;
use crate::decoder::{InputState, Transition};
use crate::output::OutputTarget;
use crate::scheduler::MacroEvent;

/// Everything observers can see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    Transition(Transition),
    Macro(MacroEvent),
    OutputChanged { target: OutputTarget },
    ModeChanged { mode: Mode },
    ProfileActivated { name: String, version: u32 },
    Device { status: DeviceStatus },
    /// `macro_id` is absent when nothing was captured.
    RecordingFinished {
        button: ButtonId,
        macro_id: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Transitions kept for [`EventBus::recent_transitions`].
    pub history: usize,
    /// Per-subscriber backlog before the oldest events are dropped.
    pub subscriber_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history: 64,
            subscriber_capacity: 256,
        }
    }
}

struct Inner {
    tx: broadcast::Sender<BusEvent>,
    snapshot: RwLock<InputState>,
    history: Mutex<VecDeque<Transition>>,
    history_len: usize,
}

/// Shared publisher handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let (tx, _) = broadcast::channel(config.subscriber_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                tx,
                snapshot: RwLock::new(InputState::default()),
                history: Mutex::new(VecDeque::with_capacity(config.history)),
                history_len: config.history,
            }),
        }
    }

    /// Send to all current subscribers. Never blocks; no subscribers is fine.
    pub fn publish(&self, event: BusEvent) {
        let _ = self.inner.tx.send(event);
    }

    /// Remember a transition and publish it.
    pub fn record_transition(&self, transition: &Transition) {
        if self.inner.history_len > 0 {
            let mut history = self.inner.history.lock();
            if history.len() == self.inner.history_len {
                history.pop_front();
            }
            history.push_back(transition.clone());
        }
        self.publish(BusEvent::Transition(transition.clone()));
    }

    pub fn set_snapshot(&self, state: InputState) {
        *self.inner.snapshot.write() = state;
    }

    pub fn set_mode(&self, mode: Mode) {
        self.inner.snapshot.write().mode = mode;
    }

    /// Live input state.
    pub fn snapshot(&self) -> InputState {
        *self.inner.snapshot.read()
    }

    /// Oldest first.
    pub fn recent_transitions(&self) -> Vec<Transition> {
        self.inner.history.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.inner.tx.subscribe(),
            dropped: 0,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }
}

/// One observer's view of the bus.
pub struct Subscription {
    rx: broadcast::Receiver<BusEvent>,
    dropped: u64,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(n)) => self.dropped += n,
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(n)) => self.dropped += n,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Blocking wait for the next event from a plain test thread.
    #[cfg(test)]
    pub(crate) fn recv_timeout(&mut self, timeout: std::time::Duration) -> Option<BusEvent> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .ok()?;
        rt.block_on(async { tokio::time::timeout(timeout, self.recv()).await })
            .ok()
            .flatten()
    }

    /// Events lost to lag so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
