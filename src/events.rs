//! Controller event bus
//!
//! Single-producer fan-out from the trading controller to UI consumers.
//! Posting never blocks; slow receivers lose the oldest events and the
//! losses are counted so the operator can see the bus was saturated.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::engines::decision::DecisionOutput;
use crate::models::TpState;

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControllerEvent {
    Decision(Box<DecisionOutput>),
    PositionOpened {
        ticket: u64,
        entry_price: f64,
        volume: f64,
    },
    PositionClosed {
        ticket: u64,
        exit_price: f64,
        reason: String,
        net_pl: f64,
    },
    TpStateChanged {
        ticket: u64,
        state: TpState,
    },
    StopRaised {
        ticket: u64,
        new_stop: f64,
    },
    TradingHalted {
        reason: String,
    },
    TradingResumed,
    HealthAlert {
        message: String,
    },
}

pub struct EventBus {
    tx: broadcast::Sender<ControllerEvent>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Non-blocking post. With no subscribers the event is simply dropped.
    pub fn post(&self, event: ControllerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.tx.subscribe(),
            dropped: self.dropped.clone(),
        }
    }

    /// Total events lost to lagging receivers across all subscribers.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct EventStream {
    rx: broadcast::Receiver<ControllerEvent>,
    dropped: Arc<AtomicU64>,
}

impl EventStream {
    /// Next event; lag gaps are counted and skipped, `None` means the bus
    /// is closed.
    pub async fn recv(&mut self) -> Option<ControllerEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-async drain used by synchronous status code.
    pub fn try_recv(&mut self) -> Option<ControllerEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped.fetch_add(missed, Ordering::Relaxed);
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.post(ControllerEvent::TradingResumed);
        assert_eq!(bus.dropped_events(), 0);
    }

    #[tokio::test]
    async fn events_fan_out() {
        let bus = EventBus::new(4);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.post(ControllerEvent::StopRaised {
            ticket: 1,
            new_stop: 2000.0,
        });
        assert!(matches!(
            a.recv().await,
            Some(ControllerEvent::StopRaised { ticket: 1, .. })
        ));
        assert!(matches!(
            b.recv().await,
            Some(ControllerEvent::StopRaised { ticket: 1, .. })
        ));
    }

    #[test]
    fn lagging_receiver_counts_drops() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for i in 0..10 {
            bus.post(ControllerEvent::StopRaised {
                ticket: i,
                new_stop: 2000.0,
            });
        }
        // Drain what survived; the overflow was dropped and counted.
        let mut seen = 0;
        while rx.try_recv().is_some() {
            seen += 1;
        }
        assert!(seen <= 2);
        assert!(bus.dropped_events() >= 8);
    }
}
