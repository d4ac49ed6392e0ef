//! Process lifecycle bus.
//!
//! A single broadcast channel carries the three lifecycle events: the
//! process publishes `prepare` at boot and `go` when the listeners start;
//! `stop` arrives from a signal handler or from the admission controller's
//! escalation path and triggers graceful drain.

use tokio::sync::broadcast;
use tracing::info;

/// Lifecycle events in publication order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Prepare,
    Go,
    Stop,
}

/// Broadcast bus for lifecycle events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(8);
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        info!(?event, "lifecycle");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for the next `stop` on the bus.
pub async fn until_stop(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(Event::Stop) | Err(broadcast::error::RecvError::Closed) => return,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_reaches_subscriber() {
        let bus = Bus::new();
        let rx = bus.subscribe();

        bus.publish(Event::Prepare);
        bus.publish(Event::Go);
        bus.publish(Event::Stop);

        tokio::time::timeout(std::time::Duration::from_secs(1), until_stop(rx))
            .await
            .expect("stop must arrive");
    }

    #[tokio::test]
    async fn test_closed_bus_unblocks_waiter() {
        let bus = Bus::new();
        let rx = bus.subscribe();
        drop(bus);

        tokio::time::timeout(std::time::Duration::from_secs(1), until_stop(rx))
            .await
            .expect("closed bus must unblock");
    }
}
