//! Per-connection outbound queues.
//!
//! The tick loop never awaits a connection: events go out through
//! `try_send` on a bounded channel, and a full or closed channel asks the
//! world to drop that connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::metrics;
use crate::world::visibility::{ConnectionId, Delivery, ObserverSink, VisibilityEvent};

/// Sender halves of every live connection's outbound queue, shared between
/// the server (which registers and removes them) and the world's sink.
#[derive(Debug, Clone, Default)]
pub struct OutboundRegistry {
    senders: Arc<Mutex<HashMap<ConnectionId, mpsc::Sender<VisibilityEvent>>>>,
}

impl OutboundRegistry {
    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<VisibilityEvent>>> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, connection: ConnectionId, sender: mpsc::Sender<VisibilityEvent>) {
        if self.lock().insert(connection, sender).is_some() {
            warn!("connection {} registered twice; replacing its queue", connection);
        }
    }

    /// Drop the server's sender; the connection sees its queue close once drained.
    pub fn remove(&self, connection: ConnectionId) -> bool {
        self.lock().remove(&connection).is_some()
    }

    pub fn contains(&self, connection: ConnectionId) -> bool {
        self.lock().contains_key(&connection)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sink to install on the world.
    pub fn sink(&self) -> ChannelSink {
        ChannelSink {
            registry: self.clone(),
        }
    }
}

/// [`ObserverSink`] writing into the registered outbound queues.
#[derive(Debug)]
pub struct ChannelSink {
    registry: OutboundRegistry,
}

impl ObserverSink for ChannelSink {
    fn deliver(&mut self, connection: ConnectionId, event: &VisibilityEvent) -> Delivery {
        let senders = self.registry.lock();
        let Some(sender) = senders.get(&connection) else {
            debug!("event for unregistered connection {}", connection);
            return Delivery::Disconnect;
        };
        match sender.try_send(event.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                metrics::outbound_dropped();
                warn!("outbound queue of connection {} is full; disconnecting", connection);
                Delivery::Disconnect
            }
            Err(TrySendError::Closed(_)) => {
                debug!("connection {} closed its queue", connection);
                Delivery::Disconnect
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::serial::Serial;

    fn exit(raw: u32) -> VisibilityEvent {
        VisibilityEvent::Exit {
            subject: Serial::new(raw),
        }
    }

    #[test]
    fn full_queue_requests_disconnect() {
        let registry = OutboundRegistry::default();
        let (tx, mut rx) = mpsc::channel(2);
        registry.register(7, tx);
        let mut sink = registry.sink();
        assert_eq!(sink.deliver(7, &exit(1)), Delivery::Delivered);
        assert_eq!(sink.deliver(7, &exit(2)), Delivery::Delivered);
        assert_eq!(sink.deliver(7, &exit(3)), Delivery::Disconnect);
        assert_eq!(rx.try_recv().ok(), Some(exit(1)));
    }

    #[test]
    fn closed_or_unknown_connection_requests_disconnect() {
        let registry = OutboundRegistry::default();
        let (tx, rx) = mpsc::channel(4);
        registry.register(1, tx);
        drop(rx);
        let mut sink = registry.sink();
        assert_eq!(sink.deliver(1, &exit(1)), Delivery::Disconnect);
        assert_eq!(sink.deliver(2, &exit(1)), Delivery::Disconnect);
        assert!(registry.remove(1));
        assert!(registry.is_empty());
    }
}
