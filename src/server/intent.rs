//! Requests from connection tasks to the tick loop, and the handles that send them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};

use crate::errors::{Rejection, WorldResult};
use crate::persist::SaveReport;
use crate::world::entity::{Direction, Entity, Location, Parent};
use crate::world::serial::Serial;
use crate::world::visibility::{ConnectionId, VisibilityEvent};

/// One request for the tick loop. Applied strictly in enqueue order.
#[derive(Debug)]
pub enum Intent {
    Connect {
        connection: ConnectionId,
        outbound: mpsc::Sender<VisibilityEvent>,
    },
    Disconnect {
        connection: ConnectionId,
    },
    Attach {
        connection: ConnectionId,
        mobile: Serial,
        radius: Option<u32>,
        reply: oneshot::Sender<WorldResult<u32>>,
    },
    Detach {
        connection: ConnectionId,
    },
    Move {
        connection: ConnectionId,
        direction: Direction,
        reply: oneshot::Sender<bool>,
    },
    SetParent {
        entity: Serial,
        parent: Parent,
        reply: oneshot::Sender<Result<(), Rejection>>,
    },
    SetViewRadius {
        connection: ConnectionId,
        radius: u32,
        reply: oneshot::Sender<Option<u32>>,
    },
    Visible {
        connection: ConnectionId,
        reply: oneshot::Sender<Vec<Serial>>,
    },
    QueryRange {
        center: Location,
        radius: u32,
        reply: oneshot::Sender<Vec<Serial>>,
    },
    Inspect {
        serial: Serial,
        reply: oneshot::Sender<Option<Entity>>,
    },
    Save {
        reply: oneshot::Sender<Result<SaveReport>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running server.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    intents: mpsc::Sender<Intent>,
    next_connection: Arc<AtomicU64>,
    outbound_capacity: usize,
}

fn stopped() -> anyhow::Error {
    anyhow!("world server is not running")
}

async fn request<T>(intents: &mpsc::Sender<Intent>, build: impl FnOnce(oneshot::Sender<T>) -> Intent) -> Result<T> {
    let (tx, rx) = oneshot::channel();
    intents.send(build(tx)).await.map_err(|_| stopped())?;
    rx.await.map_err(|_| stopped())
}

impl ServerHandle {
    pub(crate) fn new(intents: mpsc::Sender<Intent>, outbound_capacity: usize) -> Self {
        Self {
            intents,
            next_connection: Arc::new(AtomicU64::new(1)),
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    /// Open a connection with its own bounded outbound queue.
    pub async fn connect(&self) -> Result<ConnectionHandle> {
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let (outbound, events) = mpsc::channel(self.outbound_capacity);
        self.intents
            .send(Intent::Connect {
                connection,
                outbound,
            })
            .await
            .map_err(|_| stopped())?;
        Ok(ConnectionHandle {
            id: connection,
            intents: self.intents.clone(),
            events,
        })
    }

    pub async fn set_parent(&self, entity: Serial, parent: Parent) -> Result<Result<(), Rejection>> {
        request(&self.intents, |reply| Intent::SetParent { entity, parent, reply }).await
    }

    pub async fn query_range(&self, center: Location, radius: u32) -> Result<Vec<Serial>> {
        request(&self.intents, |reply| Intent::QueryRange { center, radius, reply }).await
    }

    /// Snapshot of one entity as of the moment the request is applied.
    pub async fn inspect(&self, serial: Serial) -> Result<Option<Entity>> {
        request(&self.intents, |reply| Intent::Inspect { serial, reply }).await
    }

    /// Save now. Resolves once the file is written.
    pub async fn save(&self) -> Result<SaveReport> {
        request(&self.intents, |reply| Intent::Save { reply }).await?
    }

    /// Stop the loop after a final save.
    pub async fn shutdown(&self) -> Result<()> {
        request(&self.intents, |reply| Intent::Shutdown { reply }).await
    }
}

/// One client's view of the server: its intents in, its visibility events out.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    intents: mpsc::Sender<Intent>,
    events: mpsc::Receiver<VisibilityEvent>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Observe through `mobile`. Returns the clamped view radius.
    pub async fn attach(&self, mobile: Serial, radius: Option<u32>) -> Result<WorldResult<u32>> {
        let connection = self.id;
        request(&self.intents, |reply| Intent::Attach {
            connection,
            mobile,
            radius,
            reply,
        })
        .await
    }

    pub async fn detach(&self) -> Result<()> {
        self.intents
            .send(Intent::Detach { connection: self.id })
            .await
            .map_err(|_| stopped())
    }

    /// Turn or step the attached mobile.
    pub async fn step(&self, direction: Direction) -> Result<bool> {
        let connection = self.id;
        request(&self.intents, |reply| Intent::Move {
            connection,
            direction,
            reply,
        })
        .await
    }

    pub async fn set_view_radius(&self, radius: u32) -> Result<Option<u32>> {
        let connection = self.id;
        request(&self.intents, |reply| Intent::SetViewRadius {
            connection,
            radius,
            reply,
        })
        .await
    }

    pub async fn visible(&self) -> Result<Vec<Serial>> {
        let connection = self.id;
        request(&self.intents, |reply| Intent::Visible { connection, reply }).await
    }

    pub async fn set_parent(&self, entity: Serial, parent: Parent) -> Result<Result<(), Rejection>> {
        request(&self.intents, |reply| Intent::SetParent { entity, parent, reply }).await
    }

    /// Next visibility event. `None` once the server has dropped this connection
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<VisibilityEvent> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<VisibilityEvent> {
        self.events.try_recv().ok()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<VisibilityEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn close(self) -> Result<()> {
        self.intents
            .send(Intent::Disconnect { connection: self.id })
            .await
            .map_err(|_| stopped())
    }
}
