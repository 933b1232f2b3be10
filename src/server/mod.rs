//! The authoritative tick loop.
//!
//! [`WorldServer::run`] owns the [`World`] and is its only writer. Connection
//! tasks talk to it through a bounded intent queue ([`ServerHandle`],
//! [`ConnectionHandle`]) and receive visibility events on their own bounded
//! outbound queue. Saves are encoded inside the loop and written on the
//! blocking pool so disk I/O never stalls a tick.

pub mod intent;
pub mod outbound;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::Config;
use crate::metrics;
use crate::persist::save::{encode, write_atomic};
use crate::persist::SaveReport;
use crate::storage::backup::{BackupKind, BackupManager, RetentionPolicy};
use crate::world::serial::Serial;
use crate::world::visibility::ConnectionId;
use crate::world::World;

pub use self::intent::{ConnectionHandle, Intent, ServerHandle};
pub use self::outbound::{ChannelSink, OutboundRegistry};

/// A write running on the blocking pool and whoever is waiting for it.
struct PendingSave {
    task: JoinHandle<Result<SaveReport>>,
    reply: Option<oneshot::Sender<Result<SaveReport>>>,
}

/// Resolves when the pending write finishes; never resolves when there is none.
async fn save_finished(pending: &mut Option<PendingSave>) -> Result<SaveReport> {
    match pending {
        Some(save) => match (&mut save.task).await {
            Ok(result) => result,
            Err(e) => Err(anyhow!("save task failed: {}", e)),
        },
        None => std::future::pending().await,
    }
}

pub struct ServerOptions {
    pub tick: Duration,
    pub intent_queue: usize,
    pub outbound_queue: usize,
    /// `None` disables autosave.
    pub autosave: Option<Duration>,
    pub metrics_log: Option<Duration>,
    /// Where saves go; `None` keeps the world in memory only.
    pub save_path: Option<PathBuf>,
    pub backups: Option<BackupManager>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            intent_queue: 1024,
            outbound_queue: 256,
            autosave: None,
            metrics_log: None,
            save_path: None,
            backups: None,
        }
    }
}

impl ServerOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        let backups = if config.storage.backups {
            let retention = RetentionPolicy {
                keep: config.storage.backup_retention,
                keep_manual: true,
            };
            Some(
                BackupManager::new(config.save_path(), config.backup_dir(), retention)
                    .map_err(|e| anyhow!("Failed to open backup directory: {}", e))?,
            )
        } else {
            None
        };
        let minutes = |m: u64| (m > 0).then(|| Duration::from_secs(m * 60));
        let seconds = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Ok(Self {
            tick: Duration::from_millis(config.world.tick_ms),
            intent_queue: config.server.intent_queue,
            outbound_queue: config.server.outbound_queue,
            autosave: minutes(config.server.autosave_minutes),
            metrics_log: seconds(config.server.metrics_log_seconds),
            save_path: Some(config.save_path()),
            backups,
        })
    }
}

pub struct WorldServer {
    world: World,
    intents: mpsc::Receiver<Intent>,
    outbound: OutboundRegistry,
    /// Connection -> mobile it observes through, once attached.
    connections: HashMap<ConnectionId, Option<Serial>>,
    tick: Duration,
    autosave: Option<Duration>,
    metrics_log: Option<Duration>,
    save_path: Option<PathBuf>,
    backups: Option<Arc<Mutex<BackupManager>>>,
    pending_save: Option<PendingSave>,
}

impl WorldServer {
    /// Wrap `world` for serving. The world's observer sink is replaced with
    /// one feeding the connections' outbound queues.
    pub fn new(mut world: World, options: ServerOptions) -> (Self, ServerHandle) {
        let (tx, rx) = mpsc::channel(options.intent_queue.max(1));
        let outbound = OutboundRegistry::default();
        world.replace_sink(Box::new(outbound.sink()));
        let server = Self {
            world,
            intents: rx,
            outbound,
            connections: HashMap::new(),
            tick: options.tick.max(Duration::from_millis(1)),
            autosave: options.autosave,
            metrics_log: options.metrics_log,
            save_path: options.save_path,
            backups: options.backups.map(|b| Arc::new(Mutex::new(b))),
            pending_save: None,
        };
        (server, ServerHandle::new(tx, options.outbound_queue))
    }

    /// Run on the current runtime; the join handle yields the world back.
    pub fn spawn(world: World, options: ServerOptions) -> (JoinHandle<Result<World>>, ServerHandle) {
        let (server, handle) = Self::new(world, options);
        (tokio::spawn(server.run()), handle)
    }

    /// Drive ticks and intents until shutdown, Ctrl-C, or every handle is
    /// dropped. A final save is written when a save path is configured.
    pub async fn run(mut self) -> Result<World> {
        info!(
            "world server running: {} entities, tick {:?}",
            self.world.len(),
            self.tick
        );
        let mut ticker = time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let far = Duration::from_secs(60 * 60 * 24 * 365);
        let mut autosave = time::interval_at(
            time::Instant::now() + self.autosave.unwrap_or(far),
            self.autosave.unwrap_or(far),
        );
        let mut metrics_log = time::interval_at(
            time::Instant::now() + self.metrics_log.unwrap_or(far),
            self.metrics_log.unwrap_or(far),
        );

        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => self.tick_once(),
                intent = self.intents.recv() => match intent {
                    Some(Intent::Shutdown { reply }) => {
                        shutdown_reply = Some(reply);
                        break;
                    }
                    Some(intent) => self.apply(intent),
                    None => {
                        info!("all server handles dropped; stopping");
                        break;
                    }
                },
                outcome = save_finished(&mut self.pending_save), if self.pending_save.is_some() => {
                    self.save_done(outcome);
                }
                _ = autosave.tick(), if self.autosave.is_some() => {
                    self.start_save(Some(BackupKind::Autosave), None);
                }
                _ = metrics_log.tick(), if self.metrics_log.is_some() => {
                    match serde_json::to_string(&metrics::snapshot()) {
                        Ok(line) => info!("metrics {}", line),
                        Err(e) => debug!("metrics snapshot not serializable: {}", e),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received; stopping");
                    break;
                }
            }
        }

        self.finish().await;
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
        Ok(self.world)
    }

    async fn finish(&mut self) {
        // a write still in flight lands before the final one
        if self.pending_save.is_some() {
            let outcome = save_finished(&mut self.pending_save).await;
            self.save_done(outcome);
        }
        if self.save_path.is_some() {
            self.start_save(Some(BackupKind::Shutdown), None);
            if self.pending_save.is_some() {
                match save_finished(&mut self.pending_save).await {
                    Ok(report) => info!("final save: {} entities", report.entities),
                    Err(e) => error!("final save failed: {:#}", e),
                }
                self.pending_save = None;
            }
        }
        for connection in self.connections.keys().copied().collect::<Vec<_>>() {
            self.disconnect(connection);
        }
    }

    fn tick_once(&mut self) {
        let started = Instant::now();
        let report = self.world.tick();
        if report.dropped > 0 {
            debug!("tick {}: {} timers dropped", report.tick, report.dropped);
        }
        let mut disconnects = report.disconnects;
        disconnects.extend(self.world.take_disconnects());
        for connection in disconnects {
            self.disconnect(connection);
        }
        metrics::tick_completed(started.elapsed(), self.tick);
    }

    /// Remove a connection: its observer is detached and its outbound queue closed.
    fn disconnect(&mut self, connection: ConnectionId) {
        if let Some(Some(mobile)) = self.connections.remove(&connection) {
            self.world.detach_observer(mobile);
        }
        if self.outbound.remove(connection) {
            info!("connection {} disconnected", connection);
        }
    }

    fn attached(&self, connection: ConnectionId) -> Option<Serial> {
        self.connections.get(&connection).copied().flatten()
    }

    fn apply(&mut self, intent: Intent) {
        metrics::intent_applied();
        match intent {
            Intent::Connect {
                connection,
                outbound,
            } => {
                self.outbound.register(connection, outbound);
                self.connections.insert(connection, None);
                debug!("connection {} opened", connection);
            }
            Intent::Disconnect { connection } => self.disconnect(connection),
            Intent::Attach {
                connection,
                mobile,
                radius,
                reply,
            } => {
                if !self.connections.contains_key(&connection) {
                    metrics::intent_rejected();
                    let _ = reply.send(Err(crate::errors::WorldError::NotFound(mobile)));
                    return;
                }
                let result = self.world.attach_observer(mobile, connection, radius);
                match result {
                    Ok(_) => {
                        if let Some(previous) = self.connections.insert(connection, Some(mobile)).flatten() {
                            if previous != mobile {
                                self.world.detach_observer(previous);
                            }
                        }
                    }
                    // a refused attach leaves any existing binding in place
                    Err(_) => metrics::intent_rejected(),
                }
                let _ = reply.send(result);
            }
            Intent::Detach { connection } => {
                if let Some(mobile) = self.attached(connection) {
                    self.world.detach_observer(mobile);
                    self.connections.insert(connection, None);
                }
            }
            Intent::Move {
                connection,
                direction,
                reply,
            } => {
                let moved = match self.attached(connection) {
                    Some(mobile) => self.world.move_entity(mobile, direction),
                    None => false,
                };
                if !moved {
                    metrics::intent_rejected();
                }
                let _ = reply.send(moved);
            }
            Intent::SetParent {
                entity,
                parent,
                reply,
            } => {
                let result = self.world.set_parent(entity, parent);
                if result.is_err() {
                    metrics::intent_rejected();
                }
                let _ = reply.send(result);
            }
            Intent::SetViewRadius {
                connection,
                radius,
                reply,
            } => {
                let clamped = self
                    .attached(connection)
                    .and_then(|mobile| self.world.set_view_radius(mobile, radius));
                let _ = reply.send(clamped);
            }
            Intent::Visible { connection, reply } => {
                let visible = self
                    .attached(connection)
                    .and_then(|mobile| self.world.visible_to(mobile))
                    .unwrap_or_default();
                let _ = reply.send(visible);
            }
            Intent::QueryRange {
                center,
                radius,
                reply,
            } => {
                let _ = reply.send(self.world.query_range(center, radius));
            }
            Intent::Inspect { serial, reply } => {
                let _ = reply.send(self.world.find(serial).cloned());
            }
            Intent::Save { reply } => self.start_save(Some(BackupKind::Manual), Some(reply)),
            Intent::Shutdown { reply } => {
                // handled by the loop; reaching here means a nested dispatch
                let _ = reply.send(());
            }
        }
    }

    /// Hand a finished write's outcome to whoever asked for it.
    fn save_done(&mut self, outcome: Result<SaveReport>) {
        if let Some(PendingSave { reply: Some(reply), .. }) = self.pending_save.take() {
            let _ = reply.send(outcome);
        }
    }

    /// Encode now and write on the blocking pool. At most one write runs at a
    /// time; a save requested before the loop has collected the previous one
    /// is refused.
    fn start_save(&mut self, backup: Option<BackupKind>, reply: Option<oneshot::Sender<Result<SaveReport>>>) {
        let fail = |reply: Option<oneshot::Sender<Result<SaveReport>>>, e: anyhow::Error| {
            metrics::save_failed();
            warn!("save not started: {:#}", e);
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
        };
        let Some(path) = self.save_path.clone() else {
            return fail(reply, anyhow!("no save path configured"));
        };
        if self.pending_save.is_some() {
            return fail(reply, anyhow!("a save is already in progress"));
        }
        let encoded = match encode(&self.world) {
            Ok(encoded) => encoded,
            Err(e) => return fail(reply, e.into()),
        };
        let backups = self.backups.clone();
        let task = tokio::task::spawn_blocking(move || {
            let result = write_save(&path, encoded.bytes, encoded.report, backups, backup);
            match &result {
                Ok(report) => {
                    metrics::save_completed();
                    info!("saved {} entities to {}", report.entities, path.display());
                }
                Err(e) => {
                    metrics::save_failed();
                    error!("save to {} failed: {:#}", path.display(), e);
                }
            }
            result
        });
        self.pending_save = Some(PendingSave { task, reply });
    }
}

fn write_save(
    path: &std::path::Path,
    bytes: Vec<u8>,
    mut report: SaveReport,
    backups: Option<Arc<Mutex<BackupManager>>>,
    kind: Option<BackupKind>,
) -> Result<SaveReport> {
    if let (Some(backups), Some(kind)) = (backups, kind) {
        if path.exists() {
            let mut manager = backups.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = manager.create_backup(None, kind) {
                warn!("backup before save failed: {}", e);
            } else if let Err(e) = manager.apply_retention_policy() {
                warn!("backup retention failed: {}", e);
            }
        }
    }
    write_atomic(path, &bytes)?;
    report.path = Some(path.to_path_buf());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::entity::Location;
    use crate::world::WorldSettings;

    fn options() -> ServerOptions {
        ServerOptions {
            tick: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn queries_go_through_the_loop() {
        let mut world = World::new(WorldSettings::default());
        let bag = world
            .create_entity_at("bag", Location::new(10, 10, 0))
            .expect("bag");
        let (task, handle) = WorldServer::spawn(world, options());

        let found = handle
            .query_range(Location::new(10, 10, 0), 2)
            .await
            .expect("query");
        assert_eq!(found, vec![bag]);
        let entity = handle.inspect(bag).await.expect("inspect").expect("exists");
        assert_eq!(entity.template, "bag");

        handle.shutdown().await.expect("shutdown");
        let world = task.await.expect("join").expect("run");
        assert_eq!(world.len(), 1);
    }

    #[tokio::test]
    async fn save_without_path_is_an_error() {
        let (task, handle) = WorldServer::spawn(World::new(WorldSettings::default()), options());
        assert!(handle.save().await.is_err());
        drop(handle);
        task.await.expect("join").expect("run");
    }
}
