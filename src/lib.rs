//! # shardcore - world state for a multiplayer game server
//!
//! shardcore holds everything a shard needs to keep its world consistent
//! between player actions and across restarts:
//!
//! - **Serial allocation**: class-partitioned 31-bit handles that are never
//!   reissued while in use, even across a reload.
//! - **Ownership**: a single-parent containment tree (world, void, container,
//!   mobile) with cached container weights and capacity checks.
//! - **Spatial map & visibility**: an 8×8 chunk grid with region-aware
//!   wrapping, and per-observer enter/update/exit deltas.
//! - **Timers**: a three-ring bucketed scheduler measured in ticks.
//! - **Persistence**: a segmented, tagged binary save file, written
//!   atomically and loaded in three phases that survive corruption.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use shardcore::world::{World, WorldSettings};
//! use shardcore::world::entity::{Location, Parent};
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut world = World::new(WorldSettings::default());
//!     let player = world.create_entity_at("human", Location::new(100, 100, 0))?;
//!     let pack = world.create_entity("backpack")?;
//!     world.set_parent(pack, Parent::Entity(player))?;
//!     world.save(std::path::Path::new("data/world.sav"))?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module organization
//!
//! - [`world`] - the [`world::World`] arena and its subsystems
//! - [`persist`] - save file format, save and load
//! - [`server`] - the tokio tick loop and connection handles
//! - [`storage`] - compressed backups of the save file
//! - [`config`] - TOML configuration
//! - [`errors`] - error and load-issue types

pub mod config;
pub mod errors;
pub mod logutil;
pub mod metrics;
pub mod persist;
pub mod server;
pub mod storage;
pub mod world;
