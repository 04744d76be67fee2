//! Procedural 3D pipes: growers that stretch through a bounded volume one
//! segment at a time, and a pool that keeps a set of them running.
//!
//! - Shared collision scene for every grower in a pool
//! - Per-pipe growth state machine paced by the host's frame loop
//! - Pool that refills finished pipes up to a desired concurrency

pub mod config;
pub mod error;
pub mod geometry;
pub mod grower;
pub mod pool;
pub mod spatial;

pub use config::{PipeConfig, PoolConfig};
pub use error::{PipesError, Result};
pub use geometry::{Bounds, Color, Direction, PipeId, Segment, Shape, TurnMarker};
pub use grower::{FinishReason, PipeEvent, PipeGrower, PipeState, TurnKind};
pub use pool::{FinishedPipe, PipePool, SpawnOutcome};
pub use spatial::{GeometryId, RayHit, RayQuery, SceneIndex, SharedScene, SpatialQuery};
