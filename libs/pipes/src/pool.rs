//! Keeps a target number of growers running and recycles finished ones.

use std::collections::{BTreeMap, VecDeque};

use crossbeam_channel::{Receiver, Sender};
use nalgebra::Vector3;

use crate::config::{validate_speed, PoolConfig};
use crate::error::Result;
use crate::geometry::PipeId;
use crate::grower::{FinishReason, PipeEvent, PipeGrower};
use crate::spatial::{SceneIndex, SharedScene};

/// Random start positions tried before settling for an occupied one.
const START_ATTEMPTS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Spawned(PipeId),
    /// The pool is at capacity; the pipe starts once a slot frees up.
    Deferred,
}

/// What the pool remembers about a pipe after it leaves the active set.
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedPipe {
    pub id: PipeId,
    /// `None` when the pipe was retired before it finished on its own.
    pub reason: Option<FinishReason>,
    pub turns: u32,
    pub segments: usize,
}

pub struct PipePool {
    config: PoolConfig,
    scene: SharedScene,
    rng: oorandom::Rand32,
    next_id: u64,

    active: BTreeMap<PipeId, PipeGrower>,
    /// Finished growers, kept (with their geometry) until reset.
    retired: Vec<PipeGrower>,
    history: VecDeque<FinishedPipe>,
    deferred_spawns: usize,

    completions_tx: Sender<PipeId>,
    completions_rx: Receiver<PipeId>,
}

impl PipePool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_scene(config, SceneIndex::shared())
    }

    /// Uses `scene` as the shared collision surface for every grower.
    pub fn with_scene(config: PoolConfig, scene: SharedScene) -> Result<Self> {
        config.validate()?;
        let (completions_tx, completions_rx) = crossbeam_channel::unbounded();
        Ok(Self {
            rng: oorandom::Rand32::new(config.seed),
            config,
            scene,
            next_id: 0,
            active: BTreeMap::new(),
            retired: Vec::new(),
            history: VecDeque::new(),
            deferred_spawns: 0,
            completions_tx,
            completions_rx,
        })
    }

    /// Spawns growers until the active count reaches the desired target,
    /// serving deferred requests first. Never exceeds the on-screen cap and
    /// stops early when the scene has no free start position left.
    pub fn ensure_desired_concurrency(&mut self) -> Result<Vec<PipeId>> {
        let mut spawned = Vec::new();
        while self.deferred_spawns > 0 && self.active.len() < self.config.max_pipes_on_screen {
            match self.spawn()? {
                Some(id) => {
                    self.deferred_spawns -= 1;
                    spawned.push(id);
                }
                None => return Ok(spawned),
            }
        }
        while self.active.len() < self.config.target_active() {
            match self.spawn()? {
                Some(id) => spawned.push(id),
                None => break,
            }
        }
        Ok(spawned)
    }

    /// Asks for one more pipe on top of whatever is running.
    ///
    /// Deferred when the pool is at capacity or no free start position exists.
    pub fn request_spawn(&mut self) -> Result<SpawnOutcome> {
        if self.active.len() < self.config.max_pipes_on_screen {
            if let Some(id) = self.spawn()? {
                return Ok(SpawnOutcome::Spawned(id));
            }
        }
        self.deferred_spawns += 1;
        log::debug!(
            "spawn deferred, {} pipes active ({} waiting)",
            self.active.len(),
            self.deferred_spawns
        );
        Ok(SpawnOutcome::Deferred)
    }

    /// `None` when every start position tried is occupied.
    fn spawn(&mut self) -> Result<Option<PipeId>> {
        let margin = self.config.pipe_config(self.config.max_pipe_turns).clearance() * 2.0;
        let Some(start) = self.find_start_position(margin) else {
            log::warn!(
                "no free start position after {} attempts, {} pipes active",
                START_ATTEMPTS,
                self.active.len()
            );
            return Ok(None);
        };

        let id = PipeId(self.next_id);
        self.next_id += 1;

        let span = self.config.max_pipe_turns - self.config.min_pipe_turns;
        let turns = self.config.min_pipe_turns + self.rng.rand_range(0..span.saturating_add(1));
        let seed = (u64::from(self.rng.rand_u32()) << 32) | u64::from(self.rng.rand_u32());

        let pipe_config = self.config.pipe_config(turns);
        let mut grower = PipeGrower::new(id, pipe_config, self.scene.clone(), seed)?
            .with_start_position(start);
        grower.start(Some(self.completions_tx.clone()));

        log::info!("spawning {} at {:?} with {} turns", id, start, turns);
        self.active.insert(id, grower);
        Ok(Some(id))
    }

    /// The origin when it is free, otherwise a random free point in bounds.
    fn find_start_position(&mut self, margin: f32) -> Option<Vector3<f32>> {
        let scene = self.scene.borrow();
        let origin = Vector3::zeros();
        if !scene.is_occupied(&origin, margin) {
            return Some(origin);
        }

        let half = self.config.boundary_size / 2.0;
        (0..START_ATTEMPTS).find_map(|_| {
            let p = Vector3::new(
                (self.rng.rand_float() * 2.0 - 1.0) * half.x,
                (self.rng.rand_float() * 2.0 - 1.0) * half.y,
                (self.rng.rand_float() * 2.0 - 1.0) * half.z,
            );
            (!scene.is_occupied(&p, margin)).then_some(p)
        })
    }

    /// Advances every active grower and recycles the ones that finished.
    pub fn tick(&mut self, dt: f32) -> Result<Vec<PipeEvent>> {
        if self.active.len() < self.config.target_active() || self.deferred_spawns > 0 {
            self.ensure_desired_concurrency()?;
        }

        let mut events = Vec::new();
        for grower in self.active.values_mut() {
            events.extend(grower.advance(dt));
        }

        let finished: Vec<PipeId> = self.completions_rx.try_iter().collect();
        for id in finished {
            self.on_pipe_finished(id)?;
        }
        Ok(events)
    }

    /// Moves `id` out of the active set and refills. Unknown ids are ignored.
    pub fn on_pipe_finished(&mut self, id: PipeId) -> Result<()> {
        let Some(grower) = self.active.remove(&id) else {
            return Ok(());
        };

        let record = FinishedPipe {
            id,
            reason: grower.finish_reason(),
            turns: grower.turn_count(),
            segments: grower.segments().len(),
        };
        log::info!(
            "{} finished ({:?}) after {} turns, {} active",
            id,
            record.reason,
            record.turns,
            self.active.len()
        );

        self.history.push_back(record);
        while self.history.len() > self.config.max_finished_history {
            self.history.pop_front();
        }
        self.retired.push(grower);

        self.ensure_desired_concurrency()?;
        Ok(())
    }

    /// Drops every grower and its geometry and clears all pool state.
    ///
    /// Nothing is spawned here: hosts must call [`PipePool::tick`] or
    /// [`PipePool::ensure_desired_concurrency`] afterwards to refill.
    pub fn reset(&mut self) {
        let dropped = self.active.len() + self.retired.len();
        self.active.clear();
        self.retired.clear();
        self.history.clear();
        self.deferred_spawns = 0;
        self.scene.borrow_mut().clear();

        // Notifications still in flight belong to pipes that no longer exist.
        let (tx, rx) = crossbeam_channel::unbounded();
        self.completions_tx = tx;
        self.completions_rx = rx;

        log::info!("reset pipes, dropped {}", dropped);
    }

    /// Applies to every active pipe and to pipes spawned later.
    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        validate_speed(speed)?;
        self.config.pipe_speed = speed;
        for grower in self.active.values_mut() {
            grower.set_speed(speed)?;
        }
        Ok(())
    }

    pub fn set_desired_active_pipe_count(&mut self, count: usize) {
        self.config.desired_active_pipe_count = count;
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn scene(&self) -> &SharedScene {
        &self.scene
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn active_ids(&self) -> Vec<PipeId> {
        self.active.keys().copied().collect()
    }

    pub fn pipe(&self, id: PipeId) -> Option<&PipeGrower> {
        self.active.get(&id)
    }

    pub fn pipe_mut(&mut self, id: PipeId) -> Option<&mut PipeGrower> {
        self.active.get_mut(&id)
    }

    pub fn retired(&self) -> &[PipeGrower] {
        &self.retired
    }

    pub fn history(&self) -> &VecDeque<FinishedPipe> {
        &self.history
    }

    pub fn pending_spawn_requests(&self) -> usize {
        self.deferred_spawns
    }
}
