//! Growth state machine for a single pipe.
//!
//! A grower is driven from outside: either paced with [`PipeGrower::advance`]
//! (the way a frame loop accumulates `dt * speed`) or stepped directly. Every
//! emitted piece is registered in the shared scene before the step returns.

use crossbeam_channel::Sender;
use nalgebra::Vector3;

use crate::config::{validate_speed, PipeConfig};
use crate::error::Result;
use crate::geometry::{Bounds, Color, Direction, PipeId, Segment, Shape, TurnMarker};
use crate::spatial::{RayQuery, SharedScene};

/// Heading before the first move; the first turn may not reverse it.
pub const DEFAULT_DIRECTION: Direction = Direction::PosZ;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Idle,
    Generating,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The turn budget was used up.
    TurnsExhausted,
    /// Every direction stayed blocked for too many attempts in a row.
    Enclosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Forced by the turn frequency.
    Scheduled,
    /// Forced by a collision or the boundary.
    Avoidance,
}

/// Effects handed to whoever renders the pipes.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeEvent {
    SegmentCreated(Segment),
    TurnCreated { marker: TurnMarker, kind: TurnKind },
    Finished { id: PipeId, reason: FinishReason },
}

pub struct PipeGrower {
    id: PipeId,
    config: PipeConfig,
    bounds: Bounds,
    color: Color,
    scene: SharedScene,
    rng: oorandom::Rand32,

    state: PipeState,
    position: Vector3<f32>,
    direction: Direction,
    /// Direction of the last segment actually laid down.
    last_direction: Direction,
    segments_since_turn: u32,
    turn_count: u32,
    blocked_streak: u32,
    accumulator: f32,

    segments: Vec<Segment>,
    turns: Vec<TurnMarker>,
    finish_reason: Option<FinishReason>,
    on_finished: Option<Sender<PipeId>>,
}

impl PipeGrower {
    pub fn new(id: PipeId, config: PipeConfig, scene: SharedScene, seed: u64) -> Result<Self> {
        config.validate()?;
        let mut rng = oorandom::Rand32::new(seed);
        let color = config
            .pipe_color
            .unwrap_or_else(|| Color::random_pastel(&mut rng));

        Ok(Self {
            id,
            bounds: config.bounds(),
            config,
            color,
            scene,
            rng,
            state: PipeState::Idle,
            position: Vector3::zeros(),
            direction: DEFAULT_DIRECTION,
            last_direction: DEFAULT_DIRECTION,
            segments_since_turn: 0,
            turn_count: 0,
            blocked_streak: 0,
            accumulator: 0.0,
            segments: Vec::new(),
            turns: Vec::new(),
            finish_reason: None,
            on_finished: None,
        })
    }

    /// Start somewhere other than the origin. Only meaningful before `start`.
    pub fn with_start_position(mut self, position: Vector3<f32>) -> Self {
        if self.state == PipeState::Idle {
            self.position = position;
        }
        self
    }

    /// Begins growth. `on_finished` receives this pipe's id exactly once.
    pub fn start(&mut self, on_finished: Option<Sender<PipeId>>) {
        if self.state != PipeState::Idle {
            return;
        }
        self.state = PipeState::Generating;
        self.on_finished = on_finished;
        self.direction = self.random_forward_direction();
        // Claim the start point so other pipes route around it before the
        // first segment exists.
        self.scene.borrow_mut().register(
            self.id,
            Shape::Sphere {
                center: self.position,
                radius: self.config.turn_sphere_radius,
            },
        );
        // First segment goes out on the first tick.
        self.accumulator = 1.0;
        log::debug!(
            "{} started at {:?} heading {:?}, {} turns",
            self.id,
            self.position,
            self.direction,
            self.config.maximum_pipe_turns
        );
    }

    /// Paces growth: one step per whole unit of `dt * speed`.
    pub fn advance(&mut self, dt: f32) -> Vec<PipeEvent> {
        let mut events = Vec::new();
        if !self.is_generating() {
            return events;
        }
        self.accumulator += dt.max(0.0) * self.config.speed;
        while self.accumulator >= 1.0 && self.is_generating() {
            self.accumulator -= 1.0;
            self.step_into(&mut events);
        }
        events
    }

    /// Runs one pacing step: turns until a segment is laid down or the pipe
    /// finishes.
    pub fn step(&mut self) -> Vec<PipeEvent> {
        let mut events = Vec::new();
        self.step_into(&mut events);
        events
    }

    /// Starts the pipe if needed and steps it until it finishes.
    pub fn run_to_completion(&mut self) -> Vec<PipeEvent> {
        self.start(None);
        let mut events = Vec::new();
        while self.is_generating() {
            self.step_into(&mut events);
        }
        events
    }

    fn step_into(&mut self, events: &mut Vec<PipeEvent>) {
        if !self.is_generating() {
            return;
        }
        loop {
            if self.turn_count >= self.config.maximum_pipe_turns {
                self.finish(FinishReason::TurnsExhausted, events);
                return;
            }

            let distance = self.sample_stretch();
            if !self.is_clear(self.direction, distance) {
                let free = self.free_candidates();
                if free.is_empty() {
                    self.blocked_streak += 1;
                } else {
                    self.blocked_streak = 0;
                }
                let next = self.pick_direction(&free);
                self.turn(next, TurnKind::Avoidance, events);
                if self.blocked_streak >= self.config.max_blocked_retries
                    && self.turn_count < self.config.maximum_pipe_turns
                {
                    log::warn!(
                        "{} enclosed at {:?} after {} blocked attempts",
                        self.id,
                        self.position,
                        self.blocked_streak
                    );
                    self.finish(FinishReason::Enclosed, events);
                    return;
                }
                continue;
            }

            self.blocked_streak = 0;
            let target = self.position + self.direction.vector() * distance;
            self.lay_segment(target, events);

            if self.segments_since_turn >= self.config.turn_frequency {
                let next = self.random_forward_direction();
                self.turn(next, TurnKind::Scheduled, events);
            }
            if self.turn_count >= self.config.maximum_pipe_turns {
                self.finish(FinishReason::TurnsExhausted, events);
            }
            return;
        }
    }

    fn sample_stretch(&mut self) -> f32 {
        let min = self.config.minimum_stretch_distance;
        let max = self.config.maximum_stretch_distance;
        min + (max - min) * self.rng.rand_float()
    }

    fn random_forward_direction(&mut self) -> Direction {
        let candidates = self.last_direction.forward_candidates();
        candidates[self.rng.rand_range(0..candidates.len() as u32) as usize]
    }

    /// Candidates that can take at least the minimum stretch from here.
    fn free_candidates(&self) -> Vec<Direction> {
        let min = self.config.minimum_stretch_distance;
        self.last_direction
            .forward_candidates()
            .into_iter()
            .filter(|d| self.is_clear(*d, min))
            .collect()
    }

    /// Any free candidate, or any forward candidate when none is free.
    fn pick_direction(&mut self, free: &[Direction]) -> Direction {
        if free.is_empty() {
            return self.random_forward_direction();
        }
        free[self.rng.rand_range(0..free.len() as u32) as usize]
    }

    fn is_clear(&self, direction: Direction, distance: f32) -> bool {
        let target = self.position + direction.vector() * distance;
        if !self.bounds.contains(&target) {
            return false;
        }
        let query = RayQuery {
            origin: self.position,
            direction: direction.vector(),
            max_distance: distance,
            radius: self.config.clearance(),
            allow_owner: Some(self.id),
        };
        self.scene.borrow().cast_ray(&query).is_none()
    }

    fn lay_segment(&mut self, target: Vector3<f32>, events: &mut Vec<PipeEvent>) {
        let segment = Segment {
            pipe: self.id,
            start: self.position,
            end: target,
            direction: self.direction,
            radius: self.config.pipe_radius,
            color: self.color,
        };
        self.scene
            .borrow_mut()
            .register(self.id, Shape::from(&segment));
        log::trace!("{} segment {:?} -> {:?}", self.id, segment.start, segment.end);

        self.segments.push(segment);
        events.push(PipeEvent::SegmentCreated(segment));
        self.position = target;
        self.last_direction = self.direction;
        self.segments_since_turn += 1;
    }

    fn turn(&mut self, next: Direction, kind: TurnKind, events: &mut Vec<PipeEvent>) {
        self.direction = next;
        let marker = TurnMarker {
            pipe: self.id,
            center: self.position,
            radius: self.config.turn_sphere_radius,
            color: self.color,
        };
        self.scene
            .borrow_mut()
            .register(self.id, Shape::from(&marker));
        log::trace!("{} {:?} turn at {:?} -> {:?}", self.id, kind, marker.center, self.direction);

        self.turns.push(marker);
        events.push(PipeEvent::TurnCreated { marker, kind });
        self.turn_count += 1;
        self.segments_since_turn = 0;
    }

    fn finish(&mut self, reason: FinishReason, events: &mut Vec<PipeEvent>) {
        self.state = PipeState::Finished;
        self.finish_reason = Some(reason);
        events.push(PipeEvent::Finished {
            id: self.id,
            reason,
        });
        log::debug!(
            "{} finished ({:?}): {} segments, {} turns",
            self.id,
            reason,
            self.segments.len(),
            self.turn_count
        );
        if let Some(tx) = self.on_finished.take() {
            // The pool may have been reset and dropped its receiver.
            let _ = tx.send(self.id);
        }
    }

    pub fn set_speed(&mut self, speed: f32) -> Result<()> {
        validate_speed(speed)?;
        self.config.speed = speed;
        Ok(())
    }

    /// Lowering below the turns already taken finishes the pipe on its next step.
    pub fn set_max_turns(&mut self, max_turns: u32) {
        self.config.maximum_pipe_turns = max_turns.max(self.turn_count);
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn state(&self) -> PipeState {
        self.state
    }

    pub fn is_generating(&self) -> bool {
        self.state == PipeState::Generating
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    pub fn color(&self) -> Color {
        self.color
    }

    pub fn position(&self) -> Vector3<f32> {
        self.position
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn segments_since_turn(&self) -> u32 {
        self.segments_since_turn
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn turns(&self) -> &[TurnMarker] {
        &self.turns
    }
}

impl Drop for PipeGrower {
    fn drop(&mut self) {
        match self.scene.try_borrow_mut() {
            Ok(mut scene) => {
                let released = scene.release_owner(self.id);
                log::trace!("{} released {} shapes", self.id, released);
            }
            Err(_) => log::warn!(
                "{} dropped while the scene was borrowed, its shapes stay registered",
                self.id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::{SceneIndex, SpatialQuery};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn huge_boundary() -> Vector3<f32> {
        Vector3::new(10_000.0, 10_000.0, 10_000.0)
    }

    fn grower(config: PipeConfig, seed: u64) -> (PipeGrower, Rc<RefCell<SceneIndex>>) {
        let scene = SceneIndex::shared();
        let g = PipeGrower::new(PipeId(1), config, scene.clone(), seed).unwrap();
        (g, scene)
    }

    #[test]
    fn test_fixed_stretch_two_turns() {
        let config = PipeConfig {
            minimum_stretch_distance: 3.0,
            maximum_stretch_distance: 3.0,
            turn_frequency: 1,
            maximum_pipe_turns: 2,
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        let (mut g, scene) = grower(config, 11);
        let events = g.run_to_completion();

        assert_eq!(g.state(), PipeState::Finished);
        assert_eq!(g.finish_reason(), Some(FinishReason::TurnsExhausted));
        assert_eq!(g.turns().len(), 2);
        assert_eq!(g.segments().len(), 2);
        for s in g.segments() {
            assert!((s.length() - 3.0).abs() < 1e-5);
        }
        // Two segments, two turns and the start claim.
        assert_eq!(scene.borrow().len(), 5);
        assert!(matches!(events.last(), Some(PipeEvent::Finished { .. })));
    }

    #[test]
    fn test_first_target_outside_tiny_boundary_turns_in_place() {
        let config = PipeConfig {
            minimum_stretch_distance: 3.0,
            maximum_stretch_distance: 4.0,
            boundary_size: Vector3::new(2.0, 2.0, 2.0),
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 3);
        g.start(None);
        let events = g.step();

        match &events[0] {
            PipeEvent::TurnCreated { marker, kind } => {
                assert_eq!(marker.center, Vector3::zeros());
                assert_eq!(*kind, TurnKind::Avoidance);
            }
            other => panic!("expected a turn first, got {:?}", other),
        }
        assert!(g.segments().is_empty());
        assert_eq!(g.finish_reason(), Some(FinishReason::Enclosed));
    }

    #[test]
    fn test_enclosed_pipe_finishes() {
        let config = PipeConfig {
            minimum_stretch_distance: 3.0,
            maximum_stretch_distance: 5.0,
            maximum_pipe_turns: 10_000,
            max_blocked_retries: 8,
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        let (mut g, scene) = grower(config, 5);
        for d in Direction::ALL {
            scene.borrow_mut().register(
                PipeId(99),
                Shape::Sphere {
                    center: d.vector() * 1.5,
                    radius: 0.3,
                },
            );
        }

        g.run_to_completion();

        assert_eq!(g.finish_reason(), Some(FinishReason::Enclosed));
        assert_eq!(g.turn_count(), 8);
        assert!(g.segments().is_empty());
    }

    #[test]
    fn test_growth_invariants_hold() {
        let config = PipeConfig {
            maximum_pipe_turns: 60,
            boundary_size: Vector3::new(40.0, 30.0, 40.0),
            ..Default::default()
        };
        let bounds = config.bounds();
        for seed in 0..20 {
            let (mut g, _scene) = grower(config.clone(), seed);
            let events = g.run_to_completion();

            assert_eq!(g.turns().len() as u32, g.turn_count());
            assert!(g.turn_count() <= 60);
            match g.finish_reason() {
                Some(FinishReason::TurnsExhausted) => assert_eq!(g.turn_count(), 60),
                Some(FinishReason::Enclosed) => assert!(g.free_candidates().is_empty()),
                None => panic!("pipe {} never finished", seed),
            }
            for s in g.segments() {
                assert!(bounds.contains(&s.start));
                assert!(bounds.contains(&s.end));
                assert!(s.length() >= 3.0 - 1e-4 && s.length() <= 10.0 + 1e-4);
            }
            for pair in g.segments().windows(2) {
                assert_ne!(pair[1].direction, pair[0].direction.opposite());
            }
            let finished = events
                .iter()
                .filter(|e| matches!(e, PipeEvent::Finished { .. }))
                .count();
            assert_eq!(finished, 1);
        }
    }

    #[test]
    fn test_lone_pipe_in_open_space_uses_every_turn() {
        let config = PipeConfig {
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        for seed in 0..10 {
            let (mut g, _scene) = grower(config.clone(), seed);
            g.run_to_completion();
            assert_eq!(g.finish_reason(), Some(FinishReason::TurnsExhausted));
            assert_eq!(g.turn_count(), config.maximum_pipe_turns);
        }
    }

    #[test]
    fn test_blocked_turn_near_wall_picks_free_direction() {
        let config = PipeConfig {
            minimum_stretch_distance: 3.0,
            maximum_stretch_distance: 3.0,
            max_blocked_retries: 1,
            boundary_size: Vector3::new(100.0, 100.0, 100.0),
            ..Default::default()
        };
        // One step from the +X wall: only +X is out of reach.
        let (g, _scene) = grower(config, 13);
        let mut g = g.with_start_position(Vector3::new(48.0, 0.0, 0.0));
        g.start(None);
        g.direction = Direction::PosX;

        let events = g.step();
        assert!(g.is_generating());
        assert_eq!(g.blocked_streak, 0);
        assert!(matches!(
            events[0],
            PipeEvent::TurnCreated {
                kind: TurnKind::Avoidance,
                ..
            }
        ));
        assert_eq!(g.segments().len(), 1);
        assert_ne!(g.segments()[0].direction, Direction::PosX);
    }

    #[test]
    fn test_short_stretch_cannot_reenter_own_start() {
        let config = PipeConfig {
            minimum_stretch_distance: 0.5,
            maximum_stretch_distance: 0.5,
            turn_frequency: 1,
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 6);
        g.run_to_completion();

        // The start sphere sits 0.5 behind the first turn and is not adjacent
        // to it, so every move from there is blocked.
        assert_eq!(g.segments().len(), 1);
        assert_eq!(g.finish_reason(), Some(FinishReason::Enclosed));
        assert_eq!(g.turn_count(), 1 + g.config().max_blocked_retries);
    }

    #[test]
    fn test_segments_chain_end_to_start() {
        let config = PipeConfig {
            maximum_pipe_turns: 30,
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 9);
        g.run_to_completion();

        for pair in g.segments().windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
        for s in g.segments() {
            assert_eq!(s.color, g.color());
        }
    }

    #[test]
    fn test_advance_paces_by_speed() {
        let config = PipeConfig {
            speed: 2.0,
            maximum_pipe_turns: 1_000,
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 21);
        assert!(g.advance(1.0).is_empty());

        g.start(None);
        g.advance(0.0);
        assert_eq!(g.segments().len(), 1);

        g.advance(0.25);
        assert_eq!(g.segments().len(), 1);
        g.advance(0.25);
        assert_eq!(g.segments().len(), 2);
        g.advance(1.0);
        assert_eq!(g.segments().len(), 4);
    }

    #[test]
    fn test_live_parameter_changes() {
        let config = PipeConfig {
            maximum_pipe_turns: 1_000,
            turn_frequency: 1,
            boundary_size: huge_boundary(),
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 4);
        g.start(None);
        g.step();
        g.step();
        assert!(g.is_generating());

        assert!(g.set_speed(0.0).is_err());
        assert!(g.set_speed(8.0).is_ok());
        assert_eq!(g.config().speed, 8.0);

        let taken = g.turn_count();
        g.set_max_turns(0);
        assert_eq!(g.config().maximum_pipe_turns, taken);
        g.step();
        assert_eq!(g.state(), PipeState::Finished);
        assert_eq!(g.turn_count(), taken);
    }

    #[test]
    fn test_completion_sent_exactly_once() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let config = PipeConfig {
            maximum_pipe_turns: 3,
            ..Default::default()
        };
        let (mut g, _scene) = grower(config, 2);
        g.start(Some(tx));
        while g.is_generating() {
            g.step();
        }
        g.step();

        assert_eq!(rx.try_recv(), Ok(PipeId(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_color_override_and_drop_releases_geometry() {
        let scene = SceneIndex::shared();
        let other = PipeId(7);
        scene.borrow_mut().register(
            other,
            Shape::Sphere {
                center: Vector3::new(25.0, 0.0, 0.0),
                radius: 0.5,
            },
        );
        let color = Color::new(0.9, 0.1, 0.4);
        let config = PipeConfig {
            pipe_color: Some(color),
            maximum_pipe_turns: 5,
            ..Default::default()
        };
        {
            let mut g = PipeGrower::new(PipeId(1), config, scene.clone(), 8).unwrap();
            g.run_to_completion();
            assert_eq!(g.color(), color);
            assert!(scene.borrow().count_owned_by(PipeId(1)) > 0);
        }
        assert_eq!(scene.borrow().count_owned_by(PipeId(1)), 0);
        assert_eq!(scene.borrow().count_owned_by(other), 1);
    }

    #[test]
    fn test_drop_while_scene_borrowed_does_not_panic() {
        let scene = SceneIndex::shared();
        let mut g = PipeGrower::new(PipeId(3), PipeConfig::default(), scene.clone(), 1).unwrap();
        g.start(None);

        let held = scene.borrow();
        drop(g);
        assert_eq!(held.count_owned_by(PipeId(3)), 1);
        drop(held);

        scene.borrow_mut().release_owner(PipeId(3));
        assert!(scene.borrow().is_empty());
    }

    #[test]
    fn test_invalid_config_rejected_up_front() {
        let config = PipeConfig {
            minimum_stretch_distance: 8.0,
            maximum_stretch_distance: 4.0,
            ..Default::default()
        };
        assert!(PipeGrower::new(PipeId(1), config, SceneIndex::shared(), 0).is_err());
    }
}
