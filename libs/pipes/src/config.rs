use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{PipesError, Result};
use crate::geometry::{Bounds, Color};

/// Parameters for a single grower.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipeConfig {
    /// Turns before the pipe finishes.
    pub maximum_pipe_turns: u32,
    pub minimum_stretch_distance: f32,
    pub maximum_stretch_distance: f32,
    /// Segments per second.
    pub speed: f32,
    pub pipe_radius: f32,
    pub turn_sphere_radius: f32,
    /// Straight segments before a scheduled turn.
    pub turn_frequency: u32,
    /// Picked at random when unset.
    pub pipe_color: Option<Color>,
    /// Full extent of the containment box on each axis.
    pub boundary_size: Vector3<f32>,
    /// Consecutive turns with every candidate direction blocked before the
    /// pipe gives up as enclosed.
    pub max_blocked_retries: u32,
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            maximum_pipe_turns: 200,
            minimum_stretch_distance: 3.0,
            maximum_stretch_distance: 10.0,
            speed: 1.0,
            pipe_radius: 0.5,
            turn_sphere_radius: 0.7,
            turn_frequency: 5,
            pipe_color: None,
            boundary_size: Vector3::new(60.0, 30.0, 60.0),
            max_blocked_retries: 16,
        }
    }
}

impl PipeConfig {
    pub fn validate(&self) -> Result<()> {
        for d in [self.minimum_stretch_distance, self.maximum_stretch_distance] {
            if !d.is_finite() || d <= 0.0 {
                return Err(PipesError::InvalidStretch(d));
            }
        }
        if self.minimum_stretch_distance > self.maximum_stretch_distance {
            return Err(PipesError::StretchRange {
                min: self.minimum_stretch_distance,
                max: self.maximum_stretch_distance,
            });
        }
        validate_speed(self.speed)?;
        for (name, value) in [
            ("pipe radius", self.pipe_radius),
            ("turn sphere radius", self.turn_sphere_radius),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(PipesError::NonPositiveRadius { name, value });
            }
        }
        if self.turn_frequency == 0 {
            return Err(PipesError::ZeroTurnFrequency);
        }
        if self.bounds().is_empty() {
            return Err(PipesError::EmptyBoundary);
        }
        Ok(())
    }

    pub fn bounds(&self) -> Bounds {
        Bounds::from_size(self.boundary_size)
    }

    /// Radius swept along collision rays.
    ///
    /// Turn spheres are dropped later on endpoints that were only checked
    /// against the thinner segment, so the sweep also covers that difference.
    pub fn clearance(&self) -> f32 {
        let widest = self.pipe_radius.max(self.turn_sphere_radius);
        widest + (widest - self.pipe_radius)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}

pub(crate) fn validate_speed(speed: f32) -> Result<()> {
    if !speed.is_finite() || speed <= 0.0 {
        return Err(PipesError::NonPositiveSpeed(speed));
    }
    Ok(())
}

/// Parameters for a pool of growers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub desired_active_pipe_count: usize,
    pub max_pipes_on_screen: usize,
    pub min_pipe_turns: u32,
    pub max_pipe_turns: u32,
    pub pipe_speed: f32,
    pub boundary_size: Vector3<f32>,
    /// Finished-pipe records kept before the oldest are dropped.
    pub max_finished_history: usize,
    pub seed: u64,
    /// Template for everything the pool does not pick per pipe.
    pub pipe: PipeConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            desired_active_pipe_count: 1,
            max_pipes_on_screen: 7,
            min_pipe_turns: 100,
            max_pipe_turns: 200,
            pipe_speed: 1.0,
            boundary_size: Vector3::new(60.0, 30.0, 60.0),
            max_finished_history: 64,
            seed: 0,
            pipe: PipeConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_pipes_on_screen == 0 {
            return Err(PipesError::ZeroCapacity);
        }
        if self.min_pipe_turns > self.max_pipe_turns {
            return Err(PipesError::TurnRange {
                min: self.min_pipe_turns,
                max: self.max_pipe_turns,
            });
        }
        validate_speed(self.pipe_speed)?;
        self.pipe_config(self.max_pipe_turns).validate()
    }

    /// Active growers the pool aims for, never above the on-screen cap.
    pub fn target_active(&self) -> usize {
        self.desired_active_pipe_count.min(self.max_pipes_on_screen)
    }

    /// Config handed to a new grower with the given turn budget.
    pub fn pipe_config(&self, maximum_pipe_turns: u32) -> PipeConfig {
        PipeConfig {
            maximum_pipe_turns,
            speed: self.pipe_speed,
            boundary_size: self.boundary_size,
            ..self.pipe.clone()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
