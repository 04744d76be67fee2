//! Error types for pipe growth.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipesError {
    #[error("minimum stretch distance {min} exceeds maximum {max}")]
    StretchRange { min: f32, max: f32 },

    #[error("stretch distances must be positive and finite, got {0}")]
    InvalidStretch(f32),

    #[error("speed must be positive, got {0}")]
    NonPositiveSpeed(f32),

    #[error("boundary must have a positive extent on every axis")]
    EmptyBoundary,

    #[error("{name} must be positive, got {value}")]
    NonPositiveRadius { name: &'static str, value: f32 },

    #[error("turn frequency must be at least 1")]
    ZeroTurnFrequency,

    #[error("minimum pipe turns {min} exceeds maximum {max}")]
    TurnRange { min: u32, max: u32 },

    #[error("max pipes on screen must be at least 1")]
    ZeroCapacity,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PipesError>;
