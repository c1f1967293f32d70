//! Engine configuration.
//!
//! Every struct has a `Default`, and [`EngineConfig`] can be read from JSON
//! with missing fields filled from the defaults:
//!
//! ```
//! use ember_engine::config::EngineConfig;
//!
//! let config = EngineConfig::from_json(r#"{ "transform": { "frustum_culling": false } }"#).unwrap();
//! assert!(!config.transform.frustum_culling);
//! assert!(config.transform.distance_culling);
//! assert_eq!(config.tick.max_command_rounds, 64);
//! ```

use serde::{Deserialize, Serialize};

use crate::EngineError;

/// Configuration for the fixed-timestep tick loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TickConfig {
    /// Fixed time step in seconds per tick. Must be positive and finite.
    pub fixed_dt: f64,
    /// Command-buffer rounds the world applies per logical update before
    /// discarding the rest.
    pub max_command_rounds: usize,
}

impl Default for TickConfig {
    /// 60 Hz, with the world's default round limit.
    fn default() -> Self {
        Self {
            fixed_dt: 1.0 / 60.0,
            max_command_rounds: ember_ecs::world::DEFAULT_MAX_COMMAND_ROUNDS,
        }
    }
}

impl TickConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(self.fixed_dt > 0.0 && self.fixed_dt.is_finite()) {
            return Err(EngineError::InvalidConfig {
                details: format!("fixed_dt must be positive and finite, got {}", self.fixed_dt),
            });
        }
        if self.max_command_rounds == 0 {
            return Err(EngineError::InvalidConfig {
                details: "max_command_rounds must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Culling settings for the [`TransformGraph`](crate::graph::TransformGraph).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// View distance for nodes whose [`CullBounds`](crate::components::CullBounds)
    /// do not set one, or that have no bounds at all.
    pub default_cull_distance: f32,
    pub frustum_culling: bool,
    pub distance_culling: bool,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            default_cull_distance: 500.0,
            frustum_culling: true,
            distance_culling: true,
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.default_cull_distance.is_nan() || self.default_cull_distance <= 0.0 {
            return Err(EngineError::InvalidConfig {
                details: format!(
                    "default_cull_distance must be positive, got {}",
                    self.default_cull_distance
                ),
            });
        }
        Ok(())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick: TickConfig,
    pub transform: TransformConfig,
}

impl EngineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json(text: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            serde_json::from_str(text).map_err(|e| EngineError::InvalidConfig {
                details: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.tick.validate()?;
        self.transform.validate()
    }
}
