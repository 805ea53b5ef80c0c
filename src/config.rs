// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{SimResult, SimulatorError};

pub const SETTINGS_FILE_NAME: &str = "fluid_settings.json";

pub const MIN_GRID_SIZE: u32 = 4;
pub const MAX_GRID_SIZE: u32 = 256;

/// Tunables for one simulator instance. Defaults give a 32³ tank; everything
/// here is fixed for the lifetime of a simulator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    pub grid_size: u32,
    pub diffusion_iterations: u32,
    pub pressure_iterations: u32,
    pub gravity: f32,    // m/s², the cube is one metre across
    pub viscosity: f32,  // cells²/s
    pub force_gain: f32, // drag force -> cells/s per µs of frame time
    pub max_frame_time_us: u32,
    /// Longest stretch of time one step integrates; longer frames advance
    /// the fluid by this much only.
    pub max_step_us: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            grid_size: 32,
            diffusion_iterations: 25,
            pressure_iterations: 50,
            gravity: 9.81,
            viscosity: 1.0,
            force_gain: 5.0e3,
            max_frame_time_us: 250_000,
            max_step_us: 16_667,
        }
    }
}

impl SimulationConfig {
    pub fn default_path() -> PathBuf {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(SETTINGS_FILE_NAME)
    }

    pub fn load_from_disk(path: &Path) -> SimResult<Self> {
        let data = fs::read_to_string(path).map_err(|e| SimulatorError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut config: Self = serde_json::from_str(&data).map_err(|e| SimulatorError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.sanitize();
        Ok(config)
    }

    /// Loads the settings file if there is one, falling back to defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from_disk(path) {
            Ok(config) => {
                log::info!("Loaded fluid settings from {}", path.display());
                config
            }
            Err(err) => {
                log::warn!("Ignoring unreadable settings: {err}");
                Self::default()
            }
        }
    }

    pub fn save_to_disk(&self, path: &Path) -> SimResult<()> {
        let to_config_error = |message: String| SimulatorError::Config {
            path: path.to_path_buf(),
            message,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| to_config_error(e.to_string()))?;
            }
        }
        let json = serde_json::to_string_pretty(self).map_err(|e| to_config_error(e.to_string()))?;
        fs::write(path, json).map_err(|e| to_config_error(e.to_string()))?;
        Ok(())
    }

    pub fn sanitize(&mut self) {
        self.grid_size = self.grid_size.clamp(MIN_GRID_SIZE, MAX_GRID_SIZE);
        self.diffusion_iterations = self.diffusion_iterations.clamp(1, 500);
        self.pressure_iterations = self.pressure_iterations.clamp(1, 1000);
        self.gravity = sanitize_f32(self.gravity, 0.0, 100.0, 9.81);
        self.viscosity = sanitize_f32(self.viscosity, 0.0, 1000.0, 1.0);
        self.force_gain = sanitize_f32(self.force_gain, 0.0, 1.0e9, 5.0e3);
        self.max_frame_time_us = self.max_frame_time_us.clamp(1_000, 1_000_000);
        self.max_step_us = self.max_step_us.clamp(1_000, self.max_frame_time_us);
    }

    /// Gravity in cells/s² for the unit-metre cube.
    pub fn gravity_cells(&self) -> f32 {
        self.gravity * self.grid_size as f32
    }
}

fn sanitize_f32(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings() {
        let config = SimulationConfig::default();
        assert_eq!(config.grid_size, 32);
        assert_eq!(config.diffusion_iterations, 25);
        assert_eq!(config.pressure_iterations, 50);
        assert_eq!(config.max_frame_time_us, 250_000);
        assert_eq!(config.max_step_us, 16_667);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: SimulationConfig = serde_json::from_str(r#"{ "pressure_iterations": 7 }"#).unwrap();
        assert_eq!(config.pressure_iterations, 7);
        assert_eq!(config.grid_size, 32);
        assert_eq!(config.viscosity, SimulationConfig::default().viscosity);
    }

    #[test]
    fn retired_fields_are_ignored() {
        let config: SimulationConfig =
            serde_json::from_str(r#"{ "fluid_density": 997.0, "grid_size": 24 }"#).unwrap();
        assert_eq!(config.grid_size, 24);
        assert_eq!(config.force_gain, SimulationConfig::default().force_gain);
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = SimulationConfig {
            grid_size: 1,
            diffusion_iterations: 0,
            pressure_iterations: 0,
            gravity: f32::NAN,
            viscosity: -3.0,
            max_frame_time_us: 40_000,
            max_step_us: 90_000,
            ..Default::default()
        };
        config.sanitize();
        assert_eq!(config.grid_size, MIN_GRID_SIZE);
        assert_eq!(config.diffusion_iterations, 1);
        assert_eq!(config.pressure_iterations, 1);
        assert_eq!(config.gravity, 9.81);
        assert_eq!(config.viscosity, 0.0);
        assert_eq!(config.max_step_us, 40_000);
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("cubefluid-config-{}", std::process::id()));
        let path = dir.join(SETTINGS_FILE_NAME);
        let config = SimulationConfig {
            grid_size: 16,
            pressure_iterations: 12,
            ..Default::default()
        };
        config.save_to_disk(&path).unwrap();
        let loaded = SimulationConfig::load_from_disk(&path).unwrap();
        assert_eq!(loaded, config);
        let _ = fs::remove_dir_all(&dir);
    }
}
