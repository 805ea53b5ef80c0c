// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Error type shared by simulator construction and configuration loading.
//!
//! Only construction can fail. Once a [`crate::Simulator`] exists, stepping,
//! forcing and resetting are infallible; dispatch defects panic instead of
//! returning an error because a skipped layer would silently corrupt the
//! double buffers for the rest of the run.

use std::path::PathBuf;
use thiserror::Error;

pub type SimResult<T> = Result<T, SimulatorError>;

#[derive(Error, Debug)]
pub enum SimulatorError {
    /// Grid resolution outside what the stencils can address.
    #[error("invalid grid resolution {size}: must be between {min} and {max}")]
    InvalidResolution { size: u32, min: u32, max: u32 },

    /// Initial data does not cover the grid exactly.
    #[error("initial data for {quantity} has {actual} values, expected {expected}")]
    InitialDataLength {
        quantity: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("failed to allocate grid buffer for {quantity}: {message}")]
    GridAllocation {
        quantity: &'static str,
        message: String,
    },

    /// A per-layer target could not be set up on a freshly allocated buffer.
    #[error("layer target {layer} of {quantity} is incomplete")]
    LayerTargetSetup { quantity: &'static str, layer: u32 },

    /// A stencil program could not be bound to its declared inputs.
    #[error("stencil program '{program}' could not be bound: {message}")]
    ProgramBinding {
        program: &'static str,
        message: String,
    },

    #[error("GPU initialisation failed: {0}")]
    Gpu(String),

    #[error("settings file {path}: {message}")]
    Config { path: PathBuf, message: String },
}

impl SimulatorError {
    pub fn binding(program: &'static str, message: impl Into<String>) -> Self {
        Self::ProgramBinding {
            program,
            message: message.into(),
        }
    }

    pub fn allocation(quantity: &'static str, message: impl Into<String>) -> Self {
        Self::GridAllocation {
            quantity,
            message: message.into(),
        }
    }
}
