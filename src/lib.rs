// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Free-surface fluid in a closed cube.
//!
//! Velocity, a level set (negative inside the fluid) and pressure live on an
//! `N³` grid. Each frame runs a fixed sequence of stencil passes, each one
//! dispatched per z-layer into the other half of a double buffer. The passes
//! execute on a [`SlabBackend`]: [`CpuBackend`] (rayon) or [`GpuBackend`] (wgpu).

pub mod config;
pub mod cpu;
pub mod diagnostics;
pub mod error;
pub mod force;
pub mod gpu;
pub mod grid;
pub mod simulator;
pub mod slab;
pub mod stencil;

pub use config::SimulationConfig;
pub use cpu::{reference_programs, CpuBackend, CpuGrid};
pub use diagnostics::FieldStats;
pub use error::{SimResult, SimulatorError};
pub use force::{force_from_drag, DragState};
pub use gpu::{compile_programs, GpuBackend, GpuGrid};
pub use grid::{GridDims, GridQuantity, QuantityKind};
pub use simulator::{InitialFields, Simulator};
pub use slab::{Dispatcher, Extent, KernelPass, SlabBackend, SlabParams, StencilPrograms};
