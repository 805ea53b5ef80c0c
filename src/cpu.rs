// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Host backend: grids live in `Vec<f32>`, passes run as a rayon map over
//! the addressed layers. Every layer reads only the bound input buffers, so
//! layers are computed in parallel without ordering between cells.

use rayon::prelude::*;
use std::sync::Arc;

use crate::config::SimulationConfig;
use crate::error::SimResult;
use crate::grid::{GridDims, GridStorage, LayerTarget, QuantityKind};
use crate::slab::{Extent, SlabBackend, SlabParams, StencilPrograms};
use crate::stencil::{
    AdvectScalar, AdvectVelocity, ApplyForce, BoundaryScalar, BoundaryVelocity, CellContext, ClearSlabs, Diffuse,
    Divergence, PassThrough, PressurePoisson, RemoveDivergence, StencilInputs, StencilProgram,
};

pub type CpuProgram = Arc<dyn StencilProgram>;

#[derive(Clone, Debug)]
pub struct CpuGrid {
    dims: GridDims,
    kind: QuantityKind,
    data: Vec<f32>,
}

impl CpuGrid {
    pub fn from_data(dims: GridDims, kind: QuantityKind, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), dims.cell_count() * kind.components());
        Self { dims, kind, data }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }
}

impl GridStorage for CpuGrid {
    fn dims(&self) -> GridDims {
        self.dims
    }

    fn kind(&self) -> QuantityKind {
        self.kind
    }

    fn cell_capacity(&self) -> usize {
        self.data.len() / self.kind.components()
    }
}

#[derive(Default)]
pub struct CpuBackend {
    dispatches: u64,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layer dispatches executed so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }
}

impl SlabBackend for CpuBackend {
    type Buffer = CpuGrid;
    type Program = CpuProgram;

    fn allocate(
        &mut self,
        _name: &'static str,
        dims: GridDims,
        kind: QuantityKind,
        data: &[f32],
    ) -> SimResult<CpuGrid> {
        Ok(CpuGrid::from_data(dims, kind, data.to_vec()))
    }

    fn upload(&mut self, buffer: &mut CpuGrid, data: &[f32]) {
        buffer.data.copy_from_slice(data);
    }

    fn read_back(&mut self, buffer: &CpuGrid) -> Vec<f32> {
        buffer.data.clone()
    }

    fn input_count(&self, program: &CpuProgram) -> usize {
        program.inputs()
    }

    fn dispatch_layers(
        &mut self,
        program: &CpuProgram,
        inputs: &[&CpuGrid],
        target: &mut CpuGrid,
        layers: &[LayerTarget],
        extent: Extent,
        params: &SlabParams,
    ) {
        let dims = target.dims;
        let comps = target.kind.components();
        let plane = extent.plane(dims);
        let size = dims.size() as usize;
        let inputs = StencilInputs::new(inputs);
        let dt = params.dt_seconds();

        let mut selected = vec![false; size];
        for layer in layers {
            selected[layer.layer as usize] = true;
        }

        target
            .data
            .par_chunks_mut(dims.layer_cells() * comps)
            .enumerate()
            .filter(|(z, _)| selected[*z])
            .for_each(|(z, slab)| {
                for y in plane.clone() {
                    for x in plane.clone() {
                        let ctx = CellContext {
                            x: x as i32,
                            y: y as i32,
                            z: z as i32,
                            dims,
                            time_step_us: params.time_step_us,
                            dt,
                            force: params.force,
                        };
                        let start = (y as usize * size + x as usize) * comps;
                        program.evaluate(&ctx, &inputs, &mut slab[start..start + comps]);
                    }
                }
            });
        self.dispatches += layers.len() as u64;
    }
}

/// The reference program set for the host backend.
pub fn reference_programs(config: &SimulationConfig) -> StencilPrograms<CpuProgram> {
    StencilPrograms {
        advect_velocity: Arc::new(AdvectVelocity),
        advect_level_set: Arc::new(AdvectScalar {
            name: "advect level set",
        }),
        diffusion: Arc::new(Diffuse {
            viscosity: config.viscosity,
        }),
        force: Arc::new(ApplyForce {
            gravity: config.gravity_cells(),
            force_gain: config.force_gain,
        }),
        pass_through: Arc::new(PassThrough),
        divergence: Arc::new(Divergence),
        pressure_poisson: Arc::new(PressurePoisson),
        remove_divergence: Arc::new(RemoveDivergence),
        boundary_velocity: Arc::new(BoundaryVelocity),
        boundary_level_set: Arc::new(BoundaryScalar {
            name: "boundary level set",
        }),
        boundary_pressure: Arc::new(BoundaryScalar {
            name: "boundary pressure",
        }),
        clear_slabs: Arc::new(ClearSlabs),
    }
}
