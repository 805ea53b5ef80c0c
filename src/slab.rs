// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Slab operations: stencil passes dispatched once per grid layer.
//!
//! A [`KernelPass`] pairs a compiled program with its ordered input bindings
//! and an [`Extent`]. The [`Dispatcher`] runs a pass over the layers its
//! extent selects and writes only into the target buffer it is handed; it
//! never swaps. Committing the result is the caller's decision.

use glam::Vec3;
use std::ops::Range;

use crate::error::{SimResult, SimulatorError};
use crate::grid::{GridDims, GridStorage, LayerTarget, QuantityKind};

/// Which cells a pass addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Extent {
    /// Layers `1..=N-2`, in-plane `[1, N-2]²`. The outer shell is never written.
    Interior,
    /// Every layer, the full `N × N` plane. Used to enforce wall conditions.
    Boundary,
}

impl Extent {
    pub fn layers(self, dims: GridDims) -> Range<u32> {
        match self {
            Extent::Interior => 1..dims.size() - 1,
            Extent::Boundary => 0..dims.size(),
        }
    }

    /// In-plane range used for both x and y.
    pub fn plane(self, dims: GridDims) -> Range<u32> {
        self.layers(dims)
    }

    pub fn cells_per_layer(self, dims: GridDims) -> usize {
        let side = self.plane(dims).len();
        side * side
    }

    /// Cells one full dispatch of this extent writes.
    pub fn addressed_cells(self, dims: GridDims) -> usize {
        self.cells_per_layer(dims) * self.layers(dims).len()
    }
}

/// Values supplied per dispatch. Nothing else is visible to a stencil
/// besides its bound inputs and the program's own constants.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SlabParams {
    pub time_step_us: u32,
    pub force: Vec3,
}

impl SlabParams {
    pub fn new(time_step_us: u32) -> Self {
        Self {
            time_step_us,
            force: Vec3::ZERO,
        }
    }

    pub fn with_force(mut self, force: Vec3) -> Self {
        self.force = force;
        self
    }

    pub fn dt_seconds(&self) -> f32 {
        self.time_step_us as f32 * 1.0e-6
    }
}

/// Execution seam between the orchestration and wherever cells are computed.
pub trait SlabBackend {
    type Buffer: GridStorage;
    type Program;

    fn allocate(
        &mut self,
        name: &'static str,
        dims: GridDims,
        kind: QuantityKind,
        data: &[f32],
    ) -> SimResult<Self::Buffer>;

    /// Overwrites every cell of `buffer` with host data.
    fn upload(&mut self, buffer: &mut Self::Buffer, data: &[f32]);

    /// Host copy of every cell, `N³ × components` values.
    fn read_back(&mut self, buffer: &Self::Buffer) -> Vec<f32>;

    /// Number of input grids the program reads, in binding order.
    fn input_count(&self, program: &Self::Program) -> usize;

    /// Executes `program` once for each layer target, addressing the in-plane
    /// cells `extent` selects. Must not touch any other cell of `target`.
    fn dispatch_layers(
        &mut self,
        program: &Self::Program,
        inputs: &[&Self::Buffer],
        target: &mut Self::Buffer,
        layers: &[LayerTarget],
        extent: Extent,
        params: &SlabParams,
    );

    /// Makes all recorded work visible to the next read.
    fn flush(&mut self) {}
}

/// One stencil program bound to its named inputs.
pub struct KernelPass<P> {
    name: &'static str,
    extent: Extent,
    program: P,
    bindings: Vec<&'static str>,
}

impl<P> KernelPass<P> {
    pub fn interior<B>(backend: &B, name: &'static str, program: P, bindings: &[&'static str]) -> SimResult<Self>
    where
        B: SlabBackend<Program = P>,
    {
        Self::bind(backend, name, Extent::Interior, program, bindings)
    }

    pub fn boundary<B>(backend: &B, name: &'static str, program: P, bindings: &[&'static str]) -> SimResult<Self>
    where
        B: SlabBackend<Program = P>,
    {
        Self::bind(backend, name, Extent::Boundary, program, bindings)
    }

    fn bind<B>(
        backend: &B,
        name: &'static str,
        extent: Extent,
        program: P,
        bindings: &[&'static str],
    ) -> SimResult<Self>
    where
        B: SlabBackend<Program = P>,
    {
        let expected = backend.input_count(&program);
        if expected != bindings.len() {
            return Err(SimulatorError::binding(
                name,
                format!("program reads {expected} grids but {} were bound", bindings.len()),
            ));
        }
        Ok(Self {
            name,
            extent,
            program,
            bindings: bindings.to_vec(),
        })
    }
}

/// The full program set a simulator is built from, one per pass.
pub struct StencilPrograms<P> {
    pub advect_velocity: P,
    pub advect_level_set: P,
    pub diffusion: P,
    pub force: P,
    pub pass_through: P,
    pub divergence: P,
    pub pressure_poisson: P,
    pub remove_divergence: P,
    pub boundary_velocity: P,
    pub boundary_level_set: P,
    pub boundary_pressure: P,
    pub clear_slabs: P,
}

pub struct Dispatcher<B: SlabBackend> {
    backend: B,
    dims: GridDims,
}

impl<B: SlabBackend> Dispatcher<B> {
    pub fn new(backend: B, dims: GridDims) -> Self {
        Self { backend, dims }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    /// Runs `pass` over the layers of its extent, writing into `target`.
    pub fn apply(
        &mut self,
        pass: &KernelPass<B::Program>,
        inputs: &[&B::Buffer],
        target: &mut B::Buffer,
        params: SlabParams,
    ) {
        let layers = pass.extent.layers(self.dims);
        self.apply_layers(pass, inputs, target, params, layers);
    }

    /// Runs `pass` for `layer_from..layer_to` only.
    pub fn apply_layers(
        &mut self,
        pass: &KernelPass<B::Program>,
        inputs: &[&B::Buffer],
        target: &mut B::Buffer,
        params: SlabParams,
        layers: Range<u32>,
    ) {
        assert_eq!(
            inputs.len(),
            pass.bindings.len(),
            "{}: expected inputs {:?}",
            pass.name,
            pass.bindings
        );
        assert!(
            layers.end <= self.dims.size(),
            "{}: layer range {:?} outside a {}-layer grid",
            pass.name,
            layers,
            self.dims.size()
        );
        assert_eq!(target.dims(), self.dims, "{}: target grid has the wrong resolution", pass.name);

        let targets: Vec<LayerTarget> = layers.clone().map(|layer| self.dims.layer_target(layer)).collect();
        for layer in &targets {
            assert!(
                layer.end_cell() <= target.cell_capacity(),
                "{}: layer target {} is incomplete",
                pass.name,
                layer.layer
            );
        }
        log::trace!("{} over layers {:?} ({:?})", pass.name, layers, pass.extent);
        self.backend
            .dispatch_layers(&pass.program, inputs, target, &targets, pass.extent, &params);
    }

    pub fn flush(&mut self) {
        self.backend.flush();
    }

    pub fn read_back(&mut self, buffer: &B::Buffer) -> Vec<f32> {
        self.backend.read_back(buffer)
    }

    pub fn upload(&mut self, buffer: &mut B::Buffer, data: &[f32]) {
        self.backend.upload(buffer, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::{CpuBackend, CpuProgram};
    use crate::grid::{allocate_buffer, GridQuantity};
    use crate::stencil::{CellContext, StencilInputs, StencilProgram};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Writes the frame counter (carried in `time_step_us`) and flags any
    /// read that does not see the previous frame's value.
    struct FrameStamp {
        stale_read: AtomicBool,
    }

    impl StencilProgram for FrameStamp {
        fn name(&self) -> &'static str {
            "frame stamp"
        }

        fn inputs(&self) -> usize {
            1
        }

        fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
            let expected = ctx.time_step_us as f32 - 1.0;
            for (dx, dy, dz) in [(0, 0, 0), (1, 0, 0), (-1, 0, 0), (0, 1, 0), (0, -1, 0), (0, 0, 1), (0, 0, -1)] {
                if inputs.scalar_at(0, ctx.x + dx, ctx.y + dy, ctx.z + dz) != expected {
                    self.stale_read.store(true, Ordering::Relaxed);
                }
            }
            out[0] = ctx.time_step_us as f32;
        }
    }

    struct Fill(f32);

    impl StencilProgram for Fill {
        fn name(&self) -> &'static str {
            "fill"
        }

        fn inputs(&self) -> usize {
            0
        }

        fn evaluate(&self, _ctx: &CellContext, _inputs: &StencilInputs<'_>, out: &mut [f32]) {
            out.iter_mut().for_each(|v| *v = self.0);
        }
    }

    struct CountCells(AtomicUsize);

    impl StencilProgram for CountCells {
        fn name(&self) -> &'static str {
            "count"
        }

        fn inputs(&self) -> usize {
            0
        }

        fn evaluate(&self, _ctx: &CellContext, _inputs: &StencilInputs<'_>, out: &mut [f32]) {
            self.0.fetch_add(1, Ordering::Relaxed);
            out[0] = 1.0;
        }
    }

    fn scalar_quantity(backend: &mut CpuBackend, size: u32, value: f32) -> GridQuantity<CpuBackend> {
        let dims = GridDims::new(size).unwrap();
        GridQuantity::generate(backend, "test", dims, QuantityKind::Scalar, &vec![value; dims.cell_count()]).unwrap()
    }

    #[test]
    fn binding_count_mismatch_is_a_construction_error() {
        let backend = CpuBackend::new();
        let program: CpuProgram = Arc::new(Fill(1.0));
        let result = KernelPass::interior(&backend, "fill", program, &["quantity"]);
        assert!(matches!(result, Err(SimulatorError::ProgramBinding { program: "fill", .. })));
    }

    #[test]
    fn reads_never_observe_writes_of_the_same_pass() {
        let mut backend = CpuBackend::new();
        let mut quantity = scalar_quantity(&mut backend, 8, 0.0);
        let stamp = Arc::new(FrameStamp {
            stale_read: AtomicBool::new(false),
        });
        let program: CpuProgram = stamp.clone();
        let pass = KernelPass::boundary(&backend, "stamp", program, &["quantity"]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, quantity.dims());

        for frame in 1..=6u32 {
            let (current, next) = quantity.split();
            dispatcher.apply(&pass, &[current], next, SlabParams::new(frame));
            quantity.swap();
            assert!(
                quantity.current().data().iter().all(|&v| v == frame as f32),
                "current must equal what the pass wrote into next"
            );
        }
        assert!(!stamp.stale_read.load(Ordering::Relaxed));
    }

    #[test]
    fn interior_pass_leaves_the_shell_bit_identical() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(10).unwrap();
        let initial: Vec<f32> = (0..dims.cell_count()).map(|i| i as f32 * 0.5).collect();
        let mut target = allocate_buffer(&mut backend, "target", dims, QuantityKind::Scalar, &initial).unwrap();
        let program: CpuProgram = Arc::new(Fill(-7.0));
        let pass = KernelPass::interior(&backend, "fill", program, &[]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, dims);

        dispatcher.apply(&pass, &[], &mut target, SlabParams::new(16_000));

        for z in 0..10 {
            for y in 0..10 {
                for x in 0..10 {
                    let idx = dims.index(x, y, z);
                    if dims.is_shell(x, y, z) {
                        assert_eq!(target.data()[idx].to_bits(), initial[idx].to_bits());
                    } else {
                        assert_eq!(target.data()[idx], -7.0);
                    }
                }
            }
        }
    }

    #[test]
    fn boundary_pass_covers_every_cell() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(6).unwrap();
        let mut target = allocate_buffer(&mut backend, "target", dims, QuantityKind::Vector, &vec![0.0; dims.cell_count() * 3]).unwrap();
        let program: CpuProgram = Arc::new(Fill(2.0));
        let pass = KernelPass::boundary(&backend, "fill", program, &[]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, dims);
        dispatcher.apply(&pass, &[], &mut target, SlabParams::new(1));
        assert!(target.data().iter().all(|&v| v == 2.0));
    }

    #[test]
    fn interior_pass_addresses_thirty_cubed_cells_on_a_32_grid() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(32).unwrap();
        let mut target = allocate_buffer(&mut backend, "target", dims, QuantityKind::Scalar, &vec![0.0; dims.cell_count()]).unwrap();
        let counter = Arc::new(CountCells(AtomicUsize::new(0)));
        let program: CpuProgram = counter.clone();
        let pass = KernelPass::interior(&backend, "count", program, &[]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, dims);
        dispatcher.apply(&pass, &[], &mut target, SlabParams::new(1));

        assert_eq!(counter.0.load(Ordering::Relaxed), 30 * 30 * 30);
        assert_eq!(Extent::Interior.addressed_cells(dims), 30 * 30 * 30);
        assert_eq!(Extent::Boundary.addressed_cells(dims), 32 * 32 * 32);
        assert_eq!(target.data().iter().filter(|&&v| v == 1.0).count(), 30 * 30 * 30);
    }

    #[test]
    fn explicit_layer_range_limits_the_dispatch() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(8).unwrap();
        let mut target = allocate_buffer(&mut backend, "target", dims, QuantityKind::Scalar, &vec![0.0; dims.cell_count()]).unwrap();
        let program: CpuProgram = Arc::new(Fill(1.0));
        let pass = KernelPass::boundary(&backend, "fill", program, &[]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, dims);
        dispatcher.apply_layers(&pass, &[], &mut target, SlabParams::new(1), 2..4);
        for z in 0..8 {
            let written = (0..64).all(|i| target.data()[z as usize * 64 + i] == 1.0);
            assert_eq!(written, (2..4).contains(&z), "layer {z}");
        }
    }

    #[test]
    #[should_panic(expected = "expected inputs")]
    fn dispatch_with_missing_inputs_fails_loudly() {
        let mut backend = CpuBackend::new();
        let mut quantity = scalar_quantity(&mut backend, 6, 0.0);
        let stamp: CpuProgram = Arc::new(FrameStamp {
            stale_read: AtomicBool::new(false),
        });
        let pass = KernelPass::boundary(&backend, "stamp", stamp, &["quantity"]).unwrap();
        let mut dispatcher = Dispatcher::new(backend, quantity.dims());
        dispatcher.apply(&pass, &[], quantity.next_mut(), SlabParams::new(1));
    }
}
