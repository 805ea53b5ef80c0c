// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Double-buffered 3D grids.
//!
//! A [`GridQuantity`] owns two backend buffers and an index saying which one
//! is `current`. Passes read `current` and write `next`; [`GridQuantity::swap`]
//! flips the index, so no cell data is ever copied to commit a pass.

use crate::config::{MAX_GRID_SIZE, MIN_GRID_SIZE};
use crate::error::{SimResult, SimulatorError};
use crate::slab::SlabBackend;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QuantityKind {
    Scalar,
    Vector,
}

impl QuantityKind {
    /// Components per cell in host-side flat arrays.
    pub fn components(self) -> usize {
        match self {
            QuantityKind::Scalar => 1,
            QuantityKind::Vector => 3,
        }
    }
}

/// Resolution of the cubic domain. Shared by every quantity of a simulator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GridDims {
    size: u32,
}

impl GridDims {
    pub fn new(size: u32) -> SimResult<Self> {
        if !(MIN_GRID_SIZE..=MAX_GRID_SIZE).contains(&size) {
            return Err(SimulatorError::InvalidResolution {
                size,
                min: MIN_GRID_SIZE,
                max: MAX_GRID_SIZE,
            });
        }
        Ok(Self { size })
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.size
    }

    #[inline]
    pub fn layer_cells(&self) -> usize {
        (self.size * self.size) as usize
    }

    #[inline]
    pub fn cell_count(&self) -> usize {
        self.layer_cells() * self.size as usize
    }

    /// Linear cell index, x fastest then y then z (layer).
    #[inline]
    pub fn index(&self, x: u32, y: u32, z: u32) -> usize {
        ((z * self.size + y) * self.size + x) as usize
    }

    /// Index of the cell nearest to `(x, y, z)` inside the grid.
    #[inline]
    pub fn clamped_index(&self, x: i32, y: i32, z: i32) -> usize {
        let max = self.size as i32 - 1;
        self.index(
            x.clamp(0, max) as u32,
            y.clamp(0, max) as u32,
            z.clamp(0, max) as u32,
        )
    }

    /// True for cells on the outer 1-cell shell.
    #[inline]
    pub fn is_shell(&self, x: u32, y: u32, z: u32) -> bool {
        let max = self.size - 1;
        x == 0 || y == 0 || z == 0 || x == max || y == max || z == max
    }

    pub fn layer_target(&self, layer: u32) -> LayerTarget {
        LayerTarget {
            layer,
            first_cell: layer as usize * self.layer_cells(),
            cells: self.layer_cells(),
        }
    }
}

/// Writable view of one z-layer of a grid buffer, in cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayerTarget {
    pub layer: u32,
    pub first_cell: usize,
    pub cells: usize,
}

impl LayerTarget {
    pub fn end_cell(&self) -> usize {
        self.first_cell + self.cells
    }
}

/// What every backend buffer can report about itself.
pub trait GridStorage {
    fn dims(&self) -> GridDims;
    fn kind(&self) -> QuantityKind;
    /// Number of cells the allocation can actually hold.
    fn cell_capacity(&self) -> usize;
}

/// One simulated field: a ping-pong pair of buffers.
pub struct GridQuantity<B: SlabBackend> {
    name: &'static str,
    kind: QuantityKind,
    dims: GridDims,
    buffers: [B::Buffer; 2],
    current: usize,
}

impl<B: SlabBackend> GridQuantity<B> {
    /// Allocates both buffers and fills each from `initial_data`
    /// (`N³ × components` values).
    pub fn generate(
        backend: &mut B,
        name: &'static str,
        dims: GridDims,
        kind: QuantityKind,
        initial_data: &[f32],
    ) -> SimResult<Self> {
        let first = allocate_buffer(backend, name, dims, kind, initial_data)?;
        let second = allocate_buffer(backend, name, dims, kind, initial_data)?;
        Ok(Self {
            name,
            kind,
            dims,
            buffers: [first, second],
            current: 0,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> QuantityKind {
        self.kind
    }

    pub fn dims(&self) -> GridDims {
        self.dims
    }

    pub fn current(&self) -> &B::Buffer {
        &self.buffers[self.current]
    }

    pub fn current_mut(&mut self) -> &mut B::Buffer {
        &mut self.buffers[self.current]
    }

    pub fn next(&self) -> &B::Buffer {
        &self.buffers[1 - self.current]
    }

    pub fn next_mut(&mut self) -> &mut B::Buffer {
        &mut self.buffers[1 - self.current]
    }

    /// Borrows `current` for reading and `next` for writing at the same time.
    pub fn split(&mut self) -> (&B::Buffer, &mut B::Buffer) {
        let [a, b] = &mut self.buffers;
        if self.current == 0 {
            (&*a, b)
        } else {
            (&*b, a)
        }
    }

    /// Commits `next` as the new `current`.
    pub fn swap(&mut self) {
        self.current = 1 - self.current;
    }

    /// Exchanges the `next` buffer with a scratch buffer.
    pub fn swap_next_with(&mut self, scratch: &mut B::Buffer) {
        std::mem::swap(self.next_mut(), scratch);
    }

    /// Exchanges the `current` buffer with a scratch buffer.
    pub fn swap_current_with(&mut self, scratch: &mut B::Buffer) {
        std::mem::swap(self.current_mut(), scratch);
    }

    /// The N per-layer targets of the `next` buffer.
    pub fn layer_targets(&self) -> impl Iterator<Item = LayerTarget> + '_ {
        (0..self.dims.size()).map(move |layer| self.dims.layer_target(layer))
    }
}

/// Allocates one standalone buffer, checking length and every layer target.
pub fn allocate_buffer<B: SlabBackend>(
    backend: &mut B,
    name: &'static str,
    dims: GridDims,
    kind: QuantityKind,
    initial_data: &[f32],
) -> SimResult<B::Buffer> {
    let expected = dims.cell_count() * kind.components();
    if initial_data.len() != expected {
        return Err(SimulatorError::InitialDataLength {
            quantity: name,
            expected,
            actual: initial_data.len(),
        });
    }
    let buffer = backend.allocate(name, dims, kind, initial_data)?;
    for layer in 0..dims.size() {
        if dims.layer_target(layer).end_cell() > buffer.cell_capacity() {
            return Err(SimulatorError::LayerTargetSetup { quantity: name, layer });
        }
    }
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::CpuBackend;

    #[test]
    fn dims_reject_out_of_range_sizes() {
        assert!(GridDims::new(2).is_err());
        assert!(GridDims::new(MAX_GRID_SIZE + 1).is_err());
        assert_eq!(GridDims::new(32).unwrap().cell_count(), 32 * 32 * 32);
    }

    #[test]
    fn shell_detection() {
        let dims = GridDims::new(8).unwrap();
        assert!(dims.is_shell(0, 3, 3));
        assert!(dims.is_shell(3, 7, 3));
        assert!(!dims.is_shell(1, 6, 3));
        let shell = (0..8)
            .flat_map(|z| (0..8).flat_map(move |y| (0..8).map(move |x| (x, y, z))))
            .filter(|&(x, y, z)| dims.is_shell(x, y, z))
            .count();
        assert_eq!(shell, 8 * 8 * 8 - 6 * 6 * 6);
    }

    #[test]
    fn generate_rejects_wrong_data_length() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(8).unwrap();
        let result = GridQuantity::generate(&mut backend, "velocity", dims, QuantityKind::Vector, &[0.0; 8]);
        assert!(matches!(
            result,
            Err(SimulatorError::InitialDataLength { expected: 1536, actual: 8, .. })
        ));
    }

    #[test]
    fn swap_exchanges_roles_without_copying() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(4).unwrap();
        let mut q = GridQuantity::generate(&mut backend, "pressure", dims, QuantityKind::Scalar, &vec![0.0; 64]).unwrap();
        q.next_mut().data_mut()[0] = 5.0;
        assert_eq!(q.current().data()[0], 0.0);
        q.swap();
        assert_eq!(q.current().data()[0], 5.0);
        assert_eq!(q.next().data()[0], 0.0);
        q.swap();
        assert_eq!(q.current().data()[0], 0.0);
    }

    #[test]
    fn scratch_exchange_moves_buffers() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(4).unwrap();
        let mut q = GridQuantity::generate(&mut backend, "velocity", dims, QuantityKind::Scalar, &vec![1.0; 64]).unwrap();
        let mut scratch = allocate_buffer(&mut backend, "temp", dims, QuantityKind::Scalar, &vec![2.0; 64]).unwrap();
        q.swap_next_with(&mut scratch);
        assert_eq!(q.next().data()[0], 2.0);
        assert_eq!(scratch.data()[0], 1.0);
        scratch.data_mut()[0] = 3.0;
        q.swap_current_with(&mut scratch);
        assert_eq!(q.current().data()[0], 3.0);
        assert_eq!(scratch.data()[0], 1.0);
        assert_eq!(q.next().data()[0], 2.0);
    }

    #[test]
    fn layer_targets_cover_the_whole_buffer() {
        let mut backend = CpuBackend::new();
        let dims = GridDims::new(32).unwrap();
        let q = GridQuantity::generate(&mut backend, "level set", dims, QuantityKind::Scalar, &vec![0.0; dims.cell_count()]).unwrap();
        let targets: Vec<_> = q.layer_targets().collect();
        assert_eq!(targets.len(), 32);
        assert_eq!(targets[0].first_cell, 0);
        assert_eq!(targets[31].end_cell(), 32 * 32 * 32);
        assert_eq!(q.current().cell_capacity(), 32 * 32 * 32);
    }
}
