// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Host-side field statistics for logging and tests.

use image::{GrayImage, Luma};
use rayon::prelude::*;

use crate::cpu::CpuGrid;
use crate::grid::{GridDims, QuantityKind};
use crate::stencil::{divergence_at, StencilInputs};

/// Summary of one simulator state, computed from read-back fields.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FieldStats {
    /// Fraction of cells with a negative level set.
    pub fluid_fraction: f32,
    pub level_set_min: f32,
    pub level_set_max: f32,
    pub max_speed: f32,
    /// Mean |∇·v| over interior cells.
    pub mean_divergence: f32,
}

impl FieldStats {
    pub fn from_fields(dims: GridDims, level_set: &[f32], velocity: &[f32]) -> Self {
        let fluid = level_set.iter().filter(|&&phi| phi < 0.0).count();
        let (level_set_min, level_set_max) = level_set
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &phi| (lo.min(phi), hi.max(phi)));
        let max_speed = velocity
            .par_chunks(3)
            .map(|v| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt())
            .reduce(|| 0.0, f32::max);

        Self {
            fluid_fraction: fluid as f32 / level_set.len().max(1) as f32,
            level_set_min,
            level_set_max,
            max_speed,
            mean_divergence: mean_abs_divergence(dims, velocity),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.level_set_min.is_finite()
            && self.level_set_max.is_finite()
            && self.max_speed.is_finite()
            && self.mean_divergence.is_finite()
    }
}

/// Mean absolute face divergence over the interior cells.
pub fn mean_abs_divergence(dims: GridDims, velocity: &[f32]) -> f32 {
    let grid = CpuGrid::from_data(dims, QuantityKind::Vector, velocity.to_vec());
    let grids = [&grid];
    let inputs = StencilInputs::new(&grids);
    let inner = 1..dims.size() as i32 - 1;

    let total: f64 = inner
        .clone()
        .into_par_iter()
        .map(|z| {
            let mut sum = 0.0f64;
            for y in inner.clone() {
                for x in inner.clone() {
                    sum += divergence_at(&inputs, 0, x, y, z).abs() as f64;
                }
            }
            sum
        })
        .sum();
    let cells = inner.len().pow(3);
    (total / cells as f64) as f32
}

/// Height of the first sign change of the level set along the vertical
/// column through `(x, z)`, interpolated between cells.
pub fn surface_height(dims: GridDims, level_set: &[f32], x: u32, z: u32) -> Option<f32> {
    (0..dims.size() - 1).find_map(|y| {
        let below = level_set[dims.index(x, y, z)];
        let above = level_set[dims.index(x, y + 1, z)];
        (below < 0.0 && above >= 0.0).then(|| y as f32 + below / (below - above))
    })
}

/// Grayscale image of one z-layer of the level set: fluid dark, air light,
/// `band` cells of level set mapped across the full range. Row 0 is the top.
pub fn level_set_slice(dims: GridDims, level_set: &[f32], z: u32, band: f32) -> GrayImage {
    let n = dims.size();
    GrayImage::from_fn(n, n, |x, row| {
        let phi = level_set[dims.index(x, n - 1 - row, z)];
        let shade = (0.5 + 0.5 * phi / band).clamp(0.0, 1.0);
        Luma([(shade * 255.0).round() as u8])
    })
}
