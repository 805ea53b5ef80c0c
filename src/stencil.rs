// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Host-side stencil programs.
//!
//! Each program is a pure per-cell map: it reads its bound input grids at
//! arbitrary cells and writes the components of exactly one output cell.
//! Positions are in cells; time is the pass's `time_step_us`.
//!
//! Velocity component `c` stored at cell `p` is the flow through the face
//! shared with `p - e_c`. Pressure is stored premultiplied by the time step,
//! in cells²/s, so the projection subtracts its gradient directly. A face
//! carries fluid when either cell it separates has a negative level set.

use glam::Vec3;

use crate::cpu::CpuGrid;
use crate::grid::{GridDims, GridStorage};

/// Everything a program may know about the cell it is computing.
#[derive(Clone, Copy, Debug)]
pub struct CellContext {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub dims: GridDims,
    pub time_step_us: u32,
    /// `time_step_us` in seconds.
    pub dt: f32,
    pub force: Vec3,
}

impl CellContext {
    pub fn position(&self) -> Vec3 {
        Vec3::new(self.x as f32, self.y as f32, self.z as f32)
    }

    pub fn is_shell(&self) -> bool {
        self.dims.is_shell(self.x as u32, self.y as u32, self.z as u32)
    }

    /// Nearest cell strictly inside the shell.
    pub fn interior_neighbour(&self) -> (i32, i32, i32) {
        let max = self.dims.size() as i32 - 2;
        (self.x.clamp(1, max), self.y.clamp(1, max), self.z.clamp(1, max))
    }
}

pub trait StencilProgram: Send + Sync {
    fn name(&self) -> &'static str;
    fn inputs(&self) -> usize;
    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]);
}

/// Read-only view of a pass's bound grids. Reads outside the grid clamp
/// to the nearest edge cell.
pub struct StencilInputs<'a> {
    grids: &'a [&'a CpuGrid],
}

impl<'a> StencilInputs<'a> {
    pub fn new(grids: &'a [&'a CpuGrid]) -> Self {
        Self { grids }
    }

    pub fn components(&self, binding: usize) -> usize {
        self.grids[binding].kind().components()
    }

    #[inline]
    pub fn component_at(&self, binding: usize, x: i32, y: i32, z: i32, component: usize) -> f32 {
        let grid = self.grids[binding];
        let comps = grid.kind().components();
        grid.data()[grid.dims().clamped_index(x, y, z) * comps + component]
    }

    #[inline]
    pub fn scalar_at(&self, binding: usize, x: i32, y: i32, z: i32) -> f32 {
        self.component_at(binding, x, y, z, 0)
    }

    #[inline]
    pub fn vector_at(&self, binding: usize, x: i32, y: i32, z: i32) -> Vec3 {
        Vec3::new(
            self.component_at(binding, x, y, z, 0),
            self.component_at(binding, x, y, z, 1),
            self.component_at(binding, x, y, z, 2),
        )
    }

    /// Trilinear interpolation of one component at a position in cells.
    pub fn sample(&self, binding: usize, pos: Vec3, component: usize) -> f32 {
        let max = (self.grids[binding].dims().size() - 1) as f32;
        let p = pos.clamp(Vec3::ZERO, Vec3::splat(max));
        let base = p.floor();
        let t = p - base;
        let (x0, y0, z0) = (base.x as i32, base.y as i32, base.z as i32);

        let c = |dx: i32, dy: i32, dz: i32| self.component_at(binding, x0 + dx, y0 + dy, z0 + dz, component);
        let x00 = lerp(c(0, 0, 0), c(1, 0, 0), t.x);
        let x10 = lerp(c(0, 1, 0), c(1, 1, 0), t.x);
        let x01 = lerp(c(0, 0, 1), c(1, 0, 1), t.x);
        let x11 = lerp(c(0, 1, 1), c(1, 1, 1), t.x);
        lerp(lerp(x00, x10, t.y), lerp(x01, x11, t.y), t.z)
    }

    /// Sum of one component over the six face neighbours.
    pub fn neighbour_sum(&self, binding: usize, x: i32, y: i32, z: i32, component: usize) -> f32 {
        self.component_at(binding, x - 1, y, z, component)
            + self.component_at(binding, x + 1, y, z, component)
            + self.component_at(binding, x, y - 1, z, component)
            + self.component_at(binding, x, y + 1, z, component)
            + self.component_at(binding, x, y, z - 1, component)
            + self.component_at(binding, x, y, z + 1, component)
    }
}

#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Unit offsets of the three axes, indexed by vector component.
const AXES: [(i32, i32, i32); 3] = [(1, 0, 0), (0, 1, 0), (0, 0, 1)];

const NEIGHBOURS: [(i32, i32, i32); 6] = [(-1, 0, 0), (1, 0, 0), (0, -1, 0), (0, 1, 0), (0, 0, -1), (0, 0, 1)];

/// Smallest fluid fraction of a cell spacing allowed between a fluid cell
/// centre and the interface.
const MIN_SURFACE_FRACTION: f32 = 0.01;

/// Fraction of the spacing from a fluid cell (`fluid < 0`) to its air
/// neighbour (`air >= 0`) that lies below the interface.
#[inline]
fn surface_fraction(fluid: f32, air: f32) -> f32 {
    (fluid / (fluid - air)).max(MIN_SURFACE_FRACTION)
}

/// Gravity and the user's drag force on faces that carry fluid.
/// Inputs: velocity, level set.
///
/// Gravity enters as `g (∇φ - ŷ)`. For a level set that is the height above
/// a flat surface this is zero, so the pressure solve only has to carry the
/// motion on top of the hydrostatic state.
pub struct ApplyForce {
    pub gravity: f32,
    pub force_gain: f32,
}

impl StencilProgram for ApplyForce {
    fn name(&self) -> &'static str {
        "apply force"
    }

    fn inputs(&self) -> usize {
        2
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = (ctx.x, ctx.y, ctx.z);
        let phi = inputs.scalar_at(1, x, y, z);
        let drag = ctx.force * (ctx.time_step_us as f32 * self.force_gain);
        for (component, value) in out.iter_mut().enumerate() {
            let (dx, dy, dz) = AXES[component];
            let behind = inputs.scalar_at(1, x - dx, y - dy, z - dz);
            let mut v = inputs.component_at(0, x, y, z, component);
            if phi < 0.0 || behind < 0.0 {
                let rise = if component == 1 { 1.0 } else { 0.0 };
                v += drag[component] + self.gravity * ctx.dt * (phi - behind - rise);
            }
            *value = v;
        }
    }
}

/// Semi-Lagrangian backtrace of the velocity faces.
/// Inputs: velocity (advecting), velocity (advected).
///
/// Each component is traced from its own face centre, with the two other
/// components averaged from the four faces around it.
pub struct AdvectVelocity;

impl StencilProgram for AdvectVelocity {
    fn name(&self) -> &'static str {
        "advect velocity"
    }

    fn inputs(&self) -> usize {
        2
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = (ctx.x, ctx.y, ctx.z);
        for (component, value) in out.iter_mut().enumerate() {
            let (cx, cy, cz) = AXES[component];
            let mut velocity = Vec3::ZERO;
            for (other, &(dx, dy, dz)) in AXES.iter().enumerate() {
                velocity[other] = if other == component {
                    inputs.component_at(0, x, y, z, component)
                } else {
                    0.25 * (inputs.component_at(0, x, y, z, other)
                        + inputs.component_at(0, x + dx, y + dy, z + dz, other)
                        + inputs.component_at(0, x - cx, y - cy, z - cz, other)
                        + inputs.component_at(0, x + dx - cx, y + dy - cy, z + dz - cz, other))
                };
            }
            let half = 0.5 * Vec3::new(cx as f32, cy as f32, cz as f32);
            let departure = ctx.position() - half - velocity * ctx.dt;
            *value = inputs.sample(1, departure + half, component);
        }
    }
}

/// Semi-Lagrangian backtrace of a cell-centred scalar.
/// Inputs: velocity, quantity.
pub struct AdvectScalar {
    pub name: &'static str,
}

impl StencilProgram for AdvectScalar {
    fn name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> usize {
        2
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = (ctx.x, ctx.y, ctx.z);
        let centre = 0.5
            * (inputs.vector_at(0, x, y, z)
                + Vec3::new(
                    inputs.component_at(0, x + 1, y, z, 0),
                    inputs.component_at(0, x, y + 1, z, 1),
                    inputs.component_at(0, x, y, z + 1, 2),
                ));
        let departure = ctx.position() - centre * ctx.dt;
        out[0] = inputs.sample(1, departure, 0);
    }
}

/// One Jacobi sweep of implicit viscosity. Inputs: previous iterate,
/// pre-diffusion field.
pub struct Diffuse {
    pub viscosity: f32,
}

impl StencilProgram for Diffuse {
    fn name(&self) -> &'static str {
        "diffuse"
    }

    fn inputs(&self) -> usize {
        2
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let nu_dt = self.viscosity * ctx.dt;
        for (component, value) in out.iter_mut().enumerate() {
            let b = inputs.component_at(1, ctx.x, ctx.y, ctx.z, component);
            *value = if nu_dt > 0.0 {
                let alpha = 1.0 / nu_dt;
                (inputs.neighbour_sum(0, ctx.x, ctx.y, ctx.z, component) + alpha * b) / (6.0 + alpha)
            } else {
                b
            };
        }
    }
}

/// Identity copy. Input: quantity.
pub struct PassThrough;

impl StencilProgram for PassThrough {
    fn name(&self) -> &'static str {
        "pass through"
    }

    fn inputs(&self) -> usize {
        1
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        for (component, value) in out.iter_mut().enumerate() {
            *value = inputs.component_at(0, ctx.x, ctx.y, ctx.z, component);
        }
    }
}

/// Net outflow through the six faces of a cell. Input: velocity.
pub struct Divergence;

impl StencilProgram for Divergence {
    fn name(&self) -> &'static str {
        "divergence"
    }

    fn inputs(&self) -> usize {
        1
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        out[0] = divergence_at(inputs, 0, ctx.x, ctx.y, ctx.z);
    }
}

pub(crate) fn divergence_at(inputs: &StencilInputs<'_>, binding: usize, x: i32, y: i32, z: i32) -> f32 {
    inputs.component_at(binding, x + 1, y, z, 0) - inputs.component_at(binding, x, y, z, 0)
        + inputs.component_at(binding, x, y + 1, z, 1)
        - inputs.component_at(binding, x, y, z, 1)
        + inputs.component_at(binding, x, y, z + 1, 2)
        - inputs.component_at(binding, x, y, z, 2)
}

/// One Jacobi sweep of the pressure Poisson equation with a free surface.
/// Inputs: pressure, level set, divergence.
///
/// Air cells hold zero. Walls contribute no coupling. An air neighbour
/// contributes a zero-pressure ghost at the interface, placed from the
/// level set values on either side.
pub struct PressurePoisson;

impl StencilProgram for PressurePoisson {
    fn name(&self) -> &'static str {
        "pressure poisson"
    }

    fn inputs(&self) -> usize {
        3
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = (ctx.x, ctx.y, ctx.z);
        let phi = inputs.scalar_at(1, x, y, z);
        if phi >= 0.0 {
            out[0] = 0.0;
            return;
        }
        let (mut weight, mut sum) = (0.0f32, 0.0f32);
        for (dx, dy, dz) in NEIGHBOURS {
            let (nx, ny, nz) = (x + dx, y + dy, z + dz);
            if ctx.dims.is_shell(nx as u32, ny as u32, nz as u32) {
                continue;
            }
            let neighbour = inputs.scalar_at(1, nx, ny, nz);
            if neighbour < 0.0 {
                weight += 1.0;
                sum += inputs.scalar_at(0, nx, ny, nz);
            } else {
                weight += 1.0 / surface_fraction(phi, neighbour);
            }
        }
        out[0] = if weight > 0.0 {
            (sum - inputs.scalar_at(2, x, y, z)) / weight
        } else {
            0.0
        };
    }
}

/// Projection: subtracts the pressure gradient from every fluid face and
/// refills air faces from their fluid neighbours.
/// Inputs: velocity, pressure, level set.
///
/// The gradient across the interface uses the same zero-pressure ghost as
/// [`PressurePoisson`]. An air face takes the mean of the projected fluid
/// faces of the same component around it, or zero when there are none.
/// Faces on the walls are left to the boundary pass.
pub struct RemoveDivergence;

impl RemoveDivergence {
    fn pressure_gradient(inputs: &StencilInputs<'_>, x: i32, y: i32, z: i32, component: usize) -> Option<f32> {
        let (dx, dy, dz) = AXES[component];
        let (bx, by, bz) = (x - dx, y - dy, z - dz);
        let ahead = inputs.scalar_at(2, x, y, z);
        let behind = inputs.scalar_at(2, bx, by, bz);
        match (ahead < 0.0, behind < 0.0) {
            (true, true) => Some(inputs.scalar_at(1, x, y, z) - inputs.scalar_at(1, bx, by, bz)),
            (true, false) => Some(inputs.scalar_at(1, x, y, z) / surface_fraction(ahead, behind)),
            (false, true) => Some(-inputs.scalar_at(1, bx, by, bz) / surface_fraction(behind, ahead)),
            (false, false) => None,
        }
    }

    fn projected(inputs: &StencilInputs<'_>, x: i32, y: i32, z: i32, component: usize) -> Option<f32> {
        Self::pressure_gradient(inputs, x, y, z, component)
            .map(|gradient| inputs.component_at(0, x, y, z, component) - gradient)
    }

    fn extrapolated(ctx: &CellContext, inputs: &StencilInputs<'_>, component: usize) -> f32 {
        let last_face = ctx.dims.size() as i32 - 2;
        let (sum, count) = NEIGHBOURS
            .iter()
            .map(|&(dx, dy, dz)| (ctx.x + dx, ctx.y + dy, ctx.z + dz))
            .filter(|&(x, y, z)| (2..=last_face).contains(&[x, y, z][component]))
            .filter_map(|(x, y, z)| Self::projected(inputs, x, y, z, component))
            .fold((0.0f32, 0u32), |(sum, count), v| (sum + v, count + 1));
        if count > 0 {
            sum / count as f32
        } else {
            0.0
        }
    }
}

impl StencilProgram for RemoveDivergence {
    fn name(&self) -> &'static str {
        "remove divergence"
    }

    fn inputs(&self) -> usize {
        3
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = (ctx.x, ctx.y, ctx.z);
        let position = [x, y, z];
        for (component, value) in out.iter_mut().enumerate() {
            *value = if position[component] <= 1 {
                inputs.component_at(0, x, y, z, component)
            } else {
                Self::projected(inputs, x, y, z, component)
                    .unwrap_or_else(|| Self::extrapolated(ctx, inputs, component))
            };
        }
    }
}

/// Free-slip walls. Faces normal to a wall are zero; a shell cell copies the
/// tangential faces of its nearest interior cell. Input: velocity.
pub struct BoundaryVelocity;

impl StencilProgram for BoundaryVelocity {
    fn name(&self) -> &'static str {
        "boundary velocity"
    }

    fn inputs(&self) -> usize {
        1
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let position = [ctx.x, ctx.y, ctx.z];
        let last = ctx.dims.size() as i32 - 1;
        let (x, y, z) = if ctx.is_shell() {
            ctx.interior_neighbour()
        } else {
            (ctx.x, ctx.y, ctx.z)
        };
        for (component, value) in out.iter_mut().enumerate() {
            let coordinate = position[component];
            *value = if coordinate <= 1 || coordinate == last {
                0.0
            } else {
                inputs.component_at(0, x, y, z, component)
            };
        }
    }
}

/// Zero normal gradient at the walls: a shell cell copies its nearest
/// interior cell. Used for pressure and the level set. Input: the field.
pub struct BoundaryScalar {
    pub name: &'static str,
}

impl StencilProgram for BoundaryScalar {
    fn name(&self) -> &'static str {
        self.name
    }

    fn inputs(&self) -> usize {
        1
    }

    fn evaluate(&self, ctx: &CellContext, inputs: &StencilInputs<'_>, out: &mut [f32]) {
        let (x, y, z) = if ctx.is_shell() {
            ctx.interior_neighbour()
        } else {
            (ctx.x, ctx.y, ctx.z)
        };
        out[0] = inputs.scalar_at(0, x, y, z);
    }
}

pub struct ClearSlabs;

impl StencilProgram for ClearSlabs {
    fn name(&self) -> &'static str {
        "clear slabs"
    }

    fn inputs(&self) -> usize {
        0
    }

    fn evaluate(&self, _ctx: &CellContext, _inputs: &StencilInputs<'_>, out: &mut [f32]) {
        out.fill(0.0);
    }
}
