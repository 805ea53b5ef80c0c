// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! wgpu backend.
//!
//! Every grid is one storage buffer (vectors padded to `vec4`). A program is
//! one compute pipeline whose bind group holds the pass uniforms at binding 0,
//! the layer slot at binding 1 (dynamic offset), the written grid at binding 2
//! and the read-only inputs from binding 3 on. Each layer is its own
//! `dispatch_workgroups` call so a pass writes exactly the layer targets it is
//! given. Passes are recorded into one encoder and submitted on `flush`.

use bytemuck::{Pod, Zeroable};
use std::num::NonZeroU64;
use std::sync::Arc;
use wgpu::util::DeviceExt;

use crate::config::{SimulationConfig, MAX_GRID_SIZE};
use crate::error::{SimResult, SimulatorError};
use crate::grid::{GridDims, GridStorage, LayerTarget, QuantityKind};
use crate::simulator::Simulator;
use crate::slab::{Extent, SlabBackend, SlabParams, StencilPrograms};

const WORKGROUP_SIZE: u32 = 8;

const PRELUDE: &str = include_str!("../shaders/slab_prelude.wgsl");

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct PassUniform {
    grid_size: u32,
    interior: u32,
    time_step_us: u32,
    _pad: u32,
    force: [f32; 4],
    constants: [f32; 4],
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
struct LayerUniform {
    layer: u32,
    _pad: [u32; 3],
}

/// Floats per cell in device memory.
fn device_stride(kind: QuantityKind) -> usize {
    match kind {
        QuantityKind::Scalar => 1,
        QuantityKind::Vector => 4,
    }
}

fn pad_to_device(kind: QuantityKind, data: &[f32]) -> Vec<f32> {
    match kind {
        QuantityKind::Scalar => data.to_vec(),
        QuantityKind::Vector => data
            .chunks_exact(3)
            .flat_map(|v| [v[0], v[1], v[2], 0.0])
            .collect(),
    }
}

fn strip_from_device(kind: QuantityKind, data: &[f32]) -> Vec<f32> {
    match kind {
        QuantityKind::Scalar => data.to_vec(),
        QuantityKind::Vector => data.chunks_exact(4).flat_map(|v| [v[0], v[1], v[2]]).collect(),
    }
}

pub struct GpuGrid {
    buffer: wgpu::Buffer,
    dims: GridDims,
    kind: QuantityKind,
}

impl GpuGrid {
    /// The storage buffer, for renderers that sample the field directly.
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }
}

impl GridStorage for GpuGrid {
    fn dims(&self) -> GridDims {
        self.dims
    }

    fn kind(&self) -> QuantityKind {
        self.kind
    }

    fn cell_capacity(&self) -> usize {
        self.buffer.size() as usize / (device_stride(self.kind) * std::mem::size_of::<f32>())
    }
}

pub struct GpuProgram {
    name: &'static str,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    inputs: usize,
    constants: [f32; 4],
}

pub struct GpuBackend {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    layer_uniforms: wgpu::Buffer,
    layer_stride: u64,
    encoder: Option<wgpu::CommandEncoder>,
    dispatches: u64,
}

impl GpuBackend {
    /// Wraps a device the caller already owns, e.g. the window's.
    pub fn new(device: Arc<wgpu::Device>, queue: Arc<wgpu::Queue>) -> Self {
        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let slot = std::mem::size_of::<LayerUniform>() as u64;
        let layer_stride = slot.div_ceil(alignment) * alignment;

        let mut bytes = vec![0u8; (layer_stride * MAX_GRID_SIZE as u64) as usize];
        for layer in 0..MAX_GRID_SIZE {
            let offset = (layer as u64 * layer_stride) as usize;
            let uniform = LayerUniform { layer, _pad: [0; 3] };
            bytes[offset..offset + slot as usize].copy_from_slice(bytemuck::bytes_of(&uniform));
        }
        let layer_uniforms = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Layer Uniforms"),
            contents: &bytes,
            usage: wgpu::BufferUsages::UNIFORM,
        });

        Self {
            device,
            queue,
            layer_uniforms,
            layer_stride,
            encoder: None,
            dispatches: 0,
        }
    }

    /// Opens a headless device on the best available adapter.
    pub async fn request() -> SimResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                ..Default::default()
            })
            .await
            .ok_or_else(|| SimulatorError::Gpu("no compatible adapter found".into()))?;
        log::info!("Using adapter: {}", adapter.get_info().name);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Fluid Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: Default::default(),
                },
                None,
            )
            .await
            .map_err(|e| SimulatorError::Gpu(e.to_string()))?;
        Ok(Self::new(Arc::new(device), Arc::new(queue)))
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    /// Layer dispatches recorded so far.
    pub fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    fn compile(
        &self,
        name: &'static str,
        source: &str,
        inputs: usize,
        constants: [f32; 4],
    ) -> SimResult<GpuProgram> {
        let uniform_entry = |binding: u32, dynamic: bool, size: usize| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: dynamic,
                min_binding_size: NonZeroU64::new(size as u64),
            },
            count: None,
        };
        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let mut entries = vec![
            uniform_entry(0, false, std::mem::size_of::<PassUniform>()),
            uniform_entry(1, true, std::mem::size_of::<LayerUniform>()),
            storage_entry(2, false),
        ];
        entries.extend((0..inputs).map(|i| storage_entry(3 + i as u32, true)));

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(name),
            source: wgpu::ShaderSource::Wgsl(format!("{PRELUDE}\n{source}").into()),
        });
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(name),
            entries: &entries,
        });
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(name),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(name),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: "main",
            compilation_options: Default::default(),
            cache: None,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(SimulatorError::binding(name, error.to_string()));
        }

        Ok(GpuProgram {
            name,
            pipeline,
            layout,
            inputs,
            constants,
        })
    }
}

impl SlabBackend for GpuBackend {
    type Buffer = GpuGrid;
    type Program = GpuProgram;

    fn allocate(
        &mut self,
        name: &'static str,
        dims: GridDims,
        kind: QuantityKind,
        data: &[f32],
    ) -> SimResult<GpuGrid> {
        let padded = pad_to_device(kind, data);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(name),
            contents: bytemuck::cast_slice(&padded),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
        });
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if let Some(error) = validation.or(out_of_memory) {
            return Err(SimulatorError::allocation(name, error.to_string()));
        }
        Ok(GpuGrid { buffer, dims, kind })
    }

    fn upload(&mut self, grid: &mut GpuGrid, data: &[f32]) {
        // Writes land at the next submit, so recorded passes go first.
        self.flush();
        let padded = pad_to_device(grid.kind, data);
        self.queue.write_buffer(&grid.buffer, 0, bytemuck::cast_slice(&padded));
    }

    fn read_back(&mut self, grid: &GpuGrid) -> Vec<f32> {
        self.flush();
        let size = grid.buffer.size();
        let staging_buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Read"),
        });
        encoder.copy_buffer_to_buffer(&grid.buffer, 0, &staging_buffer, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            sender.send(result).ok();
        });
        self.device.poll(wgpu::Maintain::Wait);

        ensure_mapped(pollster::block_on(receiver.receive()));

        let data = buffer_slice.get_mapped_range();
        let result = strip_from_device(grid.kind, bytemuck::cast_slice(&data));
        drop(data);
        staging_buffer.unmap();
        result
    }

    fn input_count(&self, program: &GpuProgram) -> usize {
        program.inputs
    }

    fn dispatch_layers(
        &mut self,
        program: &GpuProgram,
        inputs: &[&GpuGrid],
        target: &mut GpuGrid,
        layers: &[LayerTarget],
        extent: Extent,
        params: &SlabParams,
    ) {
        let dims = target.dims;
        let uniform = PassUniform {
            grid_size: dims.size(),
            interior: (extent == Extent::Interior) as u32,
            time_step_us: params.time_step_us,
            _pad: 0,
            force: params.force.extend(0.0).to_array(),
            constants: program.constants,
        };
        let params_buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Pass Uniform"),
            contents: bytemuck::bytes_of(&uniform),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        let mut entries = vec![
            wgpu::BindGroupEntry {
                binding: 0,
                resource: params_buffer.as_entire_binding(),
            },
            wgpu::BindGroupEntry {
                binding: 1,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &self.layer_uniforms,
                    offset: 0,
                    size: NonZeroU64::new(std::mem::size_of::<LayerUniform>() as u64),
                }),
            },
            wgpu::BindGroupEntry {
                binding: 2,
                resource: target.buffer.as_entire_binding(),
            },
        ];
        entries.extend(inputs.iter().enumerate().map(|(i, grid)| wgpu::BindGroupEntry {
            binding: 3 + i as u32,
            resource: grid.buffer.as_entire_binding(),
        }));
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(program.name),
            layout: &program.layout,
            entries: &entries,
        });

        let side = extent.plane(dims).len() as u32;
        let workgroups = side.div_ceil(WORKGROUP_SIZE);
        let device = &self.device;
        let encoder = self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Fluid Step"),
            })
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(program.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&program.pipeline);
            for layer in layers {
                let offset = (layer.layer as u64 * self.layer_stride) as u32;
                pass.set_bind_group(0, &bind_group, &[offset]);
                pass.dispatch_workgroups(workgroups, workgroups, 1);
            }
        }
        self.dispatches += layers.len() as u64;
    }

    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
    }
}

/// A readback that could not map has no data to return.
fn ensure_mapped(result: Option<Result<(), wgpu::BufferAsyncError>>) {
    match result {
        Some(Ok(())) => {}
        Some(Err(err)) => panic!("failed to map staging buffer for readback: {err}"),
        None => panic!("readback channel closed before the staging buffer was mapped"),
    }
}

/// Compiles the full program set against `backend`'s device.
pub fn compile_programs(backend: &GpuBackend, config: &SimulationConfig) -> SimResult<StencilPrograms<GpuProgram>> {
    let none = [0.0; 4];
    Ok(StencilPrograms {
        advect_velocity: backend.compile(
            "advect velocity",
            include_str!("../shaders/advect_vector.wgsl"),
            2,
            none,
        )?,
        advect_level_set: backend.compile(
            "advect level set",
            include_str!("../shaders/advect_scalar.wgsl"),
            2,
            none,
        )?,
        diffusion: backend.compile(
            "diffuse",
            include_str!("../shaders/diffuse.wgsl"),
            2,
            [config.viscosity, 0.0, 0.0, 0.0],
        )?,
        force: backend.compile(
            "apply force",
            include_str!("../shaders/apply_force.wgsl"),
            2,
            [config.gravity_cells(), config.force_gain, 0.0, 0.0],
        )?,
        pass_through: backend.compile("pass through", include_str!("../shaders/pass_through.wgsl"), 1, none)?,
        divergence: backend.compile("divergence", include_str!("../shaders/divergence.wgsl"), 1, none)?,
        pressure_poisson: backend.compile(
            "pressure poisson",
            include_str!("../shaders/pressure_poisson.wgsl"),
            3,
            none,
        )?,
        remove_divergence: backend.compile(
            "remove divergence",
            include_str!("../shaders/remove_divergence.wgsl"),
            3,
            none,
        )?,
        boundary_velocity: backend.compile(
            "boundary velocity",
            include_str!("../shaders/boundary_velocity.wgsl"),
            1,
            none,
        )?,
        boundary_level_set: backend.compile(
            "boundary level set",
            include_str!("../shaders/boundary_scalar.wgsl"),
            1,
            none,
        )?,
        boundary_pressure: backend.compile(
            "boundary pressure",
            include_str!("../shaders/boundary_scalar.wgsl"),
            1,
            none,
        )?,
        // Only pressure is ever cleared.
        clear_slabs: backend.compile(
            "clear slabs",
            include_str!("../shaders/clear_slabs.wgsl"),
            0,
            [device_stride(QuantityKind::Scalar) as f32, 0.0, 0.0, 0.0],
        )?,
    })
}

impl Simulator<GpuBackend> {
    pub fn gpu(backend: GpuBackend, config: SimulationConfig) -> SimResult<Self> {
        let programs = compile_programs(&backend, &config)?;
        Self::new(backend, programs, config)
    }
}
