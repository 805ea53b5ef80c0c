// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

// Interactive viewer: drag with the left mouse button to push the fluid.
// A/D or Left/Right orbit the camera, W/S or Up/Down tilt it, R resets.

mod preview;

use anyhow::Context;
use glam::Vec2;
use std::collections::HashSet;
use std::sync::Arc;
use winit::{
    event::{ElementState, Event, KeyEvent, MouseButton, WindowEvent},
    event_loop::EventLoop,
    keyboard::{KeyCode, PhysicalKey},
    window::Window,
};

use cubefluid::{DragState, GpuBackend, SimulationConfig, Simulator};
use preview::{OrbitCamera, Preview};

struct ViewerState {
    window: Arc<Window>,
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    preview: Preview,

    // None when construction failed; the window stays up with an empty tank.
    simulator: Option<Simulator<GpuBackend>>,
    config: SimulationConfig,

    camera: OrbitCamera,
    drag: DragState,
    cursor: Vec2,
    held_keys: HashSet<KeyCode>,

    last_frame_time: std::time::Instant,
    frame_count: u32,
    last_fps_update: std::time::Instant,
}

impl ViewerState {
    async fn new(window: Arc<Window>, config: SimulationConfig) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(window.clone())?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .context("no compatible GPU adapter")?;

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
            .await?;
        let device = Arc::new(device);
        let queue = Arc::new(queue);

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .unwrap_or(surface_caps.formats[0]);
        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::Fifo,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let preview = Preview::new(&device, format);

        let backend = GpuBackend::new(device.clone(), queue.clone());
        let simulator = match Simulator::gpu(backend, config.clone()) {
            Ok(simulator) => Some(simulator),
            Err(e) => {
                log::error!("Fluid simulator unavailable: {e}");
                None
            }
        };

        let now = std::time::Instant::now();
        Ok(Self {
            window,
            device,
            queue,
            surface,
            surface_config,
            preview,
            simulator,
            config,
            camera: OrbitCamera::default(),
            drag: DragState::default(),
            cursor: Vec2::ZERO,
            held_keys: HashSet::new(),
            last_frame_time: now,
            frame_count: 0,
            last_fps_update: now,
        })
    }

    fn successfully_initialised(&self) -> bool {
        self.simulator.is_some()
    }

    fn resize(&mut self, new_size: winit::dpi::PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.surface_config.width = new_size.width;
            self.surface_config.height = new_size.height;
            self.surface.configure(&self.device, &self.surface_config);
        }
    }

    fn key_axis(&self, positive: [KeyCode; 2], negative: [KeyCode; 2]) -> f32 {
        let pressed = |keys: [KeyCode; 2]| keys.iter().any(|k| self.held_keys.contains(k));
        pressed(positive) as i32 as f32 - pressed(negative) as i32 as f32
    }

    /// Frame time since the last call in µs, clamped so a stall does not
    /// blow up the step.
    fn take_frame_time_us(&mut self) -> u32 {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_frame_time).as_micros();
        self.last_frame_time = now;

        let max = self.config.max_frame_time_us;
        if elapsed > max as u128 {
            log::warn!("Frame took {} µs; clamping to {} µs", elapsed, max);
            max
        } else {
            elapsed as u32
        }
    }

    fn reset(&mut self) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.reset();
            simulator.clear_pressure();
        }
    }

    fn update(&mut self) {
        let time_step_us = self.take_frame_time_us();

        let yaw = self.key_axis([KeyCode::KeyA, KeyCode::ArrowLeft], [KeyCode::KeyD, KeyCode::ArrowRight]);
        let pitch = self.key_axis([KeyCode::KeyW, KeyCode::ArrowUp], [KeyCode::KeyS, KeyCode::ArrowDown]);
        self.camera.rotate(yaw, pitch, time_step_us);

        if let Some(simulator) = self.simulator.as_mut() {
            simulator.apply_force(self.drag.take_segment(), self.camera.yaw);
            simulator.step(time_step_us);
        }
    }

    fn update_window_title(&mut self) {
        self.frame_count += 1;
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            let status = if self.successfully_initialised() {
                format!("{:.1} FPS", fps)
            } else {
                "simulator unavailable".to_string()
            };
            self.window.set_title(&format!(
                "Fluid Cube - {}³ - {}",
                self.config.grid_size, status
            ));
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output.texture.create_view(&wgpu::TextureViewDescriptor::default());
        let mut encoder = self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Preview Encoder"),
        });

        if let Some(simulator) = self.simulator.as_ref() {
            let aspect = self.surface_config.width as f32 / self.surface_config.height.max(1) as f32;
            self.preview.draw(
                &self.device,
                &self.queue,
                &mut encoder,
                &view,
                &self.camera,
                aspect,
                simulator.dims().size(),
                simulator.current_level_set().buffer(),
            );
        } else {
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("Clear"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        }

        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let settings_path = SimulationConfig::default_path();
    let config = SimulationConfig::load_or_default(&settings_path);

    let event_loop = EventLoop::new()?;
    let window = Arc::new(
        event_loop.create_window(
            winit::window::WindowAttributes::default()
                .with_title("Fluid Cube")
                .with_inner_size(winit::dpi::LogicalSize::new(800, 800)),
        )?,
    );

    let mut state = pollster::block_on(ViewerState::new(window.clone(), config))?;
    if state.successfully_initialised() {
        log::info!("Viewer ready");
    }

    event_loop.run(move |event, target| match event {
        Event::WindowEvent { event, window_id } if window_id == window.id() => match event {
            WindowEvent::CloseRequested => target.exit(),
            WindowEvent::Resized(physical_size) => state.resize(physical_size),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key),
                        state: key_state,
                        repeat,
                        ..
                    },
                ..
            } => match (key, key_state) {
                (KeyCode::Escape, ElementState::Pressed) => target.exit(),
                (KeyCode::KeyR, ElementState::Pressed) if !repeat => state.reset(),
                (_, ElementState::Pressed) => {
                    state.held_keys.insert(key);
                }
                (_, ElementState::Released) => {
                    state.held_keys.remove(&key);
                }
            },
            WindowEvent::CursorMoved { position, .. } => {
                state.cursor = Vec2::new(position.x as f32, position.y as f32);
                state.drag.moved(state.cursor);
            }
            WindowEvent::MouseInput {
                state: button_state,
                button: MouseButton::Left,
                ..
            } => match button_state {
                ElementState::Pressed => state.drag.press(state.cursor),
                ElementState::Released => state.drag.release(),
            },
            WindowEvent::RedrawRequested => {
                state.update();
                state.update_window_title();
                match state.render() {
                    Ok(_) => {}
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        state.surface.configure(&state.device, &state.surface_config);
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        log::error!("Surface out of memory");
                        target.exit();
                    }
                    Err(e) => log::warn!("{:?}", e),
                }
            }
            _ => {}
        },
        Event::AboutToWait => {
            window.request_redraw();
        }
        _ => {}
    })?;

    Ok(())
}
