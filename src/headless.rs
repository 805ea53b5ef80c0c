// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

// Batch runner without a window.
// Usage: headless [steps] [--gpu] [--png DIR] [--save-settings]

use anyhow::{bail, Context};
use std::path::PathBuf;

use cubefluid::config::SETTINGS_FILE_NAME;
use cubefluid::diagnostics::level_set_slice;
use cubefluid::{FieldStats, GpuBackend, SimulationConfig, Simulator, SlabBackend};

/// 60 Hz.
const FIXED_STEP_US: u32 = 16_667;
const STATS_INTERVAL: u32 = 10;

struct Args {
    steps: u32,
    gpu: bool,
    png_dir: Option<PathBuf>,
    save_settings: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        steps: 120,
        gpu: false,
        png_dir: None,
        save_settings: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--gpu" => args.gpu = true,
            "--png" => {
                let dir = iter.next().context("--png needs a directory")?;
                args.png_dir = Some(PathBuf::from(dir));
            }
            "--save-settings" => args.save_settings = true,
            other => match other.parse() {
                Ok(steps) => args.steps = steps,
                Err(_) => bail!("unrecognised argument '{other}'"),
            },
        }
    }
    Ok(args)
}

fn run<B: SlabBackend>(simulator: &mut Simulator<B>, args: &Args) -> anyhow::Result<()> {
    let dims = simulator.dims();
    let started = std::time::Instant::now();

    for step in 1..=args.steps {
        simulator.step(FIXED_STEP_US);
        if step % STATS_INTERVAL == 0 || step == args.steps {
            let level_set = simulator.read_level_set();
            let velocity = simulator.read_velocity();
            let stats = FieldStats::from_fields(dims, &level_set, &velocity);
            log::info!(
                "step {:>5}: fluid {:.3}, max speed {:.3} cells/s, mean |div| {:.5}, phi [{:.2}, {:.2}]",
                step,
                stats.fluid_fraction,
                stats.max_speed,
                stats.mean_divergence,
                stats.level_set_min,
                stats.level_set_max
            );
            if !stats.is_finite() {
                bail!("simulation diverged at step {step}");
            }
        }
    }

    let elapsed = started.elapsed().as_secs_f32();
    log::info!(
        "{} steps in {:.2}s ({:.1} steps/s)",
        args.steps,
        elapsed,
        args.steps as f32 / elapsed.max(1e-6)
    );

    if let Some(dir) = &args.png_dir {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        let level_set = simulator.read_level_set();
        let image = level_set_slice(dims, &level_set, dims.size() / 2, dims.size() as f32 / 4.0);
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("level_set_{}_step{}.png", timestamp, args.steps));
        image.save(&path).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Wrote {}", path.display());
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args()?;
    let settings_path = SimulationConfig::default_path();
    let config = SimulationConfig::load_or_default(&settings_path);
    if args.save_settings {
        config.save_to_disk(&settings_path)?;
        log::info!("Saved {}", SETTINGS_FILE_NAME);
    }

    if args.gpu {
        let backend = pollster::block_on(GpuBackend::request())?;
        let mut simulator = Simulator::gpu(backend, config)?;
        run(&mut simulator, &args)
    } else {
        let mut simulator = Simulator::cpu(config)?;
        run(&mut simulator, &args)
    }
}
