use anyhow::Context;
use burn::backend::{Autodiff, NdArray, ndarray::NdArrayDevice};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, time::Duration, time::Instant};
use tomosplat_dataset::{
    SceneSource,
    init_cloud::{default_seed_path, load_seed},
};
use tomosplat_render::gaussian_splats::GaussianSet;
use tomosplat_train::{TrainConfig, Trainer, checkpoint};

type Back = Autodiff<NdArray>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "tomosplat - time-resolved CT reconstruction with deformable Gaussian splats"
)]
struct Cli {
    /// Scene to load: a directory with a meta_data.json, or a .pickle archive.
    #[arg(value_name = "SCENE")]
    scene: PathBuf,

    /// Output directory for checkpoints and reconstructed volumes.
    #[arg(long, default_value = "output")]
    out_dir: PathBuf,

    /// Seed point cloud (.npy with x,y,z,density rows, or .ply). Defaults to
    /// init_<scene>.npy next to the scene data.
    #[arg(long)]
    init_points: Option<PathBuf>,

    /// Constant isotropic initial scale. Derived from nearest-neighbor
    /// spacing when unset.
    #[arg(long)]
    initial_scale: Option<f32>,

    /// Resume from this checkpoint iteration in the output directory
    /// (-1 picks the latest).
    #[arg(long)]
    load_iteration: Option<i64>,

    /// Compute device.
    #[arg(long, default_value = "cpu")]
    device: String,

    #[clap(flatten)]
    train: TrainConfig,
}

fn parse_device(name: &str) -> NdArrayDevice {
    match name {
        "cpu" => NdArrayDevice::Cpu,
        other => {
            log::warn!("Unknown device '{other}', falling back to cpu");
            NdArrayDevice::Cpu
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let device = parse_device(&cli.device);

    let source = SceneSource::probe(&cli.scene)?;
    let scene = source.load()?;
    log::info!(
        "Scene '{}': {} train views, {} phases",
        scene.name,
        scene.train_views.len(),
        scene.num_phases()
    );

    // On resume the saved config is the base; explicit CLI flags win.
    let cfg_path = cli.out_dir.join("cfg_args.json");
    let config = if cli.load_iteration.is_some() && cfg_path.is_file() {
        TrainConfig::resume_from(&cfg_path, &cli.train)?
    } else {
        cli.train.clone()
    };
    config.validate()?;
    std::fs::create_dir_all(&cli.out_dir)?;
    config.save(&cfg_path)?;

    let deform_config = config.deformation_config();
    let (splats, resume, deform) = match cli.load_iteration {
        Some(iteration) => {
            let (splats, optim, deform, iter) =
                checkpoint::load::<Back>(&cli.out_dir, iteration, &deform_config, &device)?;
            (splats, Some((optim, iter)), deform)
        }
        None => {
            let seed_path = cli
                .init_points
                .clone()
                .unwrap_or_else(|| default_seed_path(&source));
            let seed = load_seed(&seed_path)
                .with_context(|| format!("loading seed cloud from {seed_path:?}"))?;
            log::info!(
                "Seeding {} Gaussians from {seed_path:?}",
                seed.densities.len()
            );
            let splats = GaussianSet::<Back>::from_seed_with_bounds(
                seed.positions,
                seed.densities,
                cli.initial_scale,
                (config.scale_min, config.scale_max),
                &device,
            )?;
            (splats, None, deform_config.init::<Back>(&device))
        }
    };

    let mut trainer = Trainer::new(config.clone(), scene, splats, deform, &device)?;
    if let Some((optim, iter)) = resume {
        let (splats, deform) = (trainer.splats.clone(), trainer.deform.clone());
        trainer.restore(splats, optim, deform, iter);
    }

    let progress = ProgressBar::new(config.total_steps as u64)
        .with_style(
            ProgressStyle::with_template(
                "[{elapsed}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg} ({per_sec}, {eta} remaining)",
            )
            .expect("Invalid indicatif config"),
        )
        .with_message("Steps");
    progress.set_position(trainer.iter() as u64);

    if cfg!(debug_assertions) {
        let _ = progress
            .println("running in debug mode, compile with --release for best performance");
    }

    let start = Instant::now();
    while !trainer.is_done() {
        let stats = trainer.step()?;
        progress.set_position(stats.iter as u64);
        if let Some(refine) = stats.refine {
            progress.set_message(format!("{} splats", refine.final_count));
        }

        if config.eval_every > 0 && stats.iter % config.eval_every == 0 {
            let export = (!config.skip_volume_export)
                .then(|| cli.out_dir.join("volumes").join(format!("iteration_{}", stats.iter)));
            let report = trainer.eval(export.as_deref())?;
            if let Some(psnr) = report.mean_psnr {
                let _ = progress.println(format!(
                    "Eval iter {}: volume psnr {psnr:.2} dB",
                    stats.iter
                ));
            }
        }
        if config.checkpoint_every > 0 && stats.iter % config.checkpoint_every == 0 {
            trainer.checkpoint(&cli.out_dir)?;
        }
    }
    progress.finish();

    trainer.checkpoint(&cli.out_dir)?;
    let export = (!config.skip_volume_export).then(|| cli.out_dir.join("volumes").join("final"));
    let report = trainer.eval(export.as_deref())?;
    if let Some(psnr) = report.mean_psnr {
        log::info!("Final volume psnr: {psnr:.2} dB");
    }

    let took = Duration::from_secs(start.elapsed().as_secs());
    println!("Training took {}", humantime::format_duration(took));
    Ok(())
}
