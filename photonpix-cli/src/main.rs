//! photonpix command-line interface.
//!
//! Runs the cluster finding pipeline over raw frame files, writes synthetic
//! frames and summarises cluster files.
#![allow(
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    clippy::cast_lossless,
    clippy::too_many_lines
)]

use clap::{Parser, Subcommand};
use ndarray::Array2;
use photonpix_algorithms::DetectorConfig;
use photonpix_io::{ClusterFileReader, ClusterFileSink, RawFrameReader, RawFrameWriter};
use photonpix_pipeline::{Pipeline, PipelineConfig};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tracing::{info, Dispatch};
use tracing_subscriber::EnvFilter;

/// Result type for CLI operations.
type Result<T> = std::result::Result<T, CliError>;

/// CLI error types.
#[derive(Error, Debug)]
enum CliError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    PhotonpixIo(#[from] photonpix_io::Error),

    #[error("Core error: {0}")]
    Core(#[from] photonpix_core::Error),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] photonpix_pipeline::PipelineError),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),
}

/// Settings file for `process`; every field is optional.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProcessConfig {
    detector: DetectorConfig,
    pipeline: PipelineConfig,
}

impl ProcessConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)?;
                Ok(serde_json::from_str(&text)?)
            }
            None => Ok(Self::default()),
        }
    }
}

/// Photon cluster finder for pixel detector frames.
#[derive(Parser)]
#[command(name = "photonpix")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Find photon clusters in a raw u16 frame file
    Process {
        /// Input raw frame file
        input: PathBuf,

        /// Output cluster file
        #[arg(short, long)]
        output: PathBuf,

        /// Frame rows
        #[arg(long)]
        rows: usize,

        /// Frame columns
        #[arg(long)]
        cols: usize,

        /// Number of leading frames used as pedestal frames
        #[arg(long, default_value = "100")]
        pedestal_frames: usize,

        /// JSON settings file with `detector` and `pipeline` sections
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Detection threshold in standard deviations
        #[arg(long)]
        n_sigma: Option<f64>,

        /// Cluster window size (scan and storage)
        #[arg(long)]
        cluster_size: Option<usize>,

        /// Number of worker threads
        #[arg(short = 'j', long)]
        workers: Option<usize>,
    },

    /// Write synthetic raw frames with injected photons
    Simulate {
        /// Output raw frame file
        output: PathBuf,

        /// Frame rows
        #[arg(long, default_value = "400")]
        rows: usize,

        /// Frame columns
        #[arg(long, default_value = "400")]
        cols: usize,

        /// Number of photon-free frames written first
        #[arg(long, default_value = "100")]
        pedestal_frames: usize,

        /// Number of frames with photons
        #[arg(long, default_value = "1000")]
        frames: usize,

        /// Photons per frame
        #[arg(long, default_value = "10")]
        photons: usize,

        /// Pedestal level in ADU
        #[arg(long, default_value = "1000")]
        pedestal: u16,

        /// Peak-to-peak noise amplitude in ADU
        #[arg(long, default_value = "10")]
        noise: u16,

        /// Photon amplitude in ADU
        #[arg(long, default_value = "200")]
        amplitude: u16,

        /// Random seed
        #[arg(long, default_value = "1")]
        seed: u64,
    },

    /// Show information about a cluster file
    Info {
        /// Input cluster file
        input: PathBuf,

        /// Cluster size in x
        #[arg(long, default_value = "3")]
        cluster_size_x: usize,

        /// Cluster size in y
        #[arg(long, default_value = "3")]
        cluster_size_y: usize,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Summary printed by `info`.
#[derive(Debug, Default, Serialize)]
struct ClusterFileInfo {
    file_size: usize,
    frames: u64,
    clusters: u64,
    first_frame: Option<u64>,
    last_frame: Option<u64>,
    max_clusters_per_frame: usize,
    mean_cluster_sum: f64,
    max_cluster_sum: Option<i32>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);

    tracing::dispatcher::with_default(&dispatch, || run(cli.command, &dispatch))
}

fn run(command: Commands, dispatch: &Dispatch) -> Result<()> {
    match command {
        Commands::Process {
            input,
            output,
            rows,
            cols,
            pedestal_frames,
            config,
            n_sigma,
            cluster_size,
            workers,
        } => {
            let mut settings = ProcessConfig::load(config.as_deref())?;
            if let Some(n_sigma) = n_sigma {
                settings.detector = settings.detector.with_n_sigma(n_sigma);
            }
            if let Some(size) = cluster_size {
                settings.detector = settings.detector.with_cluster_size(size, size);
            }
            if let Some(workers) = workers {
                settings.pipeline = settings.pipeline.with_n_workers(workers);
            }

            let frames = RawFrameReader::open(&input, (rows, cols))?;
            info!(
                input = %input.display(),
                frames = frames.n_frames(),
                pedestal_frames,
                workers = settings.pipeline.n_workers,
                "processing"
            );

            let start = Instant::now();
            let mut pipeline: Pipeline = Pipeline::new(
                (rows, cols),
                &settings.detector,
                settings.pipeline,
                dispatch.clone(),
            )?;
            let sink = ClusterFileSink::spawn(pipeline.sink(), &output, dispatch.clone())?;

            let mut frame_number = 0u64;
            for (index, frame) in frames.frames().enumerate() {
                let frame = frame?;
                if index < pedestal_frames {
                    pipeline.submit_pedestal(frame.view())?;
                } else {
                    pipeline.submit_data(frame.view(), frame_number)?;
                    frame_number += 1;
                }
            }
            pipeline.stop()?;
            let summary = sink.join()?;
            let stats = pipeline.total_statistics()?;
            let elapsed = start.elapsed();

            println!(
                "Processed {} frames in {:.2}s",
                frames.n_frames(),
                elapsed.as_secs_f64()
            );
            println!("Data frames: {}", stats.frames_processed);
            println!("Clusters: {}", summary.clusters);
            println!("Pedestal updates: {}", stats.pedestal_updates);
            println!("Negative excursions: {}", stats.negative_excursions);
            println!("Output: {}", output.display());
        }

        Commands::Simulate {
            output,
            rows,
            cols,
            pedestal_frames,
            frames,
            photons,
            pedestal,
            noise,
            amplitude,
            seed,
        } => {
            let start = Instant::now();
            let total = pedestal_frames + frames;
            let generated: Vec<Array2<u16>> = (0..total)
                .into_par_iter()
                .map(|index| {
                    let n_photons = if index < pedestal_frames { 0 } else { photons };
                    let mut rng = ChaCha8Rng::seed_from_u64(seed ^ index as u64);
                    synthetic_frame(
                        &mut rng,
                        (rows, cols),
                        pedestal,
                        noise,
                        n_photons,
                        amplitude,
                    )
                })
                .collect();

            let mut writer = RawFrameWriter::create(&output, (rows, cols))?;
            for frame in &generated {
                writer.write_frame(frame.view())?;
            }
            writer.flush()?;

            println!(
                "Wrote {} frames ({} pedestal) of {}x{} in {:.2}s",
                writer.frames_written(),
                pedestal_frames,
                rows,
                cols,
                start.elapsed().as_secs_f64()
            );
            println!("Output: {}", output.display());
        }

        Commands::Info {
            input,
            cluster_size_x,
            cluster_size_y,
            json,
        } => {
            let mut reader =
                ClusterFileReader::<i32>::open(&input, cluster_size_x, cluster_size_y)?;
            let mut summary = ClusterFileInfo {
                file_size: reader.file_size(),
                ..ClusterFileInfo::default()
            };
            let mut sum_total = 0.0f64;

            for buffer in reader.by_ref() {
                let buffer = buffer?;
                let frame_number = buffer.frame_number();
                summary.frames += 1;
                summary.clusters += buffer.len() as u64;
                summary.first_frame = Some(
                    summary
                        .first_frame
                        .map_or(frame_number, |f| f.min(frame_number)),
                );
                summary.last_frame = Some(
                    summary
                        .last_frame
                        .map_or(frame_number, |f| f.max(frame_number)),
                );
                summary.max_clusters_per_frame =
                    summary.max_clusters_per_frame.max(buffer.len());
                for record in buffer.iter() {
                    let sum = record.sum();
                    sum_total += f64::from(sum);
                    summary.max_cluster_sum =
                        Some(summary.max_cluster_sum.map_or(sum, |m| m.max(sum)));
                }
            }
            if summary.clusters > 0 {
                summary.mean_cluster_sum = sum_total / summary.clusters as f64;
            }

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("File: {}", input.display());
                println!(
                    "Size: {} bytes ({:.2} MB)",
                    summary.file_size,
                    summary.file_size as f64 / 1_000_000.0
                );
                println!("Frames: {}", summary.frames);
                println!("Clusters: {}", summary.clusters);
                if let (Some(first), Some(last)) = (summary.first_frame, summary.last_frame) {
                    println!("Frame range: {} - {}", first, last);
                }
                println!("Max clusters per frame: {}", summary.max_clusters_per_frame);
                if let Some(max) = summary.max_cluster_sum {
                    println!(
                        "Cluster sum: mean {:.1}, max {}",
                        summary.mean_cluster_sum, max
                    );
                }
            }
        }
    }

    Ok(())
}

/// Flat pedestal with uniform noise and single-pixel photons.
fn synthetic_frame(
    rng: &mut ChaCha8Rng,
    shape: (usize, usize),
    pedestal: u16,
    noise: u16,
    photons: usize,
    amplitude: u16,
) -> Array2<u16> {
    let low = pedestal.saturating_sub(noise / 2);
    let high = low.saturating_add(noise);
    let mut frame = Array2::from_shape_simple_fn(shape, || rng.gen_range(low..=high));
    if shape.0 == 0 || shape.1 == 0 {
        return frame;
    }
    for _ in 0..photons {
        let row = rng.gen_range(0..shape.0);
        let col = rng.gen_range(0..shape.1);
        let pixel = &mut frame[[row, col]];
        *pixel = pixel.saturating_add(amplitude);
    }
    frame
}
