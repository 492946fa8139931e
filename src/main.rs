use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use log::{debug, info, warn};

mod coords;
mod detector;
mod output;
mod preprocess;
mod preview;
mod volume;

use coords::{coords_in_region, read_coordinates_npy};
use detector::{CoPositivityScan, DetectParams};
use output::write_copositive_set;
use preprocess::max_projection;
use preview::{LogPreview, PreviewSink, ProjectionView};
use volume::{CoRegistered, Region, VolumeSource, ZarrVolume};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Source channel volume (zarr directory).
    #[arg(long)]
    src_zarr: PathBuf,

    /// Detected cell centers in the source channel (.npy, Nx3, z-y-x rows).
    #[arg(long)]
    src_coords: PathBuf,

    /// Destination channel volume (zarr directory).
    #[arg(long)]
    dst_zarr: PathBuf,

    /// Marker positivity probability map for the destination channel
    /// (zarr directory, same shape as the destination volume).
    #[arg(long)]
    dst_probs: PathBuf,

    /// Directory the coordinate artifacts are written to.
    #[arg(long)]
    output: PathBuf,

    /// Raw source TIFF, accepted for pipeline compatibility and never read.
    #[arg(long)]
    src_tif: Option<PathBuf>,

    /// Raw destination TIFF, accepted for pipeline compatibility and never read.
    #[arg(long)]
    dst_tif: Option<PathBuf>,

    /// Probability strictly above this value marks a cell co-positive.
    #[arg(long, default_value_t = 0.4)]
    threshold: f32,

    /// Render a comparison view and stop scanning once a slice accumulates
    /// more than 50 co-positive cells.
    #[arg(long)]
    preview: bool,

    /// Downscale factor for preview renderings.
    #[arg(long, default_value_t = 0.3)]
    preview_scale: f32,

    /// Log max-projections of a sub-volume given as z0:z1,y0:y1,x0:x1.
    #[arg(long)]
    inspect_region: Option<String>,

    /// Number of worker threads for the slice scan. Defaults to one per core.
    #[arg(long)]
    nthreads: Option<usize>,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> CliResult<()> {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();
    debug!("{args:?}");

    if !(0.0..=1.0).contains(&args.threshold) {
        return Err(format!("threshold must be in [0, 1], got {}", args.threshold).into());
    }
    if args.preview_scale <= 0.0 || !args.preview_scale.is_finite() {
        return Err(format!("preview scale must be positive, got {}", args.preview_scale).into());
    }
    if args.src_tif.is_some() || args.dst_tif.is_some() {
        debug!("raw tif paths are accepted for compatibility and not read");
    }

    if let Some(nthreads) = args.nthreads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build_global()?;
    }

    let volumes = CoRegistered {
        source: ZarrVolume::open(&args.src_zarr)?,
        destination: ZarrVolume::open(&args.dst_zarr)?,
        probability: ZarrVolume::open(&args.dst_probs)?,
    };
    let coords = read_coordinates_npy(&args.src_coords)?;

    let (depth, height, width) = volumes.destination.shape();
    info!("source volume: {:?}", volumes.source.shape());
    info!("destination volume: {depth}x{height}x{width} with probability map");
    info!("loaded {} cell centers", coords.len());

    if volumes.probability.shape() != volumes.destination.shape() {
        return Err(format!(
            "probability map shape {:?} does not match destination volume shape {:?}",
            volumes.probability.shape(),
            volumes.destination.shape()
        )
        .into());
    }

    let params = DetectParams {
        threshold: args.threshold,
        preview_scale: args.preview_scale,
    };
    let scan = CoPositivityScan::new(&volumes, &coords, params);

    let mut sink = LogPreview;
    let set = if args.preview {
        scan.run_with_preview(&mut sink)?
    } else {
        scan.run()?
    };
    info!(
        "{} co-positive cells across {} slices",
        set.total(),
        set.num_slices()
    );
    if set.is_empty() {
        warn!("no cell center cleared the {} threshold", args.threshold);
    }

    if let Some(text) = &args.inspect_region {
        let region: Region = text.parse()?;
        let clamped = region.clamp_to(volumes.destination.shape());
        let (src, dst, prob) = volumes.subvolumes(&clamped)?;
        let in_region = coords_in_region(&coords, &clamped, true);
        info!("{} cell centers inside {clamped}", in_region.len());
        sink.max_projection_view(&ProjectionView {
            source: max_projection(&src),
            destination: max_projection(&dst),
            probability: max_projection(&prob),
            region: clamped,
        });
    }

    let artifacts = write_copositive_set(&args.output, args.threshold, &set)?;
    info!("wrote {}", artifacts.npy.display());
    info!("wrote {}", artifacts.json.display());
    info!("wrote {}", artifacts.json_xyz.display());

    Ok(())
}
