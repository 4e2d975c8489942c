//! livecal CLI: offline calibration from image files and batch undistortion.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use livecal::calib::RectificationMapBuilder;
use livecal::chessboard::ChessboardFinder;
use livecal::core::ChessboardPattern;
use livecal::{
    AddOutcome, CalibrationFile, CalibrationSession, CameraVariant, ChessboardDetectionTask, Frame,
    ImageSize, PixelFormat, SessionConfig, TaskOutcome,
};
use log::{info, warn};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "livecal")]
#[command(about = "Calibrate a camera from chessboard images and undistort frames")]
#[command(version)]
struct Cli {
    /// Log debug messages.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the board in every image and solve for the camera model.
    Calibrate(CalibrateArgs),

    /// Rectify one image with a saved calibration.
    Undistort(UndistortArgs),
}

#[derive(Debug, Clone, Args)]
struct CalibrateArgs {
    /// Session config (JSON). Defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Input images, all of the same size.
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Where to write the calibration file (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Inner corner rows of the board.
    #[arg(long)]
    rows: Option<usize>,

    /// Inner corner columns of the board.
    #[arg(long)]
    cols: Option<usize>,

    /// Board square size in world units.
    #[arg(long)]
    square_size: Option<f64>,

    /// Calibrate the fisheye model instead of the rational pinhole model.
    #[arg(long)]
    fisheye: bool,
}

#[derive(Debug, Clone, Args)]
struct UndistortArgs {
    /// Calibration file written by `calibrate`.
    #[arg(long)]
    calibration: PathBuf,

    #[arg(long)]
    input: PathBuf,

    #[arg(long)]
    output: PathBuf,

    /// Override the stored free-scaling parameter in [0, 1].
    #[arg(long)]
    alpha: Option<f64>,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Calibrate(args) => run_calibrate(&args),
        Commands::Undistort(args) => run_undistort(&args),
    }
}

#[cfg(feature = "tracing")]
fn init_logging(_verbose: bool) -> CliResult<()> {
    livecal::core::init_tracing(false);
    Ok(())
}

#[cfg(not(feature = "tracing"))]
fn init_logging(verbose: bool) -> CliResult<()> {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    livecal::core::init_with_level(level)?;
    Ok(())
}

fn load_frame(path: &Path) -> CliResult<Frame> {
    let img = image::open(path)?.to_rgb8();
    let (w, h) = img.dimensions();
    Ok(Frame::new(w as usize, h as usize, PixelFormat::Rgb8, img.into_raw())?)
}

fn save_frame(frame: Frame, path: &Path) -> CliResult<()> {
    let (w, h) = (frame.width() as u32, frame.height() as u32);
    match frame.format() {
        PixelFormat::Gray8 => image::GrayImage::from_raw(w, h, frame.into_data())
            .ok_or("frame buffer does not match its size")?
            .save(path)?,
        PixelFormat::Rgb8 | PixelFormat::Bgr8 => {
            image::RgbImage::from_raw(w, h, frame.to_color().into_data())
                .ok_or("frame buffer does not match its size")?
                .save(path)?
        }
    }
    Ok(())
}

// ── calibrate ──────────────────────────────────────────────────────────

fn calibrate_config(args: &CalibrateArgs, first: &Frame) -> CliResult<SessionConfig> {
    let mut cfg = match &args.config {
        Some(path) => SessionConfig::load_json(path)?,
        None => SessionConfig {
            image_size: first.size(),
            ..SessionConfig::default()
        },
    };
    let p = cfg.pattern;
    cfg.pattern = ChessboardPattern::new(
        args.rows.unwrap_or(p.size.rows),
        args.cols.unwrap_or(p.size.cols),
        args.square_size.unwrap_or(p.square_size),
    );
    if args.fisheye {
        cfg.variant = CameraVariant::Fisheye;
    }
    cfg.validate()?;
    Ok(cfg)
}

fn run_calibrate(args: &CalibrateArgs) -> CliResult<()> {
    let first = load_frame(&args.images[0])?;
    let cfg = calibrate_config(args, &first)?;
    let size = cfg.image_size;
    info!(
        "calibrating {:?} at {}x{} with a {}x{} board",
        cfg.variant, size.width, size.height, cfg.pattern.size.rows, cfg.pattern.size.cols
    );

    let finder = Arc::new(ChessboardFinder::new(cfg.finder.clone()));
    let session = Arc::new(CalibrationSession::new(cfg)?);

    let mut found = 0usize;
    let mut pending = Some(first);
    for path in &args.images {
        let frame = match pending.take() {
            Some(frame) => frame,
            None => load_frame(path)?,
        };
        if frame.size() != size {
            warn!(
                "{}: {}x{} does not match {}x{}, skipped",
                path.display(),
                frame.width(),
                frame.height(),
                size.width,
                size.height
            );
            continue;
        }
        let task = ChessboardDetectionTask::new(&session, finder.clone(), Arc::new(frame));
        match task.run() {
            TaskOutcome::Submitted(Ok(outcome)) => {
                found += 1;
                if let AddOutcome::Calibrated(summary) = outcome {
                    info!(
                        "{}: rms {:.4}px over {} views",
                        path.display(),
                        summary.reprojection_error,
                        summary.observation_count
                    );
                }
            }
            TaskOutcome::Submitted(Err(err)) => warn!("{}: {err}", path.display()),
            TaskOutcome::NotFound => info!("{}: no board", path.display()),
            TaskOutcome::Failed(err) => warn!("{}: {err}", path.display()),
            TaskOutcome::SessionGone => break,
        }
    }

    if !session.is_ready() {
        return Err(format!(
            "no calibration: board found in {found} of {} images (need {})",
            args.images.len(),
            session.config().accumulator.min_observations
        )
        .into());
    }

    session.save_file(&args.out)?;
    let p = session.parameters();
    let k = p.intrinsics;
    println!(
        "fx={:.3} fy={:.3} cx={:.3} cy={:.3} rms={:.4}px views={}",
        k.fx, k.fy, k.cx, k.cy, p.reprojection_error, found
    );
    println!("calibration written to {}", args.out.display());
    Ok(())
}

// ── undistort ──────────────────────────────────────────────────────────

fn run_undistort(args: &UndistortArgs) -> CliResult<()> {
    let mut model = CalibrationFile::load(&args.calibration)?.to_model()?;
    if let Some(alpha) = args.alpha {
        model.set_alpha(alpha);
    }
    let frame = load_frame(&args.input)?;
    let expected: ImageSize = model.image_size();
    if frame.size() != expected {
        return Err(format!(
            "{} is {}x{}, calibration is for {}x{}",
            args.input.display(),
            frame.width(),
            frame.height(),
            expected.width,
            expected.height
        )
        .into());
    }

    let tables = RectificationMapBuilder::build(&model)?;
    save_frame(tables.remap(&frame), &args.output)?;
    info!("undistorted image written to {}", args.output.display());
    Ok(())
}
