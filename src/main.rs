use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use replaycam::{run_source, PassthroughCodec, ReplayConfig, ReplayPipeline, TestPatternSource};

#[derive(Parser, Debug)]
#[command(name = "replaycam")]
#[command(about = "Instant replay camera pipeline with delayed viewing and clip export")]
#[command(version)]
#[command(long_about = "Runs the replaycam buffering pipeline against a synthetic test-pattern \
source: frames flow through transform, storage, reordering, and the cascading delay/replay \
windows exactly as they would from a real camera. Useful as a smoke harness; a deployment \
binds an actual camera and codec behind the library's FrameSource and FrameCodec traits.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "replaycam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without starting the pipeline")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Synthetic frame width
    #[arg(long, default_value_t = 640, help = "Width of the generated test pattern")]
    width: u32,

    /// Synthetic frame height
    #[arg(long, default_value_t = 480, help = "Height of the generated test pattern")]
    height: u32,

    /// Stop after this many seconds (0 = run until Ctrl-C)
    #[arg(long, default_value_t = 0, help = "Run duration in seconds, 0 for unbounded")]
    duration: u64,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_config {
        print_default_config();
        return Ok(());
    }

    init_logging(&args)?;

    info!("Starting replaycam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let config = match ReplayConfig::load_from_file(&args.config) {
        Ok(config) => {
            info!("Configuration loaded successfully from: {}", args.config);
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    let frame_rate = config.recording.frame_rate;
    let orientation = config.recording.orientation_degrees;

    let pipeline = ReplayPipeline::new(config, Arc::new(PassthroughCodec)).await?;

    // Log delay-buffer warm-up progress as the windows fill
    let mut fill = pipeline.fill_state();
    tokio::spawn(async move {
        let mut last_reported = 0usize;
        while fill.changed().await.is_ok() {
            let (current, target) = *fill.borrow_and_update();
            if current >= target || current.saturating_sub(last_reported) >= target / 10 + 1 {
                info!("Delay buffer warming up: {}/{} frames", current, target);
                last_reported = current;
            }
        }
    });

    let shutdown = CancellationToken::new();

    let ctrl_c_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, stopping capture");
            ctrl_c_token.cancel();
        }
    });

    if args.duration > 0 {
        let timer_token = shutdown.clone();
        let duration = Duration::from_secs(args.duration);
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            info!("Run duration elapsed, stopping capture");
            timer_token.cancel();
        });
    }

    let mut source = TestPatternSource::new(args.width, args.height, frame_rate, orientation);
    run_source(&pipeline, &mut source, shutdown).await;

    let stats = pipeline.stats().await?;
    info!(
        "Final buffer state: delay {}/{}, replay {}/{}",
        stats.delay_len, stats.delay_capacity, stats.replay_len, stats.replay_capacity
    );

    pipeline.shutdown().await?;
    info!("replaycam exited cleanly");
    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("replaycam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .boxed()
        }
        Some("compact") => {
            fmt::layer()
                .compact()
                .with_target(false)
                .with_thread_ids(false)
                .boxed()
        }
        Some("pretty") | None => {
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(args.debug)
                .boxed()
        }
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(true).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() {
    let default_config = r#"# Replaycam Configuration File
# This is the default configuration with all available options

[recording]
# Frames per second delivered by the camera
frame_rate = 30
# Length of the viewing delay in seconds
delay_seconds = 10
# Length of the replay clip window in seconds
replay_seconds = 5
# Rotation applied to every incoming frame (0, 90, 180, 270)
orientation_degrees = 0

[storage]
# Root working directory for buffered frames (ephemeral, rebuilt per session)
root = "./replaycam_work"

[export]
# Directory where finished video clips and still images are written
path = "./exports"
# Target bit rate handed to the external video encoder
bit_rate = 6000000
# Write a JSON metadata sidecar next to each exported video
save_metadata = true

[system]
# Maximum number of frames in the transform stage at once
max_frames_in_flight = 16
# Capacity of the channel feeding the window mutation task
mutation_queue_capacity = 256
"#;

    println!("{}", default_config);
}
