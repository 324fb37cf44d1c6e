use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use av_reader_writer::{
    ffmpeg::{FfmpegAsset, FfmpegWriterFactory},
    Transcoder,
};
use clap::Parser;
use photo_filter::{AppConfig, FilterPreset};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Applies a color filter to the video of a movie, copying its audio as is.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Movie to read.
    input: PathBuf,
    /// QuickTime movie to write; replaced if it exists.
    output: PathBuf,
    /// Filter preset: sepia, mono, invert or none.
    #[arg(short, long)]
    filter: Option<FilterPreset>,
    /// Filter strength, 0.0 to 1.0.
    #[arg(short, long)]
    intensity: Option<f32>,
    /// JSON file with default settings.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("av_reader_writer", log::LevelFilter::Debug)
        .filter_module("ffmpeg_next", log::LevelFilter::Warn)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let args = Args::parse();
    av_reader_writer::init()?;

    let config = AppConfig::load(args.config.as_deref())?.with_overrides(args.filter, args.intensity)?;
    log::info!(
        "filtering {} with {} at {:.2}",
        args.input.display(),
        config.filter,
        config.intensity
    );

    let mut transcoder = Transcoder::new(
        Arc::new(FfmpegAsset::new(&args.input)),
        Arc::new(FfmpegWriterFactory::new()),
    );
    transcoder.set_adjust_callback(config.filter.adjust_callback(config.intensity));

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_clone.cancel();
        }
    });

    let (tx, mut rx) = oneshot::channel();
    let reported = Arc::new(AtomicU32::new(0));
    transcoder.write_to(
        &args.output,
        move |percent| {
            let whole = percent as u32;
            if whole / 10 > reported.load(Ordering::Relaxed) / 10 {
                reported.store(whole, Ordering::Relaxed);
                log::info!("{}%", whole);
            }
        },
        move |result| {
            let _ = tx.send(result);
        },
    );

    tokio::select! {
        result = &mut rx => {
            result.map_err(|_| anyhow::anyhow!("transcode ended without a result"))??;
            log::info!("wrote {}", args.output.display());
            Ok(())
        },
        _ = cancel.cancelled() => {
            log::warn!("interrupted, cancelling");
            transcoder.cancel();
            // a cancel after setup still reports once; before setup nothing will
            let _ = tokio::time::timeout(Duration::from_secs(5), rx).await;
            anyhow::bail!("interrupted")
        },
    }
}
