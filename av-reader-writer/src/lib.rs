//! Asset reader/writer pipeline: copies the audio and video of a media asset into a
//! new QuickTime movie, re-encoding video to H.264 and letting the caller adjust
//! every decoded frame on the way.

/// Registers FFmpeg components. Call once at startup before opening any asset.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod adjust;
pub mod channel;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod media;
pub mod sample;
pub mod settings;
pub mod time;
pub mod transcoder;

#[cfg(test)]
mod mock;

pub use adjust::AdjustCallback;
pub use error::TranscodeError;
pub use sample::{PixelBuffer, PixelFormat};
pub use transcoder::Transcoder;
