//! FFmpeg-backed assets, readers and writers.
//!
//! Demuxing, decoding, encoding and muxing run on blocking threads; samples cross
//! into the async pipeline through bounded tokio channels.

use std::sync::Mutex;

use bytes::Bytes;
use ffmpeg_next::{codec::Parameters, Rational};

use crate::{
    media::{AudioStreamDescription, PixelAspectRatio, Size},
    time::MediaTime,
};

mod asset;
mod reader;
mod writer;

pub use asset::{probe, FfmpegAsset};
pub use reader::FfmpegReader;
pub use writer::{FfmpegWriter, FfmpegWriterFactory};

/// Samples buffered per reader output before demuxing blocks.
const OUTPUT_QUEUE_BOUND: usize = 16;
/// Samples buffered in front of the mux thread; bounds writer input readiness.
const MUX_QUEUE_BOUND: usize = 32;

/// Status plus the error that ended it, shared between a handle and its worker thread.
pub(crate) struct SharedState<S> {
    status: Mutex<S>,
    error: Mutex<Option<anyhow::Error>>,
}

impl<S: Copy + PartialEq> SharedState<S> {
    pub(crate) fn new(status: S) -> Self {
        Self {
            status: Mutex::new(status),
            error: Mutex::new(None),
        }
    }

    pub(crate) fn status(&self) -> S {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn set_status(&self, status: S) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// Moves from `from` to `to` only if still in `from`.
    pub(crate) fn transition(&self, from: S, to: S) -> bool {
        let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
        if *status != from {
            return false;
        }
        *status = to;
        true
    }

    /// Stores the error and status before logging, so readers of the status never see
    /// `failed` without its error.
    pub(crate) fn fail(&self, failed: S, err: anyhow::Error) {
        let message = format!("{:#}", err);
        *self.error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err);
        self.set_status(failed);
        log::error!("{}", message);
    }

    pub(crate) fn take_error(&self) -> Option<anyhow::Error> {
        self.error.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

fn media_time(ts: i64, time_base: Rational) -> MediaTime {
    MediaTime::from_time_base(ts, time_base.numerator(), time_base.denominator())
}

/// Decoder name for a track's codec, e.g. "h264", "aac".
fn codec_name(params: &Parameters) -> String {
    ffmpeg_next::decoder::find(params.id())
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| params.id().name().to_string())
}

/// Reads video width/height from codec parameters (not exposed by ffmpeg-next).
fn video_size(params: &Parameters) -> Size {
    unsafe {
        let ptr = params.as_ptr();
        Size::new((*ptr).width.max(0) as u32, (*ptr).height.max(0) as u32)
    }
}

fn sample_aspect_ratio(params: &Parameters) -> Option<PixelAspectRatio> {
    let sar = unsafe { (*params.as_ptr()).sample_aspect_ratio };
    if sar.num <= 0 || sar.den <= 0 {
        return None;
    }
    Some(PixelAspectRatio {
        horizontal_spacing: sar.num as u32,
        vertical_spacing: sar.den as u32,
    })
}

fn audio_description(params: &Parameters) -> AudioStreamDescription {
    unsafe {
        let ptr = params.as_ptr();
        AudioStreamDescription {
            sample_rate: (*ptr).sample_rate.max(0) as u32,
            channels: (*ptr).ch_layout.nb_channels.max(0) as u32,
        }
    }
}

fn extradata(params: &Parameters) -> Option<Bytes> {
    unsafe {
        let ptr = params.as_ptr();
        if (*ptr).extradata.is_null() || (*ptr).extradata_size <= 0 {
            return None;
        }
        let data = std::slice::from_raw_parts((*ptr).extradata, (*ptr).extradata_size as usize);
        Some(Bytes::copy_from_slice(data))
    }
}
