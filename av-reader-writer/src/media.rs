//! Collaborator interfaces the pipeline drives.
//!
//! The pipeline never decodes or encodes by itself. A media library (see the
//! `ffmpeg` module, or an in-memory fake in tests) provides assets, readers and
//! writers through the traits below.

use std::path::Path;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    sample::{PixelBuffer, PixelBufferPool, PixelFormat, SampleBuffer},
    time::MediaTime,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// 2D affine transform `[a b 0; c d 0; tx ty 1]`, used for track orientation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AffineTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub tx: f64,
    pub ty: f64,
}

impl AffineTransform {
    pub const IDENTITY: AffineTransform = AffineTransform {
        a: 1.0,
        b: 0.0,
        c: 0.0,
        d: 1.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Pure rotation, snapped to exact values for multiples of 90 degrees.
    pub fn from_rotation_degrees(degrees: f64) -> Self {
        let normalized = degrees.rem_euclid(360.0);
        let (sin, cos) = match normalized {
            n if n == 0.0 => (0.0, 1.0),
            n if n == 90.0 => (1.0, 0.0),
            n if n == 180.0 => (0.0, -1.0),
            n if n == 270.0 => (-1.0, 0.0),
            n => n.to_radians().sin_cos(),
        };
        Self {
            a: cos,
            b: sin,
            c: -sin,
            d: cos,
            tx: 0.0,
            ty: 0.0,
        }
    }

    /// Rotation component in degrees, `[0, 360)`.
    pub fn rotation_degrees(&self) -> f64 {
        let degrees = self.b.atan2(self.a).to_degrees().rem_euclid(360.0);
        // atan2 noise around whole angles
        let rounded = degrees.round();
        if (degrees - rounded).abs() < 1e-9 {
            rounded % 360.0
        } else {
            degrees
        }
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for AffineTransform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Clean aperture of a video track, all values as `numerator / denominator` pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanAperture {
    pub width: (i32, i32),
    pub height: (i32, i32),
    pub horizontal_offset: (i32, i32),
    pub vertical_offset: (i32, i32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelAspectRatio {
    pub horizontal_spacing: u32,
    pub vertical_spacing: u32,
}

impl PixelAspectRatio {
    pub fn is_square(&self) -> bool {
        self.horizontal_spacing == self.vertical_spacing
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioStreamDescription {
    pub sample_rate: u32,
    pub channels: u32,
}

/// Codec-level description of a track's samples.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FormatDescription {
    /// Codec name, e.g. "h264", "aac".
    pub media_subtype: String,
    /// Video only: presentation dimensions.
    pub dimensions: Option<Size>,
    pub clean_aperture: Option<CleanAperture>,
    pub pixel_aspect_ratio: Option<PixelAspectRatio>,
    /// Audio only.
    pub audio: Option<AudioStreamDescription>,
    /// Codec private data (e.g. an AudioSpecificConfig), needed to pass samples through.
    pub extradata: Option<Bytes>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrackInfo {
    pub id: usize,
    pub kind: MediaKind,
    pub natural_size: Size,
    pub preferred_transform: AffineTransform,
    pub format_description: Option<FormatDescription>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssetMetadata {
    pub tracks: Vec<TrackInfo>,
    pub duration: MediaTime,
}

impl AssetMetadata {
    pub fn tracks_with_kind(&self, kind: MediaKind) -> impl Iterator<Item = &TrackInfo> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn first_track(&self, kind: MediaKind) -> Option<&TrackInfo> {
        self.tracks_with_kind(kind).next()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerFormat {
    QuickTimeMovie,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutputSettings {
    /// Samples are delivered as stored in the container.
    Passthrough,
    /// Video samples are decoded to the given pixel format.
    Decompressed { pixel_format: PixelFormat },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompressionProperties {
    pub clean_aperture: Option<CleanAperture>,
    pub pixel_aspect_ratio: Option<PixelAspectRatio>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VideoSettings {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub compression: Option<CompressionProperties>,
    pub transform: AffineTransform,
    /// Layout of the frames appended through the pixel buffer pool.
    pub source_pixel_format: PixelFormat,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InputSettings {
    /// Samples are written as they were read.
    Passthrough {
        kind: MediaKind,
        source_format: Option<FormatDescription>,
    },
    Video(VideoSettings),
}

impl InputSettings {
    pub fn kind(&self) -> MediaKind {
        match self {
            InputSettings::Passthrough { kind, .. } => *kind,
            InputSettings::Video(_) => MediaKind::Video,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReaderStatus {
    Unknown,
    Reading,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterStatus {
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// A decodable media container.
pub trait Asset: Send + Sync {
    /// Resolves the track list and duration. May suspend.
    fn load_metadata(&self) -> BoxFuture<'static, anyhow::Result<AssetMetadata>>;

    fn create_reader(&self) -> anyhow::Result<Box<dyn AssetReader>>;
}

pub trait AssetReader: Send {
    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: OutputSettings,
    ) -> anyhow::Result<Box<dyn ReaderOutput>>;

    fn start_reading(&mut self) -> anyhow::Result<()>;

    fn status(&self) -> ReaderStatus;

    /// The error that moved the reader to [`ReaderStatus::Failed`], if not taken yet.
    fn take_error(&mut self) -> Option<anyhow::Error>;

    fn cancel_reading(&mut self);
}

pub trait ReaderOutput: Send {
    /// Next sample in presentation order; `None` once the stream is exhausted or the reader failed.
    fn copy_next_sample_buffer(&mut self) -> BoxFuture<'_, Option<SampleBuffer>>;
}

pub trait WriterFactory: Send + Sync {
    fn create_writer(
        &self,
        path: &Path,
        format: ContainerFormat,
    ) -> anyhow::Result<Box<dyn AssetWriter>>;
}

pub trait AssetWriter: Send {
    fn add_input(&mut self, settings: InputSettings) -> anyhow::Result<Box<dyn WriterInput>>;

    fn start_writing(&mut self) -> anyhow::Result<()>;

    fn start_session(&mut self, source_time: MediaTime);

    fn status(&self) -> WriterStatus;

    fn take_error(&mut self) -> Option<anyhow::Error>;

    /// Flushes and closes the container. Resolves once the file is complete.
    fn finish_writing(&mut self) -> BoxFuture<'static, anyhow::Result<()>>;

    /// Abandons the output; partially written data is discarded.
    fn cancel_writing(&mut self);
}

pub trait WriterInput: Send {
    fn media_kind(&self) -> MediaKind;

    fn is_ready_for_more_media_data(&self) -> bool;

    /// Resolves when the input signals readiness for more data.
    fn when_ready(&self) -> BoxFuture<'_, ()>;

    /// Returns `false` when the writer rejected the sample.
    fn append_sample_buffer(&mut self, sample: SampleBuffer) -> bool;

    fn append_pixel_buffer(&mut self, buffer: PixelBuffer, presentation_time: MediaTime) -> bool;

    /// Pool for frames appended with [`WriterInput::append_pixel_buffer`]; available once writing started.
    fn pixel_buffer_pool(&self) -> Option<PixelBufferPool>;

    fn mark_as_finished(&mut self);
}
