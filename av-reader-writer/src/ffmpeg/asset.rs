use std::path::{Path, PathBuf};

use anyhow::Context as _;
use futures::future::BoxFuture;

use super::{
    audio_description, codec_name, extradata, media_time, sample_aspect_ratio, video_size,
    FfmpegReader,
};
use crate::{
    media::{AffineTransform, Asset, AssetMetadata, AssetReader, FormatDescription, MediaKind, TrackInfo},
    time::MediaTime,
};

/// A media file opened through FFmpeg.
#[derive(Clone, Debug)]
pub struct FfmpegAsset {
    path: PathBuf,
}

impl FfmpegAsset {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Asset for FfmpegAsset {
    fn load_metadata(&self) -> BoxFuture<'static, anyhow::Result<AssetMetadata>> {
        let path = self.path.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || probe(&path))
                .await
                .map_err(|e| anyhow::anyhow!("probe task: {}", e))?
        })
    }

    fn create_reader(&self) -> anyhow::Result<Box<dyn AssetReader>> {
        Ok(Box::new(FfmpegReader::new(&self.path)))
    }
}

/// Opens a file and lists its audio and video tracks.
pub fn probe(path: &Path) -> anyhow::Result<AssetMetadata> {
    let input = ffmpeg_next::format::input(&path)
        .with_context(|| format!("open {}", path.display()))?;

    let mut tracks = Vec::new();
    let mut longest_stream = MediaTime::ZERO;
    for stream in input.streams() {
        let params = stream.parameters();
        let kind = match params.medium() {
            ffmpeg_next::media::Type::Video => MediaKind::Video,
            ffmpeg_next::media::Type::Audio => MediaKind::Audio,
            _ => continue,
        };

        let d = stream.duration();
        if d != ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 && d > 0 {
            let duration = media_time(d, stream.time_base());
            if duration.seconds() > longest_stream.seconds() {
                longest_stream = duration;
            }
        }

        let track = match kind {
            MediaKind::Video => {
                let size = video_size(&params);
                let rotation = rotation_degrees(&stream).unwrap_or(0.0);
                TrackInfo {
                    id: stream.index(),
                    kind,
                    natural_size: size,
                    preferred_transform: AffineTransform::from_rotation_degrees(rotation),
                    format_description: Some(FormatDescription {
                        media_subtype: codec_name(&params),
                        dimensions: Some(size),
                        pixel_aspect_ratio: sample_aspect_ratio(&params),
                        ..Default::default()
                    }),
                }
            }
            MediaKind::Audio => TrackInfo {
                id: stream.index(),
                kind,
                natural_size: Default::default(),
                preferred_transform: AffineTransform::IDENTITY,
                format_description: Some(FormatDescription {
                    media_subtype: codec_name(&params),
                    audio: Some(audio_description(&params)),
                    extradata: extradata(&params),
                    ..Default::default()
                }),
            },
        };
        log::debug!(
            "{}: {} track {} ({})",
            path.display(),
            kind.as_str(),
            track.id,
            track
                .format_description
                .as_ref()
                .map(|f| f.media_subtype.as_str())
                .unwrap_or("unknown")
        );
        tracks.push(track);
    }

    // AV_TIME_BASE = 1_000_000; duration is in 1/AV_TIME_BASE seconds
    let d = input.duration();
    let duration = if d == ffmpeg_next::ffi::AV_NOPTS_VALUE as i64 || d <= 0 {
        longest_stream
    } else {
        MediaTime::new(d, 1_000_000)
    };

    Ok(AssetMetadata { tracks, duration })
}

/// Clockwise display rotation, from the legacy "rotate" tag or the display matrix.
fn rotation_degrees(stream: &ffmpeg_next::format::stream::Stream) -> Option<f64> {
    if let Some(rotate) = stream.metadata().get("rotate") {
        if let Ok(degrees) = rotate.parse::<f64>() {
            return Some(degrees);
        }
    }
    unsafe {
        let par = (*stream.as_ptr()).codecpar;
        if par.is_null() {
            return None;
        }
        let side_data = ffmpeg_next::ffi::av_packet_side_data_get(
            (*par).coded_side_data,
            (*par).nb_coded_side_data,
            ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
        );
        if side_data.is_null() || (*side_data).size < 9 * std::mem::size_of::<i32>() {
            return None;
        }
        let theta = ffmpeg_next::ffi::av_display_rotation_get((*side_data).data as *const i32);
        if theta.is_nan() {
            return None;
        }
        Some(-theta)
    }
}
