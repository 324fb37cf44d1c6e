use crate::{
    media::{CompressionProperties, InputSettings, MediaKind, Size, TrackInfo, VideoCodec, VideoSettings},
    sample::PixelFormat,
};

/// H.264 writer settings for a source video track.
///
/// Dimensions come from the track's format description when it has them, otherwise
/// from the natural size. Clean aperture and pixel aspect ratio are carried over
/// unchanged, as is the orientation transform.
pub fn video_settings(track: &TrackInfo) -> VideoSettings {
    let format = track.format_description.as_ref();
    let Size { width, height } = format
        .and_then(|f| f.dimensions)
        .unwrap_or(track.natural_size);

    let clean_aperture = format.and_then(|f| f.clean_aperture);
    let pixel_aspect_ratio = format.and_then(|f| f.pixel_aspect_ratio);
    let compression = if clean_aperture.is_some() || pixel_aspect_ratio.is_some() {
        Some(CompressionProperties {
            clean_aperture,
            pixel_aspect_ratio,
        })
    } else {
        None
    };

    VideoSettings {
        codec: VideoCodec::H264,
        width,
        height,
        compression,
        transform: track.preferred_transform,
        source_pixel_format: PixelFormat::Bgra32,
    }
}

/// Writer settings that copy the track's samples as read.
pub fn passthrough_settings(track: &TrackInfo) -> InputSettings {
    InputSettings::Passthrough {
        kind: track.kind,
        source_format: track.format_description.clone(),
    }
}

pub fn input_settings(track: &TrackInfo) -> InputSettings {
    match track.kind {
        MediaKind::Audio => passthrough_settings(track),
        MediaKind::Video => InputSettings::Video(video_settings(track)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AffineTransform, CleanAperture, FormatDescription, PixelAspectRatio};

    fn video_track(format_description: Option<FormatDescription>) -> TrackInfo {
        TrackInfo {
            id: 0,
            kind: MediaKind::Video,
            natural_size: Size::new(640, 480),
            preferred_transform: AffineTransform::from_rotation_degrees(90.0),
            format_description,
        }
    }

    #[test]
    fn test_dimensions_fall_back_to_natural_size() {
        let settings = video_settings(&video_track(None));
        assert_eq!((settings.width, settings.height), (640, 480));
        assert!(settings.compression.is_none());
        assert_eq!(settings.transform.rotation_degrees(), 90.0);
        assert_eq!(settings.codec, VideoCodec::H264);
    }

    #[test]
    fn test_format_description_wins() {
        let clean_aperture = CleanAperture {
            width: (1916, 1),
            height: (1076, 1),
            horizontal_offset: (0, 1),
            vertical_offset: (0, 1),
        };
        let pixel_aspect_ratio = PixelAspectRatio {
            horizontal_spacing: 4,
            vertical_spacing: 3,
        };
        let track = video_track(Some(FormatDescription {
            media_subtype: "h264".to_string(),
            dimensions: Some(Size::new(1920, 1080)),
            clean_aperture: Some(clean_aperture),
            pixel_aspect_ratio: Some(pixel_aspect_ratio),
            ..Default::default()
        }));

        let settings = video_settings(&track);
        assert_eq!((settings.width, settings.height), (1920, 1080));
        let compression = settings.compression.unwrap();
        assert_eq!(compression.clean_aperture, Some(clean_aperture));
        assert_eq!(compression.pixel_aspect_ratio, Some(pixel_aspect_ratio));
    }

    #[test]
    fn test_audio_is_passthrough() {
        let mut track = video_track(None);
        track.kind = MediaKind::Audio;
        assert_eq!(input_settings(&track).kind(), MediaKind::Audio);
        assert!(matches!(
            input_settings(&track),
            InputSettings::Passthrough { .. }
        ));
    }
}
