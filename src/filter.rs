use std::{fmt::Display, str::FromStr};

use av_reader_writer::{AdjustCallback, PixelBuffer, PixelFormat};
use serde::{Deserialize, Serialize};

/// Color filters applied to every decoded video frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPreset {
    #[default]
    Sepia,
    Mono,
    Invert,
    None,
}

impl FilterPreset {
    pub const ALL: [FilterPreset; 4] = [
        FilterPreset::Sepia,
        FilterPreset::Mono,
        FilterPreset::Invert,
        FilterPreset::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterPreset::Sepia => "sepia",
            FilterPreset::Mono => "mono",
            FilterPreset::Invert => "invert",
            FilterPreset::None => "none",
        }
    }

    fn names() -> String {
        Self::ALL
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Filtered `[b, g, r]` before blending.
    fn map(&self, b: u8, g: u8, r: u8) -> [f32; 3] {
        let (b, g, r) = (b as f32, g as f32, r as f32);
        match self {
            FilterPreset::Sepia => [
                0.272 * r + 0.534 * g + 0.131 * b,
                0.349 * r + 0.686 * g + 0.168 * b,
                0.393 * r + 0.769 * g + 0.189 * b,
            ],
            FilterPreset::Mono => {
                let y = 0.299 * r + 0.587 * g + 0.114 * b;
                [y, y, y]
            }
            FilterPreset::Invert => [255.0 - b, 255.0 - g, 255.0 - r],
            FilterPreset::None => [b, g, r],
        }
    }

    /// Filters one BGRA pixel in place; alpha is kept.
    pub fn apply_pixel(&self, intensity: f32, px: &mut [u8]) {
        let filtered = self.map(px[0], px[1], px[2]);
        for (channel, target) in px.iter_mut().take(3).zip(filtered) {
            let original = *channel as f32;
            let blended = original + (target - original) * intensity;
            *channel = blended.round().clamp(0.0, 255.0) as u8;
        }
    }

    pub fn apply_in_place(&self, intensity: f32, buffer: &mut PixelBuffer) {
        if *self == FilterPreset::None || buffer.format() != PixelFormat::Bgra32 {
            return;
        }
        for y in 0..buffer.height() {
            for px in buffer.row_mut(y).chunks_exact_mut(4) {
                self.apply_pixel(intensity, px);
            }
        }
    }

    /// Writes the filtered `input` into `output`. Only the overlapping area is touched.
    pub fn apply_into(&self, intensity: f32, input: &PixelBuffer, output: &mut PixelBuffer) {
        if input.format() != PixelFormat::Bgra32 || output.format() != PixelFormat::Bgra32 {
            log::warn!("filter skipped: frames are not BGRA");
            return;
        }
        let rows = input.height().min(output.height());
        for y in 0..rows {
            let src = input.row(y);
            let dst = output.row_mut(y);
            let len = src.len().min(dst.len());
            dst[..len].copy_from_slice(&src[..len]);
            if *self != FilterPreset::None {
                for px in dst[..len].chunks_exact_mut(4) {
                    self.apply_pixel(intensity, px);
                }
            }
        }
    }

    /// Frame adjustment for the transcoder. `None` yields an empty callback, so frames pass through.
    pub fn adjust_callback(self, intensity: f32) -> AdjustCallback {
        if self == FilterPreset::None {
            return AdjustCallback::new();
        }
        let intensity = intensity.clamp(0.0, 1.0);
        AdjustCallback::in_place(move |buffer| self.apply_in_place(intensity, buffer))
            .with_into_output(move |input, output| self.apply_into(intensity, input, output))
    }
}

impl Display for FilterPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterPreset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| {
                anyhow::anyhow!("unknown filter '{}', expected one of: {}", s, Self::names())
            })
    }
}

#[cfg(test)]
#[path = "filter_test.rs"]
mod filter_test;
