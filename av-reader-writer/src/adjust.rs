use std::fmt::{Debug, Formatter};

use crate::sample::PixelBuffer;

type InPlaceFn = dyn Fn(&mut PixelBuffer) + Send + Sync;
type IntoOutputFn = dyn Fn(&PixelBuffer, &mut PixelBuffer) + Send + Sync;

/// Per-frame video adjustment supplied by the caller.
///
/// Both members are optional. A channel writing through a pixel buffer pool uses
/// `into_output` when present; otherwise `in_place` runs on the decoded frame
/// before it is written. With neither member, frames pass through unmodified.
///
/// Callbacks run synchronously on a channel's pump loop and may be invoked from
/// the audio and video channels at the same time.
#[derive(Default)]
pub struct AdjustCallback {
    in_place: Option<Box<InPlaceFn>>,
    into_output: Option<Box<IntoOutputFn>>,
}

impl AdjustCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_place<F>(f: F) -> Self
    where
        F: Fn(&mut PixelBuffer) + Send + Sync + 'static,
    {
        Self::new().with_in_place(f)
    }

    pub fn into_output<F>(f: F) -> Self
    where
        F: Fn(&PixelBuffer, &mut PixelBuffer) + Send + Sync + 'static,
    {
        Self::new().with_into_output(f)
    }

    pub fn with_in_place<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut PixelBuffer) + Send + Sync + 'static,
    {
        self.in_place = Some(Box::new(f));
        self
    }

    pub fn with_into_output<F>(mut self, f: F) -> Self
    where
        F: Fn(&PixelBuffer, &mut PixelBuffer) + Send + Sync + 'static,
    {
        self.into_output = Some(Box::new(f));
        self
    }

    pub fn has_in_place(&self) -> bool {
        self.in_place.is_some()
    }

    pub fn has_into_output(&self) -> bool {
        self.into_output.is_some()
    }

    /// Returns `false` when no in-place member is registered.
    pub fn adjust_pixel_buffer(&self, buffer: &mut PixelBuffer) -> bool {
        match &self.in_place {
            Some(f) => {
                f(buffer);
                true
            }
            None => false,
        }
    }

    /// Returns `false` when no two-buffer member is registered.
    pub fn adjust_pixel_buffer_into(&self, input: &PixelBuffer, output: &mut PixelBuffer) -> bool {
        match &self.into_output {
            Some(f) => {
                f(input, output);
                true
            }
            None => false,
        }
    }
}

impl Debug for AdjustCallback {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdjustCallback")
            .field("in_place", &self.in_place.is_some())
            .field("into_output", &self.into_output.is_some())
            .finish()
    }
}
