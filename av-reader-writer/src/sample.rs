use std::{
    fmt::{Display, Formatter},
    sync::{Arc, Mutex},
};

use bytes::{Bytes, BytesMut};

use crate::time::MediaTime;

/// Uncompressed pixel layouts a reader output can be asked to decode into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8 bits per channel, B G R A byte order.
    Bgra32,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra32 => 4,
        }
    }
}

/// One decoded video frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    stride: usize,
    data: BytesMut,
}

impl PixelBuffer {
    /// Allocates a zeroed, tightly packed buffer.
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        let stride = width as usize * format.bytes_per_pixel();
        Self {
            width,
            height,
            format,
            stride,
            data: BytesMut::zeroed(stride * height as usize),
        }
    }

    /// Wraps existing pixel data. `data` must hold at least `stride * height` bytes.
    pub fn with_data(
        width: u32,
        height: u32,
        format: PixelFormat,
        stride: usize,
        data: BytesMut,
    ) -> anyhow::Result<Self> {
        let min_stride = width as usize * format.bytes_per_pixel();
        if stride < min_stride {
            anyhow::bail!("stride {} too small for width {}", stride, width);
        }
        if data.len() < stride * height as usize {
            anyhow::bail!(
                "pixel data too short: {} < {}x{}",
                data.len(),
                stride,
                height
            );
        }
        Ok(Self {
            width,
            height,
            format,
            stride,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Visible bytes of row `y` (stride padding excluded).
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.stride;
        &self.data[start..start + self.row_len()]
    }

    pub fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y as usize * self.stride;
        let len = self.row_len();
        &mut self.data[start..start + len]
    }

    fn row_len(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    fn into_storage(self) -> BytesMut {
        self.data
    }
}

impl Display for PixelBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "PixelBuffer {{ {}x{} {:?}, stride: {} }}",
            self.width, self.height, self.format, self.stride
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SamplePayload {
    /// Decoded frame.
    Pixels(PixelBuffer),
    /// Data handed through untouched (e.g. compressed audio packets).
    Encoded(Bytes),
}

/// One unit of media data with its presentation timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleBuffer {
    presentation_time: MediaTime,
    duration: Option<MediaTime>,
    payload: SamplePayload,
}

impl SampleBuffer {
    pub fn new(
        presentation_time: MediaTime,
        duration: Option<MediaTime>,
        payload: SamplePayload,
    ) -> Self {
        Self {
            presentation_time,
            duration,
            payload,
        }
    }

    pub fn from_pixels(
        buffer: PixelBuffer,
        presentation_time: MediaTime,
        duration: Option<MediaTime>,
    ) -> Self {
        Self::new(presentation_time, duration, SamplePayload::Pixels(buffer))
    }

    pub fn from_encoded(
        data: Bytes,
        presentation_time: MediaTime,
        duration: Option<MediaTime>,
    ) -> Self {
        Self::new(presentation_time, duration, SamplePayload::Encoded(data))
    }

    pub fn presentation_time(&self) -> MediaTime {
        self.presentation_time
    }

    pub fn duration(&self) -> Option<MediaTime> {
        self.duration
    }

    pub fn into_payload(self) -> SamplePayload {
        self.payload
    }

    /// The decoded frame, when this sample carries one.
    pub fn image_buffer(&self) -> Option<&PixelBuffer> {
        match &self.payload {
            SamplePayload::Pixels(buffer) => Some(buffer),
            SamplePayload::Encoded(_) => None,
        }
    }

    pub fn image_buffer_mut(&mut self) -> Option<&mut PixelBuffer> {
        match &mut self.payload {
            SamplePayload::Pixels(buffer) => Some(buffer),
            SamplePayload::Encoded(_) => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PixelBufferAttributes {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

/// Reuse pool for output frames, bound to a writer input.
///
/// Cloning shares the pool. Buffers handed back through [`PixelBufferPool::recycle`]
/// are reused by later [`PixelBufferPool::create_pixel_buffer`] calls.
#[derive(Clone, Debug)]
pub struct PixelBufferPool {
    inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    attributes: PixelBufferAttributes,
    max_free: usize,
    free: Mutex<Vec<BytesMut>>,
}

impl PixelBufferPool {
    const DEFAULT_MAX_FREE: usize = 8;

    pub fn new(attributes: PixelBufferAttributes) -> Self {
        Self::with_capacity(attributes, Self::DEFAULT_MAX_FREE)
    }

    pub fn with_capacity(attributes: PixelBufferAttributes, max_free: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                attributes,
                max_free,
                free: Mutex::new(Vec::with_capacity(max_free)),
            }),
        }
    }

    pub fn create_pixel_buffer(&self) -> PixelBuffer {
        let attrs = self.inner.attributes;
        let stride = attrs.width as usize * attrs.format.bytes_per_pixel();
        let recycled = self
            .inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        match recycled {
            Some(data) => PixelBuffer {
                width: attrs.width,
                height: attrs.height,
                format: attrs.format,
                stride,
                data,
            },
            None => PixelBuffer::new(attrs.width, attrs.height, attrs.format),
        }
    }

    /// Returns a buffer's storage to the pool. Buffers of another shape are dropped.
    pub fn recycle(&self, buffer: PixelBuffer) {
        let attrs = self.inner.attributes;
        if buffer.width != attrs.width
            || buffer.height != attrs.height
            || buffer.format != attrs.format
            || buffer.stride != attrs.width as usize * attrs.format.bytes_per_pixel()
        {
            return;
        }
        let mut free = self.inner.free.lock().unwrap_or_else(|e| e.into_inner());
        if free.len() < self.inner.max_free {
            free.push(buffer.into_storage());
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner
            .free
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> PixelBufferAttributes {
        PixelBufferAttributes {
            width: 4,
            height: 2,
            format: PixelFormat::Bgra32,
        }
    }

    #[test]
    fn test_pool_reuses_storage() {
        let pool = PixelBufferPool::new(attrs());
        let mut buffer = pool.create_pixel_buffer();
        assert_eq!(buffer.data().len(), 32);
        buffer.row_mut(1)[0] = 7;
        pool.recycle(buffer);
        assert_eq!(pool.free_count(), 1);

        let reused = pool.create_pixel_buffer();
        assert_eq!(reused.row(1)[0], 7);
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_pool_rejects_foreign_buffers() {
        let pool = PixelBufferPool::new(attrs());
        pool.recycle(PixelBuffer::new(8, 8, PixelFormat::Bgra32));
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_with_data_checks_length() {
        assert!(PixelBuffer::with_data(2, 2, PixelFormat::Bgra32, 8, BytesMut::zeroed(15)).is_err());
        assert!(PixelBuffer::with_data(2, 2, PixelFormat::Bgra32, 4, BytesMut::zeroed(16)).is_err());
        let b = PixelBuffer::with_data(2, 2, PixelFormat::Bgra32, 12, BytesMut::zeroed(24)).unwrap();
        assert_eq!(b.row(1).len(), 8);
    }
}
