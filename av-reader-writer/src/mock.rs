//! In-memory collaborators for driving channels and transcoders in tests.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, OnceLock,
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::{
    media::{
        AffineTransform, Asset, AssetMetadata, AssetReader, AssetWriter, ContainerFormat,
        FormatDescription, InputSettings, MediaKind, OutputSettings, ReaderOutput, ReaderStatus,
        Size, TrackInfo, WriterFactory, WriterInput, WriterStatus,
    },
    sample::{PixelBuffer, PixelBufferAttributes, PixelBufferPool, PixelFormat, SampleBuffer},
    time::MediaTime,
};

pub const FILL: [u8; 4] = [10, 20, 30, 255];

#[derive(Clone, Debug)]
pub struct MockTrack {
    pub info: TrackInfo,
    pub samples: Vec<SampleBuffer>,
}

pub fn video_track(
    id: usize,
    seconds: i64,
    fps: i32,
    size: Size,
    format_description: Option<FormatDescription>,
) -> MockTrack {
    let samples = (0..seconds * fps as i64)
        .map(|i| {
            let mut frame = PixelBuffer::new(size.width, size.height, PixelFormat::Bgra32);
            for px in frame.data_mut().chunks_exact_mut(4) {
                px.copy_from_slice(&FILL);
            }
            SampleBuffer::from_pixels(frame, MediaTime::new(i, fps), Some(MediaTime::new(1, fps)))
        })
        .collect();
    MockTrack {
        info: TrackInfo {
            id,
            kind: MediaKind::Video,
            natural_size: size,
            preferred_transform: AffineTransform::IDENTITY,
            format_description,
        },
        samples,
    }
}

pub fn audio_track(id: usize, seconds: i64) -> MockTrack {
    let samples = (0..seconds * 50)
        .map(|i| {
            SampleBuffer::from_encoded(
                Bytes::from_static(b"aac"),
                MediaTime::new(i, 50),
                Some(MediaTime::new(1, 50)),
            )
        })
        .collect();
    MockTrack {
        info: TrackInfo {
            id,
            kind: MediaKind::Audio,
            natural_size: Size::default(),
            preferred_transform: AffineTransform::IDENTITY,
            format_description: Some(FormatDescription {
                media_subtype: "aac".to_string(),
                ..Default::default()
            }),
        },
        samples,
    }
}

#[derive(Clone, Default)]
pub struct MockAsset {
    tracks: Vec<MockTrack>,
    duration: MediaTime,
    load_delay: Option<Duration>,
    load_error: Option<String>,
    reader_error: Option<String>,
    read_failure: Option<(usize, String)>,
}

impl MockAsset {
    pub fn new(duration: MediaTime) -> Self {
        Self {
            duration,
            ..Default::default()
        }
    }

    pub fn with_track(mut self, track: MockTrack) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn with_load_error(mut self, msg: &str) -> Self {
        self.load_error = Some(msg.to_string());
        self
    }

    pub fn with_reader_error(mut self, msg: &str) -> Self {
        self.reader_error = Some(msg.to_string());
        self
    }

    /// The reader fails once `after` samples were delivered in total.
    pub fn with_read_failure(mut self, after: usize, msg: &str) -> Self {
        self.read_failure = Some((after, msg.to_string()));
        self
    }
}

impl Asset for MockAsset {
    fn load_metadata(&self) -> BoxFuture<'static, anyhow::Result<AssetMetadata>> {
        let metadata = AssetMetadata {
            tracks: self.tracks.iter().map(|t| t.info.clone()).collect(),
            duration: self.duration,
        };
        let delay = self.load_delay;
        let error = self.load_error.clone();
        Box::pin(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(msg) = error {
                anyhow::bail!(msg);
            }
            Ok(metadata)
        })
    }

    fn create_reader(&self) -> anyhow::Result<Box<dyn AssetReader>> {
        if let Some(msg) = &self.reader_error {
            anyhow::bail!(msg.clone());
        }
        Ok(Box::new(MockReader {
            tracks: self.tracks.clone(),
            shared: Arc::new(ReaderShared {
                status: Mutex::new(ReaderStatus::Unknown),
                error: Mutex::new(None),
                delivered: AtomicUsize::new(0),
                failure: self.read_failure.clone(),
            }),
        }))
    }
}

struct ReaderShared {
    status: Mutex<ReaderStatus>,
    error: Mutex<Option<anyhow::Error>>,
    delivered: AtomicUsize,
    failure: Option<(usize, String)>,
}

impl ReaderShared {
    fn status(&self) -> ReaderStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: ReaderStatus) {
        *self.status.lock().unwrap() = status;
    }
}

struct MockReader {
    tracks: Vec<MockTrack>,
    shared: Arc<ReaderShared>,
}

impl AssetReader for MockReader {
    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: OutputSettings,
    ) -> anyhow::Result<Box<dyn ReaderOutput>> {
        let source = self
            .tracks
            .iter()
            .find(|t| t.info.id == track.id)
            .ok_or_else(|| anyhow::anyhow!("no track {}", track.id))?;
        if track.kind == MediaKind::Video && settings == OutputSettings::Passthrough {
            anyhow::bail!("mock video tracks are only available decoded");
        }
        Ok(Box::new(MockReaderOutput {
            samples: source.samples.iter().cloned().collect(),
            shared: self.shared.clone(),
        }))
    }

    fn start_reading(&mut self) -> anyhow::Result<()> {
        self.shared.set_status(ReaderStatus::Reading);
        Ok(())
    }

    fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.shared.error.lock().unwrap().take()
    }

    fn cancel_reading(&mut self) {
        self.shared.set_status(ReaderStatus::Cancelled);
    }
}

struct MockReaderOutput {
    samples: VecDeque<SampleBuffer>,
    shared: Arc<ReaderShared>,
}

impl MockReaderOutput {
    fn next_sample(&mut self) -> Option<SampleBuffer> {
        if self.shared.status() != ReaderStatus::Reading {
            return None;
        }
        if let Some((after, msg)) = &self.shared.failure {
            if self.shared.delivered.load(Ordering::SeqCst) >= *after {
                *self.shared.error.lock().unwrap() = Some(anyhow::anyhow!(msg.clone()));
                self.shared.set_status(ReaderStatus::Failed);
                return None;
            }
        }
        let sample = self.samples.pop_front()?;
        self.shared.delivered.fetch_add(1, Ordering::SeqCst);
        Some(sample)
    }
}

impl ReaderOutput for MockReaderOutput {
    fn copy_next_sample_buffer(&mut self) -> BoxFuture<'_, Option<SampleBuffer>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.next_sample()
        })
    }
}

#[derive(Clone, Debug)]
pub struct Appended {
    pub kind: MediaKind,
    pub presentation_time: MediaTime,
    pub pixels: Option<PixelBuffer>,
    pub via_pool: bool,
}

#[derive(Clone, Debug, Default)]
pub struct WriterRecord {
    pub paths: Vec<PathBuf>,
    pub inputs: Vec<InputSettings>,
    pub appended: Vec<Appended>,
    pub marked_finished: Vec<MediaKind>,
    pub session_start: Option<MediaTime>,
    pub started: bool,
    pub finished: bool,
    pub cancelled: bool,
    pub refills: usize,
}

impl WriterRecord {
    pub fn appended_of(&self, kind: MediaKind) -> Vec<&Appended> {
        self.appended.iter().filter(|a| a.kind == kind).collect()
    }
}

#[derive(Clone, Default)]
pub struct WriterOptions {
    pub create_error: Option<String>,
    pub finish_error: Option<String>,
    /// Appends beyond this many samples are rejected and fail the writer.
    pub reject_after: Option<usize>,
    /// Samples accepted per readiness round; 0 means always ready.
    pub ready_budget: usize,
}

#[derive(Clone, Default)]
pub struct MockWriterFactory {
    options: WriterOptions,
    record: Arc<Mutex<WriterRecord>>,
}

impl MockWriterFactory {
    pub fn new(options: WriterOptions) -> Self {
        Self {
            options,
            record: Arc::default(),
        }
    }

    pub fn record(&self) -> WriterRecord {
        self.record.lock().unwrap().clone()
    }

    /// A standalone input, for exercising a channel without a transcoder.
    pub fn input(&self, kind: MediaKind, pool: Option<PixelBufferPool>) -> Box<dyn WriterInput> {
        let shared = Arc::new(WriterShared {
            status: Mutex::new(WriterStatus::Writing),
            error: Mutex::new(None),
            appended: AtomicUsize::new(0),
        });
        let cell = Arc::new(OnceLock::new());
        if let Some(pool) = pool {
            let _ = cell.set(pool);
        }
        Box::new(MockWriterInput::new(
            kind,
            self.options.clone(),
            self.record.clone(),
            shared,
            cell,
        ))
    }
}

impl WriterFactory for MockWriterFactory {
    fn create_writer(
        &self,
        path: &Path,
        format: ContainerFormat,
    ) -> anyhow::Result<Box<dyn AssetWriter>> {
        if let Some(msg) = &self.options.create_error {
            anyhow::bail!(msg.clone());
        }
        assert_eq!(format, ContainerFormat::QuickTimeMovie);
        self.record.lock().unwrap().paths.push(path.to_path_buf());
        Ok(Box::new(MockWriter {
            options: self.options.clone(),
            record: self.record.clone(),
            shared: Arc::new(WriterShared {
                status: Mutex::new(WriterStatus::Unknown),
                error: Mutex::new(None),
                appended: AtomicUsize::new(0),
            }),
            pools: Vec::new(),
        }))
    }
}

struct WriterShared {
    status: Mutex<WriterStatus>,
    error: Mutex<Option<anyhow::Error>>,
    appended: AtomicUsize,
}

impl WriterShared {
    fn status(&self) -> WriterStatus {
        *self.status.lock().unwrap()
    }

    fn set_status(&self, status: WriterStatus) {
        *self.status.lock().unwrap() = status;
    }
}

struct MockWriter {
    options: WriterOptions,
    record: Arc<Mutex<WriterRecord>>,
    shared: Arc<WriterShared>,
    pools: Vec<(Arc<OnceLock<PixelBufferPool>>, PixelBufferAttributes)>,
}

impl AssetWriter for MockWriter {
    fn add_input(&mut self, settings: InputSettings) -> anyhow::Result<Box<dyn WriterInput>> {
        let cell = Arc::new(OnceLock::new());
        if let InputSettings::Video(video) = &settings {
            self.pools.push((
                cell.clone(),
                PixelBufferAttributes {
                    width: video.width,
                    height: video.height,
                    format: video.source_pixel_format,
                },
            ));
        }
        let kind = settings.kind();
        self.record.lock().unwrap().inputs.push(settings);
        Ok(Box::new(MockWriterInput::new(
            kind,
            self.options.clone(),
            self.record.clone(),
            self.shared.clone(),
            cell,
        )))
    }

    fn start_writing(&mut self) -> anyhow::Result<()> {
        for (cell, attributes) in &self.pools {
            let _ = cell.set(PixelBufferPool::new(*attributes));
        }
        self.shared.set_status(WriterStatus::Writing);
        self.record.lock().unwrap().started = true;
        Ok(())
    }

    fn start_session(&mut self, source_time: MediaTime) {
        self.record.lock().unwrap().session_start = Some(source_time);
    }

    fn status(&self) -> WriterStatus {
        self.shared.status()
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.shared.error.lock().unwrap().take()
    }

    fn finish_writing(&mut self) -> BoxFuture<'static, anyhow::Result<()>> {
        let shared = self.shared.clone();
        let record = self.record.clone();
        let finish_error = self.options.finish_error.clone();
        Box::pin(async move {
            tokio::task::yield_now().await;
            if let Some(msg) = finish_error {
                shared.set_status(WriterStatus::Failed);
                anyhow::bail!(msg);
            }
            shared.set_status(WriterStatus::Completed);
            record.lock().unwrap().finished = true;
            Ok(())
        })
    }

    fn cancel_writing(&mut self) {
        self.shared.set_status(WriterStatus::Cancelled);
        self.record.lock().unwrap().cancelled = true;
    }
}

struct MockWriterInput {
    kind: MediaKind,
    options: WriterOptions,
    record: Arc<Mutex<WriterRecord>>,
    shared: Arc<WriterShared>,
    pool: Arc<OnceLock<PixelBufferPool>>,
    remaining: AtomicUsize,
}

impl MockWriterInput {
    fn new(
        kind: MediaKind,
        options: WriterOptions,
        record: Arc<Mutex<WriterRecord>>,
        shared: Arc<WriterShared>,
        pool: Arc<OnceLock<PixelBufferPool>>,
    ) -> Self {
        let remaining = AtomicUsize::new(options.ready_budget);
        Self {
            kind,
            options,
            record,
            shared,
            pool,
            remaining,
        }
    }

    fn accept(&self) -> bool {
        if self.shared.status() != WriterStatus::Writing {
            return false;
        }
        if let Some(limit) = self.options.reject_after {
            if self.shared.appended.load(Ordering::SeqCst) >= limit {
                *self.shared.error.lock().unwrap() =
                    Some(anyhow::anyhow!("mock writer rejected sample"));
                self.shared.set_status(WriterStatus::Failed);
                return false;
            }
        }
        self.shared.appended.fetch_add(1, Ordering::SeqCst);
        if self.options.ready_budget > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }
}

impl WriterInput for MockWriterInput {
    fn media_kind(&self) -> MediaKind {
        self.kind
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        self.options.ready_budget == 0 || self.remaining.load(Ordering::SeqCst) > 0
    }

    fn when_ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if !self.is_ready_for_more_media_data() {
                tokio::task::yield_now().await;
                self.remaining
                    .store(self.options.ready_budget, Ordering::SeqCst);
                self.record.lock().unwrap().refills += 1;
            }
        })
    }

    fn append_sample_buffer(&mut self, sample: SampleBuffer) -> bool {
        if !self.accept() {
            return false;
        }
        let presentation_time = sample.presentation_time();
        let pixels = sample.image_buffer().cloned();
        self.record.lock().unwrap().appended.push(Appended {
            kind: self.kind,
            presentation_time,
            pixels,
            via_pool: false,
        });
        true
    }

    fn append_pixel_buffer(&mut self, buffer: PixelBuffer, presentation_time: MediaTime) -> bool {
        if !self.accept() {
            return false;
        }
        self.record.lock().unwrap().appended.push(Appended {
            kind: self.kind,
            presentation_time,
            pixels: Some(buffer),
            via_pool: true,
        });
        true
    }

    fn pixel_buffer_pool(&self) -> Option<PixelBufferPool> {
        self.pool.get().cloned()
    }

    fn mark_as_finished(&mut self) {
        self.record.lock().unwrap().marked_finished.push(self.kind);
    }
}
