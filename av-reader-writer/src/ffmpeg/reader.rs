use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use bytes::{Bytes, BytesMut};
use ffmpeg_next::{format::Pixel, software::scaling, Rational};
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{media_time, SharedState, OUTPUT_QUEUE_BOUND};
use crate::{
    media::{AssetReader, MediaKind, OutputSettings, ReaderOutput, ReaderStatus, TrackInfo},
    sample::{PixelBuffer, PixelFormat, SampleBuffer},
    time::MediaTime,
};

struct OutputRoute {
    stream_index: usize,
    kind: MediaKind,
    settings: OutputSettings,
    sender: mpsc::Sender<SampleBuffer>,
}

/// Demuxes (and for decoded outputs, decodes) one file on a blocking thread.
pub struct FfmpegReader {
    path: PathBuf,
    routes: Vec<OutputRoute>,
    shared: Arc<SharedState<ReaderStatus>>,
    cancel: CancellationToken,
}

impl FfmpegReader {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            routes: Vec::new(),
            shared: Arc::new(SharedState::new(ReaderStatus::Unknown)),
            cancel: CancellationToken::new(),
        }
    }
}

impl AssetReader for FfmpegReader {
    fn add_output(
        &mut self,
        track: &TrackInfo,
        settings: OutputSettings,
    ) -> anyhow::Result<Box<dyn ReaderOutput>> {
        if self.shared.status() != ReaderStatus::Unknown {
            anyhow::bail!("outputs must be added before reading starts");
        }
        if track.kind == MediaKind::Audio && settings != OutputSettings::Passthrough {
            anyhow::bail!("audio tracks can only be read as stored");
        }
        let (sender, receiver) = mpsc::channel(OUTPUT_QUEUE_BOUND);
        self.routes.push(OutputRoute {
            stream_index: track.id,
            kind: track.kind,
            settings,
            sender,
        });
        Ok(Box::new(FfmpegReaderOutput { receiver }))
    }

    fn start_reading(&mut self) -> anyhow::Result<()> {
        let input = ffmpeg_next::format::input(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;

        let mut routes = Vec::with_capacity(self.routes.len());
        for route in self.routes.drain(..) {
            let stream = input
                .stream(route.stream_index)
                .ok_or_else(|| anyhow::anyhow!("stream {} not found", route.stream_index))?;
            let time_base = stream.time_base();
            let rate = stream.avg_frame_rate();
            let decoder = match route.settings {
                OutputSettings::Passthrough => None,
                OutputSettings::Decompressed {
                    pixel_format: PixelFormat::Bgra32,
                } => {
                    let context = ffmpeg_next::codec::Context::from_parameters(stream.parameters())?;
                    Some(context.decoder().video()?)
                }
            };
            routes.push(ActiveRoute {
                route,
                time_base,
                frame_duration: (rate.numerator() > 0)
                    .then(|| MediaTime::new(rate.denominator() as i64, rate.numerator())),
                decoder,
                scaler: None,
            });
        }

        self.shared.set_status(ReaderStatus::Reading);
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let result = demux_loop(input, &mut routes, &cancel);
            settle(&shared, &path, result, routes);
        });
        Ok(())
    }

    fn status(&self) -> ReaderStatus {
        self.shared.status()
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.shared.take_error()
    }

    fn cancel_reading(&mut self) {
        self.cancel.cancel();
        // outputs not yet handed to the demux thread close here
        self.routes.clear();
        if !self.shared.transition(ReaderStatus::Reading, ReaderStatus::Cancelled) {
            self.shared.transition(ReaderStatus::Unknown, ReaderStatus::Cancelled);
        }
    }
}

impl Drop for FfmpegReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct FfmpegReaderOutput {
    receiver: mpsc::Receiver<SampleBuffer>,
}

impl ReaderOutput for FfmpegReaderOutput {
    fn copy_next_sample_buffer(&mut self) -> BoxFuture<'_, Option<SampleBuffer>> {
        Box::pin(self.receiver.recv())
    }
}

struct ActiveRoute {
    route: OutputRoute,
    time_base: Rational,
    frame_duration: Option<MediaTime>,
    decoder: Option<ffmpeg_next::codec::decoder::Video>,
    scaler: Option<BgraScaler>,
}

/// Converts decoded frames to BGRA; created on the demux thread at the first frame.
struct BgraScaler(scaling::Context);

unsafe impl Send for BgraScaler {}

impl ActiveRoute {
    /// Returns `false` once nobody listens on this output anymore.
    fn deliver(&self, sample: SampleBuffer) -> bool {
        self.route.sender.blocking_send(sample).is_ok()
    }

    fn handle_packet(&mut self, packet: &ffmpeg_next::Packet) -> anyhow::Result<bool> {
        if self.decoder.is_none() {
            let Some(pts) = packet.pts().or(packet.dts()) else {
                return Ok(true);
            };
            let data = packet.data().map(Bytes::copy_from_slice).unwrap_or_default();
            let duration =
                (packet.duration() > 0).then(|| media_time(packet.duration(), self.time_base));
            return Ok(self.deliver(SampleBuffer::from_encoded(
                data,
                media_time(pts, self.time_base),
                duration,
            )));
        }
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.send_packet(packet)?;
        }
        self.drain_frames()
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.send_eof()?;
            self.drain_frames()?;
        }
        Ok(())
    }

    fn drain_frames(&mut self) -> anyhow::Result<bool> {
        loop {
            let Some(decoder) = self.decoder.as_mut() else {
                return Ok(true);
            };
            let mut frame = ffmpeg_next::frame::Video::empty();
            match decoder.receive_frame(&mut frame) {
                Ok(()) => {
                    let sample = self.convert(&frame)?;
                    if let Some(sample) = sample {
                        if !self.deliver(sample) {
                            return Ok(false);
                        }
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(true)
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn convert(&mut self, frame: &ffmpeg_next::frame::Video) -> anyhow::Result<Option<SampleBuffer>> {
        let Some(pts) = frame.timestamp().or(frame.pts()) else {
            log::warn!("{} frame without timestamp dropped", self.route.kind.as_str());
            return Ok(None);
        };
        if self.scaler.is_none() {
            self.scaler = Some(BgraScaler(scaling::Context::get(
                frame.format(),
                frame.width(),
                frame.height(),
                Pixel::BGRA,
                frame.width(),
                frame.height(),
                scaling::flag::Flags::BILINEAR,
            )?));
        }
        let mut bgra = ffmpeg_next::frame::Video::empty();
        if let Some(BgraScaler(scaler)) = self.scaler.as_mut() {
            scaler.run(frame, &mut bgra)?;
        }
        let buffer = PixelBuffer::with_data(
            bgra.width(),
            bgra.height(),
            PixelFormat::Bgra32,
            bgra.stride(0),
            BytesMut::from(bgra.data(0)),
        )?;
        Ok(Some(SampleBuffer::from_pixels(
            buffer,
            media_time(pts, self.time_base),
            self.frame_duration,
        )))
    }
}

/// Publishes the final status, then closes every output.
///
/// A channel that sees its output end reads the reader status right away, so the
/// status must be final before the routes drop.
fn settle(
    shared: &SharedState<ReaderStatus>,
    path: &Path,
    result: anyhow::Result<()>,
    routes: Vec<ActiveRoute>,
) {
    match result {
        Ok(()) => {
            shared.transition(ReaderStatus::Reading, ReaderStatus::Completed);
            log::debug!("finished reading {}", path.display());
        }
        Err(e) => shared.fail(
            ReaderStatus::Failed,
            e.context(format!("read {}", path.display())),
        ),
    }
    drop(routes);
}

fn demux_loop(
    mut input: ffmpeg_next::format::context::Input,
    routes: &mut [ActiveRoute],
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    for (stream, packet) in input.packets() {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let index = stream.index();
        let Some(route) = routes.iter_mut().find(|r| r.route.stream_index == index) else {
            continue;
        };
        if route.route.sender.is_closed() {
            continue;
        }
        if !route.handle_packet(&packet)? {
            log::debug!("{} output dropped, skipping its packets", route.route.kind.as_str());
        }
    }
    for route in routes.iter_mut() {
        if cancel.is_cancelled() {
            return Ok(());
        }
        route.finish()?;
    }
    Ok(())
}
