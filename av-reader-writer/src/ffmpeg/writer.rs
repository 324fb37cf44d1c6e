use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, OnceLock},
};

use anyhow::Context as _;
use ffmpeg_next::{
    codec::{self, Parameters},
    format::Pixel,
    software::scaling,
    Dictionary, Rational,
};
use futures::future::BoxFuture;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use super::{SharedState, MUX_QUEUE_BOUND};
use crate::{
    media::{
        AssetWriter, ContainerFormat, FormatDescription, InputSettings, MediaKind, VideoCodec,
        VideoSettings, WriterFactory, WriterInput, WriterStatus,
    },
    sample::{PixelBuffer, PixelBufferAttributes, PixelBufferPool, SampleBuffer, SamplePayload},
    time::MediaTime,
};

const ENCODER_TIMESCALE: i32 = 90_000;

/// Creates [`FfmpegWriter`]s.
///
/// Pixel aspect ratio and rotation reach the output; clean aperture has no muxer
/// field and is dropped.
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegWriterFactory;

impl FfmpegWriterFactory {
    pub fn new() -> Self {
        Self
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create_writer(
        &self,
        path: &Path,
        format: ContainerFormat,
    ) -> anyhow::Result<Box<dyn AssetWriter>> {
        Ok(Box::new(FfmpegWriter::create(path, format)?))
    }
}

enum MuxCommand {
    StartSession(MediaTime),
    Frame {
        input: usize,
        buffer: PixelBuffer,
        presentation_time: MediaTime,
    },
    Packet {
        input: usize,
        sample: SampleBuffer,
    },
    Finish,
}

struct InputSpec {
    settings: InputSettings,
    pool: Arc<OnceLock<PixelBufferPool>>,
}

/// Muxes into a container file on a blocking thread; video is encoded to H.264 there.
pub struct FfmpegWriter {
    path: PathBuf,
    output: Option<ffmpeg_next::format::context::Output>,
    inputs: Vec<InputSpec>,
    tx: mpsc::Sender<MuxCommand>,
    rx: Option<mpsc::Receiver<MuxCommand>>,
    shared: Arc<SharedState<WriterStatus>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl FfmpegWriter {
    pub fn create(path: &Path, format: ContainerFormat) -> anyhow::Result<Self> {
        let format_name = match format {
            ContainerFormat::QuickTimeMovie => "mov",
        };
        let output = ffmpeg_next::format::output_as(&path, format_name)
            .with_context(|| format!("create {}", path.display()))?;
        let (tx, rx) = mpsc::channel(MUX_QUEUE_BOUND);
        Ok(Self {
            path: path.to_path_buf(),
            output: Some(output),
            inputs: Vec::new(),
            tx,
            rx: Some(rx),
            shared: Arc::new(SharedState::new(WriterStatus::Unknown)),
            cancel: CancellationToken::new(),
            handle: None,
        })
    }
}

impl AssetWriter for FfmpegWriter {
    fn add_input(&mut self, settings: InputSettings) -> anyhow::Result<Box<dyn WriterInput>> {
        if self.output.is_none() || self.shared.status() != WriterStatus::Unknown {
            anyhow::bail!("inputs must be added before writing starts");
        }
        let kind = settings.kind();
        let pool = Arc::new(OnceLock::new());
        self.inputs.push(InputSpec {
            settings,
            pool: pool.clone(),
        });
        Ok(Box::new(FfmpegWriterInput {
            index: self.inputs.len() - 1,
            kind,
            tx: self.tx.clone(),
            permit: Mutex::new(None),
            shared: self.shared.clone(),
            pool,
        }))
    }

    fn start_writing(&mut self) -> anyhow::Result<()> {
        let mut output = self
            .output
            .take()
            .ok_or_else(|| anyhow::anyhow!("writer already started"))?;
        let rx = self
            .rx
            .take()
            .ok_or_else(|| anyhow::anyhow!("writer already started"))?;

        let global_header = output
            .format()
            .flags()
            .contains(ffmpeg_next::format::Flags::GLOBAL_HEADER);
        let mut sinks = Vec::with_capacity(self.inputs.len());
        for spec in &self.inputs {
            let sink = match &spec.settings {
                InputSettings::Video(video) => {
                    let sink = VideoSink::new(&mut output, video, global_header)?;
                    let _ = spec.pool.set(sink.pool.clone());
                    Sink::Video(sink)
                }
                InputSettings::Passthrough {
                    kind,
                    source_format,
                } => Sink::Passthrough(PassthroughSink::new(
                    &mut output,
                    *kind,
                    source_format.as_ref(),
                )?),
            };
            sinks.push(sink);
        }

        output
            .write_header()
            .with_context(|| format!("write header of {}", self.path.display()))?;
        // the muxer may pick its own stream time bases while writing the header
        for sink in &mut sinks {
            if let Some(stream) = output.stream(sink.stream_index()) {
                sink.set_stream_time_base(stream.time_base());
            }
        }

        self.shared.set_status(WriterStatus::Writing);
        let shared = self.shared.clone();
        let cancel = self.cancel.clone();
        let path = self.path.clone();
        let runtime = tokio::runtime::Handle::current();
        self.handle = Some(tokio::task::spawn_blocking(move || {
            match mux_loop(output, sinks, rx, &cancel, &runtime) {
                Ok(MuxOutcome::Finished) => {
                    shared.transition(WriterStatus::Writing, WriterStatus::Completed);
                    log::info!("wrote {}", path.display());
                }
                Ok(MuxOutcome::Cancelled) => {
                    remove_partial(&path);
                }
                Err(e) => {
                    shared.fail(
                        WriterStatus::Failed,
                        e.context(format!("write {}", path.display())),
                    );
                    remove_partial(&path);
                }
            }
        }));
        Ok(())
    }

    fn start_session(&mut self, source_time: MediaTime) {
        if self.tx.try_send(MuxCommand::StartSession(source_time)).is_err() {
            log::warn!("could not start writer session at {}", source_time);
        }
    }

    fn status(&self) -> WriterStatus {
        self.shared.status()
    }

    fn take_error(&mut self) -> Option<anyhow::Error> {
        self.shared.take_error()
    }

    fn finish_writing(&mut self) -> BoxFuture<'static, anyhow::Result<()>> {
        let tx = self.tx.clone();
        let handle = self.handle.take();
        let shared = self.shared.clone();
        Box::pin(async move {
            let Some(handle) = handle else {
                anyhow::bail!("writer was not started");
            };
            // a closed queue means the mux thread already stopped; its status tells why
            let _ = tx.send(MuxCommand::Finish).await;
            handle
                .await
                .map_err(|e| anyhow::anyhow!("mux thread: {}", e))?;
            match shared.status() {
                WriterStatus::Completed => Ok(()),
                status => Err(shared
                    .take_error()
                    .unwrap_or_else(|| anyhow::anyhow!("writer ended as {:?}", status))),
            }
        })
    }

    fn cancel_writing(&mut self) {
        self.cancel.cancel();
        if !self
            .shared
            .transition(WriterStatus::Writing, WriterStatus::Cancelled)
        {
            self.shared
                .transition(WriterStatus::Unknown, WriterStatus::Cancelled);
        }
        // never started: nothing else will clean up the file
        if let Some(output) = self.output.take() {
            drop(output);
            remove_partial(&self.path);
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("remove partial output {}: {}", path.display(), e),
    }
}

struct FfmpegWriterInput {
    index: usize,
    kind: MediaKind,
    tx: mpsc::Sender<MuxCommand>,
    // one reserved queue slot, taken by the next append
    permit: Mutex<Option<mpsc::OwnedPermit<MuxCommand>>>,
    shared: Arc<SharedState<WriterStatus>>,
    pool: Arc<OnceLock<PixelBufferPool>>,
}

impl FfmpegWriterInput {
    fn send(&mut self, cmd: MuxCommand) -> bool {
        if self.shared.status() != WriterStatus::Writing {
            return false;
        }
        let permit = self
            .permit
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match permit {
            Some(permit) => {
                permit.send(cmd);
                true
            }
            None => self.tx.try_send(cmd).is_ok(),
        }
    }
}

impl WriterInput for FfmpegWriterInput {
    fn media_kind(&self) -> MediaKind {
        self.kind
    }

    fn is_ready_for_more_media_data(&self) -> bool {
        // a closed queue reports ready so the next append fails
        self.tx.is_closed()
            || self
                .permit
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_some()
    }

    fn when_ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if self.is_ready_for_more_media_data() {
                return;
            }
            if let Ok(permit) = self.tx.clone().reserve_owned().await {
                *self.permit.lock().unwrap_or_else(|e| e.into_inner()) = Some(permit);
            }
        })
    }

    fn append_sample_buffer(&mut self, sample: SampleBuffer) -> bool {
        if sample.image_buffer().is_none() {
            let cmd = MuxCommand::Packet {
                input: self.index,
                sample,
            };
            return self.send(cmd);
        }
        if self.kind != MediaKind::Video {
            log::warn!("audio input cannot take decoded frames");
            return false;
        }
        let presentation_time = sample.presentation_time();
        match sample.into_payload() {
            SamplePayload::Pixels(buffer) => self.append_pixel_buffer(buffer, presentation_time),
            SamplePayload::Encoded(_) => false,
        }
    }

    fn append_pixel_buffer(&mut self, buffer: PixelBuffer, presentation_time: MediaTime) -> bool {
        if self.kind != MediaKind::Video {
            return false;
        }
        self.send(MuxCommand::Frame {
            input: self.index,
            buffer,
            presentation_time,
        })
    }

    fn pixel_buffer_pool(&self) -> Option<PixelBufferPool> {
        self.pool.get().cloned()
    }

    fn mark_as_finished(&mut self) {
        // release the reserved slot for the other inputs
        self.permit
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        log::debug!("{} writer input {} finished", self.kind.as_str(), self.index);
    }
}

enum MuxOutcome {
    Finished,
    Cancelled,
}

fn mux_loop(
    mut output: ffmpeg_next::format::context::Output,
    mut sinks: Vec<Sink>,
    mut rx: mpsc::Receiver<MuxCommand>,
    cancel: &CancellationToken,
    runtime: &tokio::runtime::Handle,
) -> anyhow::Result<MuxOutcome> {
    let mut session_start = MediaTime::ZERO;
    loop {
        let cmd = runtime.block_on(async {
            tokio::select! {
                _ = cancel.cancelled() => None,
                cmd = rx.recv() => Some(cmd),
            }
        });
        let cmd = match cmd {
            None | Some(None) => return Ok(MuxOutcome::Cancelled),
            Some(Some(cmd)) => cmd,
        };
        match cmd {
            MuxCommand::StartSession(start) => session_start = start,
            MuxCommand::Frame {
                input,
                buffer,
                presentation_time,
            } => match sinks.get_mut(input) {
                Some(Sink::Video(sink)) => {
                    sink.encode(&mut output, buffer, presentation_time - session_start)?
                }
                _ => anyhow::bail!("input {} does not take frames", input),
            },
            MuxCommand::Packet { input, sample } => match sinks.get_mut(input) {
                Some(Sink::Passthrough(sink)) => sink.write(&mut output, sample, session_start)?,
                _ => anyhow::bail!("input {} does not take packets", input),
            },
            MuxCommand::Finish => {
                for sink in &mut sinks {
                    if let Sink::Video(sink) = sink {
                        sink.flush(&mut output)?;
                    }
                }
                output.write_trailer()?;
                return Ok(MuxOutcome::Finished);
            }
        }
    }
}

enum Sink {
    Video(VideoSink),
    Passthrough(PassthroughSink),
}

impl Sink {
    fn stream_index(&self) -> usize {
        match self {
            Sink::Video(sink) => sink.stream_index,
            Sink::Passthrough(sink) => sink.stream_index,
        }
    }

    fn set_stream_time_base(&mut self, time_base: Rational) {
        match self {
            Sink::Video(sink) => sink.stream_time_base = time_base,
            Sink::Passthrough(sink) => sink.stream_time_base = time_base,
        }
    }
}

/// BGRA to YUV420P; created on the mux thread at the first frame.
struct YuvScaler(scaling::Context);

unsafe impl Send for YuvScaler {}

struct VideoSink {
    stream_index: usize,
    stream_time_base: Rational,
    encoder: ffmpeg_next::encoder::video::Encoder,
    encoder_time_base: Rational,
    width: u32,
    height: u32,
    scaler: Option<YuvScaler>,
    pool: PixelBufferPool,
}

impl VideoSink {
    fn new(
        output: &mut ffmpeg_next::format::context::Output,
        settings: &VideoSettings,
        global_header: bool,
    ) -> anyhow::Result<Self> {
        let codec = match settings.codec {
            VideoCodec::H264 => ffmpeg_next::encoder::find_by_name("libx264")
                .or_else(|| ffmpeg_next::encoder::find(codec::Id::H264))
                .ok_or_else(|| anyhow::anyhow!("no H.264 encoder available"))?,
        };
        let encoder_time_base = Rational::new(1, ENCODER_TIMESCALE);

        let mut stream = output.add_stream(codec)?;
        let stream_index = stream.index();

        let mut encoder = codec::Context::new_with_codec(codec).encoder().video()?;
        encoder.set_width(settings.width);
        encoder.set_height(settings.height);
        encoder.set_format(Pixel::YUV420P);
        encoder.set_time_base(encoder_time_base);
        if let Some(par) = settings
            .compression
            .as_ref()
            .and_then(|c| c.pixel_aspect_ratio)
        {
            encoder.set_aspect_ratio(Rational::new(
                par.horizontal_spacing as i32,
                par.vertical_spacing as i32,
            ));
        }
        if settings
            .compression
            .as_ref()
            .is_some_and(|c| c.clean_aperture.is_some())
        {
            log::debug!("clean aperture is not representable in the muxer, dropped");
        }
        if global_header {
            encoder.set_flags(codec::Flags::GLOBAL_HEADER);
        }

        let mut opts = Dictionary::new();
        opts.set("preset", "veryfast");
        let encoder = encoder.open_with(opts)?;
        stream.set_parameters(&encoder);
        stream.set_time_base(encoder_time_base);

        let rotation = settings.transform.rotation_degrees();
        if rotation != 0.0 {
            unsafe {
                set_display_rotation(stream.as_mut_ptr(), rotation);
            }
        }

        log::info!(
            "video stream {}: {} {}x{}",
            stream_index,
            codec.name(),
            settings.width,
            settings.height
        );

        Ok(Self {
            stream_index,
            stream_time_base: encoder_time_base,
            encoder,
            encoder_time_base,
            width: settings.width,
            height: settings.height,
            scaler: None,
            pool: PixelBufferPool::new(PixelBufferAttributes {
                width: settings.width,
                height: settings.height,
                format: settings.source_pixel_format,
            }),
        })
    }

    fn encode(
        &mut self,
        output: &mut ffmpeg_next::format::context::Output,
        buffer: PixelBuffer,
        presentation_time: MediaTime,
    ) -> anyhow::Result<()> {
        let (width, height) = (buffer.width(), buffer.height());
        let mut bgra = ffmpeg_next::frame::Video::new(Pixel::BGRA, width, height);
        let stride = bgra.stride(0);
        for y in 0..height {
            let row = buffer.row(y);
            let start = y as usize * stride;
            bgra.data_mut(0)[start..start + row.len()].copy_from_slice(row);
        }
        self.pool.recycle(buffer);

        if self.scaler.is_none() {
            self.scaler = Some(YuvScaler(scaling::Context::get(
                Pixel::BGRA,
                width,
                height,
                Pixel::YUV420P,
                self.width,
                self.height,
                scaling::flag::Flags::BILINEAR,
            )?));
        }
        let mut yuv = ffmpeg_next::frame::Video::empty();
        if let Some(YuvScaler(scaler)) = self.scaler.as_mut() {
            scaler.run(&bgra, &mut yuv)?;
        }
        yuv.set_pts(Some(presentation_time.rescale(ENCODER_TIMESCALE).value));

        self.encoder.send_frame(&yuv)?;
        self.drain(output)
    }

    fn flush(&mut self, output: &mut ffmpeg_next::format::context::Output) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.drain(output)
    }

    fn drain(&mut self, output: &mut ffmpeg_next::format::context::Output) -> anyhow::Result<()> {
        let mut packet = ffmpeg_next::Packet::empty();
        loop {
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    packet.set_stream(self.stream_index);
                    packet.set_position(-1);
                    packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
                    packet.write_interleaved(output)?;
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(())
                }
                Err(err) => return Err(err.into()),
            }
        }
    }
}

/// Writes the 3x3 display matrix for a clockwise rotation into the stream's side data.
unsafe fn set_display_rotation(stream: *mut ffmpeg_next::ffi::AVStream, degrees: f64) {
    unsafe {
        let par = (*stream).codecpar;
        if par.is_null() {
            return;
        }
        let side_data = ffmpeg_next::ffi::av_packet_side_data_new(
            &mut (*par).coded_side_data,
            &mut (*par).nb_coded_side_data,
            ffmpeg_next::ffi::AVPacketSideDataType::AV_PKT_DATA_DISPLAYMATRIX,
            9 * std::mem::size_of::<i32>(),
            0,
        );
        if side_data.is_null() {
            log::warn!("could not attach display matrix");
            return;
        }
        ffmpeg_next::ffi::av_display_rotation_set((*side_data).data as *mut i32, -degrees);
    }
}

struct PassthroughSink {
    stream_index: usize,
    stream_time_base: Rational,
}

impl PassthroughSink {
    fn new(
        output: &mut ffmpeg_next::format::context::Output,
        kind: MediaKind,
        source: Option<&FormatDescription>,
    ) -> anyhow::Result<Self> {
        let source = source.ok_or_else(|| {
            anyhow::anyhow!("{} pass-through input needs a source format", kind.as_str())
        })?;
        let codec_id = ffmpeg_next::decoder::find_by_name(&source.media_subtype)
            .map(|c| c.id())
            .ok_or_else(|| anyhow::anyhow!("unknown codec {}", source.media_subtype))?;

        let mut stream = output.add_stream(ffmpeg_next::encoder::find(codec::Id::None))?;
        let stream_index = stream.index();
        stream.set_parameters(passthrough_parameters(kind, codec_id, source));

        log::info!(
            "{} stream {}: {} copied",
            kind.as_str(),
            stream_index,
            source.media_subtype
        );
        Ok(Self {
            stream_index,
            stream_time_base: stream.time_base(),
        })
    }

    fn write(
        &mut self,
        output: &mut ffmpeg_next::format::context::Output,
        sample: SampleBuffer,
        session_start: MediaTime,
    ) -> anyhow::Result<()> {
        let pts = sample.presentation_time() - session_start;
        if !pts.is_numeric() {
            log::warn!("sample without timestamp dropped");
            return Ok(());
        }
        let duration = sample.duration().filter(MediaTime::is_numeric);
        let SamplePayload::Encoded(data) = sample.into_payload() else {
            anyhow::bail!("pass-through input got a decoded frame");
        };

        let mut packet = ffmpeg_next::Packet::copy(&data);
        packet.set_pts(Some(pts.value));
        packet.set_dts(Some(pts.value));
        if let Some(duration) = duration {
            packet.set_duration(duration.rescale(pts.timescale).value);
        }
        packet.set_stream(self.stream_index);
        packet.set_position(-1);
        packet.rescale_ts(Rational::new(1, pts.timescale), self.stream_time_base);
        packet.write_interleaved(output)?;
        Ok(())
    }
}

fn passthrough_parameters(
    kind: MediaKind,
    codec_id: codec::Id,
    source: &FormatDescription,
) -> Parameters {
    let mut params = Parameters::new();
    unsafe {
        let ptr = params.as_mut_ptr();
        (*ptr).codec_type = match kind {
            MediaKind::Audio => ffmpeg_next::media::Type::Audio.into(),
            MediaKind::Video => ffmpeg_next::media::Type::Video.into(),
        };
        (*ptr).codec_id = codec_id.into();
        (*ptr).codec_tag = 0;
        if let Some(size) = source.dimensions {
            (*ptr).width = size.width as i32;
            (*ptr).height = size.height as i32;
        }
        if let Some(audio) = source.audio {
            (*ptr).sample_rate = audio.sample_rate as i32;
            ffmpeg_next::ffi::av_channel_layout_default(&mut (*ptr).ch_layout, audio.channels as i32);
        }
        if let Some(extradata) = source.extradata.as_ref().filter(|e| !e.is_empty()) {
            let padded = extradata.len() + ffmpeg_next::ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize;
            let buf = ffmpeg_next::ffi::av_mallocz(padded) as *mut u8;
            if !buf.is_null() {
                std::ptr::copy_nonoverlapping(extradata.as_ptr(), buf, extradata.len());
                (*ptr).extradata = buf;
                (*ptr).extradata_size = extradata.len() as i32;
            }
        }
    }
    params
}
