use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    adjust::AdjustCallback,
    channel::{ChannelDelegate, SampleChannel, SampleSink},
    error::TranscodeError,
    media::{
        Asset, AssetMetadata, AssetReader, AssetWriter, ContainerFormat, MediaKind, OutputSettings,
        ReaderStatus, WriterFactory, WriterStatus,
    },
    sample::PixelFormat,
    settings,
    time::{MediaTime, TimeRange},
};

pub type ProgressCallback = Arc<dyn Fn(f32) + Send + Sync>;
pub type CompletionCallback = Box<dyn FnOnce(Result<(), TranscodeError>) + Send>;

/// Re-encodes an asset into a QuickTime movie: H.264 video, audio copied through.
///
/// Every state change of a transcode runs on one session task, in order. Only
/// [`Transcoder::cancel`] reaches across threads, and it just records the request
/// before scheduling the actual teardown onto that task.
pub struct Transcoder {
    asset: Arc<dyn Asset>,
    adjust: Option<Arc<AdjustCallback>>,
    cancel: Mutex<CancellationToken>,
    tx: mpsc::UnboundedSender<SessionCommand>,
}

impl Transcoder {
    /// Must be called from within a tokio runtime.
    pub fn new(asset: Arc<dyn Asset>, writers: Arc<dyn WriterFactory>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = SessionState {
            asset: asset.clone(),
            writers,
            tx: tx.downgrade(),
            active: None,
        };
        tokio::spawn(async move { state.inner_loop(rx).await });
        Self {
            asset,
            adjust: None,
            cancel: Mutex::new(CancellationToken::new()),
            tx,
        }
    }

    /// Registers the per-frame adjustment used by subsequent [`Transcoder::write_to`] calls.
    pub fn set_adjust_callback(&mut self, adjust: AdjustCallback) {
        self.adjust = Some(Arc::new(adjust));
    }

    /// Starts transcoding into `path`, replacing any file already there.
    ///
    /// `on_progress` receives percentages in `[0, 100]`, non-decreasing.
    /// `on_completion` runs exactly once after setup began; a cancel that lands
    /// before the asset metadata is loaded abandons the transcode without calling it.
    pub fn write_to<P, F, C>(&self, path: P, on_progress: F, on_completion: C)
    where
        P: Into<PathBuf>,
        F: Fn(f32) + Send + Sync + 'static,
        C: FnOnce(Result<(), TranscodeError>) + Send + 'static,
    {
        let token = {
            let mut guard = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
            if guard.is_cancelled() {
                *guard = CancellationToken::new();
            }
            guard.clone()
        };

        let output: PathBuf = path.into();
        let adjust = self.adjust.clone();
        let progress: ProgressCallback = Arc::new(on_progress);
        let completion: CompletionCallback = Box::new(on_completion);
        let loading = self.asset.load_metadata();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let metadata = tokio::select! {
                _ = token.cancelled() => {
                    log::info!("transcode to {} cancelled while loading metadata", output.display());
                    return;
                },
                metadata = loading => metadata,
            };
            let request = SetupRequest {
                output,
                metadata,
                adjust,
                token,
                progress,
                completion,
                keep_alive: tx.clone(),
            };
            if tx.send(SessionCommand::Setup(Box::new(request))).is_err() {
                log::warn!("transcode session is gone");
            }
        });
    }

    /// Cancels the running transcode. Safe to call from any thread, any number of times.
    pub fn cancel(&self) {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .cancel();
        let _ = self.tx.send(SessionCommand::Cancel);
    }
}

struct SetupRequest {
    output: PathBuf,
    metadata: anyhow::Result<AssetMetadata>,
    adjust: Option<Arc<AdjustCallback>>,
    token: CancellationToken,
    progress: ProgressCallback,
    completion: CompletionCallback,
    keep_alive: mpsc::UnboundedSender<SessionCommand>,
}

enum SessionCommand {
    Setup(Box<SetupRequest>),
    Cancel,
    ChannelFinished(MediaKind),
    WriterFinished(anyhow::Result<()>),
}

struct SessionState {
    asset: Arc<dyn Asset>,
    writers: Arc<dyn WriterFactory>,
    // weak so an idle session goes away with its Transcoder
    tx: mpsc::WeakUnboundedSender<SessionCommand>,
    active: Option<ActiveSession>,
}

struct ActiveSession {
    output: PathBuf,
    cancelled: bool,
    reader: Option<Box<dyn AssetReader>>,
    writer: Option<Box<dyn AssetWriter>>,
    channels: Vec<SampleChannel>,
    pending: usize,
    time_range: TimeRange,
    completion: Option<CompletionCallback>,
    // keeps the session task running until teardown
    keep_alive: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionState {
    async fn inner_loop(mut self, mut rx: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SessionCommand::Setup(request) => self.handle_setup(*request),
                SessionCommand::Cancel => self.handle_cancel(),
                SessionCommand::ChannelFinished(kind) => self.handle_channel_finished(kind),
                SessionCommand::WriterFinished(result) => self.handle_writer_finished(result),
            }
        }
        log::debug!("transcode session closed");
    }

    fn handle_setup(&mut self, request: SetupRequest) {
        let SetupRequest {
            output,
            metadata,
            adjust,
            token,
            progress,
            completion,
            keep_alive,
        } = request;

        if token.is_cancelled() {
            log::info!("transcode to {} cancelled before setup", output.display());
            return;
        }
        if self.active.is_some() {
            completion(Err(TranscodeError::SetupFailed(anyhow::anyhow!(
                "a transcode is already in progress"
            ))));
            return;
        }

        let mut session = ActiveSession {
            output,
            cancelled: false,
            reader: None,
            writer: None,
            channels: Vec::new(),
            pending: 0,
            time_range: TimeRange::new(MediaTime::ZERO, MediaTime::ZERO),
            completion: Some(completion),
            keep_alive,
        };

        let result = metadata
            .map_err(TranscodeError::SetupFailed)
            .and_then(|metadata| self.setup(&mut session, &metadata, adjust, token, progress));
        match result {
            Ok(()) => {
                let idle = session.pending == 0;
                self.active = Some(session);
                if idle {
                    self.join();
                }
            }
            Err(e) => session.finish(Err(e)),
        }
    }

    fn setup(
        &self,
        session: &mut ActiveSession,
        metadata: &AssetMetadata,
        adjust: Option<Arc<AdjustCallback>>,
        token: CancellationToken,
        progress: ProgressCallback,
    ) -> Result<(), TranscodeError> {
        session.time_range = TimeRange::new(MediaTime::ZERO, metadata.duration);
        remove_existing(&session.output).map_err(TranscodeError::SetupFailed)?;

        let reader = session
            .reader
            .insert(self.asset.create_reader().map_err(TranscodeError::SetupFailed)?);
        let writer = session.writer.insert(
            self.writers
                .create_writer(&session.output, ContainerFormat::QuickTimeMovie)
                .map_err(TranscodeError::SetupFailed)?,
        );

        for kind in [MediaKind::Audio, MediaKind::Video] {
            let Some(track) = metadata.first_track(kind) else {
                continue;
            };
            let output_settings = match kind {
                MediaKind::Audio => OutputSettings::Passthrough,
                MediaKind::Video => OutputSettings::Decompressed {
                    pixel_format: PixelFormat::Bgra32,
                },
            };
            let output = reader
                .add_output(track, output_settings)
                .map_err(TranscodeError::SetupFailed)?;
            let input = writer
                .add_input(settings::input_settings(track))
                .map_err(TranscodeError::SetupFailed)?;
            log::debug!("{} track {} configured", kind.as_str(), track.id);
            session
                .channels
                .push(SampleChannel::new(output, input, kind == MediaKind::Video));
        }

        reader.start_reading().map_err(TranscodeError::SetupFailed)?;
        writer.start_writing().map_err(TranscodeError::SetupFailed)?;
        writer.start_session(session.time_range.start);

        log::info!(
            "transcoding {} channel(s) into {}, duration {}",
            session.channels.len(),
            session.output.display(),
            session.time_range.duration
        );

        let has_video = session.channels.iter().any(|c| c.kind() == MediaKind::Video);
        session.pending = session.channels.len();
        for channel in &session.channels {
            let kind = channel.kind();
            let delegate = (kind == MediaKind::Video || !has_video).then(|| ChannelDelegate {
                adjust: adjust.clone(),
                on_sample_written: Some(progress_sink(
                    session.time_range,
                    token.clone(),
                    progress.clone(),
                )),
            });
            let tx = self.tx.clone();
            channel.start(delegate, move || {
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(SessionCommand::ChannelFinished(kind));
                }
            });
        }
        Ok(())
    }

    fn handle_cancel(&mut self) {
        let Some(session) = self.active.as_mut() else {
            return;
        };
        if session.cancelled {
            return;
        }
        log::info!("cancelling transcode to {}", session.output.display());
        session.cancelled = true;
        for channel in &session.channels {
            channel.cancel();
        }
    }

    fn handle_channel_finished(&mut self, kind: MediaKind) {
        let Some(session) = self.active.as_mut() else {
            log::debug!("{} channel finished after teardown", kind.as_str());
            return;
        };
        log::debug!("{} channel finished", kind.as_str());
        session.pending = session.pending.saturating_sub(1);
        if session.pending == 0 {
            self.join();
        }
    }

    /// All channels are done: decide how the transcode ends.
    fn join(&mut self) {
        let Some(mut session) = self.active.take() else {
            return;
        };

        if session.cancelled {
            session.cancel_reader_and_writer();
            session.finish(Ok(()));
            return;
        }

        if session.reader_status() == Some(ReaderStatus::Failed) {
            let err = session
                .reader
                .as_mut()
                .and_then(|r| r.take_error())
                .unwrap_or_else(|| anyhow::anyhow!("reader failed"));
            session.finish(Err(TranscodeError::ReadFailed(err)));
            return;
        }

        if session.writer_status() == Some(WriterStatus::Failed) {
            let err = session
                .writer
                .as_mut()
                .and_then(|w| w.take_error())
                .unwrap_or_else(|| anyhow::anyhow!("writer failed"));
            session.finish(Err(TranscodeError::WriteFailed(err)));
            return;
        }

        let Some(finishing) = session.writer.as_mut().map(|w| w.finish_writing()) else {
            session.finish(Ok(()));
            return;
        };
        let tx = session.keep_alive.clone();
        self.active = Some(session);
        tokio::spawn(async move {
            let result = finishing.await;
            let _ = tx.send(SessionCommand::WriterFinished(result));
        });
    }

    fn handle_writer_finished(&mut self, result: anyhow::Result<()>) {
        let Some(session) = self.active.take() else {
            return;
        };
        match result {
            // a cancel that raced the finalization is still a cancel
            _ if session.cancelled => session.finish(Ok(())),
            Ok(()) => session.finish(Ok(())),
            Err(e) => session.finish(Err(TranscodeError::WriteFailed(e))),
        }
    }
}

impl ActiveSession {
    fn reader_status(&self) -> Option<ReaderStatus> {
        self.reader.as_ref().map(|r| r.status())
    }

    fn writer_status(&self) -> Option<WriterStatus> {
        self.writer.as_ref().map(|w| w.status())
    }

    fn cancel_reader_and_writer(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.cancel_reading();
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.cancel_writing();
        }
    }

    /// Single teardown path: releases reader, writer and channels, then completes.
    fn finish(mut self, result: Result<(), TranscodeError>) {
        if result.is_err() {
            self.cancel_reader_and_writer();
        }
        self.channels.clear();
        self.reader = None;
        self.writer = None;

        match &result {
            Ok(()) => log::info!("transcode to {} finished", self.output.display()),
            Err(e) => log::error!("transcode to {} failed: {}", self.output.display(), e),
        }
        match self.completion.take() {
            Some(completion) => completion(result),
            None => log::warn!("transcode completion already consumed"),
        }
    }
}

fn remove_existing(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            log::debug!("removed existing {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(anyhow::Error::new(e).context(format!("remove {}", path.display()))),
    }
}

fn progress_sink(
    range: TimeRange,
    token: CancellationToken,
    progress: ProgressCallback,
) -> SampleSink {
    let mut reported = 0.0f32;
    Box::new(move |pts, duration| {
        if token.is_cancelled() {
            return;
        }
        let value = (range.progress_of(pts, duration) * 100.0) as f32;
        reported = reported.max(value);
        progress(reported);
    })
}

#[cfg(test)]
#[path = "transcoder_test.rs"]
mod transcoder_test;
