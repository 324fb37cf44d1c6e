use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    adjust::AdjustCallback,
    media::{MediaKind, ReaderOutput, WriterInput},
    sample::{PixelBufferPool, SampleBuffer},
    time::MediaTime,
};

/// Called after a sample has been written, with its presentation time and duration.
pub type SampleSink = Box<dyn FnMut(MediaTime, Option<MediaTime>) + Send>;

pub type ChannelCompletion = Box<dyn FnOnce() + Send>;

/// What a channel does with each sample besides copying it.
#[derive(Default)]
pub struct ChannelDelegate {
    pub adjust: Option<Arc<AdjustCallback>>,
    pub on_sample_written: Option<SampleSink>,
}

enum ChannelCommand {
    Start {
        delegate: Option<ChannelDelegate>,
        completion: ChannelCompletion,
    },
    Cancel,
}

/// Moves the samples of one elementary stream from a reader output to a writer input.
///
/// The channel's state lives on its own task and is only touched by that task.
/// The completion handed to [`SampleChannel::start`] runs exactly once, whether
/// the stream is exhausted, an append is rejected, or the channel is cancelled.
pub struct SampleChannel {
    kind: MediaKind,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl SampleChannel {
    /// Must be called from within a tokio runtime.
    pub fn new(
        reader_output: Box<dyn ReaderOutput>,
        writer_input: Box<dyn WriterInput>,
        use_pixel_buffer_pool: bool,
    ) -> Self {
        let kind = writer_input.media_kind();
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ChannelState {
            kind,
            reader_output,
            writer_input,
            use_pixel_buffer_pool,
            pool: None,
            delegate: None,
            completion: None,
            started: false,
            finished: false,
            written: 0,
        };
        tokio::spawn(async move { state.inner_loop(rx).await });
        Self { kind, tx }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn start<F>(&self, delegate: Option<ChannelDelegate>, completion: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cmd = ChannelCommand::Start {
            delegate,
            completion: Box::new(completion),
        };
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(cmd) {
            // the channel task is gone, nothing can be pumped anymore
            if let ChannelCommand::Start { completion, .. } = cmd {
                log::warn!("{} channel: start after shutdown", self.kind.as_str());
                completion();
            }
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(ChannelCommand::Cancel);
    }
}

struct ChannelState {
    kind: MediaKind,
    reader_output: Box<dyn ReaderOutput>,
    writer_input: Box<dyn WriterInput>,
    use_pixel_buffer_pool: bool,
    // bound on first use, the writer only creates it once writing started
    pool: Option<PixelBufferPool>,
    delegate: Option<ChannelDelegate>,
    completion: Option<ChannelCompletion>,
    started: bool,
    finished: bool,
    written: u64,
}

impl ChannelState {
    async fn inner_loop(mut self, mut rx: mpsc::UnboundedReceiver<ChannelCommand>) {
        loop {
            let pumping = self.started && !self.finished;
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(ChannelCommand::Start { delegate, completion }) => {
                        self.handle_start(delegate, completion);
                    }
                    Some(ChannelCommand::Cancel) => {
                        log::debug!("{} channel: cancelled", self.kind.as_str());
                        self.call_completion_if_necessary();
                    }
                    None => {
                        self.call_completion_if_necessary();
                        break;
                    }
                },
                _ = self.writer_input.when_ready(), if pumping => {
                    self.pump().await;
                }
            }
        }
    }

    fn handle_start(&mut self, delegate: Option<ChannelDelegate>, completion: ChannelCompletion) {
        if self.finished {
            completion();
            return;
        }
        if self.started {
            log::warn!("{} channel: already started", self.kind.as_str());
            completion();
            return;
        }
        self.started = true;
        self.delegate = delegate;
        self.completion = Some(completion);
    }

    /// Runs until the writer input stops accepting data or the stream ends.
    async fn pump(&mut self) {
        if self.finished {
            return;
        }

        let mut completed_or_failed = false;
        while self.writer_input.is_ready_for_more_media_data() && !completed_or_failed {
            match self.reader_output.copy_next_sample_buffer().await {
                Some(sample) => completed_or_failed = !self.write_sample(sample),
                None => completed_or_failed = true,
            }
        }

        if completed_or_failed {
            self.call_completion_if_necessary();
        }
    }

    fn write_sample(&mut self, mut sample: SampleBuffer) -> bool {
        let presentation_time = sample.presentation_time();
        let duration = sample.duration();
        let adjust = self.delegate.as_ref().and_then(|d| d.adjust.clone());

        let pool = match adjust.as_deref() {
            Some(adjust) if self.use_pixel_buffer_pool && adjust.has_into_output() => {
                self.pixel_buffer_pool()
            }
            _ => None,
        };

        let pooled_output = match (adjust.as_deref(), pool, sample.image_buffer()) {
            (Some(adjust), Some(pool), Some(input)) => {
                let mut output = pool.create_pixel_buffer();
                adjust.adjust_pixel_buffer_into(input, &mut output);
                Some(output)
            }
            _ => None,
        };

        let success = match pooled_output {
            Some(output) => self
                .writer_input
                .append_pixel_buffer(output, presentation_time),
            None => {
                if let Some(adjust) = adjust.as_deref() {
                    if let Some(buffer) = sample.image_buffer_mut() {
                        adjust.adjust_pixel_buffer(buffer);
                    }
                }
                self.writer_input.append_sample_buffer(sample)
            }
        };

        if !success {
            log::warn!(
                "{} channel: writer rejected sample at {}",
                self.kind.as_str(),
                presentation_time
            );
            return false;
        }

        self.written += 1;
        if let Some(sink) = self
            .delegate
            .as_mut()
            .and_then(|d| d.on_sample_written.as_mut())
        {
            sink(presentation_time, duration);
        }
        true
    }

    fn pixel_buffer_pool(&mut self) -> Option<PixelBufferPool> {
        if self.pool.is_none() {
            self.pool = self.writer_input.pixel_buffer_pool();
            if self.pool.is_none() {
                log::warn!(
                    "{} channel: writer input has no pixel buffer pool, adjusting in place",
                    self.kind.as_str()
                );
            }
        }
        self.pool.clone()
    }

    fn call_completion_if_necessary(&mut self) {
        let was_finished = std::mem::replace(&mut self.finished, true);
        if was_finished {
            return;
        }
        self.writer_input.mark_as_finished();
        self.delegate = None;
        log::debug!(
            "{} channel: finished after {} samples",
            self.kind.as_str(),
            self.written
        );
        if let Some(completion) = self.completion.take() {
            completion();
        }
    }
}

#[cfg(test)]
#[path = "channel_test.rs"]
mod channel_test;
