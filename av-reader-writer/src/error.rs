/// Terminal failure of a transcode, delivered once through the completion callback.
///
/// Cancellation is not an error: a cancelled session completes with `Ok(())`, or
/// not at all when cancelled before setup began.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// Metadata could not be loaded, the reader/writer could not be opened or
    /// started, or a pre-existing output could not be removed.
    #[error("setup failed: {0:#}")]
    SetupFailed(#[source] anyhow::Error),

    /// The reader reported a failure while samples were being pumped.
    #[error("read failed: {0:#}")]
    ReadFailed(#[source] anyhow::Error),

    /// The writer rejected a sample or could not finalize the container.
    #[error("write failed: {0:#}")]
    WriteFailed(#[source] anyhow::Error),
}

impl TranscodeError {
    pub fn kind(&self) -> &'static str {
        match self {
            TranscodeError::SetupFailed(_) => "setup",
            TranscodeError::ReadFailed(_) => "read",
            TranscodeError::WriteFailed(_) => "write",
        }
    }

    /// The collaborator error this failure wraps.
    pub fn inner(&self) -> &anyhow::Error {
        match self {
            TranscodeError::SetupFailed(e)
            | TranscodeError::ReadFailed(e)
            | TranscodeError::WriteFailed(e) => e,
        }
    }
}
