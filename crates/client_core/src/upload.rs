//! Outgoing media attachments: client-side validation, progress reporting,
//! cancellation. The coordinator never touches the timeline itself; it
//! produces a [`MediaRef`] the caller feeds into the send path.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use shared::domain::MessageKind;
use shared::protocol::MediaRef;

pub const MAX_IMAGE_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_VIDEO_BYTES: u64 = 100 * 1024 * 1024;
pub const MAX_AUDIO_BYTES: u64 = 25 * 1024 * 1024;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("{kind:?} uploads are capped at {max} bytes, got {actual}")]
    TooLarge {
        kind: MessageKind,
        max: u64,
        actual: u64,
    },
    #[error("mime type {mime} is not valid for a {kind:?} message")]
    UnsupportedType { kind: MessageKind, mime: String },
    #[error("text is not an upload kind")]
    NotMedia,
    #[error("upload cancelled")]
    Cancelled,
    #[error("transfer failed: {0}")]
    Transfer(String),
}

#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub filename: String,
    pub mime_type: String,
    pub kind: MessageKind,
    pub bytes: Bytes,
}

/// Validate size and MIME type for the declared kind. Runs before any
/// network call; a rejection here never reaches the wire.
pub fn validate(upload: &MediaUpload) -> Result<(), UploadError> {
    let (max, mime_prefix) = match upload.kind {
        MessageKind::Image => (MAX_IMAGE_BYTES, "image/"),
        MessageKind::Video => (MAX_VIDEO_BYTES, "video/"),
        MessageKind::Audio => (MAX_AUDIO_BYTES, "audio/"),
        MessageKind::Text => return Err(UploadError::NotMedia),
    };
    let actual = upload.bytes.len() as u64;
    if actual > max {
        return Err(UploadError::TooLarge {
            kind: upload.kind,
            max,
            actual,
        });
    }
    if !upload.mime_type.starts_with(mime_prefix) {
        return Err(UploadError::UnsupportedType {
            kind: upload.kind,
            mime: upload.mime_type.clone(),
        });
    }
    Ok(())
}

/// Monotone percentage reporter handed to the store implementation.
/// Regressions are clamped so observers only ever see progress move forward.
#[derive(Clone)]
pub struct ProgressReporter {
    tx: Arc<watch::Sender<u8>>,
}

impl ProgressReporter {
    fn channel() -> (Self, watch::Receiver<u8>) {
        let (tx, rx) = watch::channel(0);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn report(&self, percent: u8) {
        let percent = percent.min(100);
        self.tx.send_if_modified(|current| {
            if percent > *current {
                *current = percent;
                true
            } else {
                false
            }
        });
    }
}

/// Seam over the media storage collaborator.
#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn store_media(
        &self,
        upload: MediaUpload,
        progress: ProgressReporter,
    ) -> Result<MediaRef, UploadError>;
}

#[derive(Clone)]
pub struct MediaUploader {
    store: Arc<dyn MediaStore>,
}

/// In-flight upload. Progress is observable while the transfer runs;
/// `cancel` is a no-op once the transfer finished.
#[derive(Debug)]
pub struct UploadHandle {
    progress: watch::Receiver<u8>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<Result<MediaRef, UploadError>>,
}

impl UploadHandle {
    pub fn progress(&self) -> watch::Receiver<u8> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// Wait for the transfer to finish, or surface the cancellation.
    pub async fn join(self) -> Result<MediaRef, UploadError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(UploadError::Transfer(format!("upload task failed: {err}"))),
        }
    }
}

impl MediaUploader {
    pub fn new(store: Arc<dyn MediaStore>) -> Self {
        Self { store }
    }

    /// Validate and start an upload. Validation failures surface
    /// synchronously, before any network traffic.
    pub fn begin(&self, upload: MediaUpload) -> Result<UploadHandle, UploadError> {
        validate(&upload)?;

        let (reporter, progress) = ProgressReporter::channel();
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let store = Arc::clone(&self.store);
        let filename = upload.filename.clone();

        let task = tokio::spawn(async move {
            tokio::select! {
                result = store.store_media(upload, reporter) => result,
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => {
                    debug!(filename = %filename, "upload cancelled");
                    Err(UploadError::Cancelled)
                }
            }
        });

        Ok(UploadHandle {
            progress,
            cancel_tx,
            task,
        })
    }
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
