use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use shared::{
    domain::{ImageMimeType, UploadStatus, MAX_UPLOAD_BYTES},
    error::{ApiError, ErrorKind},
};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, info, warn};
use url::Url;

use crate::transform::{
    first_inline_image, outpaint_instruction, TransformError, TransformRequest, TransformService,
};

const PROGRESS_STARTED: u8 = 10;
const PROGRESS_ENCODED: u8 = 30;
const PROGRESS_RESPONDED: u8 = 80;
const PROGRESS_DONE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("File is too large. Maximum size is 10MB.")]
    FileTooLarge { size: u64, limit: u64 },
    #[error("Invalid file type. Please upload a JPG or PNG image.")]
    InvalidFileType { declared: Option<String> },
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write '{path}': {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct FileCandidate {
    pub file_name: String,
    pub declared_mime: Option<String>,
    pub bytes: Vec<u8>,
    pub origin: Option<PathBuf>,
}

impl FileCandidate {
    pub fn from_bytes(
        file_name: impl Into<String>,
        declared_mime: Option<&str>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            declared_mime: declared_mime.map(str::to_string),
            bytes,
            origin: None,
        }
    }
}

pub fn validate_selection(
    declared_size: u64,
    declared_mime: Option<&str>,
) -> Result<ImageMimeType, ValidationError> {
    if declared_size > MAX_UPLOAD_BYTES {
        return Err(ValidationError::FileTooLarge {
            size: declared_size,
            limit: MAX_UPLOAD_BYTES,
        });
    }
    declared_mime
        .and_then(|raw| raw.parse::<ImageMimeType>().ok())
        .ok_or_else(|| ValidationError::InvalidFileType {
            declared: declared_mime.map(str::to_string),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    pub file_name: String,
    pub mime_type: ImageMimeType,
    pub bytes: Vec<u8>,
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewUri(String);

impl PreviewUri {
    fn for_source(source: &SourceImage) -> Self {
        if let Some(url) = source
            .origin
            .as_deref()
            .and_then(|path| Url::from_file_path(path).ok())
        {
            return Self(url.into());
        }
        Self(format!(
            "data:{};base64,{}",
            source.mime_type,
            STANDARD.encode(&source.bytes)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    Selected,
    Rejected(ValidationError),
    Busy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Succeeded,
    Failed(TransformError),
    AlreadyProcessing,
    NothingSelected,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowSnapshot {
    pub status: UploadStatus,
    pub file_name: Option<String>,
    pub mime_type: Option<ImageMimeType>,
    pub preview: Option<PreviewUri>,
    pub result: Option<Arc<GeneratedImage>>,
    pub progress_percent: u8,
    pub error: Option<ApiError>,
}

impl WorkflowSnapshot {
    fn idle() -> Self {
        Self {
            status: UploadStatus::Idle,
            file_name: None,
            mime_type: None,
            preview: None,
            result: None,
            progress_percent: 0,
            error: None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|error| error.message.as_str())
    }

    pub fn can_process(&self) -> bool {
        matches!(self.status, UploadStatus::Selected | UploadStatus::Failed)
    }
}

enum Stage {
    Idle,
    Selected {
        source: Arc<SourceImage>,
        preview: PreviewUri,
    },
    Processing {
        source: Arc<SourceImage>,
        preview: PreviewUri,
    },
    Succeeded {
        source: Arc<SourceImage>,
        preview: PreviewUri,
        result: Arc<GeneratedImage>,
    },
    Failed {
        source: Arc<SourceImage>,
        preview: PreviewUri,
        error: TransformError,
    },
}

struct WorkflowState {
    stage: Stage,
    progress: u8,
    banner: Option<ApiError>,
    generation: u64,
    in_flight: Option<Arc<Notify>>,
}

impl WorkflowState {
    fn new() -> Self {
        Self {
            stage: Stage::Idle,
            progress: 0,
            banner: None,
            generation: 0,
            in_flight: None,
        }
    }

    fn snapshot(&self) -> WorkflowSnapshot {
        let (status, source, preview, result) = match &self.stage {
            Stage::Idle => (UploadStatus::Idle, None, None, None),
            Stage::Selected { source, preview } => {
                (UploadStatus::Selected, Some(source), Some(preview), None)
            }
            Stage::Processing { source, preview } => {
                (UploadStatus::Processing, Some(source), Some(preview), None)
            }
            Stage::Succeeded {
                source,
                preview,
                result,
            } => (
                UploadStatus::Succeeded,
                Some(source),
                Some(preview),
                Some(result.clone()),
            ),
            Stage::Failed {
                source, preview, ..
            } => (UploadStatus::Failed, Some(source), Some(preview), None),
        };
        WorkflowSnapshot {
            status,
            file_name: source.map(|s| s.file_name.clone()),
            mime_type: source.map(|s| s.mime_type),
            preview: preview.cloned(),
            result,
            progress_percent: self.progress,
            error: self.banner.clone(),
        }
    }

    fn is_processing(&self) -> bool {
        matches!(self.stage, Stage::Processing { .. })
    }

    fn clear(&mut self) {
        self.stage = Stage::Idle;
        self.progress = 0;
        self.banner = None;
        self.generation += 1;
        if let Some(in_flight) = self.in_flight.take() {
            in_flight.notify_one();
        }
    }

    fn fail(&mut self, source: Arc<SourceImage>, preview: PreviewUri, error: TransformError) {
        self.banner = Some(ApiError::new(error.kind(), error.user_message()));
        self.progress = 0;
        self.in_flight = None;
        self.stage = Stage::Failed {
            source,
            preview,
            error,
        };
    }
}

struct Inner {
    transform: Arc<dyn TransformService>,
    instruction: String,
    state: Mutex<WorkflowState>,
    updates: watch::Sender<WorkflowSnapshot>,
}

#[derive(Clone)]
pub struct UploadWorkflow {
    inner: Arc<Inner>,
}

impl UploadWorkflow {
    pub fn new(transform: Arc<dyn TransformService>) -> Self {
        Self::with_instruction(transform, outpaint_instruction())
    }

    pub fn with_instruction(
        transform: Arc<dyn TransformService>,
        instruction: impl Into<String>,
    ) -> Self {
        let (updates, _) = watch::channel(WorkflowSnapshot::idle());
        Self {
            inner: Arc::new(Inner {
                transform,
                instruction: instruction.into(),
                state: Mutex::new(WorkflowState::new()),
                updates,
            }),
        }
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        self.inner.updates.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkflowSnapshot> {
        self.inner.updates.subscribe()
    }

    fn publish(&self, state: &WorkflowState) {
        self.inner.updates.send_replace(state.snapshot());
    }

    pub async fn select(&self, candidate: FileCandidate) -> SelectOutcome {
        let validated = validate_selection(
            candidate.bytes.len() as u64,
            candidate.declared_mime.as_deref(),
        );
        let mut state = self.inner.state.lock().await;
        if state.is_processing() {
            debug!(file = %candidate.file_name, "upload: selection ignored while processing");
            return SelectOutcome::Busy;
        }
        match validated {
            Ok(mime_type) => {
                let source = SourceImage {
                    file_name: candidate.file_name,
                    mime_type,
                    bytes: candidate.bytes,
                    origin: candidate.origin,
                };
                self.accept(&mut state, source);
                SelectOutcome::Selected
            }
            Err(error) => {
                self.reject(&mut state, &candidate.file_name, error.clone());
                SelectOutcome::Rejected(error)
            }
        }
    }

    pub async fn select_path(&self, path: &Path) -> Result<SelectOutcome, WorkflowError> {
        let read_error = |source| WorkflowError::Read {
            path: path.to_path_buf(),
            source,
        };
        let metadata = tokio::fs::metadata(path).await.map_err(read_error)?;
        let declared_mime = mime_guess::from_path(path).first_raw();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        if let Err(error) = validate_selection(metadata.len(), declared_mime) {
            let mut state = self.inner.state.lock().await;
            if state.is_processing() {
                return Ok(SelectOutcome::Busy);
            }
            self.reject(&mut state, &file_name, error.clone());
            return Ok(SelectOutcome::Rejected(error));
        }

        let bytes = tokio::fs::read(path).await.map_err(read_error)?;
        let origin = tokio::fs::canonicalize(path).await.ok();
        Ok(self
            .select(FileCandidate {
                file_name,
                declared_mime: declared_mime.map(str::to_string),
                bytes,
                origin,
            })
            .await)
    }

    fn accept(&self, state: &mut WorkflowState, source: SourceImage) {
        info!(
            file = %source.file_name,
            mime_type = %source.mime_type,
            size_bytes = source.bytes.len(),
            "upload: file selected"
        );
        let preview = PreviewUri::for_source(&source);
        state.clear();
        state.stage = Stage::Selected {
            source: Arc::new(source),
            preview,
        };
        self.publish(state);
    }

    fn reject(&self, state: &mut WorkflowState, file_name: &str, error: ValidationError) {
        warn!(file = %file_name, %error, "upload: selection rejected");
        state.clear();
        state.banner = Some(ApiError::new(ErrorKind::Validation, error.to_string()));
        self.publish(state);
    }

    pub async fn process(&self) -> ProcessOutcome {
        let (source, generation, cancelled) = {
            let mut state = self.inner.state.lock().await;
            let (source, preview) = match &state.stage {
                Stage::Processing { .. } => {
                    debug!("upload: process ignored, request already in flight");
                    return ProcessOutcome::AlreadyProcessing;
                }
                Stage::Selected { source, preview } | Stage::Failed { source, preview, .. } => {
                    (source.clone(), preview.clone())
                }
                Stage::Idle | Stage::Succeeded { .. } => return ProcessOutcome::NothingSelected,
            };

            if let Err(error) = self.inner.transform.ensure_configured() {
                warn!(%error, "upload: transform service not configured");
                state.fail(source, preview, error.clone());
                self.publish(&state);
                return ProcessOutcome::Failed(error);
            }

            let cancelled = Arc::new(Notify::new());
            state.generation += 1;
            state.in_flight = Some(cancelled.clone());
            state.banner = None;
            state.progress = PROGRESS_STARTED;
            state.stage = Stage::Processing {
                source: source.clone(),
                preview,
            };
            self.publish(&state);
            (source, state.generation, cancelled)
        };

        let outcome = tokio::select! {
            outcome = self.run_transform(&source, generation) => outcome,
            _ = cancelled.notified() => {
                info!(file = %source.file_name, "upload: in-flight transform cancelled by reset");
                return ProcessOutcome::Cancelled;
            }
        };

        let mut state = self.inner.state.lock().await;
        let preview = match &state.stage {
            Stage::Processing { preview, .. } if state.generation == generation => preview.clone(),
            _ => return ProcessOutcome::Cancelled,
        };
        match outcome {
            Ok(result) => {
                info!(
                    file = %source.file_name,
                    result_bytes = result.bytes.len(),
                    "upload: transform succeeded"
                );
                state.in_flight = None;
                state.progress = PROGRESS_DONE;
                state.stage = Stage::Succeeded {
                    source,
                    preview,
                    result: Arc::new(result),
                };
                self.publish(&state);
                ProcessOutcome::Succeeded
            }
            Err(error) => {
                warn!(file = %source.file_name, kind = ?error.kind(), %error, "upload: transform failed");
                state.fail(source, preview, error.clone());
                self.publish(&state);
                ProcessOutcome::Failed(error)
            }
        }
    }

    async fn run_transform(
        &self,
        source: &SourceImage,
        generation: u64,
    ) -> Result<GeneratedImage, TransformError> {
        let data_b64 = STANDARD.encode(&source.bytes);
        self.advance_progress(generation, PROGRESS_ENCODED).await;

        let parts = self
            .inner
            .transform
            .generate(TransformRequest {
                mime_type: source.mime_type,
                data_b64,
                instruction: self.inner.instruction.clone(),
            })
            .await?;
        self.advance_progress(generation, PROGRESS_RESPONDED).await;

        let inline = first_inline_image(&parts).ok_or(TransformError::EmptyResult)?;
        let bytes = STANDARD.decode(inline.data.trim()).map_err(|err| {
            TransformError::Unknown(format!("image service returned malformed image data: {err}"))
        })?;
        if bytes.is_empty() {
            return Err(TransformError::EmptyResult);
        }
        Ok(GeneratedImage {
            mime_type: inline.mime_type.clone(),
            bytes,
        })
    }

    async fn advance_progress(&self, generation: u64, progress: u8) {
        let mut state = self.inner.state.lock().await;
        if state.generation == generation && state.is_processing() {
            state.progress = progress;
            self.publish(&state);
        }
    }

    /// Writes the result into `dir`. Returns `None` when there is no result.
    pub async fn download(&self, dir: &Path) -> Result<Option<PathBuf>, WorkflowError> {
        let result = {
            let state = self.inner.state.lock().await;
            match &state.stage {
                Stage::Succeeded { result, .. } => result.clone(),
                _ => return Ok(None),
            }
        };

        let path = dir.join(download_file_name(
            Utc::now().timestamp_millis(),
            &result.mime_type,
        ));
        let write_error = |source| WorkflowError::Write {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(dir).await.map_err(write_error)?;
        tokio::fs::write(&path, &result.bytes)
            .await
            .map_err(write_error)?;
        info!(path = %path.display(), "upload: result downloaded");
        Ok(Some(path))
    }

    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        if state.is_processing() {
            info!("upload: reset while processing; discarding in-flight result");
        }
        state.clear();
        self.publish(&state);
    }

    pub async fn dismiss_error(&self) {
        let mut state = self.inner.state.lock().await;
        if state.banner.take().is_some() {
            self.publish(&state);
        }
    }
}

pub fn download_file_name(timestamp_millis: i64, mime_type: &str) -> String {
    let extension = mime_type
        .parse::<ImageMimeType>()
        .map(ImageMimeType::extension)
        .unwrap_or("png");
    format!("tiktop-size-{timestamp_millis}.{extension}")
}

#[cfg(test)]
#[path = "tests/upload_tests.rs"]
mod tests;
