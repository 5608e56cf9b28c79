use super::*;
use async_trait::async_trait;
use base64::Engine as _;
use shared::protocol::ContentPart;
use std::collections::VecDeque;

const MIB: usize = 1024 * 1024;

struct ScriptedTransform {
    configured: bool,
    replies: Mutex<VecDeque<Result<Vec<ContentPart>, TransformError>>>,
    requests: Mutex<Vec<TransformRequest>>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedTransform {
    fn replying(replies: Vec<Result<Vec<ContentPart>, TransformError>>) -> Self {
        Self {
            configured: true,
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn unconfigured() -> Self {
        let mut transform = Self::replying(Vec::new());
        transform.configured = false;
        transform
    }

    fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl TransformService for ScriptedTransform {
    fn ensure_configured(&self) -> Result<(), TransformError> {
        if self.configured {
            Ok(())
        } else {
            Err(TransformError::NotConfigured)
        }
    }

    async fn generate(
        &self,
        request: TransformRequest,
    ) -> Result<Vec<ContentPart>, TransformError> {
        self.requests.lock().await.push(request);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.replies
            .lock()
            .await
            .pop_front()
            .unwrap_or(Err(TransformError::Unknown("no scripted reply".into())))
    }
}

fn png_part(bytes: &[u8]) -> ContentPart {
    ContentPart::inline("image/png", STANDARD.encode(bytes))
}

fn jpeg(size: usize) -> FileCandidate {
    FileCandidate::from_bytes("product.jpg", Some("image/jpeg"), vec![0xAB; size])
}

fn workflow(transform: &Arc<ScriptedTransform>) -> UploadWorkflow {
    UploadWorkflow::new(transform.clone())
}

async fn wait_for_status(workflow: &UploadWorkflow, status: UploadStatus) {
    let mut updates = workflow.subscribe();
    updates
        .wait_for(|snapshot| snapshot.status == status)
        .await
        .expect("workflow dropped");
}

#[test]
fn validation_checks_size_before_type() {
    assert_eq!(
        validate_selection(MAX_UPLOAD_BYTES + 1, Some("image/gif")),
        Err(ValidationError::FileTooLarge {
            size: MAX_UPLOAD_BYTES + 1,
            limit: MAX_UPLOAD_BYTES
        })
    );
    assert_eq!(
        validate_selection(MAX_UPLOAD_BYTES, Some("image/png")),
        Ok(ImageMimeType::Png)
    );
    assert_eq!(
        validate_selection(10, None),
        Err(ValidationError::InvalidFileType { declared: None })
    );
}

#[tokio::test]
async fn valid_jpeg_is_selected_and_transformed() {
    let transform = Arc::new(ScriptedTransform::replying(vec![Ok(vec![
        ContentPart::text("done"),
        png_part(b"square-png"),
        png_part(b"second-png"),
    ])]));
    let workflow = workflow(&transform);

    assert_eq!(workflow.select(jpeg(2 * MIB)).await, SelectOutcome::Selected);
    let selected = workflow.snapshot();
    assert_eq!(selected.status, UploadStatus::Selected);
    assert_eq!(selected.mime_type, Some(ImageMimeType::Jpeg));
    assert!(selected
        .preview
        .as_ref()
        .expect("preview")
        .as_str()
        .starts_with("data:image/jpeg;base64,"));

    assert_eq!(workflow.process().await, ProcessOutcome::Succeeded);

    let done = workflow.snapshot();
    assert_eq!(done.status, UploadStatus::Succeeded);
    assert_eq!(done.progress_percent, 100);
    assert_eq!(done.error, None);
    let result = done.result.expect("result image");
    assert_eq!(result.bytes, b"square-png".to_vec());
    assert_eq!(result.mime_type, "image/png");

    let requests = transform.requests.lock().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].mime_type, ImageMimeType::Jpeg);
    assert_eq!(requests[0].data_b64, STANDARD.encode(vec![0xAB; 2 * MIB]));
    assert_eq!(requests[0].instruction, outpaint_instruction());
}

#[tokio::test]
async fn oversized_png_is_rejected_without_a_request() {
    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    let outcome = workflow
        .select(FileCandidate::from_bytes(
            "huge.png",
            Some("image/png"),
            vec![0; 12 * MIB],
        ))
        .await;

    assert!(matches!(
        outcome,
        SelectOutcome::Rejected(ValidationError::FileTooLarge { .. })
    ));
    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.status, UploadStatus::Idle);
    assert_eq!(
        snapshot.error_message(),
        Some("File is too large. Maximum size is 10MB.")
    );
    assert_eq!(
        snapshot.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::Validation)
    );

    assert_eq!(workflow.process().await, ProcessOutcome::NothingSelected);
    assert_eq!(transform.request_count().await, 0);
}

#[tokio::test]
async fn unsupported_type_is_rejected() {
    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    let outcome = workflow
        .select(FileCandidate::from_bytes("anim.gif", Some("image/gif"), vec![1; 64]))
        .await;

    assert_eq!(
        outcome,
        SelectOutcome::Rejected(ValidationError::InvalidFileType {
            declared: Some("image/gif".into())
        })
    );
    assert_eq!(
        workflow.snapshot().error_message(),
        Some("Invalid file type. Please upload a JPG or PNG image.")
    );
}

#[tokio::test]
async fn rejected_selection_clears_previous_preview() {
    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    workflow.select(jpeg(1024)).await;
    assert!(workflow.snapshot().preview.is_some());

    workflow
        .select(FileCandidate::from_bytes("doc.pdf", Some("application/pdf"), vec![1; 8]))
        .await;

    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.status, UploadStatus::Idle);
    assert_eq!(snapshot.preview, None);
    assert_eq!(snapshot.file_name, None);
    assert!(snapshot.error.is_some());
}

#[tokio::test]
async fn new_valid_selection_clears_a_validation_banner() {
    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    workflow
        .select(FileCandidate::from_bytes("a.gif", Some("image/gif"), vec![1]))
        .await;
    workflow.select(jpeg(16)).await;

    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.status, UploadStatus::Selected);
    assert_eq!(snapshot.error, None);
}

#[tokio::test]
async fn missing_credential_fails_immediately_without_a_request() {
    let transform = Arc::new(ScriptedTransform::unconfigured());
    let workflow = workflow(&transform);

    workflow.select(jpeg(2048)).await;
    assert_eq!(
        workflow.process().await,
        ProcessOutcome::Failed(TransformError::NotConfigured)
    );

    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.status, UploadStatus::Failed);
    assert_eq!(snapshot.progress_percent, 0);
    assert_eq!(
        snapshot.error.as_ref().map(|error| error.kind),
        Some(ErrorKind::Configuration)
    );
    assert_eq!(transform.request_count().await, 0);
}

#[tokio::test]
async fn response_without_image_is_an_empty_result_failure() {
    let transform = Arc::new(ScriptedTransform::replying(vec![Ok(vec![
        ContentPart::text("I can only describe it"),
    ])]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(512)).await;
    assert_eq!(
        workflow.process().await,
        ProcessOutcome::Failed(TransformError::EmptyResult)
    );

    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.status, UploadStatus::Failed);
    assert_eq!(snapshot.result, None);
    assert_eq!(
        snapshot.error_message(),
        Some("No image was generated. Please try again.")
    );
}

#[tokio::test]
async fn malformed_image_payload_is_an_unknown_failure() {
    let transform = Arc::new(ScriptedTransform::replying(vec![Ok(vec![
        ContentPart::inline("image/png", "not base64 at all!"),
    ])]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(512)).await;
    let outcome = workflow.process().await;
    assert!(matches!(
        outcome,
        ProcessOutcome::Failed(TransformError::Unknown(_))
    ));
}

#[tokio::test]
async fn failed_transform_can_be_retriggered_manually() {
    let transform = Arc::new(ScriptedTransform::replying(vec![
        Err(TransformError::Transport("connection reset".into())),
        Ok(vec![png_part(b"second-try")]),
    ]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(512)).await;
    assert!(matches!(
        workflow.process().await,
        ProcessOutcome::Failed(TransformError::Transport(_))
    ));
    let failed = workflow.snapshot();
    assert_eq!(
        failed.error_message(),
        Some(ErrorKind::Transport.default_message())
    );
    assert!(failed.can_process());
    assert_eq!(transform.request_count().await, 1);

    assert_eq!(workflow.process().await, ProcessOutcome::Succeeded);
    assert_eq!(transform.request_count().await, 2);
    assert_eq!(workflow.snapshot().error, None);
}

#[tokio::test]
async fn second_trigger_while_processing_is_a_no_op() {
    let gate = Arc::new(Notify::new());
    let transform = Arc::new(
        ScriptedTransform::replying(vec![Ok(vec![png_part(b"only-once")])]).gated(gate.clone()),
    );
    let workflow = workflow(&transform);
    workflow.select(jpeg(4096)).await;

    let first = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.process().await }
    });
    wait_for_status(&workflow, UploadStatus::Processing).await;
    let mut updates = workflow.subscribe();
    updates
        .wait_for(|snapshot| snapshot.progress_percent == 30)
        .await
        .expect("encoded checkpoint");

    assert_eq!(workflow.process().await, ProcessOutcome::AlreadyProcessing);
    assert_eq!(workflow.select(jpeg(16)).await, SelectOutcome::Busy);
    assert!(!workflow.snapshot().can_process());

    gate.notify_one();
    assert_eq!(first.await.expect("join"), ProcessOutcome::Succeeded);
    assert_eq!(transform.request_count().await, 1);
    assert_eq!(workflow.snapshot().file_name.as_deref(), Some("product.jpg"));
}

#[tokio::test]
async fn reset_while_processing_discards_the_in_flight_result() {
    let gate = Arc::new(Notify::new());
    let transform = Arc::new(
        ScriptedTransform::replying(vec![Ok(vec![png_part(b"late")])]).gated(gate.clone()),
    );
    let workflow = workflow(&transform);
    workflow.select(jpeg(4096)).await;

    let pending = tokio::spawn({
        let workflow = workflow.clone();
        async move { workflow.process().await }
    });
    wait_for_status(&workflow, UploadStatus::Processing).await;

    workflow.reset().await;
    assert_eq!(pending.await.expect("join"), ProcessOutcome::Cancelled);
    gate.notify_one();

    assert_eq!(workflow.snapshot(), WorkflowSnapshot::idle());
    assert_eq!(workflow.process().await, ProcessOutcome::NothingSelected);
}

#[tokio::test]
async fn reset_from_terminal_states_restores_idle_defaults() {
    let transform = Arc::new(ScriptedTransform::replying(vec![
        Ok(vec![png_part(b"ok")]),
        Err(TransformError::ContentPolicy {
            reason: "SAFETY".into(),
        }),
    ]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(64)).await;
    workflow.process().await;
    assert_eq!(workflow.snapshot().status, UploadStatus::Succeeded);
    workflow.reset().await;
    assert_eq!(workflow.snapshot(), WorkflowSnapshot::idle());

    workflow.select(jpeg(64)).await;
    workflow.process().await;
    let failed = workflow.snapshot();
    assert_eq!(failed.status, UploadStatus::Failed);
    assert_eq!(
        failed.error_message(),
        Some("The image was flagged by safety filters. Please try a different image.")
    );

    workflow.reset().await;
    let once = workflow.snapshot();
    workflow.reset().await;
    assert_eq!(once, WorkflowSnapshot::idle());
    assert_eq!(workflow.snapshot(), once);
}

#[tokio::test]
async fn dismissing_an_error_keeps_status_and_is_idempotent() {
    let transform = Arc::new(ScriptedTransform::replying(vec![Err(
        TransformError::Unknown("quota exceeded".into()),
    )]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(64)).await;
    workflow.process().await;
    assert_eq!(workflow.snapshot().error_message(), Some("quota exceeded"));

    workflow.dismiss_error().await;
    let once = workflow.snapshot();
    assert_eq!(once.status, UploadStatus::Failed);
    assert_eq!(once.error, None);

    workflow.dismiss_error().await;
    assert_eq!(workflow.snapshot(), once);
}

#[tokio::test]
async fn download_writes_result_only_after_success() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transform = Arc::new(ScriptedTransform::replying(vec![Ok(vec![png_part(
        b"png-bytes",
    )])]));
    let workflow = workflow(&transform);

    workflow.select(jpeg(64)).await;
    assert_eq!(workflow.download(dir.path()).await.expect("download"), None);

    workflow.process().await;
    let path = workflow
        .download(&dir.path().join("out"))
        .await
        .expect("download")
        .expect("path");

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .expect("file name");
    assert!(name.starts_with("tiktop-size-"));
    assert!(name.ends_with(".png"));
    assert_eq!(std::fs::read(&path).expect("read"), b"png-bytes".to_vec());
    assert_eq!(workflow.snapshot().status, UploadStatus::Succeeded);
}

#[tokio::test]
async fn select_path_uses_extension_and_file_preview() {
    let dir = tempfile::tempdir().expect("tempdir");
    let photo = dir.path().join("shoe.png");
    std::fs::write(&photo, [0x89, b'P', b'N', b'G']).expect("write");

    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    assert_eq!(
        workflow.select_path(&photo).await.expect("select"),
        SelectOutcome::Selected
    );
    let snapshot = workflow.snapshot();
    assert_eq!(snapshot.mime_type, Some(ImageMimeType::Png));
    assert_eq!(snapshot.file_name.as_deref(), Some("shoe.png"));
    assert!(snapshot
        .preview
        .expect("preview")
        .as_str()
        .starts_with("file://"));
}

#[tokio::test]
async fn select_path_rejects_oversized_file_from_metadata() {
    let dir = tempfile::tempdir().expect("tempdir");
    let photo = dir.path().join("huge.jpg");
    let file = std::fs::File::create(&photo).expect("create");
    file.set_len(12 * MIB as u64).expect("size");

    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    assert!(matches!(
        workflow.select_path(&photo).await.expect("select"),
        SelectOutcome::Rejected(ValidationError::FileTooLarge { .. })
    ));
    assert_eq!(workflow.snapshot().status, UploadStatus::Idle);
}

#[tokio::test]
async fn select_path_rejects_non_image_extension() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notes = dir.path().join("notes.txt");
    std::fs::write(&notes, "hello").expect("write");

    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    assert!(matches!(
        workflow.select_path(&notes).await.expect("select"),
        SelectOutcome::Rejected(ValidationError::InvalidFileType { .. })
    ));
}

#[tokio::test]
async fn select_path_reports_missing_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transform = Arc::new(ScriptedTransform::replying(Vec::new()));
    let workflow = workflow(&transform);

    let err = workflow
        .select_path(&dir.path().join("absent.png"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Read { .. }));
    assert_eq!(workflow.snapshot().status, UploadStatus::Idle);
}

#[test]
fn download_names_carry_timestamp_and_result_extension() {
    assert_eq!(
        download_file_name(1700000000123, "image/png"),
        "tiktop-size-1700000000123.png"
    );
    assert_eq!(
        download_file_name(1700000000123, "image/jpeg"),
        "tiktop-size-1700000000123.jpg"
    );
    assert_eq!(
        download_file_name(1700000000123, "image/webp"),
        "tiktop-size-1700000000123.png"
    );
}
