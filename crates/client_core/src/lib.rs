pub mod auth;
pub mod config;
pub mod session_storage;
pub mod transform;
pub mod upload;

pub use auth::{AuthEndpoint, AuthError, SessionClient, SessionEvent, SignUpOutcome};
pub use config::{load_settings, Settings};
pub use session_storage::{PreferenceStore, SessionStore};
pub use transform::{GeminiTransformClient, TransformError, TransformService};
pub use upload::{
    FileCandidate, ProcessOutcome, SelectOutcome, UploadWorkflow, ValidationError,
    WorkflowError, WorkflowSnapshot,
};
