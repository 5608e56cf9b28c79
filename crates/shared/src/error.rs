use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-visible failure classes of the upload workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Configuration,
    ContentPolicy,
    Transport,
    EmptyResult,
    Unknown,
}

impl ErrorKind {
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Validation => "The selected file cannot be used.",
            Self::Configuration => {
                "The image service is not configured. Set GEMINI_API_KEY and try again."
            }
            Self::ContentPolicy => {
                "The image was flagged by safety filters. Please try a different image."
            }
            Self::Transport => {
                "Network error. Please check your internet connection and try again."
            }
            Self::EmptyResult => "No image was generated. Please try again.",
            Self::Unknown => "Something went wrong while processing your image.",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
