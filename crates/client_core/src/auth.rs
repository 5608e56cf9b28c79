use std::sync::Arc;

use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::SessionPersistence,
    protocol::{
        AuthErrorBody, AuthUser, PasswordGrantRequest, RefreshGrantRequest, Session,
        SignUpRequest, SignUpResponse, TokenResponse, UserMetadata,
    },
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};
use url::Url;

use crate::{
    config::Settings,
    session_storage::{FileSessionStorage, MemorySessionStorage, SessionStore, StorageError},
};

pub const SESSION_STORAGE_KEY: &str = "tiktop-auth-token";
const FALLBACK_AUTH_MESSAGE: &str = "An error occurred during authentication.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    InitialSession(Option<AuthUser>),
    SignedIn(AuthUser),
    SignedOut,
    TokenRefreshed(AuthUser),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignUpOutcome {
    ConfirmationRequired { email: String },
    SignedIn(Session),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication service is not configured")]
    NotConfigured,
    #[error("{0}")]
    Validation(String),
    #[error("{message}")]
    Rejected { status: u16, message: String },
    #[error("network error reaching the authentication service: {0}")]
    Transport(String),
    #[error("unexpected response from the authentication service: {0}")]
    UnexpectedResponse(String),
    #[error("not signed in")]
    NotSignedIn,
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone)]
pub struct AuthEndpoint {
    base_url: Url,
    anon_key: String,
}

impl AuthEndpoint {
    pub fn new(base_url: &str, anon_key: impl Into<String>) -> Result<Self, url::ParseError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            base_url: Url::parse(&base)?,
            anon_key: anon_key.into(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|err| AuthError::UnexpectedResponse(format!("invalid auth url: {err}")))
    }
}

pub fn validate_credentials(email: &str, password: &str) -> Result<(), AuthError> {
    let email = email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(AuthError::Validation(
            "Please enter a valid email address.".into(),
        ));
    }
    if password.is_empty() {
        return Err(AuthError::Validation("Please enter your password.".into()));
    }
    Ok(())
}

pub struct SessionClient {
    http: Client,
    endpoint: Option<AuthEndpoint>,
    store: SessionStore,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionClient {
    pub fn new(endpoint: Option<AuthEndpoint>, store: SessionStore) -> Self {
        if endpoint.is_none() {
            warn!("auth: service URL or anon key missing; sign-in is disabled");
        }
        let (events, _) = broadcast::channel(32);
        Self {
            http: Client::new(),
            endpoint,
            store,
            events,
        }
    }

    pub fn from_settings(
        settings: &Settings,
        persistence: SessionPersistence,
    ) -> anyhow::Result<Self> {
        let endpoint = match (&settings.supabase_url, &settings.supabase_anon_key) {
            (Some(url), Some(key)) => Some(AuthEndpoint::new(url, key.clone())?),
            _ => None,
        };
        let data_dir = settings.resolve_data_dir()?;
        let store = SessionStore::new(
            persistence,
            Arc::new(FileSessionStorage::new(data_dir.join("sessions"))),
            Arc::new(MemorySessionStorage::new()),
        );
        Ok(Self::new(endpoint, store))
    }

    pub fn persistence(&self) -> SessionPersistence {
        self.store.persistence()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn endpoint(&self) -> Result<&AuthEndpoint, AuthError> {
        self.endpoint.as_ref().ok_or(AuthError::NotConfigured)
    }

    pub async fn initialize(&self) -> Result<Option<Session>, AuthError> {
        let session = self.current_session().await?;
        self.emit(SessionEvent::InitialSession(
            session.as_ref().map(|s| s.user.clone()),
        ));
        Ok(session)
    }

    pub async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(session) = self.load_session().await? else {
            return Ok(None);
        };
        if !session.is_expired(Utc::now()) {
            return Ok(Some(session));
        }

        info!(user_id = %session.user.id, "auth: stored session expired; refreshing");
        match self.refresh_with(&session.refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(error) => {
                warn!(%error, "auth: refresh failed; clearing stored session");
                self.store.remove(SESSION_STORAGE_KEY).await?;
                self.emit(SessionEvent::SignedOut);
                Ok(None)
            }
        }
    }

    async fn load_session(&self) -> Result<Option<Session>, AuthError> {
        let Some(raw) = self.store.get(SESSION_STORAGE_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Session>(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(error) => {
                warn!(%error, "auth: discarding unreadable stored session");
                self.store.remove(SESSION_STORAGE_KEY).await?;
                Ok(None)
            }
        }
    }

    async fn save_session(&self, session: &Session) -> Result<(), AuthError> {
        let raw = serde_json::to_string(session)
            .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))?;
        self.store.set(SESSION_STORAGE_KEY, &raw).await?;
        Ok(())
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        full_name: &str,
    ) -> Result<SignUpOutcome, AuthError> {
        validate_credentials(email, password)?;
        if full_name.trim().is_empty() {
            return Err(AuthError::Validation("Please enter your full name.".into()));
        }
        let endpoint = self.endpoint()?;

        let request = self.http.post(endpoint.url("auth/v1/signup")?).json(&SignUpRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
            data: UserMetadata {
                full_name: Some(full_name.trim().to_string()),
            },
        });
        let response: SignUpResponse = self.send(endpoint, request).await?;

        match response {
            SignUpResponse::Session(tokens) => {
                let session = Session::from_token_response(tokens, Utc::now());
                self.save_session(&session).await?;
                info!(user_id = %session.user.id, "auth: signed up and signed in");
                self.emit(SessionEvent::SignedIn(session.user.clone()));
                Ok(SignUpOutcome::SignedIn(session))
            }
            SignUpResponse::User(user) => {
                info!(user_id = %user.id, "auth: signed up; confirmation pending");
                Ok(SignUpOutcome::ConfirmationRequired {
                    email: user.email.unwrap_or_else(|| email.trim().to_string()),
                })
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AuthError> {
        validate_credentials(email, password)?;
        let endpoint = self.endpoint()?;

        let mut url = endpoint.url("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "password");
        let request = self.http.post(url).json(&PasswordGrantRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        });
        let tokens: TokenResponse = self.send(endpoint, request).await?;

        let session = Session::from_token_response(tokens, Utc::now());
        self.save_session(&session).await?;
        info!(
            user_id = %session.user.id,
            persistence = ?self.store.persistence(),
            "auth: signed in"
        );
        self.emit(SessionEvent::SignedIn(session.user.clone()));
        Ok(session)
    }

    pub async fn refresh(&self) -> Result<Session, AuthError> {
        let session = self.load_session().await?.ok_or(AuthError::NotSignedIn)?;
        self.refresh_with(&session.refresh_token).await
    }

    async fn refresh_with(&self, refresh_token: &str) -> Result<Session, AuthError> {
        let endpoint = self.endpoint()?;
        let mut url = endpoint.url("auth/v1/token")?;
        url.query_pairs_mut().append_pair("grant_type", "refresh_token");
        let request = self.http.post(url).json(&RefreshGrantRequest {
            refresh_token: refresh_token.to_string(),
        });
        let tokens: TokenResponse = self.send(endpoint, request).await?;

        let session = Session::from_token_response(tokens, Utc::now());
        self.save_session(&session).await?;
        self.emit(SessionEvent::TokenRefreshed(session.user.clone()));
        Ok(session)
    }

    /// Revokes the remote session when possible; the local session is always
    /// cleared.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let stored = self.load_session().await?;
        if let (Some(session), Some(endpoint)) = (&stored, &self.endpoint) {
            if let Err(error) = self.revoke(endpoint, session).await {
                warn!(%error, "auth: remote sign-out failed; clearing local session anyway");
            }
        }

        self.store.remove(SESSION_STORAGE_KEY).await?;
        if stored.is_some() {
            info!("auth: signed out");
        }
        self.emit(SessionEvent::SignedOut);
        Ok(())
    }

    async fn revoke(&self, endpoint: &AuthEndpoint, session: &Session) -> Result<(), AuthError> {
        let request = self
            .http
            .post(endpoint.url("auth/v1/logout")?)
            .bearer_auth(&session.access_token);
        self.execute(endpoint, request).await?;
        Ok(())
    }

    async fn send<T: DeserializeOwned>(
        &self,
        endpoint: &AuthEndpoint,
        request: RequestBuilder,
    ) -> Result<T, AuthError> {
        self.execute(endpoint, request)
            .await?
            .json::<T>()
            .await
            .map_err(|err| AuthError::UnexpectedResponse(err.to_string()))
    }

    async fn execute(
        &self,
        endpoint: &AuthEndpoint,
        request: RequestBuilder,
    ) -> Result<Response, AuthError> {
        let response = request
            .header("apikey", &endpoint.anon_key)
            .send()
            .await
            .map_err(|err| AuthError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = match response.text().await {
                Ok(body) => body,
                Err(error) => {
                    warn!(%status, %error, "auth: could not read error response body");
                    String::new()
                }
            };
            return Err(rejection(status.as_u16(), &body));
        }
        Ok(response)
    }
}

fn rejection(status: u16, body: &str) -> AuthError {
    let parsed = serde_json::from_str::<AuthErrorBody>(body).unwrap_or_default();
    AuthError::Rejected {
        status,
        message: parsed
            .message()
            .unwrap_or(FALLBACK_AUTH_MESSAGE)
            .to_string(),
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
