//! Remote device farm client.
//!
//! Remote runs upload the built app, open a WebDriver session that launches
//! it on a provisioned device, optionally ping the session to keep it alive,
//! and quit the session during teardown. [`DeviceFarm`] is the seam the
//! orchestrator uses; [`BrowserStackFarm`] talks to the real service.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::debug;

use crate::config::FarmConfig;
use crate::platform::{ArtifactSource, BuildArtifact};
use crate::run_config::{Credentials, RunConfig};

/// Script executed by keep-alive pings.
pub const IDLE_PING_SCRIPT: &str = "console.log(\"# Idle Ping\")";

/// Upper bound on session control requests (keep-alive and quit).
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on opening a session, which waits for a device.
pub const SESSION_START_TIMEOUT: Duration = Duration::from_secs(300);

/// Upper bound on an artifact upload.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Future returned by device farm operations.
pub type FarmFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FarmError>> + Send + 'a>>;

/// Errors raised by device farm operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FarmError {
    /// Raised when the request cannot be sent or the response read.
    #[error("device farm request failed: {message}")]
    Transport {
        /// Error string.
        message: String,
    },
    /// Raised when the local artifact cannot be read for upload.
    #[error("failed to read artifact {path}: {message}")]
    Artifact {
        /// Artifact path.
        path: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the farm reports an error field.
    #[error("device farm rejected the request: {message}")]
    Rejected {
        /// Error reported by the farm.
        message: String,
    },
    /// Raised when the response is not what the protocol promises.
    #[error("unexpected device farm response (status {status})")]
    UnexpectedResponse {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },
}

impl FarmError {
    /// Raw response body attached to the error, when there is one.
    #[must_use]
    pub fn response_body(&self) -> Option<&str> {
        match self {
            Self::UnexpectedResponse { body, .. } if !body.trim().is_empty() => Some(body),
            _ => None,
        }
    }
}

/// Handle to a live remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionHandle {
    /// Session identifier issued by the farm.
    pub id: String,
    /// Credentials the session was opened with.
    pub credentials: Credentials,
}

/// Capabilities requested for a remote session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionCapabilities {
    /// Device name.
    pub device: String,
    /// OS version.
    pub os_version: String,
    /// Idle timeout in seconds, already clamped.
    pub idle_timeout_secs: u64,
    /// Project name shown on the dashboard.
    pub project: String,
    /// Build label shown on the dashboard.
    pub build: String,
    /// Session name shown on the dashboard.
    pub name: String,
    /// Reference to the uploaded app.
    pub app_url: String,
}

impl SessionCapabilities {
    /// Merges the artifact's capabilities with run metadata.
    #[must_use]
    pub fn for_run(config: &RunConfig, artifact: &BuildArtifact, package: &str, app_url: &str) -> Self {
        Self {
            device: artifact.device.clone(),
            os_version: artifact.os_version.clone(),
            idle_timeout_secs: config.effective_idle_timeout(),
            project: package.to_owned(),
            build: config.build_label(),
            name: package.to_owned(),
            app_url: app_url.to_owned(),
        }
    }

    /// Renders the desired-capabilities document for `credentials`.
    #[must_use]
    pub fn to_json(&self, credentials: &Credentials) -> Value {
        let mut caps = Map::new();
        caps.insert(String::from("device"), json!(self.device));
        caps.insert(String::from("os_version"), json!(self.os_version));
        caps.insert(String::from("browserstack.user"), json!(credentials.user));
        caps.insert(String::from("browserstack.key"), json!(credentials.key));
        caps.insert(String::from("browserstack.networkLogs"), json!(true));
        caps.insert(
            String::from("browserstack.idleTimeout"),
            json!(self.idle_timeout_secs),
        );
        caps.insert(String::from("project"), json!(self.project));
        caps.insert(String::from("build"), json!(self.build));
        caps.insert(String::from("name"), json!(self.name));
        caps.insert(String::from("app"), json!(self.app_url));
        Value::Object(caps)
    }
}

/// Minimal interface implemented by device farms.
pub trait DeviceFarm {
    /// Uploads the artifact and returns the farm's reference to it.
    fn upload<'a>(
        &'a self,
        credentials: &'a Credentials,
        artifact: &'a BuildArtifact,
    ) -> FarmFuture<'a, String>;

    /// Opens a session that launches the uploaded app.
    fn start_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        capabilities: &'a SessionCapabilities,
    ) -> FarmFuture<'a, SessionHandle>;

    /// Performs a trivial action to reset the session's idle clock.
    fn ping<'a>(&'a self, session: &'a SessionHandle) -> FarmFuture<'a, ()>;

    /// Ends the session.
    fn quit<'a>(&'a self, session: &'a SessionHandle) -> FarmFuture<'a, ()>;
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    app_url: Option<String>,
    error: Option<String>,
}

/// BrowserStack App Automate client.
#[derive(Clone, Debug)]
pub struct BrowserStackFarm {
    client: reqwest::Client,
    upload_url: String,
    hub_url: String,
    request_timeout: Duration,
}

impl BrowserStackFarm {
    /// Creates a client for the configured endpoints.
    #[must_use]
    pub fn new(config: &FarmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            upload_url: config.upload_url.clone(),
            hub_url: config.hub_url.trim_end_matches('/').to_owned(),
            request_timeout: HTTP_TIMEOUT,
        }
    }

    /// Overrides the bound on keep-alive and quit requests.
    ///
    /// This is primarily used by tests against unresponsive peers.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn session_url(&self, session: &SessionHandle) -> String {
        format!("{}/session/{}", self.hub_url, session.id)
    }

    async fn upload_form(&self, artifact: &BuildArtifact) -> Result<Form, FarmError> {
        let ArtifactSource::File(path) = &artifact.source else {
            return Ok(Form::new());
        };
        let bytes = tokio::fs::read(path).await.map_err(|err| FarmError::Artifact {
            path: path.to_string(),
            message: err.to_string(),
        })?;
        let file_name = path.file_name().unwrap_or("app").to_owned();
        Ok(Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name))
            .text("data", "{}"))
    }
}

impl DeviceFarm for BrowserStackFarm {
    fn upload<'a>(
        &'a self,
        credentials: &'a Credentials,
        artifact: &'a BuildArtifact,
    ) -> FarmFuture<'a, String> {
        Box::pin(async move {
            let request = self
                .client
                .post(&self.upload_url)
                .timeout(UPLOAD_TIMEOUT)
                .basic_auth(&credentials.user, Some(&credentials.key));
            let request = match &artifact.source {
                ArtifactSource::File(_) => request.multipart(self.upload_form(artifact).await?),
                ArtifactSource::Url(url) => request.json(&json!({ "url": url })),
            };

            let (status, body) = send(request).await?;
            let parsed: UploadResponse = serde_json::from_str(&body)
                .map_err(|_| FarmError::UnexpectedResponse { status, body: body.clone() })?;
            if let Some(message) = parsed.error {
                return Err(FarmError::Rejected { message });
            }
            parsed
                .app_url
                .ok_or(FarmError::UnexpectedResponse { status, body })
        })
    }

    fn start_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        capabilities: &'a SessionCapabilities,
    ) -> FarmFuture<'a, SessionHandle> {
        Box::pin(async move {
            let request = self
                .client
                .post(format!("{}/session", self.hub_url))
                .timeout(SESSION_START_TIMEOUT)
                .basic_auth(&credentials.user, Some(&credentials.key))
                .json(&json!({ "desiredCapabilities": capabilities.to_json(credentials) }));

            let (status, body) = send(request).await?;
            let id = parse_session_id(status, &body)?;
            debug!(session = %id, "remote session started");
            Ok(SessionHandle {
                id,
                credentials: credentials.clone(),
            })
        })
    }

    fn ping<'a>(&'a self, session: &'a SessionHandle) -> FarmFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .client
                .post(format!("{}/execute", self.session_url(session)))
                .timeout(self.request_timeout)
                .basic_auth(&session.credentials.user, Some(&session.credentials.key))
                .json(&json!({ "script": IDLE_PING_SCRIPT, "args": [] }));
            expect_success(request).await
        })
    }

    fn quit<'a>(&'a self, session: &'a SessionHandle) -> FarmFuture<'a, ()> {
        Box::pin(async move {
            let request = self
                .client
                .delete(self.session_url(session))
                .timeout(self.request_timeout)
                .basic_auth(&session.credentials.user, Some(&session.credentials.key));
            expect_success(request).await
        })
    }
}

async fn send(request: reqwest::RequestBuilder) -> Result<(u16, String), FarmError> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status().as_u16();
    let body = response.text().await.map_err(transport_error)?;
    Ok((status, body))
}

async fn expect_success(request: reqwest::RequestBuilder) -> Result<(), FarmError> {
    let (status, body) = send(request).await?;
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(FarmError::UnexpectedResponse { status, body })
    }
}

/// Extracts the session id from either a JSON wire or a W3C response.
fn parse_session_id(status: u16, body: &str) -> Result<String, FarmError> {
    let unexpected = || FarmError::UnexpectedResponse {
        status,
        body: body.to_owned(),
    };
    let parsed: Value = serde_json::from_str(body).map_err(|_| unexpected())?;

    let wire_status = parsed.get("status").and_then(Value::as_i64).unwrap_or(0);
    let value = parsed.get("value");
    let reported_error = value
        .and_then(|inner| inner.get("error").or_else(|| inner.get("message")))
        .and_then(Value::as_str);
    if wire_status != 0 || !(200..300).contains(&status) {
        return Err(reported_error.map_or_else(unexpected, |message| FarmError::Rejected {
            message: message.to_owned(),
        }));
    }

    parsed
        .get("sessionId")
        .or_else(|| value.and_then(|inner| inner.get("sessionId")))
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(unexpected)
}

fn transport_error(err: reqwest::Error) -> FarmError {
    FarmError::Transport {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests;
