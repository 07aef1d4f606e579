//! Single-shot HTTP collector for test results.
//!
//! The app under test reports its outcome with one HTTP request whose body
//! is a JSON document. The collector binds a local port, accepts requests on
//! any method and path, and settles a [`PendingResult`] with the first
//! complete submission. Later submissions are acknowledged but never
//! override the first outcome.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, FailedToBufferBody};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Largest result body accepted, in bytes.
pub const MAX_RESULT_BYTES: usize = 64 * 1024 * 1024;

const ACK_OK: &str = "ok";
const ACK_FAIL: &str = "fail";

/// Errors raised by the result collector.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CollectorError {
    /// Raised when the listener cannot bind its port.
    #[error("failed to bind result collector on port {port}: {message}")]
    Bind {
        /// Port requested by the caller.
        port: u16,
        /// Operating system error string.
        message: String,
    },
    /// Raised when a submission body is not a valid result document.
    #[error("malformed result payload: {message}")]
    Parse {
        /// Decoder error string.
        message: String,
    },
    /// Raised when the request fails before its body completes.
    #[error("result submission failed in transit: {message}")]
    Transport {
        /// Transport error string.
        message: String,
    },
    /// Raised when the collector stops before any result arrives.
    #[error("result collector closed before a result was received")]
    Closed,
    /// Raised when the server task ends abnormally.
    #[error("result collector server failed: {message}")]
    Server {
        /// Error string reported by the server task.
        message: String,
    },
}

/// Completion indicator reported by the test run.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum CompletionFlag {
    /// Boolean flag; `true` marks a failing run.
    Flag(bool),
    /// Integer flag used directly as the exit code.
    Code(i64),
    /// Fractional flag, truncated toward zero.
    Fraction(f64),
}

impl CompletionFlag {
    /// Exit code carried by the flag.
    #[must_use]
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Flag(failed) => i32::from(failed),
            Self::Code(code) => i32::try_from(code).unwrap_or(i32::MAX),
            // Saturates at the i32 bounds; NaN becomes 0.
            #[expect(
                clippy::cast_possible_truncation,
                reason = "fractional exit codes truncate like the app runtime's"
            )]
            Self::Fraction(value) => value as i32,
        }
    }
}

/// Result document submitted by the app under test.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct TestPayload {
    /// Completion indicator; doubles as the process exit code.
    pub finished: CompletionFlag,
    /// Test output to print once the run ends.
    pub output: Value,
}

impl TestPayload {
    /// Decodes a complete request body.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Parse`] when the body is not valid JSON or
    /// lacks the required fields.
    pub fn from_slice(body: &[u8]) -> Result<Self, CollectorError> {
        serde_json::from_slice(body).map_err(|err| CollectorError::Parse {
            message: err.to_string(),
        })
    }

    /// Exit code carried by the completion flag.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        self.finished.exit_code()
    }

    /// Output rendered for the terminal; strings are printed verbatim.
    #[must_use]
    pub fn output_text(&self) -> String {
        match &self.output {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

type Settlement = Result<TestPayload, CollectorError>;

/// Write-once slot shared between the HTTP handler and the orchestrator.
#[derive(Debug)]
struct ResultSlot {
    sender: Mutex<Option<oneshot::Sender<Settlement>>>,
}

impl ResultSlot {
    fn settle(&self, outcome: Settlement) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    debug!("pending result dropped before settlement");
                }
            }
            None => debug!("ignoring result submission after settlement"),
        }
    }
}

/// Receiving side of the collector; settles exactly once.
#[derive(Debug)]
pub struct PendingResult {
    receiver: oneshot::Receiver<Settlement>,
}

impl PendingResult {
    /// Waits for the first submission.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Parse`] or [`CollectorError::Transport`]
    /// when the first submission is unusable, or [`CollectorError::Closed`]
    /// when the collector stops without receiving one.
    pub async fn wait(self) -> Result<TestPayload, CollectorError> {
        self.receiver.await.unwrap_or(Err(CollectorError::Closed))
    }
}

/// Running collector bound to a local port.
#[derive(Debug)]
pub struct ResultCollector {
    local_addr: SocketAddr,
    pending: Option<PendingResult>,
    shutdown: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl ResultCollector {
    /// Binds the listener on all interfaces and starts serving.
    ///
    /// Port `0` asks the OS for an ephemeral port; see
    /// [`ResultCollector::local_addr`].
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Bind`] when the port cannot be bound.
    pub async fn start(port: u16) -> Result<Self, CollectorError> {
        Self::start_with_limit(port, MAX_RESULT_BYTES).await
    }

    /// Like [`ResultCollector::start`], accepting bodies up to `max_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Bind`] when the port cannot be bound.
    pub async fn start_with_limit(port: u16, max_bytes: usize) -> Result<Self, CollectorError> {
        let bind_error = |err: std::io::Error| CollectorError::Bind {
            port,
            message: err.to_string(),
        };
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        let (result_tx, result_rx) = oneshot::channel();
        let slot = Arc::new(ResultSlot {
            sender: Mutex::new(Some(result_tx)),
        });
        let router = Router::new()
            .fallback(receive_result)
            .layer(DefaultBodyLimit::max(max_bytes))
            .with_state(slot);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
        });
        debug!(%local_addr, "result collector listening");

        Ok(Self {
            local_addr,
            pending: Some(PendingResult {
                receiver: result_rx,
            }),
            shutdown: Some(shutdown_tx),
            server: Some(server),
        })
    }

    /// Address the listener is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Port the listener is bound to.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Hands out the pending result; only the first call returns it.
    pub fn take_pending(&mut self) -> Option<PendingResult> {
        self.pending.take()
    }

    /// Returns `true` once [`ResultCollector::stop`] has completed.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.server.is_none()
    }

    /// Stops accepting connections and waits until the socket is released.
    ///
    /// Stopping an already stopped collector is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Server`] when the server task failed.
    pub async fn stop(&mut self) -> Result<(), CollectorError> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.send(()).ok();
        }
        let Some(server) = self.server.take() else {
            return Ok(());
        };

        match server.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(CollectorError::Server {
                message: err.to_string(),
            }),
            Err(err) => Err(CollectorError::Server {
                message: err.to_string(),
            }),
        }
    }
}

async fn receive_result(
    State(slot): State<Arc<ResultSlot>>,
    body: Result<Bytes, BytesRejection>,
) -> (StatusCode, &'static str) {
    let bytes = match body {
        Ok(bytes) => bytes,
        Err(BytesRejection::FailedToBufferBody(FailedToBufferBody::LengthLimitError(err))) => {
            warn!(error = %err, "result submission exceeds the size limit");
            slot.settle(Err(CollectorError::Parse {
                message: format!("result body too large: {err}"),
            }));
            return (StatusCode::PAYLOAD_TOO_LARGE, ACK_FAIL);
        }
        Err(err) => {
            warn!(error = %err, "result submission failed before completion");
            slot.settle(Err(CollectorError::Transport {
                message: err.to_string(),
            }));
            return (StatusCode::BAD_REQUEST, ACK_FAIL);
        }
    };

    match TestPayload::from_slice(&bytes) {
        Ok(payload) => {
            slot.settle(Ok(payload));
            (StatusCode::OK, ACK_OK)
        }
        Err(err) => {
            warn!(error = %err, "result submission was not a valid payload");
            slot.settle(Err(err));
            (StatusCode::BAD_REQUEST, ACK_FAIL)
        }
    }
}
