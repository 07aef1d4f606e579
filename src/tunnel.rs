//! Public tunnels that expose the local result collector.
//!
//! The device running the tests cannot reach the operator's machine
//! directly, so the collector port is published through a tunnel. The
//! [`Tunnel`] trait is the seam the orchestrator depends on; [`NgrokTunnel`]
//! implements it by launching the `ngrok` agent and reading the public URL
//! from the agent's local inspection API.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, warn};

use crate::config::TunnelConfig;

const API_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Upper bound on any single request to the agent's local API.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Future returned by tunnel operations.
pub type TunnelFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TunnelError>> + Send + 'a>>;

/// Errors raised by tunnel providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum TunnelError {
    /// Raised when the tunnel agent cannot be started.
    #[error("failed to start tunnel agent {program}: {message}")]
    Spawn {
        /// Agent binary.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the agent exits before publishing a URL.
    #[error("tunnel agent exited early with status {status}")]
    AgentExited {
        /// Exit status text.
        status: String,
    },
    /// Raised when no public URL appears before the deadline.
    #[error("no public tunnel URL within {seconds} seconds")]
    Timeout {
        /// Seconds waited.
        seconds: u64,
    },
    /// Raised when the agent API cannot be reached or answers badly.
    #[error("tunnel agent API error: {message}")]
    Api {
        /// Error string.
        message: String,
    },
}

/// Provider of a public HTTP endpoint forwarding to a local port.
pub trait Tunnel {
    /// Opens a tunnel to `local_port` and returns its public URL.
    fn connect<'a>(&'a self, local_port: u16, region: Option<&'a str>) -> TunnelFuture<'a, String>;

    /// Closes any open tunnels.
    fn disconnect(&self) -> TunnelFuture<'_, ()>;

    /// Releases the provider entirely (for example, stops its agent).
    fn teardown(&self) -> TunnelFuture<'_, ()>;
}

#[derive(Debug, Deserialize)]
struct TunnelList {
    tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Deserialize)]
struct TunnelEntry {
    name: String,
    public_url: String,
}

/// Tunnel backed by a locally launched `ngrok` agent.
#[derive(Debug)]
pub struct NgrokTunnel {
    config: TunnelConfig,
    client: reqwest::Client,
    agent: Mutex<Option<Child>>,
}

impl NgrokTunnel {
    /// Creates a tunnel provider; no agent is started until `connect`.
    #[must_use]
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(API_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            agent: Mutex::new(None),
        }
    }

    async fn spawn_agent(&self, local_port: u16, region: Option<&str>) -> Result<(), TunnelError> {
        let mut command = Command::new(&self.config.bin);
        command
            .args(agent_args(local_port, region))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|err| TunnelError::Spawn {
            program: self.config.bin.clone(),
            message: err.to_string(),
        })?;
        debug!(pid = child.id(), local_port, "tunnel agent started");
        *self.agent.lock().await = Some(child);
        Ok(())
    }

    async fn list_tunnels(&self) -> Result<TunnelList, TunnelError> {
        let url = format!("{}/api/tunnels", self.config.api_url.trim_end_matches('/'));
        let response = self.client.get(&url).send().await.map_err(api_error)?;
        let response = response.error_for_status().map_err(api_error)?;
        response.json::<TunnelList>().await.map_err(api_error)
    }

    /// Polls the agent API until a public URL is published.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::AgentExited`] when the agent dies first, or
    /// [`TunnelError::Timeout`] when the deadline passes. The deadline also
    /// bounds a request the agent API never answers.
    pub async fn wait_for_public_url(&self) -> Result<String, TunnelError> {
        let seconds = self.config.connect_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(seconds);

        loop {
            self.ensure_agent_alive().await?;
            match timeout_at(deadline, self.list_tunnels()).await {
                Ok(Ok(list)) => {
                    if let Some(url) = select_public_url(&list) {
                        return Ok(url);
                    }
                }
                Ok(Err(err)) => debug!(error = %err, "tunnel agent API not ready"),
                Err(_) => return Err(TunnelError::Timeout { seconds }),
            }

            if Instant::now() >= deadline {
                return Err(TunnelError::Timeout { seconds });
            }
            sleep(API_POLL_INTERVAL).await;
        }
    }

    async fn ensure_agent_alive(&self) -> Result<(), TunnelError> {
        let mut agent = self.agent.lock().await;
        let Some(child) = agent.as_mut() else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                agent.take();
                Err(TunnelError::AgentExited {
                    status: status.to_string(),
                })
            }
            Ok(None) => Ok(()),
            Err(err) => Err(TunnelError::AgentExited {
                status: err.to_string(),
            }),
        }
    }
}

impl Tunnel for NgrokTunnel {
    fn connect<'a>(&'a self, local_port: u16, region: Option<&'a str>) -> TunnelFuture<'a, String> {
        Box::pin(async move {
            let region = region.or(self.config.region.as_deref());
            self.spawn_agent(local_port, region).await?;
            self.wait_for_public_url().await
        })
    }

    fn disconnect(&self) -> TunnelFuture<'_, ()> {
        Box::pin(async move {
            if self.agent.lock().await.is_none() {
                return Ok(());
            }
            let list = self.list_tunnels().await?;
            let base = self.config.api_url.trim_end_matches('/');
            for tunnel in list.tunnels {
                let url = format!("{base}/api/tunnels/{}", tunnel.name);
                if let Err(err) = self.client.delete(&url).send().await {
                    warn!(tunnel = %tunnel.name, error = %err, "failed to close tunnel");
                }
            }
            Ok(())
        })
    }

    fn teardown(&self) -> TunnelFuture<'_, ()> {
        Box::pin(async move {
            let Some(mut child) = self.agent.lock().await.take() else {
                return Ok(());
            };
            child.kill().await.map_err(|err| TunnelError::Api {
                message: format!("failed to stop tunnel agent: {err}"),
            })
        })
    }
}

fn agent_args(local_port: u16, region: Option<&str>) -> Vec<String> {
    let mut args = vec![String::from("http"), local_port.to_string()];
    if let Some(region) = region {
        args.extend([String::from("--region"), region.to_owned()]);
    }
    args
}

fn select_public_url(list: &TunnelList) -> Option<String> {
    list.tunnels
        .iter()
        .find(|entry| entry.public_url.starts_with("https://"))
        .or_else(|| list.tunnels.first())
        .map(|entry| entry.public_url.clone())
}

fn api_error(err: reqwest::Error) -> TunnelError {
    TunnelError::Api {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn config(api_url: String) -> TunnelConfig {
        TunnelConfig {
            bin: String::from("ngrok"),
            region: None,
            api_url,
            connect_timeout_secs: 1,
        }
    }

    fn list(json: &str) -> TunnelList {
        serde_json::from_str(json).expect("valid tunnel list")
    }

    #[rstest]
    fn prefers_https_tunnels() {
        let tunnels = list(
            r#"{"tunnels":[
                {"name":"command_line (http)","public_url":"http://abc.ngrok.io"},
                {"name":"command_line","public_url":"https://abc.ngrok.io"}
            ]}"#,
        );
        assert_eq!(
            select_public_url(&tunnels).as_deref(),
            Some("https://abc.ngrok.io")
        );
    }

    #[rstest]
    fn falls_back_to_first_tunnel() {
        let tunnels = list(r#"{"tunnels":[{"name":"a","public_url":"http://a.ngrok.io"}]}"#);
        assert_eq!(
            select_public_url(&tunnels).as_deref(),
            Some("http://a.ngrok.io")
        );
    }

    #[rstest]
    #[case(None, &["http", "1234"])]
    #[case(Some("eu"), &["http", "1234", "--region", "eu"])]
    fn agent_is_launched_for_the_collector_port(
        #[case] region: Option<&str>,
        #[case] expected: &[&str],
    ) {
        assert_eq!(agent_args(1234, region), expected);
    }

    #[rstest]
    fn empty_list_has_no_url() {
        assert!(select_public_url(&list(r#"{"tunnels":[]}"#)).is_none());
    }

    #[tokio::test]
    async fn reads_public_url_from_agent_api() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/tunnels")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"tunnels":[{"name":"command_line","public_url":"https://x.ngrok.io"}]}"#)
            .create_async()
            .await;

        let tunnel = NgrokTunnel::new(config(server.url()));
        let url = tunnel.wait_for_public_url().await.expect("url published");

        assert_eq!(url, "https://x.ngrok.io");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn times_out_when_no_tunnel_appears() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/tunnels")
            .with_status(200)
            .with_body(r#"{"tunnels":[]}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let tunnel = NgrokTunnel::new(config(server.url()));
        let err = tunnel.wait_for_public_url().await.expect_err("timeout");

        assert_eq!(err, TunnelError::Timeout { seconds: 1 });
    }

    #[tokio::test]
    async fn silent_agent_api_still_times_out() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let accepting = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let tunnel = NgrokTunnel::new(config(format!("http://{addr}")));
        let result =
            tokio::time::timeout(Duration::from_secs(4), tunnel.wait_for_public_url()).await;

        accepting.abort();
        assert_eq!(
            result.expect("deadline honoured"),
            Err(TunnelError::Timeout { seconds: 1 })
        );
    }

    #[tokio::test]
    async fn disconnect_and_teardown_without_agent_are_no_ops() {
        let tunnel = NgrokTunnel::new(config(String::from("http://127.0.0.1:9")));
        tunnel.disconnect().await.expect("disconnect");
        tunnel.teardown().await.expect("teardown");
    }

    #[tokio::test]
    async fn missing_agent_binary_is_a_spawn_error() {
        let tunnel = NgrokTunnel::new(TunnelConfig {
            bin: String::from("rn-tape-missing-ngrok"),
            ..config(String::from("http://127.0.0.1:9"))
        });
        let err = tunnel.connect(1234, None).await.expect_err("spawn fails");
        assert!(matches!(err, TunnelError::Spawn { .. }), "got {err:?}");
    }
}
