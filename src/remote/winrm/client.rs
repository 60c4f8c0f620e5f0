//! WS-Management client for the Windows remote shell.
//!
//! Wraps an HTTP client, the endpoint URL and a [`Transport`], and exposes
//! one method per shell operation.

use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info};

use super::soap::{self, Fault, ReceiveOutput};
use super::transport::{self, Transport};
use crate::remote::config::parse_duration;
use crate::remote::credentials::Credentials;
use crate::remote::error::ConnectionError;
use crate::remote::types::{Target, WinrmSettings};

/// Failure of a single WS-Management request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("{0}")]
    Transport(String),

    #[error("access denied (HTTP 401)")]
    Unauthorized,

    #[error("{0}")]
    Fault(Fault),

    #[error("unexpected HTTP status {status}")]
    Status { status: StatusCode },

    #[error("{0}")]
    Malformed(String),
}

impl RequestError {
    /// True for the fault a Receive raises when no output arrived in time.
    pub fn is_operation_timeout(&self) -> bool {
        matches!(self, RequestError::Fault(fault) if fault.is_operation_timeout())
    }
}

/// Endpoint URL for a target.
pub fn endpoint_url(target: &Target, settings: &WinrmSettings) -> String {
    let scheme = if settings.https { "https" } else { "http" };
    format!("{}://{}/wsman", scheme, target.address())
}

/// A WinRM service endpoint plus the way requests authenticate to it.
pub struct WinrmClient {
    http: reqwest::Client,
    url: String,
    transport: Box<dyn Transport>,
}

impl WinrmClient {
    /// Build the client. Nothing is sent until the first request.
    pub fn new(
        target: &Target,
        settings: &WinrmSettings,
        credentials: &Credentials,
    ) -> Result<Self, ConnectionError> {
        let url = endpoint_url(target, settings);

        let connect_timeout = parse_duration(&settings.connect_timeout).map_err(|cause| {
            ConnectionError::InvalidTimeout {
                value: settings.connect_timeout.clone(),
                cause,
            }
        })?;

        let transport =
            transport::for_credentials(credentials).ok_or_else(|| ConnectionError::AuthFailed {
                username: credentials.username.clone(),
                address: target.address(),
                cause: "no basic or ntlm credentials".to_string(),
            })?;

        let http = build_http_client(settings, connect_timeout).map_err(|e| match e {
            HttpClientError::Certificate { path, cause } => {
                ConnectionError::InvalidCertificate { path, cause }
            }
            HttpClientError::Build(cause) => ConnectionError::DialFailed {
                address: target.address(),
                cause,
            },
        })?;

        info!("WinRM endpoint {} using {} authentication", url, transport.name());

        Ok(Self {
            http,
            url,
            transport,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(&self, envelope: String) -> Result<String, RequestError> {
        let reply = self
            .transport
            .post(&self.http, &self.url, &envelope)
            .await
            .map_err(RequestError::Transport)?;

        if reply.status.is_success() {
            return Ok(reply.body);
        }
        if reply.status == StatusCode::UNAUTHORIZED {
            return Err(RequestError::Unauthorized);
        }
        match soap::parse_fault(&reply.body) {
            Some(fault) => Err(RequestError::Fault(fault)),
            None => Err(RequestError::Status {
                status: reply.status,
            }),
        }
    }

    pub async fn create_shell(&self) -> Result<String, RequestError> {
        let body = self.request(soap::create_shell(&self.url)).await?;
        let shell_id = soap::parse_shell_id(&body).map_err(RequestError::Malformed)?;
        debug!("Created shell {}", shell_id);
        Ok(shell_id)
    }

    pub async fn start_command(&self, shell_id: &str, command: &str) -> Result<String, RequestError> {
        let body = self
            .request(soap::run_command(&self.url, shell_id, command))
            .await?;
        soap::parse_command_id(&body).map_err(RequestError::Malformed)
    }

    /// Send all of `data` and close the command's stdin.
    pub async fn send_input(
        &self,
        shell_id: &str,
        command_id: &str,
        data: &[u8],
    ) -> Result<(), RequestError> {
        for (chunk, end) in soap::input_chunks(data) {
            self.request(soap::send_input(&self.url, shell_id, command_id, chunk, end))
                .await?;
        }
        Ok(())
    }

    pub async fn receive(&self, shell_id: &str, command_id: &str) -> Result<ReceiveOutput, RequestError> {
        let body = self
            .request(soap::receive_output(&self.url, shell_id, command_id))
            .await?;
        soap::parse_receive(&body).map_err(RequestError::Malformed)
    }

    pub async fn terminate(&self, shell_id: &str, command_id: &str) -> Result<(), RequestError> {
        self.request(soap::terminate_command(&self.url, shell_id, command_id))
            .await
            .map(|_| ())
    }

    pub async fn delete_shell(&self, shell_id: &str) -> Result<(), RequestError> {
        self.request(soap::delete_shell(&self.url, shell_id))
            .await
            .map(|_| ())
    }
}

enum HttpClientError {
    Certificate {
        path: std::path::PathBuf,
        cause: String,
    },
    Build(String),
}

fn build_http_client(
    settings: &WinrmSettings,
    connect_timeout: Duration,
) -> Result<reqwest::Client, HttpClientError> {
    let mut builder = reqwest::Client::builder()
        .danger_accept_invalid_certs(settings.insecure)
        .pool_max_idle_per_host(1);

    if !connect_timeout.is_zero() {
        builder = builder.connect_timeout(connect_timeout);
    }

    if let Some(path) = &settings.ca_cert {
        let certificate_error = |cause: String| HttpClientError::Certificate {
            path: path.clone(),
            cause,
        };
        let pem = std::fs::read(path).map_err(|e| certificate_error(e.to_string()))?;
        let certificate =
            reqwest::Certificate::from_pem(&pem).map_err(|e| certificate_error(e.to_string()))?;
        builder = builder.add_root_certificate(certificate);
    }

    // rustls parses added roots only when the client is built
    builder.build().map_err(|e| match &settings.ca_cert {
        Some(path) => HttpClientError::Certificate {
            path: path.clone(),
            cause: e.to_string(),
        },
        None => HttpClientError::Build(e.to_string()),
    })
}
