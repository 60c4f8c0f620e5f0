//! HTTP transports for WS-Management requests.
//!
//! A transport decides how a request is authenticated. [`BasicTransport`]
//! sends credentials with every request; [`NtlmTransport`] runs the NTLM
//! handshake for each request it sends.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use tracing::debug;

use super::ntlm::{self, NtlmIdentity};
use super::soap;
use crate::remote::credentials::{AuthMethod, Credentials};

/// Raw HTTP reply; interpreting it is up to the SOAP layer.
#[derive(Debug)]
pub struct HttpReply {
    pub status: StatusCode,
    pub body: String,
}

/// How a WinRM request reaches the service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST one SOAP envelope to `url`.
    ///
    /// Errors are network-level failures only; HTTP error statuses come back
    /// as an [`HttpReply`].
    async fn post(
        &self,
        client: &reqwest::Client,
        url: &str,
        envelope: &str,
    ) -> Result<HttpReply, String>;

    fn name(&self) -> &'static str;
}

/// Pick the transport for resolved WinRM credentials.
pub fn for_credentials(credentials: &Credentials) -> Option<Box<dyn Transport>> {
    if credentials.offers(AuthMethod::Ntlm) {
        Some(Box::new(NtlmTransport::new(
            &credentials.username,
            credentials.password_or_empty(),
        )))
    } else if credentials.offers(AuthMethod::Basic) {
        Some(Box::new(BasicTransport::new(
            &credentials.username,
            credentials.password_or_empty(),
        )))
    } else {
        None
    }
}

async fn into_reply(response: reqwest::Response) -> Result<HttpReply, String> {
    let status = response.status();
    let body = response.text().await.map_err(|e| e.to_string())?;
    Ok(HttpReply { status, body })
}

/// HTTP Basic authentication.
pub struct BasicTransport {
    username: String,
    password: String,
}

impl BasicTransport {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

#[async_trait]
impl Transport for BasicTransport {
    async fn post(
        &self,
        client: &reqwest::Client,
        url: &str,
        envelope: &str,
    ) -> Result<HttpReply, String> {
        let response = client
            .post(url)
            .header(CONTENT_TYPE, soap::CONTENT_TYPE)
            .basic_auth(&self.username, Some(&self.password))
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        into_reply(response).await
    }

    fn name(&self) -> &'static str {
        "basic"
    }
}

/// NTLM over HTTP `Negotiate`.
pub struct NtlmTransport {
    identity: NtlmIdentity,
}

impl NtlmTransport {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            identity: NtlmIdentity::new(username, password),
        }
    }
}

/// Find the NTLM challenge token among `WWW-Authenticate` values.
fn challenge_token(response: &reqwest::Response) -> Option<(&'static str, String)> {
    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| {
            ["Negotiate", "NTLM"].into_iter().find_map(|scheme| {
                value
                    .strip_prefix(scheme)
                    .and_then(|rest| rest.strip_prefix(' '))
                    .map(|token| (scheme, token.trim().to_string()))
            })
        })
}

#[async_trait]
impl Transport for NtlmTransport {
    async fn post(
        &self,
        client: &reqwest::Client,
        url: &str,
        envelope: &str,
    ) -> Result<HttpReply, String> {
        let negotiate = STANDARD.encode(ntlm::negotiate_message());
        let response = client
            .post(url)
            .header(CONTENT_TYPE, soap::CONTENT_TYPE)
            .header(AUTHORIZATION, format!("Negotiate {}", negotiate))
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return into_reply(response).await;
        }

        let Some((scheme, token)) = challenge_token(&response) else {
            // Plain 401 without a challenge: credentials or scheme rejected
            return into_reply(response).await;
        };
        // Drain the body so the connection can carry the authenticate message
        let _ = response.bytes().await;

        let challenge_bytes = STANDARD
            .decode(token)
            .map_err(|e| format!("invalid NTLM challenge: {}", e))?;
        let challenge = ntlm::parse_challenge(&challenge_bytes)?;
        debug!(
            "NTLM challenge received via {} ({} bytes of target info)",
            scheme,
            challenge.target_info.len()
        );

        let authenticate = ntlm::authenticate_message(
            &challenge,
            &self.identity,
            ntlm::random_client_challenge(),
            ntlm::filetime_now(),
        )?;

        let response = client
            .post(url)
            .header(CONTENT_TYPE, soap::CONTENT_TYPE)
            .header(
                AUTHORIZATION,
                format!("{} {}", scheme, STANDARD.encode(authenticate)),
            )
            .body(envelope.to_string())
            .send()
            .await
            .map_err(|e| e.to_string())?;
        into_reply(response).await
    }

    fn name(&self) -> &'static str {
        "ntlm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::winrm::tests::FakeServer;

    fn credentials(strategies: Vec<AuthMethod>) -> Credentials {
        Credentials {
            username: "CORP\\alice".to_string(),
            password: Some("pw".to_string()),
            private_key: None,
            strategies,
        }
    }

    #[test]
    fn test_selection() {
        let ntlm = for_credentials(&credentials(vec![AuthMethod::Ntlm])).unwrap();
        assert_eq!(ntlm.name(), "ntlm");
        let basic = for_credentials(&credentials(vec![AuthMethod::Basic])).unwrap();
        assert_eq!(basic.name(), "basic");
        assert!(for_credentials(&credentials(vec![AuthMethod::Password])).is_none());
    }

    #[tokio::test]
    async fn test_basic_sends_credentials_each_request() {
        let server = FakeServer::start(|request| {
            let expected = format!("Basic {}", STANDARD.encode("CORP\\alice:pw"));
            if request.header("authorization") == Some(expected.as_str())
                && request.header("content-type") == Some(soap::CONTENT_TYPE)
            {
                (200, Vec::new(), "ok".to_string())
            } else {
                (401, Vec::new(), String::new())
            }
        })
        .await;

        let transport = BasicTransport::new("CORP\\alice", "pw");
        let client = reqwest::Client::new();
        for _ in 0..2 {
            let reply = transport.post(&client, &server.url(), "<x/>").await.unwrap();
            assert_eq!(reply.status, StatusCode::OK);
            assert_eq!(reply.body, "ok");
        }
        assert_eq!(server.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_ntlm_handshake() {
        let server = FakeServer::start(FakeServer::ntlm(|_| (200, "done".to_string()))).await;

        let transport = NtlmTransport::new("CORP\\alice", "pw");
        let client = reqwest::Client::new();
        let reply = transport.post(&client, &server.url(), "<x/>").await.unwrap();
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, "done");

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests.iter().all(|r| r.body == "<x/>"));
    }

    #[tokio::test]
    async fn test_ntlm_plain_rejection_is_returned() {
        let server = FakeServer::start(|_| (401, Vec::new(), String::new())).await;

        let transport = NtlmTransport::new("alice", "pw");
        let client = reqwest::Client::new();
        let reply = transport.post(&client, &server.url(), "<x/>").await.unwrap();
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        assert_eq!(server.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_service_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let transport = BasicTransport::new("alice", "pw");
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/wsman", port);
        assert!(transport.post(&client, &url, "<x/>").await.is_err());
    }
}
