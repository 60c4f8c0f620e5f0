//! Shell-over-SSH sessions.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: russh client config with keepalive settings.
//! 2. **Connection Establishment**: TCP connect and SSH handshake, bounded by
//!    [`SSH_DIAL_TIMEOUT`] no matter what the invocation timeout is.
//! 3. **Authentication**: the [`AuthChain`] built from the resolved
//!    credentials (public key first, then password).
//! 4. **Command Execution**: one fresh channel per command; stdout and stderr
//!    are collected separately and the exit status is awaited.
//!
//! ## Host keys
//!
//! [`SshClientHandler`] accepts every server key, like
//! `StrictHostKeyChecking=no`. Turning verification on would make hosts with
//! unknown or changed keys fail to connect, so the behavior is kept.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::{ChannelMsg, Disconnect, client, keys};
use tracing::{debug, info, warn};

use super::auth::{AuthChain, AuthStrategy};
use super::config::SSH_DIAL_TIMEOUT;
use super::credentials::Credentials;
use super::error::{ConnectionError, ExecutionError};
use super::session::Session;
use super::types::{Operation, OperationResult, Protocol, StreamResult, Target};

/// Client handler for russh that accepts all host keys.
pub struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Accept all host keys (similar to StrictHostKeyChecking=no)
        Ok(true)
    }
}

/// Build russh client configuration.
///
/// No inactivity timeout is set: commands run to completion and the session
/// lives until the orchestrator closes it.
pub(crate) fn build_client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    })
}

/// An authenticated (after [`Session::authenticate`]) SSH connection.
pub struct SshSession {
    handle: Option<client::Handle<SshClientHandler>>,
    address: String,
    credentials: Credentials,
}

impl SshSession {
    /// Dial `target` and complete the SSH handshake.
    pub async fn connect(target: &Target, credentials: Credentials) -> Result<Self, ConnectionError> {
        let address = target.address();
        let config = build_client_config();

        let connect_future = client::connect(
            config,
            (target.host.as_str(), target.port),
            SshClientHandler,
        );

        let handle = tokio::time::timeout(SSH_DIAL_TIMEOUT, connect_future)
            .await
            .map_err(|_| ConnectionError::DialFailed {
                address: address.clone(),
                cause: format!("Connection timed out after {:?}", SSH_DIAL_TIMEOUT),
            })?
            .map_err(|e| ConnectionError::DialFailed {
                address: address.clone(),
                cause: e.to_string(),
            })?;

        info!("Connected to {}", address);

        Ok(Self {
            handle: Some(handle),
            address,
            credentials,
        })
    }

    fn handle(&self) -> Result<&client::Handle<SshClientHandler>, ExecutionError> {
        self.handle
            .as_ref()
            .ok_or_else(|| ExecutionError::ChannelFailed("session is closed".to_string()))
    }
}

#[async_trait]
impl Session for SshSession {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    async fn authenticate(&mut self) -> Result<(), ConnectionError> {
        let auth_failed = |cause: String| ConnectionError::AuthFailed {
            username: self.credentials.username.clone(),
            address: self.address.clone(),
            cause,
        };

        let chain = AuthChain::from_credentials(&self.credentials);
        let Some(handle) = self.handle.as_mut() else {
            return Err(auth_failed("session is closed".to_string()));
        };

        debug!("Offering strategies {:?}", chain.names());
        let accepted = chain
            .authenticate(handle, &self.credentials.username)
            .await
            .map_err(auth_failed)?;

        if !accepted {
            return Err(auth_failed(
                "no authentication methods succeeded".to_string(),
            ));
        }

        info!("Authenticated as {}@{}", self.credentials.username, self.address);
        Ok(())
    }

    async fn execute(
        &mut self,
        operation: &Operation,
        input: Option<&[u8]>,
    ) -> Result<OperationResult, ExecutionError> {
        let handle = self.handle()?;

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ExecutionError::ChannelFailed(e.to_string()))?;

        let result = run_on_channel(&mut channel, operation.as_str(), input).await;

        // Always close the channel before the next command starts
        let _ = channel.close().await;

        result.map(OperationResult::Stream)
    }

    async fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("Disconnecting from {}", self.address);
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!("Failed to disconnect from {}: {}", self.address, e);
            }
        }
    }
}

/// Start `command` on an open channel, feed it `input` and collect output.
async fn run_on_channel(
    channel: &mut russh::Channel<client::Msg>,
    command: &str,
    input: Option<&[u8]>,
) -> Result<StreamResult, ExecutionError> {
    channel
        .exec(true, command)
        .await
        .map_err(|e| ExecutionError::StartFailed(e.to_string()))?;

    if let Some(input) = input {
        if !input.is_empty() {
            channel
                .data(input)
                .await
                .map_err(|e| ExecutionError::StartFailed(format!("failed to send input: {}", e)))?;
        }
        channel
            .eof()
            .await
            .map_err(|e| ExecutionError::StartFailed(format!("failed to close input: {}", e)))?;
    }

    // Pre-allocate buffers to reduce reallocations during output collection
    let mut stdout = Vec::with_capacity(4096);
    let mut stderr = Vec::with_capacity(1024);
    let mut exit_code: Option<u32> = None;
    let mut exit_signal: Option<String> = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => {
                stdout.extend_from_slice(&data);
            }
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                // ext == 1 is stderr in SSH protocol
                if ext == 1 {
                    stderr.extend_from_slice(&data);
                }
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => {
                exit_code = Some(exit_status);
            }
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                exit_signal = Some(format!("{:?}", signal_name));
            }
            Some(ChannelMsg::Eof) => {
                // Continue to wait for exit status if not received yet
                if exit_code.is_some() {
                    break;
                }
            }
            Some(ChannelMsg::Close) | None => {
                break;
            }
            Some(_) => {
                // Ignore other message types
            }
        }
    }

    let exit_code = match (exit_code, exit_signal) {
        (Some(code), _) => code as i32,
        (None, Some(signal)) => {
            return Err(ExecutionError::WaitFailed(format!(
                "remote command killed by signal {}",
                signal
            )));
        }
        (None, None) => {
            return Err(ExecutionError::WaitFailed(
                "channel closed without an exit status".to_string(),
            ));
        }
    };

    debug!(
        "Command finished with exit code {} ({} bytes stdout, {} bytes stderr)",
        exit_code,
        stdout.len(),
        stderr.len()
    );

    Ok(StreamResult {
        exit_code,
        output: stdout,
        errors: stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::credentials::AuthMethod;
    use crate::remote::types::Backend;

    mod client_config {
        use super::*;

        #[test]
        fn test_no_inactivity_timeout() {
            let config = build_client_config();
            assert_eq!(config.inactivity_timeout, None);
        }

        #[test]
        fn test_builds_config_with_keepalive() {
            let config = build_client_config();
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(30)));
            assert_eq!(config.keepalive_max, 3);
        }
    }

    mod dial {
        use super::*;

        fn credentials() -> Credentials {
            Credentials {
                username: "root".to_string(),
                password: Some("secret".to_string()),
                private_key: None,
                strategies: vec![AuthMethod::Password],
            }
        }

        #[tokio::test]
        async fn test_refused_connection_is_dial_failed() {
            // Bind then drop a listener so the port is very likely closed
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let port = listener.local_addr().unwrap().port();
            drop(listener);

            let target = Target::new("127.0.0.1", port, Backend::Ssh);
            let err = SshSession::connect(&target, credentials())
                .await
                .err()
                .unwrap();
            match err {
                ConnectionError::DialFailed { address, .. } => {
                    assert_eq!(address, format!("127.0.0.1:{}", port));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_silent_server_hits_dial_timeout() {
            // Accepts TCP but never speaks SSH
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let server = tokio::spawn(async move {
                let (socket, _) = listener.accept().await.unwrap();
                tokio::time::sleep(Duration::from_secs(10)).await;
                drop(socket);
            });

            let target = Target::new("127.0.0.1", port, Backend::Ssh);
            let started = std::time::Instant::now();
            let err = SshSession::connect(&target, credentials())
                .await
                .err()
                .unwrap();
            server.abort();

            assert!(matches!(err, ConnectionError::DialFailed { .. }));
            assert!(err.to_string().contains("timed out"));
            assert!(started.elapsed() < Duration::from_secs(9));
        }
    }

    mod exchange {
        use std::collections::HashMap;
        use std::net::SocketAddr;
        use std::path::Path;
        use std::sync::Mutex as StdMutex;

        use russh::keys::{PrivateKey, PublicKey};
        use russh::server::{self, Auth, Msg, Server as _};
        use russh::{Channel, ChannelId, CryptoVec};
        use tokio::net::TcpListener;
        use tokio::task::JoinHandle;

        use super::*;
        use crate::remote::credentials::load_private_key;

        const PASSWORD: &str = "secret";

        fn fixture_key(name: &str, passphrase: Option<&str>) -> Arc<PrivateKey> {
            let path = Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("tests/fixtures")
                .join(name);
            load_private_key(&path, passphrase).unwrap().unwrap()
        }

        fn authorized_key() -> Arc<PrivateKey> {
            fixture_key("id_ed25519", None)
        }

        fn other_key() -> Arc<PrivateKey> {
            fixture_key("id_ed25519_protected", Some("hunter2"))
        }

        /// In-process sshd with one authorized key and a few scripted commands:
        ///
        /// - `echo hi`: `hi\n` on stdout, exit 0
        /// - `fail`: `boom\n` on stderr, EOF, then exit 3
        /// - `cat`: echoes stdin back once the client sends EOF
        /// - `vanish`: closes the channel without an exit status
        #[derive(Clone)]
        struct FakeSshd {
            authorized: PublicKey,
            commands: Arc<StdMutex<Vec<String>>>,
        }

        struct Connection {
            authorized: PublicKey,
            commands: Arc<StdMutex<Vec<String>>>,
            stdin: HashMap<ChannelId, Vec<u8>>,
        }

        impl server::Server for FakeSshd {
            type Handler = Connection;

            fn new_client(&mut self, _peer: Option<SocketAddr>) -> Connection {
                Connection {
                    authorized: self.authorized.clone(),
                    commands: Arc::clone(&self.commands),
                    stdin: HashMap::new(),
                }
            }
        }

        fn finish(session: &mut server::Session, channel: ChannelId, status: u32) -> Result<(), russh::Error> {
            session.exit_status_request(channel, status)?;
            session.eof(channel)?;
            session.close(channel)
        }

        impl server::Handler for Connection {
            type Error = russh::Error;

            async fn channel_open_session(
                &mut self,
                _channel: Channel<Msg>,
                _session: &mut server::Session,
            ) -> Result<bool, Self::Error> {
                Ok(true)
            }

            async fn auth_publickey(&mut self, _user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
                if key.key_data() == self.authorized.key_data() {
                    Ok(Auth::Accept)
                } else {
                    Ok(Auth::reject())
                }
            }

            async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
                if password == PASSWORD {
                    Ok(Auth::Accept)
                } else {
                    Ok(Auth::reject())
                }
            }

            async fn exec_request(
                &mut self,
                channel: ChannelId,
                data: &[u8],
                session: &mut server::Session,
            ) -> Result<(), Self::Error> {
                let command = String::from_utf8_lossy(data).into_owned();
                self.commands.lock().unwrap().push(command.clone());
                session.channel_success(channel)?;

                match command.as_str() {
                    "echo hi" => {
                        session.data(channel, CryptoVec::from_slice(b"hi\n"))?;
                        finish(session, channel, 0)
                    }
                    "fail" => {
                        session.extended_data(channel, 1, CryptoVec::from_slice(b"boom\n"))?;
                        session.eof(channel)?;
                        session.exit_status_request(channel, 3)?;
                        session.close(channel)
                    }
                    "cat" => {
                        self.stdin.insert(channel, Vec::new());
                        Ok(())
                    }
                    "vanish" => {
                        session.eof(channel)?;
                        session.close(channel)
                    }
                    _ => finish(session, channel, 127),
                }
            }

            async fn data(
                &mut self,
                channel: ChannelId,
                data: &[u8],
                _session: &mut server::Session,
            ) -> Result<(), Self::Error> {
                if let Some(buffer) = self.stdin.get_mut(&channel) {
                    buffer.extend_from_slice(data);
                }
                Ok(())
            }

            async fn channel_eof(
                &mut self,
                channel: ChannelId,
                session: &mut server::Session,
            ) -> Result<(), Self::Error> {
                match self.stdin.remove(&channel) {
                    Some(buffer) => {
                        session.data(channel, CryptoVec::from_slice(&buffer))?;
                        finish(session, channel, 0)
                    }
                    None => Ok(()),
                }
            }
        }

        struct Sshd {
            port: u16,
            commands: Arc<StdMutex<Vec<String>>>,
            task: JoinHandle<()>,
        }

        impl Sshd {
            async fn start() -> Self {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                let port = listener.local_addr().unwrap().port();
                let commands = Arc::new(StdMutex::new(Vec::new()));
                let mut sshd = FakeSshd {
                    authorized: authorized_key().public_key().clone(),
                    commands: Arc::clone(&commands),
                };
                let config = Arc::new(server::Config {
                    keys: vec![authorized_key().as_ref().clone()],
                    auth_rejection_time: Duration::ZERO,
                    auth_rejection_time_initial: Some(Duration::ZERO),
                    ..Default::default()
                });

                let task = tokio::spawn(async move {
                    let _ = sshd.run_on_socket(config, &listener).await;
                });

                Self {
                    port,
                    commands,
                    task,
                }
            }

            fn commands(&self) -> Vec<String> {
                self.commands.lock().unwrap().clone()
            }
        }

        impl Drop for Sshd {
            fn drop(&mut self) {
                self.task.abort();
            }
        }

        fn credentials(key: Option<Arc<PrivateKey>>, password: &str) -> Credentials {
            let mut strategies = Vec::new();
            if key.is_some() {
                strategies.push(AuthMethod::PublicKey);
            }
            if !password.is_empty() {
                strategies.push(AuthMethod::Password);
            }
            Credentials {
                username: "root".to_string(),
                password: Some(password.to_string()),
                private_key: key,
                strategies,
            }
        }

        async fn open(sshd: &Sshd, credentials: Credentials) -> Result<SshSession, ConnectionError> {
            let target = Target::new("127.0.0.1", sshd.port, Backend::Ssh);
            let mut session = SshSession::connect(&target, credentials).await?;
            session.authenticate().await?;
            Ok(session)
        }

        fn stream(result: OperationResult) -> StreamResult {
            match result {
                OperationResult::Stream(stream) => stream,
                other => panic!("unexpected result: {:?}", other),
            }
        }

        #[tokio::test]
        async fn test_key_auth_and_echo() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();

            let result = stream(session.execute(&Operation::new("echo hi"), None).await.unwrap());
            assert_eq!(result.output, b"hi\n");
            assert!(result.errors.is_empty());
            assert_eq!(result.exit_code, 0);

            session.close().await;
        }

        #[tokio::test]
        async fn test_exit_status_after_eof_and_stderr() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();

            let result = stream(session.execute(&Operation::new("fail"), None).await.unwrap());
            assert!(result.output.is_empty());
            assert_eq!(result.errors, b"boom\n");
            assert_eq!(result.exit_code, 3);

            // Same connection, fresh channel
            let result = stream(session.execute(&Operation::new("echo hi"), None).await.unwrap());
            assert_eq!(result.exit_code, 0);
            assert_eq!(sshd.commands(), vec!["fail", "echo hi"]);

            session.close().await;
        }

        #[tokio::test]
        async fn test_input_is_forwarded_then_closed() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();

            let result = stream(
                session
                    .execute(&Operation::new("cat"), Some(b"line one\nline two\n"))
                    .await
                    .unwrap(),
            );
            assert_eq!(result.output, b"line one\nline two\n");
            assert_eq!(result.exit_code, 0);

            session.close().await;
        }

        #[tokio::test]
        async fn test_empty_input_still_sends_eof() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();

            let result = stream(session.execute(&Operation::new("cat"), Some(b"")).await.unwrap());
            assert!(result.output.is_empty());
            assert_eq!(result.exit_code, 0);

            session.close().await;
        }

        #[tokio::test]
        async fn test_close_without_exit_status_is_wait_failed() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();

            let err = session.execute(&Operation::new("vanish"), None).await.unwrap_err();
            assert!(matches!(err, ExecutionError::WaitFailed(_)), "{:?}", err);

            session.close().await;
        }

        #[tokio::test]
        async fn test_rejected_key_falls_back_to_password() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(other_key()), PASSWORD)).await.unwrap();

            let result = stream(session.execute(&Operation::new("echo hi"), None).await.unwrap());
            assert_eq!(result.output, b"hi\n");

            session.close().await;
        }

        #[tokio::test]
        async fn test_every_method_rejected_is_auth_failed() {
            let sshd = Sshd::start().await;
            let err = open(&sshd, credentials(Some(other_key()), "wrong"))
                .await
                .err()
                .unwrap();

            match err {
                ConnectionError::AuthFailed { username, cause, .. } => {
                    assert_eq!(username, "root");
                    assert!(cause.contains("publickey: rejected"), "{}", cause);
                    assert!(cause.contains("password: rejected"), "{}", cause);
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert!(sshd.commands().is_empty());
        }

        #[tokio::test]
        async fn test_closed_session_refuses_commands() {
            let sshd = Sshd::start().await;
            let mut session = open(&sshd, credentials(Some(authorized_key()), "")).await.unwrap();
            session.close().await;

            let err = session.execute(&Operation::new("echo hi"), None).await.unwrap_err();
            assert!(matches!(err, ExecutionError::ChannelFailed(_)));
        }
    }
}
