//! Windows remote shell sessions over WS-Management.
//!
//! Each command runs in its own `cmd` shell:
//!
//! 1. Create a shell
//! 2. Start the command
//! 3. Forward stdin (when the invocation forwards input) and close it
//! 4. Poll Receive until the command state is `Done`
//! 5. Signal terminate and delete the shell
//!
//! Authentication happens per HTTP request inside the transport, so there is
//! no separate authentication step.

mod client;
mod ntlm;
mod soap;
mod transport;

use async_trait::async_trait;
use tracing::{debug, warn};

pub use client::{RequestError, WinrmClient};

use super::credentials::Credentials;
use super::error::{ConnectionError, ExecutionError};
use super::session::Session;
use super::types::{Operation, OperationResult, Protocol, StreamResult, Target, WinrmSettings};

/// A WinRM endpoint that runs one shell per command.
pub struct WinrmSession {
    client: Option<WinrmClient>,
}

impl WinrmSession {
    pub fn new(
        target: &Target,
        settings: &WinrmSettings,
        credentials: &Credentials,
    ) -> Result<Self, ConnectionError> {
        let client = WinrmClient::new(target, settings, credentials)?;
        Ok(Self {
            client: Some(client),
        })
    }
}

#[async_trait]
impl Session for WinrmSession {
    fn protocol(&self) -> Protocol {
        Protocol::Winrm
    }

    async fn execute(
        &mut self,
        operation: &Operation,
        input: Option<&[u8]>,
    ) -> Result<OperationResult, ExecutionError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| ExecutionError::ChannelFailed("session is closed".to_string()))?;

        let shell_id = client
            .create_shell()
            .await
            .map_err(|e| ExecutionError::ChannelFailed(e.to_string()))?;

        let result = run_in_shell(client, &shell_id, operation.as_str(), input).await;

        if let Err(e) = client.delete_shell(&shell_id).await {
            warn!("Failed to delete shell {}: {}", shell_id, e);
        }

        result.map(OperationResult::Stream)
    }

    async fn close(&mut self) {
        if self.client.take().is_some() {
            debug!("Released WinRM client");
        }
    }
}

async fn run_in_shell(
    client: &WinrmClient,
    shell_id: &str,
    command: &str,
    input: Option<&[u8]>,
) -> Result<StreamResult, ExecutionError> {
    let command_id = client
        .start_command(shell_id, command)
        .await
        .map_err(|e| ExecutionError::StartFailed(e.to_string()))?;

    if let Some(input) = input {
        client
            .send_input(shell_id, &command_id, input)
            .await
            .map_err(|e| ExecutionError::StartFailed(format!("failed to send input: {}", e)))?;
    }

    let collected = collect_output(client, shell_id, &command_id).await;

    if let Err(e) = client.terminate(shell_id, &command_id).await {
        debug!("Terminate signal for {} failed: {}", command_id, e);
    }

    collected
}

async fn collect_output(
    client: &WinrmClient,
    shell_id: &str,
    command_id: &str,
) -> Result<StreamResult, ExecutionError> {
    let mut result = StreamResult::default();

    loop {
        let chunk = match client.receive(shell_id, command_id).await {
            Ok(chunk) => chunk,
            Err(e) if e.is_operation_timeout() => {
                debug!("No output from {} yet, polling again", command_id);
                continue;
            }
            Err(e) => return Err(ExecutionError::ReadFailed(e.to_string())),
        };

        result.output.extend_from_slice(&chunk.stdout);
        result.errors.extend_from_slice(&chunk.stderr);

        if chunk.done {
            result.exit_code = chunk.exit_code.ok_or_else(|| {
                ExecutionError::WaitFailed("command finished without an exit code".to_string())
            })?;
            break;
        }
    }

    debug!(
        "Command finished with exit code {} ({} bytes stdout, {} bytes stderr)",
        result.exit_code,
        result.output.len(),
        result.errors.len()
    );
    Ok(result)
}
