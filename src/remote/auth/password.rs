//! Password SSH authentication.
//!
//! Servers that disable the `password` method often still accept the same
//! secret through `keyboard-interactive` (PAM). When the plain method is
//! rejected the strategy retries that way, answering every prompt with the
//! password.

use async_trait::async_trait;
use russh::client;
use russh::client::KeyboardInteractiveAuthResponse;
use tracing::debug;

use crate::remote::ssh::SshClientHandler;

use super::traits::AuthStrategy;

/// Rounds of prompts answered before giving up.
const MAX_INTERACTIVE_ROUNDS: usize = 4;

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// One answer per prompt, all of them the password.
    fn answers(&self, prompts: usize) -> Vec<String> {
        vec![self.password.clone(); prompts]
    }

    async fn keyboard_interactive(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await
            .map_err(|e| format!("keyboard-interactive authentication failed: {}", e))?;

        for _ in 0..MAX_INTERACTIVE_ROUNDS {
            let prompts = match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(true),
                KeyboardInteractiveAuthResponse::Failure { .. } => return Ok(false),
                KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => prompts,
            };
            debug!("Answering {} keyboard-interactive prompt(s)", prompts.len());

            response = handle
                .authenticate_keyboard_interactive_respond(self.answers(prompts.len()))
                .await
                .map_err(|e| format!("keyboard-interactive authentication failed: {}", e))?;
        }

        Ok(matches!(response, KeyboardInteractiveAuthResponse::Success))
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let result = handle
            .authenticate_password(username, &self.password)
            .await
            .map_err(|e| format!("Password authentication failed: {}", e))?;

        if result.success() {
            return Ok(true);
        }

        debug!("Password method rejected, trying keyboard-interactive");
        self.keyboard_interactive(handle, username).await
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
