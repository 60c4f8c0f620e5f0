//! Ordered SSH authentication over the resolved credentials.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::remote::credentials::{AuthMethod, Credentials};
use crate::remote::ssh::SshClientHandler;

use super::traits::AuthStrategy;
use super::{KeyAuth, PasswordAuth};

/// How one strategy ended when the chain tried it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    Rejected,
    Errored(String),
}

/// The SSH strategies of one set of credentials, tried in resolver order
/// until the server accepts one.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Methods the SSH server cannot use (NTLM, Basic) are left out, as is
    /// `publickey` when no key was loaded.
    pub fn from_credentials(credentials: &Credentials) -> Self {
        let strategies = credentials
            .strategies
            .iter()
            .filter_map(|method| -> Option<Box<dyn AuthStrategy>> {
                match method {
                    AuthMethod::PublicKey => credentials
                        .private_key
                        .as_ref()
                        .map(|key| Box::new(KeyAuth::new(Arc::clone(key))) as Box<dyn AuthStrategy>),
                    AuthMethod::Password => Some(Box::new(PasswordAuth::new(
                        credentials.password_or_empty(),
                    ))),
                    AuthMethod::Ntlm | AuthMethod::Basic => {
                        debug!("{} does not apply to ssh", method);
                        None
                    }
                }
            })
            .collect();

        Self { strategies }
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategy names in attempt order.
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

/// `publickey: rejected; password: <error>`
fn summarize(attempts: &[(&'static str, Outcome)]) -> String {
    attempts
        .iter()
        .map(|(name, outcome)| match outcome {
            Outcome::Rejected => format!("{}: rejected", name),
            Outcome::Errored(e) => format!("{}: {}", name, e),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[async_trait]
impl AuthStrategy for AuthChain {
    /// `Ok(true)` on the first accepted strategy. When every strategy fails
    /// the error lists each one's outcome.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("no ssh authentication method available".to_string());
        }

        let mut attempts = Vec::with_capacity(self.strategies.len());
        for strategy in &self.strategies {
            let outcome = match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("{} accepted for {}", strategy.name(), username);
                    return Ok(true);
                }
                Ok(false) => Outcome::Rejected,
                Err(e) => Outcome::Errored(e),
            };
            debug!("{} failed for {}: {:?}", strategy.name(), username, outcome);
            attempts.push((strategy.name(), outcome));
        }

        Err(summarize(&attempts))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}
