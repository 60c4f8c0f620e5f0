use std::sync::Arc;

use async_trait::async_trait;
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use tracing::debug;

use crate::remote::ssh::SshClientHandler;

use super::traits::AuthStrategy;

/// `publickey` with the identity file the credential resolver decoded.
pub struct KeyAuth {
    key: Arc<PrivateKey>,
}

impl KeyAuth {
    pub fn new(key: Arc<PrivateKey>) -> Self {
        Self { key }
    }

    fn algorithm(&self) -> String {
        self.key.algorithm().to_string()
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        // Only RSA keys care; other algorithms ignore the hash
        let rsa_hash = match handle.best_supported_rsa_hash().await {
            Ok(hash) => hash.flatten(),
            Err(e) => {
                debug!("Server did not advertise RSA hashes: {}", e);
                None
            }
        };
        debug!("Offering {} key as {}", self.algorithm(), username);

        handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::clone(&self.key), rsa_hash))
            .await
            .map(|result| result.success())
            .map_err(|e| format!("{} key: {}", self.algorithm(), e))
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}
