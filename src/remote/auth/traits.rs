use async_trait::async_trait;
use russh::client;

use crate::remote::ssh::SshClientHandler;

/// One SSH `userauth` method offered on an established handle.
///
/// `Ok(false)` means the server refused the credentials and the next method
/// may still be tried. `Err` carries a transport or protocol failure.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Method name as it appears on the wire (`publickey`, `password`).
    fn name(&self) -> &'static str;
}
