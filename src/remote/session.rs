//! The polymorphic session capability.
//!
//! Every backend implements [`Session`]: one live, resource-owning handle to
//! a single remote connection. [`provision`] builds the right implementation
//! for a [`Target`].
//!
//! # Lifecycle
//!
//! 1. `provision` opens the transport (lazy pool, SSH dial, or WinRM client)
//! 2. `authenticate` runs the auth step the transport needs up front
//! 3. `execute` runs operations one at a time
//! 4. `close` releases the transport; it is idempotent and also runs
//!    implicitly when the owned transport is dropped

use async_trait::async_trait;

use super::config::InvocationConfig;
use super::credentials::Credentials;
use super::error::{ConnectionError, ExecutionError};
use super::sql::SqlSession;
use super::ssh::SshSession;
use super::types::{Backend, Operation, OperationResult, Protocol, Target};
use super::winrm::WinrmSession;

/// One backend connection, exclusively owned by the orchestrator.
#[async_trait]
pub trait Session: Send {
    fn protocol(&self) -> Protocol;

    /// Authenticate before the first operation.
    ///
    /// Backends that authenticate lazily (SQL pools, per-request WinRM
    /// authentication) keep the default no-op.
    async fn authenticate(&mut self) -> Result<(), ConnectionError> {
        Ok(())
    }

    /// Run one operation.
    ///
    /// `input` is `Some` when standard input must be forwarded to a remote
    /// command (possibly empty, meaning end of input), `None` otherwise.
    /// SQL sessions ignore it.
    async fn execute(
        &mut self,
        operation: &Operation,
        input: Option<&[u8]>,
    ) -> Result<OperationResult, ExecutionError>;

    /// Release the underlying transport. Calling it again is a no-op.
    async fn close(&mut self);
}

/// Open a session for `target`.
///
/// No retries happen here. Whatever was acquired before a failing step is
/// dropped before the error is returned.
pub async fn provision(
    target: &Target,
    credentials: Credentials,
    config: &InvocationConfig,
) -> Result<Box<dyn Session>, ConnectionError> {
    match &target.backend {
        Backend::MySql { database } | Backend::Postgres { database } => {
            let session = SqlSession::open(target, database, &credentials, config.timeout())?;
            Ok(Box::new(session))
        }
        Backend::Ssh => {
            let session = SshSession::connect(target, credentials).await?;
            Ok(Box::new(session))
        }
        Backend::Winrm(settings) => {
            let session = WinrmSession::new(target, settings, &credentials)?;
            Ok(Box::new(session))
        }
    }
}
