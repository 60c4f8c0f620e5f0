//! Drives one invocation end to end.
//!
//! resolve credentials -> provision -> authenticate -> execute and render
//! each operation in order -> close.
//!
//! The session is closed on every path out of [`run`], including an early
//! stop on an empty or failing operation.

use std::io::Write;

use tracing::{debug, error, info};

use super::config::InvocationConfig;
use super::credentials::{self, RawCredentials};
use super::error::Error;
use super::input::InputSource;
use super::render::render;
use super::session::{self, Session};
use super::types::{Operation, OperationResult, Target};

/// Everything one invocation needs.
#[derive(Debug)]
pub struct Invocation {
    pub target: Target,
    pub credentials: RawCredentials,
    pub operations: Vec<Operation>,
    pub config: InvocationConfig,
}

/// Run an invocation and return the exit status to report.
///
/// Rendered results go to `out`, remote standard error to `err`.
pub async fn run(
    invocation: Invocation,
    input: &mut InputSource,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<i32, Error> {
    let Invocation {
        target,
        credentials,
        operations,
        config,
    } = invocation;

    let protocol = target.protocol();
    let credentials = credentials::resolve(protocol, credentials)?;

    let session = session::provision(&target, credentials, &config).await?;
    info!("Provisioned {} session for {}", protocol, target.address());

    let outcome = run_session(session, &operations, input, &config, out, err).await;
    if let Err(e) = &outcome {
        error!("Invocation against {} failed: {}", target.address(), e);
    }
    outcome
}

/// Authenticate, drive and close a provisioned session.
pub async fn run_session(
    mut session: Box<dyn Session>,
    operations: &[Operation],
    input: &mut InputSource,
    config: &InvocationConfig,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<i32, Error> {
    let outcome = match session.authenticate().await {
        Ok(()) => drive(session.as_mut(), operations, input, config, out, err).await,
        Err(e) => Err(e.into()),
    };

    session.close().await;
    outcome
}

/// Execute `operations` in order on an open session.
///
/// Stops at the first failure. The returned status is the exit code of the
/// last command run, or 0 when no operation reported one.
pub async fn drive(
    session: &mut dyn Session,
    operations: &[Operation],
    input: &mut InputSource,
    config: &InvocationConfig,
    out: &mut dyn Write,
    err: &mut dyn Write,
) -> Result<i32, Error> {
    let protocol = session.protocol();
    let mut status = 0;

    for (index, operation) in operations.iter().enumerate() {
        if operation.is_blank() {
            return Err(Error::EmptyOperation { index: index + 1 });
        }

        if config.verbose {
            let label = if protocol.is_shell() { "Command" } else { "SQL Query" };
            writeln!(out, "{}: {}", label, operation)?;
        }

        let payload = if protocol.is_shell() {
            input.next_payload().await?
        } else {
            None
        };

        debug!("Executing operation {} of {}", index + 1, operations.len());
        let result = session.execute(operation, payload.as_deref()).await?;

        out.write_all(render(&result).as_bytes())?;
        if let OperationResult::Stream(stream) = &result {
            err.write_all(&stream.errors)?;
        }
        out.flush()?;

        if let Some(code) = result.exit_code() {
            debug!("Operation {} exited with {}", index + 1, code);
            status = code;
        }
    }

    Ok(status)
}
