//! Error taxonomy for the remote execution pipeline.
//!
//! Each pipeline stage has its own error type:
//!
//! - [`CredentialError`]: raw credential inputs could not be turned into a
//!   usable authentication strategy
//! - [`ConnectionError`]: a session could not be provisioned or authenticated
//! - [`ExecutionError`]: a single operation failed at the transport level
//!
//! Every one of them is fatal to the invocation. Nothing in the pipeline
//! retries; the orchestrator releases the session and surfaces the error,
//! and the entry point maps it to [`FAILURE_EXIT_CODE`].
//!
//! A nonzero exit code from a remote command is *not* an error. It travels
//! inside the stream result and becomes the process exit status.

use std::path::PathBuf;

use thiserror::Error;

use super::types::Protocol;

/// Exit status for any resolver, provisioner or executor failure.
///
/// Mirrors the OpenSSH client, which reserves 255 for its own errors. Like
/// `ssh`, this status is not unique: a remote command exiting 255 (or a
/// Windows command returning `-1`) yields the same status. Pipeline errors
/// are told apart by the `error:` line on stderr.
pub const FAILURE_EXIT_CODE: u8 = 255;

/// Process exit status for a remote exit code: its low 8 bits, as a shell
/// reports them.
pub fn remote_exit_status(code: i32) -> u8 {
    (code & 0xff) as u8
}

/// Credential resolution failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("invalid private key {}: {cause}", path.display())]
    InvalidKey { path: PathBuf, cause: String },

    #[error("password is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("no usable authentication strategy for {0} (supply a password or an identity file)")]
    NoStrategy(Protocol),
}

/// Session provisioning failures.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("failed to connect to {address}: {cause}")]
    DialFailed { address: String, cause: String },

    #[error("invalid connect timeout '{value}': {cause}")]
    InvalidTimeout { value: String, cause: String },

    #[error("invalid connection settings: {0}")]
    DsnInvalid(String),

    #[error("authentication failed for {username}@{address}: {cause}")]
    AuthFailed {
        username: String,
        address: String,
        cause: String,
    },

    #[error("invalid CA certificate {}: {cause}", path.display())]
    InvalidCertificate { path: PathBuf, cause: String },
}

/// Per-operation transport failures.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("query failed: {0}")]
    QueryFailed(String),

    #[error("failed to open channel: {0}")]
    ChannelFailed(String),

    #[error("failed to start command: {0}")]
    StartFailed(String),

    #[error("failed to read output: {0}")]
    ReadFailed(String),

    #[error("command did not complete: {0}")]
    WaitFailed(String),
}

/// Top-level invocation error.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("operation {index} is empty, enter the command to execute on the command line")]
    EmptyOperation { index: usize },

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),
}

impl Error {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> u8 {
        FAILURE_EXIT_CODE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod messages {
        use super::*;

        #[test]
        fn test_invalid_key_includes_path() {
            let err = CredentialError::InvalidKey {
                path: PathBuf::from("/home/user/.ssh/id_rsa"),
                cause: "bad magic".to_string(),
            };
            let msg = err.to_string();
            assert!(msg.contains("/home/user/.ssh/id_rsa"));
            assert!(msg.contains("bad magic"));
        }

        #[test]
        fn test_no_strategy_names_protocol() {
            let err = CredentialError::NoStrategy(Protocol::Ssh);
            assert!(err.to_string().contains("ssh"));
        }

        #[test]
        fn test_dial_failed_includes_address() {
            let err = ConnectionError::DialFailed {
                address: "10.0.0.1:22".to_string(),
                cause: "Connection refused".to_string(),
            };
            assert_eq!(
                err.to_string(),
                "failed to connect to 10.0.0.1:22: Connection refused"
            );
        }

        #[test]
        fn test_invalid_timeout_includes_value() {
            let err = ConnectionError::InvalidTimeout {
                value: "ten".to_string(),
                cause: "missing unit".to_string(),
            };
            assert!(err.to_string().contains("'ten'"));
        }

        #[test]
        fn test_wrapped_errors_are_transparent() {
            let inner = ExecutionError::QueryFailed("syntax error".to_string());
            let expected = inner.to_string();
            let err: Error = inner.into();
            assert_eq!(err.to_string(), expected);
        }

        #[test]
        fn test_empty_operation_message() {
            let err = Error::EmptyOperation { index: 2 };
            assert!(err.to_string().contains("operation 2 is empty"));
        }
    }

    mod exit_codes {
        use super::*;

        #[test]
        fn test_remote_status_keeps_low_byte() {
            assert_eq!(remote_exit_status(0), 0);
            assert_eq!(remote_exit_status(3), 3);
            assert_eq!(remote_exit_status(256), 0);
            assert_eq!(remote_exit_status(0x1_0002), 2);
        }

        #[test]
        fn test_remote_255_and_minus_one_share_the_failure_status() {
            assert_eq!(remote_exit_status(255), FAILURE_EXIT_CODE);
            assert_eq!(remote_exit_status(-1), FAILURE_EXIT_CODE);
        }

        #[test]
        fn test_every_kind_maps_to_failure_code() {
            let errors: Vec<Error> = vec![
                CredentialError::NoStrategy(Protocol::Winrm).into(),
                ConnectionError::DsnInvalid("empty host".to_string()).into(),
                ExecutionError::ReadFailed("eof".to_string()).into(),
                Error::EmptyOperation { index: 0 },
            ];
            for err in errors {
                assert_eq!(err.exit_code(), FAILURE_EXIT_CODE);
            }
        }

        #[test]
        fn test_failure_code_is_nonzero() {
            assert_ne!(FAILURE_EXIT_CODE, 0);
        }
    }
}
