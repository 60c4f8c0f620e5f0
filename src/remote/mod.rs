//! Remote execution over SQL, SSH and WinRM.
//!
//! One invocation targets one backend and runs a list of operations against
//! it: queries for MySQL/PostgreSQL, command lines for SSH/WinRM.
//!
//! # Pipeline
//!
//! ```text
//! RawCredentials --credentials::resolve--> Credentials
//!       Target + Credentials --session::provision--> Box<dyn Session>
//!             Operation --Session::execute--> OperationResult --render--> text
//! ```
//!
//! [`orchestrator::run`] wires the stages together and guarantees the
//! session is closed however the invocation ends.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod error;
pub mod input;
pub mod orchestrator;
pub mod render;
pub mod session;
pub mod sql;
pub mod ssh;
pub mod types;
pub mod winrm;

pub use config::InvocationConfig;
pub use credentials::{Credentials, PasswordEncoding, RawCredentials};
pub use error::{Error, FAILURE_EXIT_CODE, remote_exit_status};
pub use input::InputSource;
pub use orchestrator::{Invocation, run};
pub use session::Session;
pub use types::{Backend, Operation, OperationResult, Protocol, Target, WinrmSettings};
