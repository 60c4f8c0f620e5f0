//! Core value types shared by every backend.
//!
//! A [`Target`] and its [`Backend`] are built once from command-line input
//! and never mutated. [`Operation`]s are executed in order against a single
//! session and each produces one transient [`OperationResult`].

use std::path::PathBuf;

/// Remote protocol selected by the command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    MySql,
    Postgres,
    Ssh,
    Winrm,
}

impl Protocol {
    /// Whether at least one authentication strategy must resolve before a
    /// session may be provisioned.
    ///
    /// Database servers decide for themselves whether an empty password is
    /// acceptable, so SQL protocols never fail resolution.
    pub fn requires_authentication(self) -> bool {
        matches!(self, Protocol::Ssh | Protocol::Winrm)
    }

    /// Whether results come back as a byte stream rather than rows.
    pub fn is_shell(self) -> bool {
        matches!(self, Protocol::Ssh | Protocol::Winrm)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::MySql => write!(f, "mysql"),
            Protocol::Postgres => write!(f, "postgres"),
            Protocol::Ssh => write!(f, "ssh"),
            Protocol::Winrm => write!(f, "winrm"),
        }
    }
}

/// WinRM endpoint settings that are not part of the host/port pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WinrmSettings {
    /// Use `https` instead of `http`
    pub https: bool,
    /// Skip TLS certificate validation
    pub insecure: bool,
    /// PEM file with an extra trusted root certificate
    pub ca_cert: Option<PathBuf>,
    /// Go-style duration string, `0s` disables the connect timeout
    pub connect_timeout: String,
}

impl Default for WinrmSettings {
    fn default() -> Self {
        Self {
            https: false,
            insecure: false,
            ca_cert: None,
            connect_timeout: "0s".to_string(),
        }
    }
}

/// Protocol plus the protocol-specific connection extras.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    MySql { database: String },
    Postgres { database: String },
    Ssh,
    Winrm(WinrmSettings),
}

impl Backend {
    pub fn protocol(&self) -> Protocol {
        match self {
            Backend::MySql { .. } => Protocol::MySql,
            Backend::Postgres { .. } => Protocol::Postgres,
            Backend::Ssh => Protocol::Ssh,
            Backend::Winrm(_) => Protocol::Winrm,
        }
    }
}

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub host: String,
    pub port: u16,
    pub backend: Backend,
}

impl Target {
    pub fn new(host: impl Into<String>, port: u16, backend: Backend) -> Self {
        Self {
            host: host.into(),
            port,
            backend,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.backend.protocol()
    }

    /// `host:port`, bracketing bare IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// One unit of work: a SQL statement or a shell command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation(String);

impl Operation {
    pub fn new(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Build the operation list for a protocol from trailing arguments.
    ///
    /// SQL protocols join every argument into one query with single spaces;
    /// shell protocols run each argument as its own command.
    pub fn from_args(protocol: Protocol, args: &[String]) -> Vec<Operation> {
        if protocol.is_shell() {
            args.iter().cloned().map(Operation).collect()
        } else {
            vec![Operation(args.join(" "))]
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column-oriented row set returned by a SQL query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularResult {
    pub columns: Vec<String>,
    /// Null cells are stored as `None` and rendered empty
    pub rows: Vec<Vec<Option<String>>>,
}

/// Collected output of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamResult {
    pub exit_code: i32,
    /// Remote standard output
    pub output: Vec<u8>,
    /// Remote standard error, kept apart from the rendered output
    pub errors: Vec<u8>,
}

/// Normalized result of executing one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationResult {
    Tabular(TabularResult),
    Stream(StreamResult),
}

impl OperationResult {
    /// Remote exit code, only present for shell results.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            OperationResult::Tabular(_) => None,
            OperationResult::Stream(stream) => Some(stream.exit_code),
        }
    }
}
