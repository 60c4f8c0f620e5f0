//! Credential resolution.
//!
//! Turns the raw credential flags of a command into [`Credentials`]: the
//! decoded password, the parsed private key (if any) and the ordered list of
//! authentication strategies a session should offer.
//!
//! # Strategy order
//!
//! | Protocol | Strategies |
//! |----------|------------|
//! | SSH | public key (if a key was loaded), then password (if nonempty) |
//! | WinRM | NTLM when `--ntlm` is set, Basic otherwise (needs a nonempty password) |
//! | MySQL / PostgreSQL | password, possibly empty |
//!
//! An identity file that does not exist is skipped without error so the
//! session can fall back to password authentication. A file that exists but
//! cannot be read or parsed is an [`CredentialError::InvalidKey`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose};
use russh::keys::{self, PrivateKey};
use tracing::{debug, warn};

use super::error::CredentialError;
use super::types::Protocol;

/// How the supplied password is encoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PasswordEncoding {
    #[default]
    Plain,
    Base64,
}

/// One concrete authentication method offered to the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey,
    Password,
    Ntlm,
    Basic,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::PublicKey => write!(f, "publickey"),
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::Ntlm => write!(f, "ntlm"),
            AuthMethod::Basic => write!(f, "basic"),
        }
    }
}

/// Credential flags exactly as supplied on the command line.
#[derive(Debug, Clone, Default)]
pub struct RawCredentials {
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub identity_passphrase: Option<String>,
    /// Select NTLM instead of Basic for WinRM
    pub ntlm: bool,
    pub password_encoding: PasswordEncoding,
}

/// Resolved, immutable credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    /// Decoded password, `None` when none was supplied
    pub password: Option<String>,
    pub private_key: Option<Arc<PrivateKey>>,
    /// Strategies in the order they are attempted
    pub strategies: Vec<AuthMethod>,
}

impl Credentials {
    /// Password to send, empty when none was supplied.
    pub fn password_or_empty(&self) -> &str {
        self.password.as_deref().unwrap_or("")
    }

    pub fn offers(&self, method: AuthMethod) -> bool {
        self.strategies.contains(&method)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<loaded>"))
            .field("strategies", &self.strategies)
            .finish()
    }
}

/// Resolve raw credential inputs for `protocol`.
pub fn resolve(protocol: Protocol, raw: RawCredentials) -> Result<Credentials, CredentialError> {
    let password = match raw.password {
        Some(password) => Some(decode_password(&password, raw.password_encoding)?),
        None => None,
    };

    let private_key = match raw.identity_file.as_deref() {
        Some(path) => load_private_key(path, raw.identity_passphrase.as_deref())?,
        None => None,
    };

    let has_password = password.as_deref().is_some_and(|p| !p.is_empty());

    let strategies = match protocol {
        Protocol::Ssh => {
            let mut strategies = Vec::with_capacity(2);
            if private_key.is_some() {
                strategies.push(AuthMethod::PublicKey);
            }
            if has_password {
                strategies.push(AuthMethod::Password);
            }
            strategies
        }
        Protocol::Winrm => {
            if private_key.is_some() {
                debug!("Identity file ignored for winrm");
            }
            match (has_password, raw.ntlm) {
                (false, _) => Vec::new(),
                (true, true) => vec![AuthMethod::Ntlm],
                (true, false) => vec![AuthMethod::Basic],
            }
        }
        Protocol::MySql | Protocol::Postgres => vec![AuthMethod::Password],
    };

    if strategies.is_empty() && protocol.requires_authentication() {
        return Err(CredentialError::NoStrategy(protocol));
    }

    debug!(
        "Resolved {} credentials for '{}' with strategies {:?}",
        protocol, raw.username, strategies
    );

    Ok(Credentials {
        username: raw.username,
        password,
        private_key,
        strategies,
    })
}

/// Decode a password according to its encoding.
///
/// Base64 passwords are decoded with the standard padded alphabet and any
/// trailing CR/LF characters are stripped, so `echo secret | base64` output
/// can be passed straight through.
pub fn decode_password(
    password: &str,
    encoding: PasswordEncoding,
) -> Result<String, CredentialError> {
    match encoding {
        PasswordEncoding::Plain => Ok(password.to_string()),
        PasswordEncoding::Base64 => {
            let bytes = general_purpose::STANDARD
                .decode(password.trim())
                .map_err(|e| CredentialError::InvalidEncoding(e.to_string()))?;
            let decoded = String::from_utf8(bytes)
                .map_err(|e| CredentialError::InvalidEncoding(e.to_string()))?;
            Ok(decoded.trim_end_matches(['\r', '\n']).to_string())
        }
    }
}

/// Load and parse a private key when the file exists.
///
/// Returns `Ok(None)` when `path` does not exist. An empty passphrase is
/// treated as no passphrase.
pub fn load_private_key(
    path: &Path,
    passphrase: Option<&str>,
) -> Result<Option<Arc<PrivateKey>>, CredentialError> {
    if !path.exists() {
        warn!(
            "Identity file {} does not exist, skipping public key authentication",
            path.display()
        );
        return Ok(None);
    }

    let invalid = |cause: String| CredentialError::InvalidKey {
        path: path.to_path_buf(),
        cause,
    };

    let contents = std::fs::read_to_string(path)
        .map_err(|e| invalid(format!("failed to read private key: {}", e)))?;

    let passphrase = passphrase.filter(|p| !p.is_empty());
    let key = keys::decode_secret_key(&contents, passphrase)
        .map_err(|e| invalid(format!("failed to parse private key: {}", e)))?;

    debug!("Loaded private key from {}", path.display());
    Ok(Some(Arc::new(key)))
}
