//! Standard input forwarding for remote commands.
//!
//! When stdin is an interactive terminal nothing is forwarded. Otherwise the
//! whole stream is read once, handed to the first command, and every later
//! command sees an immediately-closed input.

use std::io::IsTerminal;

use tokio::io::AsyncReadExt;
use tracing::debug;

/// Where remote commands get their input from.
#[derive(Debug)]
pub enum InputSource {
    /// Stdin is a tty; run commands without forwarding input
    Terminal,
    /// Stdin is piped; `pending` is read lazily and forwarded once
    Piped { pending: Option<Vec<u8>>, read: bool },
}

impl InputSource {
    /// Inspect the process's stdin.
    pub fn detect() -> Self {
        if std::io::stdin().is_terminal() {
            debug!("stdin is a terminal, input will not be forwarded");
            InputSource::Terminal
        } else {
            InputSource::Piped {
                pending: None,
                read: false,
            }
        }
    }

    /// A piped source with fixed contents.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        InputSource::Piped {
            pending: Some(bytes.into()),
            read: true,
        }
    }

    /// Input for the next command.
    ///
    /// `None` means do not forward; `Some` carries the bytes to send before
    /// closing the remote input (empty after the first call).
    pub async fn next_payload(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match self {
            InputSource::Terminal => Ok(None),
            InputSource::Piped { pending, read } => {
                if !*read {
                    let mut buffer = Vec::new();
                    tokio::io::stdin().read_to_end(&mut buffer).await?;
                    debug!("Buffered {} bytes of stdin", buffer.len());
                    *pending = Some(buffer);
                    *read = true;
                }
                Ok(Some(pending.take().unwrap_or_default()))
            }
        }
    }
}
