//! SSH authentication.
//!
//! [`AuthChain::from_credentials`] turns resolved credentials into the
//! methods an SSH server understands: [`KeyAuth`] for a loaded identity file
//! and [`PasswordAuth`] (with a keyboard-interactive fallback). The chain
//! stops at the first method the server accepts.

mod chain;
mod key;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
