mod error;
mod keychain;

pub use error::SecurityError;
pub use keychain::{SecretKey, SecretStore, ACCOUNT_PASSWORD_NAMESPACE};
