use crate::SecurityError;
use harbor_core::Account;

pub const ACCOUNT_PASSWORD_NAMESPACE: &str = "account_password";

#[derive(Debug, Clone)]
pub struct SecretStore {
    service_name: String,
}

#[derive(Debug, Clone)]
pub struct SecretKey {
    pub namespace: String,
    pub id: String,
}

impl SecretKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    pub fn account_password(account: &Account) -> Self {
        Self::new(ACCOUNT_PASSWORD_NAMESPACE, account.id.as_str())
    }

    pub fn as_username(&self) -> String {
        format!("{}:{}", self.namespace, self.id)
    }
}

impl SecretStore {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn get(&self, key: &SecretKey) -> Result<Option<String>, SecurityError> {
        let entry = keyring::Entry::new(&self.service_name, &key.as_username())?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Fills in a missing account password from the keychain. Returns whether the account
    /// has a password afterwards.
    pub fn hydrate_password(&self, account: &mut Account) -> Result<bool, SecurityError> {
        if account.password.is_some() {
            return Ok(true);
        }

        account.password = self.get(&SecretKey::account_password(account))?;
        if account.password.is_none() {
            tracing::warn!(account = %account.id, "no password in config or keychain");
        }
        Ok(account.password.is_some())
    }
}
