use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ScoutError};

/// Platform limit on handle length.
const MAX_HANDLE_LEN: usize = 30;

/// A case-normalized account handle. Also the cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Account(String);

impl Account {
    /// Trim, strip a leading `@`, lowercase, and validate.
    pub fn parse(raw: &str) -> Result<Self> {
        let handle = raw.trim().trim_start_matches('@').trim().to_lowercase();

        if handle.is_empty() {
            return Err(ScoutError::InvalidAccount("handle must not be empty".into()));
        }
        if handle.len() > MAX_HANDLE_LEN {
            return Err(ScoutError::InvalidAccount(format!(
                "handle longer than {MAX_HANDLE_LEN} characters"
            )));
        }
        if let Some(bad) = handle
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '_'))
        {
            return Err(ScoutError::InvalidAccount(format!(
                "unexpected character {bad:?} in {handle}"
            )));
        }

        Ok(Self(handle))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Account {
    type Error = ScoutError;

    fn try_from(value: String) -> Result<Self> {
        Account::parse(&value)
    }
}

impl From<Account> for String {
    fn from(account: Account) -> Self {
        account.0
    }
}
