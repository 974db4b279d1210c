//! Referral address validation
//!
//! Referral identifiers are Tezos implicit-account addresses: `tz1`, `tz2`
//! or `tz3` followed by 33 base58 characters.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

/// Address used when the user has not configured their own.
pub const DEFAULT_REFERRAL_ID: &str = "tz1ZzSmVcnVaWNZKJradtrDnjSjzTp6qjTEW";

const ADDRESS_PATTERN: &str = "^tz[1-3][a-km-zA-HJ-NP-Z1-9]{33}$";

static ADDRESS_RE: OnceLock<Option<Regex>> = OnceLock::new();

/// Error type for address parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Referral address is empty")]
    Empty,
    #[error("Invalid Tezos address: {0}")]
    InvalidFormat(String),
}

/// Check whether `address` is a well-formed referral address.
pub fn is_valid_address(address: &str) -> bool {
    ADDRESS_RE
        .get_or_init(|| Regex::new(ADDRESS_PATTERN).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(address))
}

/// A referral address that passed format validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferralId(String);

impl ReferralId {
    /// Parse and validate a referral address. Surrounding whitespace is ignored.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }
        if !is_valid_address(trimmed) {
            return Err(AddressError::InvalidFormat(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The built-in default address.
    pub fn default_id() -> Self {
        Self(DEFAULT_REFERRAL_ID.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_default(&self) -> bool {
        self.0 == DEFAULT_REFERRAL_ID
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for ReferralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
