//! Account-status broadcast types.
//!
//! The server pushes `{email, status}` frames on a global topic whenever an
//! account's standing changes. Status strings arrive in arbitrary casing and
//! are normalized to the uppercase canonical form.

use serde::{Deserialize, Serialize};

/// Standing of a user account, as broadcast by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccountStatus {
    /// Account in good standing. Initial state of every session.
    #[default]
    Active,
    /// Account awaiting review.
    Pending,
    /// Account blocked; the session must terminate.
    Blocked,
}

impl AccountStatus {
    /// Returns the canonical uppercase wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Pending => "PENDING",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string is not a known account status.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown account status: {0:?}")]
pub struct StatusParseError(pub String);

impl std::str::FromStr for AccountStatus {
    type Err = StatusParseError;

    /// Case-insensitive parse; surrounding whitespace is ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "PENDING" => Ok(Self::Pending),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(StatusParseError(s.to_string())),
        }
    }
}

/// A status broadcast frame as it travels on the wire.
///
/// The `status` field stays a raw string here; callers normalize it via
/// [`StatusFrame::account_status`] so unknown values can be logged and
/// skipped instead of failing the whole frame decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Identity the status change applies to.
    pub email: String,
    /// Status string, arbitrary casing.
    pub status: String,
}

impl StatusFrame {
    /// Parses the raw status string into an [`AccountStatus`].
    ///
    /// # Errors
    ///
    /// Returns [`StatusParseError`] for unknown status values.
    pub fn account_status(&self) -> Result<AccountStatus, StatusParseError> {
        self.status.parse()
    }
}
