use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of account. The integer codes are what the account table stores.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    User,
    Guest,
    Admin,
    AppService,
}

impl AccountKind {
    /// Every kind counted as "all users".
    pub const ALL: [AccountKind; 4] = [Self::User, Self::Guest, Self::Admin, Self::AppService];
    /// Kinds counted as non-bridged users.
    pub const NON_BRIDGED: [AccountKind; 3] = [Self::User, Self::Guest, Self::Admin];
    /// Kinds whose device activity is materialized into daily visits.
    pub const VISIT_TRACKED: [AccountKind; 2] = [Self::User, Self::Admin];
    /// Kinds that register as "native" (or "bridged" when owned by an appservice).
    pub const REGISTERED_NATIVE: [AccountKind; 3] = [Self::User, Self::Admin, Self::AppService];

    pub fn code(&self) -> i64 {
        match self {
            Self::User => 1,
            Self::Guest => 2,
            Self::Admin => 3,
            Self::AppService => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::User),
            2 => Some(Self::Guest),
            3 => Some(Self::Admin),
            4 => Some(Self::AppService),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Guest => "guest",
            Self::Admin => "admin",
            Self::AppService => "appservice",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bucket used by the registration breakdown.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum RegistrationType {
    Native,
    Guest,
    Bridged,
}

impl RegistrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Guest => "guest",
            Self::Bridged => "bridged",
        }
    }

    /// Classify an account, or `None` when it belongs in no bucket
    /// (a guest owned by an appservice).
    pub fn of(kind: AccountKind, bridged: bool) -> Option<Self> {
        match (kind, bridged) {
            (AccountKind::Guest, false) => Some(Self::Guest),
            (AccountKind::Guest, true) => None,
            (_, false) => Some(Self::Native),
            (_, true) => Some(Self::Bridged),
        }
    }
}
