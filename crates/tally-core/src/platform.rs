use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Client platform derived from a free-text client identifier (user agent).
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformTag {
    Android,
    Ios,
    Electron,
    Web,
    Unknown,
}

impl PlatformTag {
    /// The four tags that are reported as named buckets.
    pub const KNOWN: [PlatformTag; 4] = [Self::Ios, Self::Android, Self::Web, Self::Electron];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
            Self::Electron => "electron",
            Self::Web => "web",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for PlatformTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlatformTag {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            "electron" => Ok(Self::Electron),
            "web" => Ok(Self::Web),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown platform tag: {other}")),
        }
    }
}

/// Which heuristic to apply. The two variants back two different retention
/// metrics and must never be merged: changing either one changes the history
/// of the metric built on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClassifierVariant {
    /// Used by R30.
    Legacy,
    /// Used by R30V2. Only first-party clients get a native platform tag.
    V2,
}

/// Map a client identifier to a platform tag.
///
/// Matching is case-insensitive substring search and the first rule that
/// matches wins. Total: empty or unrecognised input yields `Unknown`.
pub fn classify(client_identifier: &str, variant: ClassifierVariant) -> PlatformTag {
    let ua = client_identifier.to_lowercase();
    match variant {
        ClassifierVariant::Legacy => classify_legacy(&ua),
        ClassifierVariant::V2 => classify_v2(&ua),
    }
}

fn classify_legacy(ua: &str) -> PlatformTag {
    if ua.contains("android") {
        PlatformTag::Android
    } else if ua.contains("ios") {
        PlatformTag::Ios
    } else if ua.contains("electron") {
        PlatformTag::Electron
    } else if ua.contains("mozilla") || ua.contains("gecko") {
        PlatformTag::Web
    } else {
        PlatformTag::Unknown
    }
}

fn classify_v2(ua: &str) -> PlatformTag {
    if ua.contains("riot") || ua.contains("element") {
        if ua.contains("electron") {
            PlatformTag::Electron
        } else if ua.contains("android") {
            PlatformTag::Android
        } else if ua.contains("ios") {
            PlatformTag::Ios
        } else {
            PlatformTag::Unknown
        }
    } else if ua.contains("mozilla") || ua.contains("gecko") {
        PlatformTag::Web
    } else {
        PlatformTag::Unknown
    }
}
