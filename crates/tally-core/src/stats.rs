use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::platform::PlatformTag;

/// Bucket that sums every platform group, `unknown` included.
pub const ALL_BUCKET: &str = "all";

/// Point-in-time usage metrics. Built fresh for every request, never stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub all_users: i64,
    pub daily_users: i64,
    pub monthly_users: i64,
    pub non_bridged_users: i64,
    pub registered_by_kind: BTreeMap<String, i64>,
    pub r30: BTreeMap<String, i64>,
    pub r30v2: BTreeMap<String, i64>,
}

impl UsageSnapshot {
    /// R30V2 always reports the four known platforms plus `all`.
    pub fn seeded_r30v2() -> BTreeMap<String, i64> {
        PlatformTag::KNOWN
            .iter()
            .map(|tag| tag.as_str())
            .chain(std::iter::once(ALL_BUCKET))
            .map(|key| (key.to_string(), 0))
            .collect()
    }
}

impl Default for UsageSnapshot {
    fn default() -> Self {
        Self {
            all_users: 0,
            daily_users: 0,
            monthly_users: 0,
            non_bridged_users: 0,
            registered_by_kind: BTreeMap::new(),
            r30: BTreeMap::new(),
            r30v2: Self::seeded_r30v2(),
        }
    }
}

/// Product name and version of the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineInfo {
    pub engine: String,
    pub version: String,
}

impl EngineInfo {
    /// Descriptor whose version has not been queried yet.
    pub fn unversioned(engine: impl Into<String>) -> Self {
        Self {
            engine: engine.into(),
            version: "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_seeds_r30v2_only() {
        let snap = UsageSnapshot::default();
        let keys: Vec<&str> = snap.r30v2.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["all", "android", "electron", "ios", "web"]);
        assert!(snap.r30v2.values().all(|v| *v == 0));
        assert!(snap.r30.is_empty());
        assert!(snap.registered_by_kind.is_empty());
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let json = serde_json::to_value(UsageSnapshot::default()).unwrap();
        assert_eq!(json["allUsers"], 0);
        assert_eq!(json["nonBridgedUsers"], 0);
        assert_eq!(json["registeredByKind"], serde_json::json!({}));
        assert_eq!(json["r30v2"]["ios"], 0);
    }

    #[test]
    fn unversioned_engine() {
        let info = EngineInfo::unversioned("SQLite");
        assert_eq!(info.engine, "SQLite");
        assert_eq!(info.version, "unknown");
    }
}
