use crate::constants::{METRIC_PROFILE_STEM, PROFILES_CONFIG_MAP, PROFILE_PREFIX};
use crate::error::{self, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::path::Path;

/// The set of AppArmor profiles handed to the controller, keyed by profile name. Bodies are opaque
/// to the verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    profiles: BTreeMap<String, String>,
}

impl ProfileConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_profile<S1, S2>(mut self, name: S1, body: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        self.profiles.insert(name.into(), body.into());
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }

    pub fn body(&self, name: &str) -> Option<&str> {
        self.profiles.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Renders the profiles as the ConfigMap watched by the controller.
    pub fn to_config_map(&self, namespace: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(PROFILES_CONFIG_MAP.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            data: Some(self.profiles.clone()),
            ..Default::default()
        }
    }

    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        Self {
            profiles: config_map.data.clone().unwrap_or_default(),
        }
    }
}

/// Reads a YAML manifest holding a single ConfigMap.
pub fn read_manifest(path: &Path) -> Result<ConfigMap> {
    let manifest = std::fs::read_to_string(path).context(error::ManifestReadSnafu { path })?;
    convert_manifest(&manifest, path)
}

/// Deserializes a ConfigMap from the YAML text of the manifest found at `path`.
pub fn convert_manifest(manifest: &str, path: &Path) -> Result<ConfigMap> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(manifest).context(error::ManifestParseSnafu { path })?;
    let kind = value
        .get("kind")
        .and_then(serde_yaml::Value::as_str)
        .unwrap_or_default()
        .to_string();
    ensure!(kind == "ConfigMap", error::ManifestKindSnafu { path, kind });
    Ok(serde_yaml::from_value(value).context(error::ManifestParseSnafu { path })?)
}

/// Profiles managed by the controller carry this prefix.
pub fn is_managed_name(name: &str) -> bool {
    name.starts_with(PROFILE_PREFIX)
}

/// A profile name that no earlier run can have used, so counters keyed by it start fresh.
pub fn unique_profile_name(now: DateTime<Utc>) -> String {
    format!("{}-{}", METRIC_PROFILE_STEM, now.timestamp())
}

/// Renders an AppArmor profile which allows writes below `/home` and denies them to the system
/// binaries. `extra_rules` are appended to the default rule set.
pub fn render_profile(name: &str, extra_rules: &[&str]) -> String {
    let mut rules = vec!["file,", "/home/** rw,", "deny /bin/** w,", "deny /usr/** w,"];
    rules.extend_from_slice(extra_rules);
    let mut body = format!("profile {} flags=(attach_disconnected) {{\n", name);
    for rule in rules {
        body.push_str("  ");
        body.push_str(rule);
        body.push('\n');
    }
    body.push_str("}\n");
    body
}
