use crate::cluster::ClusterApi;
use crate::error::{self, Result};
use e2e_model::{read_manifest, ProfileConfig, Settings};
use k8s_openapi::api::core::v1::ConfigMap;
use log::{error, info, warn};
use snafu::ResultExt;
use std::path::Path;

/// Changes the profiles ConfigMap the controller watches. Every operation reports success as a
/// `bool` and logs the live object afterwards.
pub struct ConfigMutator<'a, C>
where
    C: ClusterApi,
{
    settings: &'a Settings,
    cluster: &'a C,
}

impl<'a, C> ConfigMutator<'a, C>
where
    C: ClusterApi,
{
    pub fn new(settings: &'a Settings, cluster: &'a C) -> Self {
        Self { settings, cluster }
    }

    /// Applies the ConfigMap manifest at `manifest` into `namespace`. With `force_empty` the data
    /// is cleared afterwards, so fields owned by other managers cannot survive.
    pub async fn apply(&self, manifest: &Path, namespace: &str, force_empty: bool) -> bool {
        info!("Applying ConfigMap from: {}", manifest.display());
        let mut config_map = match read_manifest(manifest) {
            Ok(config_map) => config_map,
            Err(e) => {
                error!("{}", e);
                return false;
            }
        };
        config_map.metadata.namespace = Some(namespace.to_string());
        if let Err(e) = self.cluster.apply_config_map(&config_map).await {
            error!("ConfigMap apply failed: {}", e);
            return false;
        }
        if force_empty {
            info!("Ensuring ConfigMap has empty data...");
            let name = config_map
                .metadata
                .name
                .as_deref()
                .unwrap_or(&self.settings.profiles_config_map);
            if let Err(e) = self.cluster.clear_config_map(namespace, name).await {
                warn!("Unable to empty ConfigMap '{}': {}", name, e);
            }
        }
        self.read_back(namespace).await;
        true
    }

    /// Applies an in-memory profile set as the profiles ConfigMap of `namespace`.
    pub async fn apply_profiles(&self, profiles: &ProfileConfig, namespace: &str) -> bool {
        let mut config_map = profiles.to_config_map(namespace);
        config_map.metadata.name = Some(self.settings.profiles_config_map.clone());
        info!(
            "Applying {} profile(s) to ConfigMap '{}/{}'",
            profiles.len(),
            namespace,
            self.settings.profiles_config_map
        );
        if let Err(e) = self.cluster.apply_config_map(&config_map).await {
            error!("ConfigMap apply failed: {}", e);
            return false;
        }
        self.read_back(namespace).await;
        true
    }

    /// Removes every profile from the profiles ConfigMap. A missing ConfigMap counts as cleared.
    pub async fn clear(&self, namespace: &str) -> bool {
        info!("Clearing ConfigMap '{}/{}'", namespace, self.settings.profiles_config_map);
        let result = self
            .cluster
            .clear_config_map(namespace, &self.settings.profiles_config_map)
            .await;
        let cleared = match result {
            Ok(_) => true,
            Err(e) => {
                error!("Unable to clear ConfigMap: {}", e);
                false
            }
        };
        self.read_back(namespace).await;
        cleared
    }

    /// Removes a single profile from the profiles ConfigMap.
    pub async fn remove_key(&self, namespace: &str, key: &str) -> bool {
        info!(
            "Removing '{}' from ConfigMap '{}/{}'",
            key, namespace, self.settings.profiles_config_map
        );
        let result = self
            .cluster
            .remove_config_map_key(namespace, &self.settings.profiles_config_map, key)
            .await;
        let removed = match result {
            Ok(()) => true,
            Err(e) => {
                error!("Unable to remove '{}': {}", key, e);
                false
            }
        };
        self.read_back(namespace).await;
        removed
    }

    /// Logs the live profiles ConfigMap as YAML.
    pub async fn read_back(&self, namespace: &str) {
        match self.live_yaml(namespace).await {
            Ok(Some(yaml)) => info!("Live ConfigMap:\n{}", yaml.trim_end()),
            Ok(None) => info!(
                "ConfigMap '{}/{}' does not exist",
                namespace, self.settings.profiles_config_map
            ),
            Err(e) => warn!("Unable to read back the ConfigMap: {}", e),
        }
    }

    async fn live_yaml(&self, namespace: &str) -> Result<Option<String>> {
        let config_map: Option<ConfigMap> = self
            .cluster
            .config_map(namespace, &self.settings.profiles_config_map)
            .await?;
        config_map
            .map(|mut config_map| {
                config_map.metadata.managed_fields = None;
                serde_yaml::to_string(&config_map).context(error::SerdeYamlSnafu {
                    action: "serialize ConfigMap",
                })
            })
            .transpose()
    }
}
