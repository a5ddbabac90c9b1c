use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use clap::Parser;
use directories::ProjectDirs;
use fedkube::config::{KubeConfiguration, KubeConfigurationExternal};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use kube::api::GroupVersionKind;
use serde::{Deserialize, Serialize};

/// Default file name of config.
const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_METRICS_PORT: u16 = 9090;

#[derive(Clone, Default, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub kubernetes: KubeConfiguration,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub clusters: Vec<MemberClusterConfig>,
    #[serde(default)]
    pub types: Vec<FederatedTypeConfig>,
}

#[derive(Parser, Serialize, Debug)]
#[command(
    name = "fed-controller",
    about = "Federation version tracking and status controller",
    long_about = None,
    version
)]
struct Cli {
    /// Path to "config.yaml" file for further configuration.
    #[arg(short = 'c', long, value_name = "PATH")]
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<PathBuf>,

    /// Set log verbosity.
    ///
    /// Possible log levels are: ERROR, WARN, INFO, DEBUG, TRACE.
    ///
    /// If you want to adjust the scope for deeper inspection use a filter value, for example
    /// "=TRACE" for logging _everything_ or "fedcontroller=DEBUG" etc.
    #[arg(short = 'l', long, value_name = "LEVEL")]
    #[serde(skip_serializing_if = "Option::is_none")]
    log_level: Option<String>,
}

/// Get configuration from 1. .yaml file, 2. environment variables and 3. command line arguments
/// (in that order, meaning that later configuration sources take precedence over the earlier
/// ones).
pub fn load_config() -> Result<Config> {
    let cli = Cli::parse();

    let config_file_path: Option<PathBuf> = match &cli.config {
        Some(path) => {
            if !path.exists() {
                bail!("config file '{}' does not exist", path.display());
            }
            Some(path.clone())
        }
        None => try_determine_config_file_path()?,
    };

    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if let Some(path) = &config_file_path {
        figment = figment.merge(Yaml::file(path));
    }

    let config: Config = figment
        .merge(Env::raw().only(&["log_level"]))
        .merge(Serialized::defaults(cli))
        .extract()?;

    Ok(config)
}

fn try_determine_config_file_path() -> Result<Option<PathBuf>> {
    let mut current_dir = std::env::current_dir()?;
    current_dir.push(CONFIG_FILE_NAME);

    let mut xdg_config_dir: PathBuf = ProjectDirs::from("", "", "fed-controller")
        .ok_or_else(|| anyhow!("could not determine valid config directory path"))?
        .config_dir()
        .to_path_buf();
    xdg_config_dir.push(CONFIG_FILE_NAME);

    Ok([current_dir, xdg_config_dir]
        .iter()
        .find(|path| path.exists())
        .cloned())
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Namespace to watch federated resources in, all namespaces when unset.
    pub target_namespace: Option<String>,
    pub cluster_available_delay_seconds: u64,
    pub cluster_unavailable_delay_seconds: u64,
    pub cluster_health_check_period_seconds: u64,
    pub cache_sync_timeout_seconds: u64,
    pub max_concurrent_status_reconciles: usize,
    /// Shortens every delay, for tests.
    pub minimize_latency: bool,
    /// Prometheus scrape endpoint, disabled when unset.
    pub metrics_address: Option<SocketAddr>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            target_namespace: None,
            cluster_available_delay_seconds: 20,
            cluster_unavailable_delay_seconds: 60,
            cluster_health_check_period_seconds: 10,
            cache_sync_timeout_seconds: 300,
            max_concurrent_status_reconciles: 1,
            minimize_latency: false,
            metrics_address: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_METRICS_PORT))),
        }
    }
}

impl ControllerConfig {
    pub fn cluster_available_delay(&self) -> Duration {
        if self.minimize_latency {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.cluster_available_delay_seconds)
        }
    }

    pub fn cluster_unavailable_delay(&self) -> Duration {
        if self.minimize_latency {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(self.cluster_unavailable_delay_seconds)
        }
    }

    /// Spread applied when every federated resource is enqueued at once.
    pub fn small_delay(&self) -> Duration {
        if self.minimize_latency {
            Duration::from_millis(20)
        } else {
            Duration::from_secs(3)
        }
    }

    pub fn cluster_health_check_period(&self) -> Duration {
        Duration::from_secs(self.cluster_health_check_period_seconds.max(1))
    }

    pub fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_seconds)
    }
}

/// A member cluster joined to the federation.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct MemberClusterConfig {
    pub name: String,
    pub kube_context: Option<String>,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
}

impl MemberClusterConfig {
    pub fn kube_configuration(&self) -> KubeConfiguration {
        KubeConfiguration::External(KubeConfigurationExternal {
            kube_context: Some(
                self.kube_context
                    .to_owned()
                    .unwrap_or_else(|| self.name.to_owned()),
            ),
            kubeconfig: self.kubeconfig.to_owned(),
        })
    }
}

#[derive(Clone, Default, Debug, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct ResourceConfig {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceConfig {
    pub fn get_gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

/// Ties a federated type to the target type it propagates and the optional
/// type its aggregated status is written to.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Hash)]
pub struct FederatedTypeConfig {
    #[serde(default = "default_namespaced")]
    pub namespaced: bool,
    pub federated: ResourceConfig,
    pub target: ResourceConfig,
    #[serde(default)]
    pub status: Option<ResourceConfig>,
}

fn default_namespaced() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use figment::Figment;
    use figment::providers::{Env, Format, Serialized, Yaml};
    use fedkube::config::{KubeConfiguration, KubeConfigurationExternal};

    use crate::config::configuration::{
        Config, ControllerConfig, FederatedTypeConfig, MemberClusterConfig, ResourceConfig,
    };

    #[test]
    fn parse_minimal_config() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
                kubernetes: incluster
            "#,
            )?;
            let config: Config = Figment::from(Serialized::defaults(Config::default()))
                .merge(Yaml::file("config.yaml"))
                .extract()
                .unwrap();

            assert_eq!(
                config,
                Config {
                    log_level: None,
                    kubernetes: KubeConfiguration::InCluster,
                    controller: ControllerConfig::default(),
                    clusters: vec![],
                    types: vec![],
                }
            );
            Ok(())
        })
    }

    #[test]
    fn parse_yaml_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "config.yaml",
                r#"
log_level: "fedcontroller=DEBUG"
kubernetes:
    external:
        kube_context: "host"
controller:
    target_namespace: apps
    cluster_available_delay_seconds: 5
    max_concurrent_status_reconciles: 4
    metrics_address: "127.0.0.1:9100"
clusters:
    - name: cluster1
      kube_context: kind-cluster1
    - name: cluster2
types:
    - federated:
        group: types.kubefed.io
        version: v1beta1
        kind: FederatedDeployment
      target:
        group: apps
        version: v1
        kind: Deployment
      status:
        group: types.kubefed.io
        version: v1beta1
        kind: FederatedDeploymentStatus
    - namespaced: false
      federated:
        group: types.kubefed.io
        version: v1beta1
        kind: FederatedClusterRole
      target:
        group: rbac.authorization.k8s.io
        version: v1
        kind: ClusterRole
"#,
            )?;

            let config: Config = Figment::from(Serialized::defaults(Config::default()))
                .merge(Yaml::file("config.yaml"))
                .extract()
                .unwrap();

            assert_eq!(config.log_level.as_deref(), Some("fedcontroller=DEBUG"));
            assert_eq!(
                config.kubernetes,
                KubeConfiguration::External(KubeConfigurationExternal {
                    kube_context: Some("host".into()),
                    kubeconfig: None,
                })
            );
            assert_eq!(
                config.controller,
                ControllerConfig {
                    target_namespace: Some("apps".into()),
                    cluster_available_delay_seconds: 5,
                    max_concurrent_status_reconciles: 4,
                    metrics_address: Some("127.0.0.1:9100".parse().unwrap()),
                    ..ControllerConfig::default()
                }
            );
            assert_eq!(
                config.clusters[0],
                MemberClusterConfig {
                    name: "cluster1".into(),
                    kube_context: Some("kind-cluster1".into()),
                    kubeconfig: None,
                }
            );
            assert_eq!(
                config.clusters[1].kube_configuration(),
                KubeConfiguration::for_context("cluster2")
            );
            assert_eq!(
                config.types[0],
                FederatedTypeConfig {
                    namespaced: true,
                    federated: ResourceConfig {
                        group: "types.kubefed.io".into(),
                        version: "v1beta1".into(),
                        kind: "FederatedDeployment".into(),
                    },
                    target: ResourceConfig {
                        group: "apps".into(),
                        version: "v1".into(),
                        kind: "Deployment".into(),
                    },
                    status: Some(ResourceConfig {
                        group: "types.kubefed.io".into(),
                        version: "v1beta1".into(),
                        kind: "FederatedDeploymentStatus".into(),
                    }),
                }
            );
            assert!(!config.types[1].namespaced);
            assert_eq!(config.types[1].status, None);
            Ok(())
        })
    }

    #[test]
    fn environment_overrides_log_level() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("config.yaml", "log_level: INFO\nkubernetes: incluster\n")?;
            jail.set_env("log_level", "=TRACE");

            let config: Config = Figment::from(Serialized::defaults(Config::default()))
                .merge(Yaml::file("config.yaml"))
                .merge(Env::raw().only(&["log_level"]))
                .extract()
                .unwrap();

            assert_eq!(config.log_level.as_deref(), Some("=TRACE"));
            Ok(())
        })
    }

    #[test]
    fn metrics_endpoint_listens_on_all_interfaces_by_default() {
        assert_eq!(
            ControllerConfig::default().metrics_address,
            Some("0.0.0.0:9090".parse().unwrap())
        );
    }

    #[test]
    fn minimize_latency_shortens_delays() {
        let config = ControllerConfig {
            minimize_latency: true,
            ..ControllerConfig::default()
        };
        assert_eq!(config.cluster_available_delay(), Duration::from_secs(1));
        assert_eq!(config.cluster_unavailable_delay(), Duration::from_secs(1));
        assert_eq!(config.small_delay(), Duration::from_millis(20));

        let config = ControllerConfig::default();
        assert_eq!(config.cluster_available_delay(), Duration::from_secs(20));
        assert_eq!(config.cluster_unavailable_delay(), Duration::from_secs(60));
        assert_eq!(config.small_delay(), Duration::from_secs(3));
    }
}
