//! Daemon configuration, loaded from a TOML file.
//!
//! Every field has a sensible default so an empty (or absent) file
//! yields a working single-node setup with the Docker backend enabled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use racetrack_infra::docker::DockerConfig;
use racetrack_infra::kubernetes::KubernetesConfig;
use racetrack_infra::remote::RemoteGatewayConfig;
use racetrack_infra::{HealthTimeouts, InfrastructureTarget, JobType, TargetProvider};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RacetrackConfig {
    /// Port the REST API listens on.
    pub port: u16,
    /// Directory for persistent state.
    pub data_dir: PathBuf,
    /// Target chosen when a manifest names none and several are registered.
    pub default_target: Option<String>,
    /// Registry job images are pushed to.
    pub docker_registry: String,
    pub registry_namespace: String,
    /// Base URL of the image builder service.
    pub image_builder_url: String,
    /// Seconds between reconciliation passes.
    pub reconcile_interval: u64,
    /// Seconds to wait for a freshly provisioned job server to answer `/live`.
    pub alive_timeout: u64,
    /// Seconds to wait for `/ready` after the server is alive.
    pub ready_timeout: u64,

    pub docker: DockerSection,
    pub kubernetes: KubernetesSection,
    #[serde(rename = "remote")]
    pub remote_gateways: Vec<RemoteGatewaySection>,
    #[serde(rename = "job_type")]
    pub job_types: Vec<JobTypeSection>,
}

impl Default for RacetrackConfig {
    fn default() -> Self {
        Self {
            port: 7102,
            data_dir: PathBuf::from("/var/lib/racetrack"),
            default_target: None,
            docker_registry: "localhost:5000".to_string(),
            registry_namespace: "racetrack".to_string(),
            image_builder_url: "http://127.0.0.1:7101".to_string(),
            reconcile_interval: 30,
            alive_timeout: 60,
            ready_timeout: 300,
            docker: DockerSection::default(),
            kubernetes: KubernetesSection::default(),
            remote_gateways: Vec::new(),
            job_types: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerSection {
    pub enabled: bool,
    pub target_name: String,
    /// Docker network joined by job containers.
    pub network: Option<String>,
}

impl Default for DockerSection {
    fn default() -> Self {
        Self {
            enabled: true,
            target_name: "docker".to_string(),
            network: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubernetesSection {
    pub enabled: bool,
    pub target_name: String,
    pub namespace: String,
}

impl Default for KubernetesSection {
    fn default() -> Self {
        Self {
            enabled: false,
            target_name: "kubernetes".to_string(),
            namespace: "racetrack".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteGatewaySection {
    /// Name under which the gateway registers as a target.
    pub name: String,
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobTypeSection {
    pub lang: String,
    pub version: String,
    pub base_image: String,
    pub template_path: Option<String>,
}

impl RacetrackConfig {
    /// Read a config file; a missing file falls back to defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        let config = toml::from_str(&text)?;
        Ok(config)
    }

    pub fn health_timeouts(&self) -> HealthTimeouts {
        HealthTimeouts {
            alive: Duration::from_secs(self.alive_timeout),
            ready: Duration::from_secs(self.ready_timeout),
        }
    }
}

/// Turns the config file's backend sections into registered targets
/// and installed job types.
pub struct ConfiguredBackends {
    targets: Vec<InfrastructureTarget>,
    job_types: Vec<JobType>,
}

impl ConfiguredBackends {
    pub fn from_config(config: &RacetrackConfig) -> Self {
        let timeouts = config.health_timeouts();
        let mut targets = Vec::new();

        if config.docker.enabled {
            targets.push(racetrack_infra::docker::docker_target(DockerConfig {
                target_name: config.docker.target_name.clone(),
                network: config.docker.network.clone(),
                health_timeouts: timeouts,
            }));
        }
        if config.kubernetes.enabled {
            targets.push(racetrack_infra::kubernetes::kubernetes_target(
                KubernetesConfig {
                    target_name: config.kubernetes.target_name.clone(),
                    namespace: config.kubernetes.namespace.clone(),
                    health_timeouts: timeouts,
                },
            ));
        }
        for gateway in &config.remote_gateways {
            targets.push(racetrack_infra::remote::remote_target(RemoteGatewayConfig {
                target_name: gateway.name.clone(),
                gateway_url: gateway.url.clone(),
                gateway_token: gateway.token.clone(),
                health_timeouts: timeouts,
            }));
        }

        let job_types = config
            .job_types
            .iter()
            .map(|jt| JobType {
                lang_name: jt.lang.clone(),
                version: jt.version.clone(),
                base_image: jt.base_image.clone(),
                template_path: jt.template_path.clone(),
            })
            .collect();

        Self { targets, job_types }
    }

    pub fn into_provider(self) -> Arc<dyn TargetProvider> {
        Arc::new(self)
    }
}

impl TargetProvider for ConfiguredBackends {
    fn infrastructure_targets(&self) -> Vec<InfrastructureTarget> {
        self.targets.clone()
    }

    fn job_types(&self) -> Vec<JobType> {
        self.job_types.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config: RacetrackConfig = toml::from_str("").unwrap();
        assert_eq!(config.port, 7102);
        assert!(config.docker.enabled);
        assert!(!config.kubernetes.enabled);
        assert!(config.remote_gateways.is_empty());
    }

    #[test]
    fn full_file_parses() {
        let text = r#"
            port = 7000
            default_target = "kubernetes"
            docker_registry = "registry.example.com"
            reconcile_interval = 10

            [docker]
            enabled = false

            [kubernetes]
            enabled = true
            namespace = "jobs"

            [[remote]]
            name = "edge-1"
            url = "http://edge-1.example.com:7105"
            token = "s3cret"

            [[job_type]]
            lang = "python3"
            version = "3.11.4"
            base_image = "ghcr.io/racetrack/python3:3.11.4"
        "#;
        let config: RacetrackConfig = toml::from_str(text).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.default_target.as_deref(), Some("kubernetes"));
        assert_eq!(config.kubernetes.namespace, "jobs");
        assert_eq!(config.remote_gateways[0].name, "edge-1");
        assert_eq!(config.job_types[0].lang, "python3");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<RacetrackConfig>("prot = 7000").is_err());
    }

    #[test]
    fn backends_follow_the_sections() {
        let text = r#"
            [kubernetes]
            enabled = true

            [[remote]]
            name = "edge-1"
            url = "http://edge-1:7105"
            token = "t"
        "#;
        let config: RacetrackConfig = toml::from_str(text).unwrap();
        let backends = ConfiguredBackends::from_config(&config);
        let names: Vec<String> = backends
            .infrastructure_targets()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(names, vec!["docker", "kubernetes", "edge-1"]);
    }
}
