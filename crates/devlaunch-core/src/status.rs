//! Container status and session recovery
//!
//! Reads only: lists the engine's containers, decides whether this
//! session's container is running and, if so, recovers its password, port
//! and volume flag. The session record wins over what the container itself
//! declares; inspection only fills the gaps.

use crate::metadata::MetadataStore;
use crate::state::{RecoveredSecrets, RecoverySource, SessionState};
use crate::{CoreError, Result};
use devlaunch_config::GlobalConfig;
use devlaunch_provider::{ContainerInfo, DockerCli};
use std::collections::BTreeSet;

/// What the engine currently looks like from this session's point of view
#[derive(Debug, Clone, Default)]
pub struct StatusReport {
    pub containers: Vec<ContainerInfo>,
    /// Host ports published by running containers
    pub used_ports: BTreeSet<u16>,
    /// This user's other containers
    pub user_containers: Vec<ContainerInfo>,
    /// This session's container
    pub own: Option<ContainerInfo>,
    pub running: bool,
    pub recovered: RecoveredSecrets,
    pub warnings: Vec<String>,
}

pub struct StatusService<'a> {
    config: &'a GlobalConfig,
    docker: &'a DockerCli,
    store: &'a MetadataStore,
}

impl<'a> StatusService<'a> {
    pub fn new(config: &'a GlobalConfig, docker: &'a DockerCli, store: &'a MetadataStore) -> Self {
        Self {
            config,
            docker,
            store,
        }
    }

    /// Build a [`StatusReport`] for `state`
    pub async fn reconcile(&self, state: &SessionState) -> Result<StatusReport> {
        let containers = self
            .docker
            .list()
            .await
            .map_err(|e| CoreError::docker("listing containers", e))?;

        let used_ports: BTreeSet<u16> = containers
            .iter()
            .filter(|c| c.is_running())
            .flat_map(|c| c.host_ports())
            .collect();

        let own_name = state.container_name().ok();
        let user_containers: Vec<ContainerInfo> = containers
            .iter()
            .filter(|c| Some(&c.name) != own_name.as_ref())
            .filter(|c| belongs_to(&c.name, &state.identity.username, &state.repositories))
            .cloned()
            .collect();

        let own = own_name
            .as_ref()
            .and_then(|name| containers.iter().find(|c| &c.name == name))
            .cloned();
        let running = own.as_ref().is_some_and(ContainerInfo::is_running);

        let mut report = StatusReport {
            containers,
            used_ports,
            user_containers,
            own,
            running,
            ..Default::default()
        };

        if let (true, Some(name)) = (running, own_name.as_deref()) {
            tracing::info!("Container {} is already running, recovering session", name);
            report.recovered = self.recover(name, &mut report.warnings).await;
            if report.recovered.source == RecoverySource::Unrecovered {
                report.warnings.push(format!(
                    "{} is running but its password and port could not be recovered",
                    name
                ));
            }
        }

        for warning in &report.warnings {
            tracing::warn!("{}", warning);
        }
        Ok(report)
    }

    /// Recover session facts for a running container
    ///
    /// Never fails: every gap is left as `None` and noted in `warnings`.
    pub async fn recover(&self, container: &str, warnings: &mut Vec<String>) -> RecoveredSecrets {
        let mut recovered = RecoveredSecrets::default();

        match self.store.read(container).await {
            Ok(Some(record)) => {
                tracing::debug!("Recovered {} from its session record", container);
                recovered.password = Some(record.password.clone()).filter(|p| !p.is_empty());
                recovered.port = record.port_number();
                recovered.use_volumes = Some(record.use_volumes);
                recovered.started_at = Some(record.timestamp);
                recovered.source = RecoverySource::MetadataRecord;
            }
            Ok(None) => {
                tracing::debug!("No session record for {}", container);
            }
            Err(e) => {
                warnings.push(format!("could not read session record for {}: {}", container, e));
            }
        }

        if recovered.password.is_some() && recovered.port.is_some() {
            return recovered;
        }

        match self.docker.inspect(container).await {
            Ok(Some(details)) => {
                let mut filled = false;
                if recovered.password.is_none() {
                    recovered.password = details
                        .env_value(&self.config.docker.password_env)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string);
                    filled |= recovered.password.is_some();
                }
                if recovered.port.is_none() {
                    recovered.port = details.host_port_for(self.config.docker.container_port);
                    filled |= recovered.port.is_some();
                }
                if recovered.source == RecoverySource::Unrecovered && filled {
                    recovered.source = RecoverySource::ContainerInspection;
                }
            }
            Ok(None) => {
                warnings.push(format!("{} disappeared while being inspected", container));
            }
            Err(e) => {
                warnings.push(format!("could not inspect {}: {}", container, e));
            }
        }

        recovered
    }
}

/// Whether `name` is `<repo>_<user>` for one of `repositories`
///
/// Without a repository list only the `_<user>` suffix is checked, which
/// also matches users whose names end in `_<user>`.
fn belongs_to(name: &str, user: &str, repositories: &[String]) -> bool {
    let Some(repo) = name
        .strip_suffix(user)
        .and_then(|rest| rest.strip_suffix('_'))
        .filter(|repo| !repo.is_empty())
    else {
        return false;
    };
    repositories.is_empty() || repositories.iter().any(|r| r == repo)
}
