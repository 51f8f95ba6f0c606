//! Management commands: status, repos, config

use anyhow::Result;
use devlaunch_config::GlobalConfig;
use devlaunch_core::StatusReport;
use devlaunch_provider::ContainerInfo;
use std::path::Path;

use super::{connect, describe, SessionArgs, Settings};

/// Show the engine's containers and this session's state
pub async fn status(
    settings: &Settings,
    args: &SessionArgs,
    repo: Option<String>,
    json: bool,
) -> Result<()> {
    let mut workflow = connect(settings, args).await?;
    if let Some(repo) = repo.or_else(|| settings.config.defaults.repo.clone()) {
        workflow.select_repo(&repo)?;
    }
    let report = workflow.refresh_status().await?;
    let own = workflow.state().container_name().ok();

    if json {
        println!("{}", serde_json::to_string_pretty(&status_json(&report, own.as_deref()))?);
        return Ok(());
    }

    println!("Engine: {}", describe(&workflow.state().location));
    if report.containers.is_empty() {
        println!("No containers found.");
    } else {
        // Column widths
        const NAME_WIDTH: usize = 30;
        const STATUS_WIDTH: usize = 12;

        println!("  {:<NAME_WIDTH$} {:<STATUS_WIDTH$} PORTS", "NAME", "STATUS");
        println!("{}", "-".repeat(60));
        for container in &report.containers {
            let marker = if Some(&container.name) == own.as_ref() {
                "*"
            } else if report.user_containers.iter().any(|c| c.name == container.name) {
                "+"
            } else {
                " "
            };
            println!(
                "{} {:<NAME_WIDTH$} {:<STATUS_WIDTH$} {}",
                marker,
                container.name,
                container.status.to_string(),
                ports(container)
            );
        }
    }

    if !report.used_ports.is_empty() {
        let used: Vec<String> = report.used_ports.iter().map(u16::to_string).collect();
        println!("\nPorts in use: {}", used.join(", "));
    }

    if let Some(name) = own {
        if report.running {
            let port = report
                .recovered
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            println!("\n'{}' is running on port {}", name, port);
        } else {
            println!("\n'{}' is not running", name);
        }
    }

    Ok(())
}

fn ports(container: &ContainerInfo) -> String {
    container
        .ports
        .iter()
        .filter_map(|p| p.host_port.map(|h| format!("{}->{}", h, p.container_port)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn status_json(report: &StatusReport, own: Option<&str>) -> serde_json::Value {
    serde_json::json!({
        "containers": report.containers,
        "usedPorts": report.used_ports,
        "userContainers": report.user_containers.iter().map(|c| &c.name).collect::<Vec<_>>(),
        "session": own.map(|name| serde_json::json!({
            "container": name,
            "running": report.running,
            "port": report.recovered.port,
        })),
        "warnings": report.warnings,
    })
}

/// List repositories on the engine's host
pub async fn repos(settings: &Settings, args: &SessionArgs) -> Result<()> {
    let workflow = connect(settings, args).await?;
    let state = workflow.state();
    let base = state
        .paths
        .remote_repo_base
        .clone()
        .unwrap_or_else(|| state.paths.local_repo_base.to_string_lossy().to_string());

    if state.repositories.is_empty() {
        println!("No repositories found in {}", base);
        return Ok(());
    }
    println!("Repositories in {}:", base);
    for repo in &state.repositories {
        println!("  {}", repo);
    }
    Ok(())
}

/// Show the effective configuration
pub fn config(config: &GlobalConfig, path: Option<&Path>) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => GlobalConfig::config_path()?,
    };
    if path.exists() {
        println!("# Config file: {:?}\n", path);
    } else {
        println!("# Config file: {:?} (not created yet, showing defaults)\n", path);
    }
    println!("{}", config.to_toml()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devlaunch_provider::{ContainerStatus, PortInfo};

    fn container(name: &str, status: ContainerStatus, port: Option<u16>) -> ContainerInfo {
        ContainerInfo {
            id: "x".into(),
            name: name.into(),
            image: "foo".into(),
            status,
            ports: vec![PortInfo {
                container_port: 8787,
                host_port: port,
                protocol: "tcp".into(),
                host_ip: None,
            }],
        }
    }

    #[test]
    fn test_ports_column() {
        let c = container("Foo_alice", ContainerStatus::Running, Some(8788));
        assert_eq!(ports(&c), "8788->8787");
        let c = container("Foo_alice", ContainerStatus::Exited, None);
        assert_eq!(ports(&c), "");
    }

    #[test]
    fn test_status_json_shape() {
        let running = container("Foo_alice", ContainerStatus::Running, Some(8788));
        let mut report = StatusReport {
            containers: vec![running.clone()],
            running: true,
            own: Some(running),
            ..Default::default()
        };
        report.used_ports.insert(8788);
        report.recovered.port = Some(8788);

        let value = status_json(&report, Some("Foo_alice"));
        assert_eq!(value["usedPorts"][0], 8788);
        assert_eq!(value["session"]["container"], "Foo_alice");
        assert_eq!(value["session"]["running"], true);
        assert_eq!(value["containers"][0]["status"], "running");

        let value = status_json(&StatusReport::default(), None);
        assert!(value["session"].is_null());
    }
}
