//! Docker CLI wrapper
//!
//! Uses the docker CLI rather than the engine API so that ssh contexts,
//! credential helpers and Docker Desktop alternatives all work unchanged.

use crate::{
    BuildConfig, CommandOutput, CommandRunner, CommandSpec, ContainerDetails, ContainerInfo,
    ContainerStatus, DockerChannel, PortInfo, ProviderError, Result, RunConfig,
};
use std::sync::Arc;

const LIST_FORMAT: &str = "{{.ID}}|{{.Names}}|{{.Image}}|{{.State}}|{{.Ports}}";

/// Docker CLI bound to one [`DockerChannel`]
#[derive(Clone)]
pub struct DockerCli {
    runner: Arc<dyn CommandRunner>,
    channel: DockerChannel,
}

impl DockerCli {
    pub fn new(runner: Arc<dyn CommandRunner>, channel: DockerChannel) -> Self {
        Self { runner, channel }
    }

    pub fn channel(&self) -> &DockerChannel {
        &self.channel
    }

    /// Command spec shaped by the active channel
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandSpec::new("docker")
            .args(self.channel.context_args())
            .args(args)
            .envs(&self.channel.env_overrides())
    }

    /// Run and return stdout, failing on non-zero exit
    async fn run_cmd(&self, args: &[&str]) -> Result<String> {
        let spec = self.command(args.iter().copied());
        let output = self.runner.run_checked(&spec).await?;
        Ok(output.stdout)
    }

    /// Check the engine answers on this channel
    pub async fn ping(&self) -> Result<()> {
        self.run_cmd(&["info", "--format", "{{.ServerVersion}}"])
            .await?;
        Ok(())
    }

    /// All containers, running or not
    pub async fn list(&self) -> Result<Vec<ContainerInfo>> {
        let format = format!("--format={}", LIST_FORMAT);
        let output = self.run_cmd(&["ps", "-a", "--no-trunc", &format]).await?;
        Ok(parse_list_output(&output))
    }

    /// Inspect a container by name, `None` when it does not exist
    pub async fn inspect(&self, name: &str) -> Result<Option<ContainerDetails>> {
        let spec = self.command(["container", "inspect", name]);
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            if is_not_found(&output) {
                return Ok(None);
            }
            return output.into_result(&spec).map(|_| None);
        }
        parse_inspect_output(&output.stdout).map(Some)
    }

    pub async fn image_exists(&self, tag: &str) -> Result<bool> {
        let spec = self.command(["image", "inspect", "--format", "{{.Id}}", tag]);
        let output = self.runner.run(&spec).await?;
        Ok(output.success())
    }

    /// Build an image from a context directory visible to the docker client
    pub async fn build(&self, config: &BuildConfig) -> Result<()> {
        let spec = self.command(build_args(config));
        self.runner.run_checked(&spec).await.map_err(into_build_error)?;
        Ok(())
    }

    /// Build an image from a Dockerfile streamed on stdin (no build context)
    pub async fn build_from_stdin(&self, tag: &str, dockerfile: &str) -> Result<()> {
        let spec = self
            .command(["build", "-t", tag, "-"])
            .stdin(dockerfile.as_bytes().to_vec());
        self.runner.run_checked(&spec).await.map_err(into_build_error)?;
        Ok(())
    }

    /// Start a detached container, returning its id
    pub async fn run(&self, config: &RunConfig) -> Result<String> {
        let mut spec = self
            .command(std::iter::once("run".to_string()).chain(config.to_args()))
            .envs(&config.env_passthrough);
        for (_, secret) in &config.env_passthrough {
            spec = spec.redact(secret.clone());
        }

        let output = self.runner.run(&spec).await?;
        if !output.success() && is_name_conflict(&output) {
            return Err(ProviderError::NameConflict(config.name.clone()));
        }
        let output = output.into_result(&spec)?;
        Ok(output.stdout.trim().to_string())
    }

    /// `docker run --rm` a short-lived helper and wait for it
    pub async fn run_once(&self, args: &[String]) -> Result<CommandOutput> {
        let spec = self.command(
            ["run".to_string(), "--rm".to_string()]
                .into_iter()
                .chain(args.iter().cloned()),
        );
        self.runner.run_checked(&spec).await
    }

    /// Stop a container. Returns `false` when it did not exist.
    pub async fn stop(&self, name: &str) -> Result<bool> {
        self.tolerate_missing(["stop", name]).await
    }

    /// Force-remove a container. Returns `false` when it did not exist.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        self.tolerate_missing(["rm", "-f", name]).await
    }

    pub async fn volume_create(&self, name: &str) -> Result<()> {
        self.run_cmd(&["volume", "create", name]).await?;
        Ok(())
    }

    pub async fn volume_exists(&self, name: &str) -> Result<bool> {
        let spec = self.command(["volume", "inspect", name]);
        Ok(self.runner.run(&spec).await?.success())
    }

    /// Remove a volume. Returns `false` when it did not exist.
    pub async fn volume_remove(&self, name: &str) -> Result<bool> {
        self.tolerate_missing(["volume", "rm", "-f", name]).await
    }

    async fn tolerate_missing<const N: usize>(&self, args: [&str; N]) -> Result<bool> {
        let spec = self.command(args);
        let output = self.runner.run(&spec).await?;
        if output.success() {
            return Ok(true);
        }
        if is_not_found(&output) {
            return Ok(false);
        }
        output.into_result(&spec).map(|_| true)
    }

    /// Whether a docker context with this name exists
    pub async fn context_exists(runner: &dyn CommandRunner, name: &str) -> Result<bool> {
        let spec = CommandSpec::new("docker").args(["context", "inspect", name]);
        Ok(runner.run(&spec).await?.success())
    }

    /// Create a docker context pointing at `docker_host`
    pub async fn context_create(
        runner: &dyn CommandRunner,
        name: &str,
        docker_host: &str,
    ) -> Result<()> {
        let spec = CommandSpec::new("docker").args([
            "context".to_string(),
            "create".to_string(),
            name.to_string(),
            "--docker".to_string(),
            format!("host={}", docker_host),
        ]);
        runner.run_checked(&spec).await?;
        Ok(())
    }
}

/// Arguments for `docker build`, shared by client-side and host-side builds
pub fn build_args(config: &BuildConfig) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "-f".to_string(),
        config.dockerfile.clone(),
        "-t".to_string(),
        config.tag.clone(),
    ];
    if config.no_cache {
        args.push("--no-cache".to_string());
    }
    for (key, value) in &config.build_args {
        args.push("--build-arg".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(config.context.clone());
    args
}

fn into_build_error(e: ProviderError) -> ProviderError {
    match e {
        ProviderError::CommandFailed {
            command,
            status,
            output,
        } => ProviderError::CommandFailed {
            command,
            status,
            output: tail_lines(&output, 20),
        },
        other => other,
    }
}

/// Keep the last `n` lines of a long build log
fn tail_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn is_not_found(output: &CommandOutput) -> bool {
    let text = output.combined().to_lowercase();
    text.contains("no such container")
        || text.contains("no such object")
        || text.contains("no such volume")
        || text.contains("not found")
}

fn is_name_conflict(output: &CommandOutput) -> bool {
    let text = output.combined();
    text.contains("is already in use by container") || text.contains("Conflict. The container name")
}

/// Parse the pipe-delimited output of `docker ps` into ContainerInfo items
fn parse_list_output(output: &str) -> Vec<ContainerInfo> {
    let mut containers = Vec::new();
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let parts: Vec<&str> = line.splitn(5, '|').collect();
        if parts.len() < 4 {
            continue;
        }
        containers.push(ContainerInfo {
            id: parts[0].to_string(),
            name: parts[1].trim_start_matches('/').to_string(),
            image: parts[2].to_string(),
            status: ContainerStatus::from(parts[3]),
            ports: parts.get(4).map(|p| parse_ports_column(p)).unwrap_or_default(),
        });
    }
    containers
}

/// Parse the `Ports` column, e.g. `0.0.0.0:8787->8787/tcp, :::8787->8787/tcp`
fn parse_ports_column(column: &str) -> Vec<PortInfo> {
    let mut ports = Vec::new();
    for entry in column.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (host_side, container_side) = match entry.split_once("->") {
            Some((h, c)) => (Some(h), c),
            None => (None, entry),
        };
        let (container_port, protocol) = match container_side.split_once('/') {
            Some((p, proto)) => (p, proto),
            None => (container_side, "tcp"),
        };
        // Ranges like 8000-8010/tcp are not published ports we track
        let Ok(container_port) = container_port.parse::<u16>() else {
            continue;
        };
        let (host_ip, host_port) = match host_side.and_then(|h| h.rsplit_once(':')) {
            Some((ip, port)) => (
                (!ip.is_empty()).then(|| ip.to_string()),
                port.parse::<u16>().ok(),
            ),
            None => (None, None),
        };
        let info = PortInfo {
            container_port,
            host_port,
            protocol: protocol.to_string(),
            host_ip,
        };
        // IPv4 and IPv6 bindings of the same port are reported separately
        if !ports
            .iter()
            .any(|p: &PortInfo| p.host_port == info.host_port && p.container_port == info.container_port)
        {
            ports.push(info);
        }
    }
    ports
}

/// Parse JSON output of `docker container inspect` into ContainerDetails.
/// Accepts either the common array form (`[ {...} ]`) or a single object.
fn parse_inspect_output(output: &str) -> Result<ContainerDetails> {
    let trimmed = output.trim();
    let parsed: serde_json::Value =
        serde_json::from_str(trimmed).map_err(|e| ProviderError::ParseError {
            what: "container inspect output".to_string(),
            detail: e.to_string(),
        })?;

    let info = match &parsed {
        serde_json::Value::Array(items) => items.first().ok_or_else(|| {
            ProviderError::ContainerNotFound("inspect returned no objects".to_string())
        })?,
        serde_json::Value::Object(_) => &parsed,
        _ => {
            return Err(ProviderError::ParseError {
                what: "container inspect output".to_string(),
                detail: "expected an object or array".to_string(),
            });
        }
    };

    let str_at = |v: Option<&serde_json::Value>| {
        v.and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let config = info.get("Config");
    let state = info.get("State");

    let status = state
        .and_then(|s| s.get("Status"))
        .and_then(serde_json::Value::as_str)
        .map(ContainerStatus::from)
        .unwrap_or(ContainerStatus::Unknown);

    let env = config
        .and_then(|c| c.get("Env"))
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let mut ports = Vec::new();
    if let Some(port_map) = info
        .get("NetworkSettings")
        .and_then(|ns| ns.get("Ports"))
        .and_then(serde_json::Value::as_object)
    {
        for (container_port_str, bindings) in port_map {
            let (port, protocol) = container_port_str
                .split_once('/')
                .unwrap_or((container_port_str.as_str(), "tcp"));
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            for binding in bindings.as_array().into_iter().flatten() {
                let host_port = binding
                    .get("HostPort")
                    .and_then(serde_json::Value::as_str)
                    .and_then(|s| s.parse().ok());
                let host_ip = binding
                    .get("HostIp")
                    .and_then(serde_json::Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                ports.push(PortInfo {
                    container_port,
                    host_port,
                    protocol: protocol.to_string(),
                    host_ip,
                });
            }
        }
    }

    Ok(ContainerDetails {
        id: str_at(info.get("Id")),
        name: str_at(info.get("Name")).trim_start_matches('/').to_string(),
        image: str_at(config.and_then(|c| c.get("Image"))),
        status,
        env,
        ports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_output() {
        let output = "abc123|Foo_alice|foo|running|0.0.0.0:8788->8787/tcp, :::8788->8787/tcp\n\
                      def456|Bar_bob|bar|exited|\n";

        let containers = parse_list_output(output);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "Foo_alice");
        assert_eq!(containers[0].status, ContainerStatus::Running);
        assert_eq!(containers[0].ports.len(), 1);
        assert_eq!(containers[0].ports[0].host_port, Some(8788));
        assert_eq!(containers[0].ports[0].container_port, 8787);
        assert_eq!(containers[1].status, ContainerStatus::Exited);
        assert!(containers[1].ports.is_empty());
    }

    #[test]
    fn test_parse_list_skips_malformed_lines() {
        let output = "abc|name|image\n\n def|n2|i2|running|\n";
        let containers = parse_list_output(output);
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].name, "n2");
    }

    #[test]
    fn test_parse_ports_column_unpublished_and_ranges() {
        let ports = parse_ports_column("8787/tcp, 0.0.0.0:9000->9000/udp, 8000-8010/tcp");
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].host_port, None);
        assert_eq!(ports[1].host_port, Some(9000));
        assert_eq!(ports[1].protocol, "udp");
        assert_eq!(ports[1].host_ip.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn test_parse_inspect_output() {
        let json = r#"[{
            "Id": "abc123",
            "Name": "/Foo_alice",
            "Config": {"Image": "foo", "Env": ["PASSWORD=secret", "USERID=1000"]},
            "State": {"Status": "running"},
            "NetworkSettings": {"Ports": {
                "8787/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8788"}, {"HostIp": "::", "HostPort": "8788"}],
                "22/tcp": null
            }}
        }]"#;
        let details = parse_inspect_output(json).unwrap();
        assert_eq!(details.name, "Foo_alice");
        assert_eq!(details.status, ContainerStatus::Running);
        assert_eq!(details.env_value("PASSWORD"), Some("secret"));
        assert_eq!(details.host_port_for(8787), Some(8788));
        assert_eq!(details.host_port_for(22), None);
    }

    #[test]
    fn test_parse_inspect_invalid_json() {
        let err = parse_inspect_output("not json").unwrap_err();
        assert!(matches!(err, ProviderError::ParseError { .. }));
    }

    #[test]
    fn test_parse_inspect_empty_array() {
        let err = parse_inspect_output("[]").unwrap_err();
        assert!(matches!(err, ProviderError::ContainerNotFound(_)));
    }

    #[test]
    fn test_build_args() {
        let config = BuildConfig {
            context: "/srv/repos/Foo".to_string(),
            dockerfile: "/srv/repos/Foo/docker_setup/Dockerfile".to_string(),
            tag: "foo".to_string(),
            no_cache: true,
            ..Default::default()
        };
        assert_eq!(
            build_args(&config),
            vec![
                "build",
                "-f",
                "/srv/repos/Foo/docker_setup/Dockerfile",
                "-t",
                "foo",
                "--no-cache",
                "/srv/repos/Foo"
            ]
        );
    }

    #[test]
    fn test_tail_lines() {
        let text = (1..=30).map(|i| i.to_string()).collect::<Vec<_>>().join("\n");
        let tail = tail_lines(&text, 3);
        assert_eq!(tail, "28\n29\n30");
    }

    #[test]
    fn test_name_conflict_detection() {
        let output = CommandOutput::failed(
            125,
            "docker: Error response from daemon: Conflict. The container name \"/Foo_alice\" is already in use by container \"abc\".",
        );
        assert!(is_name_conflict(&output));
        assert!(!is_not_found(&output));
    }
}
