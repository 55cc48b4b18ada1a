//! Docker Engine API driver
//!
//! Talks to a Docker-compatible engine over its HTTP API. Only TCP
//! endpoints are supported (`tcp://host:port` or `http(s)://host:port`).

use super::{container_name, ExecOutput, IdRegistry, IdStatus, InspectInfo, RuntimeDriver};
use crate::config::OrchestratorConfig;
use crate::error::{BerthError, Result};
use crate::service::ServiceSpec;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

/// Label carrying the session a container belongs to
pub const SESSION_LABEL: &str = "org.berth.session";

/// Label carrying the service name of a container
pub const SERVICE_LABEL: &str = "org.berth.service";

#[derive(Debug, Clone, Default, Serialize)]
struct EmptyObject {}

/// Container create request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreateRequest {
    image: String,
    env: Vec<String>,
    exposed_ports: HashMap<String, EmptyObject>,
    labels: HashMap<String, String>,
    host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    port_bindings: HashMap<String, Vec<PortBinding>>,
    binds: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: String,
    #[serde(default)]
    host_port: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreateResponse {
    id: String,
    #[serde(default)]
    warnings: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    #[serde(default)]
    name: String,
    state: ContainerState,
    #[serde(default)]
    network_settings: NetworkSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateRequest {
    attach_stdout: bool,
    attach_stderr: bool,
    cmd: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecCreateResponse {
    id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ExecStartRequest {
    detach: bool,
    tty: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    #[serde(default)]
    exit_code: Option<i64>,
    #[serde(default)]
    running: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ErrorResponse {
    message: String,
}

/// Driver for the Docker Engine HTTP API
pub struct DockerDriver {
    base_url: String,
    client: reqwest::Client,
    registry: IdRegistry,
    session_label: String,
    pull_missing_images: bool,
    pull_timeout: Duration,
}

impl DockerDriver {
    /// Create a driver from the orchestrator configuration
    pub fn new(config: &OrchestratorConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BerthError::InvalidConfig(e.to_string()))?;

        Ok(Self {
            base_url: config.engine_url.trim_end_matches('/').to_string(),
            client,
            registry: IdRegistry::new(),
            session_label: config.session_label.clone(),
            pull_missing_images: config.pull_missing_images,
            pull_timeout: config.startup_timeout(),
        })
    }

    /// Engine base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn create_request(&self, spec: &ServiceSpec) -> ContainerCreateRequest {
        build_create_request(spec, &self.session_label)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_image_reference(image);
        info!("Pulling image {}", image);

        let mut request = self.client
            .post(self.url("/images/create"))
            .query(&[("fromImage", from_image.as_str())])
            .timeout(self.pull_timeout);
        if let Some(ref tag) = tag {
            request = request.query(&[("tag", tag.as_str())]);
        }

        let response = request.send().await.map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(BerthError::Engine(format!(
                "Failed to pull image {}: {}",
                image,
                error_message(response).await
            )));
        }

        // The engine streams progress; the pull is done once the body ends.
        response.bytes().await.map_err(transport_error)?;
        Ok(())
    }

    async fn try_create(&self, spec: &ServiceSpec, name: &str) -> Result<Option<String>> {
        let body = self.create_request(spec);
        let response = self.client
            .post(self.url("/containers/create"))
            .query(&[("name", name)])
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let created: ContainerCreateResponse = response.json()
                    .await
                    .map_err(transport_error)?;
                for warning in created.warnings.unwrap_or_default() {
                    tracing::warn!("Engine warning for {}: {}", spec.name(), warning);
                }
                Ok(Some(created.id))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => Err(BerthError::Engine(format!(
                "Failed to create {} ({}): {}",
                spec.name(),
                status,
                error_message(response).await
            ))),
        }
    }

    async fn read_exec_output(&self, exec_id: &str) -> Result<String> {
        let response = self.client
            .post(self.url(&format!("/exec/{}/start", exec_id)))
            .json(&ExecStartRequest { detach: false, tty: false })
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(BerthError::Engine(format!(
                "Failed to start exec {}: {}",
                exec_id,
                error_message(response).await
            )));
        }

        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(demux_log_stream(&bytes))
    }
}

#[async_trait]
impl RuntimeDriver for DockerDriver {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create(&self, spec: &ServiceSpec) -> Result<String> {
        let name = container_name(spec.name());

        let id = match self.try_create(spec, &name).await? {
            Some(id) => id,
            None if self.pull_missing_images => {
                self.pull_image(spec.image()).await?;
                self.try_create(spec, &name).await?.ok_or_else(|| {
                    BerthError::Engine(format!("Image {} not found after pull", spec.image()))
                })?
            }
            None => {
                return Err(BerthError::Engine(format!(
                    "Image {} not found and pulling is disabled",
                    spec.image()
                )))
            }
        };

        self.registry.register(&id)?;
        debug!("Created container {} ({}) for {}", name, id, spec.name());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.registry.require_live(id)?;

        let response = self.client
            .post(self.url(&format!("/containers/{}/start", id)))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED => Ok(()),
            StatusCode::NOT_FOUND => Err(BerthError::InstanceNotFound(id.to_string())),
            status => Err(BerthError::Engine(format!(
                "Failed to start {} ({}): {}",
                id,
                status,
                error_message(response).await
            ))),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        if self.registry.status(id)? == IdStatus::Removed {
            return Ok(());
        }

        let response = self.client
            .post(self.url(&format!("/containers/{}/stop", id)))
            .query(&[("t", "10")])
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_MODIFIED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(BerthError::Engine(format!(
                "Failed to stop {} ({}): {}",
                id,
                status,
                error_message(response).await
            ))),
        }
    }

    async fn remove(&self, id: &str) -> Result<()> {
        if self.registry.status(id)? == IdStatus::Removed {
            return Ok(());
        }

        let response = self.client
            .delete(self.url(&format!("/containers/{}", id)))
            .query(&[("force", "true"), ("v", "true")])
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => {
                self.registry.forget(id)?;
                Ok(())
            }
            status => Err(BerthError::Engine(format!(
                "Failed to remove {} ({}): {}",
                id,
                status,
                error_message(response).await
            ))),
        }
    }

    async fn inspect(&self, id: &str) -> Result<InspectInfo> {
        self.registry.require_live(id)?;

        let response = self.client
            .get(self.url(&format!("/containers/{}/json", id)))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let inspect: ContainerInspect = response.json().await.map_err(transport_error)?;
                Ok(inspect_info(inspect))
            }
            StatusCode::NOT_FOUND => Err(BerthError::InstanceNotFound(id.to_string())),
            status => Err(BerthError::Engine(format!(
                "Failed to inspect {} ({}): {}",
                id,
                status,
                error_message(response).await
            ))),
        }
    }

    async fn logs(&self, id: &str) -> Result<String> {
        self.registry.require_live(id)?;

        let response = self.client
            .get(self.url(&format!("/containers/{}/logs", id)))
            .query(&[("stdout", "true"), ("stderr", "true")])
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::OK => {
                let bytes = response.bytes().await.map_err(transport_error)?;
                Ok(demux_log_stream(&bytes))
            }
            StatusCode::NOT_FOUND => Err(BerthError::InstanceNotFound(id.to_string())),
            status => Err(BerthError::Engine(format!(
                "Failed to read logs of {} ({}): {}",
                id,
                status,
                error_message(response).await
            ))),
        }
    }

    async fn exec(&self, id: &str, command: &[String]) -> Result<ExecOutput> {
        self.registry.require_live(id)?;

        let response = self.client
            .post(self.url(&format!("/containers/{}/exec", id)))
            .json(&ExecCreateRequest {
                attach_stdout: true,
                attach_stderr: true,
                cmd: command.to_vec(),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let exec_id = match response.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let created: ExecCreateResponse = response.json().await.map_err(transport_error)?;
                created.id
            }
            StatusCode::NOT_FOUND => return Err(BerthError::InstanceNotFound(id.to_string())),
            status => {
                return Err(BerthError::Engine(format!(
                    "Failed to create exec in {} ({}): {}",
                    id,
                    status,
                    error_message(response).await
                )))
            }
        };

        let output = self.read_exec_output(&exec_id).await?;

        let response = self.client
            .get(self.url(&format!("/exec/{}/json", exec_id)))
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(BerthError::Engine(format!(
                "Failed to inspect exec {}: {}",
                exec_id,
                error_message(response).await
            )));
        }

        let inspect: ExecInspect = response.json().await.map_err(transport_error)?;
        let exit_code = match (inspect.running, inspect.exit_code) {
            (false, Some(code)) => code,
            _ => -1,
        };

        Ok(ExecOutput { exit_code, output })
    }

    async fn ping(&self) -> Result<()> {
        let response = self.client
            .get(self.url("/_ping"))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(BerthError::EngineUnavailable(format!(
                "Engine ping failed: {}",
                response.status()
            )))
        }
    }
}

fn transport_error(err: reqwest::Error) -> BerthError {
    if err.is_connect() || err.is_timeout() {
        BerthError::EngineUnavailable(err.to_string())
    } else {
        BerthError::Engine(err.to_string())
    }
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(err) => err.message,
        Err(_) if text.is_empty() => status.to_string(),
        Err(_) => text,
    }
}

fn port_key(port: u16) -> String {
    format!("{}/tcp", port)
}

fn build_create_request(spec: &ServiceSpec, session_label: &str) -> ContainerCreateRequest {
    let env = spec.env()
        .iter()
        .map(|(key, value)| format!("{}={}", key, value))
        .collect();

    let mut exposed_ports = HashMap::new();
    let mut port_bindings = HashMap::new();
    for port in spec.exposed_ports() {
        exposed_ports.insert(port_key(*port), EmptyObject {});
        // An empty host port asks the engine for a random free one
        port_bindings.insert(port_key(*port), vec![PortBinding::default()]);
    }

    let binds = spec.files()
        .iter()
        .map(|b| format!("{}:{}:{}", b.source.display(), b.target, b.mode))
        .collect();

    let labels = HashMap::from([
        (SESSION_LABEL.to_string(), session_label.to_string()),
        (SERVICE_LABEL.to_string(), spec.name().to_string()),
    ]);

    ContainerCreateRequest {
        image: spec.image().to_string(),
        env,
        exposed_ports,
        labels,
        host_config: HostConfig { port_bindings, binds },
    }
}

fn inspect_info(inspect: ContainerInspect) -> InspectInfo {
    let mut ports = HashMap::new();

    if inspect.state.running {
        for (key, bindings) in inspect.network_settings.ports.unwrap_or_default() {
            let Some((port, proto)) = key.split_once('/') else {
                continue;
            };
            if proto != "tcp" {
                continue;
            }
            let Ok(container_port) = port.parse::<u16>() else {
                continue;
            };
            let bindings = bindings.unwrap_or_default();
            // Prefer the IPv4 binding when the engine publishes both families
            let binding = bindings.iter()
                .find(|b| !b.host_ip.contains(':'))
                .or_else(|| bindings.first());
            if let Some(host_port) = binding.and_then(|b| b.host_port.parse::<u16>().ok()) {
                ports.insert(container_port, host_port);
            }
        }
    }

    let name = inspect.name.trim_start_matches('/').to_string();

    InspectInfo {
        running: inspect.state.running,
        ports,
        name: if name.is_empty() { None } else { Some(name) },
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters
pub fn split_image_reference(image: &str) -> (String, Option<String>) {
    if image.contains('@') {
        return (image.to_string(), None);
    }
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), Some(tag.to_string())),
        _ => (image.to_string(), Some("latest".to_string())),
    }
}

/// Decode the engine's multiplexed stdout/stderr stream
///
/// Each frame is an 8-byte header `[stream, 0, 0, 0, size_be_u32]` followed
/// by `size` bytes. Streams from TTY containers carry no headers and are
/// returned as-is.
pub fn demux_log_stream(bytes: &[u8]) -> String {
    let mut output = Vec::with_capacity(bytes.len());
    let mut offset = 0;

    while offset < bytes.len() {
        let header = &bytes[offset..];
        let framed = header.len() >= 8
            && header[0] <= 2
            && header[1] == 0
            && header[2] == 0
            && header[3] == 0;
        if !framed {
            return String::from_utf8_lossy(bytes).into_owned();
        }

        let size = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let start = offset + 8;
        let end = start + size;
        if end > bytes.len() {
            return String::from_utf8_lossy(bytes).into_owned();
        }

        output.extend_from_slice(&bytes[start..end]);
        offset = end;
    }

    String::from_utf8_lossy(&output).into_owned()
}

/// Translate a `DOCKER_HOST` value into an HTTP base URL
pub fn engine_url_from_docker_host(value: &str) -> Result<String> {
    if let Some(rest) = value.strip_prefix("tcp://") {
        return Ok(format!("http://{}", rest.trim_end_matches('/')));
    }
    if value.starts_with("http://") || value.starts_with("https://") {
        return Ok(value.trim_end_matches('/').to_string());
    }
    Err(BerthError::InvalidConfig(format!(
        "unsupported engine endpoint {:?}: expose the engine on TCP",
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::BindMode;
    use tempfile::tempdir;

    fn frame(stream: u8, payload: &str) -> Vec<u8> {
        let mut bytes = vec![stream, 0, 0, 0];
        bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        bytes.extend_from_slice(payload.as_bytes());
        bytes
    }

    #[test]
    fn test_create_request_body() {
        let temp = tempdir().unwrap();
        std::fs::write(temp.path().join("INIT.sql"), "").unwrap();

        let spec = ServiceSpec::builder("db", "postgres:12.12")
            .env("POSTGRES_USER", "postgres")
            .port(5432)
            .resource_root(temp.path())
            .file("INIT.sql", "/docker-entrypoint-initdb.d/INIT.sql", BindMode::ReadOnly)
            .build()
            .unwrap();

        let body = serde_json::to_value(build_create_request(&spec, "it")).unwrap();
        assert_eq!(body["Image"], "postgres:12.12");
        assert_eq!(body["Env"][0], "POSTGRES_USER=postgres");
        assert!(body["ExposedPorts"]["5432/tcp"].is_object());
        assert_eq!(body["HostConfig"]["PortBindings"]["5432/tcp"][0]["HostPort"], "");
        assert_eq!(body["Labels"][SERVICE_LABEL], "db");
        assert_eq!(body["Labels"][SESSION_LABEL], "it");

        let bind = body["HostConfig"]["Binds"][0].as_str().unwrap();
        assert!(bind.ends_with(":/docker-entrypoint-initdb.d/INIT.sql:ro"));
    }

    #[test]
    fn test_inspect_port_parsing() {
        let json = r#"{
            "Name": "/berth-db-1a2b3c4d",
            "State": {"Running": true, "Status": "running"},
            "NetworkSettings": {"Ports": {
                "5432/tcp": [
                    {"HostIp": "::", "HostPort": "54322"},
                    {"HostIp": "0.0.0.0", "HostPort": "54321"}
                ],
                "5433/udp": [{"HostIp": "0.0.0.0", "HostPort": "1"}],
                "8080/tcp": null
            }}
        }"#;

        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        let info = inspect_info(inspect);
        assert!(info.running);
        assert_eq!(info.ports.len(), 1);
        assert_eq!(info.ports[&5432], 54321);
        assert_eq!(info.name.as_deref(), Some("berth-db-1a2b3c4d"));
    }

    #[test]
    fn test_stopped_container_has_no_ports() {
        let json = r#"{
            "Name": "/berth-db-1",
            "State": {"Running": false},
            "NetworkSettings": {"Ports": {"5432/tcp": [{"HostIp": "0.0.0.0", "HostPort": "54321"}]}}
        }"#;
        let inspect: ContainerInspect = serde_json::from_str(json).unwrap();
        assert!(inspect_info(inspect).ports.is_empty());
    }

    #[test]
    fn test_demux_frames() {
        let mut bytes = frame(1, "listening\n");
        bytes.extend(frame(2, "warning\n"));
        bytes.extend(frame(1, "ready\n"));

        assert_eq!(demux_log_stream(&bytes), "listening\nwarning\nready\n");
    }

    #[test]
    fn test_demux_raw_tty_stream() {
        assert_eq!(demux_log_stream(b"plain output\n"), "plain output\n");
        assert_eq!(demux_log_stream(b""), "");
    }

    #[test]
    fn test_split_image_reference() {
        assert_eq!(
            split_image_reference("postgres:12.12"),
            ("postgres".to_string(), Some("12.12".to_string()))
        );
        assert_eq!(
            split_image_reference("redis"),
            ("redis".to_string(), Some("latest".to_string()))
        );
        assert_eq!(
            split_image_reference("localhost:5000/team/db"),
            ("localhost:5000/team/db".to_string(), Some("latest".to_string()))
        );
        assert_eq!(
            split_image_reference("redis@sha256:abc"),
            ("redis@sha256:abc".to_string(), None)
        );
    }

    #[test]
    fn test_engine_url_from_docker_host() {
        assert_eq!(
            engine_url_from_docker_host("tcp://127.0.0.1:2375").unwrap(),
            "http://127.0.0.1:2375"
        );
        assert_eq!(
            engine_url_from_docker_host("http://docker:2375/").unwrap(),
            "http://docker:2375"
        );
        assert!(engine_url_from_docker_host("unix:///var/run/docker.sock").is_err());
    }

    #[tokio::test]
    async fn test_unreachable_engine_reports_unavailable() {
        let config = OrchestratorConfig {
            engine_url: "http://127.0.0.1:1".to_string(),
            request_timeout_ms: 500,
            ..OrchestratorConfig::default()
        };
        let driver = DockerDriver::new(&config).unwrap();

        assert!(matches!(
            driver.ping().await,
            Err(BerthError::EngineUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_foreign_id_refused_without_engine_call() {
        let driver = DockerDriver::new(&OrchestratorConfig::default()).unwrap();
        assert!(matches!(
            driver.start("0123456789ab").await,
            Err(BerthError::InstanceNotFound(_))
        ));
    }
}
