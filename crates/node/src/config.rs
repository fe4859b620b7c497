//! Node configuration loaded from environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use loopnode_core::types::Context;
use loopnode_link::LinkConfig;
use loopnode_trainer::MachineConfig;
use loopnode_transfer::{HttpConfig, TransferConfig};
use uuid::Uuid;

/// File in the data dir holding the generated node id.
const NODE_UUID_FILE: &str = "node_uuid";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    Missing(&'static str),

    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Role a node plays towards the Loop, sent in the connect handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    Trainer,
    Detector,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Trainer => "trainer",
            NodeRole::Detector => "detector",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub loop_host: String,
    pub loop_scheme: String,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssl_cert_path: Option<PathBuf>,
    pub node_name: String,
    /// `None` until resolved with [`NodeConfig::resolve_node_uuid`].
    pub node_uuid: Option<Uuid>,
    pub data_dir: PathBuf,
    pub restart_after_training: bool,
    pub keep_old_trainings: bool,
    pub idle_timeout: Option<Duration>,
    pub upload_chunk_size: usize,
    pub download_chunk_size: usize,
    pub metadata_chunk_size: usize,
    pub http_port: u16,
}

impl NodeConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                    | Default            |
    /// |----------------------------|--------------------|
    /// | `LOOP_HOST`                | `learning-loop.ai` |
    /// | `LOOP_SCHEME`              | `https`            |
    /// | `ORGANIZATION`             | --                 |
    /// | `PROJECT`                  | --                 |
    /// | `LOOP_USERNAME`            | --                 |
    /// | `LOOP_PASSWORD`            | --                 |
    /// | `LOOP_SSL_CERT_PATH`       | --                 |
    /// | `NODE_NAME`                | `node`             |
    /// | `NODE_UUID`                | persisted in data dir |
    /// | `NODE_DATA_DIR`            | `/data`            |
    /// | `RESTART_AFTER_TRAINING`   | `false`            |
    /// | `KEEP_OLD_TRAININGS`       | `false`            |
    /// | `TRAINER_IDLE_TIMEOUT_SEC` | --                 |
    /// | `UPLOAD_CHUNK_SIZE`        | `10`               |
    /// | `DOWNLOAD_CHUNK_SIZE`      | `10`               |
    /// | `METADATA_CHUNK_SIZE`      | `100`              |
    /// | `HTTP_PORT`                | `80`               |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`from_env`](Self::from_env) after loading a `.env` file, if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env()
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let node_uuid = match var("NODE_UUID") {
            Some(value) => Some(Uuid::parse_str(&value).map_err(|_| ConfigError::Invalid {
                var: "NODE_UUID",
                value,
            })?),
            None => None,
        };

        Ok(Self {
            loop_host: var("LOOP_HOST").unwrap_or_else(|| "learning-loop.ai".into()),
            loop_scheme: var("LOOP_SCHEME").unwrap_or_else(|| "https".into()),
            organization: var("ORGANIZATION"),
            project: var("PROJECT"),
            username: var("LOOP_USERNAME"),
            password: var("LOOP_PASSWORD"),
            ssl_cert_path: var("LOOP_SSL_CERT_PATH").map(PathBuf::from),
            node_name: var("NODE_NAME").unwrap_or_else(|| "node".into()),
            node_uuid,
            data_dir: var("NODE_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| "/data".into()),
            restart_after_training: parse_flag("RESTART_AFTER_TRAINING", var("RESTART_AFTER_TRAINING"))?,
            keep_old_trainings: parse_flag("KEEP_OLD_TRAININGS", var("KEEP_OLD_TRAININGS"))?,
            idle_timeout: parse_number::<u64>("TRAINER_IDLE_TIMEOUT_SEC", var("TRAINER_IDLE_TIMEOUT_SEC"))?
                .map(Duration::from_secs),
            upload_chunk_size: parse_number("UPLOAD_CHUNK_SIZE", var("UPLOAD_CHUNK_SIZE"))?.unwrap_or(10),
            download_chunk_size: parse_number("DOWNLOAD_CHUNK_SIZE", var("DOWNLOAD_CHUNK_SIZE"))?.unwrap_or(10),
            metadata_chunk_size: parse_number("METADATA_CHUNK_SIZE", var("METADATA_CHUNK_SIZE"))?.unwrap_or(100),
            http_port: parse_number("HTTP_PORT", var("HTTP_PORT"))?.unwrap_or(80),
        })
    }

    /// Project scope; required for roles bound to one project.
    pub fn context(&self) -> Result<Context, ConfigError> {
        let organization = self.organization.clone().ok_or(ConfigError::Missing("ORGANIZATION"))?;
        let project = self.project.clone().ok_or(ConfigError::Missing("PROJECT"))?;
        Ok(Context::new(organization, project))
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.loop_scheme, self.loop_host)
    }

    pub fn ws_url(&self) -> String {
        let scheme = if self.loop_scheme == "https" { "wss" } else { "ws" };
        format!("{scheme}://{}/ws/nodes", self.loop_host)
    }

    /// Use `NODE_UUID` if set, otherwise the id persisted in the data dir,
    /// generating and persisting one on first start.
    pub fn resolve_node_uuid(&mut self) -> Result<Uuid, ConfigError> {
        if let Some(id) = self.node_uuid {
            return Ok(id);
        }
        let id = load_or_create_node_uuid(&self.data_dir)?;
        self.node_uuid = Some(id);
        Ok(id)
    }

    pub fn http_config(&self) -> HttpConfig {
        HttpConfig {
            base_url: self.base_url(),
            username: self.username.clone(),
            password: self.password.clone(),
            ssl_cert_path: self.ssl_cert_path.clone(),
            ..Default::default()
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            metadata_chunk_size: self.metadata_chunk_size,
            download_chunk_size: self.download_chunk_size,
            ..Default::default()
        }
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            detection_upload_batch_size: self.upload_chunk_size,
            keep_old_trainings: self.keep_old_trainings,
            ..Default::default()
        }
    }

    /// Link settings with the identifying handshake headers.
    pub fn link_config(&self, role: NodeRole, node_id: Uuid) -> LinkConfig {
        let mut headers = vec![
            ("x-node-name".to_string(), self.node_name.clone()),
            ("x-node-uuid".to_string(), node_id.to_string()),
            ("x-node-type".to_string(), role.as_str().to_string()),
        ];
        if let (Some(organization), Some(project)) = (&self.organization, &self.project) {
            headers.push(("x-organization".to_string(), organization.clone()));
            headers.push(("x-project".to_string(), project.clone()));
        }
        LinkConfig {
            url: self.ws_url(),
            headers,
            ..Default::default()
        }
    }
}

fn parse_flag(var: &'static str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::Invalid { var, value }),
    }
}

fn parse_number<T: std::str::FromStr>(var: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError> {
    match value {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn load_or_create_node_uuid(data_dir: &Path) -> Result<Uuid, ConfigError> {
    let path = data_dir.join(NODE_UUID_FILE);
    let io = |source| ConfigError::Io {
        path: path.clone(),
        source,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => {
            let value = content.trim().to_string();
            return Uuid::parse_str(&value).map_err(|_| ConfigError::Invalid { var: "NODE_UUID", value });
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io(e)),
    }

    std::fs::create_dir_all(data_dir).map_err(io)?;
    let id = Uuid::new_v4();
    std::fs::write(&path, id.to_string()).map_err(io)?;
    tracing::info!(node_uuid = %id, path = %path.display(), "Generated node id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        NodeConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_variables() {
        let config = config(&[]).unwrap();
        assert_eq!(config.base_url(), "https://learning-loop.ai");
        assert_eq!(config.ws_url(), "wss://learning-loop.ai/ws/nodes");
        assert_eq!(config.data_dir, PathBuf::from("/data"));
        assert_eq!(config.metadata_chunk_size, 100);
        assert_eq!(config.http_port, 80);
        assert!(!config.restart_after_training);
        assert!(config.idle_timeout.is_none());
        assert!(config.node_uuid.is_none());
    }

    #[test]
    fn plain_http_host_uses_ws() {
        let config = config(&[("LOOP_HOST", "loop.local:8000"), ("LOOP_SCHEME", "http")]).unwrap();
        assert_eq!(config.ws_url(), "ws://loop.local:8000/ws/nodes");
    }

    #[test]
    fn flags_and_numbers_are_parsed() {
        let config = config(&[
            ("RESTART_AFTER_TRAINING", "TRUE"),
            ("KEEP_OLD_TRAININGS", "1"),
            ("TRAINER_IDLE_TIMEOUT_SEC", "600"),
            ("UPLOAD_CHUNK_SIZE", "25"),
        ])
        .unwrap();
        assert!(config.restart_after_training);
        assert!(config.keep_old_trainings);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.machine_config().detection_upload_batch_size, 25);
    }

    #[test]
    fn invalid_number_names_the_variable() {
        let err = config(&[("HTTP_PORT", "eighty")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "HTTP_PORT", .. }));
    }

    #[test]
    fn context_requires_organization_and_project() {
        let err = config(&[("ORGANIZATION", "zauber")]).unwrap().context().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PROJECT")));
    }

    #[test]
    fn node_uuid_is_generated_once_and_reused() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().to_string_lossy().into_owned();

        let first = config(&[("NODE_DATA_DIR", data_dir.as_str())]).unwrap().resolve_node_uuid().unwrap();
        let second = config(&[("NODE_DATA_DIR", data_dir.as_str())]).unwrap().resolve_node_uuid().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn link_headers_identify_the_node() {
        let id = Uuid::new_v4();
        let config = config(&[("NODE_NAME", "cam-node"), ("ORGANIZATION", "o"), ("PROJECT", "p")]).unwrap();
        let link = config.link_config(NodeRole::Detector, id);
        assert!(link.headers.contains(&("x-node-name".to_string(), "cam-node".to_string())));
        assert!(link.headers.contains(&("x-node-type".to_string(), "detector".to_string())));
        assert!(link.headers.contains(&("x-project".to_string(), "p".to_string())));
    }
}
