use std::{
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::{error::ChatError, identity::Identity};

pub const CONFIG_FILE: &str = "config.json";

/// `config.json` holds two URLs; anything bigger is not ours.
const MAX_CONFIG_BYTES: u64 = 16 * 1024;

const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:8000";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// WebSocket base, e.g. `ws://host:8000`.
    #[serde(rename = "serverUrl")]
    pub server_url: String,
    /// HTTP base for the history and upload endpoints.
    #[serde(rename = "apiUrl")]
    pub api_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_owned(),
            api_url: DEFAULT_API_URL.to_owned(),
        }
    }
}

impl ClientConfig {
    pub fn api_base(&self) -> Result<Url, ChatError> {
        Url::parse(&self.api_url)
            .map_err(|err| ChatError::Connection(format!("invalid API URL: {err}")))
    }

    /// Socket endpoint keyed by the identity:
    /// `{server}/ws/{userId}/{userName}`, with both segments
    /// percent-encoded (display names are routinely non-ASCII).
    pub fn ws_endpoint(&self, identity: &Identity) -> Result<Url, ChatError> {
        let mut url = Url::parse(&self.server_url)
            .map_err(|err| ChatError::Connection(format!("invalid server URL: {err}")))?;
        url.path_segments_mut()
            .map_err(|()| ChatError::Connection("server URL cannot be a base".to_owned()))?
            .pop_if_empty()
            .push("ws")
            .push(&identity.user_id)
            .push(&identity.user_name);
        Ok(url)
    }
}

/// Client data directory: `$ANONCHAT_DATA_DIR`, else `~/.anonchat`, else a
/// `.anonchat` directory next to the binary's working directory.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("ANONCHAT_DATA_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".anonchat")
}

pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE)
}

/// Tolerant load: a missing or unusable file yields the defaults.
pub fn load_or_default(path: &Path) -> ClientConfig {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(_) => return ClientConfig::default(),
    };
    if meta.len() > MAX_CONFIG_BYTES {
        warn!(path = %path.display(), size = meta.len(), "config file too large, using defaults");
        return ClientConfig::default();
    }
    match fs::read_to_string(path) {
        Ok(data) => match serde_json::from_str(&data) {
            Ok(config) => config,
            Err(err) => {
                warn!(path = %path.display(), "config unparsable, using defaults: {err}");
                ClientConfig::default()
            }
        },
        Err(err) => {
            warn!(path = %path.display(), "config unreadable, using defaults: {err}");
            ClientConfig::default()
        }
    }
}

pub fn save(path: &Path, config: &ClientConfig) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let payload = serde_json::to_string_pretty(config)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, payload.as_bytes())?;
    fs::rename(&tmp, path)
}
