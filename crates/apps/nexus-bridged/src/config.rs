use nexus_bridge::BridgeError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Socket file name used when the config does not name one.
pub const DEFAULT_SOCKET_NAME: &str = "bridge.sock";

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
pub struct BridgeConfig {
    pub data_dir: Option<PathBuf>,
    pub socket: Option<PathBuf>,
    /// Passed verbatim to the daemon on start.
    #[serde(default)]
    pub daemon_args: String,
    #[serde(default)]
    pub auto_start: bool,
}

impl BridgeConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// Command-line values win over the file.
    pub fn apply_overrides(&mut self, data_dir: Option<PathBuf>, socket: Option<PathBuf>) {
        if data_dir.is_some() {
            self.data_dir = data_dir;
        }
        if socket.is_some() {
            self.socket = socket;
        }
    }

    pub fn data_dir(&self) -> Result<&Path, BridgeError> {
        let data_dir =
            self.data_dir.as_deref().ok_or_else(|| BridgeError::config("data_dir is not set"))?;
        if !data_dir.is_absolute() {
            return Err(BridgeError::config(format!(
                "data_dir must be absolute (got {})",
                data_dir.display()
            )));
        }
        Ok(data_dir)
    }

    pub fn socket_path(&self) -> Result<PathBuf, BridgeError> {
        match &self.socket {
            Some(socket) => Ok(socket.clone()),
            None => Ok(self.data_dir()?.join(DEFAULT_SOCKET_NAME)),
        }
    }
}
