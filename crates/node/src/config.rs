//! Persisted node configuration.
//!
//! The mutable parts of the runtime configuration (notably the auto-listen
//! endpoint list the mining controller republishes) are saved back to
//! `pod.json` in the data directory.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "pod.json";

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    /// Network name: mainnet, testnet, or regtest.
    #[serde(default)]
    pub network: String,
    /// P2P listen endpoints.
    #[serde(default)]
    pub p2p_listeners: Vec<String>,
    /// Peer endpoints to connect to, maintained by cluster auto-listen.
    #[serde(default)]
    pub p2p_connect: Vec<String>,
    /// Re-publish our own endpoints over the miner multicast channel.
    #[serde(default)]
    pub auto_listen: bool,
    /// Wallet RPC endpoint the mining controller watches.
    #[serde(default)]
    pub wallet_server: String,
}

pub fn load_config(path: &Path) -> Result<NodeConfig, String> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(NodeConfig::default());
        }
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };
    serde_json::from_slice(&bytes).map_err(|err| format!("invalid {}: {err}", path.display()))
}

pub fn save_config(path: &Path, config: &NodeConfig) -> Result<(), String> {
    let bytes = serde_json::to_vec_pretty(config).map_err(|err| err.to_string())?;
    write_file_atomic(path, &bytes)
}

/// Write via a temporary sibling and rename, so a crash mid-write never
/// leaves a torn file behind.
pub fn write_file_atomic(path: &Path, bytes: &[u8]) -> Result<(), String> {
    let mut tmp_path = PathBuf::from(path);
    tmp_path.set_extension("tmp");
    fs::write(&tmp_path, bytes)
        .map_err(|err| format!("failed to write {}: {err}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .map_err(|err| format!("failed to rename {}: {err}", tmp_path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_roundtrip() {
        let dir = std::env::temp_dir().join(format!("pod-config-test-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create dir");
        let path = dir.join(CONFIG_FILE_NAME);

        let missing = load_config(&path).expect("load missing");
        assert!(missing.p2p_connect.is_empty());

        let config = NodeConfig {
            network: "testnet".to_string(),
            p2p_listeners: vec!["0.0.0.0:21047".to_string()],
            p2p_connect: vec!["10.0.0.9:21047".to_string()],
            auto_listen: true,
            wallet_server: "127.0.0.1:21048".to_string(),
        };
        save_config(&path, &config).expect("save");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded.p2p_connect, config.p2p_connect);
        assert!(loaded.auto_listen);

        fs::remove_dir_all(&dir).ok();
    }
}
