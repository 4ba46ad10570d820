use std::collections::HashMap;
use std::path::PathBuf;

use serde::{de, Deserialize, Deserializer};

/// A sidechain signing key, configured as a JSON `["pubkey_hex", "privkey_hex"]`
/// pair. The option is repeatable: one entry per key we can sign with.
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Compressed public key, hex-encoded
    pub public_key: String,
    /// Raw private key, hex-encoded
    pub private_key: String,
}

impl<'de> Deserialize<'de> for KeyPair {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;

        let (public_key, private_key): (String, String) = serde_json::from_str(&raw)
            .map_err(|e| de::Error::custom(format!("Invalid public/private key pair: {}", e)))?;
        if public_key.is_empty() || private_key.is_empty() {
            return Err(de::Error::custom("Invalid public/private key pair."));
        }

        Ok(KeyPair {
            public_key,
            private_key,
        })
    }
}

/// Static informations we require to operate
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The IP the Bitcoin full node is reachable on
    pub bitcoin_node_ip: String,
    /// The node's JSONRPC port
    pub bitcoin_node_rpc_port: u16,
    /// The node's ZMQ publisher port (`hashblock` topic)
    pub bitcoin_node_zmq_port: u16,
    pub bitcoin_node_rpc_user: String,
    pub bitcoin_node_rpc_password: String,
    /// The node wallet holding our watch-only vault addresses, if any
    pub bitcoin_wallet: Option<String>,
    /// The wallet passphrase, only ever unlocked right before signing
    pub bitcoin_wallet_password: Option<String>,
    /// Our sidechain signing keys
    #[serde(default)]
    pub bitcoin_private_key: Vec<KeyPair>,
}

impl Config {
    /// Get our static configuration out of a mandatory configuration file.
    ///
    /// We require all settings to be set in the configuration file, and only in
    /// the configuration file, to avoid a futile duplication with the command
    /// line or the environment.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let config_file = match custom_path {
            Some(path) => path,
            None => config_file_path()?,
        };

        std::fs::read(&config_file)
            .map_err(|e| ConfigError(format!("Reading configuration file: {}", e)))
            .and_then(|file_content| {
                toml::from_slice::<Config>(&file_content)
                    .map_err(|e| ConfigError(format!("Parsing configuration file: {}", e)))
            })
    }

    /// The configured signing keys as a `pubkey hex -> privkey hex` map
    pub fn key_map(&self) -> HashMap<String, String> {
        self.bitcoin_private_key
            .iter()
            .map(|pair| (pair.public_key.clone(), pair.private_key.clone()))
            .collect()
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct ConfigError(pub String);

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

/// Get the absolute path to the sidechaind configuration folder.
///
/// This a "sidechaind" directory in the XDG standard configuration directory for
/// all OSes but Linux-based ones, for which it's `~/.sidechaind`.
pub fn config_folder_path() -> Result<PathBuf, ConfigError> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".sidechaind");

        #[cfg(not(target_os = "linux"))]
        path.push("Sidechaind");

        return Ok(path);
    }

    Err(ConfigError(
        "Could not locate the configuration directory.".to_owned(),
    ))
}

fn config_file_path() -> Result<PathBuf, ConfigError> {
    config_folder_path().map(|mut path| {
        path.push("sidechaind.toml");
        path
    })
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn config_parsing() {
        // A minimal configuration, no wallet
        toml::from_str::<Config>(
            r#"
            bitcoin-node-ip = "127.0.0.1"
            bitcoin-node-rpc-port = 8332
            bitcoin-node-zmq-port = 28332
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            "#,
        )
        .expect("Parsing a minimal config");

        // A full configuration with repeatable key pairs
        let config = toml::from_str::<Config>(
            r#"
            bitcoin-node-ip = "192.168.1.21"
            bitcoin-node-rpc-port = 18332
            bitcoin-node-zmq-port = 28332
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            bitcoin-wallet = "vault-watchonly"
            bitcoin-wallet-password = "correct horse"
            bitcoin-private-key = [
                '["02d67c26cf20153fe7625ca1454222d3b3aeb53b122d8a0f7d32a3dd4b2c2016f4", "9f3b1f2c44b2a1f0f0a6e9d0fb28e41964c0cd936ab29426f0dffe0a96812fc1"]',
            ]
            "#,
        )
        .expect("Parsing a full config");
        assert_eq!(config.bitcoin_private_key.len(), 1);
        let keys = config.key_map();
        assert_eq!(
            keys.get("02d67c26cf20153fe7625ca1454222d3b3aeb53b122d8a0f7d32a3dd4b2c2016f4")
                .map(|s| s.as_str()),
            Some("9f3b1f2c44b2a1f0f0a6e9d0fb28e41964c0cd936ab29426f0dffe0a96812fc1")
        );

        // An empty member of a key pair is refused
        toml::from_str::<Config>(
            r#"
            bitcoin-node-ip = "127.0.0.1"
            bitcoin-node-rpc-port = 8332
            bitcoin-node-zmq-port = 28332
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            bitcoin-private-key = ['["", "9f3b"]']
            "#,
        )
        .expect_err("Parsing a config with an empty pubkey");

        // Not JSON at all
        toml::from_str::<Config>(
            r#"
            bitcoin-node-ip = "127.0.0.1"
            bitcoin-node-rpc-port = 8332
            bitcoin-node-zmq-port = 28332
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            bitcoin-private-key = ["02d67c,9f3b"]
            "#,
        )
        .expect_err("Parsing a config with a non-JSON key pair");
    }
}
