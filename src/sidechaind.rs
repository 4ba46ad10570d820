use std::collections::HashMap;

use bitcoin::Network;

use crate::config::Config;
use crate::hostchain::{HostChainView, Signer};

/// Our global state: which network we sign on, the node wallet credentials and
/// the signing keys. Everything else lives on the host chain.
pub struct SidechainD {
    /// The network the configured full node is on
    pub network: Network,
    /// The node wallet holding our watch-only vault addresses, if any
    pub wallet: Option<String>,
    /// Unlocked for a few seconds right before signing, never kept open
    pub wallet_password: Option<String>,
    // pubkey hex -> privkey hex. Never logged, never transmitted.
    private_keys: HashMap<String, String>,
}

impl SidechainD {
    /// Creates our global state by consuming the static configuration
    pub fn from_config(config: &Config, network: Network) -> SidechainD {
        for pair in &config.bitcoin_private_key {
            log::info!("Bitcoin public key: {}", pair.public_key);
        }

        SidechainD {
            network,
            wallet: config.bitcoin_wallet.clone(),
            wallet_password: config.bitcoin_wallet_password.clone(),
            private_keys: config.key_map(),
        }
    }

    /// The network matching a `getblockchaininfo` chain string
    pub fn network_from_chain(chain: &str) -> Network {
        if chain == "mainnet" {
            Network::Bitcoin
        } else {
            Network::Testnet
        }
    }

    pub fn has_key(&self, pubkey: &str) -> bool {
        self.private_keys.contains_key(pubkey)
    }

    pub fn private_key(&self, pubkey: &str) -> Option<&str> {
        self.private_keys.get(pubkey).map(|s| s.as_str())
    }

    /// Who we are in the currently elected signer set, if elected
    pub fn our_signer(&self, view: &dyn HostChainView) -> Option<Signer> {
        view.active_signers()
            .into_iter()
            .find(|s| self.has_key(&s.sidechain_pubkey))
    }

    /// Who we are in a pinned signer snapshot. A rotated-out signer keeps
    /// signing the sweeps of the vaults it used to custody.
    pub fn snapshot_signer(&self, signers: &[Signer]) -> Option<Signer> {
        signers
            .iter()
            .find(|s| self.has_key(&s.sidechain_pubkey))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_privkey, test_pubkey, test_signers};

    fn state_with_key(i: u8) -> SidechainD {
        let config = toml::from_str::<Config>(&format!(
            r#"
            bitcoin-node-ip = "127.0.0.1"
            bitcoin-node-rpc-port = 18332
            bitcoin-node-zmq-port = 28332
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            bitcoin-private-key = ['["{}", "{}"]']
            "#,
            test_pubkey(i),
            test_privkey(i)
        ))
        .unwrap();
        SidechainD::from_config(&config, Network::Testnet)
    }

    #[test]
    fn network_detection() {
        assert_eq!(
            SidechainD::network_from_chain("mainnet"),
            Network::Bitcoin
        );
        // Anything that is not exactly "mainnet" is treated as testnet
        assert_eq!(SidechainD::network_from_chain("main"), Network::Testnet);
        assert_eq!(SidechainD::network_from_chain("test"), Network::Testnet);
        assert_eq!(SidechainD::network_from_chain("regtest"), Network::Testnet);
    }

    #[test]
    fn snapshot_identity() {
        let state = state_with_key(2);
        let signers = test_signers(3);
        let us = state.snapshot_signer(&signers).expect("we hold key 2");
        assert_eq!(us.signer_id, signers[1].signer_id);
        assert_eq!(
            state.private_key(&us.sidechain_pubkey),
            Some(test_privkey(2).as_str())
        );

        let strangers = test_signers(1);
        let state = state_with_key(4);
        assert!(state.snapshot_signer(&strangers).is_none());
    }
}
