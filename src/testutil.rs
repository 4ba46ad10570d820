//! Shared test fixtures: deterministic signer keys and a canned Bitcoin node.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::PublicKey;
use serde_json::{json, Value as Json};

use crate::bitcoind::interface::{
    BitcoinRpc, BtcTxout, FinalizedPsbt, ProcessedPsbt, SignedRawTx, MIN_FEE_RATE,
};
use crate::bitcoind::BitcoindError;
use crate::hostchain::{AccountId, Signer, SignerId};

/// The hex of the deterministic test private key number `i`
pub fn test_privkey(i: u8) -> String {
    let mut bytes = [0u8; 32];
    bytes[31] = i;
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// The compressed pubkey hex matching [test_privkey]
pub fn test_pubkey(i: u8) -> String {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(&{
        let mut bytes = [0u8; 32];
        bytes[31] = i;
        bytes
    })
    .expect("non-zero test key");
    let key = bitcoin::secp256k1::PublicKey::from_secret_key(&secp, &sk);
    PublicKey {
        compressed: true,
        key,
    }
    .to_string()
}

/// `n` weight-1 signers with real, deterministic keypairs
pub fn test_signers(n: u8) -> Vec<Signer> {
    (1..=n)
        .map(|i| Signer {
            signer_id: SignerId(i as u64),
            account: AccountId(100 + i as u64),
            weight: 1,
            sidechain_pubkey: test_pubkey(i),
        })
        .collect()
}

/// A [crate::sidechaind::SidechainD] holding the deterministic test key `i`,
/// on testnet
pub fn signer_state(i: u8) -> crate::sidechaind::SidechainD {
    let config = toml::from_str::<crate::config::Config>(&format!(
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
    .expect("the test config is well-formed");
    crate::sidechaind::SidechainD::from_config(&config, bitcoin::Network::Testnet)
}

/// Rotate the chain to `signers` and run the federation agreement on the new
/// vault address, returning it
pub fn install_vault(
    chain: &crate::hostchain::memory::MemoryChain,
    signers: Vec<Signer>,
) -> crate::hostchain::VaultAddress {
    use crate::hostchain::{HostChainSubmit, HostChainView, HostOperation, SIDECHAIN};

    let vault_id = chain.rotate_signers(signers.clone());
    let address = crate::scripts::vault_address(&signers, bitcoin::Network::Testnet)
        .expect("test keys are valid");
    let proposal_id = chain
        .propose(
            signers[0].signer_id,
            vec![HostOperation::VaultUpdate {
                payer: chain.federation_account(),
                vault_id,
                sidechain: SIDECHAIN.to_string(),
                address_json: address.to_json(),
            }],
            chain.head_block_time() + 1000,
        )
        .expect("proposing the vault address");
    for signer in &signers {
        if chain.proposals().is_empty() {
            // Quorum reached, the proposal executed
            break;
        }
        chain
            .approve(signer.signer_id, proposal_id)
            .expect("approving the vault address");
    }
    address
}

/// A canned Bitcoin node. Every response is looked up in plain maps the test
/// fills in beforehand; PSBT strings are opaque `+`-joined token sets so that
/// combine/finalize behave set-wise like the real node.
pub struct MockRpc {
    pub fee_rate: u64,
    pub chain: String,
    /// Signature token appended by `walletprocesspsbt`, one per mock wallet
    pub wallet_sig_tag: Option<String>,
    /// How many signature tokens `finalizepsbt` wants before completing
    pub finalize_threshold: usize,
    /// Raw transaction hex handed out by a completed `finalizepsbt`
    pub finalized_hex: Option<String>,

    pub utxos: Mutex<HashMap<String, Vec<BtcTxout>>>,
    pub transactions: Mutex<HashMap<String, Json>>,
    pub blocks: Mutex<HashMap<String, Json>>,
    pub broadcast: Mutex<Vec<String>>,
    pub imported: Mutex<Vec<String>>,
    pub unlocks: Mutex<u32>,
}

impl MockRpc {
    pub fn new() -> MockRpc {
        MockRpc {
            fee_rate: MIN_FEE_RATE,
            chain: "test".to_string(),
            wallet_sig_tag: None,
            finalize_threshold: 2,
            finalized_hex: None,
            utxos: Mutex::new(HashMap::new()),
            transactions: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            broadcast: Mutex::new(Vec::new()),
            imported: Mutex::new(Vec::new()),
            unlocks: Mutex::new(0),
        }
    }

    pub fn add_utxo(&self, address: &str, txid: &str, vout: u32, amount: u64) {
        self.utxos
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_default()
            .push(BtcTxout {
                txid: txid.to_string(),
                vout,
                amount,
            });
    }

    fn psbt_tokens(psbt: &str) -> Vec<String> {
        psbt.split('+').map(|t| t.to_string()).collect()
    }
}

impl BitcoinRpc for MockRpc {
    fn estimate_fee_rate(&self, _conf_target: u16) -> u64 {
        std::cmp::max(self.fee_rate, MIN_FEE_RATE)
    }

    fn list_unspent(
        &self,
        address: &str,
        minimum_amount: u64,
    ) -> Result<Vec<BtcTxout>, BitcoindError> {
        Ok(self
            .utxos
            .lock()
            .unwrap()
            .get(address)
            .map(|utxos| {
                utxos
                    .iter()
                    .filter(|u| u.amount >= minimum_amount)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_transaction(&self, txid: &str) -> Result<Json, BitcoindError> {
        self.transactions
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| BitcoindError::Custom(format!("no such transaction: {}", txid)))
    }

    fn get_block(&self, block_hash: &str, _verbosity: u8) -> Result<Json, BitcoindError> {
        self.blocks
            .lock()
            .unwrap()
            .get(block_hash)
            .cloned()
            .ok_or_else(|| BitcoindError::Custom(format!("no such block: {}", block_hash)))
    }

    fn send_raw_transaction(&self, tx_hex: &str) -> Result<(), BitcoindError> {
        self.broadcast.lock().unwrap().push(tx_hex.to_string());
        Ok(())
    }

    fn combine_psbt(&self, psbts: &[String]) -> Result<String, BitcoindError> {
        let mut tokens: Vec<String> = psbts.iter().flat_map(|p| Self::psbt_tokens(p)).collect();
        tokens.sort();
        tokens.dedup();
        Ok(tokens.join("+"))
    }

    fn finalize_psbt(&self, psbt: &str) -> Result<FinalizedPsbt, BitcoindError> {
        let sigs = Self::psbt_tokens(psbt)
            .iter()
            .filter(|t| t.starts_with("sig"))
            .count();
        let complete = sigs >= self.finalize_threshold;
        Ok(FinalizedPsbt {
            complete,
            hex: if complete {
                self.finalized_hex.clone()
            } else {
                None
            },
        })
    }

    fn wallet_process_psbt(&self, psbt: &str) -> Result<ProcessedPsbt, BitcoindError> {
        let psbt = match &self.wallet_sig_tag {
            Some(tag) => format!("{}+{}", psbt, tag),
            None => psbt.to_string(),
        };
        Ok(ProcessedPsbt {
            complete: false,
            psbt,
        })
    }

    fn sign_raw_transaction_with_wallet(&self, tx_hex: &str) -> Result<SignedRawTx, BitcoindError> {
        Ok(SignedRawTx {
            complete: false,
            hex: tx_hex.to_string(),
        })
    }

    fn add_multisig_address(
        &self,
        _nrequired: u32,
        _pubkeys: &[String],
    ) -> Result<Json, BitcoindError> {
        Ok(json!({ "address": "2NA4h6sc9oZ4ogfNKU9Wp6fkqPZLZPqqpgf", "redeemScript": "00" }))
    }

    fn create_multisig(&self, _nrequired: u32, _pubkeys: &[String]) -> Result<Json, BitcoindError> {
        Ok(json!({ "address": "2NA4h6sc9oZ4ogfNKU9Wp6fkqPZLZPqqpgf", "redeemScript": "00" }))
    }

    fn create_psbt(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError> {
        let ins: Vec<Json> = inputs
            .iter()
            .map(|i| json!({ "txid": i.txid, "vout": i.vout }))
            .collect();
        Ok(format!(
            "psbt:{}",
            json!({ "in": ins, "out": outputs })
        ))
    }

    fn create_raw_transaction(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError> {
        let ins: Vec<Json> = inputs
            .iter()
            .map(|i| json!({ "txid": i.txid, "vout": i.vout }))
            .collect();
        Ok(format!("raw:{}", json!({ "in": ins, "out": outputs })))
    }

    fn import_address(&self, address_or_script: &str) -> Result<(), BitcoindError> {
        self.imported
            .lock()
            .unwrap()
            .push(address_or_script.to_string());
        Ok(())
    }

    fn wallet_passphrase(&self, _passphrase: &str, _timeout: u32) -> bool {
        *self.unlocks.lock().unwrap() += 1;
        true
    }

    fn load_wallet(&self, _name: &str) -> Result<(), BitcoindError> {
        Ok(())
    }

    fn unload_wallet(&self, _name: &str) -> Result<(), BitcoindError> {
        Ok(())
    }

    fn get_blockchain_info(&self) -> Result<Json, BitcoindError> {
        Ok(json!({ "chain": self.chain }))
    }
}
