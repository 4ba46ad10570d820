use crate::bitcoind::{format_btc, json_amount_sats, BitcoindError};
use crate::config::Config;

use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

use jsonrpc::{
    arg,
    client::Client,
    simple_http::{Error as HttpError, SimpleHttpTransport},
};
use serde_json::Value as Json;

// If bitcoind takes more than 3 minutes to answer one of our queries, fail.
const RPC_SOCKET_TIMEOUT: u64 = 180;

// listunspent confirmation window
const LISTUNSPENT_MIN_CONF: u64 = 1;
const LISTUNSPENT_MAX_CONF: u64 = 9_999_999;

/// Fee rate floor, in satoshis per kilo-vbyte
pub const MIN_FEE_RATE: u64 = 1000;

/// Confirmation target handed to the node's fee estimator
pub const FEE_ESTIMATE_CONF_TARGET: u16 = 1;

/// How long the wallet stays unlocked before a signing call, in seconds
pub const WALLET_UNLOCK_SECONDS: u32 = 5;

/// An unspent output, satoshi-denominated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BtcTxout {
    pub txid: String,
    pub vout: u32,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessedPsbt {
    pub complete: bool,
    pub psbt: String,
}

#[derive(Debug, Clone)]
pub struct FinalizedPsbt {
    pub complete: bool,
    /// The network-ready transaction, only set when complete
    pub hex: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignedRawTx {
    pub complete: bool,
    pub hex: String,
}

/// What the coordinator needs from a Bitcoin full node.
///
/// `BitcoinD` is the network-backed implementation; the seam exists so the
/// agreement and signing logic can run against a canned node in tests.
pub trait BitcoinRpc: Send + Sync {
    /// Estimated fee rate in sats per kvB, floored at [MIN_FEE_RATE]. Never
    /// fails: an unreachable or clueless estimator yields the floor.
    fn estimate_fee_rate(&self, conf_target: u16) -> u64;

    /// The confirmed unspent outputs paying `address`, at least `minimum_amount` sats each
    fn list_unspent(
        &self,
        address: &str,
        minimum_amount: u64,
    ) -> Result<Vec<BtcTxout>, BitcoindError>;

    /// The `gettransaction` result object for a wallet transaction
    fn get_transaction(&self, txid: &str) -> Result<Json, BitcoindError>;

    /// The `getblock` result object at the given verbosity
    fn get_block(&self, block_hash: &str, verbosity: u8) -> Result<Json, BitcoindError>;

    /// Broadcast a raw transaction. "Already in chain" is a success.
    fn send_raw_transaction(&self, tx_hex: &str) -> Result<(), BitcoindError>;

    fn combine_psbt(&self, psbts: &[String]) -> Result<String, BitcoindError>;
    fn finalize_psbt(&self, psbt: &str) -> Result<FinalizedPsbt, BitcoindError>;
    fn wallet_process_psbt(&self, psbt: &str) -> Result<ProcessedPsbt, BitcoindError>;
    fn sign_raw_transaction_with_wallet(&self, tx_hex: &str)
        -> Result<SignedRawTx, BitcoindError>;

    fn add_multisig_address(
        &self,
        nrequired: u32,
        pubkeys: &[String],
    ) -> Result<Json, BitcoindError>;
    fn create_multisig(&self, nrequired: u32, pubkeys: &[String]) -> Result<Json, BitcoindError>;

    fn create_psbt(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError>;
    fn create_raw_transaction(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError>;

    fn import_address(&self, address_or_script: &str) -> Result<(), BitcoindError>;

    /// Unlock the wallet for `timeout` seconds. Returns whether it worked.
    fn wallet_passphrase(&self, passphrase: &str, timeout: u32) -> bool;

    fn load_wallet(&self, name: &str) -> Result<(), BitcoindError>;
    fn unload_wallet(&self, name: &str) -> Result<(), BitcoindError>;

    fn get_blockchain_info(&self) -> Result<Json, BitcoindError>;
}

macro_rules! params {
    ($($param:expr),* $(,)?) => {
        [
            $(
                arg($param),
            )*
        ]
    };
}

pub struct BitcoinD {
    client: Client,
}

impl BitcoinD {
    pub fn new(config: &Config) -> Result<BitcoinD, BitcoindError> {
        let mut url = format!(
            "http://{}:{}",
            config.bitcoin_node_ip, config.bitcoin_node_rpc_port
        );
        if let Some(ref wallet) = config.bitcoin_wallet {
            url = format!("{}/wallet/{}", url, wallet);
        }

        let client = Client::with_transport(
            SimpleHttpTransport::builder()
                .url(&url)
                .map_err(BitcoindError::from)?
                .timeout(Duration::from_secs(RPC_SOCKET_TIMEOUT))
                .auth(
                    &config.bitcoin_node_rpc_user,
                    Some(&config.bitcoin_node_rpc_password),
                )
                .build(),
        );

        Ok(BitcoinD { client })
    }

    // Reasonably try to be robust to possible spurious communication error,
    // without ever hiding a real failure from the caller.
    fn handle_error(&self, e: jsonrpc::Error, start: Instant) -> Result<(), BitcoindError> {
        let now = Instant::now();

        match e {
            jsonrpc::Error::Transport(ref err) => {
                log::error!("Transport error when talking to bitcoind: '{}'", err);

                // This is *always* a simple_http::Error. Rule out the errors
                // that cannot recover by themselves.
                let any_err = err as &dyn std::any::Any;
                if let Some(http_err) = any_err.downcast_ref::<HttpError>() {
                    match http_err {
                        HttpError::InvalidUrl { .. } => return Err(BitcoindError::Server(e)),
                        HttpError::SocketError(_) => return Err(BitcoindError::Server(e)),
                        _ => {}
                    }
                }

                // May happen transiently, eg when the RPC work queue is
                // exceeded. Try again for a reasonable amount of time.
                if now.duration_since(start) > Duration::from_secs(45) {
                    return Err(BitcoindError::Server(e));
                }
                std::thread::sleep(Duration::from_secs(1));
                log::debug!("Retrying RPC request to bitcoind.");
            }
            jsonrpc::Error::Json(ref err) => {
                // A JSON serialization error should not happen; fail fast.
                log::error!("JSON serialization error when talking to bitcoind: '{}'", err);
                if now.duration_since(start) > Duration::from_secs(1) {
                    return Err(BitcoindError::Server(e));
                }
                std::thread::sleep(Duration::from_millis(500));
                log::debug!("Retrying RPC request to bitcoind.");
            }
            _ => return Err(e.into()),
        };

        Ok(())
    }

    fn make_request(
        &self,
        method: &str,
        params: &[Box<serde_json::value::RawValue>],
    ) -> Result<Json, BitcoindError> {
        let req = self.client.build_request(method, params);
        log::trace!("Sending to bitcoind: {:#?}", req);

        let start = Instant::now();
        loop {
            match self.client.send_request(req.clone()) {
                Ok(resp) => {
                    let res = resp.result().map_err(|e| {
                        let err = BitcoindError::from(e);
                        if let BitcoindError::Node(ref rpc) = err {
                            log::warn!(
                                "Bitcoin RPC call '{}' failed with '{}'",
                                method,
                                rpc.raw
                            );
                        }
                        err
                    })?;
                    log::trace!("Got from bitcoind: {:#?}", res);

                    return Ok(res);
                }
                Err(e) => {
                    // Decide whether we should error, or not just yet
                    self.handle_error(e, start)?;
                }
            }
        }
    }
}

impl BitcoinRpc for BitcoinD {
    fn estimate_fee_rate(&self, conf_target: u16) -> u64 {
        let res = match self.make_request(
            "estimatesmartfee",
            &params!(Json::Number(serde_json::Number::from(conf_target))),
        ) {
            Ok(res) => res,
            Err(e) => {
                log::warn!("Bitcoin RPC call estimatesmartfee failed: '{}'", e);
                return MIN_FEE_RATE;
            }
        };

        if let Some(feerate) = res.get("feerate").and_then(json_amount_sats) {
            return std::cmp::max(feerate as u64, MIN_FEE_RATE);
        }
        if let Some(errors) = res.get("errors") {
            log::warn!("estimatesmartfee returned no estimate: '{}'", errors);
        }
        MIN_FEE_RATE
    }

    fn list_unspent(
        &self,
        address: &str,
        minimum_amount: u64,
    ) -> Result<Vec<BtcTxout>, BitcoindError> {
        let res = self.make_request(
            "listunspent",
            &params!(
                Json::Number(serde_json::Number::from(LISTUNSPENT_MIN_CONF)),
                Json::Number(serde_json::Number::from(LISTUNSPENT_MAX_CONF)),
                Json::Array(vec![Json::String(address.to_string())]),
                Json::Bool(true), // include_unsafe
                serde_json::json!({ "minimumAmount": format_btc(minimum_amount) }),
            ),
        )?;

        let entries = res.as_array().ok_or_else(|| {
            BitcoindError::Custom("'listunspent' didn't return an array".to_string())
        })?;
        let mut utxos = Vec::with_capacity(entries.len());
        for entry in entries {
            let txid = entry
                .get("txid")
                .and_then(Json::as_str)
                .ok_or_else(|| {
                    BitcoindError::Custom("No 'txid' in 'listunspent' entry".to_string())
                })?
                .to_string();
            let vout = entry.get("vout").and_then(Json::as_u64).ok_or_else(|| {
                BitcoindError::Custom("No 'vout' in 'listunspent' entry".to_string())
            })? as u32;
            let amount = entry
                .get("amount")
                .and_then(json_amount_sats)
                .ok_or_else(|| {
                    BitcoindError::Custom("No 'amount' in 'listunspent' entry".to_string())
                })? as u64;
            utxos.push(BtcTxout { txid, vout, amount });
        }

        Ok(utxos)
    }

    fn get_transaction(&self, txid: &str) -> Result<Json, BitcoindError> {
        self.make_request("gettransaction", &params!(Json::String(txid.to_string())))
    }

    fn get_block(&self, block_hash: &str, verbosity: u8) -> Result<Json, BitcoindError> {
        self.make_request(
            "getblock",
            &params!(
                Json::String(block_hash.to_string()),
                Json::Number(serde_json::Number::from(verbosity)),
            ),
        )
    }

    fn send_raw_transaction(&self, tx_hex: &str) -> Result<(), BitcoindError> {
        log::debug!("Broadcasting '{}'", tx_hex);
        match self.make_request(
            "sendrawtransaction",
            &params!(Json::String(tx_hex.to_string())),
        ) {
            Ok(_) => Ok(()),
            Err(e) if e.is_already_in_chain() => {
                log::debug!("Transaction already in chain, treating as success");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn combine_psbt(&self, psbts: &[String]) -> Result<String, BitcoindError> {
        let psbts_json = Json::Array(psbts.iter().cloned().map(Json::String).collect());
        let res = self.make_request("combinepsbt", &params!(psbts_json))?;
        res.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BitcoindError::Custom("'combinepsbt' didn't return a string".to_string()))
    }

    fn finalize_psbt(&self, psbt: &str) -> Result<FinalizedPsbt, BitcoindError> {
        let res = self.make_request("finalizepsbt", &params!(Json::String(psbt.to_string())))?;
        let complete = res.get("complete").and_then(Json::as_bool).ok_or_else(|| {
            BitcoindError::Custom("No 'complete' in 'finalizepsbt' result".to_string())
        })?;
        let hex = res
            .get("hex")
            .and_then(Json::as_str)
            .map(|s| s.to_string());
        Ok(FinalizedPsbt { complete, hex })
    }

    fn wallet_process_psbt(&self, psbt: &str) -> Result<ProcessedPsbt, BitcoindError> {
        let res =
            self.make_request("walletprocesspsbt", &params!(Json::String(psbt.to_string())))?;
        let complete = res.get("complete").and_then(Json::as_bool).ok_or_else(|| {
            BitcoindError::Custom("No 'complete' in 'walletprocesspsbt' result".to_string())
        })?;
        let psbt = res
            .get("psbt")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                BitcoindError::Custom("No 'psbt' in 'walletprocesspsbt' result".to_string())
            })?
            .to_string();
        Ok(ProcessedPsbt { complete, psbt })
    }

    fn sign_raw_transaction_with_wallet(
        &self,
        tx_hex: &str,
    ) -> Result<SignedRawTx, BitcoindError> {
        let res = self.make_request(
            "signrawtransactionwithwallet",
            &params!(Json::String(tx_hex.to_string())),
        )?;
        let complete = res.get("complete").and_then(Json::as_bool).ok_or_else(|| {
            BitcoindError::Custom(
                "No 'complete' in 'signrawtransactionwithwallet' result".to_string(),
            )
        })?;
        let hex = res
            .get("hex")
            .and_then(Json::as_str)
            .ok_or_else(|| {
                BitcoindError::Custom(
                    "No 'hex' in 'signrawtransactionwithwallet' result".to_string(),
                )
            })?
            .to_string();
        Ok(SignedRawTx { complete, hex })
    }

    fn add_multisig_address(
        &self,
        nrequired: u32,
        pubkeys: &[String],
    ) -> Result<Json, BitcoindError> {
        let keys = Json::Array(pubkeys.iter().cloned().map(Json::String).collect());
        self.make_request(
            "addmultisigaddress",
            &params!(
                Json::Number(serde_json::Number::from(nrequired)),
                keys,
                Json::Null, // label
                Json::String("p2sh-segwit".to_string()),
            ),
        )
    }

    fn create_multisig(&self, nrequired: u32, pubkeys: &[String]) -> Result<Json, BitcoindError> {
        let keys = Json::Array(pubkeys.iter().cloned().map(Json::String).collect());
        self.make_request(
            "createmultisig",
            &params!(
                Json::Number(serde_json::Number::from(nrequired)),
                keys,
                Json::String("p2sh-segwit".to_string()),
            ),
        )
    }

    fn create_psbt(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError> {
        let res = self.make_request(
            "createpsbt",
            &params!(inputs_json(inputs), outputs_json(outputs)),
        )?;
        res.as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| BitcoindError::Custom("'createpsbt' didn't return a string".to_string()))
    }

    fn create_raw_transaction(
        &self,
        inputs: &[BtcTxout],
        outputs: &BTreeMap<String, u64>,
    ) -> Result<String, BitcoindError> {
        let res = self.make_request(
            "createrawtransaction",
            &params!(inputs_json(inputs), outputs_json(outputs)),
        )?;
        res.as_str().map(|s| s.to_string()).ok_or_else(|| {
            BitcoindError::Custom("'createrawtransaction' didn't return a string".to_string())
        })
    }

    fn import_address(&self, address_or_script: &str) -> Result<(), BitcoindError> {
        self.make_request(
            "importaddress",
            &params!(Json::String(address_or_script.to_string())),
        )
        .map(|_| ())
    }

    fn wallet_passphrase(&self, passphrase: &str, timeout: u32) -> bool {
        match self.make_request(
            "walletpassphrase",
            &params!(
                Json::String(passphrase.to_string()),
                Json::Number(serde_json::Number::from(timeout)),
            ),
        ) {
            Ok(_) => true,
            Err(e) => {
                // Note the request body with the passphrase is never logged
                log::warn!("Bitcoin RPC call walletpassphrase failed: '{}'", e);
                false
            }
        }
    }

    fn load_wallet(&self, name: &str) -> Result<(), BitcoindError> {
        let res = self.make_request("loadwallet", &params!(Json::String(name.to_string())))?;
        if let Some(warning) = res.get("warning").and_then(Json::as_str) {
            if !warning.is_empty() {
                log::warn!("loadwallet '{}' warning: '{}'", name, warning);
            }
        }
        Ok(())
    }

    fn unload_wallet(&self, name: &str) -> Result<(), BitcoindError> {
        let res = self.make_request("unloadwallet", &params!(Json::String(name.to_string())))?;
        if let Some(warning) = res.get("warning").and_then(Json::as_str) {
            if !warning.is_empty() {
                log::warn!("unloadwallet '{}' warning: '{}'", name, warning);
            }
        }
        Ok(())
    }

    fn get_blockchain_info(&self) -> Result<Json, BitcoindError> {
        self.make_request("getblockchaininfo", &[])
    }
}

fn inputs_json(inputs: &[BtcTxout]) -> Json {
    Json::Array(
        inputs
            .iter()
            .map(|input| serde_json::json!({ "txid": input.txid, "vout": input.vout }))
            .collect(),
    )
}

// One single-entry object per output. The BTreeMap fixes the output order to
// the address sort order, which every signer must reproduce.
fn outputs_json(outputs: &BTreeMap<String, u64>) -> Json {
    Json::Array(
        outputs
            .iter()
            .map(|(address, amount)| serde_json::json!({ address: format_btc(*amount) }))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_param_shapes() {
        let inputs = vec![
            BtcTxout {
                txid: "ff".repeat(32),
                vout: 1,
                amount: 1_000_000,
            },
            BtcTxout {
                txid: "ee".repeat(32),
                vout: 0,
                amount: 2_000_000,
            },
        ];
        let ins = inputs_json(&inputs);
        assert_eq!(ins[0]["txid"], "ff".repeat(32));
        assert_eq!(ins[0]["vout"], 1);
        assert_eq!(ins[1]["vout"], 0);

        let mut outputs = BTreeMap::new();
        outputs.insert("mzzz".to_string(), 300_000u64);
        outputs.insert("maaa".to_string(), 699_000u64);
        let outs = outputs_json(&outputs);
        // Address-sorted, decimal strings with 8 places
        assert_eq!(outs[0]["maaa"], "0.00699000");
        assert_eq!(outs[1]["mzzz"], "0.00300000");
    }
}
