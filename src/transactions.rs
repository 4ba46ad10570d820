//! Building and encoding of the unsigned Bitcoin transactions the federation
//! agrees on.
//!
//! Standalone transactions travel on the host chain as a JSON payload carrying
//! the consensus-serialized transaction and the satoshi amount of each spent
//! input (needed for the segwit sighash). Partials for them are JSON arrays of
//! hex endorsements, one per input.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::{
    consensus::encode,
    hashes::hex::{FromHex, ToHex},
    Address, OutPoint, Script, Transaction, TxIn, TxOut, Txid,
};
use serde::{Deserialize, Serialize};

use crate::bitcoind::interface::BtcTxout;

#[derive(Debug)]
pub enum TransactionError {
    /// Malformed persisted payload
    Payload(String),
    /// A txid or address did not parse
    Invalid(String),
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TransactionError::Payload(e) => write!(f, "Invalid transaction payload: {}", e),
            TransactionError::Invalid(e) => write!(f, "Invalid transaction field: {}", e),
        }
    }
}

impl std::error::Error for TransactionError {}

/// The persisted form of a standalone unsigned transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxPayload {
    pub tx_hex: String,
    /// Satoshis of each spent input, as decimal strings
    pub in_amounts: Vec<String>,
}

impl TxPayload {
    pub fn encode(tx: &Transaction, in_amounts: &[u64]) -> String {
        let payload = TxPayload {
            tx_hex: encode::serialize_hex(tx),
            in_amounts: in_amounts.iter().map(|a| a.to_string()).collect(),
        };
        serde_json::to_string(&payload).expect("A TxPayload always serializes")
    }

    pub fn decode(payload: &str) -> Result<(Transaction, Vec<u64>), TransactionError> {
        let payload: TxPayload = serde_json::from_str(payload)
            .map_err(|e| TransactionError::Payload(e.to_string()))?;
        let tx_bytes = Vec::<u8>::from_hex(&payload.tx_hex)
            .map_err(|e| TransactionError::Payload(format!("tx_hex: {}", e)))?;
        let tx: Transaction = encode::deserialize(&tx_bytes)
            .map_err(|e| TransactionError::Payload(format!("tx_hex: {}", e)))?;
        let in_amounts = payload
            .in_amounts
            .iter()
            .map(|a| {
                a.parse()
                    .map_err(|e| TransactionError::Payload(format!("in_amounts: {}", e)))
            })
            .collect::<Result<Vec<u64>, _>>()?;
        if in_amounts.len() != tx.input.len() {
            return Err(TransactionError::Payload(format!(
                "{} in_amounts for {} inputs",
                in_amounts.len(),
                tx.input.len()
            )));
        }
        Ok((tx, in_amounts))
    }
}

/// Build the version-2 unsigned transaction every signer must reproduce
/// byte-for-byte: inputs in the given order, outputs in address order.
pub fn build_unsigned_transaction(
    inputs: &[BtcTxout],
    outputs: &BTreeMap<String, u64>,
) -> Result<(Transaction, Vec<u64>), TransactionError> {
    let mut txin = Vec::with_capacity(inputs.len());
    let mut in_amounts = Vec::with_capacity(inputs.len());
    for input in inputs {
        let txid = Txid::from_hex(&input.txid)
            .map_err(|e| TransactionError::Invalid(format!("txid '{}': {}", input.txid, e)))?;
        txin.push(TxIn {
            previous_output: OutPoint {
                txid,
                vout: input.vout,
            },
            script_sig: Script::new(),
            sequence: u32::MAX,
            witness: vec![],
        });
        in_amounts.push(input.amount);
    }

    let mut txout = Vec::with_capacity(outputs.len());
    for (address, value) in outputs {
        let address = Address::from_str(address)
            .map_err(|e| TransactionError::Invalid(format!("address '{}': {}", address, e)))?;
        txout.push(TxOut {
            value: *value,
            script_pubkey: address.script_pubkey(),
        });
    }

    Ok((
        Transaction {
            version: 2,
            lock_time: 0,
            input: txin,
            output: txout,
        },
        in_amounts,
    ))
}

/// Encode one signer's per-input endorsements as the partial payload
pub fn encode_partial_sigs(endorsements: &[Vec<u8>]) -> String {
    let hex: Vec<String> = endorsements.iter().map(|sig| sig.to_hex()).collect();
    serde_json::to_string(&hex).expect("A string vec always serializes")
}

/// Decode a partial payload back to per-input endorsements
pub fn decode_partial_sigs(payload: &str) -> Result<Vec<Vec<u8>>, TransactionError> {
    let hex: Vec<String> = serde_json::from_str(payload)
        .map_err(|e| TransactionError::Payload(e.to_string()))?;
    hex.iter()
        .map(|sig| {
            Vec::<u8>::from_hex(sig).map_err(|e| TransactionError::Payload(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txo(txid_byte: &str, vout: u32, amount: u64) -> BtcTxout {
        BtcTxout {
            txid: txid_byte.repeat(32),
            vout,
            amount,
        }
    }

    #[test]
    fn unsigned_transaction_shape() {
        let inputs = vec![txo("aa", 0, 1_500_000), txo("bb", 3, 1_000_000)];
        let mut outputs = BTreeMap::new();
        // Note insertion order is not address order
        outputs.insert("mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef".to_string(), 300_000);
        outputs.insert("mkHS9ne12qx9pS9VojpwU5xtRd4T7X7ZUt".to_string(), 2_199_000);

        let (tx, in_amounts) = build_unsigned_transaction(&inputs, &outputs).unwrap();
        assert_eq!(tx.version, 2);
        assert_eq!(tx.lock_time, 0);
        assert_eq!(in_amounts, vec![1_500_000, 1_000_000]);

        // Inputs keep their order, sequence is final
        assert_eq!(tx.input.len(), 2);
        assert_eq!(tx.input[0].previous_output.vout, 0);
        assert_eq!(tx.input[1].previous_output.vout, 3);
        assert!(tx.input.iter().all(|i| i.sequence == u32::MAX));

        // Outputs are in address sort order: mk... before mz...
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value, 2_199_000);
        assert_eq!(tx.output[1].value, 300_000);

        // A bad address is refused
        let mut bad = BTreeMap::new();
        bad.insert("not-an-address".to_string(), 1000u64);
        assert!(build_unsigned_transaction(&inputs, &bad).is_err());
    }

    #[test]
    fn payload_round_trip() {
        let inputs = vec![txo("aa", 1, 700_000)];
        let mut outputs = BTreeMap::new();
        outputs.insert("mkHS9ne12qx9pS9VojpwU5xtRd4T7X7ZUt".to_string(), 699_000);
        let (tx, in_amounts) = build_unsigned_transaction(&inputs, &outputs).unwrap();

        let payload = TxPayload::encode(&tx, &in_amounts);
        // The wire form carries amounts as decimal strings
        assert!(payload.contains(r#""in_amounts":["700000"]"#), "{}", payload);

        let (decoded, decoded_amounts) = TxPayload::decode(&payload).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded_amounts, in_amounts);

        // Same inputs, same payload: the string is the agreement unit
        assert_eq!(payload, TxPayload::encode(&tx, &in_amounts));
    }

    #[test]
    fn payload_rejects_garbage() {
        assert!(TxPayload::decode("").is_err());
        assert!(TxPayload::decode(r#"{"tx_hex":"zz","in_amounts":[]}"#).is_err());
        // Amount count must match the input count
        let inputs = vec![txo("aa", 0, 1000)];
        let (tx, _) = build_unsigned_transaction(&inputs, &BTreeMap::new()).unwrap();
        let payload = format!(
            r#"{{"tx_hex":"{}","in_amounts":[]}}"#,
            encode::serialize_hex(&tx)
        );
        assert!(TxPayload::decode(&payload).is_err());
    }

    #[test]
    fn partial_sigs_round_trip() {
        let sigs = vec![vec![0x30, 0x45, 0x01], vec![0x30, 0x44, 0x01]];
        let payload = encode_partial_sigs(&sigs);
        assert_eq!(payload, r#"["304501","304401"]"#);
        assert_eq!(decode_partial_sigs(&payload).unwrap(), sigs);
        assert!(decode_partial_sigs("not json").is_err());
        assert!(decode_partial_sigs(r#"["zz"]"#).is_err());
    }
}
