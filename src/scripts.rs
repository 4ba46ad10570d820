//! The weighted threshold multisig the federation custodies funds with.
//!
//! For the ordered signer list `[(P1,w1)..(Pn,wn)]` the witness script
//! evaluates each signature in turn and accumulates the weight of the valid
//! ones, then compares against `2W/3`:
//!
//! ```text
//! P1 CHECKSIG IF <w1> ELSE 0 ENDIF
//! SWAP P2 CHECKSIG IF <w2> ADD ENDIF
//! ...
//! SWAP Pn CHECKSIG IF <wn> ADD ENDIF
//! <2W/3> GREATERTHANOREQUAL
//! ```
//!
//! The vault address is the P2SH-P2WSH wrapping of that script. Every signer
//! must derive the exact same bytes, so nothing here may depend on anything
//! but the ordered signer set.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bitcoin::{
    blockdata::{opcodes, script::Builder},
    hashes::{hex::ToHex, sha256, Hash},
    secp256k1::{Message, Secp256k1, SecretKey},
    util::bip143::SigHashCache,
    Address, Network, PublicKey, Script, SigHashType, Transaction,
};

use crate::hostchain::{threshold_weight, total_weight, Signer, SignerId, VaultAddress};

#[derive(Debug)]
pub enum ScriptError {
    /// A signer public key or our private key did not parse
    Key(String),
    /// The payload does not carry one amount per input
    InputMismatch { inputs: usize, amounts: usize },
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ScriptError::Key(e) => write!(f, "Invalid key: {}", e),
            ScriptError::InputMismatch { inputs, amounts } => write!(
                f,
                "Transaction has {} inputs but {} input amounts",
                inputs, amounts
            ),
        }
    }
}

impl std::error::Error for ScriptError {}

// Script-number push: 1..15 get their dedicated opcode, anything bigger is a
// little-endian data push with a zero pad when the top bit would flip the sign.
fn push_script_num(builder: Builder, val: u32) -> Builder {
    if val < 16 {
        return builder.push_int(val as i64);
    }

    let mut data = Vec::with_capacity(2);
    let mut val = val;
    while val > 0 {
        data.push((val & 0xff) as u8);
        val >>= 8;
    }
    if data.last().map(|byte| byte & 0x80 != 0) == Some(true) {
        data.push(0);
    }
    builder.push_slice(&data)
}

/// The witness script locking the vault of this ordered signer set
pub fn multisig_witness_script(signers: &[Signer]) -> Result<Script, ScriptError> {
    let mut builder = Builder::new();

    for (idx, signer) in signers.iter().enumerate() {
        let key = PublicKey::from_str(&signer.sidechain_pubkey)
            .map_err(|e| ScriptError::Key(format!("'{}': {}", signer.sidechain_pubkey, e)))?;

        builder = builder
            .push_key(&key)
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_IF);
        builder = push_script_num(builder, signer.weight as u32);
        if idx == 0 {
            builder = builder
                .push_opcode(opcodes::all::OP_ELSE)
                .push_opcode(opcodes::all::OP_PUSHBYTES_0)
                .push_opcode(opcodes::all::OP_ENDIF);
        } else {
            builder = builder
                .push_opcode(opcodes::all::OP_ADD)
                .push_opcode(opcodes::all::OP_ENDIF);
        }

        if idx < signers.len() - 1 {
            builder = builder.push_opcode(opcodes::all::OP_SWAP);
        }
    }

    builder = push_script_num(builder, total_weight(signers) * 2 / 3);
    Ok(builder
        .push_opcode(opcodes::all::OP_GREATERTHANOREQUAL)
        .into_script())
}

/// The `OP_0 <sha256(witness_script)>` redeem script of the P2SH-P2WSH vault
pub fn redeem_script(witness_script: &Script) -> Script {
    let script_hash = sha256::Hash::hash(witness_script.as_bytes());
    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&script_hash[..])
        .into_script()
}

/// Derive the vault address of an ordered signer set, as persisted on the
/// host chain: the base58 P2SH address plus the witness script hex
pub fn vault_address(signers: &[Signer], network: Network) -> Result<VaultAddress, ScriptError> {
    let witness_script = multisig_witness_script(signers)?;
    let address = Address::p2sh(&redeem_script(&witness_script), network);

    Ok(VaultAddress {
        address: address.to_string(),
        redeem_script: witness_script.as_bytes().to_hex(),
    })
}

/// One BIP-143 `SIGHASH_ALL` endorsement per input, DER with the sighash byte
/// appended, computed against the witness script and each input's amount
pub fn endorse_transaction(
    tx: &Transaction,
    witness_script: &Script,
    in_amounts: &[u64],
    privkey_hex: &str,
) -> Result<Vec<Vec<u8>>, ScriptError> {
    if tx.input.len() != in_amounts.len() {
        return Err(ScriptError::InputMismatch {
            inputs: tx.input.len(),
            amounts: in_amounts.len(),
        });
    }
    let secp = Secp256k1::new();
    let privkey =
        SecretKey::from_str(privkey_hex).map_err(|e| ScriptError::Key(e.to_string()))?;

    let mut cache = SigHashCache::new(tx);
    let mut endorsements = Vec::with_capacity(in_amounts.len());
    for (idx, amount) in in_amounts.iter().enumerate() {
        let sighash = cache.signature_hash(idx, witness_script, *amount, SigHashType::All);
        let message =
            Message::from_slice(&sighash[..]).expect("A sighash is always 32 bytes");
        let mut endorsement = secp.sign(&message, &privkey).serialize_der().to_vec();
        endorsement.push(SigHashType::All.as_u32() as u8);
        endorsements.push(endorsement);
    }

    Ok(endorsements)
}

/// Fill in the witnesses of a standalone transaction from the collected
/// endorsements.
///
/// The witness stack carries one slot per snapshot signer in reverse script
/// order (an empty push when the signer did not contribute), then the witness
/// script; the scriptSig pushes the redeem script.
pub fn finalize_transaction(
    tx: &mut Transaction,
    witness_script: &Script,
    signers: &[Signer],
    endorsements: &BTreeMap<SignerId, Vec<Vec<u8>>>,
) {
    let script_sig = Builder::new()
        .push_slice(redeem_script(witness_script).as_bytes())
        .into_script();

    for (input_idx, input) in tx.input.iter_mut().enumerate() {
        let mut witness: Vec<Vec<u8>> = Vec::with_capacity(signers.len() + 1);
        for signer in signers.iter().rev() {
            witness.push(
                endorsements
                    .get(&signer.signer_id)
                    .and_then(|sigs| sigs.get(input_idx))
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        witness.push(witness_script.as_bytes().to_vec());
        input.witness = witness;
        input.script_sig = script_sig.clone();
    }
}

/// Whether the contributing signers gathered enough weight to satisfy the
/// script threshold
pub fn endorsements_sufficient(signers: &[Signer], contributed: &[SignerId]) -> bool {
    let weight: u32 = signers
        .iter()
        .filter(|s| contributed.contains(&s.signer_id))
        .map(|s| s.weight as u32)
        .sum();
    weight >= threshold_weight(signers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{test_privkey, test_signers};
    use bitcoin::hashes::hex::FromHex;
    use bitcoin::{OutPoint, TxIn, TxOut, Txid};

    fn spending_tx(n_inputs: usize) -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            input: (0..n_inputs)
                .map(|i| TxIn {
                    previous_output: OutPoint {
                        txid: Txid::from_hex(&"11".repeat(32)).unwrap(),
                        vout: i as u32,
                    },
                    script_sig: Script::new(),
                    sequence: u32::MAX,
                    witness: vec![],
                })
                .collect(),
            output: vec![TxOut {
                value: 499_000,
                script_pubkey: Script::new(),
            }],
        }
    }

    #[test]
    fn witness_script_layout() {
        let signers = test_signers(3);
        let script = multisig_witness_script(&signers).unwrap();

        // Reassemble the expected bytes by hand
        let mut expected = Vec::new();
        for (idx, signer) in signers.iter().enumerate() {
            expected.push(0x21); // 33 byte key push
            expected.extend(Vec::<u8>::from_hex(&signer.sidechain_pubkey).unwrap());
            expected.extend(&[0xac, 0x63, 0x51]); // CHECKSIG IF OP_1
            if idx == 0 {
                expected.extend(&[0x67, 0x00, 0x68]); // ELSE 0 ENDIF
            } else {
                expected.extend(&[0x93, 0x68]); // ADD ENDIF
            }
            if idx < signers.len() - 1 {
                expected.push(0x7c); // SWAP
            }
        }
        expected.extend(&[0x52, 0xa2]); // OP_2 GREATERTHANOREQUAL

        assert_eq!(script.as_bytes(), expected.as_slice());
        // Determinism: same set, same bytes
        assert_eq!(
            multisig_witness_script(&signers).unwrap(),
            multisig_witness_script(&signers).unwrap()
        );
    }

    #[test]
    fn script_number_encoding() {
        let mut signers = test_signers(1);

        // 15 still has a small-number opcode
        signers[0].weight = 15;
        let script = multisig_witness_script(&signers).unwrap();
        // key push (34) + CHECKSIG IF, then OP_15
        assert_eq!(script.as_bytes()[36], 0x5f);

        // 16 is a one byte data push
        signers[0].weight = 16;
        let script = multisig_witness_script(&signers).unwrap();
        assert_eq!(&script.as_bytes()[36..38], &[0x01, 0x10]);

        // 128 needs the sign pad
        signers[0].weight = 128;
        let script = multisig_witness_script(&signers).unwrap();
        assert_eq!(&script.as_bytes()[36..39], &[0x02, 0x80, 0x00]);

        // 300 is a two byte little-endian push
        signers[0].weight = 300;
        let script = multisig_witness_script(&signers).unwrap();
        assert_eq!(&script.as_bytes()[36..39], &[0x02, 0x2c, 0x01]);
    }

    #[test]
    fn testnet_vault_address() {
        let signers = test_signers(3);
        let vault = vault_address(&signers, Network::Testnet).unwrap();

        // Testnet P2SH addresses start with a '2'
        assert!(vault.address.starts_with('2'), "got {}", vault.address);
        // The persisted redeem script field carries the witness script
        assert_eq!(
            vault.redeem_script,
            multisig_witness_script(&signers)
                .unwrap()
                .as_bytes()
                .to_hex()
        );

        // A different signer set derives a different address
        let other = vault_address(&test_signers(4), Network::Testnet).unwrap();
        assert_ne!(vault.address, other.address);

        // Mainnet version byte differs
        let mainnet = vault_address(&signers, Network::Bitcoin).unwrap();
        assert!(mainnet.address.starts_with('3'), "got {}", mainnet.address);
    }

    #[test]
    fn endorsements_verify() {
        let signers = test_signers(2);
        let witness_script = multisig_witness_script(&signers).unwrap();
        let tx = spending_tx(2);
        let in_amounts = [400_000, 100_000];

        let sigs = endorse_transaction(&tx, &witness_script, &in_amounts, &test_privkey(1))
            .expect("signing with a valid key");
        assert_eq!(sigs.len(), 2);

        let secp = Secp256k1::new();
        let pubkey = PublicKey::from_str(&signers[0].sidechain_pubkey).unwrap();
        let mut cache = SigHashCache::new(&tx);
        for (idx, sig) in sigs.iter().enumerate() {
            // DER signature with the SIGHASH_ALL byte appended
            assert_eq!(*sig.last().unwrap(), 0x01);
            let sighash =
                cache.signature_hash(idx, &witness_script, in_amounts[idx], SigHashType::All);
            let message = Message::from_slice(&sighash[..]).unwrap();
            let signature =
                bitcoin::secp256k1::Signature::from_der(&sig[..sig.len() - 1]).unwrap();
            secp.verify(&message, &signature, &pubkey.key)
                .expect("endorsement verifies against the signer key");
        }

        // One amount per input is required
        assert!(endorse_transaction(&tx, &witness_script, &[1], &test_privkey(1)).is_err());
    }

    #[test]
    fn witness_assembly() {
        let signers = test_signers(3);
        let witness_script = multisig_witness_script(&signers).unwrap();
        let mut tx = spending_tx(1);

        let mut endorsements = BTreeMap::new();
        for signer in &signers[..2] {
            let sigs = endorse_transaction(
                &tx,
                &witness_script,
                &[500_000],
                &test_privkey(signer.signer_id.0 as u8),
            )
            .unwrap();
            endorsements.insert(signer.signer_id, sigs);
        }

        finalize_transaction(&mut tx, &witness_script, &signers, &endorsements);

        let witness = &tx.input[0].witness;
        // One slot per signer in reverse order, then the witness script
        assert_eq!(witness.len(), 4);
        assert!(witness[0].is_empty(), "signer 3 did not contribute");
        assert_eq!(witness[1], endorsements[&signers[1].signer_id][0]);
        assert_eq!(witness[2], endorsements[&signers[0].signer_id][0]);
        assert_eq!(witness[3], witness_script.as_bytes());

        // scriptSig pushes the redeem script
        let redeem = redeem_script(&witness_script);
        let mut expected_script_sig = vec![redeem.as_bytes().len() as u8];
        expected_script_sig.extend(redeem.as_bytes());
        assert_eq!(tx.input[0].script_sig.as_bytes(), expected_script_sig.as_slice());
    }

    #[test]
    fn threshold_soundness() {
        let signers = test_signers(3);
        let one = [signers[0].signer_id];
        let two = [signers[0].signer_id, signers[2].signer_id];
        assert!(!endorsements_sufficient(&signers, &one));
        assert!(endorsements_sufficient(&signers, &two));

        // Weighted: one heavy signer can carry the quorum alone
        let mut weighted = test_signers(3);
        weighted[0].weight = 4;
        assert!(endorsements_sufficient(&weighted, &[weighted[0].signer_id]));
        assert!(!endorsements_sufficient(
            &weighted,
            &[weighted[1].signer_id, weighted[2].signer_id]
        ));
    }
}
