//! The signing side of the federation: produce our partial signature for
//! every open sidechain transaction, and broadcast the ones whose collected
//! partials satisfy the threshold.
//!
//! Two encoding regimes coexist, picked by the linked object's type. Deposit
//! confirmations are PSBTs, because the spent coin sits on an imported
//! per-user address only the node wallet can sign for. Everything else spends
//! a vault and is a standalone transaction we endorse locally with our
//! sidechain key against the weighted witness script.

use std::collections::BTreeMap;

use bitcoin::consensus::encode;
use bitcoin::hashes::hex::FromHex;
use bitcoin::Transaction;

use crate::bitcoind::interface::{BitcoinRpc, WALLET_UNLOCK_SECONDS};
use crate::hostchain::{
    HostChainSubmit, HostChainView, HostOperation, ObjectId, SidechainTx, Signer, SignerId,
};
use crate::scripts;
use crate::sidechaind::SidechainD;
use crate::transactions::{decode_partial_sigs, encode_partial_sigs, TxPayload};

// Deposit confirmations need the node wallet, everything else spends a vault
fn uses_psbt(object_id: ObjectId) -> bool {
    matches!(object_id, ObjectId::Deposit(_))
}

// The wallet is unlocked right before a signing call and relocks itself a few
// seconds later, it is never left open across idle periods.
pub(crate) fn maybe_unlock_wallet(d: &SidechainD, rpc: &dyn BitcoinRpc) {
    if let Some(ref password) = d.wallet_password {
        if !rpc.wallet_passphrase(password, WALLET_UNLOCK_SECONDS) {
            log::warn!("Could not unlock the node wallet");
        }
    }
}

fn sign_transaction_psbt(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    stx: &SidechainTx,
) -> Option<String> {
    if stx.transaction.is_empty() {
        log::error!("Signing failed, empty psbt on {}", stx.stx_id);
        return None;
    }

    maybe_unlock_wallet(d, rpc);
    let processed = match rpc.wallet_process_psbt(&stx.transaction) {
        Ok(processed) => processed,
        Err(e) => {
            log::error!("Error processing psbt for {}: '{}'", stx.stx_id, e);
            return None;
        }
    };

    if !processed.complete {
        // See whether the already-collected partials get us there
        let mut psbts: Vec<String> = stx
            .signatures
            .values()
            .filter(|partial| !partial.is_empty())
            .cloned()
            .collect();
        psbts.push(processed.psbt.clone());

        if let Ok(combined) = rpc.combine_psbt(&psbts) {
            match rpc.finalize_psbt(&combined) {
                Ok(finalized) if finalized.complete => {
                    log::debug!("{} is complete with our contribution", stx.stx_id)
                }
                _ => {}
            }
        }
    }

    Some(processed.psbt)
}

fn sign_transaction_standalone(d: &SidechainD, stx: &SidechainTx, our: &Signer) -> Option<String> {
    let privkey = match d.private_key(&our.sidechain_pubkey) {
        Some(privkey) => privkey,
        None => {
            log::error!("No private key for '{}'", our.sidechain_pubkey);
            return None;
        }
    };

    let (tx, in_amounts) = match TxPayload::decode(&stx.transaction) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::error!("Error decoding {} payload: '{}'", stx.stx_id, e);
            return None;
        }
    };
    let witness_script = match scripts::multisig_witness_script(&stx.signers) {
        Ok(script) => script,
        Err(e) => {
            log::error!("Error rebuilding {} witness script: '{}'", stx.stx_id, e);
            return None;
        }
    };

    match scripts::endorse_transaction(&tx, &witness_script, &in_amounts, privkey) {
        Ok(endorsements) => Some(encode_partial_sigs(&endorsements)),
        Err(e) => {
            log::error!("Error endorsing {}: '{}'", stx.stx_id, e);
            None
        }
    }
}

/// Let the node wallet sign a raw transaction. The fallback regime: no linked
/// object selects it, but an operator can drive it by hand against a stuck
/// transaction.
pub fn sign_transaction_raw(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    tx_hex: &str,
) -> Option<String> {
    if tx_hex.is_empty() {
        log::error!("Signing failed, empty raw transaction");
        return None;
    }

    maybe_unlock_wallet(d, rpc);
    match rpc.sign_raw_transaction_with_wallet(tx_hex) {
        Ok(signed) => Some(signed.hex),
        Err(e) => {
            log::error!("Error signing raw transaction: '{}'", e);
            None
        }
    }
}

/// Produce and publish our partial for every sidechain transaction we are a
/// snapshot signer of and have not signed yet. A signing failure publishes
/// nothing: with too few successful signers the object eventually expires.
pub fn process_sidechain_transactions(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    for stx in view.sidechain_txs() {
        if stx.complete || stx.bitcoin_txid.is_some() {
            continue;
        }
        let our = match d.snapshot_signer(&stx.signers) {
            Some(signer) => signer,
            None => continue,
        };
        if stx.signatures.contains_key(&our.signer_id) {
            // Already contributed; re-submitting would be a no-op anyway
            continue;
        }

        let partial = if uses_psbt(stx.object_id) {
            sign_transaction_psbt(d, rpc, &stx)
        } else {
            sign_transaction_standalone(d, &stx, &our)
        };
        let partial = match partial {
            Some(partial) => partial,
            None => continue,
        };

        log::info!("Publishing our partial for {}", stx.stx_id);
        if let Err(e) = submit.submit(HostOperation::SidechainTxSign {
            payer: our.account,
            stx_id: stx.stx_id,
            partials: vec![partial],
        }) {
            log::error!("Error submitting partial for {}: '{}'", stx.stx_id, e);
        }
    }
}

fn send_transaction_standalone(rpc: &dyn BitcoinRpc, stx: &SidechainTx) -> Option<String> {
    let (mut tx, _) = match TxPayload::decode(&stx.transaction) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::error!("Error decoding {} payload: '{}'", stx.stx_id, e);
            return None;
        }
    };
    let witness_script = match scripts::multisig_witness_script(&stx.signers) {
        Ok(script) => script,
        Err(e) => {
            log::error!("Error rebuilding {} witness script: '{}'", stx.stx_id, e);
            return None;
        }
    };

    let mut endorsements: BTreeMap<SignerId, Vec<Vec<u8>>> = BTreeMap::new();
    for (signer_id, partial) in &stx.signatures {
        match decode_partial_sigs(partial) {
            Ok(sigs) => {
                endorsements.insert(*signer_id, sigs);
            }
            Err(e) => {
                log::warn!(
                    "Undecodable partial from {} on {}: '{}'",
                    signer_id,
                    stx.stx_id,
                    e
                );
            }
        }
    }
    let contributed: Vec<SignerId> = endorsements.keys().copied().collect();
    if !scripts::endorsements_sufficient(&stx.signers, &contributed) {
        log::debug!("{} does not have enough weight yet", stx.stx_id);
        return None;
    }

    scripts::finalize_transaction(&mut tx, &witness_script, &stx.signers, &endorsements);
    let tx_hex = encode::serialize_hex(&tx);
    match rpc.send_raw_transaction(&tx_hex) {
        Ok(()) => Some(tx.txid().to_string()),
        Err(e) => {
            log::error!("Error broadcasting {}: '{}'", stx.stx_id, e);
            None
        }
    }
}

fn send_transaction_psbt(rpc: &dyn BitcoinRpc, stx: &SidechainTx) -> Option<String> {
    let psbts: Vec<String> = stx
        .signatures
        .values()
        .filter(|partial| !partial.is_empty())
        .cloned()
        .collect();
    if psbts.is_empty() {
        return None;
    }

    let combined = match rpc.combine_psbt(&psbts) {
        Ok(combined) => combined,
        Err(e) => {
            log::error!("Error combining psbts of {}: '{}'", stx.stx_id, e);
            return None;
        }
    };
    let finalized = match rpc.finalize_psbt(&combined) {
        Ok(finalized) => finalized,
        Err(e) => {
            log::error!("Error finalizing psbt of {}: '{}'", stx.stx_id, e);
            return None;
        }
    };
    if !finalized.complete {
        log::debug!("{} psbt is not complete yet", stx.stx_id);
        return None;
    }
    let tx_hex = finalized.hex?;

    let txid = Vec::<u8>::from_hex(&tx_hex)
        .ok()
        .and_then(|bytes| encode::deserialize::<Transaction>(&bytes).ok())
        .map(|tx| tx.txid().to_string());
    let txid = match txid {
        Some(txid) => txid,
        None => {
            log::error!("The node finalized {} to a garbled transaction", stx.stx_id);
            return None;
        }
    };

    match rpc.send_raw_transaction(&tx_hex) {
        Ok(()) => Some(txid),
        Err(e) => {
            log::error!("Error broadcasting {}: '{}'", stx.stx_id, e);
            None
        }
    }
}

/// Broadcast every sidechain transaction whose partials suffice, and record
/// the Bitcoin txid on the host chain
pub fn send_sidechain_transactions(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    for stx in view.sidechain_txs() {
        if !stx.complete || stx.bitcoin_txid.is_some() {
            continue;
        }
        let our = match d.snapshot_signer(&stx.signers) {
            Some(signer) => signer,
            None => continue,
        };

        let txid = if uses_psbt(stx.object_id) {
            send_transaction_psbt(rpc, &stx)
        } else {
            send_transaction_standalone(rpc, &stx)
        };
        let txid = match txid {
            Some(txid) => txid,
            None => continue,
        };

        log::info!("Broadcast {} as bitcoin tx '{}'", stx.stx_id, txid);
        if let Err(e) = submit.submit(HostOperation::SidechainTxProcess {
            payer: our.account,
            stx_id: stx.stx_id,
            bitcoin_txid: txid,
        }) {
            log::error!("Error recording broadcast of {}: '{}'", stx.stx_id, e);
        }
    }
}
