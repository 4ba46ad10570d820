//! The chain watcher: turns `hashblock` notifications into sidechain events.
//!
//! On each notified block we fetch it fully decoded from the node, scan every
//! output against the host chain's deposit-address index and report a
//! [SidechainEvent] per match. Replays are harmless: events are keyed by
//! `bitcoin-<txid>-<vout>` and de-duplicated downstream.

use serde_json::Value as Json;

use crate::bitcoind::interface::BitcoinRpc;
use crate::bitcoind::json_amount_sats;
use crate::hostchain::{deposit_uid, HostChainSubmit, HostChainView, SidechainEvent};

/// An output paying some address, as found in a decoded block
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPayment {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
}

/// Every `(address, output)` pair of a verbosity-2 `getblock` result. Outputs
/// without an `addresses` list (opreturns, bare scripts) are skipped.
pub fn extract_block_payments(block: &Json) -> Vec<BlockPayment> {
    let mut payments = Vec::new();

    let txs = match block.get("tx").and_then(Json::as_array) {
        Some(txs) => txs,
        None => return payments,
    };
    for tx in txs {
        let txid = match tx.get("txid").and_then(Json::as_str) {
            Some(txid) => txid,
            None => continue,
        };
        let vouts = match tx.get("vout").and_then(Json::as_array) {
            Some(vouts) => vouts,
            None => continue,
        };

        for vout in vouts {
            let addresses = match vout
                .get("scriptPubKey")
                .and_then(|script| script.get("addresses"))
                .and_then(Json::as_array)
            {
                Some(addresses) => addresses,
                None => continue,
            };
            let amount = match vout.get("value").and_then(json_amount_sats) {
                Some(amount) => amount as u64,
                None => continue,
            };
            let n = match vout.get("n").and_then(Json::as_u64) {
                Some(n) => n as u32,
                None => continue,
            };

            for address in addresses.iter().filter_map(Json::as_str) {
                payments.push(BlockPayment {
                    txid: txid.to_string(),
                    vout: n,
                    address: address.to_string(),
                    amount,
                });
            }
        }
    }

    payments
}

/// Handle one block notification end to end. Any node failure is logged and
/// dropped: the deposits will be picked up when a later block is handled or
/// the node comes back.
pub fn handle_block_event(
    block_hash: &str,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    let block = match rpc.get_block(block_hash, 2) {
        Ok(block) => block,
        Err(e) => {
            log::warn!("Error fetching block '{}': '{}'", block_hash, e);
            return;
        }
    };

    for payment in extract_block_payments(&block) {
        if !view.is_tracked_deposit_address(&payment.address) {
            continue;
        }

        let uid = deposit_uid(&payment.txid, payment.vout);
        log::info!(
            "Deposit of {} sats to '{}' ({})",
            payment.amount,
            payment.address,
            uid
        );
        let event = SidechainEvent {
            timestamp: view.head_block_time(),
            block_num: view.head_block_num(),
            uid,
            txid: payment.txid,
            vout: payment.vout,
            address: payment.address,
            amount: payment.amount,
        };
        if let Err(e) = submit.sidechain_event(event) {
            log::error!("Error recording sidechain event: '{}'", e);
        }
    }
}
