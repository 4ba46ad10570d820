//! The cross-signer agreement layer.
//!
//! For every observable (a fresh vault, a confirmed deposit, a withdrawal
//! request) the first signer to act files a proposal carrying the host-chain
//! operation; every other signer independently reconstructs the operation it
//! would have filed and approves only on bit-identical equality. A proposal
//! whose payload we cannot reproduce is simply not approved, whatever the
//! reason: fee estimator drift, node divergence, or a dishonest proposer.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::bitcoind::interface::{BitcoinRpc, FEE_ESTIMATE_CONF_TARGET, MIN_FEE_RATE};
use crate::bitcoind::json_amount_sats;
use crate::hostchain::{
    uid_vout, Deposit, DepositStatus, HostChainSubmit, HostChainView, HostOperation, ObjectId,
    Proposal, Signer, Withdrawal, WithdrawalStatus, SIDECHAIN,
};
use crate::scripts;
use crate::sidechaind::SidechainD;
use crate::transactions::TxPayload;
use crate::transactions::build_unsigned_transaction;

/// The fee applied to every transaction we build: the node estimate with the
/// relay floor
fn fee_rate(rpc: &dyn BitcoinRpc) -> u64 {
    std::cmp::max(rpc.estimate_fee_rate(FEE_ESTIMATE_CONF_TARGET), MIN_FEE_RATE)
}

/// When a proposal filed now runs out
pub fn proposal_expiration(view: &dyn HostChainView) -> u64 {
    view.head_block_time() + view.block_interval() * view.active_witness_count() * 3
}

/// File a proposal for `operation`, unless an open proposal already carries
/// it. Every signer runs the same triggers, so without this check each of
/// them would race to file the same agreement.
pub fn submit_proposal_once(
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
    proposer: &Signer,
    operation: HostOperation,
) -> bool {
    if view
        .proposals()
        .iter()
        .any(|p| p.operations.first() == Some(&operation))
    {
        return false;
    }

    match submit.propose(
        proposer.signer_id,
        vec![operation],
        proposal_expiration(view),
    ) {
        Ok(proposal_id) => {
            log::debug!("Filed {}", proposal_id);
            true
        }
        Err(e) => {
            log::error!("Error filing proposal: '{}'", e);
            false
        }
    }
}

/// Rebuild the sweep moving everything from the previous vault to the active
/// one, minus the fee. This is what rotation proposes and what peers must
/// reproduce to approve it.
pub fn create_sweep_transaction(
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
) -> Option<String> {
    let active = view.active_vault()?;
    let active_address = active.address?;
    let previous = view.previous_vault()?;
    let previous_address = previous.address?;

    if previous_address.address == active_address.address {
        log::warn!(
            "Previous and new vault addresses are the same, no funds moving needed [from {} to {}]",
            previous.vault_id,
            active.vault_id
        );
        return None;
    }

    let fee = fee_rate(rpc);
    let inputs = match rpc.list_unspent(&previous_address.address, 0) {
        Ok(inputs) => inputs,
        Err(e) => {
            log::error!("Error listing previous vault coins: '{}'", e);
            return None;
        }
    };
    if inputs.is_empty() {
        log::error!("Found no coin to sweep for '{}'", previous_address.address);
        return None;
    }
    let total: u64 = inputs.iter().map(|utxo| utxo.amount).sum();
    if fee >= total {
        log::error!(
            "Not enough funds on '{}' to pay for the sweep",
            previous_address.address
        );
        return None;
    }

    let mut outputs = BTreeMap::new();
    outputs.insert(active_address.address, total - fee);
    match build_unsigned_transaction(&inputs, &outputs) {
        Ok((tx, in_amounts)) => Some(TxPayload::encode(&tx, &in_amounts)),
        Err(e) => {
            log::error!("Error building sweep transaction: '{}'", e);
            None
        }
    }
}

/// Rebuild the PSBT moving a confirmed deposit from its per-user address to
/// the active vault, minus the fee. PSBT because the node wallet holds the
/// keys for imported deposit addresses and signs through `walletprocesspsbt`.
pub fn create_deposit_transaction(
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    deposit: &Deposit,
) -> Option<String> {
    let vault_address = view.active_vault()?.address?;
    let vout = match uid_vout(&deposit.uid) {
        Some(vout) => vout,
        None => {
            log::error!("Deposit '{}' has no vout in its uid", deposit.uid);
            return None;
        }
    };

    let fee = fee_rate(rpc);
    if fee >= deposit.amount {
        log::error!(
            "Deposit '{}' of {} sats cannot pay the {} sats fee",
            deposit.uid,
            deposit.amount,
            fee
        );
        return None;
    }

    let inputs = vec![crate::bitcoind::interface::BtcTxout {
        txid: deposit.txid.clone(),
        vout,
        amount: deposit.amount,
    }];
    let mut outputs = BTreeMap::new();
    outputs.insert(vault_address.address, deposit.amount - fee);

    match rpc.create_psbt(&inputs, &outputs) {
        Ok(psbt) => Some(psbt),
        Err(e) => {
            log::error!("Error creating deposit psbt: '{}'", e);
            None
        }
    }
}

/// Rebuild the payout spending the active vault: the withdrawn amount to the
/// destination, the change back to the vault, minus the fee.
pub fn create_withdrawal_transaction(
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    withdrawal: &Withdrawal,
) -> Option<String> {
    let vault_address = view.active_vault()?.address?;

    let fee = fee_rate(rpc);
    let inputs = match rpc.list_unspent(&vault_address.address, 0) {
        Ok(inputs) => inputs,
        Err(e) => {
            log::error!("Error listing vault coins: '{}'", e);
            return None;
        }
    };
    if inputs.is_empty() {
        log::error!("Found no coin to spend for '{}'", vault_address.address);
        return None;
    }
    let total: u64 = inputs.iter().map(|utxo| utxo.amount).sum();
    if withdrawal.amount + fee > total {
        log::error!(
            "Not enough funds on '{}' to withdraw {} sats",
            vault_address.address,
            withdrawal.amount
        );
        return None;
    }

    let mut outputs = BTreeMap::new();
    outputs.insert(withdrawal.destination.clone(), withdrawal.amount);
    let change = total - withdrawal.amount - fee;
    if change > 0 {
        outputs.insert(vault_address.address, change);
    }

    match build_unsigned_transaction(&inputs, &outputs) {
        Ok((tx, in_amounts)) => Some(TxPayload::encode(&tx, &in_amounts)),
        Err(e) => {
            log::error!("Error building withdrawal transaction: '{}'", e);
            None
        }
    }
}

/// Check a deposit record against the node's view of its funding transaction:
/// same txid, address, amount and vout, buried under enough confirmations.
pub fn deposit_matches_chain(
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    deposit: &Deposit,
) -> bool {
    let tx = match rpc.get_transaction(&deposit.txid) {
        Ok(tx) => tx,
        Err(e) => {
            log::warn!(
                "Error fetching deposit transaction '{}': '{}'",
                deposit.txid,
                e
            );
            return false;
        }
    };

    let txid = tx.get("txid").and_then(Json::as_str);
    let confirmations = tx.get("confirmations").and_then(Json::as_u64).unwrap_or(0);
    let detail = tx
        .get("details")
        .and_then(Json::as_array)
        .and_then(|details| details.first());
    let (address, amount, vout) = match detail {
        Some(detail) => (
            detail.get("address").and_then(Json::as_str),
            detail.get("amount").and_then(json_amount_sats),
            detail.get("vout").and_then(Json::as_u64),
        ),
        None => return false,
    };

    txid == Some(deposit.txid.as_str())
        && address == Some(deposit.address.as_str())
        && amount == Some(deposit.amount as i64)
        && vout.map(|v| v as u32) == uid_vout(&deposit.uid)
        && confirmations >= view.min_tx_confirmations()
}

/// Deterministic validation of a peer's proposal: recompute what we would
/// have proposed for the same observable and approve only on equality.
pub fn process_proposal(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    proposal: &Proposal,
) -> bool {
    log::info!("Proposal to process: {}", proposal.proposal_id);

    let should_approve = match proposal.operations.first() {
        Some(HostOperation::VaultUpdate {
            vault_id,
            sidechain,
            address_json,
            ..
        }) => {
            if sidechain != SIDECHAIN {
                false
            } else {
                match view.vault(*vault_id) {
                    Some(vault) => {
                        let active_signers = view.active_signers();
                        vault.signers == active_signers
                            && match scripts::vault_address(&active_signers, d.network) {
                                Ok(rebuilt) => rebuilt.to_json() == *address_json,
                                Err(e) => {
                                    log::error!("Error rebuilding vault address: '{}'", e);
                                    false
                                }
                            }
                    }
                    None => false,
                }
            }
        }

        Some(HostOperation::DepositProcess { deposit_id, .. }) => match view.deposit(*deposit_id)
        {
            Some(deposit) => deposit_matches_chain(rpc, view, &deposit),
            None => false,
        },

        Some(HostOperation::SidechainTxCreate {
            object_id,
            sidechain,
            transaction,
            ..
        }) => {
            if sidechain != SIDECHAIN || view.sidechain_tx_for(*object_id).is_some() {
                false
            } else {
                let rebuilt = match object_id {
                    ObjectId::Vault(vault_id) => view
                        .vault(*vault_id)
                        .and_then(|_| create_sweep_transaction(rpc, view)),
                    ObjectId::Deposit(deposit_id) => view
                        .deposit(*deposit_id)
                        .and_then(|deposit| create_deposit_transaction(rpc, view, &deposit)),
                    ObjectId::Withdrawal(withdraw_id) => {
                        view.withdrawal(*withdraw_id).and_then(|withdrawal| {
                            create_withdrawal_transaction(rpc, view, &withdrawal)
                        })
                    }
                };
                rebuilt.as_ref() == Some(transaction)
            }
        }

        // Sign and process operations never go through proposals
        _ => {
            log::error!("Proposal not considered for approval: {:?}", proposal);
            false
        }
    };

    should_approve
}

/// Approve every open proposal whose payload we can reproduce
pub fn process_proposals(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    let our = match d.our_signer(view) {
        Some(signer) => signer,
        None => return,
    };

    for proposal in view.proposals() {
        if proposal.approved_by(our.signer_id) {
            continue;
        }
        if process_proposal(d, rpc, view, &proposal) {
            if let Err(e) = submit.approve(our.signer_id, proposal.proposal_id) {
                log::error!("Error approving {}: '{}'", proposal.proposal_id, e);
            }
        } else {
            log::debug!("Not approving {}", proposal.proposal_id);
        }
    }
}

/// Drive deposits through their lifecycle: propose processing once confirmed,
/// then propose the transaction moving the funds to the vault.
pub fn process_deposits(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    let our = match d.our_signer(view) {
        Some(signer) => signer,
        None => return,
    };
    let payer = view.federation_account();

    // Both observed and proposed: an expired proposal gets refiled
    for status in &[DepositStatus::Observed, DepositStatus::Proposed] {
        for deposit in view.deposits(*status) {
            if !deposit_matches_chain(rpc, view, &deposit) {
                continue;
            }
            submit_proposal_once(
                view,
                submit,
                &our,
                HostOperation::DepositProcess {
                    payer,
                    deposit_id: deposit.deposit_id,
                },
            );
        }
    }

    for deposit in view.deposits(DepositStatus::Processed) {
        let object_id = ObjectId::Deposit(deposit.deposit_id);
        if view.sidechain_tx_for(object_id).is_some() {
            continue;
        }
        if let Some(transaction) = create_deposit_transaction(rpc, view, &deposit) {
            submit_proposal_once(
                view,
                submit,
                &our,
                HostOperation::SidechainTxCreate {
                    payer,
                    object_id,
                    sidechain: SIDECHAIN.to_string(),
                    transaction,
                    signers: view.active_signers(),
                },
            );
        }
    }
}

/// Propose the payout transaction of every pending withdrawal
pub fn process_withdrawals(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    let our = match d.our_signer(view) {
        Some(signer) => signer,
        None => return,
    };
    let payer = view.federation_account();

    for status in &[WithdrawalStatus::Requested, WithdrawalStatus::Proposed] {
        for withdrawal in view.withdrawals(*status) {
            let object_id = ObjectId::Withdrawal(withdrawal.withdraw_id);
            if view.sidechain_tx_for(object_id).is_some() {
                continue;
            }
            if let Some(transaction) = create_withdrawal_transaction(rpc, view, &withdrawal) {
                submit_proposal_once(
                    view,
                    submit,
                    &our,
                    HostOperation::SidechainTxCreate {
                        payer,
                        object_id,
                        sidechain: SIDECHAIN.to_string(),
                        transaction,
                        signers: view.active_signers(),
                    },
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostchain::memory::{ChainParams, MemoryChain};
    use crate::hostchain::{ProposalId, SignerId};
    use crate::testutil::{install_vault, signer_state, test_signers, MockRpc};
    use serde_json::json;
    use std::str::FromStr;

    const DEST: &str = "mkHS9ne12qx9pS9VojpwU5xtRd4T7X7ZUt";
    const DEPOSIT_TXID: &str = "ff60f48f767bbf70d79efc1347b5554b481f14fda68709839091286e035e669b";
    const VAULT_UTXO_TXID: &str =
        "3d322dc2640239a2e68e182b254d19c88e5172a61947f94a105c3f57618092ff";

    fn proposal_with(op: HostOperation) -> Proposal {
        Proposal {
            proposal_id: ProposalId(999),
            proposer: SignerId(1),
            operations: vec![op],
            expiration: u64::MAX,
            approvals: Vec::new(),
        }
    }

    #[test]
    fn withdrawal_transaction_shape() {
        let chain = MemoryChain::new(ChainParams::default());
        let signers = test_signers(3);
        let vault = install_vault(&chain, signers.clone());

        let rpc = MockRpc::new();
        rpc.add_utxo(&vault.address, VAULT_UTXO_TXID, 0, 1_000_000);

        let withdraw_id = chain.request_withdrawal(DEST, 300_000);
        let withdrawal = chain.withdrawal(withdraw_id).unwrap();
        let payload = create_withdrawal_transaction(&rpc, &chain, &withdrawal)
            .expect("enough funds on the vault");

        let (tx, in_amounts) = TxPayload::decode(&payload).unwrap();
        assert_eq!(tx.input.len(), 1);
        assert_eq!(tx.input[0].previous_output.vout, 0);
        assert_eq!(in_amounts, vec![1_000_000]);

        // 300_000 to the destination, 1_000_000 - 300_000 - 1_000 back to the
        // vault. Outputs are in address order: the '2'-vault sorts first.
        assert_eq!(tx.output.len(), 2);
        assert_eq!(tx.output[0].value, 699_000);
        assert_eq!(tx.output[1].value, 300_000);

        // Too large a withdrawal yields no transaction
        let too_much = Withdrawal {
            amount: 1_000_000,
            ..withdrawal.clone()
        };
        assert!(create_withdrawal_transaction(&rpc, &chain, &too_much).is_none());
    }

    #[test]
    fn sweep_conservation() {
        let chain = MemoryChain::new(ChainParams::default());
        let old_signers = test_signers(3);
        let old_vault = install_vault(&chain, old_signers.clone());

        let rpc = MockRpc::new();
        rpc.add_utxo(&old_vault.address, VAULT_UTXO_TXID, 0, 1_500_000);
        rpc.add_utxo(&old_vault.address, VAULT_UTXO_TXID, 1, 1_000_000);

        // Rotate to a larger set and agree on its address
        let new_vault = install_vault(&chain, test_signers(4));

        let payload = create_sweep_transaction(&rpc, &chain).expect("previous vault has coins");
        let (tx, in_amounts) = TxPayload::decode(&payload).unwrap();
        assert_eq!(tx.input.len(), 2);
        assert_eq!(in_amounts, vec![1_500_000, 1_000_000]);
        // Sum of outputs is the sum of inputs minus exactly the fee floor
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 2_499_000);
        assert_eq!(
            tx.output[0].script_pubkey,
            bitcoin::Address::from_str(&new_vault.address)
                .unwrap()
                .script_pubkey()
        );
    }

    #[test]
    fn vault_update_validation() {
        let chain = MemoryChain::new(ChainParams::default());
        let signers = test_signers(3);
        let vault_id = chain.rotate_signers(signers.clone());
        let state = signer_state(1);
        let rpc = MockRpc::new();

        let honest = crate::scripts::vault_address(&signers, state.network).unwrap();
        let op = |address_json: String| {
            proposal_with(HostOperation::VaultUpdate {
                payer: chain.federation_account(),
                vault_id,
                sidechain: SIDECHAIN.to_string(),
                address_json,
            })
        };

        assert!(process_proposal(&state, &rpc, &chain, &op(honest.to_json())));

        // A single different byte in the address json and we decline
        let mut diverted = honest.clone();
        diverted.address = "2NA4h6sc9oZ4ogfNKU9Wp6fkqPZLZPqqpgf".to_string();
        assert!(!process_proposal(&state, &rpc, &chain, &op(diverted.to_json())));

        // Unknown vault object
        let bogus = proposal_with(HostOperation::VaultUpdate {
            payer: chain.federation_account(),
            vault_id: crate::hostchain::VaultId(424242),
            sidechain: SIDECHAIN.to_string(),
            address_json: honest.to_json(),
        });
        assert!(!process_proposal(&state, &rpc, &chain, &bogus));
    }

    #[test]
    fn deposit_process_validation() {
        let chain = MemoryChain::new(ChainParams::default());
        let signers = test_signers(3);
        install_vault(&chain, signers.clone());
        let state = signer_state(1);

        let uid = crate::hostchain::deposit_uid(DEPOSIT_TXID, 0);
        chain.track_deposit_address("2MzLoz4ZQos4edc3trJHW5YMr3rlzalkHAR");
        chain
            .sidechain_event(crate::hostchain::SidechainEvent {
                timestamp: 0,
                block_num: 1,
                uid,
                txid: DEPOSIT_TXID.to_string(),
                vout: 0,
                address: "2MzLoz4ZQos4edc3trJHW5YMr3rlzalkHAR".to_string(),
                amount: 500_000,
            })
            .unwrap();
        let deposit = chain.deposits(DepositStatus::Observed).pop().unwrap();

        let rpc = MockRpc::new();
        let tx_result = |confirmations: u64, amount: f64| {
            json!({
                "txid": DEPOSIT_TXID,
                "confirmations": confirmations,
                "details": [
                    { "address": "2MzLoz4ZQos4edc3trJHW5YMr3rlzalkHAR", "amount": amount, "vout": 0 }
                ]
            })
        };

        let op = proposal_with(HostOperation::DepositProcess {
            payer: chain.federation_account(),
            deposit_id: deposit.deposit_id,
        });

        // Not confirmed enough yet
        rpc.transactions
            .lock()
            .unwrap()
            .insert(DEPOSIT_TXID.to_string(), tx_result(0, 0.005));
        assert!(!process_proposal(&state, &rpc, &chain, &op));

        // Confirmed and matching
        rpc.transactions
            .lock()
            .unwrap()
            .insert(DEPOSIT_TXID.to_string(), tx_result(3, 0.005));
        assert!(process_proposal(&state, &rpc, &chain, &op));

        // Amount mismatch: the node saw a different payment
        rpc.transactions
            .lock()
            .unwrap()
            .insert(DEPOSIT_TXID.to_string(), tx_result(3, 0.006));
        assert!(!process_proposal(&state, &rpc, &chain, &op));
    }

    #[test]
    fn divergent_sweep_is_declined() {
        let chain = MemoryChain::new(ChainParams::default());
        let old_signers = test_signers(3);
        let old_vault = install_vault(&chain, old_signers.clone());
        let rpc = MockRpc::new();
        rpc.add_utxo(&old_vault.address, VAULT_UTXO_TXID, 0, 2_500_000);
        install_vault(&chain, test_signers(4));
        let state = signer_state(1);

        let previous = chain.previous_vault().unwrap();
        let honest = create_sweep_transaction(&rpc, &chain).unwrap();
        let stc = |transaction: String| {
            proposal_with(HostOperation::SidechainTxCreate {
                payer: chain.federation_account(),
                object_id: ObjectId::Vault(previous.vault_id),
                sidechain: SIDECHAIN.to_string(),
                transaction,
                signers: previous.signers.clone(),
            })
        };

        assert!(process_proposal(&state, &rpc, &chain, &stc(honest.clone())));

        // A malicious signer diverts the sweep to its own address: our
        // reconstruction differs and the proposal is not approved
        let (mut tx, in_amounts) = TxPayload::decode(&honest).unwrap();
        tx.output[0].script_pubkey = bitcoin::Address::from_str(DEST).unwrap().script_pubkey();
        let diverted = TxPayload::encode(&tx, &in_amounts);
        assert!(!process_proposal(&state, &rpc, &chain, &stc(diverted)));
    }

    #[test]
    fn proposal_dedup() {
        let chain = MemoryChain::new(ChainParams::default());
        let signers = test_signers(3);
        chain.rotate_signers(signers.clone());

        let op = HostOperation::DepositProcess {
            payer: chain.federation_account(),
            deposit_id: crate::hostchain::DepositId(7),
        };
        assert!(submit_proposal_once(&chain, &chain, &signers[0], op.clone()));
        // The second signer sees the open proposal and stays silent
        assert!(!submit_proposal_once(&chain, &chain, &signers[1], op));
        assert_eq!(chain.proposals().len(), 1);
    }
}
