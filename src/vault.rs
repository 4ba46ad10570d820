//! Vault lifecycle.
//!
//! When the elected signer set changes the host chain creates a fresh vault
//! object with no address. The federation then agrees on the weighted
//! multisig address derived from the new set, and once that is settled sweeps
//! the previous vault into it with a second agreed-upon transaction. The
//! sweep stays signable by the previous set: its signer snapshot is pinned on
//! the sidechain transaction.

use crate::bitcoind::interface::BitcoinRpc;
use crate::hostchain::{HostChainSubmit, HostChainView, HostOperation, ObjectId, SIDECHAIN};
use crate::proposals::{create_sweep_transaction, submit_proposal_once};
use crate::scripts;
use crate::sidechaind::SidechainD;

/// Drive the active vault through its setup: propose its address when it has
/// none, then propose the sweep of its predecessor.
pub fn process_vaults(
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
    let active = match view.active_vault() {
        Some(vault) => vault,
        None => return,
    };

    if active.address.is_none() {
        // The address must derive from the set the vault was created for;
        // with another election under way the next vault object will do it.
        let active_signers = view.active_signers();
        if active.signers != active_signers {
            return;
        }

        let address = match scripts::vault_address(&active_signers, d.network) {
            Ok(address) => address,
            Err(e) => {
                log::error!("Error deriving the vault address: '{}'", e);
                return;
            }
        };
        submit_proposal_once(
            view,
            submit,
            &our,
            HostOperation::VaultUpdate {
                payer,
                vault_id: active.vault_id,
                sidechain: SIDECHAIN.to_string(),
                address_json: address.to_json(),
            },
        );
        // The sweep waits until the address is accepted
        return;
    }

    let previous = match view.previous_vault() {
        Some(vault) => vault,
        None => return,
    };
    if previous.address.is_none() {
        return;
    }
    let object_id = ObjectId::Vault(previous.vault_id);
    if view.sidechain_tx_for(object_id).is_some() {
        // Sweep already under way or done; residual dust stays in place
        return;
    }

    if let Some(transaction) = create_sweep_transaction(rpc, view) {
        submit_proposal_once(
            view,
            submit,
            &our,
            HostOperation::SidechainTxCreate {
                payer,
                object_id,
                sidechain: SIDECHAIN.to_string(),
                transaction,
                // Authority over the old vault stays with its original set
                signers: previous.signers.clone(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostchain::memory::{ChainParams, MemoryChain};
    use crate::hostchain::HostChainView;
    use crate::proposals::process_proposals;
    use crate::sidechaind::SidechainD;
    use crate::testutil::{signer_state, test_signers, MockRpc};

    const VAULT_UTXO_TXID: &str =
        "3d322dc2640239a2e68e182b254d19c88e5172a61947f94a105c3f57618092ff";

    fn agreement_round(states: &[SidechainD], rpc: &MockRpc, chain: &MemoryChain) {
        for state in states {
            process_vaults(state, rpc, chain, chain);
        }
        for state in states {
            process_proposals(state, rpc, chain, chain);
        }
    }

    #[test]
    fn rotation_flow() {
        let chain = MemoryChain::new(ChainParams::default());
        let rpc = MockRpc::new();
        let old_signers = test_signers(3);
        let states: Vec<SidechainD> = (1..=3).map(signer_state).collect();

        // Genesis: a signer set is elected, its vault has no address yet
        chain.rotate_signers(old_signers.clone());
        assert!(chain.active_vault().unwrap().address.is_none());

        // Every signer proposes (one wins, the rest dedup) then approves
        agreement_round(&states, &rpc, &chain);
        let old_vault = chain.active_vault().unwrap();
        let old_address = old_vault.address.clone().expect("agreed upon");
        assert_eq!(
            old_address,
            crate::scripts::vault_address(&old_signers, bitcoin::Network::Testnet).unwrap()
        );
        // There is nothing to sweep into a first vault
        agreement_round(&states, &rpc, &chain);
        assert!(chain.sidechain_txs().is_empty());

        // The vault takes custody of some funds, then the set rotates
        rpc.add_utxo(&old_address.address, VAULT_UTXO_TXID, 0, 1_500_000);
        rpc.add_utxo(&old_address.address, VAULT_UTXO_TXID, 1, 1_000_000);
        let new_signers = test_signers(4);
        let new_states: Vec<SidechainD> = (1..=4).map(signer_state).collect();
        chain.rotate_signers(new_signers.clone());

        // First round settles the new address, second round files the sweep
        agreement_round(&new_states, &rpc, &chain);
        let new_address = chain.active_vault().unwrap().address.expect("agreed upon");
        assert_ne!(new_address.address, old_address.address);
        agreement_round(&new_states, &rpc, &chain);

        let sweep = chain
            .sidechain_tx_for(crate::hostchain::ObjectId::Vault(old_vault.vault_id))
            .expect("sweep filed and agreed");
        // The sweep is signable by the old set, not the new one
        assert_eq!(sweep.signers, old_signers);
        let (tx, _) = crate::transactions::TxPayload::decode(&sweep.transaction).unwrap();
        assert_eq!(tx.output.len(), 1);
        assert_eq!(tx.output[0].value, 2_499_000);

        // Re-running the rotation logic files nothing new
        agreement_round(&new_states, &rpc, &chain);
        assert_eq!(chain.sidechain_txs().len(), 1);
    }
}
