//! In-memory host chain.
//!
//! A self-contained implementation of [HostChainView] and [HostChainSubmit]
//! holding the federation objects in process memory, with the quorum and
//! idempotence rules a real host chain enforces. It backs the test suite and
//! lets an embedding node run the coordinator before wiring its own database.

use std::collections::HashSet;
use std::sync::Mutex;

use crate::hostchain::{
    threshold_weight, AccountId, Deposit, DepositId, DepositStatus, HostChainSubmit,
    HostChainView, HostOperation, ObjectId, Proposal, ProposalId, SidechainEvent, SidechainTx,
    SidechainTxId, Signer, SignerId, SubmitError, Vault, VaultAddress, VaultId, Withdrawal,
    WithdrawalId, WithdrawalStatus,
};

/// Host chain parameters, fixed at genesis
#[derive(Debug, Clone)]
pub struct ChainParams {
    pub block_interval: u64,
    pub active_witness_count: u64,
    pub min_tx_confirmations: u64,
    pub federation_account: AccountId,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            block_interval: 3,
            active_witness_count: 11,
            min_tx_confirmations: 1,
            federation_account: AccountId(1),
        }
    }
}

struct Inner {
    params: ChainParams,
    head_block_time: u64,
    head_block_num: u64,
    active_signers: Vec<Signer>,
    vaults: Vec<Vault>,
    deposits: Vec<Deposit>,
    withdrawals: Vec<Withdrawal>,
    sidechain_txs: Vec<SidechainTx>,
    proposals: Vec<Proposal>,
    deposit_addresses: HashSet<String>,
    seen_uids: HashSet<String>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn signer_by_account(&self, signers: &[Signer], account: AccountId) -> Option<Signer> {
        signers.iter().find(|s| s.account == account).cloned()
    }

    // A proposal executes once the approvers gather 2/3 of the active weight.
    fn approved_weight(&self, proposal: &Proposal) -> u32 {
        self.active_signers
            .iter()
            .filter(|s| proposal.approvals.contains(&s.signer_id))
            .map(|s| s.weight as u32)
            .sum()
    }

    fn execute(&mut self, op: &HostOperation) {
        match op {
            HostOperation::VaultUpdate {
                vault_id,
                address_json,
                ..
            } => {
                if let Some(vault) = self.vaults.iter_mut().find(|v| v.vault_id == *vault_id) {
                    if vault.address.is_none() {
                        vault.address = VaultAddress::from_json(address_json);
                    }
                }
            }
            HostOperation::DepositProcess { deposit_id, .. } => {
                if let Some(deposit) = self
                    .deposits
                    .iter_mut()
                    .find(|d| d.deposit_id == *deposit_id)
                {
                    if deposit.status < DepositStatus::Processed {
                        deposit.status = DepositStatus::Processed;
                    }
                }
            }
            HostOperation::SidechainTxCreate {
                object_id,
                transaction,
                signers,
                ..
            } => {
                if self.sidechain_txs.iter().any(|s| s.object_id == *object_id) {
                    return;
                }
                let stx_id = SidechainTxId(self.next_id());
                self.sidechain_txs.push(SidechainTx {
                    stx_id,
                    object_id: *object_id,
                    transaction: transaction.clone(),
                    signers: signers.clone(),
                    signatures: Default::default(),
                    complete: false,
                    bitcoin_txid: None,
                });
            }
            // Sign and process are direct operations, not proposal payloads
            HostOperation::SidechainTxSign { .. } | HostOperation::SidechainTxProcess { .. } => {}
        }
    }

    fn on_proposed(&mut self, op: &HostOperation) {
        match op {
            HostOperation::DepositProcess { deposit_id, .. } => {
                if let Some(deposit) = self
                    .deposits
                    .iter_mut()
                    .find(|d| d.deposit_id == *deposit_id)
                {
                    if deposit.status < DepositStatus::Proposed {
                        deposit.status = DepositStatus::Proposed;
                    }
                }
            }
            HostOperation::SidechainTxCreate {
                object_id: ObjectId::Withdrawal(id),
                ..
            } => {
                if let Some(withdrawal) =
                    self.withdrawals.iter_mut().find(|w| w.withdraw_id == *id)
                {
                    if withdrawal.status < WithdrawalStatus::Proposed {
                        withdrawal.status = WithdrawalStatus::Proposed;
                    }
                }
            }
            _ => {}
        }
    }
}

pub struct MemoryChain {
    inner: Mutex<Inner>,
}

impl MemoryChain {
    pub fn new(params: ChainParams) -> MemoryChain {
        MemoryChain {
            inner: Mutex::new(Inner {
                params,
                head_block_time: 1_600_000_000,
                head_block_num: 1,
                active_signers: Vec::new(),
                vaults: Vec::new(),
                deposits: Vec::new(),
                withdrawals: Vec::new(),
                sidechain_txs: Vec::new(),
                proposals: Vec::new(),
                deposit_addresses: HashSet::new(),
                seen_uids: HashSet::new(),
                next_id: 0,
            }),
        }
    }

    /// Elect a new signer set. A fresh vault object is created for it, with no
    /// address until the federation agrees on one.
    pub fn rotate_signers(&self, mut signers: Vec<Signer>) -> VaultId {
        let mut inner = self.inner.lock().unwrap();
        signers.sort_by_key(|s| s.signer_id);
        inner.active_signers = signers.clone();
        let vault_id = VaultId(inner.next_id());
        inner.vaults.push(Vault {
            vault_id,
            signers,
            address: None,
        });
        vault_id
    }

    /// Register a per-user deposit address with the address index
    pub fn track_deposit_address(&self, address: &str) {
        self.inner
            .lock()
            .unwrap()
            .deposit_addresses
            .insert(address.to_string());
    }

    /// File a payout request back to Bitcoin
    pub fn request_withdrawal(&self, destination: &str, amount: u64) -> WithdrawalId {
        let mut inner = self.inner.lock().unwrap();
        let withdraw_id = WithdrawalId(inner.next_id());
        inner.withdrawals.push(Withdrawal {
            withdraw_id,
            destination: destination.to_string(),
            amount,
            status: WithdrawalStatus::Requested,
        });
        withdraw_id
    }

    /// Produce a host-chain block: bump the head and void expired proposals
    pub fn advance_block(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.head_block_num += 1;
        inner.head_block_time += inner.params.block_interval;
        let now = inner.head_block_time;
        inner.proposals.retain(|p| p.expiration > now);
    }
}

impl HostChainView for MemoryChain {
    fn head_block_time(&self) -> u64 {
        self.inner.lock().unwrap().head_block_time
    }

    fn head_block_num(&self) -> u64 {
        self.inner.lock().unwrap().head_block_num
    }

    fn block_interval(&self) -> u64 {
        self.inner.lock().unwrap().params.block_interval
    }

    fn active_witness_count(&self) -> u64 {
        self.inner.lock().unwrap().params.active_witness_count
    }

    fn min_tx_confirmations(&self) -> u64 {
        self.inner.lock().unwrap().params.min_tx_confirmations
    }

    fn federation_account(&self) -> AccountId {
        self.inner.lock().unwrap().params.federation_account
    }

    fn active_signers(&self) -> Vec<Signer> {
        self.inner.lock().unwrap().active_signers.clone()
    }

    fn vaults(&self) -> Vec<Vault> {
        self.inner.lock().unwrap().vaults.clone()
    }

    fn vault(&self, id: VaultId) -> Option<Vault> {
        self.inner
            .lock()
            .unwrap()
            .vaults
            .iter()
            .find(|v| v.vault_id == id)
            .cloned()
    }

    fn deposit(&self, id: DepositId) -> Option<Deposit> {
        self.inner
            .lock()
            .unwrap()
            .deposits
            .iter()
            .find(|d| d.deposit_id == id)
            .cloned()
    }

    fn deposits(&self, status: DepositStatus) -> Vec<Deposit> {
        self.inner
            .lock()
            .unwrap()
            .deposits
            .iter()
            .filter(|d| d.status == status)
            .cloned()
            .collect()
    }

    fn is_tracked_deposit_address(&self, address: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .deposit_addresses
            .contains(address)
    }

    fn withdrawal(&self, id: WithdrawalId) -> Option<Withdrawal> {
        self.inner
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .find(|w| w.withdraw_id == id)
            .cloned()
    }

    fn withdrawals(&self, status: WithdrawalStatus) -> Vec<Withdrawal> {
        self.inner
            .lock()
            .unwrap()
            .withdrawals
            .iter()
            .filter(|w| w.status == status)
            .cloned()
            .collect()
    }

    fn sidechain_tx(&self, id: SidechainTxId) -> Option<SidechainTx> {
        self.inner
            .lock()
            .unwrap()
            .sidechain_txs
            .iter()
            .find(|s| s.stx_id == id)
            .cloned()
    }

    fn sidechain_txs(&self) -> Vec<SidechainTx> {
        self.inner.lock().unwrap().sidechain_txs.clone()
    }

    fn sidechain_tx_for(&self, object_id: ObjectId) -> Option<SidechainTx> {
        self.inner
            .lock()
            .unwrap()
            .sidechain_txs
            .iter()
            .find(|s| s.object_id == object_id)
            .cloned()
    }

    fn proposals(&self) -> Vec<Proposal> {
        let inner = self.inner.lock().unwrap();
        let now = inner.head_block_time;
        inner
            .proposals
            .iter()
            .filter(|p| p.expiration > now)
            .cloned()
            .collect()
    }
}

impl HostChainSubmit for MemoryChain {
    fn propose(
        &self,
        proposer: SignerId,
        operations: Vec<HostOperation>,
        expiration: u64,
    ) -> Result<ProposalId, SubmitError> {
        let mut inner = self.inner.lock().unwrap();
        if operations.is_empty() {
            return Err(SubmitError::Rejected("empty proposal".to_string()));
        }
        if expiration <= inner.head_block_time {
            return Err(SubmitError::Rejected("expired proposal".to_string()));
        }
        for op in &operations {
            inner.on_proposed(op);
        }
        let proposal_id = ProposalId(inner.next_id());
        inner.proposals.push(Proposal {
            proposal_id,
            proposer,
            operations,
            expiration,
            approvals: Vec::new(),
        });
        Ok(proposal_id)
    }

    fn approve(&self, approver: SignerId, proposal_id: ProposalId) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.active_signers.iter().any(|s| s.signer_id == approver) {
            return Err(SubmitError::Rejected(format!(
                "{} is not an active signer",
                approver
            )));
        }

        let idx = inner
            .proposals
            .iter()
            .position(|p| p.proposal_id == proposal_id)
            .ok_or_else(|| SubmitError::Rejected(format!("no open {}", proposal_id)))?;
        if !inner.proposals[idx].approvals.contains(&approver) {
            inner.proposals[idx].approvals.push(approver);
        }

        let threshold = threshold_weight(&inner.active_signers);
        if inner.approved_weight(&inner.proposals[idx]) >= threshold {
            let executed = inner.proposals.remove(idx);
            for op in &executed.operations {
                inner.execute(op);
            }
        }
        Ok(())
    }

    fn submit(&self, operation: HostOperation) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock().unwrap();
        match operation {
            HostOperation::SidechainTxSign {
                payer,
                stx_id,
                partials,
            } => {
                let idx = inner
                    .sidechain_txs
                    .iter()
                    .position(|s| s.stx_id == stx_id)
                    .ok_or_else(|| SubmitError::Rejected(format!("no {}", stx_id)))?;
                let signer = inner
                    .signer_by_account(&inner.sidechain_txs[idx].signers, payer)
                    .ok_or_else(|| {
                        SubmitError::Rejected(format!("{} is not a snapshot signer", payer))
                    })?;
                let partial = partials
                    .into_iter()
                    .next()
                    .ok_or_else(|| SubmitError::Rejected("no partial".to_string()))?;

                let stx = &mut inner.sidechain_txs[idx];
                // A second partial from the same signer is dropped
                if stx.signatures.contains_key(&signer.signer_id) {
                    return Ok(());
                }
                stx.signatures.insert(signer.signer_id, partial);

                let completed_now =
                    !stx.complete && stx.signed_weight() >= threshold_weight(&stx.signers);
                if completed_now {
                    stx.complete = true;
                }
                let object_id = stx.object_id;

                if completed_now {
                    if let ObjectId::Withdrawal(id) = object_id {
                        if let Some(withdrawal) =
                            inner.withdrawals.iter_mut().find(|w| w.withdraw_id == id)
                        {
                            if withdrawal.status < WithdrawalStatus::Signed {
                                withdrawal.status = WithdrawalStatus::Signed;
                            }
                        }
                    }
                }
                Ok(())
            }
            HostOperation::SidechainTxProcess {
                stx_id,
                bitcoin_txid,
                ..
            } => {
                let idx = inner
                    .sidechain_txs
                    .iter()
                    .position(|s| s.stx_id == stx_id)
                    .ok_or_else(|| SubmitError::Rejected(format!("no {}", stx_id)))?;
                // Accepted at most once per sidechain transaction
                if inner.sidechain_txs[idx].bitcoin_txid.is_some() {
                    return Ok(());
                }
                inner.sidechain_txs[idx].bitcoin_txid = Some(bitcoin_txid);

                match inner.sidechain_txs[idx].object_id {
                    ObjectId::Deposit(id) => {
                        if let Some(deposit) =
                            inner.deposits.iter_mut().find(|d| d.deposit_id == id)
                        {
                            deposit.status = DepositStatus::Transferred;
                        }
                    }
                    ObjectId::Withdrawal(id) => {
                        if let Some(withdrawal) =
                            inner.withdrawals.iter_mut().find(|w| w.withdraw_id == id)
                        {
                            withdrawal.status = WithdrawalStatus::Sent;
                        }
                    }
                    ObjectId::Vault(_) => {}
                }
                Ok(())
            }
            _ => Err(SubmitError::Rejected(
                "operation must go through a proposal".to_string(),
            )),
        }
    }

    fn sidechain_event(&self, event: SidechainEvent) -> Result<(), SubmitError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.seen_uids.insert(event.uid.clone()) {
            // Replay of an already-recorded deposit
            return Ok(());
        }
        let deposit_id = DepositId(inner.next_id());
        inner.deposits.push(Deposit {
            deposit_id,
            txid: event.txid,
            vout: event.vout,
            address: event.address,
            amount: event.amount,
            uid: event.uid,
            status: DepositStatus::Observed,
        });
        Ok(())
    }
}
