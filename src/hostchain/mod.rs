//! Typed view of the host chain objects the coordinator reads and the
//! operations it writes back. The host chain database itself lives in the
//! embedding node; the coordinator only ever goes through the [HostChainView]
//! and [HostChainSubmit] capabilities.

pub mod memory;

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// The sidechain this coordinator operates on
pub const SIDECHAIN: &str = "bitcoin";

macro_rules! object_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
            Hash,
            Serialize,
            Deserialize,
        )]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

object_id!(AccountId);
object_id!(SignerId);
object_id!(VaultId);
object_id!(DepositId);
object_id!(WithdrawalId);
object_id!(SidechainTxId);
object_id!(ProposalId);

/// The host-chain object a sidechain transaction moves funds for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectId {
    Vault(VaultId),
    Deposit(DepositId),
    Withdrawal(WithdrawalId),
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ObjectId::Vault(id) => write!(f, "{}", id),
            ObjectId::Deposit(id) => write!(f, "{}", id),
            ObjectId::Withdrawal(id) => write!(f, "{}", id),
        }
    }
}

/// A federation member authorized to sign vault spends.
///
/// The active set is totally ordered by `signer_id`, which fixes the layout of
/// the vault witness script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signer {
    pub signer_id: SignerId,
    /// The account paying for this signer's operations on the host chain
    pub account: AccountId,
    /// This signer's voting share
    pub weight: u16,
    /// Compressed secp256k1 public key, hex-encoded
    pub sidechain_pubkey: String,
}

/// Sum of the voting shares of a signer set
pub fn total_weight(signers: &[Signer]) -> u32 {
    signers.iter().map(|s| s.weight as u32).sum()
}

/// The weight a quorum must reach to move vault funds: `2W/3`
pub fn threshold_weight(signers: &[Signer]) -> u32 {
    total_weight(signers) * 2 / 3
}

/// A multisig address custodying sidechain funds, as persisted on the host
/// chain. `redeemScript` holds the hex of the witness script, which is what
/// gets imported in the node wallet alongside the address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultAddress {
    pub address: String,
    #[serde(rename = "redeemScript")]
    pub redeem_script: String,
}

impl VaultAddress {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("A VaultAddress always serializes")
    }

    pub fn from_json(json: &str) -> Option<VaultAddress> {
        serde_json::from_str(json).ok()
    }
}

/// A vault object. At most one is active at a given head block; older ones
/// stay spendable by their original signer set until swept.
#[derive(Debug, Clone, PartialEq)]
pub struct Vault {
    pub vault_id: VaultId,
    /// The signer set at creation time, ordered by id
    pub signers: Vec<Signer>,
    /// Not set until the federation agreed on the derived address
    pub address: Option<VaultAddress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DepositStatus {
    /// Seen in a Bitcoin block by the chain watcher
    Observed,
    /// A processing proposal is pending
    Proposed,
    /// The federation acknowledged the deposit
    Processed,
    /// The funds were moved to the vault
    Transferred,
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Observed => "observed",
                Self::Proposed => "proposed",
                Self::Processed => "processed",
                Self::Transferred => "transferred",
            }
        )
    }
}

impl FromStr for DepositStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "observed" => Ok(Self::Observed),
            "proposed" => Ok(Self::Proposed),
            "processed" => Ok(Self::Processed),
            "transferred" => Ok(Self::Transferred),
            _ => Err(()),
        }
    }
}

/// A Bitcoin payment to a tracked per-user deposit address
#[derive(Debug, Clone, PartialEq)]
pub struct Deposit {
    pub deposit_id: DepositId,
    pub txid: String,
    pub vout: u32,
    /// The tracked address the payment went to
    pub address: String,
    pub amount: u64,
    /// `bitcoin-<txid>-<vout>`, the canonical replay-proof key
    pub uid: String,
    pub status: DepositStatus,
}

/// The vout encoded in a deposit uid, its last `-`-separated field
pub fn uid_vout(uid: &str) -> Option<u32> {
    uid.rsplit('-').next()?.parse().ok()
}

/// Build the canonical uid of a deposit
pub fn deposit_uid(txid: &str, vout: u32) -> String {
    format!("{}-{}-{}", SIDECHAIN, txid, vout)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WithdrawalStatus {
    Requested,
    Proposed,
    Signed,
    Sent,
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Requested => "requested",
                Self::Proposed => "proposed",
                Self::Signed => "signed",
                Self::Sent => "sent",
            }
        )
    }
}

impl FromStr for WithdrawalStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(Self::Requested),
            "proposed" => Ok(Self::Proposed),
            "signed" => Ok(Self::Signed),
            "sent" => Ok(Self::Sent),
            _ => Err(()),
        }
    }
}

/// A sidechain-initiated payout back to Bitcoin
#[derive(Debug, Clone, PartialEq)]
pub struct Withdrawal {
    pub withdraw_id: WithdrawalId,
    /// Destination Bitcoin address
    pub destination: String,
    pub amount: u64,
    pub status: WithdrawalStatus,
}

/// A Bitcoin transaction being signed by the federation.
///
/// The `signers` snapshot is immutable for the lifetime of the object: a vault
/// sweep stays signable by the set that owned the vault, not the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct SidechainTx {
    pub stx_id: SidechainTxId,
    pub object_id: ObjectId,
    /// Unsigned payload: base64 PSBT or standalone `{tx_hex, in_amounts}` JSON
    pub transaction: String,
    pub signers: Vec<Signer>,
    /// One partial per signer, recorded at most once
    pub signatures: BTreeMap<SignerId, String>,
    /// Flips `false -> true` exactly once, when enough weight signed
    pub complete: bool,
    /// The broadcast transaction id, recorded at most once
    pub bitcoin_txid: Option<String>,
}

impl SidechainTx {
    /// Aggregate weight of the signers which contributed a partial
    pub fn signed_weight(&self) -> u32 {
        self.signers
            .iter()
            .filter(|s| self.signatures.contains_key(&s.signer_id))
            .map(|s| s.weight as u32)
            .sum()
    }
}

/// A confirmed deposit observation, de-duplicated by `uid` downstream
#[derive(Debug, Clone, PartialEq)]
pub struct SidechainEvent {
    pub timestamp: u64,
    pub block_num: u64,
    pub uid: String,
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: u64,
}

/// An operation the coordinator writes to the host chain. Peers reconstruct
/// proposal-carried operations independently and approve on bit-identical
/// equality, so every field here must be deterministic from shared state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HostOperation {
    VaultUpdate {
        payer: AccountId,
        vault_id: VaultId,
        sidechain: String,
        address_json: String,
    },
    DepositProcess {
        payer: AccountId,
        deposit_id: DepositId,
    },
    SidechainTxCreate {
        payer: AccountId,
        object_id: ObjectId,
        sidechain: String,
        transaction: String,
        signers: Vec<Signer>,
    },
    SidechainTxSign {
        payer: AccountId,
        stx_id: SidechainTxId,
        partials: Vec<String>,
    },
    SidechainTxProcess {
        payer: AccountId,
        stx_id: SidechainTxId,
        bitcoin_txid: String,
    },
}

/// A pending cross-signer agreement
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub proposal_id: ProposalId,
    pub proposer: SignerId,
    pub operations: Vec<HostOperation>,
    /// Unix time after which the proposal is void
    pub expiration: u64,
    /// Which signers already approved
    pub approvals: Vec<SignerId>,
}

impl Proposal {
    pub fn approved_by(&self, signer: SignerId) -> bool {
        self.approvals.contains(&signer)
    }
}

/// Read-only view of the host chain state, consistent within one block
pub trait HostChainView: Send + Sync {
    fn head_block_time(&self) -> u64;
    fn head_block_num(&self) -> u64;
    /// Target seconds between two host-chain blocks
    fn block_interval(&self) -> u64;
    fn active_witness_count(&self) -> u64;
    /// Confirmations before a Bitcoin deposit may be acted upon
    fn min_tx_confirmations(&self) -> u64;
    /// The account federation operations are paid from
    fn federation_account(&self) -> AccountId;

    /// The elected signer set, ordered by signer id
    fn active_signers(&self) -> Vec<Signer>;

    /// All vaults, oldest first. The newest one is the active vault.
    fn vaults(&self) -> Vec<Vault>;
    fn vault(&self, id: VaultId) -> Option<Vault>;
    fn active_vault(&self) -> Option<Vault> {
        self.vaults().pop()
    }
    fn previous_vault(&self) -> Option<Vault> {
        let mut vaults = self.vaults();
        vaults.pop()?;
        vaults.pop()
    }

    fn deposit(&self, id: DepositId) -> Option<Deposit>;
    fn deposits(&self, status: DepositStatus) -> Vec<Deposit>;
    /// Whether this address belongs to the per-user deposit address index
    fn is_tracked_deposit_address(&self, address: &str) -> bool;

    fn withdrawal(&self, id: WithdrawalId) -> Option<Withdrawal>;
    fn withdrawals(&self, status: WithdrawalStatus) -> Vec<Withdrawal>;

    fn sidechain_tx(&self, id: SidechainTxId) -> Option<SidechainTx>;
    fn sidechain_txs(&self) -> Vec<SidechainTx>;
    fn sidechain_tx_for(&self, object_id: ObjectId) -> Option<SidechainTx>;

    /// The proposals still open at the head block
    fn proposals(&self) -> Vec<Proposal>;
}

#[derive(Debug)]
pub enum SubmitError {
    /// The host chain refused the transaction
    Rejected(String),
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SubmitError::Rejected(reason) => write!(f, "Host chain rejected: {}", reason),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Write capability to the host chain
pub trait HostChainSubmit: Send + Sync {
    /// File a proposal carrying the given operations
    fn propose(
        &self,
        proposer: SignerId,
        operations: Vec<HostOperation>,
        expiration: u64,
    ) -> Result<ProposalId, SubmitError>;

    /// Record our approval on a pending proposal
    fn approve(&self, approver: SignerId, proposal_id: ProposalId) -> Result<(), SubmitError>;

    /// Submit a direct (non-proposal) operation
    fn submit(&self, operation: HostOperation) -> Result<(), SubmitError>;

    /// Report a deposit observation; replays of the same uid are dropped
    fn sidechain_event(&self, event: SidechainEvent) -> Result<(), SubmitError>;
}
