//! The long-lived actors gluing everything together.
//!
//! A [Coordinator] owns the ZMQ block listener, a dispatcher spawning one
//! detached handler per block event, and the debounced observer fed by the
//! host chain's change feed. The embedding node constructs it with its
//! [HostChainView]/[HostChainSubmit] capabilities and a [BitcoinRpc], calls
//! [Coordinator::notify_changed_objects] on every change batch, and
//! [Coordinator::shutdown] to wind the threads down cleanly.

use std::{
    fmt,
    sync::{mpsc, Arc},
    thread,
    time::Duration,
};

use serde_json::Value as Json;

use crate::bitcoind::interface::BitcoinRpc;
use crate::bitcoind::listener::BlockListener;
use crate::bitcoind::BitcoindError;
use crate::config::Config;
use crate::hostchain::{HostChainSubmit, HostChainView, ObjectId, Vault, VaultAddress};
use crate::sidechaind::SidechainD;
use crate::{proposals, signer, vault, watcher};

// How long a change burst is left coalescing before the processing pass runs
const CHANGE_DEBOUNCE: Duration = Duration::from_millis(5);

#[derive(Debug)]
pub enum CoordinatorError {
    /// Startup checks against the node failed; fatal
    Bitcoind(BitcoindError),
    /// The ZMQ subscription could not be set up; fatal
    Listener(zmq::Error),
}

impl fmt::Display for CoordinatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CoordinatorError::Bitcoind(e) => write!(f, "Setting up node connection: {}", e),
            CoordinatorError::Listener(e) => write!(f, "Setting up block subscription: {}", e),
        }
    }
}

impl std::error::Error for CoordinatorError {}

enum DebouncerMessage {
    Batch(Vec<ObjectId>),
    Shutdown,
}

// Collapses change-feed bursts: the callback runs once the line stayed quiet
// for the debounce delay, with every id received in between.
struct Debouncer {
    sender: mpsc::Sender<DebouncerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Debouncer {
    fn spawn<F>(delay: Duration, callback: F) -> Debouncer
    where
        F: Fn(Vec<ObjectId>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let thread = thread::spawn(move || loop {
            let mut pending = match receiver.recv() {
                Ok(DebouncerMessage::Batch(ids)) => ids,
                Ok(DebouncerMessage::Shutdown) | Err(_) => return,
            };
            loop {
                match receiver.recv_timeout(delay) {
                    Ok(DebouncerMessage::Batch(more)) => pending.extend(more),
                    Ok(DebouncerMessage::Shutdown) => return,
                    Err(mpsc::RecvTimeoutError::Timeout) => break,
                    Err(mpsc::RecvTimeoutError::Disconnected) => return,
                }
            }
            callback(pending);
        });

        Debouncer {
            sender,
            thread: Some(thread),
        }
    }

    fn notify(&self, ids: Vec<ObjectId>) {
        let _ = self.sender.send(DebouncerMessage::Batch(ids));
    }

    fn shutdown(&mut self) {
        let _ = self.sender.send(DebouncerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// One full pass over everything the federation might have to act on. Every
/// step is idempotent, so running it again is always safe.
pub fn process_round(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
) {
    proposals::process_proposals(d, rpc, view, submit);
    vault::process_vaults(d, rpc, view, submit);
    proposals::process_deposits(d, rpc, view, submit);
    proposals::process_withdrawals(d, rpc, view, submit);
    signer::process_sidechain_transactions(d, rpc, view, submit);
    signer::send_sidechain_transactions(d, rpc, view, submit);
}

// Make the node wallet watch a vault: the address and its witness script,
// plus the count-based multisig registration the wallet signs along with.
fn import_vault_address(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    vault: &Vault,
    address: &VaultAddress,
) {
    signer::maybe_unlock_wallet(d, rpc);

    if let Err(e) = rpc.import_address(&address.address) {
        log::warn!("Error importing address '{}': '{}'", address.address, e);
    }
    if let Err(e) = rpc.import_address(&address.redeem_script) {
        log::warn!("Error importing redeem script of '{}': '{}'", address.address, e);
    }

    let pubkeys: Vec<String> = vault
        .signers
        .iter()
        .map(|s| s.sidechain_pubkey.clone())
        .collect();
    let nrequired = pubkeys.len() as u32 * 2 / 3 + 1;
    if let Err(e) = rpc.add_multisig_address(nrequired, &pubkeys) {
        log::warn!("Error registering multisig for '{}': '{}'", address.address, e);
    }
}

fn handle_changed_objects(
    d: &SidechainD,
    rpc: &dyn BitcoinRpc,
    view: &dyn HostChainView,
    submit: &dyn HostChainSubmit,
    ids: Vec<ObjectId>,
) {
    log::debug!("Processing {} changed objects", ids.len());
    for id in &ids {
        if let ObjectId::Vault(vault_id) = id {
            if let Some(vault) = view.vault(*vault_id) {
                if let Some(address) = vault.address.clone() {
                    import_vault_address(d, rpc, &vault, &address);
                }
            }
        }
    }

    process_round(d, rpc, view, submit);
}

pub struct Coordinator {
    state: Arc<SidechainD>,
    rpc: Arc<dyn BitcoinRpc>,
    view: Arc<dyn HostChainView>,
    submit: Arc<dyn HostChainSubmit>,
    config: Config,
    listener: Option<BlockListener>,
    dispatcher: Option<thread::JoinHandle<()>>,
    debouncer: Debouncer,
}

impl Coordinator {
    /// Set up the coordinator: probe the node, detect the network, load the
    /// configured wallet. An unreachable node fails startup right away.
    pub fn new(
        config: Config,
        rpc: Arc<dyn BitcoinRpc>,
        view: Arc<dyn HostChainView>,
        submit: Arc<dyn HostChainSubmit>,
    ) -> Result<Coordinator, CoordinatorError> {
        let chain_info = rpc
            .get_blockchain_info()
            .map_err(CoordinatorError::Bitcoind)?;
        let chain = chain_info
            .get("chain")
            .and_then(Json::as_str)
            .unwrap_or_default();
        let network = SidechainD::network_from_chain(chain);
        log::info!("Bitcoin node is on '{}', operating as {:?}", chain, network);

        if let Some(ref wallet) = config.bitcoin_wallet {
            if let Err(e) = rpc.load_wallet(wallet) {
                log::warn!("Error loading wallet '{}': '{}'", wallet, e);
            }
        }

        let state = Arc::new(SidechainD::from_config(&config, network));

        let debouncer = {
            let (state, rpc) = (state.clone(), rpc.clone());
            let (view, submit) = (view.clone(), submit.clone());
            Debouncer::spawn(CHANGE_DEBOUNCE, move |ids| {
                handle_changed_objects(&state, &*rpc, &*view, &*submit, ids)
            })
        };

        Ok(Coordinator {
            state,
            rpc,
            view,
            submit,
            config,
            listener: None,
            dispatcher: None,
            debouncer,
        })
    }

    /// Subscribe to the node's block topic and start handling notifications
    pub fn start(&mut self) -> Result<(), CoordinatorError> {
        let (sender, receiver) = mpsc::channel();
        let listener = BlockListener::start(
            &self.config.bitcoin_node_ip,
            self.config.bitcoin_node_zmq_port,
            sender,
        )
        .map_err(CoordinatorError::Listener)?;

        let rpc = self.rpc.clone();
        let (view, submit) = (self.view.clone(), self.submit.clone());
        let dispatcher = thread::spawn(move || {
            // One detached handler per event; a slow node never blocks the
            // next notification
            while let Ok(block_hash) = receiver.recv() {
                let (rpc, view, submit) = (rpc.clone(), view.clone(), submit.clone());
                thread::spawn(move || {
                    watcher::handle_block_event(&block_hash, &*rpc, &*view, &*submit)
                });
            }
        });

        self.listener = Some(listener);
        self.dispatcher = Some(dispatcher);
        Ok(())
    }

    /// The host chain's change feed entry point. There is no per-object
    /// subscription filter: every changed object is offered and the debounced
    /// pass sorts out what is actionable.
    pub fn notify_changed_objects(&self, ids: Vec<ObjectId>) {
        self.debouncer.notify(ids);
    }

    /// Run one processing pass on the caller thread
    pub fn process_round(&self) {
        process_round(&self.state, &*self.rpc, &*self.view, &*self.submit);
    }

    /// Stop the listener and the debounced observer, joining both. Detached
    /// event handlers run to completion; whatever they report after this is
    /// dropped by the host chain.
    pub fn shutdown(mut self) {
        if let Some(listener) = self.listener.take() {
            listener.stop();
        }
        // The listener owned the dispatcher's sender: it unblocks and exits
        if let Some(dispatcher) = self.dispatcher.take() {
            let _ = dispatcher.join();
        }
        self.debouncer.shutdown();
        log::info!("Coordinator shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostchain::memory::{ChainParams, MemoryChain};
    use crate::hostchain::{DepositId, VaultId};
    use crate::testutil::{install_vault, test_signers, MockRpc};
    use std::sync::Mutex;

    #[test]
    fn debouncer_coalesces_and_cancels() {
        let batches: Arc<Mutex<Vec<Vec<ObjectId>>>> = Arc::new(Mutex::new(Vec::new()));
        let seen = batches.clone();
        let mut debouncer = Debouncer::spawn(Duration::from_millis(30), move |ids| {
            seen.lock().unwrap().push(ids);
        });

        // A burst of changes collapses into a single callback
        debouncer.notify(vec![ObjectId::Vault(VaultId(1))]);
        debouncer.notify(vec![ObjectId::Deposit(DepositId(2))]);
        debouncer.notify(vec![ObjectId::Deposit(DepositId(3))]);
        thread::sleep(Duration::from_millis(120));
        {
            let batches = batches.lock().unwrap();
            assert_eq!(batches.len(), 1);
            assert_eq!(batches[0].len(), 3);
        }

        // Shutdown is clean and the callback never fires again
        debouncer.notify(vec![ObjectId::Vault(VaultId(9))]);
        debouncer.shutdown();
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn vault_change_imports_address() {
        let chain = Arc::new(MemoryChain::new(ChainParams::default()));
        let signers = test_signers(3);
        let address = install_vault(&chain, signers.clone());
        let rpc = Arc::new(MockRpc::new());

        use crate::hostchain::HostChainView;
        let vault = chain.active_vault().unwrap();
        let state = crate::testutil::signer_state(1);
        handle_changed_objects(
            &state,
            &*rpc,
            &*chain,
            &*chain,
            vec![ObjectId::Vault(vault.vault_id)],
        );

        let imported = rpc.imported.lock().unwrap();
        assert_eq!(imported.len(), 2);
        assert_eq!(imported[0], address.address);
        assert_eq!(imported[1], address.redeem_script);
    }

    #[test]
    fn coordinator_lifecycle() {
        let config = toml::from_str::<Config>(
            r#"
            bitcoin-node-ip = "127.0.0.1"
            bitcoin-node-rpc-port = 18332
            bitcoin-node-zmq-port = 28999
            bitcoin-node-rpc-user = "signer"
            bitcoin-node-rpc-password = "hunter2"
            "#,
        )
        .unwrap();
        let chain = Arc::new(MemoryChain::new(ChainParams::default()));
        let rpc = Arc::new(MockRpc::new());

        let mut coordinator =
            Coordinator::new(config, rpc, chain.clone(), chain).expect("node is reachable");
        // The mock node reports 'test': we must not be on mainnet
        assert_eq!(coordinator.state.network, bitcoin::Network::Testnet);

        // Start and wind down cleanly, nobody publishing blocks
        coordinator.start().expect("zmq connects lazily");
        coordinator.notify_changed_objects(vec![ObjectId::Vault(VaultId(42))]);
        thread::sleep(Duration::from_millis(30));
        coordinator.shutdown();
    }
}
