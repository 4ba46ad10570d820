///! Thread subscribing to the node's ZMQ `hashblock` topic. Each notified
///! block hash is hex-encoded and pushed down a channel; the consumer decides
///! what fetching and scanning to do with it.
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    thread,
};

use bitcoin::hashes::hex::ToHex;

// How often the thread checks the shutdown flag while no block shows up
const RECV_TIMEOUT_MS: i32 = 500;

pub struct BlockListener {
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl BlockListener {
    /// Connect to the node's ZMQ publisher and start the listening thread
    pub fn start(
        ip: &str,
        zmq_port: u16,
        sender: mpsc::Sender<String>,
    ) -> Result<BlockListener, zmq::Error> {
        let context = zmq::Context::new();
        let socket = context.socket(zmq::SUB)?;
        socket.set_subscribe(b"hashblock")?;
        socket.set_linger(0)?;
        socket.set_rcvtimeo(RECV_TIMEOUT_MS)?;
        socket.connect(&format!("tcp://{}:{}", ip, zmq_port))?;
        log::info!("Listening for blocks on tcp://{}:{}", ip, zmq_port);

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let thread = thread::spawn(move || {
            while !flag.load(Ordering::Relaxed) {
                match socket.recv_multipart(0) {
                    Ok(frames) => {
                        // [topic, 32-byte block hash, sequence]
                        if frames.len() < 2 {
                            continue;
                        }
                        if sender.send(frames[1].to_hex()).is_err() {
                            // The consumer is gone, so are we
                            return;
                        }
                    }
                    // EAGAIN is just the receive timeout ticking over
                    Err(zmq::Error::EAGAIN) => {}
                    // Any other zmq error is recoverable: the next block
                    // notification brings the state back
                    Err(e) => {
                        log::trace!("zmq receive error: '{}'", e);
                    }
                }
            }
        });

        Ok(BlockListener {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop listening and join the thread
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
