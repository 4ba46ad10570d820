pub mod interface;
pub mod listener;

use jsonrpc::simple_http;
use serde_json::Value as Json;

/// The error object of a JSONRPC response from the node
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    /// The error as the node sent it, for the logs
    pub raw: String,
}

/// An error happened talking to the Bitcoin full node
#[derive(Debug)]
pub enum BitcoindError {
    /// It can be related to us..
    Custom(String),
    /// ..to the transport..
    Server(jsonrpc::Error),
    /// ..or the node answered with an error object
    Node(RpcError),
}

impl BitcoindError {
    /// 'transaction already in block chain': a broadcaster treats this as done
    pub fn is_already_in_chain(&self) -> bool {
        matches!(self, BitcoindError::Node(RpcError { code: -27, .. }))
    }
}

impl std::fmt::Display for BitcoindError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            BitcoindError::Custom(ref s) => write!(f, "Bitcoin node error: {}", s),
            BitcoindError::Server(ref e) => write!(f, "Bitcoin node transport error: {}", e),
            BitcoindError::Node(ref e) => {
                write!(f, "Bitcoin node error response (code {}): {}", e.code, e.message)
            }
        }
    }
}

impl std::error::Error for BitcoindError {}

impl From<simple_http::Error> for BitcoindError {
    fn from(e: simple_http::Error) -> Self {
        Self::Server(jsonrpc::Error::Transport(Box::new(e)))
    }
}

impl From<jsonrpc::Error> for BitcoindError {
    fn from(e: jsonrpc::Error) -> Self {
        match e {
            jsonrpc::Error::Rpc(rpc) => Self::Node(RpcError {
                code: rpc.code,
                message: rpc.message.clone(),
                raw: format!("{:?}", rpc),
            }),
            other => Self::Server(other),
        }
    }
}

/// One bitcoin, in the satoshi unit the chain uses throughout
pub const COIN_SATS: u64 = 100_000_000;

/// Reinterpret a decimal BTC string as satoshis by removing the decimal point.
///
/// This is how the rest of the federation parses node amounts; do not replace
/// it with fixed-point arithmetic or approvals will diverge.
pub fn strip_decimal_point(amount: &str) -> Option<i64> {
    let digits: String = amount.chars().filter(|c| *c != '.').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Satoshis out of a node-sent amount field. The node always renders amounts
/// with 8 decimals, so re-rendering a JSON number at that width before
/// stripping yields the same integer as stripping the wire string.
pub fn json_amount_sats(value: &Json) -> Option<i64> {
    match value {
        Json::String(s) => strip_decimal_point(s),
        Json::Number(n) => strip_decimal_point(&format!("{:.8}", n.as_f64()?)),
        _ => None,
    }
}

/// Fixed 8-decimals rendering of an amount, the form the node expects back
pub fn format_btc(sats: u64) -> String {
    format!("{}.{:08}", sats / COIN_SATS, sats % COIN_SATS)
}
