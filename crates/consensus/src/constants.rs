//! Protocol-wide constants shared across the P2P stack.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_013;

/// The earliest protocol version that understands `sendheaders`.
pub const SENDHEADERS_VERSION: i32 = 70_012;

/// Service flag advertising a full node serving the whole chain.
pub const SF_NODE_NETWORK: u64 = 1;

/// The maximum number of inventory vectors in a single inv/getdata message
/// (network rule).
pub const MAX_INV_PER_MSG: usize = 50_000;

/// The maximum number of headers in a single headers message (network rule).
pub const MAX_HEADERS_PER_MSG: usize = 2_000;

/// The maximum number of entries in a single addr message (network rule).
pub const MAX_ADDR_PER_MSG: usize = 1_000;

/// The maximum number of hashes in a block locator.
pub const MAX_LOCATOR_HASHES: usize = 500;

/// The maximum allowed P2P message payload, in bytes.
pub const MAX_MESSAGE_PAYLOAD: usize = 32 * 1024 * 1024;

/// User agent advertised in version messages.
pub const USER_AGENT: &str = "/pod:0.1.0/";
