//! P2P message framing and payload codecs.
//!
//! Every message on the wire is a 24-byte envelope (network magic, nul-padded
//! command, payload length, double-SHA256 checksum) followed by the payload.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use pod_chain::{ChainError, ChainErrorKind};
use pod_consensus::constants::{
    MAX_ADDR_PER_MSG, MAX_HEADERS_PER_MSG, MAX_INV_PER_MSG, MAX_LOCATOR_HASHES,
    MAX_MESSAGE_PAYLOAD, PROTOCOL_VERSION, USER_AGENT,
};
use pod_consensus::Hash256;
use pod_primitives::block::BlockHeader;
use pod_primitives::encoding::{DecodeError, Decoder, Encoder};
use pod_primitives::{sha256d, Block, Transaction};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MSG_TX: u32 = 1;
pub const MSG_BLOCK: u32 = 2;

const HEADER_SIZE: usize = 24;
const COMMAND_SIZE: usize = 12;
const NET_ADDR_SIZE: usize = 26;

pub const CMD_VERSION: &str = "version";
pub const CMD_VERACK: &str = "verack";
pub const CMD_PING: &str = "ping";
pub const CMD_PONG: &str = "pong";
pub const CMD_GETADDR: &str = "getaddr";
pub const CMD_ADDR: &str = "addr";
pub const CMD_INV: &str = "inv";
pub const CMD_GETDATA: &str = "getdata";
pub const CMD_NOTFOUND: &str = "notfound";
pub const CMD_GETBLOCKS: &str = "getblocks";
pub const CMD_GETHEADERS: &str = "getheaders";
pub const CMD_HEADERS: &str = "headers";
pub const CMD_BLOCK: &str = "block";
pub const CMD_TX: &str = "tx";
pub const CMD_REJECT: &str = "reject";
pub const CMD_SENDHEADERS: &str = "sendheaders";
pub const CMD_MEMPOOL: &str = "mempool";

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct InvVect {
    pub inv_type: u32,
    pub hash: Hash256,
}

impl InvVect {
    pub fn block(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_BLOCK,
            hash,
        }
    }

    pub fn tx(hash: Hash256) -> Self {
        Self {
            inv_type: MSG_TX,
            hash,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

impl RejectCode {
    pub fn as_u8(self) -> u8 {
        match self {
            RejectCode::Malformed => 0x01,
            RejectCode::Invalid => 0x10,
            RejectCode::Obsolete => 0x11,
            RejectCode::Duplicate => 0x12,
            RejectCode::Nonstandard => 0x40,
            RejectCode::Dust => 0x41,
            RejectCode::InsufficientFee => 0x42,
            RejectCode::Checkpoint => 0x43,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(RejectCode::Malformed),
            0x10 => Some(RejectCode::Invalid),
            0x11 => Some(RejectCode::Obsolete),
            0x12 => Some(RejectCode::Duplicate),
            0x40 => Some(RejectCode::Nonstandard),
            0x41 => Some(RejectCode::Dust),
            0x42 => Some(RejectCode::InsufficientFee),
            0x43 => Some(RejectCode::Checkpoint),
            _ => None,
        }
    }
}

/// Map a chain/pool error onto the reject code peers expect.
pub fn err_to_reject(err: &ChainError) -> (RejectCode, String) {
    let code = match err.kind {
        ChainErrorKind::Duplicate => RejectCode::Duplicate,
        ChainErrorKind::RuleViolation => RejectCode::Invalid,
        _ => RejectCode::Invalid,
    };
    (code, err.message.clone())
}

#[derive(Clone, Debug)]
pub struct Reject {
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
    pub hash: Option<Hash256>,
}

#[derive(Clone, Debug)]
pub struct VersionMessage {
    pub protocol_version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(services: u64, nonce: u64, start_height: i32, timestamp: i64) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            services,
            timestamp,
            nonce,
            user_agent: USER_AGENT.to_string(),
            start_height,
            relay: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct NetAddress {
    pub timestamp: u32,
    pub services: u64,
    pub addr: SocketAddr,
}

#[derive(Clone, Debug)]
pub enum NetMessage {
    Version(VersionMessage),
    Verack,
    Ping(u64),
    Pong(u64),
    GetAddr,
    Addr(Vec<NetAddress>),
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    GetBlocks {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    GetHeaders {
        locator: Vec<Hash256>,
        stop: Hash256,
    },
    Headers(Vec<BlockHeader>),
    Block(Arc<Block>),
    Tx(Arc<Transaction>),
    Reject(Reject),
    SendHeaders,
    Mempool,
    Unknown {
        command: String,
    },
}

impl NetMessage {
    pub fn command(&self) -> &str {
        match self {
            NetMessage::Version(_) => CMD_VERSION,
            NetMessage::Verack => CMD_VERACK,
            NetMessage::Ping(_) => CMD_PING,
            NetMessage::Pong(_) => CMD_PONG,
            NetMessage::GetAddr => CMD_GETADDR,
            NetMessage::Addr(_) => CMD_ADDR,
            NetMessage::Inv(_) => CMD_INV,
            NetMessage::GetData(_) => CMD_GETDATA,
            NetMessage::NotFound(_) => CMD_NOTFOUND,
            NetMessage::GetBlocks { .. } => CMD_GETBLOCKS,
            NetMessage::GetHeaders { .. } => CMD_GETHEADERS,
            NetMessage::Headers(_) => CMD_HEADERS,
            NetMessage::Block(_) => CMD_BLOCK,
            NetMessage::Tx(_) => CMD_TX,
            NetMessage::Reject(_) => CMD_REJECT,
            NetMessage::SendHeaders => CMD_SENDHEADERS,
            NetMessage::Mempool => CMD_MEMPOOL,
            NetMessage::Unknown { command } => command,
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        match self {
            NetMessage::Version(version) => encode_version(&mut encoder, version),
            NetMessage::Verack
            | NetMessage::GetAddr
            | NetMessage::SendHeaders
            | NetMessage::Mempool
            | NetMessage::Unknown { .. } => {}
            NetMessage::Ping(nonce) | NetMessage::Pong(nonce) => encoder.write_u64_le(*nonce),
            NetMessage::Addr(addrs) => encode_addr(&mut encoder, addrs),
            NetMessage::Inv(invs) | NetMessage::GetData(invs) | NetMessage::NotFound(invs) => {
                encode_inv(&mut encoder, invs)
            }
            NetMessage::GetBlocks { locator, stop } | NetMessage::GetHeaders { locator, stop } => {
                encode_locator(&mut encoder, locator, stop)
            }
            NetMessage::Headers(headers) => encode_headers(&mut encoder, headers),
            NetMessage::Block(block) => encoder.write_bytes(&block.consensus_encode()),
            NetMessage::Tx(tx) => encoder.write_bytes(&tx.consensus_encode()),
            NetMessage::Reject(reject) => encode_reject(&mut encoder, reject),
        }
        encoder.into_inner()
    }

    pub fn decode(command: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(payload);
        let message = match command {
            CMD_VERSION => NetMessage::Version(decode_version(&mut decoder)?),
            CMD_VERACK => NetMessage::Verack,
            CMD_PING => NetMessage::Ping(decoder.read_u64_le().unwrap_or(0)),
            CMD_PONG => NetMessage::Pong(decoder.read_u64_le().unwrap_or(0)),
            CMD_GETADDR => NetMessage::GetAddr,
            CMD_ADDR => NetMessage::Addr(decode_addr(&mut decoder)?),
            CMD_INV => NetMessage::Inv(decode_inv(&mut decoder)?),
            CMD_GETDATA => NetMessage::GetData(decode_inv(&mut decoder)?),
            CMD_NOTFOUND => NetMessage::NotFound(decode_inv(&mut decoder)?),
            CMD_GETBLOCKS => {
                let (locator, stop) = decode_locator(&mut decoder)?;
                NetMessage::GetBlocks { locator, stop }
            }
            CMD_GETHEADERS => {
                let (locator, stop) = decode_locator(&mut decoder)?;
                NetMessage::GetHeaders { locator, stop }
            }
            CMD_HEADERS => NetMessage::Headers(decode_headers(&mut decoder)?),
            CMD_BLOCK => NetMessage::Block(Arc::new(Block::consensus_decode(payload)?)),
            CMD_TX => NetMessage::Tx(Arc::new(Transaction::consensus_decode(payload)?)),
            CMD_REJECT => NetMessage::Reject(decode_reject(&mut decoder)?),
            CMD_SENDHEADERS => NetMessage::SendHeaders,
            CMD_MEMPOOL => NetMessage::Mempool,
            _ => NetMessage::Unknown {
                command: command.to_string(),
            },
        };
        Ok(message)
    }
}

fn encode_version(encoder: &mut Encoder, version: &VersionMessage) {
    encoder.write_i32_le(version.protocol_version);
    encoder.write_u64_le(version.services);
    encoder.write_i64_le(version.timestamp);
    write_net_addr_fields(encoder, version.services, [0u8; 16], 0);
    write_net_addr_fields(encoder, version.services, [0u8; 16], 0);
    encoder.write_u64_le(version.nonce);
    encoder.write_var_str(&version.user_agent);
    encoder.write_i32_le(version.start_height);
    encoder.write_u8(u8::from(version.relay));
}

fn decode_version(decoder: &mut Decoder<'_>) -> Result<VersionMessage, DecodeError> {
    let protocol_version = decoder.read_i32_le()?;
    let services = decoder.read_u64_le()?;
    let timestamp = decoder.read_i64_le()?;
    decoder.read_bytes(NET_ADDR_SIZE)?;
    decoder.read_bytes(NET_ADDR_SIZE)?;
    let nonce = decoder.read_u64_le()?;
    let user_agent = decoder.read_var_str(256)?;
    let start_height = decoder.read_i32_le()?;
    // The relay flag is optional for older peers.
    let relay = decoder.read_u8().map(|byte| byte != 0).unwrap_or(true);
    Ok(VersionMessage {
        protocol_version,
        services,
        timestamp,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn write_net_addr_fields(encoder: &mut Encoder, services: u64, ip: [u8; 16], port: u16) {
    encoder.write_u64_le(services);
    encoder.write_bytes(&ip);
    encoder.write_bytes(&port.to_be_bytes());
}

fn encode_addr(encoder: &mut Encoder, addrs: &[NetAddress]) {
    encoder.write_varint(addrs.len() as u64);
    for entry in addrs {
        encoder.write_u32_le(entry.timestamp);
        encoder.write_u64_le(entry.services);
        let ip6 = match entry.addr.ip() {
            IpAddr::V4(ip4) => ip4.to_ipv6_mapped(),
            IpAddr::V6(ip6) => ip6,
        };
        encoder.write_bytes(&ip6.octets());
        encoder.write_bytes(&entry.addr.port().to_be_bytes());
    }
}

fn decode_addr(decoder: &mut Decoder<'_>) -> Result<Vec<NetAddress>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::Oversized("addr count".to_string()))?;
    if count > MAX_ADDR_PER_MSG {
        return Err(DecodeError::Oversized("addr count".to_string()));
    }
    let mut addrs = Vec::with_capacity(count);
    for _ in 0..count {
        let timestamp = decoder.read_u32_le()?;
        let services = decoder.read_u64_le()?;
        let ip_bytes = decoder.read_fixed::<16>()?;
        let port_bytes = decoder.read_fixed::<2>()?;
        let port = u16::from_be_bytes(port_bytes);
        if port == 0 {
            continue;
        }
        let ip6 = Ipv6Addr::from(ip_bytes);
        let ip = if let Some(ip4) = ip6.to_ipv4_mapped() {
            IpAddr::V4(ip4)
        } else {
            IpAddr::V6(ip6)
        };
        if ip.is_unspecified() || ip.is_loopback() {
            continue;
        }
        addrs.push(NetAddress {
            timestamp,
            services,
            addr: SocketAddr::new(ip, port),
        });
    }
    Ok(addrs)
}

fn encode_inv(encoder: &mut Encoder, invs: &[InvVect]) {
    encoder.write_varint(invs.len() as u64);
    for inv in invs {
        encoder.write_u32_le(inv.inv_type);
        encoder.write_hash(&inv.hash);
    }
}

fn decode_inv(decoder: &mut Decoder<'_>) -> Result<Vec<InvVect>, DecodeError> {
    let count = decoder.read_varint()?;
    let count = usize::try_from(count).map_err(|_| DecodeError::Oversized("inv count".to_string()))?;
    if count > MAX_INV_PER_MSG {
        return Err(DecodeError::Oversized("inv count".to_string()));
    }
    let mut invs = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        invs.push(InvVect {
            inv_type: decoder.read_u32_le()?,
            hash: decoder.read_hash()?,
        });
    }
    Ok(invs)
}

fn encode_locator(encoder: &mut Encoder, locator: &[Hash256], stop: &Hash256) {
    encoder.write_i32_le(PROTOCOL_VERSION);
    encoder.write_varint(locator.len() as u64);
    for hash in locator {
        encoder.write_hash(hash);
    }
    encoder.write_hash(stop);
}

fn decode_locator(decoder: &mut Decoder<'_>) -> Result<(Vec<Hash256>, Hash256), DecodeError> {
    let _protocol_version = decoder.read_i32_le()?;
    let count = decoder.read_varint()?;
    let count =
        usize::try_from(count).map_err(|_| DecodeError::Oversized("locator count".to_string()))?;
    if count > MAX_LOCATOR_HASHES {
        return Err(DecodeError::Oversized("locator count".to_string()));
    }
    let mut locator = Vec::with_capacity(count);
    for _ in 0..count {
        locator.push(decoder.read_hash()?);
    }
    let stop = decoder.read_hash()?;
    Ok((locator, stop))
}

fn encode_headers(encoder: &mut Encoder, headers: &[BlockHeader]) {
    encoder.write_varint(headers.len() as u64);
    for header in headers {
        header.consensus_encode_to(encoder);
        // Headers on the wire carry an always-zero tx count.
        encoder.write_varint(0);
    }
}

fn decode_headers(decoder: &mut Decoder<'_>) -> Result<Vec<BlockHeader>, DecodeError> {
    let count = decoder.read_varint()?;
    let count =
        usize::try_from(count).map_err(|_| DecodeError::Oversized("header count".to_string()))?;
    if count > MAX_HEADERS_PER_MSG {
        return Err(DecodeError::Oversized("header count".to_string()));
    }
    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let header = BlockHeader::consensus_decode_from(decoder)?;
        let _tx_count = decoder.read_varint()?;
        headers.push(header);
    }
    Ok(headers)
}

fn encode_reject(encoder: &mut Encoder, reject: &Reject) {
    encoder.write_var_str(&reject.message);
    encoder.write_u8(reject.code.as_u8());
    encoder.write_var_str(&reject.reason);
    if let Some(hash) = &reject.hash {
        encoder.write_hash(hash);
    }
}

fn decode_reject(decoder: &mut Decoder<'_>) -> Result<Reject, DecodeError> {
    let message = decoder.read_var_str(COMMAND_SIZE)?;
    let code = RejectCode::from_u8(decoder.read_u8()?)
        .ok_or_else(|| DecodeError::Invalid("unknown reject code".to_string()))?;
    let reason = decoder.read_var_str(256)?;
    let hash = if decoder.remaining() >= 32 {
        Some(decoder.read_hash()?)
    } else {
        None
    };
    Ok(Reject {
        message,
        code,
        reason,
        hash,
    })
}

/// Serialize a full message envelope ready for the socket.
pub fn build_frame(magic: [u8; 4], command: &str, payload: &[u8]) -> Result<Vec<u8>, String> {
    let cmd = command.as_bytes();
    if cmd.len() > COMMAND_SIZE {
        return Err(format!("command {command} too long"));
    }
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&magic);
    let mut command_bytes = [0u8; COMMAND_SIZE];
    command_bytes[..cmd.len()].copy_from_slice(cmd);
    frame.extend_from_slice(&command_bytes);
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let checksum = sha256d(payload);
    frame.extend_from_slice(&checksum[..4]);
    frame.extend_from_slice(payload);
    Ok(frame)
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    magic: [u8; 4],
    message: &NetMessage,
) -> Result<usize, String> {
    let payload = message.encode_payload();
    let frame = build_frame(magic, message.command(), &payload)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|err| err.to_string())?;
    Ok(frame.len())
}

/// Read one envelope off the socket and return (command, payload, wire bytes).
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    magic: [u8; 4],
) -> Result<(String, Vec<u8>, usize), String> {
    let mut header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|err| err.to_string())?;
    if header[..4] != magic {
        return Err("invalid message magic".to_string());
    }
    let command = header[4..4 + COMMAND_SIZE]
        .iter()
        .take_while(|byte| **byte != 0)
        .map(|byte| *byte as char)
        .collect::<String>();
    let length = u32::from_le_bytes([header[16], header[17], header[18], header[19]]) as usize;
    if length > MAX_MESSAGE_PAYLOAD {
        return Err(format!("payload for {command} too large: {length}"));
    }
    let checksum = [header[20], header[21], header[22], header[23]];
    let mut payload = vec![0u8; length];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|err| err.to_string())?;
    let calc = sha256d(&payload);
    if checksum != calc[..4] {
        return Err(format!("invalid payload checksum for {command}"));
    }
    Ok((command, payload, HEADER_SIZE + length))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inv_payload_roundtrip() {
        let invs = vec![InvVect::block([0x11; 32]), InvVect::tx([0x22; 32])];
        let payload = NetMessage::Inv(invs.clone()).encode_payload();
        match NetMessage::decode(CMD_INV, &payload).expect("decode") {
            NetMessage::Inv(decoded) => assert_eq!(decoded, invs),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn getheaders_roundtrip() {
        let locator = vec![[0x01; 32], [0x02; 32]];
        let stop = [0x03; 32];
        let payload = NetMessage::GetHeaders {
            locator: locator.clone(),
            stop,
        }
        .encode_payload();
        match NetMessage::decode(CMD_GETHEADERS, &payload).expect("decode") {
            NetMessage::GetHeaders {
                locator: decoded_locator,
                stop: decoded_stop,
            } => {
                assert_eq!(decoded_locator, locator);
                assert_eq!(decoded_stop, stop);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn headers_carry_zero_tx_count() {
        let header = BlockHeader {
            version: 2,
            prev_block: [0x04; 32],
            merkle_root: [0x05; 32],
            timestamp: 1_400_000_000,
            bits: 0x1d00ffff,
            nonce: 9,
        };
        let payload = NetMessage::Headers(vec![header]).encode_payload();
        // varint count + 80 header bytes + varint tx count.
        assert_eq!(payload.len(), 1 + 80 + 1);
        match NetMessage::decode(CMD_HEADERS, &payload).expect("decode") {
            NetMessage::Headers(decoded) => assert_eq!(decoded, vec![header]),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn reject_roundtrip_with_hash() {
        let reject = Reject {
            message: CMD_BLOCK.to_string(),
            code: RejectCode::Invalid,
            reason: "bad-block".to_string(),
            hash: Some([0x07; 32]),
        };
        let payload = NetMessage::Reject(reject).encode_payload();
        match NetMessage::decode(CMD_REJECT, &payload).expect("decode") {
            NetMessage::Reject(decoded) => {
                assert_eq!(decoded.message, CMD_BLOCK);
                assert_eq!(decoded.code, RejectCode::Invalid);
                assert_eq!(decoded.reason, "bad-block");
                assert_eq!(decoded.hash, Some([0x07; 32]));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn frame_rejects_corrupt_checksum() {
        let payload = NetMessage::Ping(7).encode_payload();
        let magic = [0xf9, 0xc9, 0xb7, 0xdd];
        let mut frame = build_frame(magic, CMD_PING, &payload).expect("frame");
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let result = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime")
            .block_on(async {
                let mut cursor = std::io::Cursor::new(frame);
                read_message(&mut cursor, magic).await
            });
        assert!(result.is_err());
    }

    #[test]
    fn addr_skips_unroutable_entries() {
        let addrs = vec![
            NetAddress {
                timestamp: 1,
                services: 1,
                addr: "10.1.2.3:11047".parse().expect("addr"),
            },
            NetAddress {
                timestamp: 1,
                services: 1,
                addr: "127.0.0.1:11047".parse().expect("addr"),
            },
        ];
        let payload = NetMessage::Addr(addrs).encode_payload();
        match NetMessage::decode(CMD_ADDR, &payload).expect("decode") {
            NetMessage::Addr(decoded) => {
                assert_eq!(decoded.len(), 1);
                assert_eq!(decoded[0].addr, "10.1.2.3:11047".parse().expect("addr"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
