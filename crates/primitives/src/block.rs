use pod_consensus::Hash256;

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::transaction::Transaction;

const MAX_BLOCK_TXNS: usize = 1_000_000;

/// Block versions from this one on serialize the block height into the
/// coinbase script.
pub const SERIALIZED_HEIGHT_VERSION: i32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.digest()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_hash(&self.prev_block);
        encoder.write_hash(&self.merkle_root);
        encoder.write_u32_le(self.timestamp);
        encoder.write_u32_le(self.bits);
        encoder.write_u32_le(self.nonce);
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            version: decoder.read_i32_le()?,
            prev_block: decoder.read_hash()?,
            merkle_root: decoder.read_hash()?,
            timestamp: decoder.read_u32_le()?,
            bits: decoder.read_u32_le()?,
            nonce: decoder.read_u32_le()?,
        })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.header.consensus_encode_to(&mut encoder);
        encoder.write_varint(self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.consensus_encode_to(&mut encoder);
        }
        encoder.into_inner()
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let header = BlockHeader::consensus_decode_from(&mut decoder)?;
        let count = decoder.read_varint()?;
        let count =
            usize::try_from(count).map_err(|_| DecodeError::Oversized("tx count".to_string()))?;
        if count > MAX_BLOCK_TXNS {
            return Err(DecodeError::Oversized("tx count".to_string()));
        }
        let mut transactions = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode_from(&mut decoder)?);
        }
        if !decoder.is_empty() {
            return Err(DecodeError::Invalid("trailing bytes after block".to_string()));
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outpoint::OutPoint;
    use crate::transaction::{TxIn, TxOut};
    use pod_consensus::ZERO_HASH;

    fn sample_block() -> Block {
        Block {
            header: BlockHeader {
                version: 2,
                prev_block: [0x01; 32],
                merkle_root: [0x02; 32],
                timestamp: 1_400_000_000,
                bits: 0x1d00ffff,
                nonce: 42,
            },
            transactions: vec![Transaction {
                version: 1,
                vin: vec![TxIn {
                    prevout: OutPoint {
                        hash: ZERO_HASH,
                        index: u32::MAX,
                    },
                    script_sig: vec![0x02, 0x10, 0x00],
                    sequence: u32::MAX,
                }],
                vout: vec![TxOut {
                    value: 5_000_000_000,
                    script_pubkey: vec![0x51],
                }],
                lock_time: 0,
            }],
        }
    }

    #[test]
    fn header_encoding_is_80_bytes() {
        let mut encoder = Encoder::new();
        sample_block().header.consensus_encode_to(&mut encoder);
        assert_eq!(encoder.len(), 80);
    }

    #[test]
    fn block_roundtrip() {
        let block = sample_block();
        let bytes = block.consensus_encode();
        let decoded = Block::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }

    #[test]
    fn header_hash_commits_to_nonce() {
        let block = sample_block();
        let mut other = block.header;
        other.nonce += 1;
        assert_ne!(block.header.hash(), other.hash());
    }
}
