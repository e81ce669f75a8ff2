use pod_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::outpoint::OutPoint;

const MAX_SCRIPT_SIZE: usize = 10_000;
const MAX_TX_INPUTS: usize = 100_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn txid(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.digest()
    }

    /// A coinbase spends the null outpoint as its only input.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1
            && self.vin[0].prevout.hash == ZERO_HASH
            && self.vin[0].prevout.index == u32::MAX
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.consensus_encode_to(&mut encoder);
        encoder.into_inner()
    }

    pub fn consensus_encode_to(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_varint(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.consensus_encode_to(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_varint(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::consensus_decode_from(&mut decoder)?;
        if !decoder.is_empty() {
            return Err(DecodeError::Invalid("trailing bytes after transaction".to_string()));
        }
        Ok(tx)
    }

    pub fn consensus_decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let vin_count = decoder.read_varint()?;
        let vin_count =
            usize::try_from(vin_count).map_err(|_| DecodeError::Oversized("input count".to_string()))?;
        if vin_count > MAX_TX_INPUTS {
            return Err(DecodeError::Oversized("input count".to_string()));
        }
        let mut vin = Vec::with_capacity(vin_count.min(1024));
        for _ in 0..vin_count {
            let prevout = OutPoint::consensus_decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes(MAX_SCRIPT_SIZE)?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let vout_count = decoder.read_varint()?;
        let vout_count =
            usize::try_from(vout_count).map_err(|_| DecodeError::Oversized("output count".to_string()))?;
        if vout_count > MAX_TX_INPUTS {
            return Err(DecodeError::Oversized("output count".to_string()));
        }
        let mut vout = Vec::with_capacity(vout_count.min(1024));
        for _ in 0..vout_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes(MAX_SCRIPT_SIZE)?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [0x22; 32],
                    index: 3,
                },
                script_sig: vec![0x51, 0x52],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 5_000_000_000,
                script_pubkey: vec![0x76, 0xa9, 0x14],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint {
            hash: ZERO_HASH,
            index: u32::MAX,
        };
        assert!(tx.is_coinbase());
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut bytes = sample_tx().consensus_encode();
        bytes.push(0x00);
        assert!(Transaction::consensus_decode(&bytes).is_err());
    }
}
