//! Coinbase height extraction, used only to refresh peer height estimates.

use pod_primitives::block::{BlockHeader, SERIALIZED_HEIGHT_VERSION};
use pod_primitives::Transaction;

/// Whether blocks with this header version serialize their height into the
/// coinbase script.
pub fn should_have_serialized_height(header: &BlockHeader) -> bool {
    header.version >= SERIALIZED_HEIGHT_VERSION
}

/// Pull the block height out of the first push of the coinbase script. The
/// height is a minimally-encoded little-endian script number.
pub fn extract_coinbase_height(coinbase: &Transaction) -> Result<i32, String> {
    if !coinbase.is_coinbase() {
        return Err("not a coinbase transaction".to_string());
    }
    let script = &coinbase.vin[0].script_sig;
    let Some(&opcode) = script.first() else {
        return Err("empty coinbase script".to_string());
    };
    // OP_1 through OP_16 push small heights directly.
    if (0x51..=0x60).contains(&opcode) {
        return Ok(i32::from(opcode) - 0x50);
    }
    let len = opcode as usize;
    if len == 0 || len > 8 {
        return Err(format!("invalid height push length {len}"));
    }
    if script.len() < 1 + len {
        return Err("coinbase script shorter than height push".to_string());
    }
    let mut height = 0i64;
    for (index, byte) in script[1..1 + len].iter().enumerate() {
        height |= i64::from(*byte) << (8 * index);
    }
    i32::try_from(height).map_err(|_| format!("serialized height {height} out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pod_consensus::ZERO_HASH;
    use pod_primitives::{OutPoint, TxIn, TxOut};

    fn coinbase_with_script(script_sig: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: ZERO_HASH,
                    index: u32::MAX,
                },
                script_sig,
                sequence: u32::MAX,
            }],
            vout: vec![TxOut {
                value: 0,
                script_pubkey: Vec::new(),
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn extracts_multi_byte_height() {
        // Height 300_000 = 0x0493e0, pushed little-endian.
        let tx = coinbase_with_script(vec![0x03, 0xe0, 0x93, 0x04]);
        assert_eq!(extract_coinbase_height(&tx).expect("height"), 300_000);
    }

    #[test]
    fn extracts_small_op_height() {
        let tx = coinbase_with_script(vec![0x53]);
        assert_eq!(extract_coinbase_height(&tx).expect("height"), 3);
    }

    #[test]
    fn rejects_truncated_push() {
        let tx = coinbase_with_script(vec![0x04, 0x01, 0x02]);
        assert!(extract_coinbase_height(&tx).is_err());
    }

    #[test]
    fn rejects_non_coinbase() {
        let mut tx = coinbase_with_script(vec![0x01, 0x01]);
        tx.vin[0].prevout.index = 0;
        assert!(extract_coinbase_height(&tx).is_err());
    }
}
