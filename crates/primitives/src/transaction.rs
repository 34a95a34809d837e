//! Transaction types and serialization.

use cinder_consensus::constants::{LOCKTIME_THRESHOLD, MAX_BLOCK_SIZE_GEN};
use cinder_consensus::money::{money_range, Amount, CENT, MAX_MONEY, MIN_TX_FEE};
use cinder_consensus::Hash256;

use crate::encoding::{
    decode_list, encode_list, from_bytes, to_bytes, CodecError, Reader, WireDecode, WireEncode,
    Writer,
};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn from_outpoint(prevout: OutPoint) -> Self {
        Self {
            prevout,
            script_sig: Vec::new(),
            sequence: u32::MAX,
        }
    }
}

impl WireEncode for TxIn {
    fn encode_into(&self, writer: &mut Writer) {
        self.prevout.encode_into(writer);
        writer.put_var_bytes(&self.script_sig);
        writer.put_u32(self.sequence);
    }
}

impl WireDecode for TxIn {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            prevout: OutPoint::decode_from(reader)?,
            script_sig: reader.var_bytes()?,
            sequence: reader.u32()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        Self {
            value,
            script_pubkey,
        }
    }

    pub fn empty() -> Self {
        Self {
            value: 0,
            script_pubkey: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.value == 0 && self.script_pubkey.is_empty()
    }
}

impl WireEncode for TxOut {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_i64(self.value);
        writer.put_var_bytes(&self.script_pubkey);
    }
}

impl WireDecode for TxOut {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            value: reader.i64()?,
            script_pubkey: reader.var_bytes()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub version: u32,
    pub time: u32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.to_wire_bytes())
    }

    pub fn to_wire_bytes(&self) -> Vec<u8> {
        to_bytes(self)
    }

    pub fn from_wire_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        from_bytes(bytes)
    }

    pub fn serialized_size(&self) -> usize {
        self.to_wire_bytes().len()
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    /// Coinstake: at least one input, first output empty, second output real.
    pub fn is_coinstake(&self) -> bool {
        !self.vin.is_empty()
            && !self.vin[0].prevout.is_null()
            && self.vout.len() >= 2
            && self.vout[0].is_empty()
            && !self.vout[1].is_empty()
    }

    pub fn value_out(&self) -> Amount {
        self.vout.iter().map(|output| output.value).sum()
    }

    /// Index of the first output paying the canonical burn script.
    pub fn burn_output_index(&self, burn_script: &[u8]) -> Option<usize> {
        self.vout
            .iter()
            .position(|output| output.script_pubkey == burn_script)
    }

    pub fn is_burn_tx(&self, burn_script: &[u8]) -> bool {
        self.burn_output_index(burn_script).is_some()
    }

    pub fn is_final(&self, height: i64, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let threshold = if self.lock_time < LOCKTIME_THRESHOLD {
            height
        } else {
            block_time
        };
        if (self.lock_time as i64) < threshold {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == u32::MAX)
    }

    /// Required fee for this transaction; `block_size` above 1 engages the
    /// nearly-full-block ramp used while assembling blocks.
    pub fn min_fee(&self, block_size: usize) -> Amount {
        let bytes = self.serialized_size();
        let new_block_size = block_size + bytes;
        let mut fee = (1 + bytes as Amount / 1000) * MIN_TX_FEE;

        if fee < MIN_TX_FEE && self.vout.iter().any(|output| output.value < CENT) {
            fee = MIN_TX_FEE;
        }

        if block_size != 1 && new_block_size >= MAX_BLOCK_SIZE_GEN / 2 {
            if new_block_size >= MAX_BLOCK_SIZE_GEN {
                return MAX_MONEY;
            }
            fee *= (MAX_BLOCK_SIZE_GEN / (MAX_BLOCK_SIZE_GEN - new_block_size)) as Amount;
        }

        if !money_range(fee) {
            return MAX_MONEY;
        }
        fee
    }
}

impl WireEncode for Transaction {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u32(self.version);
        writer.put_u32(self.time);
        encode_list(writer, &self.vin);
        encode_list(writer, &self.vout);
        writer.put_u32(self.lock_time);
    }
}

impl WireDecode for Transaction {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.u32()?,
            time: reader.u32()?,
            vin: decode_list(reader)?,
            vout: decode_list(reader)?,
            lock_time: reader.u32()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            time: 1000,
            vin: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: vec![0x04, 0x01, 0x02, 0x03, 0x04],
                sequence: u32::MAX,
            }],
            vout: vec![TxOut::new(50 * cinder_consensus::money::COIN, vec![0x51])],
            lock_time: 0,
        }
    }

    #[test]
    fn classifies_coinbase() {
        let tx = coinbase();
        assert!(tx.is_coinbase());
        assert!(!tx.is_coinstake());
    }

    #[test]
    fn classifies_coinstake() {
        let tx = Transaction {
            version: 1,
            time: 1000,
            vin: vec![TxIn::from_outpoint(OutPoint::new([1u8; 32], 0))],
            vout: vec![TxOut::empty(), TxOut::new(10, vec![0x51])],
            lock_time: 0,
        };
        assert!(tx.is_coinstake());
        assert!(!tx.is_coinbase());
    }

    #[test]
    fn lock_time_zero_is_final() {
        let mut tx = coinbase();
        tx.lock_time = 0;
        assert!(tx.is_final(0, 0));
    }

    #[test]
    fn height_lock_respects_threshold() {
        let mut tx = coinbase();
        tx.vin[0].sequence = 0;
        tx.lock_time = 100;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
        tx.lock_time = LOCKTIME_THRESHOLD + 500;
        assert!(!tx.is_final(1_000_000, (LOCKTIME_THRESHOLD + 500) as i64));
        assert!(tx.is_final(1_000_000, (LOCKTIME_THRESHOLD + 501) as i64));
    }

    #[test]
    fn max_sequence_overrides_lock_time() {
        let mut tx = coinbase();
        tx.lock_time = u32::MAX;
        assert!(tx.is_final(0, 0));
    }

    #[test]
    fn min_fee_scales_with_size() {
        let mut tx = coinbase();
        assert_eq!(tx.min_fee(1), MIN_TX_FEE);
        tx.vin[0].script_sig = vec![0u8; 2000];
        assert_eq!(tx.min_fee(1), 3 * MIN_TX_FEE);
    }
}
