//! Block header and block types.

use cinder_consensus::{BlockKind, Hash256};

use crate::encoding::{
    decode_list, encode_list, from_bytes, to_bytes, CodecError, Reader, WireDecode, WireEncode,
    Writer,
};
use crate::hash::sha256d;
use crate::merkle::merkle_root;
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxOut};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block: Hash256,
    pub merkle_root: Hash256,
    pub time: u32,
    pub bits: u32,
    pub burn_bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn hash(&self) -> Hash256 {
        sha256d(&to_bytes(self))
    }
}

impl WireEncode for BlockHeader {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u32(self.version);
        writer.put_hash(&self.prev_block);
        writer.put_hash(&self.merkle_root);
        writer.put_u32(self.time);
        writer.put_u32(self.bits);
        writer.put_u32(self.burn_bits);
        writer.put_u32(self.nonce);
    }
}

impl WireDecode for BlockHeader {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.u32()?,
            prev_block: reader.hash()?,
            merkle_root: reader.hash()?,
            time: reader.u32()?,
            bits: reader.u32()?,
            burn_bits: reader.u32()?,
            nonce: reader.u32()?,
        })
    }
}

/// Proof-of-burn claim carried by PoB blocks: which burn transaction backs
/// this block and the burn hash the miner computed for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PobFields {
    pub burn_block_hash: Hash256,
    pub burn_block_height: i32,
    pub burn_tx_index: u32,
    pub burn_out_index: u32,
    pub burn_hash: Hash256,
}

impl WireEncode for PobFields {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_hash(&self.burn_block_hash);
        writer.put_i32(self.burn_block_height);
        writer.put_u32(self.burn_tx_index);
        writer.put_u32(self.burn_out_index);
        writer.put_hash(&self.burn_hash);
    }
}

impl WireDecode for PobFields {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            burn_block_hash: reader.hash()?,
            burn_block_height: reader.i32()?,
            burn_tx_index: reader.u32()?,
            burn_out_index: reader.u32()?,
            burn_hash: reader.hash()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    /// Signature by the coinbase (PoW/PoB) or coinstake (PoS) payee key.
    pub signature: Vec<u8>,
    pub pob: Option<PobFields>,
    pub effective_burn_coins: i64,
}

impl Block {
    pub fn hash(&self) -> Hash256 {
        self.header.hash()
    }

    pub fn is_proof_of_stake(&self) -> bool {
        self.transactions.len() >= 2 && self.transactions[1].is_coinstake()
    }

    pub fn is_proof_of_burn(&self) -> bool {
        self.pob.is_some()
    }

    pub fn is_proof_of_work(&self) -> bool {
        !self.is_proof_of_stake() && !self.is_proof_of_burn()
    }

    pub fn kind(&self) -> BlockKind {
        if self.is_proof_of_burn() {
            BlockKind::Burn
        } else if self.is_proof_of_stake() {
            BlockKind::Stake
        } else {
            BlockKind::Work
        }
    }

    /// Stake kernel identity: the staked outpoint and the coinstake time.
    pub fn stake_kernel(&self) -> Option<(OutPoint, u32)> {
        if !self.is_proof_of_stake() {
            return None;
        }
        let coinstake = &self.transactions[1];
        Some((coinstake.vin[0].prevout, coinstake.time))
    }

    /// Burn kernel identity: the claimed burn hash and the parent block.
    pub fn burn_kernel(&self) -> Option<(Hash256, Hash256)> {
        self.pob
            .as_ref()
            .map(|pob| (pob.burn_hash, self.header.prev_block))
    }

    /// The output whose key must have signed this block.
    pub fn signing_output(&self) -> Option<&TxOut> {
        if self.is_proof_of_stake() {
            self.transactions.get(1).and_then(|tx| tx.vout.get(1))
        } else {
            self.transactions.first().and_then(|tx| tx.vout.first())
        }
    }

    pub fn compute_merkle_root(&self) -> Hash256 {
        let txids: Vec<Hash256> = self.transactions.iter().map(|tx| tx.txid()).collect();
        merkle_root(&txids)
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
}

impl WireEncode for Block {
    fn encode_into(&self, writer: &mut Writer) {
        self.header.encode_into(writer);
        encode_list(writer, &self.transactions);
        writer.put_var_bytes(&self.signature);
        match &self.pob {
            Some(pob) => {
                writer.put_u8(1);
                pob.encode_into(writer);
            }
            None => writer.put_u8(0),
        }
        writer.put_i64(self.effective_burn_coins);
    }
}

impl WireDecode for Block {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        let header = BlockHeader::decode_from(reader)?;
        let transactions = decode_list(reader)?;
        let signature = reader.var_bytes()?;
        let pob = match reader.u8()? {
            0 => None,
            1 => Some(PobFields::decode_from(reader)?),
            _ => return Err(CodecError::Invalid("invalid proof-of-burn marker")),
        };
        let effective_burn_coins = reader.i64()?;
        Ok(Self {
            header,
            transactions,
            signature,
            pob,
            effective_burn_coins,
        })
    }
}
