//! Serialized block index entries.

use cinder_consensus::{BlockKind, Hash256};
use cinder_primitives::block::BlockHeader;
use cinder_primitives::encoding::{CodecError, Reader, WireDecode, WireEncode, Writer};
use cinder_primitives::outpoint::OutPoint;

use crate::blockfiles::BlockFilePos;

const KIND_WORK: u8 = 0;
const KIND_STAKE: u8 = 1;
const KIND_BURN: u8 = 2;

/// One block's index metadata as written to the store. The `next_hash` field
/// is populated only while the block sits on the main chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockIndexRecord {
    pub header: BlockHeader,
    pub next_hash: Option<Hash256>,
    pub height: i64,
    pub pos: BlockFilePos,
    pub kind: BlockKind,
    /// Accumulated chain trust, little-endian 256-bit.
    pub chain_trust: [u8; 32],
    pub mint: i64,
    pub money_supply: i64,
    pub effective_burn_coins: i64,
    pub stake_modifier: u64,
    pub stake_modifier_checksum: u32,
    pub proof_of_stake_hash: Option<Hash256>,
    /// `(staked outpoint, coinstake time)` for PoS blocks.
    pub stake_kernel: Option<(OutPoint, u32)>,
    /// `(burn hash, parent hash)` for PoB blocks.
    pub burn_kernel: Option<(Hash256, Hash256)>,
}

impl BlockIndexRecord {
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = Writer::with_capacity(256);
        self.header.encode_into(&mut writer);
        match &self.next_hash {
            Some(hash) => {
                writer.put_u8(1);
                writer.put_hash(hash);
            }
            None => writer.put_u8(0),
        }
        writer.put_i64(self.height);
        writer.put_u32(self.pos.file);
        writer.put_u64(self.pos.offset);
        writer.put_u8(match self.kind {
            BlockKind::Work => KIND_WORK,
            BlockKind::Stake => KIND_STAKE,
            BlockKind::Burn => KIND_BURN,
        });
        writer.put_hash(&self.chain_trust);
        writer.put_i64(self.mint);
        writer.put_i64(self.money_supply);
        writer.put_i64(self.effective_burn_coins);
        writer.put_u64(self.stake_modifier);
        writer.put_u32(self.stake_modifier_checksum);
        match &self.proof_of_stake_hash {
            Some(hash) => {
                writer.put_u8(1);
                writer.put_hash(hash);
            }
            None => writer.put_u8(0),
        }
        match &self.stake_kernel {
            Some((outpoint, time)) => {
                writer.put_u8(1);
                outpoint.encode_into(&mut writer);
                writer.put_u32(*time);
            }
            None => writer.put_u8(0),
        }
        match &self.burn_kernel {
            Some((burn_hash, prev_hash)) => {
                writer.put_u8(1);
                writer.put_hash(burn_hash);
                writer.put_hash(prev_hash);
            }
            None => writer.put_u8(0),
        }
        writer.into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(bytes);
        let header = BlockHeader::decode_from(&mut reader)?;
        let next_hash = match reader.u8()? {
            0 => None,
            1 => Some(reader.hash()?),
            _ => return Err(CodecError::Invalid("invalid next marker")),
        };
        let height = reader.i64()?;
        let pos = BlockFilePos {
            file: reader.u32()?,
            offset: reader.u64()?,
        };
        let kind = match reader.u8()? {
            KIND_WORK => BlockKind::Work,
            KIND_STAKE => BlockKind::Stake,
            KIND_BURN => BlockKind::Burn,
            _ => return Err(CodecError::Invalid("invalid block kind")),
        };
        let chain_trust = reader.hash()?;
        let mint = reader.i64()?;
        let money_supply = reader.i64()?;
        let effective_burn_coins = reader.i64()?;
        let stake_modifier = reader.u64()?;
        let stake_modifier_checksum = reader.u32()?;
        let proof_of_stake_hash = match reader.u8()? {
            0 => None,
            1 => Some(reader.hash()?),
            _ => return Err(CodecError::Invalid("invalid stake hash marker")),
        };
        let stake_kernel = match reader.u8()? {
            0 => None,
            1 => {
                let outpoint = OutPoint::decode_from(&mut reader)?;
                let time = reader.u32()?;
                Some((outpoint, time))
            }
            _ => return Err(CodecError::Invalid("invalid stake kernel marker")),
        };
        let burn_kernel = match reader.u8()? {
            0 => None,
            1 => {
                let burn_hash = reader.hash()?;
                let prev_hash = reader.hash()?;
                Some((burn_hash, prev_hash))
            }
            _ => return Err(CodecError::Invalid("invalid burn kernel marker")),
        };
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(Self {
            header,
            next_hash,
            height,
            pos,
            kind,
            chain_trust,
            mint,
            money_supply,
            effective_burn_coins,
            stake_modifier,
            stake_modifier_checksum,
            proof_of_stake_hash,
            stake_kernel,
            burn_kernel,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> BlockIndexRecord {
        BlockIndexRecord {
            header: BlockHeader {
                version: 1,
                prev_block: [1u8; 32],
                merkle_root: [2u8; 32],
                time: 1_400_000_000,
                bits: 0x1e0fffff,
                burn_bits: 0x1f00ffff,
                nonce: 55,
            },
            next_hash: Some([3u8; 32]),
            height: 42,
            pos: BlockFilePos {
                file: 1,
                offset: 8_192,
            },
            kind: BlockKind::Stake,
            chain_trust: [4u8; 32],
            mint: 1_000,
            money_supply: 5_000,
            effective_burn_coins: 77,
            stake_modifier: 0xdead_beef_cafe_f00d,
            stake_modifier_checksum: 0x1234_5678,
            proof_of_stake_hash: Some([5u8; 32]),
            stake_kernel: Some((OutPoint::new([6u8; 32], 1), 1_400_000_100)),
            burn_kernel: None,
        }
    }

    #[test]
    fn record_round_trips() {
        let record = sample_record();
        let decoded = BlockIndexRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn record_round_trips_without_optionals() {
        let mut record = sample_record();
        record.next_hash = None;
        record.proof_of_stake_hash = None;
        record.stake_kernel = None;
        record.kind = BlockKind::Work;
        let decoded = BlockIndexRecord::decode(&record.encode()).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn truncated_record_fails() {
        let bytes = sample_record().encode();
        assert!(BlockIndexRecord::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
