//! Transaction outpoint type.

use cinder_consensus::{Hash256, ZERO_HASH};

use crate::encoding::{CodecError, Reader, WireDecode, WireEncode, Writer};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPoint {
    pub hash: Hash256,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash256, index: u32) -> Self {
        Self { hash, index }
    }

    pub fn null() -> Self {
        Self {
            hash: ZERO_HASH,
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == ZERO_HASH && self.index == u32::MAX
    }
}

impl WireEncode for OutPoint {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_hash(&self.hash);
        writer.put_u32(self.index);
    }
}

impl WireDecode for OutPoint {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        let hash = reader.hash()?;
        let index = reader.u32()?;
        Ok(Self { hash, index })
    }
}
