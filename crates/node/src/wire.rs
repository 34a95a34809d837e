//! Gossip frame and payload codec.
//!
//! Frames are `magic ‖ command[12] ‖ length ‖ checksum ‖ payload`, with the
//! checksum being the first four bytes of the payload's double-SHA-256.

use cinder_consensus::constants::{MAX_ADDR_ENTRIES, MAX_INV_ENTRIES};
use cinder_consensus::Hash256;
use cinder_primitives::block::Block;
use cinder_primitives::encoding::{CodecError, Reader, WireDecode, WireEncode, Writer};
use cinder_primitives::hash::sha256d;
use cinder_primitives::transaction::Transaction;

pub const COMMAND_LEN: usize = 12;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvKind {
    Transaction = 1,
    Block = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Inventory {
    pub kind_raw: u32,
    pub hash: Hash256,
}

impl Inventory {
    pub fn transaction(hash: Hash256) -> Self {
        Self {
            kind_raw: InvKind::Transaction as u32,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        Self {
            kind_raw: InvKind::Block as u32,
            hash,
        }
    }

    pub fn kind(&self) -> Option<InvKind> {
        match self.kind_raw {
            1 => Some(InvKind::Transaction),
            2 => Some(InvKind::Block),
            _ => None,
        }
    }
}

impl WireEncode for Inventory {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u32(self.kind_raw);
        writer.put_hash(&self.hash);
    }
}

impl WireDecode for Inventory {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            kind_raw: reader.u32()?,
            hash: reader.hash()?,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NetAddr {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddr {
    pub fn unroutable() -> Self {
        Self {
            services: 0,
            ip: [0u8; 16],
            port: 0,
        }
    }
}

impl WireEncode for NetAddr {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u64(self.services);
        writer.put_bytes(&self.ip);
        writer.put_bytes(&self.port.to_be_bytes());
    }
}

impl WireDecode for NetAddr {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        let services = reader.u64()?;
        let ip = reader.array::<16>()?;
        let port_bytes = reader.array::<2>()?;
        Ok(Self {
            services,
            ip,
            port: u16::from_be_bytes(port_bytes),
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TimedNetAddr {
    pub time: u32,
    pub addr: NetAddr,
}

impl WireEncode for TimedNetAddr {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_u32(self.time);
        self.addr.encode_into(writer);
    }
}

impl WireDecode for TimedNetAddr {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            time: reader.u32()?,
            addr: NetAddr::decode_from(reader)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct VersionPayload {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddr,
    pub addr_from: NetAddr,
    pub nonce: u64,
    pub sub_version: String,
    pub start_height: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AlertPayload {
    pub version: i32,
    pub relay_until: i64,
    pub expiration: i64,
    pub id: i32,
    pub cancel: i32,
    pub min_ver: i32,
    pub max_ver: i32,
    pub priority: i32,
    pub comment: String,
    pub status_bar: String,
}

impl WireEncode for AlertPayload {
    fn encode_into(&self, writer: &mut Writer) {
        writer.put_i32(self.version);
        writer.put_i64(self.relay_until);
        writer.put_i64(self.expiration);
        writer.put_i32(self.id);
        writer.put_i32(self.cancel);
        writer.put_i32(self.min_ver);
        writer.put_i32(self.max_ver);
        writer.put_i32(self.priority);
        writer.put_var_str(&self.comment);
        writer.put_var_str(&self.status_bar);
    }
}

impl WireDecode for AlertPayload {
    fn decode_from(reader: &mut Reader) -> Result<Self, CodecError> {
        Ok(Self {
            version: reader.i32()?,
            relay_until: reader.i64()?,
            expiration: reader.i64()?,
            id: reader.i32()?,
            cancel: reader.i32()?,
            min_ver: reader.i32()?,
            max_ver: reader.i32()?,
            priority: reader.i32()?,
            comment: reader.var_str()?,
            status_bar: reader.var_str()?,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetMessage {
    Version(VersionPayload),
    Verack,
    Addr(Vec<TimedNetAddr>),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    GetBlocks {
        locator: Vec<Hash256>,
        hash_stop: Hash256,
    },
    GetHeaders {
        locator: Vec<Hash256>,
        hash_stop: Hash256,
    },
    Tx(Transaction),
    Block(Block),
    Headers(Vec<cinder_primitives::block::BlockHeader>),
    Ping(u64),
    Pong(u64),
    Alert {
        payload: Vec<u8>,
        signature: Vec<u8>,
    },
    Checkpoint {
        hash: Hash256,
        signature: Vec<u8>,
    },
}

impl NetMessage {
    pub fn command(&self) -> &'static str {
        match self {
            NetMessage::Version(_) => "version",
            NetMessage::Verack => "verack",
            NetMessage::Addr(_) => "addr",
            NetMessage::Inv(_) => "inv",
            NetMessage::GetData(_) => "getdata",
            NetMessage::GetBlocks { .. } => "getblocks",
            NetMessage::GetHeaders { .. } => "getheaders",
            NetMessage::Tx(_) => "tx",
            NetMessage::Block(_) => "block",
            NetMessage::Headers(_) => "headers",
            NetMessage::Ping(_) => "ping",
            NetMessage::Pong(_) => "pong",
            NetMessage::Alert { .. } => "alert",
            NetMessage::Checkpoint { .. } => "checkpoint",
        }
    }

    pub fn encode_payload(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        match self {
            NetMessage::Version(payload) => {
                writer.put_i32(payload.version);
                writer.put_u64(payload.services);
                writer.put_i64(payload.timestamp);
                payload.addr_recv.encode_into(&mut writer);
                payload.addr_from.encode_into(&mut writer);
                writer.put_u64(payload.nonce);
                writer.put_var_str(&payload.sub_version);
                writer.put_i32(payload.start_height);
            }
            NetMessage::Verack => {}
            NetMessage::Addr(addrs) => {
                cinder_primitives::encoding::encode_list(&mut writer, addrs);
            }
            NetMessage::Inv(entries) | NetMessage::GetData(entries) => {
                cinder_primitives::encoding::encode_list(&mut writer, entries);
            }
            NetMessage::GetBlocks { locator, hash_stop }
            | NetMessage::GetHeaders { locator, hash_stop } => {
                writer.put_compact_size(locator.len() as u64);
                for hash in locator {
                    writer.put_hash(hash);
                }
                writer.put_hash(hash_stop);
            }
            NetMessage::Tx(tx) => {
                tx.encode_into(&mut writer);
            }
            NetMessage::Block(block) => {
                block.encode_into(&mut writer);
            }
            NetMessage::Headers(headers) => {
                cinder_primitives::encoding::encode_list(&mut writer, headers);
            }
            NetMessage::Ping(nonce) | NetMessage::Pong(nonce) => {
                writer.put_u64(*nonce);
            }
            NetMessage::Alert { payload, signature } => {
                writer.put_var_bytes(payload);
                writer.put_var_bytes(signature);
            }
            NetMessage::Checkpoint { hash, signature } => {
                writer.put_hash(hash);
                writer.put_var_bytes(signature);
            }
        }
        writer.into_bytes()
    }

    pub fn decode_payload(command: &str, payload: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(payload);
        let message = match command {
            "version" => NetMessage::Version(VersionPayload {
                version: reader.i32()?,
                services: reader.u64()?,
                timestamp: reader.i64()?,
                addr_recv: NetAddr::decode_from(&mut reader)?,
                addr_from: NetAddr::decode_from(&mut reader)?,
                nonce: reader.u64()?,
                sub_version: reader.var_str()?,
                start_height: reader.i32()?,
            }),
            "verack" => NetMessage::Verack,
            "addr" => {
                let addrs: Vec<TimedNetAddr> =
                    cinder_primitives::encoding::decode_list(&mut reader)?;
                if addrs.len() > MAX_ADDR_ENTRIES {
                    return Err(CodecError::OversizedCount);
                }
                NetMessage::Addr(addrs)
            }
            "inv" | "getdata" => {
                let entries: Vec<Inventory> =
                    cinder_primitives::encoding::decode_list(&mut reader)?;
                if entries.len() > MAX_INV_ENTRIES {
                    return Err(CodecError::OversizedCount);
                }
                if command == "inv" {
                    NetMessage::Inv(entries)
                } else {
                    NetMessage::GetData(entries)
                }
            }
            "getblocks" | "getheaders" => {
                let count = reader.compact_size()?;
                let count = usize::try_from(count).map_err(|_| CodecError::OversizedCount)?;
                let mut locator = Vec::with_capacity(count.min(128));
                for _ in 0..count {
                    locator.push(reader.hash()?);
                }
                let hash_stop = reader.hash()?;
                if command == "getblocks" {
                    NetMessage::GetBlocks { locator, hash_stop }
                } else {
                    NetMessage::GetHeaders { locator, hash_stop }
                }
            }
            "tx" => NetMessage::Tx(Transaction::decode_from(&mut reader)?),
            "block" => NetMessage::Block(Block::decode_from(&mut reader)?),
            "headers" => {
                NetMessage::Headers(cinder_primitives::encoding::decode_list(&mut reader)?)
            }
            "ping" => NetMessage::Ping(reader.u64()?),
            "pong" => NetMessage::Pong(reader.u64()?),
            "alert" => NetMessage::Alert {
                payload: reader.var_bytes()?,
                signature: reader.var_bytes()?,
            },
            "checkpoint" => NetMessage::Checkpoint {
                hash: reader.hash()?,
                signature: reader.var_bytes()?,
            },
            _ => return Err(CodecError::Invalid("unknown command")),
        };
        if !reader.is_empty() {
            return Err(CodecError::TrailingBytes);
        }
        Ok(message)
    }

    /// A complete frame ready for the transport.
    pub fn to_frame(&self, magic: [u8; 4]) -> Vec<u8> {
        let payload = self.encode_payload();
        let mut command = [0u8; COMMAND_LEN];
        let name = self.command().as_bytes();
        command[..name.len()].copy_from_slice(name);
        let checksum = sha256d(&payload);

        let mut out = Vec::with_capacity(24 + payload.len());
        out.extend_from_slice(&magic);
        out.extend_from_slice(&command);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&checksum[..4]);
        out.extend_from_slice(&payload);
        out
    }

    pub fn from_frame(magic: [u8; 4], frame: &[u8]) -> Result<Self, CodecError> {
        if frame.len() < 24 {
            return Err(CodecError::UnexpectedEnd);
        }
        if frame[0..4] != magic {
            return Err(CodecError::Invalid("frame magic mismatch"));
        }
        let command_bytes = &frame[4..16];
        let end = command_bytes
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(COMMAND_LEN);
        let command = std::str::from_utf8(&command_bytes[..end])
            .map_err(|_| CodecError::Invalid("invalid command"))?;
        let length = u32::from_le_bytes(frame[16..20].try_into().expect("length bytes")) as usize;
        let payload = frame
            .get(24..24 + length)
            .ok_or(CodecError::UnexpectedEnd)?;
        if frame.len() != 24 + length {
            return Err(CodecError::TrailingBytes);
        }
        let checksum = sha256d(payload);
        if checksum[..4] != frame[20..24] {
            return Err(CodecError::Invalid("frame checksum mismatch"));
        }
        Self::decode_payload(command, payload)
    }
}
