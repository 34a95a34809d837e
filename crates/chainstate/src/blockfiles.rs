//! Append-only `blk%04d.dat` block storage with magic framing.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cinder_consensus::constants::MAX_BLOCK_FILE_SIZE;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockFilePos {
    pub file: u32,
    pub offset: u64,
}

impl BlockFilePos {
    pub fn encode(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[0..4].copy_from_slice(&self.file.to_le_bytes());
        out[4..12].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 12 {
            return None;
        }
        Some(Self {
            file: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            offset: u64::from_le_bytes(bytes[4..12].try_into().ok()?),
        })
    }
}

#[derive(Debug)]
pub enum BlockFileError {
    Io(std::io::Error),
    BadMagic,
    LengthMismatch,
}

impl std::fmt::Display for BlockFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockFileError::Io(err) => write!(f, "{err}"),
            BlockFileError::BadMagic => write!(f, "block file magic mismatch"),
            BlockFileError::LengthMismatch => write!(f, "block file length mismatch"),
        }
    }
}

impl std::error::Error for BlockFileError {}

impl From<std::io::Error> for BlockFileError {
    fn from(err: std::io::Error) -> Self {
        BlockFileError::Io(err)
    }
}

struct FileCursor {
    current_file: u32,
    current_len: u64,
}

/// Rotating append-only files: 4-byte network magic, 4-byte LE length, body.
pub struct BlockFileStore {
    dir: PathBuf,
    magic: [u8; 4],
    max_file_size: u64,
    cursor: Mutex<FileCursor>,
}

impl BlockFileStore {
    pub fn open(dir: impl Into<PathBuf>, magic: [u8; 4]) -> Result<Self, BlockFileError> {
        Self::open_with_max_size(dir, magic, MAX_BLOCK_FILE_SIZE)
    }

    pub fn open_with_max_size(
        dir: impl Into<PathBuf>,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, BlockFileError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let (current_file, current_len) = Self::locate_active_file(&dir, max_file_size)?;
        Ok(Self {
            dir,
            magic,
            max_file_size,
            cursor: Mutex::new(FileCursor {
                current_file,
                current_len,
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, body: &[u8]) -> Result<BlockFilePos, BlockFileError> {
        let mut cursor = self.cursor.lock().expect("block file lock");
        let framed = 8u64 + body.len() as u64;
        if cursor.current_len + framed > self.max_file_size {
            cursor.current_file += 1;
            cursor.current_len = 0;
        }
        let offset = cursor.current_len;
        let path = self.file_path(cursor.current_file);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&self.magic)?;
        file.write_all(&(body.len() as u32).to_le_bytes())?;
        file.write_all(body)?;
        file.flush()?;
        cursor.current_len += framed;
        Ok(BlockFilePos {
            file: cursor.current_file,
            offset,
        })
    }

    pub fn read(&self, pos: BlockFilePos) -> Result<Vec<u8>, BlockFileError> {
        let path = self.file_path(pos.file);
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(pos.offset))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if magic != self.magic {
            return Err(BlockFileError::BadMagic);
        }
        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        file.read_exact(&mut body)?;
        Ok(body)
    }

    fn file_path(&self, file: u32) -> PathBuf {
        self.dir.join(format!("blk{file:04}.dat"))
    }

    fn locate_active_file(dir: &Path, max_file_size: u64) -> Result<(u32, u64), BlockFileError> {
        let mut file_id = 0u32;
        let mut last: Option<(u32, u64)> = None;
        loop {
            let path = dir.join(format!("blk{file_id:04}.dat"));
            if !path.exists() {
                break;
            }
            let len = std::fs::metadata(&path)?.len();
            last = Some((file_id, len));
            file_id += 1;
        }
        match last {
            Some((id, len)) if len >= max_file_size => Ok((id + 1, 0)),
            Some((id, len)) => Ok((id, len)),
            None => Ok((0, 0)),
        }
    }
}

/// Streams magic-framed block bodies out of an externally supplied file,
/// used to consume `bootstrap.dat` on first start.
pub struct FramedBlockReader {
    file: File,
    magic: [u8; 4],
}

impl FramedBlockReader {
    pub fn open(path: impl AsRef<Path>, magic: [u8; 4]) -> Result<Self, BlockFileError> {
        Ok(Self {
            file: File::open(path)?,
            magic,
        })
    }

    /// The next framed body, or `None` at end of file.
    pub fn next_block(&mut self) -> Result<Option<Vec<u8>>, BlockFileError> {
        let mut magic = [0u8; 4];
        match self.file.read_exact(&mut magic) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        if magic != self.magic {
            return Err(BlockFileError::BadMagic);
        }
        let mut len_bytes = [0u8; 4];
        self.file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut body = vec![0u8; len];
        self.file.read_exact(&mut body)?;
        Ok(Some(body))
    }
}
