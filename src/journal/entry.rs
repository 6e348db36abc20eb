//! Log entry codec
//!
//! Encoding and decoding of a single transaction log entry.
//!
//! Encoding never validates: it writes whatever header, operations and
//! trailer it is given, so recovery can be exercised against deliberately
//! malformed entries. Decoding validates in a fixed order (structure, version,
//! trailer count, checksum, offset range) and stops at the first failure.

use std::io::Read;

use bytes::Bytes;
use thiserror::Error;

/// Current log entry format version
pub const ENTRY_VERSION: u16 = 1;

/// Header size: version (2) + flags (2) + id (4) = 8 bytes
pub const HEADER_SIZE: usize = 8;

/// Operation header size: length (4) + offset (8) = 12 bytes
pub const OP_HEADER_SIZE: usize = 12;

/// Trailer size: operation count (4) + checksum (4) = 8 bytes
pub const TRAILER_SIZE: usize = 8;

/// Entry was written with undo capture disabled
pub const FLAG_NO_ROLLBACK: u16 = 0x0002;

/// Entry was written by a lingering handle
pub const FLAG_LINGER: u16 = 0x0004;

/// Entry is the undo transaction of an earlier commit
pub const FLAG_ROLLBACK: u16 = 0x0008;

/// Highest byte position an operation may reach (a file offset is signed)
pub const MAX_OFFSET: u64 = i64::MAX as u64;

/// End of a `len`-byte range at `offset`, or `None` past [`MAX_OFFSET`]
pub fn range_end(offset: u64, len: u64) -> Option<u64> {
    offset.checked_add(len).filter(|end| *end <= MAX_OFFSET)
}

// =============================================================================
// Types
// =============================================================================

/// Fixed-size entry header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryHeader {
    pub version: u16,
    pub flags: u16,
    pub id: u32,
}

impl EntryHeader {
    pub fn new(id: u32, flags: u16) -> Self {
        Self {
            version: ENTRY_VERSION,
            flags,
            id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..2].copy_from_slice(&self.version.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.flags.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.id.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8; HEADER_SIZE]) -> Self {
        Self {
            version: u16::from_be_bytes([bytes[0], bytes[1]]),
            flags: u16::from_be_bytes([bytes[2], bytes[3]]),
            id: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}

/// A logged write: payload to place at `offset` in the target file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOp {
    pub offset: u64,
    pub data: Bytes,
}

impl LogOp {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    /// Encoded operation header for a payload of `len` bytes at `offset`
    pub fn header_bytes(len: u32, offset: u64) -> [u8; OP_HEADER_SIZE] {
        let mut bytes = [0u8; OP_HEADER_SIZE];
        bytes[0..4].copy_from_slice(&len.to_be_bytes());
        bytes[4..12].copy_from_slice(&offset.to_be_bytes());
        bytes
    }
}

/// Entry trailer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub num_ops: u32,
    pub checksum: u32,
}

impl Trailer {
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[0..4].copy_from_slice(&self.num_ops.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_be_bytes());
        bytes
    }
}

/// One transaction log entry as stored on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub header: EntryHeader,
    pub ops: Vec<LogOp>,
}

/// Recovery category an undecodable entry falls into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeCategory {
    Invalid,
    Broken,
    Corrupt,
}

/// Reasons a byte stream is not a valid log entry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("entry too short for a header ({len} bytes)")]
    Unparseable { len: usize },

    #[error("entry truncated at byte {at}")]
    Truncated { at: usize },

    #[error("unsupported entry version {0}")]
    UnsupportedVersion(u16),

    #[error("operation at byte {at} declares {len} bytes but only {remaining} remain")]
    LengthOverrun { at: usize, len: u32, remaining: usize },

    #[error("zero-length operation at byte {at} with non-zero offset")]
    MalformedOp { at: usize },

    #[error("trailer declares {declared} operations, entry holds {parsed}")]
    CountMismatch { declared: u32, parsed: usize },

    #[error("{0} unexpected bytes after the trailer")]
    TrailingBytes(usize),

    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    #[error("operation of {len} bytes at offset {offset} ends past the largest file offset")]
    OffsetOutOfRange { offset: u64, len: u32 },
}

impl DecodeError {
    pub fn category(&self) -> DecodeCategory {
        match self {
            DecodeError::Unparseable { .. } => DecodeCategory::Invalid,
            DecodeError::ChecksumMismatch { .. } => DecodeCategory::Corrupt,
            _ => DecodeCategory::Broken,
        }
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// Checksum over the header, operation records and sentinel of an entry
pub fn checksum(body: &[u8]) -> u32 {
    crc32fast::hash(body)
}

// =============================================================================
// Encoding
// =============================================================================

impl LogEntry {
    pub fn new(id: u32, flags: u16, ops: Vec<LogOp>) -> Self {
        Self {
            header: EntryHeader::new(id, flags),
            ops,
        }
    }

    pub fn id(&self) -> u32 {
        self.header.id
    }

    /// Header, operations and sentinel: the bytes the checksum covers
    pub fn body_bytes(&self) -> Vec<u8> {
        let payload: usize = self.ops.iter().map(|op| op.data.len()).sum();
        let mut body = Vec::with_capacity(
            HEADER_SIZE + (self.ops.len() + 1) * OP_HEADER_SIZE + payload,
        );

        body.extend_from_slice(&self.header.to_bytes());
        for op in &self.ops {
            body.extend_from_slice(&LogOp::header_bytes(op.data.len() as u32, op.offset));
            body.extend_from_slice(&op.data);
        }
        body.extend_from_slice(&LogOp::header_bytes(0, 0));

        body
    }

    /// Trailer matching the current contents
    pub fn trailer(&self) -> Trailer {
        Trailer {
            num_ops: self.ops.len() as u32,
            checksum: checksum(&self.body_bytes()),
        }
    }

    /// Encode with a correct trailer
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        let trailer = Trailer {
            num_ops: self.ops.len() as u32,
            checksum: checksum(&bytes),
        };
        bytes.extend_from_slice(&trailer.to_bytes());
        bytes
    }

    /// Encode with an arbitrary trailer (no validation)
    pub fn encode_with_trailer(&self, trailer: Trailer) -> Vec<u8> {
        let mut bytes = self.body_bytes();
        bytes.extend_from_slice(&trailer.to_bytes());
        bytes
    }

    // =========================================================================
    // Decoding
    // =========================================================================

    /// Decode an entry from its complete on-disk bytes
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_SIZE {
            return Err(DecodeError::Unparseable { len: bytes.len() });
        }

        let mut header_bytes = [0u8; HEADER_SIZE];
        header_bytes.copy_from_slice(&bytes[..HEADER_SIZE]);
        let header = EntryHeader::from_bytes(&header_bytes);

        // Step 1: structure. Walk operations up to the sentinel.
        let mut pos = HEADER_SIZE;
        let mut ops = Vec::new();
        loop {
            if bytes.len() - pos < OP_HEADER_SIZE {
                return Err(DecodeError::Truncated { at: bytes.len() });
            }

            let len = u32::from_be_bytes([
                bytes[pos],
                bytes[pos + 1],
                bytes[pos + 2],
                bytes[pos + 3],
            ]);
            let mut offset_bytes = [0u8; 8];
            offset_bytes.copy_from_slice(&bytes[pos + 4..pos + OP_HEADER_SIZE]);
            let offset = u64::from_be_bytes(offset_bytes);

            let op_start = pos;
            pos += OP_HEADER_SIZE;

            if len == 0 {
                if offset == 0 {
                    break;
                }
                return Err(DecodeError::MalformedOp { at: op_start });
            }

            let remaining = bytes.len() - pos;
            if len as usize > remaining {
                return Err(DecodeError::LengthOverrun {
                    at: op_start,
                    len,
                    remaining,
                });
            }

            ops.push(LogOp {
                offset,
                data: Bytes::copy_from_slice(&bytes[pos..pos + len as usize]),
            });
            pos += len as usize;
        }

        let body_end = pos;
        if bytes.len() - pos < TRAILER_SIZE {
            return Err(DecodeError::Truncated { at: bytes.len() });
        }
        let num_ops = u32::from_be_bytes([
            bytes[pos],
            bytes[pos + 1],
            bytes[pos + 2],
            bytes[pos + 3],
        ]);
        let stored = u32::from_be_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]);
        pos += TRAILER_SIZE;

        if pos != bytes.len() {
            return Err(DecodeError::TrailingBytes(bytes.len() - pos));
        }

        // Step 2: version
        if header.version != ENTRY_VERSION {
            return Err(DecodeError::UnsupportedVersion(header.version));
        }

        // Step 3: trailer count
        if num_ops as usize != ops.len() {
            return Err(DecodeError::CountMismatch {
                declared: num_ops,
                parsed: ops.len(),
            });
        }

        // Step 4: checksum
        let computed = checksum(&bytes[..body_end]);
        if computed != stored {
            return Err(DecodeError::ChecksumMismatch { stored, computed });
        }

        // Step 5: a checksummed op that cannot be replayed is still broken
        if let Some(op) = ops
            .iter()
            .find(|op| range_end(op.offset, op.data.len() as u64).is_none())
        {
            return Err(DecodeError::OffsetOutOfRange {
                offset: op.offset,
                len: op.data.len() as u32,
            });
        }

        Ok(Self { header, ops })
    }

    /// Read and decode a whole entry from `reader`
    pub fn read_from(reader: &mut impl Read) -> crate::error::Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Ok(Self::decode(&bytes)?)
    }

    /// Total payload bytes across all operations
    pub fn payload_len(&self) -> usize {
        self.ops.iter().map(|op| op.data.len()).sum()
    }
}
