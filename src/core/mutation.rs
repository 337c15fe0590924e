//! Mutation events and the fixed-layout binned record codec.
//!
//! Record layout (big-endian, no framing between records):
//!
//! ```text
//! keyLen   - 2 bytes
//! key      - keyLen bytes
//! seqno    - 8 bytes
//! revId    - 8 bytes
//! cas      - 8 bytes
//! flags    - 4 bytes
//! expiry   - 4 bytes
//! opCode   - 2 bytes
//! datatype - 2 bytes
//! bodyHash - 64 bytes (SHA-512 of the value)
//! ```

use bytes::Bytes;
use sha2::{Digest, Sha512};
use thiserror::Error;

pub const BODY_HASH_LEN: usize = 64;

/// Bytes per record excluding the key itself: the keyLen field, the scalar
/// metadata, and the body hash.
pub const RECORD_FIXED_LEN: usize = 2 + 8 + 8 + 8 + 4 + 4 + 2 + 2 + BODY_HASH_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Mutation,
    Deletion,
    Expiration,
}

impl OpCode {
    pub fn as_u16(self) -> u16 {
        match self {
            OpCode::Mutation => 1,
            OpCode::Deletion => 2,
            OpCode::Expiration => 3,
        }
    }
}

/// One change-stream event for a vbucket. Deletions carry an empty value;
/// expirations carry an empty value and zero datatype.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mutation {
    pub vbno: u16,
    pub key: Bytes,
    pub seqno: u64,
    pub rev_id: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub op: OpCode,
    pub value: Bytes,
    pub datatype: u8,
}

impl Mutation {
    pub fn body_hash(&self) -> [u8; BODY_HASH_LEN] {
        let digest = Sha512::digest(&self.value);
        let mut hash = [0u8; BODY_HASH_LEN];
        hash.copy_from_slice(&digest);
        hash
    }

    /// Serialize into the on-disk binned record layout.
    pub fn to_record_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_FIXED_LEN + self.key.len());
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.seqno.to_be_bytes());
        buf.extend_from_slice(&self.rev_id.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.expiry.to_be_bytes());
        buf.extend_from_slice(&self.op.as_u16().to_be_bytes());
        buf.extend_from_slice(&(self.datatype as u16).to_be_bytes());
        buf.extend_from_slice(&self.body_hash());
        buf
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("record truncated at offset {offset}: {available} bytes left, {needed} needed")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
}

/// A decoded binned record. The op code and datatype are kept as raw wire
/// values; the differ only compares them for equality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinnedRecord {
    pub key: Vec<u8>,
    pub seqno: u64,
    pub rev_id: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub op_code: u16,
    pub datatype: u16,
    pub body_hash: [u8; BODY_HASH_LEN],
}

impl BinnedRecord {
    /// Decode one record from `buf` starting at `offset`. Returns the record
    /// and the offset of the next one.
    pub fn decode(buf: &[u8], offset: usize) -> Result<(Self, usize), RecordError> {
        let mut pos = offset;
        let key_len = read_u16(buf, offset, &mut pos)? as usize;
        let key = take(buf, offset, &mut pos, key_len)?.to_vec();
        let seqno = read_u64(buf, offset, &mut pos)?;
        let rev_id = read_u64(buf, offset, &mut pos)?;
        let cas = read_u64(buf, offset, &mut pos)?;
        let flags = read_u32(buf, offset, &mut pos)?;
        let expiry = read_u32(buf, offset, &mut pos)?;
        let op_code = read_u16(buf, offset, &mut pos)?;
        let datatype = read_u16(buf, offset, &mut pos)?;
        let hash_bytes = take(buf, offset, &mut pos, BODY_HASH_LEN)?;
        let mut body_hash = [0u8; BODY_HASH_LEN];
        body_hash.copy_from_slice(hash_bytes);

        Ok((
            Self {
                key,
                seqno,
                rev_id,
                cas,
                flags,
                expiry,
                op_code,
                datatype,
                body_hash,
            },
            pos,
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_FIXED_LEN + self.key.len());
        buf.extend_from_slice(&(self.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.seqno.to_be_bytes());
        buf.extend_from_slice(&self.rev_id.to_be_bytes());
        buf.extend_from_slice(&self.cas.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.expiry.to_be_bytes());
        buf.extend_from_slice(&self.op_code.to_be_bytes());
        buf.extend_from_slice(&self.datatype.to_be_bytes());
        buf.extend_from_slice(&self.body_hash);
        buf
    }

    /// True if this record wins over `other` for the same key: highest seqno,
    /// ties broken by higher cas, then higher revId.
    pub fn supersedes(&self, other: &Self) -> bool {
        (self.seqno, self.cas, self.rev_id) > (other.seqno, other.cas, other.rev_id)
    }

    /// Metadata-level equality used by the file differ: bodyHash, cas, revId,
    /// flags, expiry, datatype, and opCode.
    pub fn meta_matches(&self, other: &Self) -> bool {
        self.body_hash == other.body_hash
            && self.cas == other.cas
            && self.rev_id == other.rev_id
            && self.flags == other.flags
            && self.expiry == other.expiry
            && self.datatype == other.datatype
            && self.op_code == other.op_code
    }
}

fn take<'a>(
    buf: &'a [u8],
    record_offset: usize,
    pos: &mut usize,
    len: usize,
) -> Result<&'a [u8], RecordError> {
    let end = pos.checked_add(len).ok_or(RecordError::Truncated {
        offset: record_offset,
        needed: len,
        available: buf.len().saturating_sub(*pos),
    })?;
    if end > buf.len() {
        return Err(RecordError::Truncated {
            offset: record_offset,
            needed: len,
            available: buf.len() - *pos,
        });
    }
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn read_u16(buf: &[u8], record_offset: usize, pos: &mut usize) -> Result<u16, RecordError> {
    let slice = take(buf, record_offset, pos, 2)?;
    Ok(u16::from_be_bytes([slice[0], slice[1]]))
}

fn read_u32(buf: &[u8], record_offset: usize, pos: &mut usize) -> Result<u32, RecordError> {
    let slice = take(buf, record_offset, pos, 4)?;
    Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(buf: &[u8], record_offset: usize, pos: &mut usize) -> Result<u64, RecordError> {
    let slice = take(buf, record_offset, pos, 8)?;
    Ok(u64::from_be_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}
