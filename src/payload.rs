//! The dump-payload object codec.
//!
//! Values crossing the memory/freezer boundary travel in a self-describing,
//! checksummed binary envelope: a fixed header (magic, version, body length),
//! the bincode-serialized value, and a CRC-64 trailer over header plus body.
//! The freezer never interprets the body; verification happens before decode
//! so a corrupt value degrades to a miss instead of a panic deep in serde.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::hasher::Hasher;

const MAGIC: u32 = 0x44_4D_50; // ASCII "DMP"
const VERSION: u16 = 1;

// magic(4) + version(2) + bodylen(4)
const HEADER_SIZE: usize = 10;
const TRAILER_SIZE: usize = 8;

/// Encodes a value into a dump-payload envelope.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + body.len() + TRAILER_SIZE);

    buf.write_u32::<BigEndian>(MAGIC)
        .map_err(|e| Error::IO(e.to_string()))?;
    buf.write_u16::<BigEndian>(VERSION)
        .map_err(|e| Error::IO(e.to_string()))?;
    buf.write_u32::<BigEndian>(body.len() as u32)
        .map_err(|e| Error::IO(e.to_string()))?;
    buf.extend_from_slice(&body);

    let crc = Hasher::digest(&buf);
    buf.write_u64::<BigEndian>(crc)
        .map_err(|e| Error::IO(e.to_string()))?;

    Ok(buf)
}

/// Verifies a dump-payload envelope without decoding the body. Returns true
/// iff the magic, version, length, and checksum all hold.
pub fn verify(payload: &[u8]) -> bool {
    read_body(payload).is_ok()
}

/// Decodes a dump-payload envelope back into a value. Fails with `Corrupt`
/// if verification fails, `InvalidData` if the body does not deserialize.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    let body = read_body(payload)?;
    Ok(bincode::deserialize(body)?)
}

fn read_body(payload: &[u8]) -> Result<&[u8]> {
    if payload.len() < HEADER_SIZE + TRAILER_SIZE {
        return Err(Error::Corrupt(format!(
            "payload too short: {} bytes",
            payload.len()
        )));
    }

    let mut header = &payload[..HEADER_SIZE];
    let magic = header
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corrupt(e.to_string()))?;
    if magic != MAGIC {
        return Err(Error::Corrupt(format!("bad magic {magic:#x}")));
    }
    let version = header
        .read_u16::<BigEndian>()
        .map_err(|e| Error::Corrupt(e.to_string()))?;
    if version != VERSION {
        return Err(Error::Corrupt(format!("unsupported version {version}")));
    }
    let body_len = header
        .read_u32::<BigEndian>()
        .map_err(|e| Error::Corrupt(e.to_string()))? as usize;

    if payload.len() != HEADER_SIZE + body_len + TRAILER_SIZE {
        return Err(Error::Corrupt(format!(
            "length mismatch: header says {body_len}, envelope has {}",
            payload.len() - HEADER_SIZE - TRAILER_SIZE
        )));
    }

    let trailer_at = HEADER_SIZE + body_len;
    let stored = (&payload[trailer_at..])
        .read_u64::<BigEndian>()
        .map_err(|e| Error::Corrupt(e.to_string()))?;
    let computed = Hasher::digest(&payload[..trailer_at]);
    if stored != computed {
        return Err(Error::Corrupt(format!(
            "checksum mismatch: stored {stored:#x}, computed {computed:#x}"
        )));
    }

    Ok(&payload[HEADER_SIZE..trailer_at])
}
