//! The chunk envelope shared by the disk-backed put cache and wire
//! transports: `hash[20] || len[u32 big-endian] || bytes[len]`.

use noms_primitives::chunk::Chunk;
use noms_primitives::hash::{self, Hash};
use std::io::{self, Read, Write};

pub fn write_uint32(value: u32, out: &mut impl Write) -> io::Result<()> {
    out.write_all(&value.to_be_bytes())
}

pub fn read_uint32(input: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    input.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

/// Frames one chunk. Returns the number of bytes written.
pub fn write_chunk(chunk: &Chunk, out: &mut impl Write) -> io::Result<usize> {
    out.write_all(chunk.hash().as_bytes())?;
    let len = u32::try_from(chunk.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "chunk exceeds u32 length"))?;
    write_uint32(len, out)?;
    out.write_all(chunk.bytes())?;
    Ok(hash::BYTE_LEN + 4 + chunk.len())
}

/// Reads one framed chunk and verifies the embedded hash against the
/// payload.
pub fn read_chunk(input: &mut impl Read) -> io::Result<Chunk> {
    let mut hash_bytes = [0u8; hash::BYTE_LEN];
    input.read_exact(&mut hash_bytes)?;
    let expected = Hash(hash_bytes);
    let len = read_uint32(input)? as usize;
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    let chunk = Chunk::new(payload);
    if chunk.hash() != expected {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "chunk payload does not match its hash"));
    }
    Ok(chunk)
}
