//! Canonical wire serialization: compact-size integers, little-endian fields,
//! block headers and transactions.

use std::io::{Read, Write};

use crate::constants::{BLOCK_HEADER_SIZE, MAX_SIZE};
use crate::error::{ChainError, Result};
use crate::hashes::sha256d;
use crate::types::*;

/// Upper bound on elements pre-allocated from an untrusted length prefix.
const MAX_PREALLOC: usize = 4096;

/// Types with a canonical byte encoding.
pub trait Encodable {
    /// Write the canonical encoding, returning the number of bytes written.
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize>;
}

/// Types that can be read back from their canonical byte encoding.
pub trait Decodable: Sized {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self>;
}

/// Encode a value into a fresh byte vector.
pub fn serialize<T: Encodable + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    value.consensus_encode(&mut bytes)?;
    Ok(bytes)
}

/// Decode a value, requiring the whole buffer to be consumed.
pub fn deserialize<T: Decodable>(bytes: &[u8]) -> Result<T> {
    let mut cursor = bytes;
    let value = T::consensus_decode(&mut cursor)?;
    if !cursor.is_empty() {
        return Err(ChainError::Decode(format!(
            "{} trailing bytes after message",
            cursor.len()
        )));
    }
    Ok(value)
}

// ============================================================================
// PRIMITIVE I/O
// ============================================================================

pub fn write_u16_le<W: Write + ?Sized>(writer: &mut W, value: u16) -> Result<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(2)
}

pub fn write_u32_le<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(4)
}

pub fn write_u64_le<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<usize> {
    writer.write_all(&value.to_le_bytes())?;
    Ok(8)
}

pub fn read_u16_le<R: Read + ?Sized>(reader: &mut R) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader.read_exact(&mut buf).map_err(ChainError::from_read)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u32_le<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf).map_err(ChainError::from_read)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u64_le<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf).map_err(ChainError::from_read)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_hash<R: Read + ?Sized>(reader: &mut R) -> Result<Hash> {
    let mut hash = [0u8; 32];
    reader.read_exact(&mut hash).map_err(ChainError::from_read)?;
    Ok(hash)
}

/// Number of bytes `write_varint` emits for `value`.
pub fn varint_size(value: u64) -> usize {
    match value {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x10000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// VarInt: one byte below 253, otherwise a 253/254/255 marker followed by a
/// 2/4/8 byte little-endian integer.
pub fn write_varint<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<usize> {
    match value {
        0..=0xfc => {
            writer.write_all(&[value as u8])?;
            Ok(1)
        }
        0xfd..=0xffff => {
            writer.write_all(&[0xfd])?;
            write_u16_le(writer, value as u16)?;
            Ok(3)
        }
        0x10000..=0xffff_ffff => {
            writer.write_all(&[0xfe])?;
            write_u32_le(writer, value as u32)?;
            Ok(5)
        }
        _ => {
            writer.write_all(&[0xff])?;
            write_u64_le(writer, value)?;
            Ok(9)
        }
    }
}

/// Read a VarInt, rejecting encodings that use more bytes than necessary.
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut marker = [0u8; 1];
    reader.read_exact(&mut marker).map_err(ChainError::from_read)?;
    let (value, min) = match marker[0] {
        0xfd => (read_u16_le(reader)? as u64, 0xfd),
        0xfe => (read_u32_le(reader)? as u64, 0x10000),
        0xff => (read_u64_le(reader)?, 0x1_0000_0000),
        byte => return Ok(byte as u64),
    };
    if value < min {
        return Err(ChainError::Decode("non-canonical compact size".to_string()));
    }
    Ok(value)
}

/// Read a vector length prefix, bounded by `MAX_SIZE`.
pub fn read_length<R: Read + ?Sized>(reader: &mut R) -> Result<usize> {
    let len = read_varint(reader)?;
    if len > MAX_SIZE {
        return Err(ChainError::Decode(format!(
            "length prefix {} exceeds maximum {}",
            len, MAX_SIZE
        )));
    }
    Ok(len as usize)
}

/// Capacity to reserve for `len` decoded elements.
pub(crate) fn prealloc(len: usize) -> usize {
    len.min(MAX_PREALLOC)
}

pub fn write_var_bytes<W: Write + ?Sized>(writer: &mut W, bytes: &[u8]) -> Result<usize> {
    let prefix = write_varint(writer, bytes.len() as u64)?;
    writer.write_all(bytes)?;
    Ok(prefix + bytes.len())
}

pub fn read_var_bytes<R: Read + ?Sized>(reader: &mut R) -> Result<ByteString> {
    let len = read_length(reader)?;
    let mut bytes = Vec::with_capacity(prealloc(len));
    (&mut *reader)
        .take(len as u64)
        .read_to_end(&mut bytes)
        .map_err(ChainError::from_read)?;
    if bytes.len() != len {
        return Err(ChainError::Decode("truncated stream".to_string()));
    }
    Ok(bytes)
}

// ============================================================================
// STRUCTURES
// ============================================================================

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        writer.write_all(&self.hash)?;
        Ok(32 + write_u32_le(writer, self.index)?)
    }
}

impl Decodable for OutPoint {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(OutPoint {
            hash: read_hash(reader)?,
            index: read_u32_le(reader)?,
        })
    }
}

impl Encodable for TransactionInput {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let mut len = self.prevout.consensus_encode(writer)?;
        len += write_var_bytes(writer, &self.script_sig)?;
        len += write_u32_le(writer, self.sequence)?;
        Ok(len)
    }
}

impl Decodable for TransactionInput {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(TransactionInput {
            prevout: OutPoint::consensus_decode(reader)?,
            script_sig: read_var_bytes(reader)?,
            sequence: read_u32_le(reader)?,
        })
    }
}

impl Encodable for TransactionOutput {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let len = write_u64_le(writer, self.value as u64)?;
        Ok(len + write_var_bytes(writer, &self.script_pubkey)?)
    }
}

impl Decodable for TransactionOutput {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(TransactionOutput {
            value: read_u64_le(reader)? as i64,
            script_pubkey: read_var_bytes(reader)?,
        })
    }
}

impl Encodable for Transaction {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let mut len = write_u32_le(writer, self.version as u32)?;
        len += write_varint(writer, self.inputs.len() as u64)?;
        for input in &self.inputs {
            len += input.consensus_encode(writer)?;
        }
        len += write_varint(writer, self.outputs.len() as u64)?;
        for output in &self.outputs {
            len += output.consensus_encode(writer)?;
        }
        len += write_u32_le(writer, self.lock_time)?;
        Ok(len)
    }
}

impl Decodable for Transaction {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let version = read_u32_le(reader)? as i32;

        let input_count = read_length(reader)?;
        let mut inputs = Vec::with_capacity(prealloc(input_count));
        for _ in 0..input_count {
            inputs.push(TransactionInput::consensus_decode(reader)?);
        }

        let output_count = read_length(reader)?;
        let mut outputs = Vec::with_capacity(prealloc(output_count));
        for _ in 0..output_count {
            outputs.push(TransactionOutput::consensus_decode(reader)?);
        }

        Ok(Transaction {
            version,
            inputs,
            outputs,
            lock_time: read_u32_le(reader)?,
        })
    }
}

/// Block header: version (LE32) ‖ prev-hash ‖ merkle-root ‖ timestamp (LE32)
/// ‖ bits (LE32) ‖ nonce (LE32), exactly 80 bytes.
impl Encodable for BlockHeader {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        write_u32_le(writer, self.version as u32)?;
        writer.write_all(&self.prev_block_hash)?;
        writer.write_all(&self.merkle_root)?;
        write_u32_le(writer, self.timestamp)?;
        write_u32_le(writer, self.bits)?;
        write_u32_le(writer, self.nonce)?;
        Ok(BLOCK_HEADER_SIZE)
    }
}

impl Decodable for BlockHeader {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        Ok(BlockHeader {
            version: read_u32_le(reader)? as i32,
            prev_block_hash: read_hash(reader)?,
            merkle_root: read_hash(reader)?,
            timestamp: read_u32_le(reader)?,
            bits: read_u32_le(reader)?,
            nonce: read_u32_le(reader)?,
        })
    }
}

impl Encodable for Block {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize> {
        let mut len = self.header.consensus_encode(writer)?;
        len += write_varint(writer, self.transactions.len() as u64)?;
        for tx in &self.transactions {
            len += tx.consensus_encode(writer)?;
        }
        Ok(len)
    }
}

impl Decodable for Block {
    fn consensus_decode<R: Read + ?Sized>(reader: &mut R) -> Result<Self> {
        let header = BlockHeader::consensus_decode(reader)?;
        let count = read_length(reader)?;
        let mut transactions = Vec::with_capacity(prealloc(count));
        for _ in 0..count {
            transactions.push(Transaction::consensus_decode(reader)?);
        }
        Ok(Block { header, transactions })
    }
}

/// The 80-byte header serialization.
pub fn header_bytes(header: &BlockHeader) -> [u8; BLOCK_HEADER_SIZE] {
    let mut bytes = [0u8; BLOCK_HEADER_SIZE];
    bytes[0..4].copy_from_slice(&(header.version as u32).to_le_bytes());
    bytes[4..36].copy_from_slice(&header.prev_block_hash);
    bytes[36..68].copy_from_slice(&header.merkle_root);
    bytes[68..72].copy_from_slice(&header.timestamp.to_le_bytes());
    bytes[72..76].copy_from_slice(&header.bits.to_le_bytes());
    bytes[76..80].copy_from_slice(&header.nonce.to_le_bytes());
    bytes
}

/// Block hash: SHA256(SHA256(header))
pub fn block_hash(header: &BlockHeader) -> Hash {
    sha256d(&header_bytes(header))
}

/// Transaction ID: SHA256(SHA256(serialize(tx)))
pub fn txid(tx: &Transaction) -> Hash {
    let mut bytes = Vec::with_capacity(tx_size(tx));
    // Writing into a Vec cannot fail.
    let _ = tx.consensus_encode(&mut bytes);
    sha256d(&bytes)
}

/// Serialized size of a transaction in bytes.
pub fn tx_size(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|i| 36 + varint_size(i.script_sig.len() as u64) + i.script_sig.len() + 4)
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|o| 8 + varint_size(o.script_pubkey.len() as u64) + o.script_pubkey.len())
        .sum();
    4 + varint_size(tx.inputs.len() as u64)
        + inputs
        + varint_size(tx.outputs.len() as u64)
        + outputs
        + 4
}

/// Serialized size of a block in bytes.
pub fn block_size(block: &Block) -> u64 {
    let transactions: u64 = block.transactions.iter().map(|tx| tx_size(tx) as u64).sum();
    BLOCK_HEADER_SIZE as u64 + varint_size(block.transactions.len() as u64) as u64 + transactions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([7; 32], 3),
                script_sig: vec![0x51, 0x52],
                sequence: 0xfffffffe,
            }],
            outputs: vec![TransactionOutput {
                value: 49 * 100_000_000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 12,
        }
    }

    #[test]
    fn test_varint_boundaries() {
        for (value, size) in [
            (0u64, 1usize),
            (252, 1),
            (253, 3),
            (0xffff, 3),
            (0x10000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ] {
            let mut bytes = Vec::new();
            assert_eq!(write_varint(&mut bytes, value).unwrap(), size);
            assert_eq!(bytes.len(), size);
            assert_eq!(varint_size(value), size);
            assert_eq!(read_varint(&mut bytes.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn test_varint_truncated() {
        let bytes = [0xfe, 0x01, 0x02];
        let err = read_varint(&mut &bytes[..]).unwrap_err();
        assert!(matches!(err, ChainError::Decode(_)));
    }

    #[test]
    fn test_varint_non_canonical_rejected() {
        let bytes = [0xfd, 0x10, 0x00];
        assert!(matches!(
            read_varint(&mut &bytes[..]),
            Err(ChainError::Decode(_))
        ));
    }

    #[test]
    fn test_length_prefix_bounded() {
        let mut bytes = Vec::new();
        write_varint(&mut bytes, MAX_SIZE + 1).unwrap();
        assert!(read_length(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_header_is_80_bytes() {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [1; 32],
            merkle_root: [2; 32],
            timestamp: 0x01020304,
            bits: 0x207fffff,
            nonce: 9,
        };
        let bytes = serialize(&header).unwrap();
        assert_eq!(bytes.len(), 80);
        assert_eq!(bytes.as_slice(), &header_bytes(&header)[..]);
        assert_eq!(&bytes[68..72], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(deserialize::<BlockHeader>(&bytes).unwrap(), header);
    }

    #[test]
    fn test_transaction_size_matches_encoding() {
        let tx = sample_tx();
        let bytes = serialize(&tx).unwrap();
        assert_eq!(bytes.len(), tx_size(&tx));
        assert_eq!(deserialize::<Transaction>(&bytes).unwrap(), tx);
    }

    #[test]
    fn test_txid_changes_with_content() {
        let tx = sample_tx();
        let mut other = sample_tx();
        other.lock_time += 1;
        assert_ne!(txid(&tx), txid(&other));
        assert_eq!(txid(&tx), txid(&sample_tx()));
    }

    #[test]
    fn test_genesis_block_hash() {
        let header = BlockHeader {
            version: 1,
            prev_block_hash: [0; 32],
            merkle_root: {
                let mut root = [0u8; 32];
                hex::decode_to_slice(
                    "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a",
                    &mut root,
                )
                .unwrap();
                root
            },
            timestamp: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        };
        assert_eq!(
            hash_to_hex(&block_hash(&header)),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = serialize(&sample_tx()).unwrap();
        bytes.push(0);
        assert!(deserialize::<Transaction>(&bytes).is_err());
    }

    #[test]
    fn test_truncated_transaction() {
        let bytes = serialize(&sample_tx()).unwrap();
        let err = deserialize::<Transaction>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(err, ChainError::Decode(_)));
    }

    #[test]
    fn test_block_size_matches_encoding() {
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0; 32],
                merkle_root: [0; 32],
                timestamp: 0,
                bits: 0x207fffff,
                nonce: 0,
            },
            transactions: vec![sample_tx(), sample_tx()],
        };
        assert_eq!(block_size(&block), serialize(&block).unwrap().len() as u64);
    }
}
