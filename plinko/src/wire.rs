//! Wire formats: query JSON bodies, the snapshot manifest, and the delta
//! feed framing.
//!
//! Parities travel as decimal big integers over the little-endian byte
//! interpretation of the 32-byte word. Delta artifacts are a concatenation
//! of length-prefixed frames of `(index, flags, delta)` records, all
//! little-endian; the core only consumes the ordered `(index, delta)`
//! stream.

use std::io::{ErrorKind, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::error::PirError;
use crate::params::{BinomialMode, Entry, ENTRY_SIZE};

/// Punctured-set query: `p` is the punctured block set, `offsets` holds
/// one in-block offset per block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub p: Vec<u64>,
    pub offsets: Vec<u64>,
}

/// `r0` is the parity of the punctured set; `r1` is reserved for the
/// backup-hint reconstruction variant and is always zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub r0: String,
    pub r1: String,
    pub server_time_nanos: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetParityRequest {
    pub indices: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetParityResponse {
    pub parity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSetRequest {
    /// Hex-encoded 16-byte PRSet key.
    pub prf_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FullSetResponse {
    pub value: String,
}

/// Parameter handshake served at `/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub db_size: u64,
    pub chunk_size: u64,
    pub set_size: u64,
    pub snapshot_version: String,
}

/// Snapshot manifest: artifact list with digests and optional IPFS
/// fallbacks. Clients verify SHA-256 before using any artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub db_size: u64,
    pub chunk_size: u64,
    pub set_size: u64,
    #[serde(default)]
    pub binomial_mode: BinomialMode,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub path: String,
    pub size: u64,
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipfs: Option<IpfsPointer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpfsPointer {
    pub cid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
}

/// One `(index, delta)` record of the update feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaUpdate {
    pub index: u64,
    pub flags: u64,
    pub delta: Entry,
}

/// Encode a parity word as a decimal big integer.
pub fn encode_parity(entry: &Entry) -> String {
    BigUint::from_bytes_le(entry).to_str_radix(10)
}

/// Decode a decimal big integer back into a parity word.
///
/// A value that does not fit 256 bits cannot have been produced by an
/// honest fold and is reported as a reconstruction inconsistency.
pub fn decode_parity(text: &str) -> Result<Entry, PirError> {
    let value = BigUint::parse_bytes(text.as_bytes(), 10).ok_or_else(|| {
        PirError::ReconstructInconsistency(format!("non-decimal parity: {text:?}"))
    })?;

    let bytes = value.to_bytes_le();
    if bytes.len() > ENTRY_SIZE {
        return Err(PirError::ReconstructInconsistency(format!(
            "parity of {} bytes exceeds the {ENTRY_SIZE}-byte word",
            bytes.len()
        )));
    }

    let mut entry = [0u8; ENTRY_SIZE];
    entry[0..bytes.len()].copy_from_slice(&bytes);
    Ok(entry)
}

/// Decode the hex PRSet key of a full-set request.
pub fn decode_prf_key(text: &str) -> Result<[u8; 16], PirError> {
    let bytes = hex::decode(text)
        .map_err(|e| PirError::BadRequest(format!("prf_key is not hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| PirError::BadRequest("prf_key must be 16 bytes".into()))
}

/// Read every frame of a delta artifact in order.
pub fn read_delta_frames<R: Read>(reader: &mut R) -> Result<Vec<DeltaUpdate>, PirError> {
    let mut updates = Vec::new();

    loop {
        let count = match reader.read_u64::<LittleEndian>() {
            Ok(count) => count,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => {
                return Err(PirError::SnapshotIntegrityFailed(format!(
                    "delta frame header: {e}"
                )))
            }
        };

        for _ in 0..count {
            let index = read_u64_field(reader, "index")?;
            let flags = read_u64_field(reader, "flags")?;
            let mut delta = [0u8; ENTRY_SIZE];
            reader.read_exact(&mut delta).map_err(|e| {
                PirError::SnapshotIntegrityFailed(format!("delta payload: {e}"))
            })?;
            updates.push(DeltaUpdate { index, flags, delta });
        }
    }
    Ok(updates)
}

fn read_u64_field<R: Read>(reader: &mut R, field: &str) -> Result<u64, PirError> {
    reader
        .read_u64::<LittleEndian>()
        .map_err(|e| PirError::SnapshotIntegrityFailed(format!("delta {field}: {e}")))
}

/// Write one delta frame (used by tooling and tests).
pub fn write_delta_frame<W: Write>(
    writer: &mut W,
    updates: &[DeltaUpdate],
) -> std::io::Result<()> {
    writer.write_u64::<LittleEndian>(updates.len() as u64)?;
    for update in updates {
        writer.write_u64::<LittleEndian>(update.index)?;
        writer.write_u64::<LittleEndian>(update.flags)?;
        writer.write_all(&update.delta)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parity_survives_decimal_round_trip() {
        let mut entry = [0u8; ENTRY_SIZE];
        entry[0] = 0xFF;
        entry[31] = 0x80;

        let text = encode_parity(&entry);
        assert_eq!(decode_parity(&text).unwrap(), entry);

        assert_eq!(encode_parity(&[0u8; ENTRY_SIZE]), "0");
        assert_eq!(decode_parity("0").unwrap(), [0u8; ENTRY_SIZE]);
    }

    #[test]
    fn oversized_or_garbled_parity_is_rejected() {
        // 2^256 does not fit the word.
        let too_big = BigUint::from(1u8) << 256usize;
        assert!(matches!(
            decode_parity(&too_big.to_str_radix(10)),
            Err(PirError::ReconstructInconsistency(_))
        ));
        assert!(matches!(
            decode_parity("not-a-number"),
            Err(PirError::ReconstructInconsistency(_))
        ));
    }

    #[test]
    fn query_request_json_shape() {
        let request = QueryRequest {
            p: vec![0, 2],
            offsets: vec![5, 1, 7, 3],
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"p":[0,2],"offsets":[5,1,7,3]}"#);
    }

    #[test]
    fn manifest_parses_with_and_without_ipfs() {
        let json = r#"{
            "version": "12",
            "db_size": 1024,
            "chunk_size": 64,
            "set_size": 16,
            "binomial_mode": "normal_approx",
            "files": [
                {"path": "database.bin", "size": 32768, "sha256": "ab"},
                {"path": "deltas/000001.bin", "size": 96, "sha256": "cd",
                 "ipfs": {"cid": "bafy123", "gateway_url": "https://ipfs.io/ipfs/bafy123"}}
            ]
        }"#;
        let manifest: Manifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.files.len(), 2);
        assert!(manifest.files[0].ipfs.is_none());
        assert_eq!(manifest.files[1].ipfs.as_ref().unwrap().cid, "bafy123");
        assert_eq!(manifest.binomial_mode, BinomialMode::NormalApprox);
    }

    #[test]
    fn delta_frames_round_trip() {
        let mut delta = [0u8; ENTRY_SIZE];
        delta[3] = 0x11;
        let updates = vec![
            DeltaUpdate { index: 7, flags: 0, delta },
            DeltaUpdate { index: 9, flags: 1, delta: [0u8; ENTRY_SIZE] },
        ];

        let mut bytes = Vec::new();
        write_delta_frame(&mut bytes, &updates[0..1]).unwrap();
        write_delta_frame(&mut bytes, &updates[1..2]).unwrap();

        let decoded = read_delta_frames(&mut bytes.as_slice()).unwrap();
        assert_eq!(decoded, updates);
    }

    #[test]
    fn truncated_delta_frame_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&1u64.to_le_bytes());
        assert!(matches!(
            read_delta_frames(&mut bytes.as_slice()),
            Err(PirError::SnapshotIntegrityFailed(_))
        ));
    }

    #[test]
    fn prf_key_decoding() {
        let key = decode_prf_key("000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(key[15], 0x0f);
        assert!(decode_prf_key("xyz").is_err());
        assert!(decode_prf_key("0011").is_err());
    }
}
