//! Engine artifact container
//!
//! A serialized plan is wrapped in a fixed 48-byte little-endian header:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 4 | magic `TRTB` |
//! | 4 | 2 | format version (`1`) |
//! | 6 | 1 | platform tag (`1` x86_64, `2` aarch64) |
//! | 7 | 1 | reserved, zero |
//! | 8 | 8 | payload length |
//! | 16 | 32 | SHA-256 of the payload |
//!
//! The payload is the native plan, exactly as produced by the builder.

use crate::error::{Error, Result};
use crate::probe::Platform;
use sha2::{Digest, Sha256};

pub const MAGIC: [u8; 4] = *b"TRTB";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 48;

/// Decoded artifact header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactHeader {
    pub version: u16,
    pub platform: Platform,
    pub payload_len: u64,
    pub digest: [u8; 32],
}

/// Whether `bytes` start with the artifact magic
pub fn is_artifact(bytes: &[u8]) -> bool {
    bytes.starts_with(&MAGIC)
}

/// Wrap a native plan for `platform`
pub fn encode(platform: Platform, payload: &[u8]) -> Vec<u8> {
    let digest: [u8; 32] = Sha256::digest(payload).into();
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.push(platform.tag());
    out.push(0);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&digest);
    out.extend_from_slice(payload);
    out
}

/// Parse and check the header without verifying the payload
pub fn read_header(bytes: &[u8]) -> Result<ArtifactHeader> {
    if !is_artifact(bytes) {
        return Err(Error::Format("not an engine artifact (bad magic)".to_string()));
    }
    if bytes.len() < HEADER_LEN {
        return Err(Error::Corruption(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != FORMAT_VERSION {
        return Err(Error::Format(format!(
            "unsupported artifact version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let platform = Platform::from_tag(bytes[6])
        .ok_or_else(|| Error::Format(format!("unknown platform tag {}", bytes[6])))?;
    if bytes[7] != 0 {
        return Err(Error::Corruption("reserved header byte is not zero".to_string()));
    }

    let mut len = [0u8; 8];
    len.copy_from_slice(&bytes[8..16]);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&bytes[16..HEADER_LEN]);

    Ok(ArtifactHeader {
        version,
        platform,
        payload_len: u64::from_le_bytes(len),
        digest,
    })
}

/// Validate an artifact for `expected` and return its payload
pub fn decode(bytes: &[u8], expected: Platform) -> Result<&[u8]> {
    let header = read_header(bytes)?;
    if header.platform != expected {
        return Err(Error::Format(format!(
            "engine was built for {}, running on {}",
            header.platform, expected
        )));
    }

    let payload = &bytes[HEADER_LEN..];
    if payload.len() as u64 != header.payload_len {
        return Err(Error::Corruption(format!(
            "payload is {} bytes, header declares {}",
            payload.len(),
            header.payload_len
        )));
    }
    let digest: [u8; 32] = Sha256::digest(payload).into();
    if digest != header.digest {
        return Err(Error::Corruption("payload checksum mismatch".to_string()));
    }

    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &[u8] = b"native plan bytes";

    #[test]
    fn test_header_layout() {
        let artifact = encode(Platform::Aarch64, PAYLOAD);
        assert_eq!(artifact.len(), HEADER_LEN + PAYLOAD.len());
        assert_eq!(&artifact[..4], b"TRTB");

        let header = read_header(&artifact).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.platform, Platform::Aarch64);
        assert_eq!(header.payload_len, PAYLOAD.len() as u64);
        assert_eq!(decode(&artifact, Platform::Aarch64).unwrap(), PAYLOAD);
    }

    #[test]
    fn test_foreign_bytes_are_format_errors() {
        assert!(!is_artifact(b"\x08\x07onnx"));
        assert!(matches!(read_header(b"ONNX"), Err(Error::Format(_))));

        let mut artifact = encode(Platform::X86_64, PAYLOAD);
        artifact[4] = 2;
        assert!(matches!(read_header(&artifact), Err(Error::Format(_))));
    }

    #[test]
    fn test_wrong_platform() {
        let artifact = encode(Platform::X86_64, PAYLOAD);
        let err = decode(&artifact, Platform::Aarch64).unwrap_err();
        assert!(matches!(err, Error::Format(_)));
        assert!(err.to_string().contains("built for x86_64"));
    }

    #[test]
    fn test_damage_is_corruption() {
        let artifact = encode(Platform::X86_64, PAYLOAD);

        let truncated = &artifact[..20];
        assert!(matches!(
            decode(truncated, Platform::X86_64),
            Err(Error::Corruption(_))
        ));

        let short = &artifact[..artifact.len() - 1];
        assert!(matches!(
            decode(short, Platform::X86_64),
            Err(Error::Corruption(_))
        ));

        let mut flipped = artifact.clone();
        *flipped.last_mut().unwrap() ^= 0xff;
        assert!(matches!(
            decode(&flipped, Platform::X86_64),
            Err(Error::Corruption(_))
        ));
    }
}
