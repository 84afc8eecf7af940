//! Exported keying material (RFC 8446 §7.5).
//!
//! Outputs are derived from the exporter master secret with the negotiated
//! cipher's hash: a per-label secret via `Derive-Secret(secret, label, "")`,
//! then an `HKDF-Expand-Label` over the hashed caller context.

use bytes::Bytes;
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha384};
use thiserror::Error;
use trellis_core::ids::CipherSuite;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExporterError {
    #[error("connection not established")]
    NotEstablished,
    #[error("unsupported cipher suite {0}")]
    UnsupportedCipher(CipherSuite),
    #[error("exporter secret has the wrong length for the negotiated hash")]
    InvalidSecret,
    #[error("requested exporter output too long")]
    OutputTooLong,
}

/// Derive `length` bytes keyed by `secret` under `label` and `context`.
pub fn export_keying_material(
    cipher: CipherSuite,
    secret: &[u8],
    label: &str,
    context: Option<&[u8]>,
    length: u16,
) -> Result<Bytes, ExporterError> {
    let context = context.unwrap_or(&[]);
    let out = match cipher {
        CipherSuite::Aes128GcmSha256 | CipherSuite::Chacha20Poly1305Sha256 => {
            let empty_hash = Sha256::digest(b"");
            let derived = expand_label_sha256(secret, label.as_bytes(), &empty_hash, 32)?;
            let context_hash = Sha256::digest(context);
            expand_label_sha256(&derived, b"exporter", &context_hash, length as usize)?
        }
        CipherSuite::Aes256GcmSha384 => {
            let empty_hash = Sha384::digest(b"");
            let derived = expand_label_sha384(secret, label.as_bytes(), &empty_hash, 48)?;
            let context_hash = Sha384::digest(context);
            expand_label_sha384(&derived, b"exporter", &context_hash, length as usize)?
        }
        other => return Err(ExporterError::UnsupportedCipher(other)),
    };
    Ok(Bytes::from(out))
}

fn hkdf_label(label: &[u8], context: &[u8], length: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(4 + PREFIX.len() + label.len() + context.len());
    info.extend_from_slice(&(length as u16).to_be_bytes());
    info.push((PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(PREFIX);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    info
}

fn expand_label_sha256(
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>, ExporterError> {
    let hkdf = Hkdf::<Sha256>::from_prk(secret).map_err(|_| ExporterError::InvalidSecret)?;
    let mut out = vec![0u8; length];
    hkdf.expand(&hkdf_label(label, context, length), &mut out)
        .map_err(|_| ExporterError::OutputTooLong)?;
    Ok(out)
}

fn expand_label_sha384(
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>, ExporterError> {
    let hkdf = Hkdf::<Sha384>::from_prk(secret).map_err(|_| ExporterError::InvalidSecret)?;
    let mut out = vec![0u8; length];
    hkdf.expand(&hkdf_label(label, context, length), &mut out)
        .map_err(|_| ExporterError::OutputTooLong)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"12345678901234567890123456789012";

    #[test]
    fn derivation_is_deterministic() {
        let a = export_keying_material(
            CipherSuite::Aes128GcmSha256,
            SECRET,
            "EXPORTER-Some-Label",
            None,
            32,
        )
        .unwrap();
        let b = export_keying_material(
            CipherSuite::Aes128GcmSha256,
            SECRET,
            "EXPORTER-Some-Label",
            None,
            32,
        )
        .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn labels_and_contexts_separate_outputs() {
        let base = export_keying_material(
            CipherSuite::Aes128GcmSha256,
            SECRET,
            "EXPORTER-Some-Label",
            None,
            32,
        )
        .unwrap();
        let other_label = export_keying_material(
            CipherSuite::Aes128GcmSha256,
            SECRET,
            "EXPORTER-Other-Label",
            None,
            32,
        )
        .unwrap();
        let with_context = export_keying_material(
            CipherSuite::Aes128GcmSha256,
            SECRET,
            "EXPORTER-Some-Label",
            Some(b"context"),
            32,
        )
        .unwrap();
        assert_ne!(base, other_label);
        assert_ne!(base, with_context);
    }

    #[test]
    fn sha384_suite_requires_longer_secret() {
        let secret48 = [7u8; 48];
        let out = export_keying_material(
            CipherSuite::Aes256GcmSha384,
            &secret48,
            "EXPORTER-Some-Label",
            None,
            64,
        )
        .unwrap();
        assert_eq!(out.len(), 64);
        assert_eq!(
            export_keying_material(
                CipherSuite::Aes256GcmSha384,
                SECRET,
                "EXPORTER-Some-Label",
                None,
                32,
            ),
            Err(ExporterError::InvalidSecret)
        );
    }

    #[test]
    fn unknown_cipher_is_rejected() {
        assert_eq!(
            export_keying_material(
                CipherSuite::Unknown(0x1304),
                SECRET,
                "EXPORTER-Some-Label",
                None,
                32,
            ),
            Err(ExporterError::UnsupportedCipher(CipherSuite::Unknown(0x1304)))
        );
    }
}
