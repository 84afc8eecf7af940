//! TLS 1.3 wire identifier tables.
//!
//! These enums are reference data the endpoint core forwards into the
//! handshake state; the drivers never interpret the codepoints themselves.
//! Every identifier round-trips through its human-readable name, and unknown
//! codepoints are preserved and rendered as hex.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Returned when a name fails to parse back into an identifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unrecognized identifier name: {0}")]
pub struct UnknownName(pub String);

fn parse_hex_codepoint(s: &str) -> Option<u16> {
    let digits = s.strip_prefix("0x")?;
    u16::from_str_radix(digits, 16).ok()
}

/// Protocol version codepoints, including the historical draft set and the
/// `-fb` deployment variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
    Tls13Draft20,
    Tls13Draft20Fb,
    Tls13Draft21,
    Tls13Draft21Fb,
    Tls13Draft22,
    Tls13Draft22Fb,
    Tls13Draft23,
    Tls13Draft23Fb,
    Tls13Draft26,
    Tls13Draft26Fb,
    Tls13Draft28,
    Unknown(u16),
}

impl ProtocolVersion {
    pub fn from_wire(value: u16) -> Self {
        use ProtocolVersion::*;
        match value {
            0x0301 => Tls10,
            0x0302 => Tls11,
            0x0303 => Tls12,
            0x0304 => Tls13,
            0x7f14 => Tls13Draft20,
            0xfb14 => Tls13Draft20Fb,
            0x7f15 => Tls13Draft21,
            0xfb15 => Tls13Draft21Fb,
            0x7f16 => Tls13Draft22,
            0xfb16 => Tls13Draft22Fb,
            0x7f17 => Tls13Draft23,
            0xfb17 => Tls13Draft23Fb,
            0x7f1a => Tls13Draft26,
            0xfb1a => Tls13Draft26Fb,
            0x7f1c => Tls13Draft28,
            other => Unknown(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        use ProtocolVersion::*;
        match self {
            Tls10 => 0x0301,
            Tls11 => 0x0302,
            Tls12 => 0x0303,
            Tls13 => 0x0304,
            Tls13Draft20 => 0x7f14,
            Tls13Draft20Fb => 0xfb14,
            Tls13Draft21 => 0x7f15,
            Tls13Draft21Fb => 0xfb15,
            Tls13Draft22 => 0x7f16,
            Tls13Draft22Fb => 0xfb16,
            Tls13Draft23 => 0x7f17,
            Tls13Draft23Fb => 0xfb17,
            Tls13Draft26 => 0x7f1a,
            Tls13Draft26Fb => 0xfb1a,
            Tls13Draft28 => 0x7f1c,
            Unknown(other) => other,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ProtocolVersion::*;
        let name = match self {
            Tls10 => "TLSv1.0",
            Tls11 => "TLSv1.1",
            Tls12 => "TLSv1.2",
            Tls13 => "TLSv1.3",
            Tls13Draft20 => "TLSv1.3-draft-20",
            Tls13Draft20Fb => "TLSv1.3-draft-20-fb",
            Tls13Draft21 => "TLSv1.3-draft-21",
            Tls13Draft21Fb => "TLSv1.3-draft-21-fb",
            Tls13Draft22 => "TLSv1.3-draft-22",
            Tls13Draft22Fb => "TLSv1.3-draft-22-fb",
            Tls13Draft23 => "TLSv1.3-draft-23",
            Tls13Draft23Fb => "TLSv1.3-draft-23-fb",
            Tls13Draft26 => "TLSv1.3-draft-26",
            Tls13Draft26Fb => "TLSv1.3-draft-26-fb",
            Tls13Draft28 => "TLSv1.3-draft-28",
            Unknown(value) => return write!(f, "{:#06x}", value),
        };
        f.write_str(name)
    }
}

impl FromStr for ProtocolVersion {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        use ProtocolVersion::*;
        let version = match s {
            "TLSv1.0" => Tls10,
            "TLSv1.1" => Tls11,
            "TLSv1.2" => Tls12,
            "TLSv1.3" => Tls13,
            "TLSv1.3-draft-20" => Tls13Draft20,
            "TLSv1.3-draft-20-fb" => Tls13Draft20Fb,
            "TLSv1.3-draft-21" => Tls13Draft21,
            "TLSv1.3-draft-21-fb" => Tls13Draft21Fb,
            "TLSv1.3-draft-22" => Tls13Draft22,
            "TLSv1.3-draft-22-fb" => Tls13Draft22Fb,
            "TLSv1.3-draft-23" => Tls13Draft23,
            "TLSv1.3-draft-23-fb" => Tls13Draft23Fb,
            "TLSv1.3-draft-26" => Tls13Draft26,
            "TLSv1.3-draft-26-fb" => Tls13Draft26Fb,
            "TLSv1.3-draft-28" => Tls13Draft28,
            other => match parse_hex_codepoint(other) {
                Some(value) => ProtocolVersion::from_wire(value),
                None => return Err(UnknownName(other.to_string())),
            },
        };
        Ok(version)
    }
}

/// Error from [`real_draft`] when the codepoint is not a TLS 1.3 version.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("real_draft called with non-1.3 version {0}")]
pub struct NotTls13(pub ProtocolVersion);

/// Normalize a TLS 1.3 version codepoint to its base draft.
///
/// The `-fb` variants collapse onto the draft they track; the final version
/// and bare drafts map to themselves. Any pre-1.3 or unknown codepoint is an
/// error.
pub fn real_draft(version: ProtocolVersion) -> Result<ProtocolVersion, NotTls13> {
    use ProtocolVersion::*;
    match version {
        Tls13 => Ok(Tls13),
        Tls13Draft20 | Tls13Draft20Fb => Ok(Tls13Draft20),
        Tls13Draft21 | Tls13Draft21Fb => Ok(Tls13Draft21),
        Tls13Draft22 | Tls13Draft22Fb => Ok(Tls13Draft22),
        Tls13Draft23 | Tls13Draft23Fb => Ok(Tls13Draft23),
        Tls13Draft26 | Tls13Draft26Fb => Ok(Tls13Draft26),
        Tls13Draft28 => Ok(Tls13Draft28),
        other => Err(NotTls13(other)),
    }
}

/// TLS 1.3 AEAD cipher suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Aes128GcmSha256,
    Aes256GcmSha384,
    Chacha20Poly1305Sha256,
    Unknown(u16),
}

impl CipherSuite {
    pub fn from_wire(value: u16) -> Self {
        match value {
            0x1301 => CipherSuite::Aes128GcmSha256,
            0x1302 => CipherSuite::Aes256GcmSha384,
            0x1303 => CipherSuite::Chacha20Poly1305Sha256,
            other => CipherSuite::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            CipherSuite::Aes128GcmSha256 => 0x1301,
            CipherSuite::Aes256GcmSha384 => 0x1302,
            CipherSuite::Chacha20Poly1305Sha256 => 0x1303,
            CipherSuite::Unknown(other) => other,
        }
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherSuite::Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::Chacha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
            CipherSuite::Unknown(value) => return write!(f, "{:#06x}", value),
        };
        f.write_str(name)
    }
}

impl FromStr for CipherSuite {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let suite = match s {
            "TLS_AES_128_GCM_SHA256" => CipherSuite::Aes128GcmSha256,
            "TLS_AES_256_GCM_SHA384" => CipherSuite::Aes256GcmSha384,
            "TLS_CHACHA20_POLY1305_SHA256" => CipherSuite::Chacha20Poly1305Sha256,
            other => match parse_hex_codepoint(other) {
                Some(value) => CipherSuite::from_wire(value),
                None => return Err(UnknownName(other.to_string())),
            },
        };
        Ok(suite)
    }
}

macro_rules! u8_id_table {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident = $value:literal, $text:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            Unknown(u8),
        }

        impl $name {
            pub fn from_wire(value: u8) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }

            pub fn to_wire(self) -> u8 {
                match self {
                    $($name::$variant => $value,)+
                    $name::Unknown(other) => other,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($text),)+
                    $name::Unknown(value) => write!(f, "{:#04x}", value),
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => match parse_hex_codepoint(other) {
                        Some(value) if value <= u8::MAX as u16 => {
                            Ok($name::from_wire(value as u8))
                        }
                        _ => Err(UnknownName(other.to_string())),
                    },
                }
            }
        }
    };
}

macro_rules! u16_id_table {
    (
        $(#[$meta:meta])*
        $name:ident {
            $($variant:ident = $value:literal, $text:literal;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            Unknown(u16),
        }

        impl $name {
            pub fn from_wire(value: u16) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }

            pub fn to_wire(self) -> u16 {
                match self {
                    $($name::$variant => $value,)+
                    $name::Unknown(other) => other,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($text),)+
                    $name::Unknown(value) => write!(f, "{:#06x}", value),
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownName;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => match parse_hex_codepoint(other) {
                        Some(value) => Ok($name::from_wire(value)),
                        None => Err(UnknownName(other.to_string())),
                    },
                }
            }
        }
    };
}

u8_id_table! {
    /// Alert descriptions carried in TLS alert records.
    AlertDescription {
        CloseNotify = 0, "close_notify";
        EndOfEarlyData = 1, "end_of_early_data";
        UnexpectedMessage = 10, "unexpected_message";
        BadRecordMac = 20, "bad_record_mac";
        RecordOverflow = 22, "record_overflow";
        HandshakeFailure = 40, "handshake_failure";
        BadCertificate = 42, "bad_certificate";
        UnsupportedCertificate = 43, "unsupported_certificate";
        CertificateRevoked = 44, "certificate_revoked";
        CertificateExpired = 45, "certificate_expired";
        CertificateUnknown = 46, "certificate_unknown";
        IllegalParameter = 47, "illegal_parameter";
        UnknownCa = 48, "unknown_ca";
        AccessDenied = 49, "access_denied";
        DecodeError = 50, "decode_error";
        DecryptError = 51, "decrypt_error";
        ProtocolVersion = 70, "protocol_version";
        InsufficientSecurity = 71, "insufficient_security";
        InternalError = 80, "internal_error";
        InappropriateFallback = 86, "inappropriate_fallback";
        UserCanceled = 90, "user_canceled";
        MissingExtension = 109, "missing_extension";
        UnsupportedExtension = 110, "unsupported_extension";
        CertificateUnobtainable = 111, "certificate_unobtainable";
        UnrecognizedName = 112, "unrecognized_name";
        BadCertificateStatusResponse = 113, "bad_certificate_status_response";
        BadCertificateHashValue = 114, "bad_certificate_hash_value";
        UnknownPskIdentity = 115, "unknown_psk_identity";
        CertificateRequired = 116, "certificate_required";
    }
}

u16_id_table! {
    /// Extension types recognized in hello and encrypted-extension messages.
    ExtensionType {
        ServerName = 0, "server_name";
        SupportedGroups = 10, "supported_groups";
        SignatureAlgorithms = 13, "signature_algorithms";
        Alpn = 16, "application_layer_protocol_negotiation";
        KeyShareOld = 40, "key_share_old";
        PreSharedKey = 41, "pre_shared_key";
        EarlyData = 42, "early_data";
        SupportedVersions = 43, "supported_versions";
        Cookie = 44, "cookie";
        PskKeyExchangeModes = 45, "psk_key_exchange_modes";
        CertificateAuthorities = 47, "certificate_authorities";
        PostHandshakeAuth = 49, "post_handshake_auth";
        SignatureAlgorithmsCert = 50, "signature_algorithms_cert";
        KeyShare = 51, "key_share";
        AlternateServerName = 0x4242, "alternate_server_name";
    }
}

u16_id_table! {
    /// Signature schemes accepted for CertificateVerify.
    SignatureScheme {
        EcdsaSecp256r1Sha256 = 0x0403, "ecdsa_secp256r1_sha256";
        EcdsaSecp384r1Sha384 = 0x0503, "ecdsa_secp384r1_sha384";
        EcdsaSecp521r1Sha512 = 0x0603, "ecdsa_secp521r1_sha512";
        RsaPssSha256 = 0x0804, "rsa_pss_sha256";
        RsaPssSha384 = 0x0805, "rsa_pss_sha384";
        RsaPssSha512 = 0x0806, "rsa_pss_sha512";
        Ed25519 = 0x0807, "ed25519";
        Ed448 = 0x0808, "ed448";
    }
}

u16_id_table! {
    /// Key-share groups offered by this implementation.
    NamedGroup {
        Secp256r1 = 23, "secp256r1";
        X25519 = 29, "x25519";
    }
}

u8_id_table! {
    /// PSK key-exchange modes.
    PskKeyExchangeMode {
        PskKe = 0, "psk_ke";
        PskDheKe = 1, "psk_dhe_ke";
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_names_round_trip() {
        let versions = [
            ProtocolVersion::Tls10,
            ProtocolVersion::Tls12,
            ProtocolVersion::Tls13,
            ProtocolVersion::Tls13Draft23,
            ProtocolVersion::Tls13Draft23Fb,
            ProtocolVersion::Tls13Draft28,
        ];
        for version in versions {
            let name = version.to_string();
            assert_eq!(name.parse::<ProtocolVersion>().unwrap(), version);
            assert_eq!(ProtocolVersion::from_wire(version.to_wire()), version);
        }
    }

    #[test]
    fn unknown_version_renders_hex_and_round_trips() {
        let version = ProtocolVersion::from_wire(0x1a2b);
        assert_eq!(version, ProtocolVersion::Unknown(0x1a2b));
        assert_eq!(version.to_string(), "0x1a2b");
        assert_eq!("0x1a2b".parse::<ProtocolVersion>().unwrap(), version);
    }

    #[test]
    fn fb_variants_normalize_to_base_draft() {
        let pairs = [
            (ProtocolVersion::Tls13Draft20Fb, ProtocolVersion::Tls13Draft20),
            (ProtocolVersion::Tls13Draft21Fb, ProtocolVersion::Tls13Draft21),
            (ProtocolVersion::Tls13Draft22Fb, ProtocolVersion::Tls13Draft22),
            (ProtocolVersion::Tls13Draft23Fb, ProtocolVersion::Tls13Draft23),
            (ProtocolVersion::Tls13Draft26Fb, ProtocolVersion::Tls13Draft26),
        ];
        for (fb, base) in pairs {
            assert_eq!(real_draft(fb).unwrap(), base);
            assert_eq!(real_draft(base).unwrap(), base);
        }
        assert_eq!(
            real_draft(ProtocolVersion::Tls13).unwrap(),
            ProtocolVersion::Tls13
        );
        assert_eq!(
            real_draft(ProtocolVersion::Tls13Draft28).unwrap(),
            ProtocolVersion::Tls13Draft28
        );
    }

    #[test]
    fn real_draft_rejects_pre_13_versions() {
        assert_eq!(
            real_draft(ProtocolVersion::Tls12),
            Err(NotTls13(ProtocolVersion::Tls12))
        );
        assert!(real_draft(ProtocolVersion::Unknown(0x0305)).is_err());
    }

    #[test]
    fn cipher_names_round_trip() {
        for suite in [
            CipherSuite::Aes128GcmSha256,
            CipherSuite::Aes256GcmSha384,
            CipherSuite::Chacha20Poly1305Sha256,
        ] {
            assert_eq!(suite.to_string().parse::<CipherSuite>().unwrap(), suite);
        }
        assert_eq!(CipherSuite::Unknown(0x1304).to_string(), "0x1304");
    }

    #[test]
    fn alert_table_round_trips() {
        for value in 0u8..=255 {
            let alert = AlertDescription::from_wire(value);
            assert_eq!(alert.to_wire(), value);
            assert_eq!(alert.to_string().parse::<AlertDescription>().unwrap(), alert);
        }
        assert_eq!(AlertDescription::CloseNotify.to_string(), "close_notify");
        assert_eq!(AlertDescription::Unknown(200).to_string(), "0xc8");
    }

    #[test]
    fn extension_and_scheme_names() {
        assert_eq!(
            ExtensionType::Alpn.to_string(),
            "application_layer_protocol_negotiation"
        );
        assert_eq!(ExtensionType::KeyShare.to_wire(), 51);
        assert_eq!(ExtensionType::KeyShareOld.to_wire(), 40);
        assert_eq!(
            "alternate_server_name".parse::<ExtensionType>().unwrap(),
            ExtensionType::AlternateServerName
        );
        assert_eq!(SignatureScheme::Ed25519.to_string(), "ed25519");
        assert_eq!(NamedGroup::X25519.to_wire(), 29);
        assert_eq!(
            PskKeyExchangeMode::PskDheKe.to_string().parse::<PskKeyExchangeMode>().unwrap(),
            PskKeyExchangeMode::PskDheKe
        );
    }
}
