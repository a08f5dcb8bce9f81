//! RSA public key material extraction.
//!
//! Walks the DER structure of a SubjectPublicKeyInfo-wrapped RSA key:
//!
//! ```text
//! SEQUENCE {
//!   SEQUENCE { OID rsaEncryption, NULL }
//!   BIT STRING { SEQUENCE { INTEGER modulus, INTEGER exponent } }
//! }
//! ```
//!
//! Only this one shape is understood. Anything else is rejected.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use std::fmt;

const TAG_INTEGER: u8 = 0x02;
const TAG_BIT_STRING: u8 = 0x03;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;

/// 1.2.840.113549.1.1.1
const RSA_ENCRYPTION_OID: &[u8] = &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01];

/// Modulus and public exponent as unsigned big-endian bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicComponents {
    pub modulus: Vec<u8>,
    pub exponent: Vec<u8>,
}

impl RsaPublicComponents {
    /// Modulus as unpadded base64url (the JWK `n` member).
    pub fn n_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.modulus)
    }

    /// Exponent as unpadded base64url (the JWK `e` member).
    pub fn e_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(&self.exponent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    InvalidPem,
    Truncated,
    InvalidLength,
    UnexpectedTag { expected: u8, found: u8 },
    NotRsa,
    UnusedBits(u8),
    EmptyInteger,
    TrailingData,
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::InvalidPem => write!(f, "invalid PEM encoding"),
            KeyError::Truncated => write!(f, "DER structure is truncated"),
            KeyError::InvalidLength => write!(f, "unsupported DER length encoding"),
            KeyError::UnexpectedTag { expected, found } => write!(
                f,
                "unexpected DER tag 0x{found:02x} (expected 0x{expected:02x})"
            ),
            KeyError::NotRsa => write!(f, "key algorithm is not rsaEncryption"),
            KeyError::UnusedBits(n) => write!(f, "BIT STRING has {n} unused bits"),
            KeyError::EmptyInteger => write!(f, "empty INTEGER"),
            KeyError::TrailingData => write!(f, "trailing data after key structure"),
        }
    }
}

impl std::error::Error for KeyError {}

/// Strip PEM armour and decode the base64 body.
pub fn pem_to_der(pem: &str) -> Result<Vec<u8>, KeyError> {
    if !pem.contains("-----BEGIN") {
        return Err(KeyError::InvalidPem);
    }
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return Err(KeyError::InvalidPem);
    }
    STANDARD.decode(body).map_err(|_| KeyError::InvalidPem)
}

/// Parse a PEM-encoded SPKI RSA public key.
pub fn parse_public_pem(pem: &str) -> Result<RsaPublicComponents, KeyError> {
    parse_spki_rsa(&pem_to_der(pem)?)
}

/// Extract modulus and exponent from DER-encoded SPKI bytes.
pub fn parse_spki_rsa(der: &[u8]) -> Result<RsaPublicComponents, KeyError> {
    let mut outer = DerReader::new(der);
    let spki = outer.read(TAG_SEQUENCE)?;
    outer.finish()?;

    let mut spki = DerReader::new(spki);
    let mut algorithm = DerReader::new(spki.read(TAG_SEQUENCE)?);
    if algorithm.read(TAG_OID)? != RSA_ENCRYPTION_OID {
        return Err(KeyError::NotRsa);
    }
    let bits = spki.read(TAG_BIT_STRING)?;
    spki.finish()?;

    let (&unused, key) = bits.split_first().ok_or(KeyError::Truncated)?;
    if unused != 0 {
        return Err(KeyError::UnusedBits(unused));
    }

    let mut wrapper = DerReader::new(key);
    let rsa_key = wrapper.read(TAG_SEQUENCE)?;
    wrapper.finish()?;

    let mut fields = DerReader::new(rsa_key);
    let modulus = fields.read(TAG_INTEGER)?;
    let exponent = fields.read(TAG_INTEGER)?;
    fields.finish()?;

    Ok(RsaPublicComponents {
        modulus: strip_sign_pad(modulus)?.to_vec(),
        exponent: strip_sign_pad(exponent)?.to_vec(),
    })
}

/// DER INTEGERs are signed; a 0x00 is prepended when the high bit is set.
fn strip_sign_pad(value: &[u8]) -> Result<&[u8], KeyError> {
    match value {
        [] => Err(KeyError::EmptyInteger),
        [0, rest @ ..] if !rest.is_empty() => Ok(rest),
        _ => Ok(value),
    }
}

struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8, KeyError> {
        let b = *self.data.get(self.pos).ok_or(KeyError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn length(&mut self) -> Result<usize, KeyError> {
        let first = self.byte()?;
        if first < 0x80 {
            return Ok(first as usize);
        }
        let count = (first & 0x7f) as usize;
        // 0x80 is the BER indefinite form, which DER forbids.
        if count == 0 || count > 4 {
            return Err(KeyError::InvalidLength);
        }
        let mut len = 0usize;
        for _ in 0..count {
            len = (len << 8) | self.byte()? as usize;
        }
        Ok(len)
    }

    /// Read one TLV with the given tag and return its contents.
    fn read(&mut self, tag: u8) -> Result<&'a [u8], KeyError> {
        let found = self.byte()?;
        if found != tag {
            return Err(KeyError::UnexpectedTag {
                expected: tag,
                found,
            });
        }
        let len = self.length()?;
        let end = self.pos.checked_add(len).ok_or(KeyError::InvalidLength)?;
        let contents = self.data.get(self.pos..end).ok_or(KeyError::Truncated)?;
        self.pos = end;
        Ok(contents)
    }

    fn finish(&self) -> Result<(), KeyError> {
        if self.pos == self.data.len() {
            Ok(())
        } else {
            Err(KeyError::TrailingData)
        }
    }
}
