//! Check authorization codec.
//!
//! A check is never stored. It is a recoverable secp256k1 signature over a
//! digest binding three identities: the ledger that holds the funds, the
//! asset, and the recipient. Whoever can produce that signature controls the
//! signer's whole balance of the asset.
//!
//! Layout of the signed material:
//!
//! ```text
//! digest = keccak256(ledger[20] ‖ asset[20] ‖ recipient[20])
//! hash   = digest                                               (raw)
//!        | keccak256("\x19Ethereum Signed Message:\n32" ‖ digest) (eip191)
//! ```
//!
//! Signatures travel as 65 bytes `r ‖ s ‖ v` with `v = 27 + recovery bit`.

use std::fmt;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest, Keccak256};

use crate::address::Address;

pub const DIGEST_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 65;
pub const V_OFFSET: u8 = 27;

const EIP191_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

/// secp256k1 group order, big-endian.
const CURVE_ORDER: [u8; 32] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe,
    0xba, 0xae, 0xdc, 0xe6, 0xaf, 0x48, 0xa0, 0x3b, 0xbf, 0xd2, 0x5e, 0x8c, 0xd0, 0x36, 0x41, 0x41,
];

/// floor(n / 2), big-endian. Any `s` above it is the malleable twin.
const HALF_ORDER: [u8; 32] = [
    0x7f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0x5d, 0x57, 0x6e, 0x73, 0x57, 0xa4, 0x50, 0x1d, 0xdf, 0xe9, 0x2f, 0x46, 0x68, 0x1b, 0x20, 0xa0,
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("signature must be 65 bytes, got {0}")]
    InvalidLength(usize),
    #[error("invalid signature hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid recovery discriminant v={0}, expected 27 or 28")]
    InvalidRecoveryId(u8),
    #[error("signature component {0} outside [1, n-1]")]
    ScalarOutOfRange(&'static str),
    #[error("signature s component is in the upper half of the curve order")]
    HighS,
    #[error("public key recovery failed")]
    Recovery,
    #[error("invalid secret key")]
    InvalidSecretKey,
    #[error("signing failed")]
    Signing,
}

/// How the 32-byte check digest is turned into the hash that actually gets
/// signed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageConvention {
    /// The digest itself is signed.
    #[default]
    Raw,
    /// `personal_sign` style: the digest is wrapped in the
    /// `"\x19Ethereum Signed Message:\n32"` envelope and hashed again.
    Eip191,
}

impl fmt::Display for MessageConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageConvention::Eip191 => f.write_str("eip191"),
            MessageConvention::Raw => f.write_str("raw"),
        }
    }
}

impl FromStr for MessageConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "eip191" => Ok(MessageConvention::Eip191),
            "raw" => Ok(MessageConvention::Raw),
            other => Err(format!("unknown message convention {other}")),
        }
    }
}

pub fn keccak256(data: &[u8]) -> [u8; DIGEST_LEN] {
    Keccak256::digest(data).into()
}

/// Canonical check digest over the packed 60-byte triple.
pub fn build_digest(ledger: &Address, asset: &Address, recipient: &Address) -> [u8; DIGEST_LEN] {
    let mut hasher = Keccak256::new();
    hasher.update(ledger.as_bytes());
    hasher.update(asset.as_bytes());
    hasher.update(recipient.as_bytes());
    hasher.finalize().into()
}

/// Hash that the signer's key is applied to under `convention`.
pub fn signing_hash(digest: &[u8; DIGEST_LEN], convention: MessageConvention) -> [u8; DIGEST_LEN] {
    match convention {
        MessageConvention::Raw => *digest,
        MessageConvention::Eip191 => {
            let mut hasher = Keccak256::new();
            hasher.update(EIP191_PREFIX);
            hasher.update(digest);
            hasher.finalize().into()
        }
    }
}

/// Account identity of a public key: the last 20 bytes of keccak256 over the
/// uncompressed point without its SEC1 tag.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    Address(out)
}

/// Recoverable ECDSA signature in wire order.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub v: u8,
}

impl RecoverableSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        if bytes.len() != SIGNATURE_LEN {
            return Err(AuthError::InvalidLength(bytes.len()));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..64]);
        Ok(Self { r, s, v: bytes[64] })
    }

    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        let mut out = [0u8; SIGNATURE_LEN];
        out[..32].copy_from_slice(&self.r);
        out[32..64].copy_from_slice(&self.s);
        out[64] = self.v;
        out
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.to_bytes()))
    }

    /// Range checks that must pass before any curve arithmetic runs.
    fn validate(&self) -> Result<RecoveryId, AuthError> {
        let bit = match self.v {
            27 | 28 => self.v - V_OFFSET,
            other => return Err(AuthError::InvalidRecoveryId(other)),
        };
        if !in_scalar_range(&self.r) {
            return Err(AuthError::ScalarOutOfRange("r"));
        }
        if !in_scalar_range(&self.s) {
            return Err(AuthError::ScalarOutOfRange("s"));
        }
        if self.s > HALF_ORDER {
            return Err(AuthError::HighS);
        }
        RecoveryId::from_byte(bit).ok_or(AuthError::InvalidRecoveryId(self.v))
    }
}

fn in_scalar_range(bytes: &[u8; 32]) -> bool {
    bytes.iter().any(|b| *b != 0) && *bytes < CURVE_ORDER
}

impl FromStr for RecoverableSignature {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Display for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoverableSignature")
            .field("r", &hex::encode(self.r))
            .field("s", &hex::encode(self.s))
            .field("v", &self.v)
            .finish()
    }
}

impl Serialize for RecoverableSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecoverableSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        encoded.parse().map_err(D::Error::custom)
    }
}

/// Recover the identity that signed `hash`.
///
/// Components are range-checked first, so a malformed signature is rejected
/// instead of recovering some unrelated key.
pub fn recover_signer(
    hash: &[u8; DIGEST_LEN],
    signature: &RecoverableSignature,
) -> Result<Address, AuthError> {
    let recovery_id = signature.validate()?;
    let mut rs = [0u8; 64];
    rs[..32].copy_from_slice(&signature.r);
    rs[32..].copy_from_slice(&signature.s);
    let sig = Signature::from_slice(&rs).map_err(|_| AuthError::Recovery)?;
    let key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
        .map_err(|_| AuthError::Recovery)?;
    Ok(address_of(&key))
}

/// Holder-side key that writes checks.
#[derive(Clone)]
pub struct CheckSigner {
    key: SigningKey,
}

impl CheckSigner {
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AuthError> {
        let key = SigningKey::from_slice(bytes).map_err(|_| AuthError::InvalidSecretKey)?;
        Ok(Self { key })
    }

    pub fn from_hex(encoded: &str) -> Result<Self, AuthError> {
        let encoded = encoded.trim();
        let encoded = encoded.strip_prefix("0x").unwrap_or(encoded);
        Self::from_bytes(&hex::decode(encoded)?)
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }

    pub fn sign_hash(&self, hash: &[u8; DIGEST_LEN]) -> Result<RecoverableSignature, AuthError> {
        let (sig, recovery_id) = self
            .key
            .sign_prehash_recoverable(hash)
            .map_err(|_| AuthError::Signing)?;
        if recovery_id.is_x_reduced() {
            return Err(AuthError::Signing);
        }
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);
        Ok(RecoverableSignature {
            r,
            s,
            v: V_OFFSET + u8::from(recovery_id.is_y_odd()),
        })
    }

    /// Write a check that lets `recipient` sweep this signer's balance of
    /// `asset` held by `ledger`.
    pub fn sign_authorization(
        &self,
        ledger: &Address,
        asset: &Address,
        recipient: &Address,
        convention: MessageConvention,
    ) -> Result<RecoverableSignature, AuthError> {
        let digest = build_digest(ledger, asset, recipient);
        self.sign_hash(&signing_hash(&digest, convention))
    }
}

impl fmt::Debug for CheckSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckSigner")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}
