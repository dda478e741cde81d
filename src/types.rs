// SPDX-License-Identifier: Apache-2.0

//! TPM 2.0 data structures.
//!
//! Union types from part 2 of the library spec are modelled as closed-world
//! enums; the selector field of the enclosing structure picks the active
//! arm at (de)serialization time. Spec-aliased selector values (AES, SM4
//! and Camellia all select the `sym` arm) are normalized here.

use crate::constants::*;
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};

fn unknown_alg(what: &str, v: u16) -> Error {
    Error::unmarshal(format!("selector out of range for {}: 0x{:04x}", what, v))
}

fn get_alg(buf: &mut ResponseBuffer, what: &str) -> Result<TpmAlgId> {
    let raw = buf.get_u16()?;
    TpmAlgId::from_u16(raw).ok_or_else(|| unknown_alg(what, raw))
}

/// The name of a TPM entity: either a 4-byte handle or an algorithm
/// identifier followed by a digest. Equality is byte equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Name(Vec<u8>);

impl Name {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// The name of a permanent or PCR entity is its handle.
    pub fn from_handle(handle: Handle) -> Self {
        Self(handle.to_be_bytes().to_vec())
    }

    /// Build a name from an algorithm and a digest computed over a public
    /// area.
    pub fn from_digest(alg: TpmAlgId, digest: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(2 + digest.len());
        bytes.extend_from_slice(&alg.to_u16().to_be_bytes());
        bytes.extend_from_slice(digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_handle(&self) -> bool {
        self.0.len() == 4
    }

    pub fn handle(&self) -> Option<Handle> {
        if !self.is_handle() {
            return None;
        }
        Some(Handle::from_be_bytes([
            self.0[0], self.0[1], self.0[2], self.0[3],
        ]))
    }

    /// The name algorithm, for digest-form names.
    pub fn algorithm(&self) -> Option<TpmAlgId> {
        if self.0.len() < 2 || self.is_handle() {
            return None;
        }
        let alg = TpmAlgId::from_u16(u16::from_be_bytes([self.0[0], self.0[1]]))?;
        if alg.digest_size() + 2 == self.0.len() {
            Some(alg)
        } else {
            None
        }
    }

    /// A name is valid if it is a handle or a correctly sized tagged
    /// digest.
    pub fn is_valid(&self) -> bool {
        self.is_handle() || self.algorithm().is_some()
    }
}

impl Marshal for Name {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_tpm2b(&self.0);
    }

    fn is_sized_buffer(&self) -> bool {
        true
    }
}

impl Unmarshal for Name {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self(buf.get_tpm2b()?))
    }
}

macro_rules! tpm2b_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Default, PartialEq, Eq)]
        pub struct $name {
            pub buffer: Vec<u8>,
        }

        impl $name {
            pub fn new(data: impl Into<Vec<u8>>) -> Self {
                Self { buffer: data.into() }
            }

            pub fn empty() -> Self {
                Self { buffer: Vec::new() }
            }

            pub fn len(&self) -> usize {
                self.buffer.len()
            }

            pub fn is_empty(&self) -> bool {
                self.buffer.is_empty()
            }
        }

        impl Marshal for $name {
            fn marshal(&self, buf: &mut CommandBuffer) {
                buf.put_tpm2b(&self.buffer);
            }

            fn is_sized_buffer(&self) -> bool {
                true
            }
        }

        impl Unmarshal for $name {
            fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
                Ok(Self { buffer: buf.get_tpm2b()? })
            }
        }
    };
}

tpm2b_type!(
    /// TPM2B_DIGEST
    Tpm2bDigest
);
tpm2b_type!(
    /// TPM2B_DATA
    Tpm2bData
);
tpm2b_type!(
    /// TPM2B_AUTH
    Tpm2bAuth
);
tpm2b_type!(
    /// TPM2B_SENSITIVE_DATA
    Tpm2bSensitiveData
);
tpm2b_type!(
    /// TPM2B_MAX_NV_BUFFER
    Tpm2bMaxNvBuffer
);
tpm2b_type!(
    /// TPM2B_PRIVATE
    Tpm2bPrivate
);
tpm2b_type!(
    /// TPM2B_ENCRYPTED_SECRET
    Tpm2bEncryptedSecret
);
tpm2b_type!(
    /// TPM2B_TIMEOUT
    Tpm2bTimeout
);
tpm2b_type!(
    /// TPM2B_CONTEXT_DATA
    Tpm2bContextData
);

/// TPM2B_NONCE
pub type Tpm2bNonce = Tpm2bDigest;

/// TPMT_HA: a digest tagged with its algorithm. The digest is written raw,
/// its length implied by the algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtHa {
    pub hash_alg: TpmAlgId,
    pub digest: Vec<u8>,
}

impl TpmtHa {
    pub fn new(hash_alg: TpmAlgId, digest: Vec<u8>) -> Self {
        Self { hash_alg, digest }
    }

    /// An all-zero digest of the algorithm's size, the starting point of
    /// policy digest chains.
    pub fn zeroed(hash_alg: TpmAlgId) -> Self {
        Self {
            hash_alg,
            digest: vec![0u8; hash_alg.digest_size()],
        }
    }
}

impl Marshal for TpmtHa {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_bytes(&self.digest);
    }
}

impl Unmarshal for TpmtHa {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg = get_alg(buf, "TPMT_HA")?;
        let size = hash_alg.digest_size();
        if size == 0 {
            return Err(unknown_alg("TPMT_HA digest", hash_alg.to_u16()));
        }
        let digest = buf.get_bytes(size)?;
        Ok(Self { hash_alg, digest })
    }
}

/// A list of per-algorithm digests for the same value.
pub type TaggedHashList = Vec<TpmtHa>;

/// TPMT_SYM_DEF: symmetric algorithm selection for sessions. The key-bits
/// and mode unions are selected by the algorithm field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtSymDef {
    Null,
    /// AES, SM4 or Camellia with a key size and a block mode.
    Sym {
        algorithm: TpmAlgId,
        key_bits: u16,
        mode: TpmAlgId,
    },
    /// XOR obfuscation parameterized by a hash algorithm.
    Xor { hash_alg: TpmAlgId },
}

impl TpmtSymDef {
    pub fn aes_128_cfb() -> Self {
        TpmtSymDef::Sym {
            algorithm: TpmAlgId::Aes,
            key_bits: 128,
            mode: TpmAlgId::Cfb,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, TpmtSymDef::Null)
    }

    pub fn algorithm(&self) -> TpmAlgId {
        match self {
            TpmtSymDef::Null => TpmAlgId::Null,
            TpmtSymDef::Sym { algorithm, .. } => *algorithm,
            TpmtSymDef::Xor { .. } => TpmAlgId::Xor,
        }
    }

    pub fn key_bits(&self) -> u16 {
        match self {
            TpmtSymDef::Sym { key_bits, .. } => *key_bits,
            _ => 0,
        }
    }
}

impl Marshal for TpmtSymDef {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtSymDef::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtSymDef::Sym {
                algorithm,
                key_bits,
                mode,
            } => {
                buf.put_u16(algorithm.to_u16());
                buf.put_u16(*key_bits);
                buf.put_u16(mode.to_u16());
            }
            TpmtSymDef::Xor { hash_alg } => {
                buf.put_u16(TpmAlgId::Xor.to_u16());
                buf.put_u16(hash_alg.to_u16());
                // mode is the nil union arm
            }
        }
    }
}

impl Unmarshal for TpmtSymDef {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let algorithm = get_alg(buf, "TPMT_SYM_DEF")?;
        match algorithm {
            TpmAlgId::Null => Ok(TpmtSymDef::Null),
            TpmAlgId::Aes | TpmAlgId::Sm4 | TpmAlgId::Camellia => {
                let key_bits = buf.get_u16()?;
                let mode = get_alg(buf, "TPMT_SYM_DEF mode")?;
                Ok(TpmtSymDef::Sym {
                    algorithm,
                    key_bits,
                    mode,
                })
            }
            TpmAlgId::Xor => {
                let hash_alg = get_alg(buf, "TPMT_SYM_DEF xor hash")?;
                Ok(TpmtSymDef::Xor { hash_alg })
            }
            other => Err(unknown_alg("TPMT_SYM_DEF", other.to_u16())),
        }
    }
}

/// TPMT_SYM_DEF_OBJECT: the object form excludes the XOR arm; callers
/// validate that at use sites.
pub type TpmtSymDefObject = TpmtSymDef;

/// TPMT_KEYEDHASH_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtKeyedHashScheme {
    Null,
    Hmac { hash_alg: TpmAlgId },
    Xor { hash_alg: TpmAlgId, kdf: TpmAlgId },
}

impl Marshal for TpmtKeyedHashScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtKeyedHashScheme::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtKeyedHashScheme::Hmac { hash_alg } => {
                buf.put_u16(TpmAlgId::Hmac.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtKeyedHashScheme::Xor { hash_alg, kdf } => {
                buf.put_u16(TpmAlgId::Xor.to_u16());
                buf.put_u16(hash_alg.to_u16());
                buf.put_u16(kdf.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtKeyedHashScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf, "TPMT_KEYEDHASH_SCHEME")?;
        match scheme {
            TpmAlgId::Null => Ok(TpmtKeyedHashScheme::Null),
            TpmAlgId::Hmac => Ok(TpmtKeyedHashScheme::Hmac {
                hash_alg: get_alg(buf, "HMAC hash")?,
            }),
            TpmAlgId::Xor => Ok(TpmtKeyedHashScheme::Xor {
                hash_alg: get_alg(buf, "XOR hash")?,
                kdf: get_alg(buf, "XOR kdf")?,
            }),
            other => Err(unknown_alg("TPMT_KEYEDHASH_SCHEME", other.to_u16())),
        }
    }
}

/// TPMT_RSA_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtRsaScheme {
    Null,
    RsaSsa { hash_alg: TpmAlgId },
    RsaPss { hash_alg: TpmAlgId },
    Oaep { hash_alg: TpmAlgId },
    RsaEs,
}

impl Marshal for TpmtRsaScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtRsaScheme::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtRsaScheme::RsaSsa { hash_alg } => {
                buf.put_u16(TpmAlgId::RsaSsa.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtRsaScheme::RsaPss { hash_alg } => {
                buf.put_u16(TpmAlgId::RsaPss.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtRsaScheme::Oaep { hash_alg } => {
                buf.put_u16(TpmAlgId::Oaep.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtRsaScheme::RsaEs => buf.put_u16(TpmAlgId::RsaEs.to_u16()),
        }
    }
}

impl Unmarshal for TpmtRsaScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf, "TPMT_RSA_SCHEME")?;
        Ok(match scheme {
            TpmAlgId::Null => TpmtRsaScheme::Null,
            TpmAlgId::RsaSsa => TpmtRsaScheme::RsaSsa {
                hash_alg: get_alg(buf, "RSASSA hash")?,
            },
            TpmAlgId::RsaPss => TpmtRsaScheme::RsaPss {
                hash_alg: get_alg(buf, "RSAPSS hash")?,
            },
            TpmAlgId::Oaep => TpmtRsaScheme::Oaep {
                hash_alg: get_alg(buf, "OAEP hash")?,
            },
            TpmAlgId::RsaEs => TpmtRsaScheme::RsaEs,
            other => return Err(unknown_alg("TPMT_RSA_SCHEME", other.to_u16())),
        })
    }
}

/// TPMT_ECC_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtEccScheme {
    Null,
    EcDsa { hash_alg: TpmAlgId },
    Ecdh { hash_alg: TpmAlgId },
    EcSchnorr { hash_alg: TpmAlgId },
}

impl Marshal for TpmtEccScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            TpmtEccScheme::Null => buf.put_u16(TpmAlgId::Null.to_u16()),
            TpmtEccScheme::EcDsa { hash_alg } => {
                buf.put_u16(TpmAlgId::EcDsa.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtEccScheme::Ecdh { hash_alg } => {
                buf.put_u16(TpmAlgId::Ecdh.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
            TpmtEccScheme::EcSchnorr { hash_alg } => {
                buf.put_u16(TpmAlgId::EcSchnorr.to_u16());
                buf.put_u16(hash_alg.to_u16());
            }
        }
    }
}

impl Unmarshal for TpmtEccScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf, "TPMT_ECC_SCHEME")?;
        Ok(match scheme {
            TpmAlgId::Null => TpmtEccScheme::Null,
            TpmAlgId::EcDsa => TpmtEccScheme::EcDsa {
                hash_alg: get_alg(buf, "ECDSA hash")?,
            },
            TpmAlgId::Ecdh => TpmtEccScheme::Ecdh {
                hash_alg: get_alg(buf, "ECDH hash")?,
            },
            TpmAlgId::EcSchnorr => TpmtEccScheme::EcSchnorr {
                hash_alg: get_alg(buf, "ECSCHNORR hash")?,
            },
            other => return Err(unknown_alg("TPMT_ECC_SCHEME", other.to_u16())),
        })
    }
}

/// TPMT_KDF_SCHEME
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmtKdfScheme {
    Null,
    Mgf1 { hash_alg: TpmAlgId },
    Kdf1Sp800_56a { hash_alg: TpmAlgId },
    Kdf2 { hash_alg: TpmAlgId },
    Kdf1Sp800_108 { hash_alg: TpmAlgId },
}

impl Marshal for TpmtKdfScheme {
    fn marshal(&self, buf: &mut CommandBuffer) {
        let (selector, hash) = match self {
            TpmtKdfScheme::Null => (TpmAlgId::Null, None),
            TpmtKdfScheme::Mgf1 { hash_alg } => (TpmAlgId::Mgf1, Some(*hash_alg)),
            TpmtKdfScheme::Kdf1Sp800_56a { hash_alg } => (TpmAlgId::Kdf1Sp800_56a, Some(*hash_alg)),
            TpmtKdfScheme::Kdf2 { hash_alg } => (TpmAlgId::Kdf2, Some(*hash_alg)),
            TpmtKdfScheme::Kdf1Sp800_108 { hash_alg } => (TpmAlgId::Kdf1Sp800_108, Some(*hash_alg)),
        };
        buf.put_u16(selector.to_u16());
        if let Some(hash) = hash {
            buf.put_u16(hash.to_u16());
        }
    }
}

impl Unmarshal for TpmtKdfScheme {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let scheme = get_alg(buf, "TPMT_KDF_SCHEME")?;
        Ok(match scheme {
            TpmAlgId::Null => TpmtKdfScheme::Null,
            TpmAlgId::Mgf1 => TpmtKdfScheme::Mgf1 {
                hash_alg: get_alg(buf, "MGF1 hash")?,
            },
            TpmAlgId::Kdf1Sp800_56a => TpmtKdfScheme::Kdf1Sp800_56a {
                hash_alg: get_alg(buf, "KDF1 hash")?,
            },
            TpmAlgId::Kdf2 => TpmtKdfScheme::Kdf2 {
                hash_alg: get_alg(buf, "KDF2 hash")?,
            },
            TpmAlgId::Kdf1Sp800_108 => TpmtKdfScheme::Kdf1Sp800_108 {
                hash_alg: get_alg(buf, "KDF108 hash")?,
            },
            other => return Err(unknown_alg("TPMT_KDF_SCHEME", other.to_u16())),
        })
    }
}

/// TPMS_RSA_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsRsaParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtRsaScheme,
    pub key_bits: u16,
    pub exponent: u32,
}

impl Marshal for TpmsRsaParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.key_bits);
        buf.put_u32(self.exponent);
    }
}

impl Unmarshal for TpmsRsaParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            symmetric: TpmtSymDef::unmarshal(buf)?,
            scheme: TpmtRsaScheme::unmarshal(buf)?,
            key_bits: buf.get_u16()?,
            exponent: buf.get_u32()?,
        })
    }
}

/// TPMS_ECC_PARMS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsEccParms {
    pub symmetric: TpmtSymDefObject,
    pub scheme: TpmtEccScheme,
    pub curve_id: TpmEccCurve,
    pub kdf: TpmtKdfScheme,
}

impl Marshal for TpmsEccParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.symmetric.marshal(buf);
        self.scheme.marshal(buf);
        buf.put_u16(self.curve_id.to_u16());
        self.kdf.marshal(buf);
    }
}

impl Unmarshal for TpmsEccParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let symmetric = TpmtSymDef::unmarshal(buf)?;
        let scheme = TpmtEccScheme::unmarshal(buf)?;
        let curve_raw = buf.get_u16()?;
        let curve_id = TpmEccCurve::from_u16(curve_raw)
            .ok_or_else(|| unknown_alg("TPM_ECC_CURVE", curve_raw))?;
        let kdf = TpmtKdfScheme::unmarshal(buf)?;
        Ok(Self {
            symmetric,
            scheme,
            curve_id,
            kdf,
        })
    }
}

/// TPMS_KEYEDHASH_PARMS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsKeyedHashParms {
    pub scheme: TpmtKeyedHashScheme,
}

impl Marshal for TpmsKeyedHashParms {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.scheme.marshal(buf);
    }
}

impl Unmarshal for TpmsKeyedHashParms {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            scheme: TpmtKeyedHashScheme::unmarshal(buf)?,
        })
    }
}

/// TPMU_PUBLIC_PARMS, selected by the public area's object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicParams {
    Rsa(TpmsRsaParms),
    Ecc(TpmsEccParms),
    KeyedHash(TpmsKeyedHashParms),
    SymCipher(TpmtSymDefObject),
}

impl PublicParams {
    /// The symmetric definition of an asymmetric storage parent.
    pub fn symmetric(&self) -> Option<&TpmtSymDefObject> {
        match self {
            PublicParams::Rsa(p) => Some(&p.symmetric),
            PublicParams::Ecc(p) => Some(&p.symmetric),
            PublicParams::SymCipher(s) => Some(s),
            PublicParams::KeyedHash(_) => None,
        }
    }
}

/// TPMU_PUBLIC_ID, selected by the public area's object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicId {
    /// TPM2B_PUBLIC_KEY_RSA (the modulus)
    Rsa(Vec<u8>),
    /// TPMS_ECC_POINT
    Ecc { x: Vec<u8>, y: Vec<u8> },
    /// TPM2B_DIGEST
    KeyedHash(Vec<u8>),
    /// TPM2B_DIGEST
    Sym(Vec<u8>),
}

/// TPMT_PUBLIC: the public area of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtPublic {
    pub object_type: TpmAlgId,
    pub name_alg: TpmAlgId,
    pub object_attributes: TpmaObject,
    pub auth_policy: Tpm2bDigest,
    pub parameters: PublicParams,
    pub unique: PublicId,
}

impl TpmtPublic {
    /// Compute this object's name: `nameAlg || H_nameAlg(marshal(self))`.
    pub fn name(&self) -> Result<Name> {
        if !self.name_alg.is_hash() {
            return Err(Error::invalid_param("public", "invalid name algorithm"));
        }
        let digest = crypto::digest(self.name_alg, &[&self.to_bytes()]);
        Ok(Name::from_digest(self.name_alg, &digest))
    }
}

impl Marshal for TpmtPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.object_type.to_u16());
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.object_attributes.0);
        self.auth_policy.marshal(buf);
        match (&self.parameters, &self.unique) {
            (PublicParams::Rsa(p), PublicId::Rsa(n)) => {
                p.marshal(buf);
                buf.put_tpm2b(n);
            }
            (PublicParams::Ecc(p), PublicId::Ecc { x, y }) => {
                p.marshal(buf);
                buf.put_tpm2b(x);
                buf.put_tpm2b(y);
            }
            (PublicParams::KeyedHash(p), PublicId::KeyedHash(d)) => {
                p.marshal(buf);
                buf.put_tpm2b(d);
            }
            (PublicParams::SymCipher(s), PublicId::Sym(d)) => {
                s.marshal(buf);
                buf.put_tpm2b(d);
            }
            _ => panic!("public area parameters do not match its type"),
        }
    }
}

impl Unmarshal for TpmtPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let object_type = get_alg(buf, "TPMT_PUBLIC type")?;
        let name_alg = get_alg(buf, "TPMT_PUBLIC nameAlg")?;
        let object_attributes = TpmaObject(buf.get_u32()?);
        let auth_policy = Tpm2bDigest::unmarshal(buf)?;
        let (parameters, unique) = match object_type {
            TpmAlgId::Rsa => {
                let p = TpmsRsaParms::unmarshal(buf)?;
                let n = buf.get_tpm2b()?;
                (PublicParams::Rsa(p), PublicId::Rsa(n))
            }
            TpmAlgId::Ecc => {
                let p = TpmsEccParms::unmarshal(buf)?;
                let x = buf.get_tpm2b()?;
                let y = buf.get_tpm2b()?;
                (PublicParams::Ecc(p), PublicId::Ecc { x, y })
            }
            TpmAlgId::KeyedHash => {
                let p = TpmsKeyedHashParms::unmarshal(buf)?;
                let d = buf.get_tpm2b()?;
                (PublicParams::KeyedHash(p), PublicId::KeyedHash(d))
            }
            TpmAlgId::SymCipher => {
                let s = TpmtSymDef::unmarshal(buf)?;
                let d = buf.get_tpm2b()?;
                (PublicParams::SymCipher(s), PublicId::Sym(d))
            }
            other => return Err(unknown_alg("TPMT_PUBLIC", other.to_u16())),
        };
        Ok(Self {
            object_type,
            name_alg,
            object_attributes,
            auth_policy,
            parameters,
            unique,
        })
    }
}

/// TPM2B_PUBLIC: a sized public area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bPublic {
    pub public: TpmtPublic,
}

impl Marshal for Tpm2bPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(Some(&self.public));
    }

    fn is_sized_buffer(&self) -> bool {
        true
    }
}

impl Unmarshal for Tpm2bPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let public = buf
            .get_sized::<TpmtPublic>()?
            .ok_or_else(|| Error::unmarshal("empty TPM2B_PUBLIC"))?;
        Ok(Self { public })
    }
}

/// TPMU_SENSITIVE_COMPOSITE, selected by the sensitive type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SensitiveComposite {
    /// TPM2B_PRIVATE_KEY_RSA (one prime)
    Rsa(Vec<u8>),
    /// TPM2B_ECC_PARAMETER (the private scalar)
    Ecc(Vec<u8>),
    /// TPM2B_SENSITIVE_DATA
    Bits(Vec<u8>),
    /// TPM2B_SYM_KEY
    Sym(Vec<u8>),
}

/// TPMT_SENSITIVE: the sensitive area of an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtSensitive {
    pub sensitive_type: TpmAlgId,
    pub auth_value: Tpm2bAuth,
    pub seed_value: Tpm2bDigest,
    pub sensitive: SensitiveComposite,
}

impl Marshal for TpmtSensitive {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sensitive_type.to_u16());
        self.auth_value.marshal(buf);
        self.seed_value.marshal(buf);
        match &self.sensitive {
            SensitiveComposite::Rsa(v)
            | SensitiveComposite::Ecc(v)
            | SensitiveComposite::Bits(v)
            | SensitiveComposite::Sym(v) => buf.put_tpm2b(v),
        }
    }
}

impl Unmarshal for TpmtSensitive {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sensitive_type = get_alg(buf, "TPMT_SENSITIVE type")?;
        let auth_value = Tpm2bAuth::unmarshal(buf)?;
        let seed_value = Tpm2bDigest::unmarshal(buf)?;
        let payload = buf.get_tpm2b()?;
        let sensitive = match sensitive_type {
            TpmAlgId::Rsa => SensitiveComposite::Rsa(payload),
            TpmAlgId::Ecc => SensitiveComposite::Ecc(payload),
            TpmAlgId::KeyedHash => SensitiveComposite::Bits(payload),
            TpmAlgId::SymCipher => SensitiveComposite::Sym(payload),
            other => return Err(unknown_alg("TPMT_SENSITIVE", other.to_u16())),
        };
        Ok(Self {
            sensitive_type,
            auth_value,
            seed_value,
            sensitive,
        })
    }
}

/// TPMS_NV_PUBLIC: the public area of an NV index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsNvPublic {
    pub nv_index: Handle,
    pub name_alg: TpmAlgId,
    pub attrs: TpmaNv,
    pub auth_policy: Tpm2bDigest,
    pub size: u16,
}

impl TpmsNvPublic {
    pub fn name(&self) -> Result<Name> {
        if !self.name_alg.is_hash() {
            return Err(Error::invalid_param("nv_public", "invalid name algorithm"));
        }
        let digest = crypto::digest(self.name_alg, &[&self.to_bytes()]);
        Ok(Name::from_digest(self.name_alg, &digest))
    }
}

impl Marshal for TpmsNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.nv_index);
        buf.put_u16(self.name_alg.to_u16());
        buf.put_u32(self.attrs.0);
        self.auth_policy.marshal(buf);
        buf.put_u16(self.size);
    }
}

impl Unmarshal for TpmsNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nv_index: buf.get_u32()?,
            name_alg: get_alg(buf, "TPMS_NV_PUBLIC nameAlg")?,
            attrs: TpmaNv(buf.get_u32()?),
            auth_policy: Tpm2bDigest::unmarshal(buf)?,
            size: buf.get_u16()?,
        })
    }
}

/// TPM2B_NV_PUBLIC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2bNvPublic {
    pub nv_public: TpmsNvPublic,
}

impl Marshal for Tpm2bNvPublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_sized(Some(&self.nv_public));
    }

    fn is_sized_buffer(&self) -> bool {
        true
    }
}

impl Unmarshal for Tpm2bNvPublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let nv_public = buf
            .get_sized::<TpmsNvPublic>()?
            .ok_or_else(|| Error::unmarshal("empty TPM2B_NV_PUBLIC"))?;
        Ok(Self { nv_public })
    }
}

/// TPMS_PCR_SELECTION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsPcrSelection {
    pub hash: TpmAlgId,
    pub pcr_select: Vec<u8>,
}

impl TpmsPcrSelection {
    pub fn new(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        let max_pcr = pcrs.iter().max().copied().unwrap_or(0);
        let size = ((max_pcr / 8) + 1).max(3) as usize;
        let mut pcr_select = vec![0u8; size];
        for &pcr in pcrs {
            pcr_select[(pcr / 8) as usize] |= 1 << (pcr % 8);
        }
        Self { hash, pcr_select }
    }
}

impl Marshal for TpmsPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash.to_u16());
        buf.put_u8(self.pcr_select.len() as u8);
        buf.put_bytes(&self.pcr_select);
    }
}

impl Unmarshal for TpmsPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash = get_alg(buf, "TPMS_PCR_SELECTION")?;
        let size = buf.get_u8()? as usize;
        let pcr_select = buf.get_bytes(size)?;
        Ok(Self { hash, pcr_select })
    }
}

/// TPML_PCR_SELECTION
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlPcrSelection {
    pub selections: Vec<TpmsPcrSelection>,
}

impl TpmlPcrSelection {
    pub fn single(hash: TpmAlgId, pcrs: &[u32]) -> Self {
        Self {
            selections: vec![TpmsPcrSelection::new(hash, pcrs)],
        }
    }
}

impl Marshal for TpmlPcrSelection {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_list(&self.selections);
    }
}

impl Unmarshal for TpmlPcrSelection {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            selections: buf.get_list()?,
        })
    }
}

/// TPML_DIGEST
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmlDigest {
    pub digests: Vec<Tpm2bDigest>,
}

impl Marshal for TpmlDigest {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_list(&self.digests);
    }
}

impl Unmarshal for TpmlDigest {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            digests: buf.get_list()?,
        })
    }
}

/// TPMT_SIGNATURE, selected by the signature algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TpmtSignature {
    Null,
    RsaSsa {
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    RsaPss {
        hash_alg: TpmAlgId,
        sig: Vec<u8>,
    },
    EcDsa {
        hash_alg: TpmAlgId,
        signature_r: Vec<u8>,
        signature_s: Vec<u8>,
    },
    Hmac(TpmtHa),
}

impl TpmtSignature {
    pub fn sig_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::Null => TpmAlgId::Null,
            TpmtSignature::RsaSsa { .. } => TpmAlgId::RsaSsa,
            TpmtSignature::RsaPss { .. } => TpmAlgId::RsaPss,
            TpmtSignature::EcDsa { .. } => TpmAlgId::EcDsa,
            TpmtSignature::Hmac(_) => TpmAlgId::Hmac,
        }
    }

    pub fn hash_alg(&self) -> TpmAlgId {
        match self {
            TpmtSignature::Null => TpmAlgId::Null,
            TpmtSignature::RsaSsa { hash_alg, .. }
            | TpmtSignature::RsaPss { hash_alg, .. }
            | TpmtSignature::EcDsa { hash_alg, .. } => *hash_alg,
            TpmtSignature::Hmac(h) => h.hash_alg,
        }
    }
}

impl Marshal for TpmtSignature {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.sig_alg().to_u16());
        match self {
            TpmtSignature::Null => {}
            TpmtSignature::RsaSsa { hash_alg, sig } | TpmtSignature::RsaPss { hash_alg, sig } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(sig);
            }
            TpmtSignature::EcDsa {
                hash_alg,
                signature_r,
                signature_s,
            } => {
                buf.put_u16(hash_alg.to_u16());
                buf.put_tpm2b(signature_r);
                buf.put_tpm2b(signature_s);
            }
            TpmtSignature::Hmac(h) => h.marshal(buf),
        }
    }
}

impl Unmarshal for TpmtSignature {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let sig_alg = get_alg(buf, "TPMT_SIGNATURE")?;
        Ok(match sig_alg {
            TpmAlgId::Null => TpmtSignature::Null,
            TpmAlgId::RsaSsa => TpmtSignature::RsaSsa {
                hash_alg: get_alg(buf, "RSASSA hash")?,
                sig: buf.get_tpm2b()?,
            },
            TpmAlgId::RsaPss => TpmtSignature::RsaPss {
                hash_alg: get_alg(buf, "RSAPSS hash")?,
                sig: buf.get_tpm2b()?,
            },
            TpmAlgId::EcDsa => TpmtSignature::EcDsa {
                hash_alg: get_alg(buf, "ECDSA hash")?,
                signature_r: buf.get_tpm2b()?,
                signature_s: buf.get_tpm2b()?,
            },
            TpmAlgId::Hmac => TpmtSignature::Hmac(TpmtHa::unmarshal(buf)?),
            other => return Err(unknown_alg("TPMT_SIGNATURE", other.to_u16())),
        })
    }
}

/// TPMT_TK_AUTH: ticket produced by TPM2_PolicySigned and
/// TPM2_PolicySecret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkAuth {
    pub tag: TpmSt,
    pub hierarchy: Handle,
    pub digest: Tpm2bDigest,
}

impl TpmtTkAuth {
    /// The null ticket returned when no ticket was requested.
    pub fn is_null(&self) -> bool {
        self.digest.is_empty()
    }
}

impl Marshal for TpmtTkAuth {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.tag.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkAuth {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u16()?;
        let tag = TpmSt::from_u16(raw)
            .filter(|t| matches!(t, TpmSt::AuthSecret | TpmSt::AuthSigned))
            .ok_or_else(|| Error::unmarshal(format!("invalid auth ticket tag 0x{:04x}", raw)))?;
        Ok(Self {
            tag,
            hierarchy: buf.get_u32()?,
            digest: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

/// TPMT_TK_VERIFIED: ticket produced by TPM2_VerifySignature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmtTkVerified {
    pub hierarchy: Handle,
    pub digest: Tpm2bDigest,
}

impl Marshal for TpmtTkVerified {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(TpmSt::Verified.to_u16());
        buf.put_u32(self.hierarchy);
        self.digest.marshal(buf);
    }
}

impl Unmarshal for TpmtTkVerified {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u16()?;
        if TpmSt::from_u16(raw) != Some(TpmSt::Verified) {
            return Err(Error::unmarshal(format!(
                "invalid verified ticket tag 0x{:04x}",
                raw
            )));
        }
        Ok(Self {
            hierarchy: buf.get_u32()?,
            digest: Tpm2bDigest::unmarshal(buf)?,
        })
    }
}

/// TPMS_CONTEXT: a saved object or session context blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TpmsContext {
    pub sequence: u64,
    pub saved_handle: Handle,
    pub hierarchy: Handle,
    pub context_blob: Tpm2bContextData,
}

impl Marshal for TpmsContext {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u64(self.sequence);
        buf.put_u32(self.saved_handle);
        buf.put_u32(self.hierarchy);
        self.context_blob.marshal(buf);
    }
}

impl Unmarshal for TpmsContext {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            sequence: buf.get_u64()?,
            saved_handle: buf.get_u32()?,
            hierarchy: buf.get_u32()?,
            context_blob: Tpm2bContextData::unmarshal(buf)?,
        })
    }
}

/// TPMS_TAGGED_PROPERTY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpmsTaggedProperty {
    pub property: u32,
    pub value: u32,
}

impl Marshal for TpmsTaggedProperty {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.property);
        buf.put_u32(self.value);
    }
}

impl Unmarshal for TpmsTaggedProperty {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            property: buf.get_u32()?,
            value: buf.get_u32()?,
        })
    }
}

/// TPMS_CAPABILITY_DATA (the arms the dispatcher consumes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapabilityData {
    Handles(Vec<Handle>),
    TpmProperties(Vec<TpmsTaggedProperty>),
}

impl Unmarshal for CapabilityData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let raw = buf.get_u32()?;
        let cap = TpmCap::from_u32(raw)
            .ok_or_else(|| Error::unmarshal(format!("unsupported capability 0x{:08x}", raw)))?;
        match cap {
            TpmCap::Handles => Ok(CapabilityData::Handles(buf.get_list()?)),
            TpmCap::TpmProperties => Ok(CapabilityData::TpmProperties(buf.get_list()?)),
            other => Err(Error::unmarshal(format!(
                "unsupported capability {:?}",
                other
            ))),
        }
    }
}
