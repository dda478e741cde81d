// SPDX-License-Identifier: Apache-2.0

//! Cryptographic primitives consumed by the protocol core: digests and
//! HMAC over the TPM hash algorithms, the SP800-108 counter-mode KDF
//! (KDFa) and SP800-56A concatenation KDF (KDFe), XOR obfuscation,
//! AES-CFB parameter encryption, and the asymmetric operations needed for
//! salted sessions and signature checks.

use aes::{Aes128, Aes192, Aes256};
use cipher::{AsyncStreamCipher, KeyIvInit};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use rsa::{BigUint, Oaep, Pkcs1v15Sign, Pss, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;

use crate::constants::{tpm_rh, TpmAlgId};
use crate::error::{Error, Result};
use crate::types::{PublicId, PublicParams, TpmtPublic, TpmtRsaScheme, TpmtSignature};

/// Label used when sharing a secret with a TPM key (StartAuthSession salt,
/// import seeds). The terminating NUL is part of the label.
pub const SECRET_LABEL: &[u8] = b"SECRET";
/// KDFa label for session key derivation.
pub const SESSION_KEY_LABEL: &[u8] = b"ATH";
/// KDFa label for outer-wrap confidentiality keys.
pub const STORAGE_LABEL: &[u8] = b"STORAGE";
/// KDFa label for outer-wrap integrity keys.
pub const INTEGRITY_LABEL: &[u8] = b"INTEGRITY";
/// KDFa label for CFB parameter encryption keys.
pub const CFB_LABEL: &[u8] = b"CFB";
/// KDFa label for XOR parameter obfuscation.
pub const XOR_LABEL: &[u8] = b"XOR";

/// Digest the concatenation of `chunks` with the given algorithm.
///
/// Panics if `alg` is not a hash algorithm; callers validate algorithms at
/// the API boundary.
pub fn digest(alg: TpmAlgId, chunks: &[&[u8]]) -> Vec<u8> {
    fn go<D: Digest>(chunks: &[&[u8]]) -> Vec<u8> {
        let mut h = D::new();
        for c in chunks {
            h.update(c);
        }
        h.finalize().to_vec()
    }

    match alg {
        TpmAlgId::Sha1 => go::<Sha1>(chunks),
        TpmAlgId::Sha256 => go::<Sha256>(chunks),
        TpmAlgId::Sha384 => go::<Sha384>(chunks),
        TpmAlgId::Sha512 => go::<Sha512>(chunks),
        other => panic!("not a digest algorithm: {other:?}"),
    }
}

/// HMAC the concatenation of `chunks` under `key`.
pub fn hmac(alg: TpmAlgId, key: &[u8], chunks: &[&[u8]]) -> Vec<u8> {
    macro_rules! mac_with {
        ($hash:ty) => {{
            let mut mac =
                Hmac::<$hash>::new_from_slice(key).expect("HMAC accepts any key length");
            for c in chunks {
                mac.update(c);
            }
            mac.finalize().into_bytes().to_vec()
        }};
    }

    match alg {
        TpmAlgId::Sha1 => mac_with!(Sha1),
        TpmAlgId::Sha256 => mac_with!(Sha256),
        TpmAlgId::Sha384 => mac_with!(Sha384),
        TpmAlgId::Sha512 => mac_with!(Sha512),
        other => panic!("not a digest algorithm: {other:?}"),
    }
}

/// Constant-time comparison of a computed MAC or digest against a received
/// one.
pub fn verify_mac(expected: &[u8], received: &[u8]) -> bool {
    expected.ct_eq(received).into()
}

/// SP800-108 counter-mode KDF as specialized by the TPM spec (KDFa).
///
/// Each iteration HMACs `counter || label || 00 || contextU || contextV ||
/// sizeInBits`; the output is truncated to `size_in_bits`, masking excess
/// leading bits when the request is not byte-aligned.
pub fn kdf_a(
    alg: TpmAlgId,
    key: &[u8],
    label: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    size_in_bits: usize,
) -> Vec<u8> {
    let bytes_needed = (size_in_bits + 7) / 8;
    let mut out = Vec::with_capacity(bytes_needed);
    let bits = (size_in_bits as u32).to_be_bytes();

    let mut counter = 0u32;
    while out.len() < bytes_needed {
        counter += 1;
        let block = hmac(
            alg,
            key,
            &[
                &counter.to_be_bytes(),
                label,
                &[0u8],
                context_u,
                context_v,
                &bits,
            ],
        );
        out.extend_from_slice(&block);
    }
    out.truncate(bytes_needed);

    if size_in_bits % 8 != 0 {
        out[0] &= (1 << (size_in_bits % 8)) - 1;
    }
    out
}

/// SP800-56A concatenation KDF as specialized by the TPM spec (KDFe), used
/// to derive salts from ECDH shared secrets.
pub fn kdf_e(
    alg: TpmAlgId,
    z: &[u8],
    label: &[u8],
    party_u: &[u8],
    party_v: &[u8],
    size_in_bits: usize,
) -> Vec<u8> {
    let bytes_needed = (size_in_bits + 7) / 8;
    let mut out = Vec::with_capacity(bytes_needed);

    let mut counter = 0u32;
    while out.len() < bytes_needed {
        counter += 1;
        let block = digest(
            alg,
            &[&counter.to_be_bytes(), z, label, &[0u8], party_u, party_v],
        );
        out.extend_from_slice(&block);
    }
    out.truncate(bytes_needed);

    if size_in_bits % 8 != 0 {
        out[0] &= (1 << (size_in_bits % 8)) - 1;
    }
    out
}

/// PKCS#1 MGF1 mask generation: counter-mode digest expansion of a seed.
pub fn mgf1(alg: TpmAlgId, seed: &[u8], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut counter = 0u32;
    while out.len() < len {
        out.extend_from_slice(&digest(alg, &[seed, &counter.to_be_bytes()]));
        counter += 1;
    }
    out.truncate(len);
    out
}

/// XOR obfuscation: XOR `data` with a KDFa-derived mask. Self-inverse.
pub fn xor_obfuscate(
    alg: TpmAlgId,
    key: &[u8],
    context_u: &[u8],
    context_v: &[u8],
    data: &mut [u8],
) {
    let mask = kdf_a(alg, key, XOR_LABEL, context_u, context_v, data.len() * 8);
    for (b, m) in data.iter_mut().zip(mask.iter()) {
        *b ^= m;
    }
}

/// Encrypt `data` in place with AES-CFB under the given key and IV.
pub fn sym_encrypt(alg: TpmAlgId, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    if alg != TpmAlgId::Aes {
        return Err(Error::invalid_param(
            "symmetric_alg",
            format!("unsupported symmetric algorithm {alg:?}"),
        ));
    }
    match key.len() {
        16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .encrypt(data),
        24 => cfb_mode::Encryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .encrypt(data),
        32 => cfb_mode::Encryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .encrypt(data),
        n => {
            return Err(Error::invalid_param(
                "key",
                format!("unsupported AES key length {n}"),
            ))
        }
    }
    Ok(())
}

/// Decrypt `data` in place with AES-CFB under the given key and IV.
pub fn sym_decrypt(alg: TpmAlgId, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    if alg != TpmAlgId::Aes {
        return Err(Error::invalid_param(
            "symmetric_alg",
            format!("unsupported symmetric algorithm {alg:?}"),
        ));
    }
    match key.len() {
        16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .decrypt(data),
        24 => cfb_mode::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .decrypt(data),
        32 => cfb_mode::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(|_| Error::invalid_param("iv", "wrong IV length"))?
            .decrypt(data),
        n => {
            return Err(Error::invalid_param(
                "key",
                format!("unsupported AES key length {n}"),
            ))
        }
    }
    Ok(())
}

fn rsa_public_key(public: &TpmtPublic) -> Result<RsaPublicKey> {
    let (parms, modulus) = match (&public.parameters, &public.unique) {
        (PublicParams::Rsa(p), PublicId::Rsa(n)) => (p, n),
        _ => return Err(Error::invalid_param("public", "not an RSA key")),
    };
    let exponent = if parms.exponent == 0 {
        65537u32
    } else {
        parms.exponent
    };
    RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from(exponent as u64),
    )
    .map_err(|e| Error::invalid_param("public", format!("invalid RSA public key: {e}")))
}

fn oaep_padding(alg: TpmAlgId, label: &[u8]) -> Result<Oaep> {
    // the label's terminating NUL is part of the OAEP label
    let mut label = label.to_vec();
    label.push(0);
    let label = String::from_utf8(label)
        .map_err(|_| Error::invalid_param("label", "label is not ASCII"))?;
    Ok(match alg {
        TpmAlgId::Sha1 => Oaep::new_with_label::<Sha1, _>(label),
        TpmAlgId::Sha256 => Oaep::new_with_label::<Sha256, _>(label),
        TpmAlgId::Sha384 => Oaep::new_with_label::<Sha384, _>(label),
        TpmAlgId::Sha512 => Oaep::new_with_label::<Sha512, _>(label),
        other => {
            return Err(Error::invalid_param(
                "name_alg",
                format!("unsupported OAEP hash {other:?}"),
            ))
        }
    })
}

/// Generate a secret and share it with an RSA key: the plaintext is a
/// random value of the key's name-algorithm digest size, the blob is its
/// OAEP encryption under the label.
pub fn secret_share_rsa(public: &TpmtPublic, label: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let key = rsa_public_key(public)?;
    let mut salt = vec![0u8; public.name_alg.digest_size()];
    OsRng.fill_bytes(&mut salt);
    let encrypted = key
        .encrypt(&mut OsRng, oaep_padding(public.name_alg, label)?, &salt)
        .map_err(|e| Error::invalid_param("public", format!("OAEP encryption failed: {e}")))?;
    Ok((salt, encrypted))
}

fn pad_32(v: &[u8]) -> Result<[u8; 32]> {
    if v.len() > 32 {
        return Err(Error::invalid_param("point", "coordinate too large"));
    }
    let mut out = [0u8; 32];
    out[32 - v.len()..].copy_from_slice(v);
    Ok(out)
}

fn p256_point(x: &[u8], y: &[u8]) -> Result<p256::PublicKey> {
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(&pad_32(x)?);
    sec1.extend_from_slice(&pad_32(y)?);
    p256::PublicKey::from_sec1_bytes(&sec1)
        .map_err(|_| Error::invalid_param("public", "invalid ECC point"))
}

/// Generate a secret and share it with a P-256 key: performs an ephemeral
/// ECDH exchange and derives the secret with KDFe. The blob is the
/// marshalled ephemeral public point.
pub fn secret_share_ecc(public: &TpmtPublic, label: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    let (parms, x, y) = match (&public.parameters, &public.unique) {
        (PublicParams::Ecc(p), PublicId::Ecc { x, y }) => (p, x, y),
        _ => return Err(Error::invalid_param("public", "not an ECC key")),
    };
    if parms.curve_id != crate::constants::TpmEccCurve::NistP256 {
        return Err(Error::invalid_param(
            "public",
            format!("unsupported curve {:?}", parms.curve_id),
        ));
    }

    let their_key = p256_point(x, y)?;
    let ephemeral = p256::ecdh::EphemeralSecret::random(&mut OsRng);
    let shared = ephemeral.diffie_hellman(&their_key);

    use p256::elliptic_curve::sec1::ToEncodedPoint;
    let eph_point = ephemeral.public_key().to_encoded_point(false);
    let eph_x: &[u8] = eph_point.x().expect("uncompressed point has coordinates");
    let eph_y: &[u8] = eph_point.y().expect("uncompressed point has coordinates");

    let salt = kdf_e(
        public.name_alg,
        shared.raw_secret_bytes().as_slice(),
        label,
        eph_x,
        &pad_32(x)?,
        public.name_alg.digest_size() * 8,
    );

    let mut buf = crate::marshal::CommandBuffer::new();
    buf.put_tpm2b(eph_x);
    buf.put_tpm2b(eph_y);
    Ok((salt, buf.into_vec()))
}

/// Verify a TPM signature against a precomputed digest using the public
/// key from `public`. Returns false for a well-formed but invalid
/// signature; errors indicate malformed inputs.
pub fn verify_signature(public: &TpmtPublic, digest: &[u8], sig: &TpmtSignature) -> Result<bool> {
    match sig {
        TpmtSignature::RsaSsa { hash_alg, sig } => {
            let key = rsa_public_key(public)?;
            let padding = match hash_alg {
                TpmAlgId::Sha1 => Pkcs1v15Sign::new::<Sha1>(),
                TpmAlgId::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
                TpmAlgId::Sha384 => Pkcs1v15Sign::new::<Sha384>(),
                TpmAlgId::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
                other => {
                    return Err(Error::invalid_param(
                        "signature",
                        format!("unsupported hash {other:?}"),
                    ))
                }
            };
            Ok(key.verify(padding, digest, sig).is_ok())
        }
        TpmtSignature::RsaPss { hash_alg, sig } => {
            let key = rsa_public_key(public)?;
            let padding = match hash_alg {
                TpmAlgId::Sha1 => Pss::new::<Sha1>(),
                TpmAlgId::Sha256 => Pss::new::<Sha256>(),
                TpmAlgId::Sha384 => Pss::new::<Sha384>(),
                TpmAlgId::Sha512 => Pss::new::<Sha512>(),
                other => {
                    return Err(Error::invalid_param(
                        "signature",
                        format!("unsupported hash {other:?}"),
                    ))
                }
            };
            Ok(key.verify(padding, digest, sig).is_ok())
        }
        TpmtSignature::EcDsa {
            signature_r,
            signature_s,
            ..
        } => {
            use p256::ecdsa::signature::hazmat::PrehashVerifier;

            let (x, y) = match &public.unique {
                PublicId::Ecc { x, y } => (x, y),
                _ => return Err(Error::invalid_param("public", "not an ECC key")),
            };
            let mut sec1 = Vec::with_capacity(65);
            sec1.push(0x04);
            sec1.extend_from_slice(&pad_32(x)?);
            sec1.extend_from_slice(&pad_32(y)?);
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1)
                .map_err(|_| Error::invalid_param("public", "invalid ECC point"))?;
            let signature =
                p256::ecdsa::Signature::from_scalars(pad_32(signature_r)?, pad_32(signature_s)?)
                    .map_err(|_| Error::invalid_param("signature", "invalid ECDSA scalars"))?;
            Ok(key.verify_prehash(digest, &signature).is_ok())
        }
        TpmtSignature::Hmac(_) | TpmtSignature::Null => Err(Error::invalid_param(
            "signature",
            "cannot verify this signature type",
        )),
    }
}

/// The scheme hash a key would use to sign, falling back to the name
/// algorithm.
pub fn signing_hash_alg(public: &TpmtPublic) -> TpmAlgId {
    match &public.parameters {
        PublicParams::Rsa(p) => match p.scheme {
            TpmtRsaScheme::RsaSsa { hash_alg } | TpmtRsaScheme::RsaPss { hash_alg } => hash_alg,
            _ => public.name_alg,
        },
        PublicParams::Ecc(p) => match p.scheme {
            crate::types::TpmtEccScheme::EcDsa { hash_alg } => hash_alg,
            _ => public.name_alg,
        },
        _ => public.name_alg,
    }
}

/// Generate a secret and share it with the given storage key. Dispatches
/// on the key type. Used for salted sessions and import seeds.
pub fn secret_share(public: &TpmtPublic, label: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
    match public.object_type {
        TpmAlgId::Rsa => secret_share_rsa(public, label),
        TpmAlgId::Ecc => secret_share_ecc(public, label),
        other => Err(Error::invalid_param(
            "public",
            format!("cannot share a secret with a {other:?} key"),
        )),
    }
}

/// Random bytes helper for nonces, IVs and generated keys.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut out = vec![0u8; len];
    OsRng.fill_bytes(&mut out);
    out
}

/// The seed of the qualified-name chain for a hierarchy.
pub fn hierarchy_seed(hierarchy: crate::constants::Handle) -> Option<Vec<u8>> {
    match hierarchy {
        tpm_rh::OWNER | tpm_rh::NULL | tpm_rh::ENDORSEMENT | tpm_rh::PLATFORM => {
            Some(hierarchy.to_be_bytes().to_vec())
        }
        _ => None,
    }
}
