// SPDX-License-Identifier: Apache-2.0

//! Integrity and confidentiality envelopes for object duplication and
//! import, and qualified-name computation.

use crate::constants::{Handle, TpmAlgId};
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, ResponseBuffer};
use crate::types::{Name, Tpm2bPrivate, TpmtPublic, TpmtSensitive, TpmtSymDefObject};

fn sym_parameters(symmetric: &TpmtSymDefObject) -> Result<(TpmAlgId, u16)> {
    match symmetric {
        TpmtSymDefObject::Sym {
            algorithm,
            key_bits,
            ..
        } => Ok((*algorithm, *key_bits)),
        _ => Err(Error::invalid_param(
            "symmetric",
            "outer wrapping requires a symmetric cipher",
        )),
    }
}

/// Apply an outer wrapper to `data` associated with `name`: encrypt with
/// a key derived from `seed` and `name`, then prepend an integrity HMAC
/// over the ciphertext and the name. `use_iv` selects a random IV
/// (protected storage) over the all-zero IV used for duplication blobs.
pub fn produce_outer_wrap(
    hash_alg: TpmAlgId,
    symmetric: &TpmtSymDefObject,
    name: &Name,
    seed: &[u8],
    use_iv: bool,
    data: &[u8],
) -> Result<Vec<u8>> {
    let (sym_alg, key_bits) = sym_parameters(symmetric)?;
    let block = sym_alg.block_size();

    let iv = if use_iv {
        crypto::random_bytes(block)
    } else {
        vec![0u8; block]
    };

    let sym_key = crypto::kdf_a(
        hash_alg,
        seed,
        crypto::STORAGE_LABEL,
        name.as_bytes(),
        &[],
        usize::from(key_bits),
    );
    let mut encrypted = data.to_vec();
    crypto::sym_encrypt(sym_alg, &sym_key, &iv, &mut encrypted)?;

    let mut body = CommandBuffer::new();
    if use_iv {
        body.put_tpm2b(&iv);
    }
    body.put_bytes(&encrypted);
    let body = body.into_vec();

    let hmac_key = crypto::kdf_a(
        hash_alg,
        seed,
        crypto::INTEGRITY_LABEL,
        &[],
        &[],
        hash_alg.digest_size() * 8,
    );
    let integrity = crypto::hmac(hash_alg, &hmac_key, &[&body, name.as_bytes()]);

    let mut out = CommandBuffer::new();
    out.put_tpm2b(&integrity);
    out.put_bytes(&body);
    Ok(out.into_vec())
}

/// Remove an outer wrapper, validating the integrity HMAC in constant
/// time before decrypting.
pub fn unwrap_outer(
    hash_alg: TpmAlgId,
    symmetric: &TpmtSymDefObject,
    name: &Name,
    seed: &[u8],
    use_iv: bool,
    data: &[u8],
) -> Result<Vec<u8>> {
    let (sym_alg, key_bits) = sym_parameters(symmetric)?;
    let block = sym_alg.block_size();

    let mut buf = ResponseBuffer::new(data);
    let integrity = buf.get_tpm2b()?;
    let body = buf.get_remaining();

    let hmac_key = crypto::kdf_a(
        hash_alg,
        seed,
        crypto::INTEGRITY_LABEL,
        &[],
        &[],
        hash_alg.digest_size() * 8,
    );
    let expected = crypto::hmac(hash_alg, &hmac_key, &[&body, name.as_bytes()]);
    if !crypto::verify_mac(&expected, &integrity) {
        return Err(Error::invalid_param("data", "integrity digest is invalid"));
    }

    let mut buf = ResponseBuffer::new(&body);
    let iv = if use_iv {
        let iv = buf.get_tpm2b()?;
        if iv.len() != block {
            return Err(Error::invalid_param("data", "IV has the wrong size"));
        }
        iv
    } else {
        vec![0u8; block]
    };
    let mut payload = buf.get_remaining();

    let sym_key = crypto::kdf_a(
        hash_alg,
        seed,
        crypto::STORAGE_LABEL,
        name.as_bytes(),
        &[],
        usize::from(key_bits),
    );
    crypto::sym_decrypt(sym_alg, &sym_key, &iv, &mut payload)?;
    Ok(payload)
}

fn marshal_sized_sensitive(sensitive: &TpmtSensitive) -> Vec<u8> {
    let mut buf = CommandBuffer::new();
    buf.put_sized(Some(sensitive));
    buf.into_vec()
}

fn unmarshal_sized_sensitive(data: &[u8]) -> Result<TpmtSensitive> {
    let mut buf = ResponseBuffer::new(data);
    let sensitive = buf
        .get_sized::<TpmtSensitive>()?
        .ok_or_else(|| Error::unmarshal("empty sensitive area"))?;
    if buf.remaining() != 0 {
        return Err(Error::unmarshal(format!(
            "{} trailing byte(s) after sensitive area",
            buf.remaining()
        )));
    }
    Ok(sensitive)
}

/// Build a duplication blob from a sensitive area.
///
/// With `inner_symmetric` set, an inner wrapper is applied first: an
/// integrity digest computed with the object's name algorithm is
/// prepended and the result encrypted under `inner_sym_key` (generated
/// and returned when not supplied). With `seed` non-empty, an outer
/// wrapper is applied using the new parent's name algorithm and
/// symmetric algorithm.
pub fn sensitive_to_duplicate(
    sensitive: &TpmtSensitive,
    name: &Name,
    parent: &TpmtPublic,
    seed: &[u8],
    inner_symmetric: Option<&TpmtSymDefObject>,
    inner_sym_key: Option<Vec<u8>>,
) -> Result<(Option<Vec<u8>>, Tpm2bPrivate)> {
    let name_alg = name
        .algorithm()
        .ok_or_else(|| Error::invalid_param("name", "name has no algorithm"))?;

    let mut duplicate = marshal_sized_sensitive(sensitive);
    let mut generated_key = None;

    if let Some(inner) = inner_symmetric.filter(|s| !s.is_null()) {
        let (inner_alg, inner_bits) = sym_parameters(inner)?;
        let inner_integrity = crypto::digest(name_alg, &[&duplicate, name.as_bytes()]);

        let mut inner_blob = CommandBuffer::new();
        inner_blob.put_tpm2b(&inner_integrity);
        inner_blob.put_bytes(&duplicate);
        duplicate = inner_blob.into_vec();

        let key = match inner_sym_key {
            Some(k) if !k.is_empty() => k,
            _ => {
                let k = crypto::random_bytes(usize::from(inner_bits) / 8);
                generated_key = Some(k.clone());
                k
            }
        };
        let iv = vec![0u8; inner_alg.block_size()];
        crypto::sym_encrypt(inner_alg, &key, &iv, &mut duplicate)?;
    }

    if !seed.is_empty() {
        let parent_symmetric = parent.parameters.symmetric().ok_or_else(|| {
            Error::invalid_param("parent", "parent has no symmetric algorithm")
        })?;
        duplicate = produce_outer_wrap(
            parent.name_alg,
            parent_symmetric,
            name,
            seed,
            false,
            &duplicate,
        )?;
    }

    Ok((generated_key, Tpm2bPrivate::new(duplicate)))
}

/// Recover a sensitive area from a duplication blob, inverting
/// [`sensitive_to_duplicate`].
pub fn duplicate_to_sensitive(
    duplicate: &Tpm2bPrivate,
    name: &Name,
    parent_name_alg: TpmAlgId,
    parent_symmetric: &TpmtSymDefObject,
    seed: &[u8],
    inner_symmetric: Option<&TpmtSymDefObject>,
    inner_sym_key: &[u8],
) -> Result<TpmtSensitive> {
    let name_alg = name
        .algorithm()
        .ok_or_else(|| Error::invalid_param("name", "name has no algorithm"))?;

    let mut data = duplicate.buffer.clone();

    if !seed.is_empty() {
        data = unwrap_outer(parent_name_alg, parent_symmetric, name, seed, false, &data)?;
    }

    if let Some(inner) = inner_symmetric.filter(|s| !s.is_null()) {
        let (inner_alg, _) = sym_parameters(inner)?;
        let iv = vec![0u8; inner_alg.block_size()];
        crypto::sym_decrypt(inner_alg, inner_sym_key, &iv, &mut data)?;

        let mut buf = ResponseBuffer::new(&data);
        let inner_integrity = buf.get_tpm2b()?;
        data = buf.get_remaining();

        let expected = crypto::digest(name_alg, &[&data, name.as_bytes()]);
        if !crypto::verify_mac(&expected, &inner_integrity) {
            return Err(Error::invalid_param(
                "duplicate",
                "inner integrity digest is invalid",
            ));
        }
    }

    unmarshal_sized_sensitive(&data)
}

/// Convert a private blob protected by a parent into its sensitive area.
pub fn private_to_sensitive(
    private: &Tpm2bPrivate,
    name: &Name,
    parent_name_alg: TpmAlgId,
    parent_symmetric: &TpmtSymDefObject,
    seed: &[u8],
) -> Result<TpmtSensitive> {
    let data = unwrap_outer(
        parent_name_alg,
        parent_symmetric,
        name,
        seed,
        true,
        &private.buffer,
    )?;
    unmarshal_sized_sensitive(&data)
}

/// Build a private blob from a sensitive area under a parent's
/// protection seed.
pub fn sensitive_to_private(
    sensitive: &TpmtSensitive,
    name: &Name,
    parent_name_alg: TpmAlgId,
    parent_symmetric: &TpmtSymDefObject,
    seed: &[u8],
) -> Result<Tpm2bPrivate> {
    let data = marshal_sized_sensitive(sensitive);
    let wrapped = produce_outer_wrap(parent_name_alg, parent_symmetric, name, seed, true, &data)?;
    Ok(Tpm2bPrivate::new(wrapped))
}

/// An entity with a name, for qualified-name computation.
pub trait Entity {
    fn name(&self) -> Name;
}

impl Entity for Name {
    fn name(&self) -> Name {
        self.clone()
    }
}

impl Entity for crate::resources::HandleContext {
    fn name(&self) -> Name {
        self.name()
    }
}

fn compute_one_qualified_name(entity: &dyn Entity, parent_qn: &Name) -> Result<Name> {
    let name = entity.name();
    let alg = name
        .algorithm()
        .ok_or_else(|| Error::invalid_param("entity", "invalid name"))?;
    if !parent_qn.is_valid() {
        return Err(Error::invalid_param(
            "parent_qn",
            "invalid parent qualified name",
        ));
    }
    if let Some(parent_alg) = parent_qn.algorithm() {
        if parent_alg != alg {
            return Err(Error::invalid_param(
                "parent_qn",
                "name algorithm mismatch",
            ));
        }
    }

    let digest = crypto::digest(alg, &[parent_qn.as_bytes(), name.as_bytes()]);
    Ok(Name::from_digest(alg, &digest))
}

/// Compute the qualified name of `entity` from the qualified name of a
/// root and the chain of ancestors between them, ordered root-first:
/// `QN(child) = H_nameAlg(QN(parent) || Name(child))`.
pub fn compute_qualified_name(
    entity: &dyn Entity,
    root_qn: &Name,
    ancestors: &[&dyn Entity],
) -> Result<Name> {
    let mut qn = root_qn.clone();
    for ancestor in ancestors {
        qn = compute_one_qualified_name(*ancestor, &qn)?;
    }
    compute_one_qualified_name(entity, &qn)
}

/// Compute the qualified name of an entity protected in a hierarchy,
/// seeding the chain with the 4-byte hierarchy handle.
pub fn compute_qualified_name_in_hierarchy(
    entity: &dyn Entity,
    hierarchy: Handle,
    ancestors: &[&dyn Entity],
) -> Result<Name> {
    let seed = crypto::hierarchy_seed(hierarchy)
        .ok_or_else(|| Error::invalid_param("hierarchy", "invalid hierarchy"))?;
    compute_qualified_name(entity, &Name::new(seed), ancestors)
}
