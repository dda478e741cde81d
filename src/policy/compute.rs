// SPDX-License-Identifier: Apache-2.0

//! Offline computation of policy digests.
//!
//! Mirrors the digest chaining the TPM performs while executing the
//! assertions, so the authorization digest of a policy can be computed
//! without a TPM. Branch digests are cached on the tree per algorithm for
//! reuse by the executor.

use crate::constants::{TpmAlgId, TpmCc};
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::Marshal;
use crate::types::{TpmlPcrSelection, TpmsPcrSelection, TpmtHa};

use super::{PcrValue, Policy, PolicyBranch, PolicyElement};

fn extend(alg: TpmAlgId, digest: &mut Vec<u8>, chunks: &[&[u8]]) {
    let mut input: Vec<&[u8]> = Vec::with_capacity(chunks.len() + 1);
    input.push(digest.as_slice());
    input.extend_from_slice(chunks);
    let updated = crypto::digest(alg, &input);
    *digest = updated;
}

/// `policyDigest = H(policyDigest || cc || name)` followed by
/// `policyDigest = H(policyDigest || policyRef)`.
fn policy_update(alg: TpmAlgId, digest: &mut Vec<u8>, cc: TpmCc, name: &[u8], policy_ref: &[u8]) {
    extend(alg, digest, &[&cc.to_u32().to_be_bytes(), name]);
    extend(alg, digest, &[policy_ref]);
}

fn select_digest(digests: &[TpmtHa], alg: TpmAlgId) -> Result<Vec<u8>> {
    digests
        .iter()
        .find(|d| d.hash_alg == alg)
        .map(|d| d.digest.clone())
        .ok_or(Error::PolicyMissingDigest { alg })
}

/// Build the PCR selection and the selected-values digest for a policy
/// PCR assertion: banks in first-appearance order, indices ascending
/// within a bank, values concatenated in selection order.
pub(crate) fn pcr_selection_and_digest(
    alg: TpmAlgId,
    values: &[PcrValue],
) -> Result<(TpmlPcrSelection, Vec<u8>)> {
    if values.is_empty() {
        return Err(Error::invalid_param("values", "no PCR values supplied"));
    }

    let mut banks: Vec<(TpmAlgId, Vec<&PcrValue>)> = Vec::new();
    for value in values {
        match banks.iter_mut().find(|(bank, _)| *bank == value.value.hash_alg) {
            Some((_, members)) => members.push(value),
            None => banks.push((value.value.hash_alg, vec![value])),
        }
    }

    let mut selections = Vec::with_capacity(banks.len());
    let mut concatenated = Vec::new();
    for (bank, mut members) in banks {
        members.sort_by_key(|v| v.index);
        let indices: Vec<u32> = members.iter().map(|v| v.index).collect();
        selections.push(TpmsPcrSelection::new(bank, &indices));
        for member in members {
            concatenated.extend_from_slice(&member.value.digest);
        }
    }

    let selection = TpmlPcrSelection { selections };
    let digest = crypto::digest(alg, &[&concatenated]);
    Ok((selection, digest))
}

fn compute_element(alg: TpmAlgId, element: &mut PolicyElement, digest: &mut Vec<u8>) -> Result<()> {
    match element {
        PolicyElement::AuthValue | PolicyElement::Password => {
            // TPM2_PolicyPassword extends the same digest as
            // TPM2_PolicyAuthValue; only the executed command differs
            extend(
                alg,
                digest,
                &[&TpmCc::PolicyAuthValue.to_u32().to_be_bytes()],
            );
        }
        PolicyElement::CommandCode(code) => {
            extend(
                alg,
                digest,
                &[
                    &TpmCc::PolicyCommandCode.to_u32().to_be_bytes(),
                    &code.to_u32().to_be_bytes(),
                ],
            );
        }
        PolicyElement::CounterTimer {
            operand_b,
            offset,
            operation,
        } => {
            let args = crypto::digest(
                alg,
                &[
                    operand_b,
                    &offset.to_be_bytes(),
                    &operation.to_u16().to_be_bytes(),
                ],
            );
            extend(
                alg,
                digest,
                &[&TpmCc::PolicyCounterTimer.to_u32().to_be_bytes(), &args],
            );
        }
        PolicyElement::CpHash { digests } => {
            let cp_hash_a = select_digest(digests, alg)?;
            extend(
                alg,
                digest,
                &[&TpmCc::PolicyCpHash.to_u32().to_be_bytes(), &cp_hash_a],
            );
        }
        PolicyElement::NameHash { digests } => {
            let name_hash = select_digest(digests, alg)?;
            extend(
                alg,
                digest,
                &[&TpmCc::PolicyNameHash.to_u32().to_be_bytes(), &name_hash],
            );
        }
        PolicyElement::NvWritten(written) => {
            extend(
                alg,
                digest,
                &[
                    &TpmCc::PolicyNvWritten.to_u32().to_be_bytes(),
                    &[u8::from(*written)],
                ],
            );
        }
        PolicyElement::Pcr { values } => {
            let (selection, pcr_digest) = pcr_selection_and_digest(alg, values)?;
            extend(
                alg,
                digest,
                &[
                    &TpmCc::PolicyPcr.to_u32().to_be_bytes(),
                    &selection.to_bytes(),
                    &pcr_digest,
                ],
            );
        }
        PolicyElement::DuplicationSelect {
            object_name,
            new_parent_name,
            include_object,
        } => {
            let mut chunks: Vec<&[u8]> = Vec::with_capacity(4);
            let cc = TpmCc::PolicyDuplicationSelect.to_u32().to_be_bytes();
            chunks.push(&cc);
            if *include_object {
                chunks.push(object_name.as_bytes());
            }
            chunks.push(new_parent_name.as_bytes());
            let include = [u8::from(*include_object)];
            chunks.push(&include);
            extend(alg, digest, &chunks);
        }
        PolicyElement::Secret {
            auth_object_name,
            policy_ref,
        } => {
            policy_update(
                alg,
                digest,
                TpmCc::PolicySecret,
                auth_object_name.as_bytes(),
                policy_ref,
            );
        }
        PolicyElement::Signed {
            auth_key,
            policy_ref,
        } => {
            let key_name = auth_key.name()?;
            policy_update(
                alg,
                digest,
                TpmCc::PolicySigned,
                key_name.as_bytes(),
                policy_ref,
            );
        }
        PolicyElement::Nv {
            nv_public,
            operand_b,
            offset,
            operation,
        } => {
            let nv_name = nv_public.name()?;
            let args = crypto::digest(
                alg,
                &[
                    operand_b,
                    &offset.to_be_bytes(),
                    &operation.to_u16().to_be_bytes(),
                ],
            );
            extend(
                alg,
                digest,
                &[
                    &TpmCc::PolicyNv.to_u32().to_be_bytes(),
                    &args,
                    nv_name.as_bytes(),
                ],
            );
        }
        PolicyElement::Authorize {
            key_name,
            policy_ref,
        } => {
            // an authorized policy substitutes the digest computed so far
            *digest = vec![0u8; alg.digest_size()];
            policy_update(
                alg,
                digest,
                TpmCc::PolicyAuthorize,
                key_name.as_bytes(),
                policy_ref,
            );
        }
        PolicyElement::Or(branches) => {
            compute_or(alg, branches, digest)?;
        }
    }
    Ok(())
}

fn compute_or(alg: TpmAlgId, branches: &mut [PolicyBranch], digest: &mut Vec<u8>) -> Result<()> {
    if !(2..=8).contains(&branches.len()) {
        return Err(Error::invalid_param(
            "branches",
            format!("a PolicyOR requires between 2 and 8 branches, got {}", branches.len()),
        ));
    }

    let mut concatenated = Vec::new();
    for branch in branches.iter_mut() {
        let mut branch_digest = digest.clone();
        compute_elements(alg, &mut branch.elements, &mut branch_digest)?;
        concatenated.extend_from_slice(&branch_digest);

        match branch.digests.iter_mut().find(|d| d.hash_alg == alg) {
            Some(entry) => entry.digest = branch_digest,
            None => branch.digests.push(TpmtHa::new(alg, branch_digest)),
        }
    }

    *digest = vec![0u8; alg.digest_size()];
    extend(
        alg,
        digest,
        &[&TpmCc::PolicyOr.to_u32().to_be_bytes(), &concatenated],
    );
    Ok(())
}

fn compute_elements(
    alg: TpmAlgId,
    elements: &mut [PolicyElement],
    digest: &mut Vec<u8>,
) -> Result<()> {
    for element in elements {
        compute_element(alg, element, digest)?;
    }
    Ok(())
}

impl Policy {
    /// Compute the authorization digest of this policy for one hash
    /// algorithm, caching branch digests on the tree for the executor.
    /// Repeated computation is idempotent.
    pub fn compute_for(&mut self, alg: TpmAlgId) -> Result<Vec<u8>> {
        if !alg.is_hash() {
            return Err(Error::invalid_param(
                "alg",
                format!("not a digest algorithm: {alg:?}"),
            ));
        }
        let mut digest = vec![0u8; alg.digest_size()];
        compute_elements(alg, &mut self.elements, &mut digest)?;
        Ok(digest)
    }

    /// Recompute the root digest without touching cached branch digests.
    /// Callers use this to check a deserialized policy.
    pub fn validate(&self, alg: TpmAlgId) -> Result<Vec<u8>> {
        self.clone().compute_for(alg)
    }
}

#[cfg(test)]
mod tests {
    use super::super::PolicyBuilder;
    use super::*;
    use crate::constants::{tpm_rh, TpmEo, TpmaNv};
    use crate::types::{Name, Tpm2bDigest, TpmsNvPublic};

    fn nv_public(name_alg: TpmAlgId) -> TpmsNvPublic {
        TpmsNvPublic {
            nv_index: 0x0181f000,
            name_alg,
            attrs: TpmaNv::new()
                .with(TpmaNv::AUTH_READ)
                .with(TpmaNv::AUTH_WRITE)
                .with(TpmaNv::WRITTEN),
            auth_policy: Tpm2bDigest::empty(),
            size: 8,
        }
    }

    fn compute_sha256(policy: &mut Policy) -> String {
        hex::encode(policy.compute_for(TpmAlgId::Sha256).unwrap())
    }

    #[test]
    fn policy_nv() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv(
            &nv_public(TpmAlgId::Sha256),
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10],
            0,
            TpmEo::UnsignedLt,
        );
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "aca835ee02ef5c2060c5b833ccee0ae9117321b162b10a9dd69b0cbc5b4b90d1"
        );
    }

    #[test]
    fn policy_nv_different_name() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv(
            &nv_public(TpmAlgId::Sha1),
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10],
            0,
            TpmEo::UnsignedLt,
        );
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "5f38b62e654501aee4cc0c26c999cd16333c8695701eaff1f0f85b658f662f6d"
        );
    }

    #[test]
    fn policy_nv_different_operand() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv(
            &nv_public(TpmAlgId::Sha256),
            &[0x00, 0x00, 0x00, 0xff],
            0,
            TpmEo::UnsignedLt,
        );
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "e9cd39141ce8ce274dc491a10426b05bfe4e493b8ca583bd01d10aba60f8af02"
        );
    }

    #[test]
    fn policy_nv_different_offset() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv(
            &nv_public(TpmAlgId::Sha256),
            &[0x00, 0x10],
            6,
            TpmEo::UnsignedLt,
        );
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "718deb133fdb34530a37cfcc0c26f9552c5703bf56520e129aa73f5cd8621343"
        );
    }

    #[test]
    fn policy_nv_different_operation() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv(
            &nv_public(TpmAlgId::Sha256),
            &[0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10],
            0,
            TpmEo::UnsignedGe,
        );
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "f50564e250f80476c988180e87202c01fd52129abfea4f26eae04ac99641f735"
        );
    }

    #[test]
    fn policy_secret() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"foo");
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "62fd94980db2a746545cab626e9df21a1d0f00472f637d4bf567026e40a6ebed"
        );
    }

    #[test]
    fn policy_secret_no_policy_ref() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"");
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "0d84f55daf6e43ac97966e62c9bb989d3397777d25c5f749868055d65394f952"
        );
    }

    #[test]
    fn policy_secret_nv_auth_object() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(nv_public(TpmAlgId::Sha256).name().unwrap(), b"foo");
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "01e965ae5e8858d01355dd9f622b555c1acad6c0f839bb35e1d4bea18bb9837a"
        );
    }

    #[test]
    fn policy_auth_value() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_auth_value();
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );
    }

    #[test]
    fn policy_password_digest_matches_auth_value() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_password();
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "8fcd2169ab92694e0c633f1ab772842b8241bbc20288981fc7ac1eddc1fddb0e"
        );
    }

    #[test]
    fn policy_command_code() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_command_code(TpmCc::NvChangeAuth);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "445ed953601a045504550999bf2cbb2992cba2dbb5121bcf03869f65b50c26e5"
        );

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_command_code(TpmCc::Duplicate);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "bef56b8c1cc84e11edd717528d2cd99356bd2bbf8f015209c3f84aeeaba8e8a2"
        );
    }

    #[test]
    fn policy_counter_timer() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_counter_timer(&[0x00, 0x00, 0xff, 0xff], 4, TpmEo::UnsignedGt);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "038e1eee9e35e6991d98b4cff4d5a7c4eba13d9693238cdccc3dd11d776ddca9"
        );
    }

    #[test]
    fn policy_nv_written() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv_written(false);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "3c326323670e28ad37bd57f63b4cc34d26ab205ef22f275c58d47fab2485466e"
        );

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv_written(true);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "f7887d158ae8d38be0ac5319f37a9e07618bf54885453c7a54ddb0c6a6193beb"
        );
    }

    #[test]
    fn policy_mixed() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"bar")
            .policy_auth_value()
            .policy_command_code(TpmCc::NvChangeAuth);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            compute_sha256(&mut policy),
            "426df7ddd07dbfaa400237f773da801e464ef2766084966b04d8b4dfc0feeee5"
        );
    }

    #[test]
    fn policy_mixed_sha1() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"bar")
            .policy_auth_value()
            .policy_command_code(TpmCc::NvChangeAuth);
        let mut policy = builder.policy().unwrap();
        assert_eq!(
            hex::encode(policy.compute_for(TpmAlgId::Sha1).unwrap()),
            "abdce83ab50f4d5fd378181e21de9486559612d3"
        );
    }

    #[test]
    fn compute_is_idempotent() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv_written(true);
        let node = builder.root_branch().add_branch_node();
        node.add_branch("branch1").policy_auth_value();
        node.add_branch("branch2")
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"foo");
        let mut policy = builder.policy().unwrap();

        let first = policy.compute_for(TpmAlgId::Sha256).unwrap();
        let second = policy.compute_for(TpmAlgId::Sha256).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn validate_matches_compute() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"bar")
            .policy_auth_value();
        let mut policy = builder.policy().unwrap();
        let computed = policy.compute_for(TpmAlgId::Sha256).unwrap();
        assert_eq!(policy.validate(TpmAlgId::Sha256).unwrap(), computed);
    }

    #[test]
    fn branch_digests_fold_through_policy_or() {
        // compute the two standalone branch policies
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_nv_written(true)
            .policy_auth_value();
        let mut p1 = builder.policy().unwrap();
        let d1 = p1.compute_for(TpmAlgId::Sha256).unwrap();

        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_nv_written(true)
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"foo");
        let mut p2 = builder.policy().unwrap();
        let d2 = p2.compute_for(TpmAlgId::Sha256).unwrap();

        // fold them through the PolicyOR rule and append the trailer
        let mut expected = vec![0u8; 32];
        let mut concatenated = d1.clone();
        concatenated.extend_from_slice(&d2);
        extend(
            TpmAlgId::Sha256,
            &mut expected,
            &[&TpmCc::PolicyOr.to_u32().to_be_bytes(), &concatenated],
        );
        extend(
            TpmAlgId::Sha256,
            &mut expected,
            &[
                &TpmCc::PolicyCommandCode.to_u32().to_be_bytes(),
                &TpmCc::NvChangeAuth.to_u32().to_be_bytes(),
            ],
        );

        // the branched policy computes the same digest and caches the
        // per-branch digests
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv_written(true);
        let node = builder.root_branch().add_branch_node();
        node.add_branch("branch1").policy_auth_value();
        node.add_branch("branch2")
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"foo");
        builder
            .root_branch()
            .policy_command_code(TpmCc::NvChangeAuth);
        let mut policy = builder.policy().unwrap();

        assert_eq!(policy.compute_for(TpmAlgId::Sha256).unwrap(), expected);

        match &policy.elements[1] {
            PolicyElement::Or(branches) => {
                assert_eq!(branches[0].digest_for(TpmAlgId::Sha256).unwrap(), d1);
                assert_eq!(branches[1].digest_for(TpmAlgId::Sha256).unwrap(), d2);
            }
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn multiple_algorithms_cache_separately() {
        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_nv_written(true);
        let node = builder.root_branch().add_branch_node();
        node.add_branch("branch1").policy_auth_value();
        node.add_branch("branch2")
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"foo");
        let mut policy = builder.policy().unwrap();

        policy.compute_for(TpmAlgId::Sha1).unwrap();
        policy.compute_for(TpmAlgId::Sha256).unwrap();

        match &policy.elements[1] {
            PolicyElement::Or(branches) => {
                assert_eq!(branches[0].digests.len(), 2);
                assert!(branches[0].digest_for(TpmAlgId::Sha1).is_ok());
                assert!(branches[0].digest_for(TpmAlgId::Sha256).is_ok());
                assert!(matches!(
                    branches[0].digest_for(TpmAlgId::Sha384),
                    Err(Error::PolicyMissingDigest { .. })
                ));
            }
            other => panic!("unexpected element: {other:?}"),
        }
    }

    #[test]
    fn policy_authorize_substitutes_digest() {
        let key_name = Name::from_digest(TpmAlgId::Sha256, &[0x7E; 32]);

        // the digest accumulated before the authorize assertion is
        // discarded
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_nv_written(true)
            .policy_authorize(key_name.clone(), b"ref");
        let mut with_prefix = builder.policy().unwrap();

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_authorize(key_name, b"ref");
        let mut without_prefix = builder.policy().unwrap();

        assert_eq!(
            with_prefix.compute_for(TpmAlgId::Sha256).unwrap(),
            without_prefix.compute_for(TpmAlgId::Sha256).unwrap()
        );
    }

    #[test]
    fn pcr_selection_groups_banks() {
        let values = vec![
            PcrValue {
                index: 7,
                value: TpmtHa::new(TpmAlgId::Sha256, vec![0xAA; 32]),
            },
            PcrValue {
                index: 4,
                value: TpmtHa::new(TpmAlgId::Sha256, vec![0xBB; 32]),
            },
            PcrValue {
                index: 0,
                value: TpmtHa::new(TpmAlgId::Sha1, vec![0xCC; 20]),
            },
        ];
        let (selection, digest) = pcr_selection_and_digest(TpmAlgId::Sha256, &values).unwrap();
        assert_eq!(selection.selections.len(), 2);
        assert_eq!(selection.selections[0].hash, TpmAlgId::Sha256);
        assert_eq!(selection.selections[0].pcr_select, vec![0x90, 0x00, 0x00]);
        assert_eq!(selection.selections[1].hash, TpmAlgId::Sha1);

        // indices ascend within a bank: pcr4 before pcr7
        let mut concatenated = vec![0xBB; 32];
        concatenated.extend_from_slice(&[0xAA; 32]);
        concatenated.extend_from_slice(&[0xCC; 20]);
        assert_eq!(
            digest,
            crypto::digest(TpmAlgId::Sha256, &[&concatenated])
        );
    }
}
