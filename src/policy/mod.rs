// SPDX-License-Identifier: Apache-2.0

//! Authorization policies: a tree of policy assertions with branching,
//! built offline, digested per hash algorithm, and executed against a
//! live policy session.

mod builder;
mod compute;
mod execute;
mod resources;

pub use builder::{PolicyBranchBuilder, PolicyBranchNode, PolicyBuilder};
pub use execute::{
    PolicyExecuteParams, PolicyExecuteResult, PolicySecretParams, PolicySessionUsage,
    PolicySignedAuthorization,
};
pub use resources::{
    Authorizer, LoadedResource, NullAuthorizer, NullPolicyResources, PersistentResource,
    PolicyResources, PolicyResourcesData, TpmPolicyResources, TransientResource,
};

use crate::constants::{TpmCc, TpmEo};
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
use crate::types::{
    Name, TaggedHashList, Tpm2bPublic, Tpm2bTimeout, TpmsNvPublic, TpmtHa, TpmtPublic,
    TpmtSignature, TpmtTkAuth,
};

/// One measured PCR value in a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcrValue {
    pub index: u32,
    pub value: TpmtHa,
}

/// A named branch of a policy OR node, carrying the branch digest for
/// every hash algorithm it has been computed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBranch {
    pub name: String,
    pub digests: TaggedHashList,
    pub elements: Vec<PolicyElement>,
}

impl PolicyBranch {
    /// The cached branch digest for one algorithm.
    pub fn digest_for(&self, alg: crate::constants::TpmAlgId) -> Result<Vec<u8>> {
        self.digests
            .iter()
            .find(|d| d.hash_alg == alg)
            .map(|d| d.digest.clone())
            .ok_or(Error::PolicyMissingDigest { alg })
    }
}

/// One assertion in a policy tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyElement {
    AuthValue,
    Password,
    CommandCode(TpmCc),
    CounterTimer {
        operand_b: Vec<u8>,
        offset: u16,
        operation: TpmEo,
    },
    CpHash {
        digests: TaggedHashList,
    },
    NameHash {
        digests: TaggedHashList,
    },
    NvWritten(bool),
    Pcr {
        values: Vec<PcrValue>,
    },
    DuplicationSelect {
        object_name: Name,
        new_parent_name: Name,
        include_object: bool,
    },
    Secret {
        auth_object_name: Name,
        policy_ref: Vec<u8>,
    },
    Signed {
        auth_key: TpmtPublic,
        policy_ref: Vec<u8>,
    },
    Nv {
        nv_public: TpmsNvPublic,
        operand_b: Vec<u8>,
        offset: u16,
        operation: TpmEo,
    },
    Authorize {
        key_name: Name,
        policy_ref: Vec<u8>,
    },
    Or(Vec<PolicyBranch>),
}

/// A signature over a policy digest, allowing the policy to satisfy a
/// TPM2_PolicyAuthorize assertion for the signing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyAuthorization {
    pub auth_key: TpmtPublic,
    pub policy_ref: Vec<u8>,
    pub signature: TpmtSignature,
}

/// A ticket produced by TPM2_PolicySigned or TPM2_PolicySecret, allowing
/// the assertion to be re-satisfied within its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTicket {
    pub auth_name: Name,
    pub policy_ref: Vec<u8>,
    pub cp_hash: Vec<u8>,
    pub timeout: Tpm2bTimeout,
    pub ticket: TpmtTkAuth,
}

/// An ordered tree of policy assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Policy {
    pub(crate) elements: Vec<PolicyElement>,
    pub(crate) authorizations: Vec<PolicyAuthorization>,
}

impl Policy {
    pub fn elements(&self) -> &[PolicyElement] {
        &self.elements
    }

    pub fn authorizations(&self) -> &[PolicyAuthorization] {
        &self.authorizations
    }

    /// Attach an authorization signature, making this policy loadable via
    /// a TPM2_PolicyAuthorize assertion for the signing key.
    pub fn add_authorization(&mut self, authorization: PolicyAuthorization) {
        self.authorizations.push(authorization);
    }
}

const POLICY_VERSION: u16 = 1;

const TAG_AUTH_VALUE: u8 = 0;
const TAG_PASSWORD: u8 = 1;
const TAG_COMMAND_CODE: u8 = 2;
const TAG_COUNTER_TIMER: u8 = 3;
const TAG_CP_HASH: u8 = 4;
const TAG_NAME_HASH: u8 = 5;
const TAG_NV_WRITTEN: u8 = 6;
const TAG_PCR: u8 = 7;
const TAG_DUPLICATION_SELECT: u8 = 8;
const TAG_SECRET: u8 = 9;
const TAG_SIGNED: u8 = 10;
const TAG_NV: u8 = 11;
const TAG_AUTHORIZE: u8 = 12;
const TAG_OR: u8 = 13;

fn put_string(buf: &mut CommandBuffer, s: &str) {
    buf.put_tpm2b(s.as_bytes());
}

fn get_string(buf: &mut ResponseBuffer) -> Result<String> {
    let bytes = buf.get_tpm2b()?;
    String::from_utf8(bytes).map_err(|_| Error::unmarshal("branch name is not UTF-8"))
}

impl Marshal for PcrValue {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.index);
        self.value.marshal(buf);
    }
}

impl Unmarshal for PcrValue {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            index: buf.get_u32()?,
            value: TpmtHa::unmarshal(buf)?,
        })
    }
}

impl Marshal for PolicyBranch {
    fn marshal(&self, buf: &mut CommandBuffer) {
        put_string(buf, &self.name);
        buf.put_list(&self.digests);
        buf.put_list(&self.elements);
    }
}

impl Unmarshal for PolicyBranch {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            name: get_string(buf)?,
            digests: buf.get_list()?,
            elements: buf.get_list()?,
        })
    }
}

impl Marshal for PolicyElement {
    fn marshal(&self, buf: &mut CommandBuffer) {
        match self {
            PolicyElement::AuthValue => buf.put_u8(TAG_AUTH_VALUE),
            PolicyElement::Password => buf.put_u8(TAG_PASSWORD),
            PolicyElement::CommandCode(cc) => {
                buf.put_u8(TAG_COMMAND_CODE);
                buf.put_u32(cc.to_u32());
            }
            PolicyElement::CounterTimer {
                operand_b,
                offset,
                operation,
            } => {
                buf.put_u8(TAG_COUNTER_TIMER);
                buf.put_tpm2b(operand_b);
                buf.put_u16(*offset);
                buf.put_u16(operation.to_u16());
            }
            PolicyElement::CpHash { digests } => {
                buf.put_u8(TAG_CP_HASH);
                buf.put_list(digests);
            }
            PolicyElement::NameHash { digests } => {
                buf.put_u8(TAG_NAME_HASH);
                buf.put_list(digests);
            }
            PolicyElement::NvWritten(written) => {
                buf.put_u8(TAG_NV_WRITTEN);
                buf.put_u8(u8::from(*written));
            }
            PolicyElement::Pcr { values } => {
                buf.put_u8(TAG_PCR);
                buf.put_list(values);
            }
            PolicyElement::DuplicationSelect {
                object_name,
                new_parent_name,
                include_object,
            } => {
                buf.put_u8(TAG_DUPLICATION_SELECT);
                object_name.marshal(buf);
                new_parent_name.marshal(buf);
                buf.put_u8(u8::from(*include_object));
            }
            PolicyElement::Secret {
                auth_object_name,
                policy_ref,
            } => {
                buf.put_u8(TAG_SECRET);
                auth_object_name.marshal(buf);
                buf.put_tpm2b(policy_ref);
            }
            PolicyElement::Signed {
                auth_key,
                policy_ref,
            } => {
                buf.put_u8(TAG_SIGNED);
                buf.put_sized(Some(auth_key));
                buf.put_tpm2b(policy_ref);
            }
            PolicyElement::Nv {
                nv_public,
                operand_b,
                offset,
                operation,
            } => {
                buf.put_u8(TAG_NV);
                buf.put_sized(Some(nv_public));
                buf.put_tpm2b(operand_b);
                buf.put_u16(*offset);
                buf.put_u16(operation.to_u16());
            }
            PolicyElement::Authorize {
                key_name,
                policy_ref,
            } => {
                buf.put_u8(TAG_AUTHORIZE);
                key_name.marshal(buf);
                buf.put_tpm2b(policy_ref);
            }
            PolicyElement::Or(branches) => {
                buf.put_u8(TAG_OR);
                buf.put_list(branches);
            }
        }
    }
}

impl Unmarshal for PolicyElement {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u8()?;
        Ok(match tag {
            TAG_AUTH_VALUE => PolicyElement::AuthValue,
            TAG_PASSWORD => PolicyElement::Password,
            TAG_COMMAND_CODE => {
                let raw = buf.get_u32()?;
                let cc = TpmCc::from_u32(raw).ok_or_else(|| {
                    Error::unmarshal(format!("unknown command code 0x{raw:08x}"))
                })?;
                PolicyElement::CommandCode(cc)
            }
            TAG_COUNTER_TIMER => PolicyElement::CounterTimer {
                operand_b: buf.get_tpm2b()?,
                offset: buf.get_u16()?,
                operation: get_operation(buf)?,
            },
            TAG_CP_HASH => PolicyElement::CpHash {
                digests: buf.get_list()?,
            },
            TAG_NAME_HASH => PolicyElement::NameHash {
                digests: buf.get_list()?,
            },
            TAG_NV_WRITTEN => PolicyElement::NvWritten(buf.get_u8()? != 0),
            TAG_PCR => PolicyElement::Pcr {
                values: buf.get_list()?,
            },
            TAG_DUPLICATION_SELECT => PolicyElement::DuplicationSelect {
                object_name: Name::unmarshal(buf)?,
                new_parent_name: Name::unmarshal(buf)?,
                include_object: buf.get_u8()? != 0,
            },
            TAG_SECRET => PolicyElement::Secret {
                auth_object_name: Name::unmarshal(buf)?,
                policy_ref: buf.get_tpm2b()?,
            },
            TAG_SIGNED => PolicyElement::Signed {
                auth_key: buf
                    .get_sized::<TpmtPublic>()?
                    .ok_or_else(|| Error::unmarshal("empty auth key"))?,
                policy_ref: buf.get_tpm2b()?,
            },
            TAG_NV => PolicyElement::Nv {
                nv_public: buf
                    .get_sized::<TpmsNvPublic>()?
                    .ok_or_else(|| Error::unmarshal("empty NV public"))?,
                operand_b: buf.get_tpm2b()?,
                offset: buf.get_u16()?,
                operation: get_operation(buf)?,
            },
            TAG_AUTHORIZE => PolicyElement::Authorize {
                key_name: Name::unmarshal(buf)?,
                policy_ref: buf.get_tpm2b()?,
            },
            TAG_OR => PolicyElement::Or(buf.get_list()?),
            other => {
                return Err(Error::unmarshal(format!(
                    "selector out of range for policy element: {other}"
                )))
            }
        })
    }
}

fn get_operation(buf: &mut ResponseBuffer) -> Result<TpmEo> {
    let raw = buf.get_u16()?;
    Ok(match raw {
        0x0000 => TpmEo::Eq,
        0x0001 => TpmEo::Neq,
        0x0002 => TpmEo::SignedGt,
        0x0003 => TpmEo::UnsignedGt,
        0x0004 => TpmEo::SignedLt,
        0x0005 => TpmEo::UnsignedLt,
        0x0006 => TpmEo::SignedGe,
        0x0007 => TpmEo::UnsignedGe,
        0x0008 => TpmEo::SignedLe,
        0x0009 => TpmEo::UnsignedLe,
        0x000A => TpmEo::BitSet,
        0x000B => TpmEo::BitClear,
        other => {
            return Err(Error::unmarshal(format!(
                "selector out of range for TPM_EO: 0x{other:04x}"
            )))
        }
    })
}

impl Marshal for PolicyAuthorization {
    fn marshal(&self, buf: &mut CommandBuffer) {
        Tpm2bPublic {
            public: self.auth_key.clone(),
        }
        .marshal(buf);
        buf.put_tpm2b(&self.policy_ref);
        self.signature.marshal(buf);
    }
}

impl Unmarshal for PolicyAuthorization {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            auth_key: Tpm2bPublic::unmarshal(buf)?.public,
            policy_ref: buf.get_tpm2b()?,
            signature: TpmtSignature::unmarshal(buf)?,
        })
    }
}

impl Marshal for Policy {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(POLICY_VERSION);
        buf.put_list(&self.elements);
        buf.put_list(&self.authorizations);
    }
}

impl Unmarshal for Policy {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let version = buf.get_u16()?;
        if version != POLICY_VERSION {
            return Err(Error::unmarshal(format!(
                "unsupported policy version {version}"
            )));
        }
        Ok(Self {
            elements: buf.get_list()?,
            authorizations: buf.get_list()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{tpm_rh, TpmAlgId};
    use crate::marshal::{Marshal, Unmarshal};

    #[test]
    fn policy_serialization_round_trip() {
        let mut builder = PolicyBuilder::new();
        builder
            .root_branch()
            .policy_nv_written(true)
            .policy_secret(Name::from_handle(tpm_rh::OWNER), b"ref");
        let node = builder.root_branch().add_branch_node();
        node.add_branch("a").policy_auth_value();
        node.add_branch("b").policy_command_code(TpmCc::NvChangeAuth);
        let mut policy = builder.policy().unwrap();
        policy.compute_for(TpmAlgId::Sha256).unwrap();

        let bytes = policy.to_bytes();
        let decoded = Policy::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, policy);
    }

    #[test]
    fn unknown_element_tag_is_rejected() {
        let err = PolicyElement::from_bytes(&[0xEE]).unwrap_err();
        assert!(err.to_string().contains("selector out of range"));
    }
}
