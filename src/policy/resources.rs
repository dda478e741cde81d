// SPDX-License-Identifier: Apache-2.0

//! Resolution of the resources a policy needs while it executes:
//! loading entities by name, locating per-resource policies and
//! authorized sub-policies, and providing authorization values and
//! signatures.

use crate::constants::{Handle, TpmAlgId, TpmCc, TpmHt, TpmSe};
use crate::context::TpmContext;
use crate::error::{Error, Result};
use crate::resources::HandleContext;
use crate::types::{Name, Tpm2bPrivate, Tpm2bPublic};

use super::execute::{PolicyExecuteParams, PolicySessionUsage, PolicySignedAuthorization};
use super::Policy;

/// A resource materialized for a policy assertion. When `flush` is set
/// the executor owns the TPM-side lifetime and flushes the handle once
/// the assertion completes.
#[derive(Debug, Clone)]
pub struct LoadedResource {
    pub context: HandleContext,
    pub flush: bool,
}

/// The capability interface the policy executor uses to materialize
/// resources. The executor wraps any implementation in a caching layer.
pub trait PolicyResources {
    /// Load the resource with the given name, together with its policy
    /// if one is known.
    fn load_name(
        &mut self,
        tpm: &mut TpmContext,
        name: &Name,
    ) -> Result<(LoadedResource, Option<Policy>)>;

    /// The policy of a resource, if known. A missing policy is not an
    /// error.
    fn load_policy(&mut self, name: &Name) -> Result<Option<Policy>>;

    /// Policies signed by `key_sign` for the given policy reference.
    fn load_authorized_policies(
        &mut self,
        key_sign: &Name,
        policy_ref: &[u8],
    ) -> Result<Vec<Policy>>;

    /// Provide the resource's authorization value.
    fn authorize(&mut self, resource: &mut HandleContext) -> Result<()>;

    /// Sign a TPM2_PolicySigned authorization for the given key, policy
    /// reference and session nonce.
    fn sign_authorization(
        &mut self,
        session_nonce: &[u8],
        auth_key: &Name,
        policy_ref: &[u8],
    ) -> Result<PolicySignedAuthorization>;
}

/// Supplies authorization values and signatures to
/// [`TpmPolicyResources`].
pub trait Authorizer {
    fn authorize(&mut self, resource: &mut HandleContext) -> Result<()>;

    fn sign_authorization(
        &mut self,
        session_nonce: &[u8],
        auth_key: &Name,
        policy_ref: &[u8],
    ) -> Result<PolicySignedAuthorization>;
}

/// An [`Authorizer`] that refuses everything; resources that need no
/// authorization still resolve.
pub struct NullAuthorizer;

impl Authorizer for NullAuthorizer {
    fn authorize(&mut self, _resource: &mut HandleContext) -> Result<()> {
        Err(Error::invalid_param("authorizer", "no authorizer"))
    }

    fn sign_authorization(
        &mut self,
        _session_nonce: &[u8],
        _auth_key: &Name,
        _policy_ref: &[u8],
    ) -> Result<PolicySignedAuthorization> {
        Err(Error::invalid_param("authorizer", "no authorizer"))
    }
}

/// A persistent object or NV index known to the caller.
#[derive(Debug, Clone)]
pub struct PersistentResource {
    pub name: Name,
    pub handle: Handle,
    pub policy: Option<Policy>,
}

/// A loadable transient object known to the caller.
#[derive(Debug, Clone)]
pub struct TransientResource {
    pub parent_name: Name,
    pub public: Tpm2bPublic,
    pub private: Tpm2bPrivate,
    pub policy: Option<Policy>,
}

/// The resource inventory behind [`TpmPolicyResources`].
#[derive(Debug, Clone, Default)]
pub struct PolicyResourcesData {
    pub persistent: Vec<PersistentResource>,
    pub transient: Vec<TransientResource>,
    pub authorized_policies: Vec<Policy>,
}

/// A [`PolicyResources`] implementation backed by a live TPM: resolves
/// names against the supplied inventory, loads transient objects under
/// their parents (executing parent policies recursively), and falls back
/// to scanning the TPM's persistent and NV handles.
pub struct TpmPolicyResources<A: Authorizer> {
    data: PolicyResourcesData,
    authorizer: A,
}

impl<A: Authorizer> TpmPolicyResources<A> {
    pub fn new(data: PolicyResourcesData, authorizer: A) -> Self {
        Self { data, authorizer }
    }

    fn load_transient(
        &mut self,
        tpm: &mut TpmContext,
        index: usize,
    ) -> Result<(LoadedResource, Option<Policy>)> {
        let object = self.data.transient[index].clone();

        let (parent, parent_policy) = self.load_name(tpm, &object.parent_name)?;
        let parent_alg = parent.context.name().algorithm().unwrap_or(TpmAlgId::Sha256);

        let session_type = if parent_policy.is_some() {
            TpmSe::Policy
        } else {
            TpmSe::Hmac
        };
        let session = tpm.start_auth_session(None, None, session_type, None, parent_alg)?;

        let result = (|| {
            let mut parent_context = parent.context.clone();
            let mut auth_value_needed = true;

            if let Some(mut policy) = parent_policy {
                policy.compute_for(parent_alg)?;
                let params = PolicyExecuteParams {
                    usage: Some(PolicySessionUsage {
                        command_code: TpmCc::Load,
                        handle_names: vec![parent_context.name()],
                        auth_value: Vec::new(),
                        can_use_auth_value: true,
                    }),
                    ..Default::default()
                };
                let outcome = policy.execute(tpm, &session, self, &params)?;
                auth_value_needed = outcome.auth_value_needed;
            }

            if auth_value_needed {
                self.authorizer.authorize(&mut parent_context)?;
            }

            tpm.load(&parent_context, Some(&session), &object.private, &object.public)
        })();

        // the session is single-use; release it regardless of the outcome
        let _ = tpm.flush_context(session.handle());
        if parent.flush {
            let _ = tpm.flush_context(parent.context.handle());
        }

        let loaded = result?;
        Ok((
            LoadedResource {
                context: HandleContext::Object(loaded),
                flush: true,
            },
            object.policy,
        ))
    }

    fn scan_tpm_handles(
        &mut self,
        tpm: &mut TpmContext,
        name: &Name,
    ) -> Result<Option<(LoadedResource, Option<Policy>)>> {
        let mut handles =
            tpm.get_capability_handles(TpmHt::Persistent.base_handle(), u32::MAX)?;
        handles.extend(tpm.get_capability_handles(TpmHt::NvIndex.base_handle(), u32::MAX)?);

        for handle in handles {
            let resource = match tpm.new_resource_context(handle) {
                Ok(r) => r,
                Err(Error::ResourceUnavailable { .. }) => continue,
                Err(e) => return Err(e),
            };
            if &resource.name() == name {
                return Ok(Some((
                    LoadedResource {
                        context: resource,
                        flush: false,
                    },
                    None,
                )));
            }
        }
        Ok(None)
    }
}

impl<A: Authorizer> PolicyResources for TpmPolicyResources<A> {
    fn load_name(
        &mut self,
        tpm: &mut TpmContext,
        name: &Name,
    ) -> Result<(LoadedResource, Option<Policy>)> {
        let wrap = |name: &Name, e: Error| Error::PolicyResourceLoad {
            name: name.clone(),
            source: Box::new(e),
        };

        if let Some(handle) = name.handle() {
            if matches!(TpmHt::of(handle), Some(TpmHt::Pcr) | Some(TpmHt::Permanent)) {
                return Ok((
                    LoadedResource {
                        context: HandleContext::Permanent(tpm.permanent_context(handle)),
                        flush: false,
                    },
                    None,
                ));
            }
        }

        if let Some(resource) = self.data.persistent.iter().find(|r| &r.name == name) {
            let handle = resource.handle;
            let policy = resource.policy.clone();
            let context = tpm
                .new_resource_context(handle)
                .map_err(|e| wrap(name, e))?;
            if &context.name() != name {
                return Err(wrap(
                    name,
                    Error::invalid_param("name", "persistent TPM resource has the wrong name"),
                ));
            }
            return Ok((
                LoadedResource {
                    context,
                    flush: false,
                },
                policy,
            ));
        }

        let transient_index = self.data.transient.iter().position(|t| {
            t.public
                .public
                .name()
                .map(|n| &n == name)
                .unwrap_or(false)
        });
        if let Some(index) = transient_index {
            return self.load_transient(tpm, index).map_err(|e| wrap(name, e));
        }

        if let Some(found) = self.scan_tpm_handles(tpm, name).map_err(|e| wrap(name, e))? {
            return Ok(found);
        }

        Err(wrap(
            name,
            Error::invalid_param("name", "no resource found with this name"),
        ))
    }

    fn load_policy(&mut self, name: &Name) -> Result<Option<Policy>> {
        if let Some(resource) = self.data.persistent.iter().find(|r| &r.name == name) {
            return Ok(resource.policy.clone());
        }
        for object in &self.data.transient {
            if object.public.public.name()?.as_bytes() == name.as_bytes() {
                return Ok(object.policy.clone());
            }
        }
        Ok(None)
    }

    fn load_authorized_policies(
        &mut self,
        key_sign: &Name,
        policy_ref: &[u8],
    ) -> Result<Vec<Policy>> {
        let mut out = Vec::new();
        for policy in &self.data.authorized_policies {
            for auth in &policy.authorizations {
                if auth.policy_ref != policy_ref {
                    continue;
                }
                if &auth.auth_key.name()? != key_sign {
                    continue;
                }
                out.push(policy.clone());
                break;
            }
        }
        Ok(out)
    }

    fn authorize(&mut self, resource: &mut HandleContext) -> Result<()> {
        self.authorizer.authorize(resource)
    }

    fn sign_authorization(
        &mut self,
        session_nonce: &[u8],
        auth_key: &Name,
        policy_ref: &[u8],
    ) -> Result<PolicySignedAuthorization> {
        self.authorizer
            .sign_authorization(session_nonce, auth_key, policy_ref)
    }
}

/// A do-nothing resource loader for policies with no external
/// dependencies.
pub struct NullPolicyResources;

impl PolicyResources for NullPolicyResources {
    fn load_name(
        &mut self,
        _tpm: &mut TpmContext,
        name: &Name,
    ) -> Result<(LoadedResource, Option<Policy>)> {
        // permanent entities still resolve without an inventory
        if let Some(handle) = name.handle() {
            if matches!(TpmHt::of(handle), Some(TpmHt::Pcr) | Some(TpmHt::Permanent)) {
                return Ok((
                    LoadedResource {
                        context: HandleContext::Permanent(
                            crate::resources::PermanentContext::new(handle),
                        ),
                        flush: false,
                    },
                    None,
                ));
            }
        }
        Err(Error::PolicyResourceLoad {
            name: name.clone(),
            source: Box::new(Error::invalid_param("resources", "no resource loader")),
        })
    }

    fn load_policy(&mut self, _name: &Name) -> Result<Option<Policy>> {
        Ok(None)
    }

    fn load_authorized_policies(
        &mut self,
        _key_sign: &Name,
        _policy_ref: &[u8],
    ) -> Result<Vec<Policy>> {
        Ok(Vec::new())
    }

    fn authorize(&mut self, _resource: &mut HandleContext) -> Result<()> {
        Ok(())
    }

    fn sign_authorization(
        &mut self,
        _session_nonce: &[u8],
        _auth_key: &Name,
        _policy_ref: &[u8],
    ) -> Result<PolicySignedAuthorization> {
        Err(Error::invalid_param("resources", "no resource loader"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::super::{PolicyAuthorization, PolicyBuilder};
    use super::*;
    use crate::constants::{tpm_rh, TpmCap, TpmSt, TpmaNv, TpmaObject};
    use crate::crypto;
    use crate::marshal::{CommandBuffer, ResponseBuffer, Unmarshal};
    use crate::packet::AuthCommand;
    use crate::transport::testing::ScriptedTransport;
    use crate::types::{
        PublicId, PublicParams, Tpm2bDigest, TpmsKeyedHashParms, TpmsNvPublic,
        TpmtKeyedHashScheme, TpmtPublic, TpmtSignature,
    };

    const PARENT_AUTH: &[u8] = b"parent-auth";
    const SESSION_NONCE: [u8; 32] = [0x21; 32];
    const RESPONSE_NONCE: [u8; 32] = [0x22; 32];

    fn success_response(tag: TpmSt, body: &[u8]) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_u16(tag.to_u16());
        buf.put_u32(0);
        buf.put_u32(0);
        buf.put_bytes(body);
        let size = buf.len() as u32;
        buf.update_u32(2, size);
        buf.into_vec()
    }

    fn error_response(rc: u32) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_u16(TpmSt::NoSessions.to_u16());
        buf.put_u32(10);
        buf.put_u32(rc);
        buf.into_vec()
    }

    fn keyedhash_public(unique: u8) -> TpmtPublic {
        TpmtPublic {
            object_type: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with(TpmaObject::USER_WITH_AUTH),
            auth_policy: Tpm2bDigest::empty(),
            parameters: PublicParams::KeyedHash(TpmsKeyedHashParms {
                scheme: TpmtKeyedHashScheme::Null,
            }),
            unique: PublicId::KeyedHash(vec![unique; 32]),
        }
    }

    fn transient_object(parent_name: Name) -> TransientResource {
        TransientResource {
            parent_name,
            public: Tpm2bPublic {
                public: keyedhash_public(0xAB),
            },
            private: Tpm2bPrivate::new(vec![0x5D; 32]),
            policy: None,
        }
    }

    struct TrackingAuthorizer {
        calls: Arc<Mutex<usize>>,
    }

    impl Authorizer for TrackingAuthorizer {
        fn authorize(&mut self, resource: &mut HandleContext) -> Result<()> {
            *self.calls.lock().unwrap() += 1;
            resource.set_auth_value(PARENT_AUTH.to_vec());
            Ok(())
        }

        fn sign_authorization(
            &mut self,
            _session_nonce: &[u8],
            _auth_key: &Name,
            _policy_ref: &[u8],
        ) -> Result<PolicySignedAuthorization> {
            Err(Error::invalid_param("authorizer", "signing not supported"))
        }
    }

    fn session_response(handle: Handle) -> Vec<u8> {
        let mut body = CommandBuffer::new();
        body.put_u32(handle);
        body.put_tpm2b(&SESSION_NONCE);
        success_response(TpmSt::NoSessions, body.as_bytes())
    }

    /// The session type requested by a StartAuthSession packet.
    fn session_type_of(packet: &[u8]) -> u8 {
        let mut r = ResponseBuffer::new(&packet[18..]);
        let _nonce_caller = r.get_tpm2b().unwrap();
        let _encrypted_salt = r.get_tpm2b().unwrap();
        r.get_u8().unwrap()
    }

    fn read_public_response(public: &TpmtPublic) -> Vec<u8> {
        let name = public.name().unwrap();
        let mut body = CommandBuffer::new();
        body.put_sized(Some(public));
        body.put_tpm2b(name.as_bytes());
        body.put_tpm2b(name.as_bytes());
        success_response(TpmSt::NoSessions, body.as_bytes())
    }

    /// A TPM2_Load response whose auth HMAC is computed the way the TPM
    /// would, from the caller nonce in the submitted packet.
    fn load_response(object_public: &TpmtPublic, hmac_key: &[u8], packet: &[u8]) -> Vec<u8> {
        let mut r = ResponseBuffer::new(&packet[10..]);
        let _parent_handle = r.get_u32().unwrap();
        let auth_size = r.get_u32().unwrap() as usize;
        let auth_bytes = r.get_bytes(auth_size).unwrap();
        let auth = AuthCommand::from_bytes(&auth_bytes).unwrap();

        let name = object_public.name().unwrap();
        let mut params = CommandBuffer::new();
        params.put_tpm2b(name.as_bytes());

        let rp_hash = crypto::digest(
            TpmAlgId::Sha256,
            &[
                &0u32.to_be_bytes(),
                &TpmCc::Load.to_u32().to_be_bytes(),
                params.as_bytes(),
            ],
        );
        let mac = crypto::hmac(
            TpmAlgId::Sha256,
            hmac_key,
            &[
                &rp_hash,
                &RESPONSE_NONCE,
                &auth.nonce.buffer,
                &[auth.session_attributes.0],
            ],
        );

        let mut body = CommandBuffer::new();
        body.put_u32(0x80000001); // loaded object handle
        body.put_u32(params.len() as u32);
        body.put_bytes(params.as_bytes());
        body.put_tpm2b(&RESPONSE_NONCE);
        body.put_u8(auth.session_attributes.0);
        body.put_tpm2b(&mac);
        success_response(TpmSt::Sessions, body.as_bytes())
    }

    #[test]
    fn permanent_names_resolve_without_a_round_trip() {
        let (transport, log) =
            ScriptedTransport::new(|cc, _| panic!("unexpected command {cc:?}"));
        let mut tpm = TpmContext::new(Box::new(transport));
        let mut resources =
            TpmPolicyResources::new(PolicyResourcesData::default(), NullAuthorizer);

        let (loaded, policy) = resources
            .load_name(&mut tpm, &Name::from_handle(tpm_rh::OWNER))
            .unwrap();
        assert!(!loaded.flush);
        assert!(policy.is_none());
        assert_eq!(loaded.context.handle(), tpm_rh::OWNER);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn load_transient_under_permanent_parent_uses_an_hmac_session() {
        let object = transient_object(Name::from_handle(tpm_rh::OWNER));
        let object_public = object.public.public.clone();
        let object_name = object_public.name().unwrap();

        let (transport, log) = ScriptedTransport::new(move |cc, packet| match cc {
            TpmCc::StartAuthSession => {
                assert_eq!(session_type_of(packet), TpmSe::Hmac as u8);
                session_response(0x02000000)
            }
            TpmCc::Load => load_response(&object_public, PARENT_AUTH, packet),
            TpmCc::FlushContext => success_response(TpmSt::NoSessions, &[]),
            other => panic!("unexpected command {other:?}"),
        });
        let mut tpm = TpmContext::new(Box::new(transport));

        let calls = Arc::new(Mutex::new(0));
        let mut resources = TpmPolicyResources::new(
            PolicyResourcesData {
                transient: vec![object],
                ..Default::default()
            },
            TrackingAuthorizer {
                calls: calls.clone(),
            },
        );

        let (loaded, policy) = resources.load_name(&mut tpm, &object_name).unwrap();
        assert!(loaded.flush);
        assert!(policy.is_none());
        assert_eq!(loaded.context.handle(), 0x80000001);
        assert_eq!(loaded.context.name(), object_name);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[TpmCc::StartAuthSession, TpmCc::Load, TpmCc::FlushContext]
        );
    }

    #[test]
    fn load_transient_executes_the_parent_policy() {
        let parent_public = keyedhash_public(0xC0);
        let parent_name = parent_public.name().unwrap();

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_auth_value();
        let parent_policy = builder.policy().unwrap();

        let object = transient_object(parent_name.clone());
        let object_public = object.public.public.clone();
        let object_name = object_public.name().unwrap();

        let (transport, log) = ScriptedTransport::new(move |cc, packet| match cc {
            TpmCc::ReadPublic => read_public_response(&parent_public),
            TpmCc::StartAuthSession => {
                assert_eq!(session_type_of(packet), TpmSe::Policy as u8);
                session_response(0x03000000)
            }
            TpmCc::PolicyAuthValue => success_response(TpmSt::NoSessions, &[]),
            TpmCc::Load => load_response(&object_public, PARENT_AUTH, packet),
            TpmCc::FlushContext => success_response(TpmSt::NoSessions, &[]),
            other => panic!("unexpected command {other:?}"),
        });
        let mut tpm = TpmContext::new(Box::new(transport));

        let calls = Arc::new(Mutex::new(0));
        let mut resources = TpmPolicyResources::new(
            PolicyResourcesData {
                persistent: vec![PersistentResource {
                    name: parent_name,
                    handle: 0x81000001,
                    policy: Some(parent_policy),
                }],
                transient: vec![object],
                ..Default::default()
            },
            TrackingAuthorizer {
                calls: calls.clone(),
            },
        );

        let (loaded, _) = resources.load_name(&mut tpm, &object_name).unwrap();
        assert!(loaded.flush);
        assert_eq!(loaded.context.name(), object_name);
        // the TPM2_PolicyAuthValue assertion keeps the auth value needed
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                TpmCc::ReadPublic,
                TpmCc::StartAuthSession,
                TpmCc::PolicyAuthValue,
                TpmCc::Load,
                TpmCc::FlushContext,
            ]
        );
    }

    #[test]
    fn load_transient_skips_the_authorizer_when_the_policy_needs_no_auth_value() {
        let parent_public = keyedhash_public(0xC1);
        let parent_name = parent_public.name().unwrap();

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_command_code(TpmCc::Load);
        let parent_policy = builder.policy().unwrap();

        let object = transient_object(parent_name.clone());
        let object_public = object.public.public.clone();
        let object_name = object_public.name().unwrap();

        let (transport, log) = ScriptedTransport::new(move |cc, packet| match cc {
            TpmCc::ReadPublic => read_public_response(&parent_public),
            TpmCc::StartAuthSession => session_response(0x03000000),
            TpmCc::PolicyCommandCode => success_response(TpmSt::NoSessions, &[]),
            // no auth value was folded in, so the session key is empty
            TpmCc::Load => load_response(&object_public, &[], packet),
            TpmCc::FlushContext => success_response(TpmSt::NoSessions, &[]),
            other => panic!("unexpected command {other:?}"),
        });
        let mut tpm = TpmContext::new(Box::new(transport));

        let calls = Arc::new(Mutex::new(0));
        let mut resources = TpmPolicyResources::new(
            PolicyResourcesData {
                persistent: vec![PersistentResource {
                    name: parent_name,
                    handle: 0x81000001,
                    policy: Some(parent_policy),
                }],
                transient: vec![object],
                ..Default::default()
            },
            TrackingAuthorizer {
                calls: calls.clone(),
            },
        );

        let (loaded, _) = resources.load_name(&mut tpm, &object_name).unwrap();
        assert!(loaded.flush);
        assert_eq!(*calls.lock().unwrap(), 0);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                TpmCc::ReadPublic,
                TpmCc::StartAuthSession,
                TpmCc::PolicyCommandCode,
                TpmCc::Load,
                TpmCc::FlushContext,
            ]
        );
    }

    #[test]
    fn load_name_falls_back_to_scanning_tpm_handles() {
        let nv_public = TpmsNvPublic {
            nv_index: 0x018100ff,
            name_alg: TpmAlgId::Sha256,
            attrs: TpmaNv::new().with(TpmaNv::AUTH_READ),
            auth_policy: Tpm2bDigest::empty(),
            size: 8,
        };
        let nv_name = nv_public.name().unwrap();
        let response_name = nv_name.clone();

        let (transport, log) = ScriptedTransport::new(move |cc, packet| match cc {
            TpmCc::GetCapability => {
                let mut r = ResponseBuffer::new(&packet[10..]);
                let _capability = r.get_u32().unwrap();
                let property = r.get_u32().unwrap();
                let handle = if property == TpmHt::Persistent.base_handle() {
                    0x81000005u32
                } else {
                    0x018100ffu32
                };
                let mut body = CommandBuffer::new();
                body.put_u8(0); // moreData
                body.put_u32(TpmCap::Handles as u32);
                body.put_u32(1);
                body.put_u32(handle);
                success_response(TpmSt::NoSessions, body.as_bytes())
            }
            // nothing lives at the persistent handle; the scan skips it
            TpmCc::ReadPublic => error_response(0x18B),
            TpmCc::NvReadPublic => {
                let mut body = CommandBuffer::new();
                body.put_sized(Some(&nv_public));
                body.put_tpm2b(response_name.as_bytes());
                success_response(TpmSt::NoSessions, body.as_bytes())
            }
            other => panic!("unexpected command {other:?}"),
        });
        let mut tpm = TpmContext::new(Box::new(transport));
        let mut resources =
            TpmPolicyResources::new(PolicyResourcesData::default(), NullAuthorizer);

        let (loaded, policy) = resources.load_name(&mut tpm, &nv_name).unwrap();
        assert!(!loaded.flush);
        assert!(policy.is_none());
        assert!(matches!(loaded.context, HandleContext::NvIndex(_)));
        assert_eq!(loaded.context.name(), nv_name);
        assert_eq!(
            log.lock().unwrap().as_slice(),
            &[
                TpmCc::GetCapability,
                TpmCc::GetCapability,
                TpmCc::ReadPublic,
                TpmCc::NvReadPublic,
            ]
        );
    }

    #[test]
    fn unknown_names_report_a_resource_load_error() {
        let (transport, _) = ScriptedTransport::new(move |cc, packet| match cc {
            TpmCc::GetCapability => {
                let mut r = ResponseBuffer::new(&packet[10..]);
                let _capability = r.get_u32().unwrap();
                let mut body = CommandBuffer::new();
                body.put_u8(0);
                body.put_u32(TpmCap::Handles as u32);
                body.put_u32(0);
                success_response(TpmSt::NoSessions, body.as_bytes())
            }
            other => panic!("unexpected command {other:?}"),
        });
        let mut tpm = TpmContext::new(Box::new(transport));
        let mut resources =
            TpmPolicyResources::new(PolicyResourcesData::default(), NullAuthorizer);

        let name = Name::from_digest(TpmAlgId::Sha256, &[0x4D; 32]);
        let err = resources.load_name(&mut tpm, &name).unwrap_err();
        match err {
            Error::PolicyResourceLoad { name: failed, .. } => assert_eq!(failed, name),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn authorized_policies_filter_on_key_and_reference() {
        let key = keyedhash_public(0xD0);
        let key_name = key.name().unwrap();

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_auth_value();
        let mut matching = builder.policy().unwrap();
        matching.add_authorization(PolicyAuthorization {
            auth_key: key.clone(),
            policy_ref: b"ref-a".to_vec(),
            signature: TpmtSignature::Null,
        });

        let mut builder = PolicyBuilder::new();
        builder.root_branch().policy_password();
        let mut other_ref = builder.policy().unwrap();
        other_ref.add_authorization(PolicyAuthorization {
            auth_key: key,
            policy_ref: b"ref-b".to_vec(),
            signature: TpmtSignature::Null,
        });

        let mut resources = TpmPolicyResources::new(
            PolicyResourcesData {
                authorized_policies: vec![matching.clone(), other_ref],
                ..Default::default()
            },
            NullAuthorizer,
        );

        let found = resources
            .load_authorized_policies(&key_name, b"ref-a")
            .unwrap();
        assert_eq!(found, vec![matching]);
        assert!(resources
            .load_authorized_policies(&key_name, b"ref-c")
            .unwrap()
            .is_empty());
    }
}
