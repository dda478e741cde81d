// SPDX-License-Identifier: Apache-2.0

//! Host-side representations of TPM entities.
//!
//! A [`HandleContext`] pairs a handle with the entity's name, plus enough
//! public state to recompute that name. Contexts serialize to a
//! version-tagged byte format so they survive host-process restarts while
//! the TPM holds the actual state.

use crate::constants::{Handle, TpmHt};
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
use crate::session::{SessionContext, SessionData};
use crate::types::{Name, TpmsNvPublic, TpmtPublic};

/// Serialized context magic.
pub const CONTEXT_MAGIC: &[u8; 4] = b"TPM2";
/// Serialized context format version.
pub const CONTEXT_VERSION: u16 = 1;

const KIND_PERMANENT: u8 = 0;
const KIND_OBJECT: u8 = 1;
const KIND_NV_INDEX: u8 = 2;
const KIND_SESSION: u8 = 3;
const KIND_PARTIAL: u8 = 4;

/// A permanent entity (hierarchy handles, PCRs, the lockout authority).
/// Its name is its handle.
#[derive(Debug, Clone)]
pub struct PermanentContext {
    handle: Handle,
    auth_value: Vec<u8>,
}

impl PermanentContext {
    /// Panics if the handle is not a permanent or PCR handle; that is a
    /// programmer error.
    pub fn new(handle: Handle) -> Self {
        match TpmHt::of(handle) {
            Some(TpmHt::Permanent) | Some(TpmHt::Pcr) => {}
            _ => panic!("invalid handle type"),
        }
        Self {
            handle,
            auth_value: Vec::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> Name {
        Name::from_handle(self.handle)
    }
}

/// A transient or persistent object, carrying its public area.
#[derive(Debug, Clone)]
pub struct ObjectContext {
    handle: Handle,
    public: TpmtPublic,
    name: Name,
    auth_value: Vec<u8>,
}

impl ObjectContext {
    pub fn from_public(handle: Handle, public: TpmtPublic) -> Result<Self> {
        match TpmHt::of(handle) {
            Some(TpmHt::Transient) | Some(TpmHt::Persistent) => {}
            _ => {
                return Err(Error::invalid_param(
                    "handle",
                    "not an object handle".to_string(),
                ))
            }
        }
        let name = public.name()?;
        Ok(Self {
            handle,
            public,
            name,
            auth_value: Vec::new(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> Name {
        self.name.clone()
    }

    pub fn public(&self) -> &TpmtPublic {
        &self.public
    }

    /// Rebind this context to a new handle (after ContextLoad or
    /// EvictControl).
    pub(crate) fn set_handle(&mut self, handle: Handle) {
        self.handle = handle;
    }
}

/// An NV index, carrying its public area.
#[derive(Debug, Clone)]
pub struct NvIndexContext {
    public: TpmsNvPublic,
    name: Name,
    auth_value: Vec<u8>,
}

impl NvIndexContext {
    pub fn from_public(public: TpmsNvPublic) -> Result<Self> {
        if TpmHt::of(public.nv_index) != Some(TpmHt::NvIndex) {
            return Err(Error::invalid_param(
                "nv_public",
                "not an NV index handle".to_string(),
            ));
        }
        let name = public.name()?;
        Ok(Self {
            public,
            name,
            auth_value: Vec::new(),
        })
    }

    pub fn handle(&self) -> Handle {
        self.public.nv_index
    }

    pub fn name(&self) -> Name {
        self.name.clone()
    }

    pub fn public(&self) -> &TpmsNvPublic {
        &self.public
    }
}

/// A bare handle whose name is unknown (or is the handle itself). Used
/// for saved contexts and for flushing entities without their public
/// state.
#[derive(Debug, Clone)]
pub struct PartialHandleContext {
    handle: Handle,
}

impl PartialHandleContext {
    /// Panics if the handle type does not admit a handle-only context;
    /// that is a programmer error.
    pub fn new(handle: Handle) -> Self {
        match TpmHt::of(handle) {
            Some(TpmHt::HmacSession) | Some(TpmHt::PolicySession) | Some(TpmHt::Transient) => {}
            _ => panic!("invalid handle type"),
        }
        Self { handle }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn name(&self) -> Name {
        Name::from_handle(self.handle)
    }
}

/// Any host-side TPM entity reference.
#[derive(Debug, Clone)]
pub enum HandleContext {
    Permanent(PermanentContext),
    Object(ObjectContext),
    NvIndex(NvIndexContext),
    Session(SessionContext),
    Partial(PartialHandleContext),
}

impl HandleContext {
    pub fn handle(&self) -> Handle {
        match self {
            HandleContext::Permanent(c) => c.handle(),
            HandleContext::Object(c) => c.handle(),
            HandleContext::NvIndex(c) => c.handle(),
            HandleContext::Session(c) => c.handle(),
            HandleContext::Partial(c) => c.handle(),
        }
    }

    pub fn name(&self) -> Name {
        match self {
            HandleContext::Permanent(c) => c.name(),
            HandleContext::Object(c) => c.name(),
            HandleContext::NvIndex(c) => c.name(),
            HandleContext::Session(c) => c.name(),
            HandleContext::Partial(c) => c.name(),
        }
    }

    pub fn auth_value(&self) -> &[u8] {
        match self {
            HandleContext::Permanent(c) => &c.auth_value,
            HandleContext::Object(c) => &c.auth_value,
            HandleContext::NvIndex(c) => &c.auth_value,
            HandleContext::Session(_) | HandleContext::Partial(_) => &[],
        }
    }

    /// Record the authorization value used when this entity requires
    /// auth. Ignored for sessions and partial contexts, which carry none.
    pub fn set_auth_value(&mut self, value: Vec<u8>) {
        match self {
            HandleContext::Permanent(c) => c.auth_value = value,
            HandleContext::Object(c) => c.auth_value = value,
            HandleContext::NvIndex(c) => c.auth_value = value,
            HandleContext::Session(_) | HandleContext::Partial(_) => {}
        }
    }

    pub fn as_session(&self) -> Option<&SessionContext> {
        match self {
            HandleContext::Session(s) => Some(s),
            _ => None,
        }
    }

    /// Serialize to the stable context format:
    /// `magic || version || kind || handle || nameLen || name || payload`.
    pub fn serialize_to_bytes(&self) -> Vec<u8> {
        let mut buf = CommandBuffer::new();
        buf.put_bytes(CONTEXT_MAGIC);
        buf.put_u16(CONTEXT_VERSION);
        let kind = match self {
            HandleContext::Permanent(_) => KIND_PERMANENT,
            HandleContext::Object(_) => KIND_OBJECT,
            HandleContext::NvIndex(_) => KIND_NV_INDEX,
            HandleContext::Session(_) => KIND_SESSION,
            HandleContext::Partial(_) => KIND_PARTIAL,
        };
        buf.put_u8(kind);
        buf.put_u32(self.handle());
        buf.put_tpm2b(self.name().as_bytes());
        match self {
            HandleContext::Object(c) => c.public.marshal(&mut buf),
            HandleContext::NvIndex(c) => c.public.marshal(&mut buf),
            HandleContext::Session(c) => c.data().marshal(&mut buf),
            HandleContext::Permanent(_) | HandleContext::Partial(_) => {}
        }
        buf.into_vec()
    }

    /// Restore a context serialized with [`serialize_to_bytes`]. The
    /// stored name is cross-checked against the deserialized public
    /// state.
    ///
    /// [`serialize_to_bytes`]: HandleContext::serialize_to_bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut buf = ResponseBuffer::new(data);
        let magic = buf.get_bytes(4)?;
        if magic != CONTEXT_MAGIC {
            return Err(Error::unmarshal("bad context magic"));
        }
        let version = buf.get_u16()?;
        if version != CONTEXT_VERSION {
            return Err(Error::UnsupportedContextVersion { version });
        }
        let kind = buf.get_u8()?;
        let handle = buf.get_u32()?;
        let name = Name::new(buf.get_tpm2b()?);

        let context = match kind {
            KIND_PERMANENT => HandleContext::Permanent(PermanentContext {
                handle,
                auth_value: Vec::new(),
            }),
            KIND_OBJECT => {
                let public = TpmtPublic::unmarshal(&mut buf)?;
                let computed = public.name()?;
                if computed != name {
                    return Err(Error::unmarshal("context name does not match public area"));
                }
                HandleContext::Object(ObjectContext {
                    handle,
                    public,
                    name,
                    auth_value: Vec::new(),
                })
            }
            KIND_NV_INDEX => {
                let public = TpmsNvPublic::unmarshal(&mut buf)?;
                let computed = public.name()?;
                if computed != name {
                    return Err(Error::unmarshal("context name does not match public area"));
                }
                HandleContext::NvIndex(NvIndexContext {
                    public,
                    name,
                    auth_value: Vec::new(),
                })
            }
            KIND_SESSION => {
                let data = SessionData::unmarshal(&mut buf)?;
                HandleContext::Session(SessionContext::new(handle, data))
            }
            KIND_PARTIAL => HandleContext::Partial(PartialHandleContext { handle }),
            other => {
                return Err(Error::unmarshal(format!(
                    "unknown context kind {other}"
                )))
            }
        };

        if buf.remaining() != 0 {
            return Err(Error::unmarshal(format!(
                "{} trailing byte(s) in serialized context",
                buf.remaining()
            )));
        }
        Ok(context)
    }
}

impl From<PermanentContext> for HandleContext {
    fn from(c: PermanentContext) -> Self {
        HandleContext::Permanent(c)
    }
}

impl From<ObjectContext> for HandleContext {
    fn from(c: ObjectContext) -> Self {
        HandleContext::Object(c)
    }
}

impl From<NvIndexContext> for HandleContext {
    fn from(c: NvIndexContext) -> Self {
        HandleContext::NvIndex(c)
    }
}

impl From<SessionContext> for HandleContext {
    fn from(c: SessionContext) -> Self {
        HandleContext::Session(c)
    }
}

impl From<PartialHandleContext> for HandleContext {
    fn from(c: PartialHandleContext) -> Self {
        HandleContext::Partial(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::*;
    use crate::session::SessionData;
    use crate::types::*;

    fn sample_public() -> TpmtPublic {
        TpmtPublic {
            object_type: TpmAlgId::KeyedHash,
            name_alg: TpmAlgId::Sha256,
            object_attributes: TpmaObject::new().with(TpmaObject::USER_WITH_AUTH),
            auth_policy: Tpm2bDigest::empty(),
            parameters: PublicParams::KeyedHash(TpmsKeyedHashParms {
                scheme: TpmtKeyedHashScheme::Null,
            }),
            unique: PublicId::KeyedHash(vec![0xAB; 32]),
        }
    }

    fn sample_nv_public() -> TpmsNvPublic {
        TpmsNvPublic {
            nv_index: 0x018100ff,
            name_alg: TpmAlgId::Sha256,
            attrs: TpmaNv::new()
                .with(TpmaNv::AUTH_READ)
                .with(TpmaNv::AUTH_WRITE),
            auth_policy: Tpm2bDigest::empty(),
            size: 8,
        }
    }

    #[test]
    fn permanent_context_name_is_handle() {
        let ctx = PermanentContext::new(tpm_rh::OWNER);
        assert_eq!(ctx.handle(), tpm_rh::OWNER);
        assert_eq!(ctx.name().as_bytes(), &[0x40, 0x00, 0x00, 0x01]);
    }

    #[test]
    #[should_panic(expected = "invalid handle type")]
    fn permanent_context_rejects_object_handles() {
        PermanentContext::new(0x80000000);
    }

    #[test]
    fn partial_context_name_is_handle() {
        let ctx = PartialHandleContext::new(0x02000001);
        assert_eq!(ctx.name().as_bytes(), &[0x02, 0x00, 0x00, 0x01]);
    }

    #[test]
    #[should_panic(expected = "invalid handle type")]
    fn partial_context_rejects_persistent_handles() {
        PartialHandleContext::new(0x81000000);
    }

    #[test]
    fn object_context_round_trip() {
        let public = sample_public();
        let ctx = ObjectContext::from_public(0x80000001, public.clone()).unwrap();
        let serialized = HandleContext::from(ctx.clone()).serialize_to_bytes();

        let restored = HandleContext::from_bytes(&serialized).unwrap();
        assert_eq!(restored.handle(), 0x80000001);
        assert_eq!(restored.name(), ctx.name());
        match restored {
            HandleContext::Object(o) => assert_eq!(o.public(), &public),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn nv_context_round_trip() {
        let public = sample_nv_public();
        let ctx = NvIndexContext::from_public(public.clone()).unwrap();
        let serialized = HandleContext::from(ctx.clone()).serialize_to_bytes();

        let restored = HandleContext::from_bytes(&serialized).unwrap();
        assert_eq!(restored.handle(), 0x018100ff);
        assert_eq!(restored.name(), ctx.name());
        match restored {
            HandleContext::NvIndex(n) => assert_eq!(n.public(), &public),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn session_context_round_trip() {
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Hmac);
        data.session_key = vec![0x44; 32];
        data.nonce_caller = vec![0x01; 32];
        data.nonce_tpm = vec![0x02; 32];
        let ctx = SessionContext::new(0x02000001, data);

        let serialized = HandleContext::from(ctx.clone()).serialize_to_bytes();
        let restored = HandleContext::from_bytes(&serialized).unwrap();
        assert_eq!(restored.handle(), 0x02000001);
        assert_eq!(restored.name(), ctx.name());
        match restored {
            HandleContext::Session(s) => {
                assert_eq!(s.data().session_key, vec![0x44; 32]);
                assert_eq!(s.data().nonce_caller, vec![0x01; 32]);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn corrupted_context_is_rejected() {
        let ctx = HandleContext::from(PermanentContext::new(tpm_rh::OWNER));
        let mut serialized = ctx.serialize_to_bytes();

        let mut bad_magic = serialized.clone();
        bad_magic[0] = b'X';
        assert!(HandleContext::from_bytes(&bad_magic).is_err());

        let mut bad_version = serialized.clone();
        bad_version[5] = 9;
        match HandleContext::from_bytes(&bad_version).unwrap_err() {
            Error::UnsupportedContextVersion { version } => assert_eq!(version, 9),
            other => panic!("unexpected error: {other:?}"),
        }

        serialized.push(0);
        assert!(HandleContext::from_bytes(&serialized).is_err());
    }

    #[test]
    fn tampered_object_name_is_rejected() {
        let ctx = ObjectContext::from_public(0x80000001, sample_public()).unwrap();
        let mut serialized = HandleContext::from(ctx).serialize_to_bytes();
        // flip one bit inside the stored name
        serialized[15] ^= 1;
        assert!(HandleContext::from_bytes(&serialized).is_err());
    }
}
