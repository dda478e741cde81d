// SPDX-License-Identifier: Apache-2.0

//! The command dispatcher.
//!
//! [`TpmContext`] owns a transport and executes commands against it:
//! assemble the packet, submit with bounded retries on transient
//! warnings, dissect the response and validate its auth area. Commands
//! are built through [`CommandContext`] and completed through
//! [`ResponseContext`], mirroring the two-phase execution model where a
//! caller can hold a response and defer parameter unmarshalling.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::constants::*;
use crate::crypto;
use crate::error::{decode_response_code, Error, Result};
use crate::marshal::{Marshal, ResponseBuffer, Unmarshal};
use crate::packet::{marshal_command_packet, unmarshal_response_packet, AuthResponse};
use crate::resources::{HandleContext, NvIndexContext, ObjectContext, PermanentContext};
use crate::session::{
    derive_session_key, PolicyHmacType, SessionContext, SessionData, SessionParams,
};
use crate::transport::{Transport, DEFAULT_MAX_PACKET_SIZE};
use crate::types::*;

/// TPM properties the dispatcher caches after the first
/// TPM2_GetCapability round trip.
#[derive(Debug, Clone, Copy)]
pub struct TpmProperties {
    pub max_buffer_size: u16,
    pub max_digest_size: u16,
    pub max_nv_buffer_size: u16,
    pub min_pcr_select_size: u8,
}

struct PendingResponse {
    id: u64,
    command_code: TpmCc,
    session_params: SessionParams,
    auth_area: Vec<AuthResponse>,
    rp_bytes: Vec<u8>,
}

/// The main entry point for executing TPM commands over a transport.
///
/// A context is single-threaded: the TPM serializes commands, and command
/// submission on one context is strictly FIFO.
pub struct TpmContext {
    transport: Box<dyn Transport>,
    max_submissions: u32,
    max_response_size: usize,
    properties: Option<TpmProperties>,
    pending: Option<PendingResponse>,
    finalized: Option<(u64, Result<Vec<u8>>)>,
    last_exclusive: Option<Arc<Mutex<SessionData>>>,
    next_response_id: u64,
}

impl TpmContext {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            max_submissions: 5,
            max_response_size: DEFAULT_MAX_PACKET_SIZE,
            properties: None,
            pending: None,
            finalized: None,
            last_exclusive: None,
            next_response_id: 0,
        }
    }

    /// Set the maximum number of submission attempts for a command that
    /// the TPM answers with a retry-class warning. The default is 5.
    pub fn set_max_submissions(&mut self, max: u32) {
        self.max_submissions = max.max(1);
    }

    pub fn close(&mut self) -> Result<()> {
        self.transport.close()
    }

    /// Begin assembling a command.
    pub fn start_command(&mut self, command_code: TpmCc) -> CommandContext<'_> {
        CommandContext {
            tpm: self,
            command_code,
            handles: Vec::new(),
            handle_names: Vec::new(),
            auth_entries: Vec::new(),
            extra_sessions: Vec::new(),
            cp_segments: Vec::new(),
            first_param_sized: None,
        }
    }

    /// Submit a fully serialized command packet and return the raw
    /// response packet. No retry or response validation happens here.
    pub fn run_command_bytes(&mut self, packet: &[u8]) -> Result<Vec<u8>> {
        self.transport.write(packet)?;
        let mut response = vec![0u8; self.max_response_size];
        let n = self.transport.read(&mut response)?;
        response.truncate(n);
        Ok(response)
    }

    fn run_command_raw(
        &mut self,
        command_code: TpmCc,
        handles: &[Handle],
        auth_area: &[crate::packet::AuthCommand],
        cp_bytes: &[u8],
        wants_response_handle: bool,
    ) -> Result<(Option<Handle>, Vec<u8>, Vec<AuthResponse>)> {
        let packet = marshal_command_packet(command_code, handles, auth_area, cp_bytes);

        let mut tries = 0u32;
        loop {
            tries += 1;
            debug!(command = %command_code, len = packet.len(), tries, "submitting command");
            let response = self.run_command_bytes(&packet)?;

            let (rc, payload) =
                unmarshal_response_packet(command_code, &response, wants_response_handle)?;
            match decode_response_code(command_code, rc) {
                Ok(()) => {
                    if payload.auth_area.len() != auth_area.len() {
                        return Err(Error::invalid_response(
                            command_code,
                            format!(
                                "unexpected number of auth responses (got {}, expected {})",
                                payload.auth_area.len(),
                                auth_area.len()
                            ),
                        ));
                    }
                    return Ok((payload.handle, payload.parameters, payload.auth_area));
                }
                Err(err) => {
                    if tries >= self.max_submissions || !err.is_retryable_warning() {
                        return Err(err);
                    }
                    debug!(command = %command_code, %err, "retrying after warning");
                }
            }
        }
    }

    /// Finalize the outstanding response if one is pending: validate its
    /// auth area, update session and exclusive-audit state, and stash the
    /// processed parameter bytes for its [`ResponseContext`].
    fn process_pending_response(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };

        // any newer command ends the previous session's exclusive run;
        // the response attributes re-assert it below if it persists
        if let Some(state) = self.last_exclusive.take() {
            state.lock().expect("session state poisoned").is_exclusive = false;
        }

        let result = pending.session_params.process_response_auth_area(
            pending.command_code,
            &pending.auth_area,
            &mut pending.rp_bytes,
        );

        if result.is_ok() {
            for session in pending.session_params.sessions() {
                if session.is_exclusive() {
                    self.last_exclusive = Some(session.shared_state());
                    break;
                }
            }
        }

        self.finalized = Some((pending.id, result.map(|_| pending.rp_bytes)));
    }

    fn finalize_response(&mut self, id: u64) -> Result<Vec<u8>> {
        if self.pending.as_ref().map(|p| p.id) == Some(id) {
            self.process_pending_response();
        }
        match self.finalized.take() {
            Some((fid, result)) if fid == id => result,
            other => {
                self.finalized = other;
                Err(Error::invalid_param(
                    "response",
                    "response context is stale",
                ))
            }
        }
    }

    // ==================== properties ====================

    /// Fetch the TPM properties the dispatcher depends on. Called
    /// automatically by the chunked NV helpers on first use.
    pub fn init_properties(&mut self) -> Result<TpmProperties> {
        let (_, data) = self.get_capability(
            TpmCap::TpmProperties,
            tpm_pt::FIXED,
            tpm_pt::MAX_PROPERTIES,
        )?;
        let props = match data {
            CapabilityData::TpmProperties(props) => props,
            _ => {
                return Err(Error::invalid_response(
                    TpmCc::GetCapability,
                    "wrong capability data returned",
                ))
            }
        };

        let mut out = TpmProperties {
            max_buffer_size: 0,
            max_digest_size: 0,
            max_nv_buffer_size: 0,
            min_pcr_select_size: 0,
        };
        for prop in props {
            match prop.property {
                tpm_pt::INPUT_BUFFER => out.max_buffer_size = clamp_u16(prop.value),
                tpm_pt::MAX_DIGEST => out.max_digest_size = clamp_u16(prop.value),
                tpm_pt::NV_BUFFER_MAX => out.max_nv_buffer_size = clamp_u16(prop.value),
                tpm_pt::PCR_SELECT_MIN => out.min_pcr_select_size = prop.value.min(255) as u8,
                _ => {}
            }
        }
        if out.max_buffer_size == 0 {
            out.max_buffer_size = 1024;
        }
        if out.max_digest_size == 0 || out.max_nv_buffer_size == 0 || out.min_pcr_select_size == 0 {
            return Err(Error::invalid_response(
                TpmCc::GetCapability,
                "missing buffer-size properties",
            ));
        }
        self.properties = Some(out);
        Ok(out)
    }

    fn properties(&mut self) -> Result<TpmProperties> {
        match self.properties {
            Some(p) => Ok(p),
            None => self.init_properties(),
        }
    }

    // ==================== resource creation ====================

    /// A context for a permanent entity or PCR.
    pub fn permanent_context(&self, handle: Handle) -> PermanentContext {
        PermanentContext::new(handle)
    }

    /// Build a context for an existing TPM resource by querying its
    /// public area. Panics for handle types that cannot be
    /// contextualized this way (permanent entities and PCRs use
    /// [`permanent_context`]); returns [`Error::ResourceUnavailable`]
    /// when nothing lives at the handle.
    ///
    /// [`permanent_context`]: TpmContext::permanent_context
    pub fn new_resource_context(&mut self, handle: Handle) -> Result<HandleContext> {
        let unavailable = |err: Error| match err {
            Error::TpmHandle { .. } => Error::ResourceUnavailable { handle },
            other => other,
        };

        match TpmHt::of(handle) {
            Some(TpmHt::Transient) | Some(TpmHt::Persistent) => {
                let (public, name, _) = self.read_public(handle).map_err(unavailable)?;
                let context = ObjectContext::from_public(handle, public)?;
                if context.name() != name {
                    return Err(Error::invalid_response(
                        TpmCc::ReadPublic,
                        "returned name does not match the public area",
                    ));
                }
                Ok(HandleContext::Object(context))
            }
            Some(TpmHt::NvIndex) => {
                let (public, name) = self.nv_read_public(handle).map_err(unavailable)?;
                let context = NvIndexContext::from_public(public)?;
                if context.name() != name {
                    return Err(Error::invalid_response(
                        TpmCc::NvReadPublic,
                        "returned name does not match the public area",
                    ));
                }
                Ok(HandleContext::NvIndex(context))
            }
            _ => panic!("invalid handle type"),
        }
    }

    // ==================== sessions ====================

    /// TPM2_StartAuthSession. A `tpm_key` salts the session; a `bind`
    /// entity folds its auth value into the session key.
    pub fn start_auth_session(
        &mut self,
        tpm_key: Option<&ObjectContext>,
        bind: Option<&HandleContext>,
        session_type: TpmSe,
        symmetric: Option<TpmtSymDef>,
        auth_hash: TpmAlgId,
    ) -> Result<SessionContext> {
        let digest_size = auth_hash.digest_size();
        if digest_size == 0 {
            return Err(Error::invalid_param(
                "auth_hash",
                format!("unsupported authHash value {auth_hash:?}"),
            ));
        }

        let nonce_caller = crypto::random_bytes(digest_size);

        let (salt, encrypted_salt) = match tpm_key {
            Some(key) => crypto::secret_share(key.public(), crypto::SECRET_LABEL)?,
            None => (Vec::new(), Vec::new()),
        };

        let tpm_key_handle = tpm_key.map_or(tpm_rh::NULL, |k| k.handle());
        let (bind_handle, bind_name, bind_auth) = match bind {
            Some(b) => (b.handle(), Some(b.name()), b.auth_value().to_vec()),
            None => (tpm_rh::NULL, None, Vec::new()),
        };
        let symmetric = symmetric.unwrap_or(TpmtSymDef::Null);

        let session_handle;
        let nonce_tpm;
        {
            let mut cmd = self.start_command(TpmCc::StartAuthSession);
            cmd.add_handle_raw(tpm_key_handle, Name::from_handle(tpm_key_handle));
            cmd.add_handle_raw(bind_handle, Name::from_handle(bind_handle));
            cmd.add_param(&Tpm2bNonce::new(nonce_caller.clone()));
            cmd.add_param(&Tpm2bEncryptedSecret::new(encrypted_salt));
            cmd.add_param(&(session_type as u8));
            cmd.add_param(&symmetric);
            cmd.add_param(&auth_hash.to_u16());
            let (handle, rsp) = cmd.run_with_handle()?;
            session_handle = handle;
            let mut params = rsp.complete(self)?;
            nonce_tpm = params.unmarshal::<Tpm2bNonce>()?.buffer;
            params.finish()?;
        }

        let mut data = SessionData::new(auth_hash, session_type);
        data.nonce_caller = nonce_caller.clone();
        data.nonce_tpm = nonce_tpm.clone();
        data.symmetric = symmetric;
        data.bound_entity = bind_name;
        data.session_key =
            derive_session_key(auth_hash, &bind_auth, &salt, &nonce_tpm, &nonce_caller);

        Ok(SessionContext::new(session_handle, data))
    }

    // ==================== object & context management ====================

    /// TPM2_Startup.
    pub fn startup(&mut self, startup_type: TpmSu) -> Result<()> {
        let mut cmd = self.start_command(TpmCc::Startup);
        cmd.add_param(&(startup_type as u16));
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_GetRandom.
    pub fn get_random(&mut self, bytes: u16) -> Result<Vec<u8>> {
        let mut cmd = self.start_command(TpmCc::GetRandom);
        cmd.add_param(&bytes);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let random = params.unmarshal::<Tpm2bDigest>()?.buffer;
        params.finish()?;
        Ok(random)
    }

    /// TPM2_GetCapability.
    pub fn get_capability(
        &mut self,
        capability: TpmCap,
        property: u32,
        property_count: u32,
    ) -> Result<(bool, CapabilityData)> {
        let mut cmd = self.start_command(TpmCc::GetCapability);
        cmd.add_param(&(capability as u32));
        cmd.add_param(&property);
        cmd.add_param(&property_count);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let more_data = params.unmarshal::<bool>()?;
        let data = params.unmarshal::<CapabilityData>()?;
        params.finish()?;
        Ok((more_data, data))
    }

    /// Enumerate handles of one type via TPM2_GetCapability.
    pub fn get_capability_handles(&mut self, first: Handle, count: u32) -> Result<Vec<Handle>> {
        let mut handles = Vec::new();
        let mut next = first;
        loop {
            let (more, data) = self.get_capability(TpmCap::Handles, next, count)?;
            let batch = match data {
                CapabilityData::Handles(h) => h,
                _ => {
                    return Err(Error::invalid_response(
                        TpmCc::GetCapability,
                        "wrong capability data returned",
                    ))
                }
            };
            let last = batch.last().copied();
            handles.extend(batch);
            if !more {
                break;
            }
            next = match last {
                Some(h) => h + 1,
                None => break,
            };
        }
        Ok(handles)
    }

    /// TPM2_ReadPublic. Returns the public area, name and qualified name.
    pub fn read_public(&mut self, handle: Handle) -> Result<(TpmtPublic, Name, Name)> {
        let mut cmd = self.start_command(TpmCc::ReadPublic);
        cmd.add_handle_raw(handle, Name::from_handle(handle));
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let public = params.unmarshal::<Tpm2bPublic>()?.public;
        let name = params.unmarshal::<Name>()?;
        let qualified_name = params.unmarshal::<Name>()?;
        params.finish()?;
        Ok((public, name, qualified_name))
    }

    /// TPM2_NV_ReadPublic.
    pub fn nv_read_public(&mut self, handle: Handle) -> Result<(TpmsNvPublic, Name)> {
        let mut cmd = self.start_command(TpmCc::NvReadPublic);
        cmd.add_handle_raw(handle, Name::from_handle(handle));
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let public = params.unmarshal::<Tpm2bNvPublic>()?.nv_public;
        let name = params.unmarshal::<Name>()?;
        params.finish()?;
        Ok((public, name))
    }

    /// TPM2_FlushContext.
    pub fn flush_context(&mut self, handle: Handle) -> Result<()> {
        let mut cmd = self.start_command(TpmCc::FlushContext);
        cmd.add_handle_raw(handle, Name::from_handle(handle));
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_ContextSave.
    pub fn context_save(&mut self, context: &HandleContext) -> Result<TpmsContext> {
        let mut cmd = self.start_command(TpmCc::ContextSave);
        cmd.add_handle(context);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let saved = params.unmarshal::<TpmsContext>()?;
        params.finish()?;
        Ok(saved)
    }

    /// TPM2_ContextLoad. Returns the handle the state was reloaded at.
    pub fn context_load(&mut self, context: &TpmsContext) -> Result<Handle> {
        let mut cmd = self.start_command(TpmCc::ContextLoad);
        cmd.add_param(context);
        let (handle, rsp) = cmd.run_with_handle()?;
        rsp.complete(self)?.finish()?;
        Ok(handle)
    }

    /// TPM2_Load: load an object under an authorized parent.
    pub fn load(
        &mut self,
        parent: &HandleContext,
        parent_auth: Option<&SessionContext>,
        private: &Tpm2bPrivate,
        public: &Tpm2bPublic,
    ) -> Result<ObjectContext> {
        let mut cmd = self.start_command(TpmCc::Load);
        cmd.add_resource_with_auth(parent, parent_auth);
        cmd.add_param(private);
        cmd.add_param(public);
        let (handle, rsp) = cmd.run_with_handle()?;
        let mut params = rsp.complete(self)?;
        let name = params.unmarshal::<Name>()?;
        params.finish()?;

        let context = ObjectContext::from_public(handle, public.public.clone())?;
        if context.name() != name {
            return Err(Error::invalid_response(
                TpmCc::Load,
                "returned name does not match the public area",
            ));
        }
        Ok(context)
    }

    /// TPM2_LoadExternal with only a public area.
    pub fn load_external_public(
        &mut self,
        public: &Tpm2bPublic,
        hierarchy: Handle,
    ) -> Result<ObjectContext> {
        let mut cmd = self.start_command(TpmCc::LoadExternal);
        cmd.add_param(&Tpm2bSensitiveData::empty());
        cmd.add_param(public);
        cmd.add_param(&hierarchy);
        let (handle, rsp) = cmd.run_with_handle()?;
        let mut params = rsp.complete(self)?;
        let name = params.unmarshal::<Name>()?;
        params.finish()?;

        let context = ObjectContext::from_public(handle, public.public.clone())?;
        if context.name() != name {
            return Err(Error::invalid_response(
                TpmCc::LoadExternal,
                "returned name does not match the public area",
            ));
        }
        Ok(context)
    }

    /// TPM2_Unseal.
    pub fn unseal(
        &mut self,
        item: &HandleContext,
        auth: Option<&SessionContext>,
    ) -> Result<Vec<u8>> {
        let mut cmd = self.start_command(TpmCc::Unseal);
        cmd.add_resource_with_auth(item, auth);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let data = params.unmarshal::<Tpm2bSensitiveData>()?.buffer;
        params.finish()?;
        Ok(data)
    }

    /// TPM2_EvictControl. Returns the persistent context when making an
    /// object persistent, `None` when evicting one.
    pub fn evict_control(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        object: &ObjectContext,
        persistent_handle: Handle,
    ) -> Result<Option<ObjectContext>> {
        let mut cmd = self.start_command(TpmCc::EvictControl);
        cmd.add_resource_with_auth(auth, auth_session);
        cmd.add_handle_raw(object.handle(), object.name());
        cmd.add_param(&persistent_handle);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()?;

        if TpmHt::of(object.handle()) == Some(TpmHt::Persistent) {
            return Ok(None);
        }
        let mut persistent = object.clone();
        persistent.set_handle(persistent_handle);
        Ok(Some(persistent))
    }

    /// TPM2_PCR_Read.
    pub fn pcr_read(
        &mut self,
        selection: &TpmlPcrSelection,
    ) -> Result<(u32, TpmlPcrSelection, Vec<Vec<u8>>)> {
        let mut cmd = self.start_command(TpmCc::PcrRead);
        cmd.add_param(selection);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let update_counter = params.unmarshal::<u32>()?;
        let selection_out = params.unmarshal::<TpmlPcrSelection>()?;
        let digests = params.unmarshal::<TpmlDigest>()?;
        params.finish()?;
        Ok((
            update_counter,
            selection_out,
            digests.digests.into_iter().map(|d| d.buffer).collect(),
        ))
    }

    /// TPM2_VerifySignature. Returns the verification ticket.
    pub fn verify_signature(
        &mut self,
        key: &HandleContext,
        digest: &[u8],
        signature: &TpmtSignature,
    ) -> Result<TpmtTkVerified> {
        let mut cmd = self.start_command(TpmCc::VerifySignature);
        cmd.add_handle(key);
        cmd.add_param(&Tpm2bDigest::new(digest.to_vec()));
        cmd.add_param(signature);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let ticket = params.unmarshal::<TpmtTkVerified>()?;
        params.finish()?;
        Ok(ticket)
    }

    // ==================== NV data transfer ====================

    fn check_multi_iteration_sessions(
        sessions: &[Option<&SessionContext>],
        iterations: usize,
    ) -> Result<()> {
        if iterations <= 1 {
            return Ok(());
        }
        for session in sessions.iter().flatten() {
            if session.session_type() == TpmSe::Policy {
                return Err(Error::invalid_param(
                    "session",
                    "cannot use a policy session for authorization across multiple commands",
                ));
            }
        }
        Ok(())
    }

    fn nv_read_chunk(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        index: &NvIndexContext,
        size: u16,
        offset: u16,
    ) -> Result<Vec<u8>> {
        let mut cmd = self.start_command(TpmCc::NvRead);
        cmd.add_resource_with_auth(auth, auth_session);
        cmd.add_handle_raw(index.handle(), index.name());
        cmd.add_param(&size);
        cmd.add_param(&offset);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let data = params.unmarshal::<Tpm2bMaxNvBuffer>()?.buffer;
        params.finish()?;
        Ok(data)
    }

    /// TPM2_NV_Read, chunking reads larger than the TPM's NV buffer.
    /// Chunked reads force `continue-session` on every iteration but the
    /// last and reject policy sessions, which cannot span commands.
    pub fn nv_read(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        index: &NvIndexContext,
        size: u16,
        offset: u16,
    ) -> Result<Vec<u8>> {
        let max = self.properties()?.max_nv_buffer_size;
        let iterations = usize::from(size.div_ceil(max.max(1)));
        Self::check_multi_iteration_sessions(&[auth_session], iterations)?;

        let continued =
            auth_session.map(|s| s.include_attrs(TpmaSession::CONTINUE_SESSION));

        let mut data = Vec::with_capacity(usize::from(size));
        let mut remaining = size;
        let mut position = offset;
        while remaining > 0 {
            let chunk = remaining.min(max);
            let last = remaining <= max;
            let session = if last {
                auth_session
            } else {
                continued.as_ref()
            };
            data.extend(self.nv_read_chunk(auth, session, index, chunk, position)?);
            position += chunk;
            remaining -= chunk;
        }
        Ok(data)
    }

    fn nv_write_chunk(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        index: &NvIndexContext,
        data: &[u8],
        offset: u16,
    ) -> Result<()> {
        let mut cmd = self.start_command(TpmCc::NvWrite);
        cmd.add_resource_with_auth(auth, auth_session);
        cmd.add_handle_raw(index.handle(), index.name());
        cmd.add_param(&Tpm2bMaxNvBuffer::new(data.to_vec()));
        cmd.add_param(&offset);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_NV_Write, chunking writes larger than the TPM's NV buffer
    /// under the same session rules as [`nv_read`].
    ///
    /// [`nv_read`]: TpmContext::nv_read
    pub fn nv_write(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        index: &NvIndexContext,
        data: &[u8],
        offset: u16,
    ) -> Result<()> {
        let max = usize::from(self.properties()?.max_nv_buffer_size);
        let iterations = data.len().div_ceil(max.max(1)).max(1);
        Self::check_multi_iteration_sessions(&[auth_session], iterations)?;

        let continued =
            auth_session.map(|s| s.include_attrs(TpmaSession::CONTINUE_SESSION));

        let mut position = usize::from(offset);
        let mut chunks = data.chunks(max.max(1)).peekable();
        loop {
            let Some(chunk) = chunks.next() else { break };
            let last = chunks.peek().is_none();
            let session = if last {
                auth_session
            } else {
                continued.as_ref()
            };
            self.nv_write_chunk(auth, session, index, chunk, position as u16)?;
            position += chunk.len();
        }
        Ok(())
    }

    // ==================== policy assertions ====================

    fn policy_session_command(
        &mut self,
        cc: TpmCc,
        session: &SessionContext,
    ) -> CommandContext<'_> {
        let mut cmd = self.start_command(cc);
        cmd.add_handle_raw(session.handle(), session.name());
        cmd
    }

    /// TPM2_PolicyGetDigest.
    pub fn policy_get_digest(&mut self, session: &SessionContext) -> Result<Vec<u8>> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyGetDigest, session);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let digest = params.unmarshal::<Tpm2bDigest>()?.buffer;
        params.finish()?;
        Ok(digest)
    }

    /// TPM2_PolicyRestart.
    pub fn policy_restart(&mut self, session: &SessionContext) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyRestart, session);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyAuthValue. Flags the session to include the resource's
    /// auth value in subsequent HMAC keys.
    pub fn policy_auth_value(&mut self, session: &SessionContext) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyAuthValue, session);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()?;
        session.data().policy_hmac_type = PolicyHmacType::Auth;
        Ok(())
    }

    /// TPM2_PolicyPassword. Flags the session to send the resource's
    /// auth value in the clear.
    pub fn policy_password(&mut self, session: &SessionContext) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyPassword, session);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()?;
        session.data().policy_hmac_type = PolicyHmacType::Password;
        Ok(())
    }

    /// TPM2_PolicyCommandCode.
    pub fn policy_command_code(&mut self, session: &SessionContext, code: TpmCc) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyCommandCode, session);
        cmd.add_param(&code.to_u32());
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyCounterTimer.
    pub fn policy_counter_timer(
        &mut self,
        session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyCounterTimer, session);
        cmd.add_param(&Tpm2bData::new(operand_b.to_vec()));
        cmd.add_param(&offset);
        cmd.add_param(&operation.to_u16());
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyCpHash.
    pub fn policy_cp_hash(&mut self, session: &SessionContext, cp_hash: &[u8]) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyCpHash, session);
        cmd.add_param(&Tpm2bDigest::new(cp_hash.to_vec()));
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyNameHash.
    pub fn policy_name_hash(&mut self, session: &SessionContext, name_hash: &[u8]) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyNameHash, session);
        cmd.add_param(&Tpm2bDigest::new(name_hash.to_vec()));
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyOR.
    pub fn policy_or(&mut self, session: &SessionContext, digests: &[Vec<u8>]) -> Result<()> {
        if !(2..=8).contains(&digests.len()) {
            return Err(Error::invalid_param(
                "digests",
                "a PolicyOR requires between 2 and 8 branches",
            ));
        }
        let list = TpmlDigest {
            digests: digests
                .iter()
                .map(|d| Tpm2bDigest::new(d.clone()))
                .collect(),
        };
        let mut cmd = self.policy_session_command(TpmCc::PolicyOr, session);
        cmd.add_param(&list);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyPCR.
    pub fn policy_pcr(
        &mut self,
        session: &SessionContext,
        pcr_digest: &[u8],
        pcrs: &TpmlPcrSelection,
    ) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyPcr, session);
        cmd.add_param(&Tpm2bDigest::new(pcr_digest.to_vec()));
        cmd.add_param(pcrs);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyNvWritten.
    pub fn policy_nv_written(&mut self, session: &SessionContext, written: bool) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyNvWritten, session);
        cmd.add_param(&written);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyDuplicationSelect.
    pub fn policy_duplication_select(
        &mut self,
        session: &SessionContext,
        object_name: &Name,
        new_parent_name: &Name,
        include_object: bool,
    ) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyDuplicationSelect, session);
        cmd.add_param(object_name);
        cmd.add_param(new_parent_name);
        cmd.add_param(&include_object);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicySecret. Returns the timeout and the (possibly null)
    /// ticket.
    #[allow(clippy::too_many_arguments)]
    pub fn policy_secret(
        &mut self,
        auth_resource: &HandleContext,
        auth_session: Option<&SessionContext>,
        policy_session: &SessionContext,
        cp_hash: &[u8],
        policy_ref: &[u8],
        expiration: i32,
    ) -> Result<(Tpm2bTimeout, TpmtTkAuth)> {
        let nonce_tpm = policy_session.nonce_tpm();
        let mut cmd = self.start_command(TpmCc::PolicySecret);
        cmd.add_resource_with_auth(auth_resource, auth_session);
        cmd.add_handle_raw(policy_session.handle(), policy_session.name());
        cmd.add_param(&Tpm2bNonce::new(nonce_tpm));
        cmd.add_param(&Tpm2bDigest::new(cp_hash.to_vec()));
        cmd.add_param(&Tpm2bNonce::new(policy_ref.to_vec()));
        cmd.add_param(&expiration);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let timeout = params.unmarshal::<Tpm2bTimeout>()?;
        let ticket = params.unmarshal::<TpmtTkAuth>()?;
        params.finish()?;
        Ok((timeout, ticket))
    }

    /// TPM2_PolicySigned. The signature covers
    /// `H(nonceTPM || expiration || cpHashA || policyRef)`.
    #[allow(clippy::too_many_arguments)]
    pub fn policy_signed(
        &mut self,
        auth_key: &HandleContext,
        policy_session: &SessionContext,
        include_nonce: bool,
        cp_hash: &[u8],
        policy_ref: &[u8],
        expiration: i32,
        signature: &TpmtSignature,
    ) -> Result<(Tpm2bTimeout, TpmtTkAuth)> {
        let nonce_tpm = if include_nonce {
            policy_session.nonce_tpm()
        } else {
            Vec::new()
        };
        let mut cmd = self.start_command(TpmCc::PolicySigned);
        cmd.add_handle(auth_key);
        cmd.add_handle_raw(policy_session.handle(), policy_session.name());
        cmd.add_param(&Tpm2bNonce::new(nonce_tpm));
        cmd.add_param(&Tpm2bDigest::new(cp_hash.to_vec()));
        cmd.add_param(&Tpm2bNonce::new(policy_ref.to_vec()));
        cmd.add_param(&expiration);
        cmd.add_param(signature);
        let rsp = cmd.run()?;
        let mut params = rsp.complete(self)?;
        let timeout = params.unmarshal::<Tpm2bTimeout>()?;
        let ticket = params.unmarshal::<TpmtTkAuth>()?;
        params.finish()?;
        Ok((timeout, ticket))
    }

    /// TPM2_PolicyTicket: re-assert a previous PolicySigned/PolicySecret
    /// result within its validity window.
    #[allow(clippy::too_many_arguments)]
    pub fn policy_ticket(
        &mut self,
        policy_session: &SessionContext,
        timeout: &Tpm2bTimeout,
        cp_hash: &[u8],
        policy_ref: &[u8],
        auth_name: &Name,
        ticket: &TpmtTkAuth,
    ) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyTicket, policy_session);
        cmd.add_param(timeout);
        cmd.add_param(&Tpm2bDigest::new(cp_hash.to_vec()));
        cmd.add_param(&Tpm2bNonce::new(policy_ref.to_vec()));
        cmd.add_param(auth_name);
        cmd.add_param(ticket);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyNV.
    #[allow(clippy::too_many_arguments)]
    pub fn policy_nv(
        &mut self,
        auth: &HandleContext,
        auth_session: Option<&SessionContext>,
        index: &NvIndexContext,
        policy_session: &SessionContext,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> Result<()> {
        let mut cmd = self.start_command(TpmCc::PolicyNv);
        cmd.add_resource_with_auth(auth, auth_session);
        cmd.add_handle_raw(index.handle(), index.name());
        cmd.add_handle_raw(policy_session.handle(), policy_session.name());
        cmd.add_param(&Tpm2bData::new(operand_b.to_vec()));
        cmd.add_param(&offset);
        cmd.add_param(&operation.to_u16());
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }

    /// TPM2_PolicyAuthorize: substitute the session digest with an
    /// authorized policy digest.
    pub fn policy_authorize(
        &mut self,
        policy_session: &SessionContext,
        approved_policy: &[u8],
        policy_ref: &[u8],
        key_sign: &Name,
        check_ticket: &TpmtTkVerified,
    ) -> Result<()> {
        let mut cmd = self.policy_session_command(TpmCc::PolicyAuthorize, policy_session);
        cmd.add_param(&Tpm2bDigest::new(approved_policy.to_vec()));
        cmd.add_param(&Tpm2bNonce::new(policy_ref.to_vec()));
        cmd.add_param(key_sign);
        cmd.add_param(check_ticket);
        let rsp = cmd.run()?;
        rsp.complete(self)?.finish()
    }
}

fn clamp_u16(v: u32) -> u16 {
    v.min(u32::from(u16::MAX)) as u16
}

/// A command under assembly: handles (with their auth sessions),
/// parameters and extra non-auth sessions, in wire order.
pub struct CommandContext<'t> {
    tpm: &'t mut TpmContext,
    command_code: TpmCc,
    handles: Vec<Handle>,
    handle_names: Vec<Name>,
    auth_entries: Vec<(Option<SessionContext>, Name, Vec<u8>)>,
    extra_sessions: Vec<SessionContext>,
    cp_segments: Vec<Vec<u8>>,
    first_param_sized: Option<bool>,
}

impl<'t> CommandContext<'t> {
    /// Add a handle without authorization.
    pub fn add_handle(&mut self, context: &HandleContext) -> &mut Self {
        self.add_handle_raw(context.handle(), context.name())
    }

    pub(crate) fn add_handle_raw(&mut self, handle: Handle, name: Name) -> &mut Self {
        self.handles.push(handle);
        self.handle_names.push(name);
        self
    }

    /// Add a handle that requires authorization. `session == None`
    /// selects passphrase authorization with the resource's auth value.
    pub fn add_resource_with_auth(
        &mut self,
        resource: &HandleContext,
        session: Option<&SessionContext>,
    ) -> &mut Self {
        let name = resource.name();
        self.handles.push(resource.handle());
        self.handle_names.push(name.clone());
        self.auth_entries
            .push((session.cloned(), name, resource.auth_value().to_vec()));
        self
    }

    /// Add sessions that do not authorize anything (audit or parameter
    /// encryption).
    pub fn add_extra_sessions(&mut self, sessions: &[SessionContext]) -> &mut Self {
        self.extra_sessions.extend_from_slice(sessions);
        self
    }

    /// Append a marshalled command parameter.
    pub fn add_param<T: Marshal>(&mut self, value: &T) -> &mut Self {
        if self.first_param_sized.is_none() {
            self.first_param_sized = Some(value.is_sized_buffer());
        }
        self.cp_segments.push(value.to_bytes());
        self
    }

    fn dispatch(self, wants_response_handle: bool) -> Result<(Option<Handle>, ResponseContext)> {
        let CommandContext {
            tpm,
            command_code,
            handles,
            handle_names,
            auth_entries,
            extra_sessions,
            cp_segments,
            first_param_sized,
        } = self;

        let mut session_params = SessionParams::new();
        for (session, name, auth_value) in auth_entries {
            session_params
                .append_session_for_resource(session.as_ref(), name, auth_value)
                .map_err(|e| wrap_param_error(command_code, e))?;
        }
        session_params
            .append_extra_sessions(&extra_sessions)
            .map_err(|e| wrap_param_error(command_code, e))?;

        if session_params.has_decrypt_session() && first_param_sized != Some(true) {
            return Err(Error::invalid_param(
                "sessions",
                format!(
                    "command {command_code} does not support command parameter encryption"
                ),
            ));
        }

        let mut cp_bytes = Vec::new();
        for segment in &cp_segments {
            cp_bytes.extend_from_slice(segment);
        }

        let auth_area =
            session_params.build_command_auth_area(command_code, &handle_names, &mut cp_bytes)?;

        // finalize any response still awaiting completion so its session
        // and audit bookkeeping lands before the next submission
        tpm.process_pending_response();

        let (handle, rp_bytes, rsp_auth_area) = tpm.run_command_raw(
            command_code,
            &handles,
            &auth_area,
            &cp_bytes,
            wants_response_handle,
        )?;

        tpm.next_response_id += 1;
        let id = tpm.next_response_id;
        tpm.pending = Some(PendingResponse {
            id,
            command_code,
            session_params,
            auth_area: rsp_auth_area,
            rp_bytes,
        });

        Ok((
            handle,
            ResponseContext {
                id,
                command_code,
            },
        ))
    }

    /// Execute the command. The response parameters remain pending until
    /// the returned context is completed.
    pub fn run(self) -> Result<ResponseContext> {
        let (_, rsp) = self.dispatch(false)?;
        Ok(rsp)
    }

    /// Execute a command that returns a response handle.
    pub fn run_with_handle(self) -> Result<(Handle, ResponseContext)> {
        let (handle, rsp) = self.dispatch(true)?;
        Ok((handle.expect("dispatch read a response handle"), rsp))
    }
}

fn wrap_param_error(command: TpmCc, err: Error) -> Error {
    match err {
        Error::InvalidParam { name, reason } => Error::InvalidParam {
            name,
            reason: format!("{reason} (command {command})"),
        },
        other => other,
    }
}

/// A response whose auth area has been received but whose parameters the
/// caller has not consumed yet.
#[must_use = "a response context must be completed"]
pub struct ResponseContext {
    id: u64,
    command_code: TpmCc,
}

impl ResponseContext {
    /// Validate the response auth area (if not already auto-finalized)
    /// and hand back the parameter bytes for unmarshalling.
    pub fn complete(self, tpm: &mut TpmContext) -> Result<ResponseParams> {
        let data = tpm.finalize_response(self.id)?;
        Ok(ResponseParams {
            command_code: self.command_code,
            data,
            pos: 0,
        })
    }
}

/// The parameter area of a completed response.
#[derive(Debug)]
pub struct ResponseParams {
    command_code: TpmCc,
    data: Vec<u8>,
    pos: usize,
}

impl ResponseParams {
    /// Unmarshal the next response parameter.
    pub fn unmarshal<T: Unmarshal>(&mut self) -> Result<T> {
        let mut buf = ResponseBuffer::new(&self.data[self.pos..]);
        let value = T::unmarshal(&mut buf).map_err(|e| {
            Error::invalid_response(
                self.command_code,
                format!("cannot unmarshal response parameters: {e}"),
            )
        })?;
        self.pos += buf.position();
        Ok(value)
    }

    /// Assert that every parameter byte was consumed.
    pub fn finish(self) -> Result<()> {
        let remaining = self.data.len() - self.pos;
        if remaining != 0 {
            return Err(Error::invalid_response(
                self.command_code,
                format!("response parameter area contains {remaining} trailing bytes"),
            ));
        }
        Ok(())
    }
}
