// SPDX-License-Identifier: Apache-2.0

//! HMAC and policy session state, per-command auth-area construction and
//! response auth validation, including session-based parameter encryption.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::constants::{tpm_rh, Handle, TpmAlgId, TpmCc, TpmSe, TpmaSession};
use crate::crypto;
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
use crate::packet::{AuthCommand, AuthResponse, MAX_AUTH_ENTRIES};
use crate::types::{Name, Tpm2bAuth, Tpm2bNonce, TpmtSymDef};

/// How a policy session authorizes the resource's auth value, decided by
/// the assertions that were executed in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyHmacType {
    /// No TPM2_PolicyAuthValue / TPM2_PolicyPassword assertion was run.
    NoAuth,
    /// TPM2_PolicyAuthValue: the auth value feeds the session HMAC key.
    Auth,
    /// TPM2_PolicyPassword: the auth value is sent in the clear.
    Password,
}

/// Host-side state of a live session.
#[derive(Debug, Clone)]
pub struct SessionData {
    pub hash_alg: TpmAlgId,
    pub session_type: TpmSe,
    pub policy_hmac_type: PolicyHmacType,
    /// Name of the entity the session was bound to at StartAuthSession.
    pub bound_entity: Option<Name>,
    pub session_key: Vec<u8>,
    pub nonce_caller: Vec<u8>,
    pub nonce_tpm: Vec<u8>,
    /// Parameter-encryption algorithm negotiated at StartAuthSession.
    pub symmetric: TpmtSymDef,
    pub is_audit: bool,
    pub is_exclusive: bool,
}

impl SessionData {
    pub fn new(hash_alg: TpmAlgId, session_type: TpmSe) -> Self {
        Self {
            hash_alg,
            session_type,
            policy_hmac_type: PolicyHmacType::NoAuth,
            bound_entity: None,
            session_key: Vec::new(),
            nonce_caller: Vec::new(),
            nonce_tpm: Vec::new(),
            symmetric: TpmtSymDef::Null,
            is_audit: false,
            is_exclusive: false,
        }
    }

    /// True if the session is bound to the named entity.
    pub fn is_bound_to(&self, name: &Name) -> bool {
        self.bound_entity.as_ref() == Some(name)
    }
}

impl Marshal for SessionData {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(self.hash_alg.to_u16());
        buf.put_u8(self.session_type as u8);
        buf.put_u8(match self.policy_hmac_type {
            PolicyHmacType::NoAuth => 0,
            PolicyHmacType::Auth => 1,
            PolicyHmacType::Password => 2,
        });
        match &self.bound_entity {
            None => buf.put_tpm2b(&[]),
            Some(name) => buf.put_tpm2b(name.as_bytes()),
        }
        buf.put_tpm2b(&self.session_key);
        buf.put_tpm2b(&self.nonce_caller);
        buf.put_tpm2b(&self.nonce_tpm);
        self.symmetric.marshal(buf);
        buf.put_u8(u8::from(self.is_audit));
        buf.put_u8(u8::from(self.is_exclusive));
    }
}

impl Unmarshal for SessionData {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let hash_alg_raw = buf.get_u16()?;
        let hash_alg = TpmAlgId::from_u16(hash_alg_raw)
            .filter(|a| a.is_hash())
            .ok_or_else(|| {
                Error::unmarshal(format!("invalid session hash algorithm 0x{hash_alg_raw:04x}"))
            })?;
        let session_type_raw = buf.get_u8()?;
        let session_type = TpmSe::from_u8(session_type_raw).ok_or_else(|| {
            Error::unmarshal(format!("invalid session type 0x{session_type_raw:02x}"))
        })?;
        let policy_hmac_type = match buf.get_u8()? {
            0 => PolicyHmacType::NoAuth,
            1 => PolicyHmacType::Auth,
            2 => PolicyHmacType::Password,
            other => {
                return Err(Error::unmarshal(format!(
                    "invalid policy hmac type {other}"
                )))
            }
        };
        let bound = buf.get_tpm2b()?;
        let bound_entity = if bound.is_empty() {
            None
        } else {
            Some(Name::new(bound))
        };
        Ok(Self {
            hash_alg,
            session_type,
            policy_hmac_type,
            bound_entity,
            session_key: buf.get_tpm2b()?,
            nonce_caller: buf.get_tpm2b()?,
            nonce_tpm: buf.get_tpm2b()?,
            symmetric: TpmtSymDef::unmarshal(buf)?,
            is_audit: buf.get_u8()? != 0,
            is_exclusive: buf.get_u8()? != 0,
        })
    }
}

/// A handle to a live session on the TPM.
///
/// The mutable session state is shared: clones produced by the attribute
/// combinators refer to the same nonces and audit state, while each clone
/// carries its own per-use attributes.
#[derive(Debug, Clone)]
pub struct SessionContext {
    handle: Handle,
    state: Arc<Mutex<SessionData>>,
    attrs: TpmaSession,
}

impl SessionContext {
    pub fn new(handle: Handle, data: SessionData) -> Self {
        Self {
            handle,
            state: Arc::new(Mutex::new(data)),
            attrs: TpmaSession::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// A session's name is its handle.
    pub fn name(&self) -> Name {
        Name::from_handle(self.handle)
    }

    pub fn attrs(&self) -> TpmaSession {
        self.attrs
    }

    pub fn set_attrs(&mut self, attrs: TpmaSession) {
        self.attrs = attrs;
    }

    /// A clone of this context with the given per-use attributes.
    pub fn with_attrs(&self, attrs: TpmaSession) -> Self {
        let mut c = self.clone();
        c.attrs = attrs;
        c
    }

    /// A clone with extra attribute bits set.
    pub fn include_attrs(&self, bits: u8) -> Self {
        let mut c = self.clone();
        c.attrs = c.attrs.with(bits);
        c
    }

    /// A clone with attribute bits cleared.
    pub fn exclude_attrs(&self, bits: u8) -> Self {
        let mut c = self.clone();
        c.attrs = c.attrs.without(bits);
        c
    }

    pub fn session_type(&self) -> TpmSe {
        self.data().session_type
    }

    pub fn hash_alg(&self) -> TpmAlgId {
        self.data().hash_alg
    }

    pub fn nonce_tpm(&self) -> Vec<u8> {
        self.data().nonce_tpm.clone()
    }

    pub fn is_exclusive(&self) -> bool {
        self.data().is_exclusive
    }

    pub(crate) fn data(&self) -> MutexGuard<'_, SessionData> {
        self.state.lock().expect("session state poisoned")
    }

    pub(crate) fn shared_state(&self) -> Arc<Mutex<SessionData>> {
        self.state.clone()
    }
}

/// One entry of a command's auth area under construction. `session ==
/// None` denotes the password pseudo-session (`TPM_RS_PW`).
#[derive(Clone)]
pub(crate) struct SessionParam {
    pub session: Option<SessionContext>,
    pub resource_name: Option<Name>,
    pub auth_value: Vec<u8>,
}

impl SessionParam {
    fn attrs(&self) -> TpmaSession {
        match &self.session {
            // the password pseudo-session always continues
            None => TpmaSession::new().with(TpmaSession::CONTINUE_SESSION),
            Some(s) => s.attrs(),
        }
    }

    /// The HMAC key for this entry: the session key, with the resource's
    /// auth value appended unless the session is bound to that resource.
    /// Policy sessions append the auth value only after a
    /// TPM2_PolicyAuthValue assertion.
    fn hmac_key(&self) -> Vec<u8> {
        let session = match &self.session {
            Some(s) => s,
            None => return self.auth_value.clone(),
        };
        let data = session.data();
        let mut key = data.session_key.clone();
        let include_auth_value = match data.session_type {
            TpmSe::Policy | TpmSe::Trial => data.policy_hmac_type == PolicyHmacType::Auth,
            TpmSe::Hmac => match &self.resource_name {
                Some(name) => !data.is_bound_to(name),
                None => false,
            },
        };
        if include_auth_value {
            key.extend_from_slice(&self.auth_value);
        }
        key
    }

    fn is_password_like(&self) -> bool {
        match &self.session {
            None => true,
            Some(s) => {
                let data = s.data();
                matches!(data.session_type, TpmSe::Policy)
                    && data.policy_hmac_type == PolicyHmacType::Password
            }
        }
    }
}

/// The auth sessions of one command, in handle order, followed by any
/// extra (non-auth) sessions.
pub(crate) struct SessionParams {
    sessions: Vec<SessionParam>,
    /// Number of leading entries that authorize a resource.
    auth_count: usize,
}

impl SessionParams {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            auth_count: 0,
        }
    }

    pub fn sessions(&self) -> impl Iterator<Item = &SessionContext> {
        self.sessions.iter().filter_map(|p| p.session.as_ref())
    }

    fn push(&mut self, param: SessionParam) -> Result<()> {
        if self.sessions.len() >= MAX_AUTH_ENTRIES {
            return Err(Error::invalid_param(
                "sessions",
                "too many auth sessions for one command",
            ));
        }
        self.sessions.push(param);
        Ok(())
    }

    /// Append the auth entry for a resource. `session == None` selects
    /// passphrase authorization.
    pub fn append_session_for_resource(
        &mut self,
        session: Option<&SessionContext>,
        resource_name: Name,
        auth_value: Vec<u8>,
    ) -> Result<()> {
        if self.auth_count != self.sessions.len() {
            return Err(Error::invalid_param(
                "sessions",
                "auth sessions must precede extra sessions",
            ));
        }
        self.push(SessionParam {
            session: session.cloned(),
            resource_name: Some(resource_name),
            auth_value,
        })?;
        self.auth_count += 1;
        Ok(())
    }

    /// Append sessions that do not authorize a resource (audit or
    /// encryption only).
    pub fn append_extra_sessions(&mut self, sessions: &[SessionContext]) -> Result<()> {
        for session in sessions {
            self.push(SessionParam {
                session: Some(session.clone()),
                resource_name: None,
                auth_value: Vec::new(),
            })?;
        }
        Ok(())
    }

    pub fn has_decrypt_session(&self) -> bool {
        self.sessions
            .iter()
            .any(|p| p.attrs().contains(TpmaSession::DECRYPT))
    }

    fn find_single(&self, bit: u8, what: &'static str) -> Result<Option<&SessionParam>> {
        let mut found = None;
        for param in &self.sessions {
            if !param.attrs().contains(bit) {
                continue;
            }
            if param.session.is_none() {
                return Err(Error::invalid_param(
                    "sessions",
                    format!("the password session cannot {what}"),
                ));
            }
            if found.is_some() {
                return Err(Error::invalid_param(
                    "sessions",
                    format!("only one session can {what} per command"),
                ));
            }
            found = Some(param);
        }
        Ok(found)
    }

    fn compute_cp_hash(alg: TpmAlgId, cc: TpmCc, handle_names: &[Name], cp_bytes: &[u8]) -> Vec<u8> {
        let mut chunks: Vec<&[u8]> = Vec::with_capacity(handle_names.len() + 2);
        let cc_bytes = cc.to_u32().to_be_bytes();
        chunks.push(&cc_bytes);
        for name in handle_names {
            chunks.push(name.as_bytes());
        }
        chunks.push(cp_bytes);
        crypto::digest(alg, &chunks)
    }

    fn compute_rp_hash(alg: TpmAlgId, cc: TpmCc, rp_bytes: &[u8]) -> Vec<u8> {
        crypto::digest(
            alg,
            &[&0u32.to_be_bytes(), &cc.to_u32().to_be_bytes(), rp_bytes],
        )
    }

    /// Derive the parameter-encryption key stream for a session and apply
    /// it to the sized first parameter in `param_area`.
    fn apply_param_cipher(
        param: &SessionParam,
        nonce_newer: &[u8],
        nonce_older: &[u8],
        param_area: &mut [u8],
        decrypt: bool,
    ) -> Result<()> {
        let session = param
            .session
            .as_ref()
            .expect("checked by find_single");
        let (hash_alg, symmetric) = {
            let data = session.data();
            (data.hash_alg, data.symmetric)
        };
        let key_material = param.hmac_key();

        if param_area.len() < 2 {
            return Err(Error::invalid_param(
                "parameters",
                "no sized leading parameter to encrypt",
            ));
        }
        let size = u16::from_be_bytes([param_area[0], param_area[1]]) as usize;
        if param_area.len() < 2 + size {
            return Err(Error::invalid_param(
                "parameters",
                "sized leading parameter is truncated",
            ));
        }
        let payload = &mut param_area[2..2 + size];

        match symmetric {
            TpmtSymDef::Xor { hash_alg: xor_alg } => {
                crypto::xor_obfuscate(xor_alg, &key_material, nonce_newer, nonce_older, payload);
                Ok(())
            }
            TpmtSymDef::Sym {
                algorithm,
                key_bits,
                mode,
            } => {
                if mode != TpmAlgId::Cfb {
                    return Err(Error::invalid_param(
                        "symmetric",
                        format!("unsupported parameter encryption mode {mode:?}"),
                    ));
                }
                let key_bytes = usize::from(key_bits) / 8;
                let block_bits = algorithm.block_size() * 8;
                let stream = crypto::kdf_a(
                    hash_alg,
                    &key_material,
                    crypto::CFB_LABEL,
                    nonce_newer,
                    nonce_older,
                    usize::from(key_bits) + block_bits,
                );
                let (key, iv) = stream.split_at(key_bytes);
                if decrypt {
                    crypto::sym_decrypt(algorithm, key, iv, payload)
                } else {
                    crypto::sym_encrypt(algorithm, key, iv, payload)
                }
            }
            TpmtSymDef::Null => Err(Error::invalid_param(
                "symmetric",
                "session has no symmetric algorithm for parameter encryption",
            )),
        }
    }

    /// Build the command auth area. Refreshes caller nonces, applies
    /// command parameter encryption in place, and computes the per-entry
    /// HMACs.
    pub fn build_command_auth_area(
        &mut self,
        cc: TpmCc,
        handle_names: &[Name],
        cp_bytes: &mut [u8],
    ) -> Result<Vec<AuthCommand>> {
        // nonces roll before key derivation so the encryption stream is
        // fresh for this use
        for param in &self.sessions {
            if let Some(session) = &param.session {
                let mut data = session.data();
                let size = data.hash_alg.digest_size();
                data.nonce_caller = crypto::random_bytes(size);
            }
        }

        if let Some(param) = self.find_single(TpmaSession::DECRYPT, "decrypt parameters")? {
            let session = param.session.as_ref().expect("checked by find_single");
            let (nonce_caller, nonce_tpm) = {
                let data = session.data();
                (data.nonce_caller.clone(), data.nonce_tpm.clone())
            };
            Self::apply_param_cipher(param, &nonce_caller, &nonce_tpm, cp_bytes, false)?;
        }
        // the encrypt session is validated here; the stream is applied to
        // the response parameters later
        self.find_single(TpmaSession::ENCRYPT, "encrypt parameters")?;

        let mut auth_area = Vec::with_capacity(self.sessions.len());
        for param in &self.sessions {
            let attrs = param.attrs();
            let auth = match &param.session {
                None => AuthCommand {
                    session_handle: tpm_rh::PW,
                    nonce: Tpm2bNonce::empty(),
                    session_attributes: attrs,
                    hmac: Tpm2bAuth::new(param.auth_value.clone()),
                },
                Some(session) => {
                    let (hash_alg, nonce_caller, nonce_tpm) = {
                        let data = session.data();
                        (
                            data.hash_alg,
                            data.nonce_caller.clone(),
                            data.nonce_tpm.clone(),
                        )
                    };
                    let hmac = if param.is_password_like() {
                        param.auth_value.clone()
                    } else {
                        let cp_hash = Self::compute_cp_hash(hash_alg, cc, handle_names, cp_bytes);
                        crypto::hmac(
                            hash_alg,
                            &param.hmac_key(),
                            &[&cp_hash, &nonce_caller, &nonce_tpm, &[attrs.0]],
                        )
                    };
                    AuthCommand {
                        session_handle: session.handle(),
                        nonce: Tpm2bNonce::new(nonce_caller),
                        session_attributes: attrs,
                        hmac: Tpm2bAuth::new(hmac),
                    }
                }
            };
            auth_area.push(auth);
        }
        Ok(auth_area)
    }

    /// Validate the response auth area against this command's sessions:
    /// recompute each expected HMAC, track nonces and audit state, and
    /// decrypt the leading response parameter when an encrypt session was
    /// used.
    pub fn process_response_auth_area(
        &mut self,
        cc: TpmCc,
        auth_responses: &[AuthResponse],
        rp_bytes: &mut [u8],
    ) -> Result<()> {
        if auth_responses.len() != self.sessions.len() {
            return Err(Error::invalid_response(
                cc,
                format!(
                    "unexpected number of auth responses (got {}, expected {})",
                    auth_responses.len(),
                    self.sessions.len()
                ),
            ));
        }

        for (index, (param, auth)) in self.sessions.iter().zip(auth_responses).enumerate() {
            let attrs = auth.session_attributes;
            match &param.session {
                None => {
                    if !auth.hmac.is_empty() {
                        return Err(Error::invalid_response(
                            cc,
                            format!("unexpected HMAC in password auth response {index}"),
                        ));
                    }
                }
                Some(session) => {
                    let (hash_alg, nonce_caller) = {
                        let mut data = session.data();
                        data.nonce_tpm = auth.nonce.buffer.clone();
                        (data.hash_alg, data.nonce_caller.clone())
                    };
                    if param.is_password_like() {
                        if !auth.hmac.is_empty() {
                            return Err(Error::invalid_response(
                                cc,
                                format!("unexpected HMAC in password auth response {index}"),
                            ));
                        }
                    } else if session.session_type() != TpmSe::Trial {
                        let rp_hash = Self::compute_rp_hash(hash_alg, cc, rp_bytes);
                        let expected = crypto::hmac(
                            hash_alg,
                            &param.hmac_key(),
                            &[&rp_hash, &auth.nonce.buffer, &nonce_caller, &[attrs.0]],
                        );
                        if !crypto::verify_mac(&expected, &auth.hmac.buffer) {
                            return Err(Error::invalid_response(
                                cc,
                                format!("incorrect HMAC in auth response {index}"),
                            ));
                        }
                    }

                    let mut data = session.data();
                    data.is_audit = attrs.contains(TpmaSession::AUDIT);
                    data.is_exclusive = attrs.contains(TpmaSession::AUDIT_EXCLUSIVE);
                }
            }
        }

        if let Some(param) = self.find_single(TpmaSession::ENCRYPT, "encrypt parameters")? {
            let session = param.session.as_ref().expect("checked by find_single");
            let (nonce_caller, nonce_tpm) = {
                let data = session.data();
                (data.nonce_caller.clone(), data.nonce_tpm.clone())
            };
            Self::apply_param_cipher(param, &nonce_tpm, &nonce_caller, rp_bytes, true)?;
        }

        Ok(())
    }
}

/// Derive a session key from the bind entity's auth value and the salt:
/// `KDFa(alg, authValue || salt, "ATH", nonceTPM, nonceCaller, bits)`.
/// Unbound, unsalted sessions have no session key.
pub(crate) fn derive_session_key(
    alg: TpmAlgId,
    bind_auth: &[u8],
    salt: &[u8],
    nonce_tpm: &[u8],
    nonce_caller: &[u8],
) -> Vec<u8> {
    if bind_auth.is_empty() && salt.is_empty() {
        return Vec::new();
    }
    let mut key = Vec::with_capacity(bind_auth.len() + salt.len());
    key.extend_from_slice(bind_auth);
    key.extend_from_slice(salt);
    crypto::kdf_a(
        alg,
        &key,
        crypto::SESSION_KEY_LABEL,
        nonce_tpm,
        nonce_caller,
        alg.digest_size() * 8,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hmac_session(bound: Option<Name>) -> SessionContext {
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Hmac);
        data.session_key = vec![0x5A; 32];
        data.nonce_caller = vec![0x01; 32];
        data.nonce_tpm = vec![0x02; 32];
        data.bound_entity = bound;
        SessionContext::new(0x02000000, data)
    }

    #[test]
    fn session_data_round_trip() {
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Policy);
        data.policy_hmac_type = PolicyHmacType::Auth;
        data.bound_entity = Some(Name::from_handle(tpm_rh::OWNER));
        data.session_key = vec![1, 2, 3];
        data.nonce_caller = vec![4; 32];
        data.nonce_tpm = vec![5; 32];
        data.symmetric = TpmtSymDef::aes_128_cfb();
        data.is_audit = true;

        let bytes = data.to_bytes();
        let decoded = SessionData::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.hash_alg, data.hash_alg);
        assert_eq!(decoded.session_type, data.session_type);
        assert_eq!(decoded.policy_hmac_type, data.policy_hmac_type);
        assert_eq!(decoded.bound_entity, data.bound_entity);
        assert_eq!(decoded.session_key, data.session_key);
        assert_eq!(decoded.nonce_caller, data.nonce_caller);
        assert_eq!(decoded.nonce_tpm, data.nonce_tpm);
        assert_eq!(decoded.symmetric, data.symmetric);
        assert_eq!(decoded.is_audit, data.is_audit);
        assert_eq!(decoded.is_exclusive, data.is_exclusive);
    }

    #[test]
    fn hmac_key_bound_and_unbound() {
        let bound_name = Name::from_digest(TpmAlgId::Sha256, &[0xAA; 32]);
        let other_name = Name::from_digest(TpmAlgId::Sha256, &[0xBB; 32]);
        let session = hmac_session(Some(bound_name.clone()));

        // authorizing the bound resource: hmacKey == sessionKey
        let bound_param = SessionParam {
            session: Some(session.clone()),
            resource_name: Some(bound_name),
            auth_value: b"secret".to_vec(),
        };
        assert_eq!(bound_param.hmac_key(), vec![0x5A; 32]);

        // authorizing another resource: hmacKey == sessionKey || authValue
        let unbound_param = SessionParam {
            session: Some(session),
            resource_name: Some(other_name),
            auth_value: b"secret".to_vec(),
        };
        let mut expected = vec![0x5A; 32];
        expected.extend_from_slice(b"secret");
        assert_eq!(unbound_param.hmac_key(), expected);
    }

    #[test]
    fn policy_session_hmac_key_follows_policy_auth_value() {
        let name = Name::from_digest(TpmAlgId::Sha256, &[0xAA; 32]);
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Policy);
        data.session_key = vec![0x11; 32];
        let session = SessionContext::new(0x03000000, data);

        let mut param = SessionParam {
            session: Some(session.clone()),
            resource_name: Some(name),
            auth_value: b"pw".to_vec(),
        };
        assert_eq!(param.hmac_key(), vec![0x11; 32]);

        session.data().policy_hmac_type = PolicyHmacType::Auth;
        let mut expected = vec![0x11; 32];
        expected.extend_from_slice(b"pw");
        param.auth_value = b"pw".to_vec();
        assert_eq!(param.hmac_key(), expected);
    }

    #[test]
    fn password_auth_entry() {
        let mut params = SessionParams::new();
        params
            .append_session_for_resource(
                None,
                Name::from_handle(tpm_rh::OWNER),
                b"ownerauth".to_vec(),
            )
            .unwrap();

        let mut cp = Vec::new();
        let auth_area = params
            .build_command_auth_area(TpmCc::NvRead, &[Name::from_handle(tpm_rh::OWNER)], &mut cp)
            .unwrap();
        assert_eq!(auth_area.len(), 1);
        assert_eq!(auth_area[0].session_handle, tpm_rh::PW);
        assert!(auth_area[0].nonce.is_empty());
        assert!(auth_area[0]
            .session_attributes
            .contains(TpmaSession::CONTINUE_SESSION));
        assert_eq!(auth_area[0].hmac.buffer, b"ownerauth".to_vec());
    }

    #[test]
    fn hmac_auth_entry_verifies_round_trip() {
        let resource_name = Name::from_digest(TpmAlgId::Sha256, &[0xCC; 32]);
        let session = hmac_session(None).include_attrs(TpmaSession::CONTINUE_SESSION);

        let mut params = SessionParams::new();
        params
            .append_session_for_resource(Some(&session), resource_name.clone(), b"auth".to_vec())
            .unwrap();

        let mut cp_bytes = b"\x00\x04abcd".to_vec();
        let auth_area = params
            .build_command_auth_area(TpmCc::Unseal, &[resource_name], &mut cp_bytes)
            .unwrap();
        assert_eq!(auth_area.len(), 1);
        assert_eq!(auth_area[0].session_handle, 0x02000000);
        assert_eq!(auth_area[0].nonce.len(), 32);
        assert_eq!(auth_area[0].hmac.len(), 32);

        // fabricate the TPM's response auth the way the TPM would
        let nonce_tpm = vec![0x77; 32];
        let mut rp_bytes = b"\x00\x03xyz".to_vec();
        let rp_hash = SessionParams::compute_rp_hash(TpmAlgId::Sha256, TpmCc::Unseal, &rp_bytes);
        let hmac_key = {
            let mut k = vec![0x5A; 32];
            k.extend_from_slice(b"auth");
            k
        };
        let attrs = TpmaSession::new().with(TpmaSession::CONTINUE_SESSION);
        let nonce_caller = session.data().nonce_caller.clone();
        let mac = crypto::hmac(
            TpmAlgId::Sha256,
            &hmac_key,
            &[&rp_hash, &nonce_tpm, &nonce_caller, &[attrs.0]],
        );
        let response = AuthResponse {
            nonce: Tpm2bNonce::new(nonce_tpm.clone()),
            session_attributes: attrs,
            hmac: Tpm2bAuth::new(mac),
        };

        params
            .process_response_auth_area(TpmCc::Unseal, &[response], &mut rp_bytes)
            .unwrap();
        assert_eq!(session.data().nonce_tpm, nonce_tpm);
    }

    #[test]
    fn bad_response_hmac_is_rejected() {
        let resource_name = Name::from_digest(TpmAlgId::Sha256, &[0xCC; 32]);
        let session = hmac_session(None);

        let mut params = SessionParams::new();
        params
            .append_session_for_resource(Some(&session), resource_name.clone(), Vec::new())
            .unwrap();

        let mut cp_bytes = Vec::new();
        params
            .build_command_auth_area(TpmCc::Unseal, &[resource_name], &mut cp_bytes)
            .unwrap();

        let response = AuthResponse {
            nonce: Tpm2bNonce::new(vec![0x77; 32]),
            session_attributes: TpmaSession::new(),
            hmac: Tpm2bAuth::new(vec![0xFF; 32]),
        };
        let mut rp_bytes = Vec::new();
        let err = params
            .process_response_auth_area(TpmCc::Unseal, &[response], &mut rp_bytes)
            .unwrap_err();
        assert!(err.to_string().contains("incorrect HMAC"));
    }

    #[test]
    fn only_one_decrypt_session_permitted() {
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Hmac);
        data.symmetric = TpmtSymDef::aes_128_cfb();
        data.nonce_caller = vec![0; 32];
        data.nonce_tpm = vec![0; 32];
        let s1 = SessionContext::new(0x02000000, data.clone()).include_attrs(TpmaSession::DECRYPT);
        let s2 = SessionContext::new(0x02000001, data).include_attrs(TpmaSession::DECRYPT);

        let mut params = SessionParams::new();
        params
            .append_session_for_resource(Some(&s1), Name::from_handle(tpm_rh::OWNER), Vec::new())
            .unwrap();
        params.append_extra_sessions(&[s2]).unwrap();

        let mut cp_bytes = b"\x00\x01x".to_vec();
        let err = params
            .build_command_auth_area(TpmCc::Unseal, &[], &mut cp_bytes)
            .unwrap_err();
        assert!(err.to_string().contains("only one session"));
    }

    #[test]
    fn command_parameter_encryption_changes_only_payload() {
        let mut data = SessionData::new(TpmAlgId::Sha256, TpmSe::Hmac);
        data.symmetric = TpmtSymDef::aes_128_cfb();
        data.session_key = vec![0x42; 32];
        data.nonce_caller = vec![0; 32];
        data.nonce_tpm = vec![0x13; 32];
        let session = SessionContext::new(0x02000000, data)
            .include_attrs(TpmaSession::CONTINUE_SESSION | TpmaSession::DECRYPT);

        let mut params = SessionParams::new();
        params
            .append_session_for_resource(
                Some(&session),
                Name::from_handle(tpm_rh::OWNER),
                Vec::new(),
            )
            .unwrap();

        let plaintext = b"\x00\x08password".to_vec();
        let mut cp_bytes = plaintext.clone();
        params
            .build_command_auth_area(TpmCc::Unseal, &[], &mut cp_bytes)
            .unwrap();

        // the size prefix stays in the clear, the payload changes
        assert_eq!(&cp_bytes[..2], &plaintext[..2]);
        assert_ne!(&cp_bytes[2..], &plaintext[2..]);

        // the inverse stream restores the payload
        let nonce_caller = session.data().nonce_caller.clone();
        let stream = crypto::kdf_a(
            TpmAlgId::Sha256,
            &vec![0x42; 32],
            crypto::CFB_LABEL,
            &nonce_caller,
            &vec![0x13; 32],
            128 + 128,
        );
        let (key, iv) = stream.split_at(16);
        crypto::sym_decrypt(TpmAlgId::Aes, key, iv, &mut cp_bytes[2..]).unwrap();
        assert_eq!(cp_bytes, plaintext);
    }

    #[test]
    fn session_key_derivation_inputs() {
        assert!(derive_session_key(TpmAlgId::Sha256, &[], &[], &[0; 32], &[1; 32]).is_empty());

        let with_bind = derive_session_key(TpmAlgId::Sha256, b"auth", &[], &[0; 32], &[1; 32]);
        assert_eq!(with_bind.len(), 32);

        // authValue || salt keying: bind+salt differs from bind alone
        let with_salt = derive_session_key(
            TpmAlgId::Sha256,
            b"auth",
            &[0xEE; 32],
            &[0; 32],
            &[1; 32],
        );
        assert_eq!(with_salt.len(), 32);
        assert_ne!(with_bind, with_salt);
    }

    #[test]
    fn attribute_combinators() {
        let session = hmac_session(None);
        let with = session.with_attrs(TpmaSession::new().with(TpmaSession::AUDIT));
        assert_eq!(session.attrs(), TpmaSession::new());
        assert!(with.attrs().contains(TpmaSession::AUDIT));

        let included = with.include_attrs(TpmaSession::CONTINUE_SESSION);
        assert!(included.attrs().contains(TpmaSession::AUDIT));
        assert!(included.attrs().contains(TpmaSession::CONTINUE_SESSION));

        let excluded = included.exclude_attrs(TpmaSession::AUDIT);
        assert!(!excluded.attrs().contains(TpmaSession::AUDIT));
        assert!(excluded.attrs().contains(TpmaSession::CONTINUE_SESSION));
    }
}
