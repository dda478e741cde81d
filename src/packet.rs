// SPDX-License-Identifier: Apache-2.0

//! Command and response packet assembly and dissection.
//!
//! A command packet is `tag || commandSize || commandCode || handles ||
//! [authSize || authArea] || parameters`; the tag is `TPM_ST_SESSIONS`
//! exactly when an auth area is present. Response packets mirror this
//! shape. The number of handles in either direction is per-command
//! knowledge supplied by the caller.

use crate::constants::{Handle, TpmCc, TpmSt, TpmaSession};
use crate::error::{Error, Result};
use crate::marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
use crate::types::{Tpm2bAuth, Tpm2bNonce};

/// The TPM permits at most three auth entries per direction.
pub const MAX_AUTH_ENTRIES: usize = 3;

/// One command auth-area entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthCommand {
    pub session_handle: Handle,
    pub nonce: Tpm2bNonce,
    pub session_attributes: TpmaSession,
    pub hmac: Tpm2bAuth,
}

impl Marshal for AuthCommand {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.session_handle);
        self.nonce.marshal(buf);
        buf.put_u8(self.session_attributes.0);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for AuthCommand {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            session_handle: buf.get_u32()?,
            nonce: Tpm2bNonce::unmarshal(buf)?,
            session_attributes: TpmaSession(buf.get_u8()?),
            hmac: Tpm2bAuth::unmarshal(buf)?,
        })
    }
}

/// One response auth-area entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthResponse {
    pub nonce: Tpm2bNonce,
    pub session_attributes: TpmaSession,
    pub hmac: Tpm2bAuth,
}

impl Marshal for AuthResponse {
    fn marshal(&self, buf: &mut CommandBuffer) {
        self.nonce.marshal(buf);
        buf.put_u8(self.session_attributes.0);
        self.hmac.marshal(buf);
    }
}

impl Unmarshal for AuthResponse {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            nonce: Tpm2bNonce::unmarshal(buf)?,
            session_attributes: TpmaSession(buf.get_u8()?),
            hmac: Tpm2bAuth::unmarshal(buf)?,
        })
    }
}

/// Serialize a complete command packet. The handles and parameters must
/// already be in wire form.
pub fn marshal_command_packet(
    command: TpmCc,
    handles: &[Handle],
    auth_area: &[AuthCommand],
    cp_bytes: &[u8],
) -> Vec<u8> {
    assert!(
        auth_area.len() <= MAX_AUTH_ENTRIES,
        "too many auth entries for a command"
    );

    let tag = if auth_area.is_empty() {
        TpmSt::NoSessions
    } else {
        TpmSt::Sessions
    };

    let mut buf = CommandBuffer::with_capacity(64 + cp_bytes.len());
    buf.put_u16(tag.to_u16());
    buf.put_u32(0); // commandSize, backpatched below
    buf.put_u32(command.to_u32());
    for handle in handles {
        buf.put_u32(*handle);
    }
    if !auth_area.is_empty() {
        let mut auth_bytes = CommandBuffer::new();
        for auth in auth_area {
            auth.marshal(&mut auth_bytes);
        }
        buf.put_u32(auth_bytes.len() as u32);
        buf.put_bytes(auth_bytes.as_bytes());
    }
    buf.put_bytes(cp_bytes);

    let size = buf.len() as u32;
    buf.update_u32(2, size);
    buf.into_vec()
}

/// The payload of a successfully dissected response packet.
#[derive(Debug)]
pub struct ResponsePayload {
    pub handle: Option<Handle>,
    pub parameters: Vec<u8>,
    pub auth_area: Vec<AuthResponse>,
}

/// Dissect a response packet.
///
/// Returns the raw response code alongside the payload; a nonzero code
/// never carries a payload. `has_response_handle` is per-command
/// knowledge.
pub fn unmarshal_response_packet(
    command: TpmCc,
    packet: &[u8],
    has_response_handle: bool,
) -> Result<(u32, ResponsePayload)> {
    let invalid = |reason: String| Error::invalid_response(command, reason);

    let mut buf = ResponseBuffer::new(packet);
    let tag_raw = buf.get_u16()?;
    let response_size = buf.get_u32()?;
    let response_code = buf.get_u32()?;

    if response_size as usize != packet.len() {
        return Err(invalid(format!(
            "invalid responseSize value (got {}, packet length {})",
            response_size,
            packet.len()
        )));
    }

    let tag = TpmSt::from_u16(tag_raw)
        .filter(|t| {
            matches!(
                t,
                TpmSt::NoSessions | TpmSt::Sessions | TpmSt::RspCommand
            )
        })
        .ok_or_else(|| invalid(format!("invalid tag 0x{:04x}", tag_raw)))?;

    let empty = ResponsePayload {
        handle: None,
        parameters: Vec::new(),
        auth_area: Vec::new(),
    };

    if tag == TpmSt::RspCommand {
        // a TPM 1.2 style response carries only an error code
        if response_code == 0 {
            return Err(invalid("unexpected TPM1.2 success response".to_string()));
        }
        if buf.remaining() != 0 {
            return Err(invalid(format!("{} trailing byte(s)", buf.remaining())));
        }
        return Ok((response_code, empty));
    }

    if response_code != 0 {
        if tag == TpmSt::Sessions {
            return Err(invalid(format!(
                "unexpected response code 0x{:08x} for TPM_ST_SESSIONS response",
                response_code
            )));
        }
        if buf.remaining() != 0 {
            return Err(invalid(format!("{} trailing byte(s)", buf.remaining())));
        }
        return Ok((response_code, empty));
    }

    let handle = if has_response_handle {
        Some(buf.get_u32()?)
    } else {
        None
    };

    let (parameters, auth_area) = match tag {
        TpmSt::Sessions => {
            let parameter_size = buf.get_u32()? as usize;
            if parameter_size > buf.remaining() {
                return Err(invalid("cannot read parameters: unexpected EOF".to_string()));
            }
            let parameters = buf.get_bytes(parameter_size)?;

            let mut auth_area = Vec::new();
            while buf.remaining() > 0 {
                if auth_area.len() >= MAX_AUTH_ENTRIES {
                    return Err(invalid(format!("{} trailing byte(s)", buf.remaining())));
                }
                auth_area.push(AuthResponse::unmarshal(&mut buf)?);
            }
            (parameters, auth_area)
        }
        TpmSt::NoSessions => (buf.get_remaining(), Vec::new()),
        TpmSt::RspCommand => unreachable!("handled above"),
        _ => unreachable!("tag filtered to Sessions | NoSessions | RspCommand above"),
    };

    Ok((
        0,
        ResponsePayload {
            handle,
            parameters,
            auth_area,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::tpm_rh;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn marshal_command_packet_no_sessions() {
        let cp_bytes = unhex(
            "00204355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd8650000000010000b",
        );
        let p = marshal_command_packet(
            TpmCc::StartAuthSession,
            &[tpm_rh::NULL, 0x80000000],
            &[],
            &cp_bytes,
        );
        let expected = unhex(
            "80010000003b00000176400000078000000000204355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd8650000000010000b",
        );
        assert_eq!(p, expected);
    }

    #[test]
    fn marshal_command_packet_with_sessions() {
        let auth_area = [
            AuthCommand {
                session_handle: tpm_rh::PW,
                nonce: Tpm2bNonce::empty(),
                session_attributes: TpmaSession::new().with(TpmaSession::CONTINUE_SESSION),
                hmac: Tpm2bAuth::new(b"foo".to_vec()),
            },
            AuthCommand {
                session_handle: 0x02000001,
                nonce: Tpm2bNonce::new(unhex(
                    "4355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865",
                )),
                session_attributes: TpmaSession::new().with(TpmaSession::ENCRYPT),
                hmac: Tpm2bAuth::new(unhex(
                    "042aea10a0f14f2d391373599be69d53a75dde9951fc3d3cd10b6100aa7a9f24",
                )),
            },
        ];
        let p = marshal_command_packet(TpmCc::Unseal, &[0x80000001], &auth_area, &[]);
        let expected = unhex(
            "8002000000670000015e8000000100000055400000090000010003666f6f0200000100204355a46b19d348dc2f57c046f8ef63d4538ebb936000f3c9ee954a27460dd865400020042aea10a0f14f2d391373599be69d53a75dde9951fc3d3cd10b6100aa7a9f24",
        );
        assert_eq!(p, expected);
    }

    #[test]
    fn unmarshal_response_too_small() {
        let p = unhex("80010000000a000000");
        let err = unmarshal_response_packet(TpmCc::GetRandom, &p, false).unwrap_err();
        assert!(err.to_string().contains("short buffer"));
    }

    #[test]
    fn unmarshal_response_invalid_size() {
        let p = unhex("80010000001000000000");
        let err = unmarshal_response_packet(TpmCc::GetRandom, &p, false).unwrap_err();
        assert!(err.to_string().contains("invalid responseSize"));
    }

    #[test]
    fn unmarshal_response_unexpected_tpm12_success() {
        let p = unhex("00c40000000a00000000");
        let err = unmarshal_response_packet(TpmCc::Startup, &p, false).unwrap_err();
        assert!(err.to_string().contains("TPM1.2"));
    }

    #[test]
    fn unmarshal_response_tpm12_error() {
        let p = unhex("00c40000000a0000001e");
        let (rc, payload) = unmarshal_response_packet(TpmCc::Startup, &p, false).unwrap();
        assert_eq!(rc, 0x1e);
        assert!(payload.parameters.is_empty());
        assert!(payload.auth_area.is_empty());
    }

    #[test]
    fn unmarshal_response_error_with_sessions_tag() {
        let p = unhex("80020000000a0000088e");
        let err = unmarshal_response_packet(TpmCc::Unseal, &p, false).unwrap_err();
        assert!(err
            .to_string()
            .contains("for TPM_ST_SESSIONS response"));
    }

    #[test]
    fn unmarshal_response_no_sessions() {
        let p = unhex(
            "80010000002c0000000000200000000000000000000000000000000000000000000000000000000000000000",
        );
        let (rc, payload) = unmarshal_response_packet(TpmCc::GetRandom, &p, false).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(
            payload.parameters,
            unhex("00200000000000000000000000000000000000000000000000000000000000000000")
        );
        assert!(payload.auth_area.is_empty());
    }

    #[test]
    fn unmarshal_response_with_sessions() {
        let p = unhex("80020000001a00000000000000070005a5a5a5a5a50000010000");
        let (rc, payload) = unmarshal_response_packet(TpmCc::Unseal, &p, false).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(payload.parameters, unhex("0005a5a5a5a5a5"));
        assert_eq!(
            payload.auth_area,
            vec![AuthResponse {
                nonce: Tpm2bNonce::empty(),
                session_attributes: TpmaSession::new().with(TpmaSession::CONTINUE_SESSION),
                hmac: Tpm2bAuth::empty(),
            }]
        );
    }

    #[test]
    fn unmarshal_response_with_handle() {
        let p = unhex("80010000000e0000000080000002");
        let (rc, payload) = unmarshal_response_packet(TpmCc::StartAuthSession, &p, true).unwrap();
        assert_eq!(rc, 0);
        assert_eq!(payload.handle, Some(0x80000002));
        assert!(payload.parameters.is_empty());
    }

    #[test]
    fn unmarshal_response_invalid_parameter_size() {
        let p = unhex("80020000001a00000000000010070005a5a5a5a5a50000010000");
        let err = unmarshal_response_packet(TpmCc::Unseal, &p, false).unwrap_err();
        assert!(err.to_string().contains("unexpected EOF"));
    }

    #[test]
    fn unmarshal_response_too_many_sessions() {
        let p = unhex(
            "80020000002900000000000000070005a5a5a5a5a50000010000000001000000000100000000010000",
        );
        let err = unmarshal_response_packet(TpmCc::Unseal, &p, false).unwrap_err();
        assert!(err.to_string().contains("trailing byte"));
    }

    #[test]
    fn auth_command_round_trip() {
        let auth = AuthCommand {
            session_handle: 0x02000000,
            nonce: Tpm2bNonce::new(vec![0x11; 32]),
            session_attributes: TpmaSession::new()
                .with(TpmaSession::CONTINUE_SESSION)
                .with(TpmaSession::DECRYPT),
            hmac: Tpm2bAuth::new(vec![0x22; 32]),
        };
        let bytes = auth.to_bytes();
        assert_eq!(AuthCommand::from_bytes(&bytes).unwrap(), auth);
    }
}
