// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy and TPM response-code decoding.

use crate::constants::{Handle, TpmAlgId, TpmCc};
use crate::types::Name;

pub type Result<T> = std::result::Result<T, Error>;

/// A TPM error number, normalized from a format-0 or format-1 response
/// code. Format-1 codes carry bit 7 set so the two spaces don't collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorCode(pub u16);

impl ErrorCode {
    // format 0
    pub const INITIALIZE: ErrorCode = ErrorCode(0x00);
    pub const FAILURE: ErrorCode = ErrorCode(0x01);
    pub const SEQUENCE: ErrorCode = ErrorCode(0x03);
    pub const DISABLED: ErrorCode = ErrorCode(0x20);
    pub const EXCLUSIVE: ErrorCode = ErrorCode(0x21);
    pub const AUTH_TYPE: ErrorCode = ErrorCode(0x24);
    pub const AUTH_MISSING: ErrorCode = ErrorCode(0x25);
    pub const POLICY: ErrorCode = ErrorCode(0x26);
    pub const COMMAND_CODE: ErrorCode = ErrorCode(0x43);
    pub const AUTHSIZE: ErrorCode = ErrorCode(0x44);
    pub const AUTH_CONTEXT: ErrorCode = ErrorCode(0x45);
    pub const NV_UNINITIALIZED: ErrorCode = ErrorCode(0x4A);
    pub const BAD_TAG: ErrorCode = ErrorCode(0x1E);

    // format 1
    pub const ASYMMETRIC: ErrorCode = ErrorCode(0x81);
    pub const ATTRIBUTES: ErrorCode = ErrorCode(0x82);
    pub const HASH: ErrorCode = ErrorCode(0x83);
    pub const VALUE: ErrorCode = ErrorCode(0x84);
    pub const HIERARCHY: ErrorCode = ErrorCode(0x85);
    pub const KEY_SIZE: ErrorCode = ErrorCode(0x87);
    pub const MGF: ErrorCode = ErrorCode(0x88);
    pub const MODE: ErrorCode = ErrorCode(0x89);
    pub const TYPE: ErrorCode = ErrorCode(0x8A);
    pub const HANDLE: ErrorCode = ErrorCode(0x8B);
    pub const AUTH_FAIL: ErrorCode = ErrorCode(0x8E);
    pub const NONCE: ErrorCode = ErrorCode(0x8F);
    pub const PP: ErrorCode = ErrorCode(0x90);
    pub const SCHEME: ErrorCode = ErrorCode(0x92);
    pub const SIZE: ErrorCode = ErrorCode(0x95);
    pub const SYMMETRIC: ErrorCode = ErrorCode(0x96);
    pub const TAG: ErrorCode = ErrorCode(0x97);
    pub const SELECTOR: ErrorCode = ErrorCode(0x98);
    pub const INSUFFICIENT: ErrorCode = ErrorCode(0x9A);
    pub const SIGNATURE: ErrorCode = ErrorCode(0x9B);
    pub const KEY: ErrorCode = ErrorCode(0x9C);
    pub const POLICY_FAIL: ErrorCode = ErrorCode(0x9D);
    pub const INTEGRITY: ErrorCode = ErrorCode(0x9F);
    pub const TICKET: ErrorCode = ErrorCode(0xA0);
    pub const BAD_AUTH: ErrorCode = ErrorCode(0xA2);
    pub const EXPIRED: ErrorCode = ErrorCode(0xA3);
    pub const POLICY_CC: ErrorCode = ErrorCode(0xA4);
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

/// A TPM warning number (format-0 code with the warning bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarningCode(pub u16);

impl WarningCode {
    pub const CONTEXT_GAP: WarningCode = WarningCode(0x01);
    pub const OBJECT_MEMORY: WarningCode = WarningCode(0x02);
    pub const SESSION_MEMORY: WarningCode = WarningCode(0x03);
    pub const MEMORY: WarningCode = WarningCode(0x04);
    pub const SESSION_HANDLES: WarningCode = WarningCode(0x05);
    pub const OBJECT_HANDLES: WarningCode = WarningCode(0x06);
    pub const LOCALITY: WarningCode = WarningCode(0x07);
    pub const YIELDED: WarningCode = WarningCode(0x08);
    pub const CANCELED: WarningCode = WarningCode(0x09);
    pub const TESTING: WarningCode = WarningCode(0x0A);
    pub const NV_RATE: WarningCode = WarningCode(0x20);
    pub const LOCKOUT: WarningCode = WarningCode(0x21);
    pub const RETRY: WarningCode = WarningCode(0x22);
    pub const NV_UNAVAILABLE: WarningCode = WarningCode(0x23);
}

impl std::fmt::Display for WarningCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error during {op}: {source}")]
    Transport {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot marshal value: {reason}")]
    Marshal { reason: String },

    #[error("cannot unmarshal value: {reason}")]
    Unmarshal { reason: String },

    #[error("invalid response for command {command}: {reason}")]
    InvalidResponse { command: TpmCc, reason: String },

    #[error("TPM returned error {code} for command {command}")]
    Tpm { command: TpmCc, code: ErrorCode },

    #[error("TPM returned error {code} for handle {index} of command {command}")]
    TpmHandle {
        command: TpmCc,
        code: ErrorCode,
        index: u8,
    },

    #[error("TPM returned error {code} for session {index} of command {command}")]
    TpmSession {
        command: TpmCc,
        code: ErrorCode,
        index: u8,
    },

    #[error("TPM returned error {code} for parameter {index} of command {command}")]
    TpmParameter {
        command: TpmCc,
        code: ErrorCode,
        index: u8,
    },

    #[error("TPM returned warning {code} for command {command}")]
    TpmWarning { command: TpmCc, code: WarningCode },

    #[error("TPM returned vendor-defined response code 0x{code:08x} for command {command}")]
    TpmVendor { command: TpmCc, code: u32 },

    #[error("a resource at handle 0x{handle:08x} is not available on the TPM")]
    ResourceUnavailable { handle: Handle },

    #[error("invalid {name} argument: {reason}")]
    InvalidParam { name: &'static str, reason: String },

    #[error("unsupported context version {version}")]
    UnsupportedContextVersion { version: u16 },

    #[error("authorization failed for {auth_name:?} (policy ref {policy_ref:02x?}): {source}")]
    PolicyAuthorization {
        auth_name: Name,
        policy_ref: Vec<u8>,
        #[source]
        source: Box<Error>,
    },

    #[error("cannot load policy resource {name:?}: {source}")]
    PolicyResourceLoad {
        name: Name,
        #[source]
        source: Box<Error>,
    },

    #[error("no policy digest available for algorithm {alg:?}")]
    PolicyMissingDigest { alg: TpmAlgId },

    #[error("cannot select policy branch: {reason}")]
    PolicyBranchSelection { reason: String },
}

impl Error {
    /// A marshalling failure. The codec itself never fails for
    /// well-formed values; this reports size constraints violated while
    /// assembling packets from caller-supplied data.
    pub fn marshal(reason: impl Into<String>) -> Self {
        Error::Marshal {
            reason: reason.into(),
        }
    }

    pub(crate) fn unmarshal(reason: impl Into<String>) -> Self {
        Error::Unmarshal {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_response(command: TpmCc, reason: impl Into<String>) -> Self {
        Error::InvalidResponse {
            command,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_param(name: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidParam {
            name,
            reason: reason.into(),
        }
    }

    /// True if this is the given TPM warning.
    pub fn is_warning(&self, warning: WarningCode) -> bool {
        matches!(self, Error::TpmWarning { code, .. } if *code == warning)
    }

    /// True if this is a retry-class warning (yielded, testing or retry).
    pub fn is_retryable_warning(&self) -> bool {
        self.is_warning(WarningCode::YIELDED)
            || self.is_warning(WarningCode::TESTING)
            || self.is_warning(WarningCode::RETRY)
    }

    /// True if this error reports the given TPM error code for any command.
    pub fn is_tpm_error(&self, c: ErrorCode) -> bool {
        match self {
            Error::Tpm { code, .. }
            | Error::TpmHandle { code, .. }
            | Error::TpmSession { code, .. }
            | Error::TpmParameter { code, .. } => *code == c,
            _ => false,
        }
    }
}

const RC_FMT1: u32 = 0x080;
const RC_VER1: u32 = 0x100;
const RC_VENDOR: u32 = 0x400;
const RC_WARN: u32 = 0x800;
const RC_P: u32 = 0x040;

/// Decode a raw TPM response code into `Ok(())` or the matching error
/// variant, preserving format-1 handle/session/parameter indices.
pub fn decode_response_code(command: TpmCc, rc: u32) -> Result<()> {
    if rc == 0 {
        return Ok(());
    }

    if rc & RC_FMT1 != 0 {
        // format 1: low 6 bits are the error, bits 8-11 locate it
        let code = ErrorCode((rc & 0x3F) as u16 | 0x80);
        if rc & RC_P != 0 {
            return Err(Error::TpmParameter {
                command,
                code,
                index: ((rc >> 8) & 0xF) as u8,
            });
        }
        let n = ((rc >> 8) & 0xF) as u8;
        if n & 0x8 != 0 {
            return Err(Error::TpmSession {
                command,
                code,
                index: n & 0x7,
            });
        }
        if n != 0 {
            return Err(Error::TpmHandle {
                command,
                code,
                index: n,
            });
        }
        return Err(Error::Tpm { command, code });
    }

    // format 0
    if rc & RC_VER1 == 0 {
        // TPM 1.2 response code space
        if rc == ErrorCode::BAD_TAG.0 as u32 {
            return Err(Error::Tpm {
                command,
                code: ErrorCode::BAD_TAG,
            });
        }
        return Err(Error::invalid_response(
            command,
            format!("invalid response code 0x{:08x}", rc),
        ));
    }
    if rc & RC_VENDOR != 0 {
        return Err(Error::TpmVendor { command, code: rc });
    }
    if rc & RC_WARN != 0 {
        return Err(Error::TpmWarning {
            command,
            code: WarningCode((rc & 0x7F) as u16),
        });
    }
    Err(Error::Tpm {
        command,
        code: ErrorCode((rc & 0x7F) as u16),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_decodes_to_ok() {
        assert!(decode_response_code(TpmCc::GetRandom, 0).is_ok());
    }

    #[test]
    fn format0_error() {
        let err = decode_response_code(TpmCc::Startup, 0x100).unwrap_err();
        assert!(err.is_tpm_error(ErrorCode::INITIALIZE));
    }

    #[test]
    fn format0_warning() {
        let err = decode_response_code(TpmCc::GetRandom, 0x908).unwrap_err();
        assert!(err.is_warning(WarningCode::YIELDED));
        assert!(err.is_retryable_warning());

        let err = decode_response_code(TpmCc::GetRandom, 0x90A).unwrap_err();
        assert!(err.is_warning(WarningCode::TESTING));

        let err = decode_response_code(TpmCc::GetRandom, 0x922).unwrap_err();
        assert!(err.is_warning(WarningCode::RETRY));
    }

    #[test]
    fn format1_session_error() {
        // TPM_RC_AUTH_FAIL for session 1: 0x98E
        let err = decode_response_code(TpmCc::Unseal, 0x98E).unwrap_err();
        match err {
            Error::TpmSession {
                command,
                code,
                index,
            } => {
                assert_eq!(command, TpmCc::Unseal);
                assert_eq!(code, ErrorCode::AUTH_FAIL);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn format1_parameter_error() {
        // TPM_RC_VALUE for parameter 2: P bit + N=2 + 0x84
        let err = decode_response_code(TpmCc::Load, 0x2C4).unwrap_err();
        match err {
            Error::TpmParameter { code, index, .. } => {
                assert_eq!(code, ErrorCode::VALUE);
                assert_eq!(index, 2);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn format1_handle_error() {
        // handle 1, error 0x8B
        let err = decode_response_code(TpmCc::ReadPublic, 0x18B).unwrap_err();
        match err {
            Error::TpmHandle { code, index, .. } => {
                assert_eq!(code, ErrorCode::HANDLE);
                assert_eq!(index, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn tpm12_bad_tag() {
        let err = decode_response_code(TpmCc::Startup, 0x1E).unwrap_err();
        assert!(err.is_tpm_error(ErrorCode::BAD_TAG));
    }
}
