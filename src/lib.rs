// SPDX-License-Identifier: Apache-2.0

//! Pure Rust TPM 2.0 protocol library
//!
//! This crate speaks the TPM 2.0 command protocol to a Trusted Platform
//! Module over an abstract byte transport, without C library
//! dependencies. It provides:
//!
//! - **Wire codec & dispatcher**: bit-exact marshalling of TPM command
//!   and response packets, bounded retries on transient warnings, and
//!   matching of response auth areas to command auth areas
//! - **Sessions & resources**: host-side handle contexts for transient
//!   and persistent objects, NV indexes and sessions; HMAC sessions with
//!   nonce exchange, bound/salted key derivation and parameter
//!   encryption
//! - **Authorization policies**: a builder and executor for policy
//!   trees with branching, signature checks, NV assertions and tickets,
//!   plus offline digest computation
//!
//! ## Example
//!
//! ```no_run
//! use tpm2_client::{LinuxDevice, TpmContext};
//!
//! let device = LinuxDevice::detect()?;
//! let mut tpm = TpmContext::new(Box::new(device));
//! let random = tpm.get_random(32)?;
//! # Ok::<(), tpm2_client::Error>(())
//! ```

mod constants;
mod context;
mod crypto;
mod error;
mod marshal;
mod packet;
mod policy;
mod resources;
mod session;
mod transport;
mod types;
mod wrap;

pub use constants::*;
pub use context::{CommandContext, ResponseContext, ResponseParams, TpmContext, TpmProperties};
pub use error::{decode_response_code, Error, ErrorCode, Result, WarningCode};
pub use marshal::{CommandBuffer, Marshal, ResponseBuffer, Unmarshal};
pub use packet::{
    marshal_command_packet, unmarshal_response_packet, AuthCommand, AuthResponse, ResponsePayload,
    MAX_AUTH_ENTRIES,
};
pub use policy::{
    Authorizer, LoadedResource, NullAuthorizer, NullPolicyResources, PcrValue,
    PersistentResource, Policy,
    PolicyAuthorization, PolicyBranch, PolicyBranchBuilder, PolicyBranchNode, PolicyBuilder,
    PolicyElement, PolicyExecuteParams, PolicyExecuteResult, PolicyResources,
    PolicyResourcesData, PolicySecretParams, PolicySessionUsage, PolicySignedAuthorization,
    PolicyTicket, TpmPolicyResources, TransientResource,
};
pub use resources::{
    HandleContext, NvIndexContext, ObjectContext, PartialHandleContext, PermanentContext,
    CONTEXT_MAGIC, CONTEXT_VERSION,
};
pub use session::{PolicyHmacType, SessionContext, SessionData};
pub use transport::{LinuxDevice, MssimTransport, Transport, DEFAULT_MAX_PACKET_SIZE};
pub use types::*;
pub use wrap::{
    compute_qualified_name, compute_qualified_name_in_hierarchy, duplicate_to_sensitive,
    private_to_sensitive, produce_outer_wrap, sensitive_to_duplicate, sensitive_to_private,
    unwrap_outer, Entity,
};

pub use crypto::{
    digest, hmac, kdf_a, kdf_e, mgf1, secret_share, sym_decrypt, sym_encrypt, verify_signature,
    xor_obfuscate,
};
