// SPDX-License-Identifier: Apache-2.0

//! Execution of a policy tree against a live policy session.
//!
//! The executor dispatches one TPM assertion per element in document
//! order, resolving resources through a caching layer over the caller's
//! [`PolicyResources`], selecting OR branches from an explicit path or by
//! matching the intended session usage, and caching
//! PolicySigned/PolicySecret tickets. On failure the session is left
//! wherever the TPM advanced it; callers may TPM2_PolicyRestart and
//! retry.

use std::collections::{HashMap, VecDeque};

use crate::constants::{tpm_rh, TpmAlgId, TpmCc, TpmSe};
use crate::context::TpmContext;
use crate::crypto;
use crate::error::{Error, Result};
use crate::resources::HandleContext;
use crate::session::SessionContext;
use crate::types::{Name, Tpm2bPublic, TpmtPublic, TpmtSignature};

use super::compute::pcr_selection_and_digest;
use super::resources::{LoadedResource, PolicyResources};
use super::{Policy, PolicyBranch, PolicyElement, PolicyTicket};

/// The intended use of the policy session, consulted when an OR node has
/// to be auto-selected.
#[derive(Debug, Clone)]
pub struct PolicySessionUsage {
    /// The command the session will authorize.
    pub command_code: TpmCc,
    /// Names of the handles the command will use, in handle order.
    pub handle_names: Vec<Name>,
    /// The auth value of the resource being authorized.
    pub auth_value: Vec<u8>,
    /// Whether the auth value may be proven via TPM2_PolicyAuthValue or
    /// TPM2_PolicyPassword.
    pub can_use_auth_value: bool,
}

/// Parameters for a TPM2_PolicySecret assertion, matched by auth object
/// name and policy reference.
#[derive(Debug, Clone)]
pub struct PolicySecretParams {
    pub auth_object_name: Name,
    pub policy_ref: Vec<u8>,
    pub cp_hash: Option<Vec<u8>>,
    pub expiration: i32,
}

/// A signed TPM2_PolicySigned authorization.
#[derive(Debug, Clone)]
pub struct PolicySignedAuthorization {
    pub auth_key: TpmtPublic,
    pub policy_ref: Vec<u8>,
    /// The session nonce covered by the signature; empty when the
    /// signature does not bind the session.
    pub nonce_tpm: Vec<u8>,
    pub cp_hash: Vec<u8>,
    pub expiration: i32,
    pub signature: TpmtSignature,
}

/// Inputs to [`Policy::execute`].
#[derive(Default)]
pub struct PolicyExecuteParams {
    pub usage: Option<PolicySessionUsage>,
    /// Preferred branch path: `/`-separated components, each a branch
    /// name or `$[index]`.
    pub path: String,
    /// Tickets from previous executions, re-asserted via
    /// TPM2_PolicyTicket instead of their original assertions.
    pub tickets: Vec<PolicyTicket>,
    pub secret_params: Vec<PolicySecretParams>,
    pub signed_authorizations: Vec<PolicySignedAuthorization>,
}

/// The outcome of a policy execution.
#[derive(Debug, Default)]
pub struct PolicyExecuteResult {
    /// Tickets collected from assertions executed with a negative
    /// expiration, plus unconsumed input tickets.
    pub tickets: Vec<PolicyTicket>,
    /// Whether the authorized command still needs the resource's auth
    /// value (a TPM2_PolicyAuthValue or TPM2_PolicyPassword assertion
    /// ran).
    pub auth_value_needed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PathComponent {
    Name(String),
    Index(usize),
}

fn parse_path(path: &str) -> Result<VecDeque<PathComponent>> {
    let mut out = VecDeque::new();
    for component in path.split('/') {
        if component.is_empty() {
            continue;
        }
        if let Some(rest) = component.strip_prefix('$') {
            let index = rest
                .strip_prefix('[')
                .and_then(|r| r.strip_suffix(']'))
                .and_then(|r| r.parse::<usize>().ok())
                .ok_or_else(|| Error::PolicyBranchSelection {
                    reason: format!("invalid path component {component:?}"),
                })?;
            out.push_back(PathComponent::Index(index));
        } else if component.contains('$') {
            return Err(Error::PolicyBranchSelection {
                reason: format!("invalid path component {component:?}"),
            });
        } else {
            out.push_back(PathComponent::Name(component.to_string()));
        }
    }
    Ok(out)
}

fn resolve_component(component: &PathComponent, branches: &[PolicyBranch]) -> Result<usize> {
    match component {
        PathComponent::Index(index) => {
            if *index >= branches.len() {
                return Err(Error::PolicyBranchSelection {
                    reason: format!(
                        "branch index {} out of range ({} branches)",
                        index,
                        branches.len()
                    ),
                });
            }
            Ok(*index)
        }
        PathComponent::Name(name) => branches
            .iter()
            .position(|b| &b.name == name)
            .ok_or_else(|| Error::PolicyBranchSelection {
                reason: format!("no branch named {name:?}"),
            }),
    }
}

/// Resolve as much of the branch path as the tree determines statically,
/// so selector errors surface before any TPM round trip.
fn prevalidate_path(elements: &[PolicyElement], path: &mut VecDeque<PathComponent>) -> Result<bool> {
    let mut complete = true;
    for element in elements {
        match element {
            PolicyElement::Or(branches) => match path.pop_front() {
                Some(component) => {
                    let index = resolve_component(&component, branches)?;
                    if !prevalidate_path(&branches[index].elements, path)? {
                        complete = false;
                    }
                }
                None => return Ok(false),
            },
            PolicyElement::Authorize { .. } => complete = false,
            _ => {}
        }
    }
    Ok(complete)
}

fn branch_satisfiable(branch: &PolicyBranch, usage: &PolicySessionUsage, alg: TpmAlgId) -> bool {
    elements_satisfiable(&branch.elements, usage, alg)
}

fn elements_satisfiable(
    elements: &[PolicyElement],
    usage: &PolicySessionUsage,
    alg: TpmAlgId,
) -> bool {
    elements.iter().all(|element| match element {
        PolicyElement::AuthValue | PolicyElement::Password => usage.can_use_auth_value,
        PolicyElement::CommandCode(cc) => *cc == usage.command_code,
        PolicyElement::DuplicationSelect { .. } => usage.command_code == TpmCc::Duplicate,
        PolicyElement::CpHash { digests } => digests.iter().any(|d| d.hash_alg == alg),
        PolicyElement::NameHash { digests } => {
            let Some(digest) = digests.iter().find(|d| d.hash_alg == alg) else {
                return false;
            };
            if usage.handle_names.is_empty() {
                return true;
            }
            let chunks: Vec<&[u8]> = usage.handle_names.iter().map(|n| n.as_bytes()).collect();
            crypto::digest(alg, &chunks) == digest.digest
        }
        PolicyElement::Or(branches) => branches
            .iter()
            .any(|b| elements_satisfiable(&b.elements, usage, alg)),
        _ => true,
    })
}

type TicketKey = (Vec<u8>, Vec<u8>);

fn ticket_key(auth_name: &Name, policy_ref: &[u8]) -> TicketKey {
    (auth_name.as_bytes().to_vec(), policy_ref.to_vec())
}

/// The executor-owned caching layer over the caller's resource loader.
/// Non-transient resources and authorized-policy lookups are cached by
/// name for the lifetime of one execution.
struct CachedResources<'r> {
    inner: &'r mut dyn PolicyResources,
    contexts: HashMap<Vec<u8>, (HandleContext, Option<Policy>)>,
    authorized: HashMap<TicketKey, Vec<Policy>>,
}

impl<'r> CachedResources<'r> {
    fn new(inner: &'r mut dyn PolicyResources) -> Self {
        Self {
            inner,
            contexts: HashMap::new(),
            authorized: HashMap::new(),
        }
    }

    fn load_name(
        &mut self,
        tpm: &mut TpmContext,
        name: &Name,
    ) -> Result<(LoadedResource, Option<Policy>)> {
        if let Some((context, policy)) = self.contexts.get(name.as_bytes()) {
            return Ok((
                LoadedResource {
                    context: context.clone(),
                    flush: false,
                },
                policy.clone(),
            ));
        }
        let (resource, policy) = self.inner.load_name(tpm, name)?;
        if !resource.flush {
            self.contexts.insert(
                name.as_bytes().to_vec(),
                (resource.context.clone(), policy.clone()),
            );
        }
        Ok((resource, policy))
    }

    fn load_authorized_policies(
        &mut self,
        key_sign: &Name,
        policy_ref: &[u8],
    ) -> Result<Vec<Policy>> {
        let key = ticket_key(key_sign, policy_ref);
        if let Some(policies) = self.authorized.get(&key) {
            return Ok(policies.clone());
        }
        let policies = self.inner.load_authorized_policies(key_sign, policy_ref)?;
        self.authorized.insert(key, policies.clone());
        Ok(policies)
    }
}

struct Executor<'a> {
    tpm: &'a mut TpmContext,
    session: &'a SessionContext,
    session_alg: TpmAlgId,
    resources: CachedResources<'a>,
    usage: Option<&'a PolicySessionUsage>,
    path: VecDeque<PathComponent>,
    tickets: HashMap<TicketKey, PolicyTicket>,
    secret_params: &'a [PolicySecretParams],
    signed_authorizations: &'a [PolicySignedAuthorization],
    auth_value_needed: bool,
}

impl<'a> Executor<'a> {
    fn run_elements(&mut self, elements: &[PolicyElement]) -> Result<()> {
        for element in elements {
            self.run_element(element)?;
        }
        Ok(())
    }

    fn run_element(&mut self, element: &PolicyElement) -> Result<()> {
        match element {
            PolicyElement::AuthValue => {
                self.tpm.policy_auth_value(self.session)?;
                self.auth_value_needed = true;
                Ok(())
            }
            PolicyElement::Password => {
                self.tpm.policy_password(self.session)?;
                self.auth_value_needed = true;
                Ok(())
            }
            PolicyElement::CommandCode(cc) => self.tpm.policy_command_code(self.session, *cc),
            PolicyElement::CounterTimer {
                operand_b,
                offset,
                operation,
            } => self
                .tpm
                .policy_counter_timer(self.session, operand_b, *offset, *operation),
            PolicyElement::CpHash { digests } => {
                let digest = digests
                    .iter()
                    .find(|d| d.hash_alg == self.session_alg)
                    .ok_or(Error::PolicyMissingDigest {
                        alg: self.session_alg,
                    })?;
                self.tpm.policy_cp_hash(self.session, &digest.digest)
            }
            PolicyElement::NameHash { digests } => {
                let digest = digests
                    .iter()
                    .find(|d| d.hash_alg == self.session_alg)
                    .ok_or(Error::PolicyMissingDigest {
                        alg: self.session_alg,
                    })?;
                self.tpm.policy_name_hash(self.session, &digest.digest)
            }
            PolicyElement::NvWritten(written) => {
                self.tpm.policy_nv_written(self.session, *written)
            }
            PolicyElement::Pcr { values } => {
                let (selection, digest) = pcr_selection_and_digest(self.session_alg, values)?;
                self.tpm.policy_pcr(self.session, &digest, &selection)
            }
            PolicyElement::DuplicationSelect {
                object_name,
                new_parent_name,
                include_object,
            } => self.tpm.policy_duplication_select(
                self.session,
                object_name,
                new_parent_name,
                *include_object,
            ),
            PolicyElement::Secret {
                auth_object_name,
                policy_ref,
            } => self.run_secret(auth_object_name, policy_ref),
            PolicyElement::Signed {
                auth_key,
                policy_ref,
            } => self.run_signed(auth_key, policy_ref),
            PolicyElement::Nv {
                nv_public,
                operand_b,
                offset,
                operation,
            } => self.run_nv(nv_public, operand_b, *offset, *operation),
            PolicyElement::Authorize {
                key_name,
                policy_ref,
            } => self.run_authorize(key_name, policy_ref),
            PolicyElement::Or(branches) => self.run_or(branches),
        }
    }

    /// Re-assert a cached ticket if one exists for this authorization.
    /// Tickets are single-use on the host side; using one consumes it.
    fn try_ticket(&mut self, auth_name: &Name, policy_ref: &[u8]) -> Result<bool> {
        let key = ticket_key(auth_name, policy_ref);
        let usable = match self.tickets.get(&key) {
            Some(ticket) => !ticket.timeout.is_empty() && !ticket.ticket.is_null(),
            None => false,
        };
        if !usable {
            return Ok(false);
        }
        let ticket = self.tickets.remove(&key).expect("presence checked above");
        self.tpm.policy_ticket(
            self.session,
            &ticket.timeout,
            &ticket.cp_hash,
            policy_ref,
            auth_name,
            &ticket.ticket,
        )?;
        Ok(true)
    }

    fn run_secret(&mut self, auth_object_name: &Name, policy_ref: &[u8]) -> Result<()> {
        if self.try_ticket(auth_object_name, policy_ref)? {
            return Ok(());
        }

        let params = self
            .secret_params
            .iter()
            .find(|p| &p.auth_object_name == auth_object_name && p.policy_ref == policy_ref);
        let cp_hash = params
            .and_then(|p| p.cp_hash.clone())
            .unwrap_or_default();
        let expiration = params.map_or(0, |p| p.expiration);

        let (mut resource, _) = self.resources.load_name(self.tpm, auth_object_name)?;
        self.resources.inner.authorize(&mut resource.context)?;

        let result = self.tpm.policy_secret(
            &resource.context,
            None,
            self.session,
            &cp_hash,
            policy_ref,
            expiration,
        );
        if resource.flush {
            let _ = self.tpm.flush_context(resource.context.handle());
        }
        let (timeout, ticket) = result.map_err(|e| Error::PolicyAuthorization {
            auth_name: auth_object_name.clone(),
            policy_ref: policy_ref.to_vec(),
            source: Box::new(e),
        })?;

        if expiration < 0 && !ticket.is_null() {
            self.tickets.insert(
                ticket_key(auth_object_name, policy_ref),
                PolicyTicket {
                    auth_name: auth_object_name.clone(),
                    policy_ref: policy_ref.to_vec(),
                    cp_hash,
                    timeout,
                    ticket,
                },
            );
        }
        Ok(())
    }

    fn run_signed(&mut self, auth_key: &TpmtPublic, policy_ref: &[u8]) -> Result<()> {
        let key_name = auth_key.name()?;
        if self.try_ticket(&key_name, policy_ref)? {
            return Ok(());
        }

        let auth_error = |e: Error| Error::PolicyAuthorization {
            auth_name: key_name.clone(),
            policy_ref: policy_ref.to_vec(),
            source: Box::new(e),
        };

        let authorization = match self
            .signed_authorizations
            .iter()
            .find(|a| {
                a.auth_key.name().map(|n| n == key_name).unwrap_or(false)
                    && a.policy_ref == policy_ref
            })
            .cloned()
        {
            Some(a) => a,
            None => {
                let nonce = self.session.nonce_tpm();
                self.resources
                    .inner
                    .sign_authorization(&nonce, &key_name, policy_ref)
                    .map_err(auth_error)?
            }
        };

        if matches!(authorization.signature, TpmtSignature::Null) {
            return Err(auth_error(Error::invalid_param(
                "signature",
                "no signature for this authorization",
            )));
        }

        let key_context = self.tpm.load_external_public(
            &Tpm2bPublic {
                public: auth_key.clone(),
            },
            tpm_rh::NULL,
        )?;
        let key_handle = key_context.handle();

        let result = self.tpm.policy_signed(
            &HandleContext::Object(key_context),
            self.session,
            !authorization.nonce_tpm.is_empty(),
            &authorization.cp_hash,
            policy_ref,
            authorization.expiration,
            &authorization.signature,
        );
        let _ = self.tpm.flush_context(key_handle);
        let (timeout, ticket) = result.map_err(auth_error)?;

        if authorization.expiration < 0 && !ticket.is_null() {
            self.tickets.insert(
                ticket_key(&key_name, policy_ref),
                PolicyTicket {
                    auth_name: key_name,
                    policy_ref: policy_ref.to_vec(),
                    cp_hash: authorization.cp_hash,
                    timeout,
                    ticket,
                },
            );
        }
        Ok(())
    }

    fn run_nv(
        &mut self,
        nv_public: &crate::types::TpmsNvPublic,
        operand_b: &[u8],
        offset: u16,
        operation: crate::constants::TpmEo,
    ) -> Result<()> {
        let nv_name = nv_public.name()?;
        let (mut resource, _) = self.resources.load_name(self.tpm, &nv_name)?;
        self.resources.inner.authorize(&mut resource.context)?;

        let index = match &resource.context {
            HandleContext::NvIndex(index) => index.clone(),
            _ => {
                return Err(Error::PolicyResourceLoad {
                    name: nv_name,
                    source: Box::new(Error::invalid_param(
                        "name",
                        "resolved resource is not an NV index",
                    )),
                })
            }
        };

        self.tpm.policy_nv(
            &resource.context,
            None,
            &index,
            self.session,
            operand_b,
            offset,
            operation,
        )
    }

    fn run_authorize(&mut self, key_name: &Name, policy_ref: &[u8]) -> Result<()> {
        let auth_error = |e: Error| Error::PolicyAuthorization {
            auth_name: key_name.clone(),
            policy_ref: policy_ref.to_vec(),
            source: Box::new(e),
        };

        let candidates = self
            .resources
            .load_authorized_policies(key_name, policy_ref)?;
        if candidates.is_empty() {
            return Err(auth_error(Error::invalid_param(
                "policy",
                "no authorized policies for this key",
            )));
        }

        let mut last_error = None;
        for mut candidate in candidates {
            let approved = match candidate.compute_for(self.session_alg) {
                Ok(digest) => digest,
                Err(e) => {
                    last_error = Some(e);
                    continue;
                }
            };
            let Some(authorization) = candidate.authorizations.iter().find(|a| {
                a.auth_key.name().map(|n| &n == key_name).unwrap_or(false)
                    && a.policy_ref == policy_ref
            }) else {
                continue;
            };

            self.run_elements(&candidate.elements)?;

            // validate the signature over aHash = H(approved || policyRef)
            // to obtain the verification ticket the assertion requires
            let sig_alg = authorization.signature.hash_alg();
            let a_hash = crypto::digest(sig_alg, &[&approved, policy_ref]);

            let key_context = self.tpm.load_external_public(
                &Tpm2bPublic {
                    public: authorization.auth_key.clone(),
                },
                tpm_rh::NULL,
            )?;
            let key_handle = key_context.handle();

            let ticket_result = self.tpm.verify_signature(
                &HandleContext::Object(key_context),
                &a_hash,
                &authorization.signature,
            );
            let authorize_result = ticket_result.and_then(|ticket| {
                self.tpm.policy_authorize(
                    self.session,
                    &approved,
                    policy_ref,
                    key_name,
                    &ticket,
                )
            });
            let _ = self.tpm.flush_context(key_handle);
            return authorize_result.map_err(auth_error);
        }

        Err(auth_error(last_error.unwrap_or_else(|| {
            Error::invalid_param("policy", "no authorized policy is usable")
        })))
    }

    fn run_or(&mut self, branches: &[PolicyBranch]) -> Result<()> {
        let selected = match self.path.pop_front() {
            Some(component) => resolve_component(&component, branches)?,
            None => match self.usage {
                Some(usage) => branches
                    .iter()
                    .position(|b| branch_satisfiable(b, usage, self.session_alg))
                    .ok_or_else(|| Error::PolicyBranchSelection {
                        reason: "no branch is satisfiable with the intended usage".to_string(),
                    })?,
                None => {
                    return Err(Error::PolicyBranchSelection {
                        reason: "cannot select a branch without a path or usage".to_string(),
                    })
                }
            },
        };

        self.run_elements(&branches[selected].elements)?;

        let mut digests = Vec::with_capacity(branches.len());
        for branch in branches {
            digests.push(branch.digest_for(self.session_alg)?);
        }
        self.tpm.policy_or(self.session, &digests)
    }
}

impl Policy {
    /// Execute this policy against a live policy (or trial) session,
    /// issuing one TPM assertion per element in document order.
    ///
    /// Branch digests for the session's algorithm must have been
    /// computed via [`Policy::compute_for`] (or deserialized); missing
    /// digests surface as [`Error::PolicyMissingDigest`] when an OR node
    /// is reached.
    pub fn execute(
        &self,
        tpm: &mut TpmContext,
        session: &SessionContext,
        resources: &mut dyn PolicyResources,
        params: &PolicyExecuteParams,
    ) -> Result<PolicyExecuteResult> {
        if !matches!(session.session_type(), TpmSe::Policy | TpmSe::Trial) {
            return Err(Error::invalid_param(
                "session",
                "policies execute against policy or trial sessions",
            ));
        }

        let path = parse_path(&params.path)?;
        let mut probe = path.clone();
        let complete = prevalidate_path(&self.elements, &mut probe)?;
        if complete && !probe.is_empty() {
            // a fully static tree cannot consume the surplus components
            return Err(Error::PolicyBranchSelection {
                reason: format!("{} unused path component(s)", probe.len()),
            });
        }

        let mut tickets = HashMap::new();
        for ticket in &params.tickets {
            tickets.insert(ticket_key(&ticket.auth_name, &ticket.policy_ref), ticket.clone());
        }

        let mut executor = Executor {
            session_alg: session.hash_alg(),
            tpm,
            session,
            resources: CachedResources::new(resources),
            usage: params.usage.as_ref(),
            path,
            tickets,
            secret_params: &params.secret_params,
            signed_authorizations: &params.signed_authorizations,
            auth_value_needed: false,
        };
        executor.run_elements(&self.elements)?;

        Ok(PolicyExecuteResult {
            tickets: executor.tickets.into_values().collect(),
            auth_value_needed: executor.auth_value_needed,
        })
    }
}
