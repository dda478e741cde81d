// SPDX-License-Identifier: Apache-2.0

//! Construction of policy trees.

use crate::constants::{TpmCc, TpmEo};
use crate::error::{Error, Result};
use crate::types::{Name, TaggedHashList, TpmsNvPublic, TpmtPublic};

use super::{PcrValue, Policy, PolicyBranch, PolicyElement};

enum BuilderElement {
    Leaf(PolicyElement),
    Node(PolicyBranchNode),
}

/// A branch under construction. Assertions append in document order.
#[derive(Default)]
pub struct PolicyBranchBuilder {
    elements: Vec<BuilderElement>,
}

impl PolicyBranchBuilder {
    fn push(&mut self, element: PolicyElement) -> &mut Self {
        self.elements.push(BuilderElement::Leaf(element));
        self
    }

    pub fn policy_auth_value(&mut self) -> &mut Self {
        self.push(PolicyElement::AuthValue)
    }

    pub fn policy_password(&mut self) -> &mut Self {
        self.push(PolicyElement::Password)
    }

    pub fn policy_command_code(&mut self, code: TpmCc) -> &mut Self {
        self.push(PolicyElement::CommandCode(code))
    }

    pub fn policy_counter_timer(
        &mut self,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> &mut Self {
        self.push(PolicyElement::CounterTimer {
            operand_b: operand_b.to_vec(),
            offset,
            operation,
        })
    }

    /// Assert a command-parameter digest, precomputed under every hash
    /// algorithm the policy will be used with.
    pub fn policy_cp_hash(&mut self, digests: TaggedHashList) -> &mut Self {
        self.push(PolicyElement::CpHash { digests })
    }

    /// Assert a handle-name digest, precomputed under every hash
    /// algorithm the policy will be used with.
    pub fn policy_name_hash(&mut self, digests: TaggedHashList) -> &mut Self {
        self.push(PolicyElement::NameHash { digests })
    }

    pub fn policy_nv_written(&mut self, written: bool) -> &mut Self {
        self.push(PolicyElement::NvWritten(written))
    }

    pub fn policy_pcr(&mut self, values: Vec<PcrValue>) -> &mut Self {
        self.push(PolicyElement::Pcr { values })
    }

    pub fn policy_duplication_select(
        &mut self,
        object_name: Name,
        new_parent_name: Name,
        include_object: bool,
    ) -> &mut Self {
        self.push(PolicyElement::DuplicationSelect {
            object_name,
            new_parent_name,
            include_object,
        })
    }

    pub fn policy_secret(&mut self, auth_object_name: Name, policy_ref: &[u8]) -> &mut Self {
        self.push(PolicyElement::Secret {
            auth_object_name,
            policy_ref: policy_ref.to_vec(),
        })
    }

    pub fn policy_signed(&mut self, auth_key: TpmtPublic, policy_ref: &[u8]) -> &mut Self {
        self.push(PolicyElement::Signed {
            auth_key,
            policy_ref: policy_ref.to_vec(),
        })
    }

    pub fn policy_nv(
        &mut self,
        nv_public: &TpmsNvPublic,
        operand_b: &[u8],
        offset: u16,
        operation: TpmEo,
    ) -> &mut Self {
        self.push(PolicyElement::Nv {
            nv_public: nv_public.clone(),
            operand_b: operand_b.to_vec(),
            offset,
            operation,
        })
    }

    pub fn policy_authorize(&mut self, key_name: Name, policy_ref: &[u8]) -> &mut Self {
        self.push(PolicyElement::Authorize {
            key_name,
            policy_ref: policy_ref.to_vec(),
        })
    }

    /// Open an OR node at this position. Branches added to the node
    /// execute as alternatives; assertions appended to this builder
    /// afterwards run after the OR.
    pub fn add_branch_node(&mut self) -> &mut PolicyBranchNode {
        self.elements.push(BuilderElement::Node(PolicyBranchNode {
            branches: Vec::new(),
        }));
        match self.elements.last_mut() {
            Some(BuilderElement::Node(node)) => node,
            _ => unreachable!("a node was just pushed"),
        }
    }

    fn build(self) -> Result<Vec<PolicyElement>> {
        let mut out = Vec::with_capacity(self.elements.len());
        for element in self.elements {
            match element {
                BuilderElement::Leaf(e) => out.push(e),
                BuilderElement::Node(node) => {
                    if !(2..=8).contains(&node.branches.len()) {
                        return Err(Error::invalid_param(
                            "branches",
                            format!(
                                "a branch node requires between 2 and 8 branches, got {}",
                                node.branches.len()
                            ),
                        ));
                    }
                    let mut branches = Vec::with_capacity(node.branches.len());
                    for (name, builder) in node.branches {
                        branches.push(PolicyBranch {
                            name,
                            digests: Vec::new(),
                            elements: builder.build()?,
                        });
                    }
                    out.push(PolicyElement::Or(branches));
                }
            }
        }
        Ok(out)
    }
}

/// An OR node under construction.
pub struct PolicyBranchNode {
    branches: Vec<(String, PolicyBranchBuilder)>,
}

impl PolicyBranchNode {
    /// Add a named branch. An empty name is allowed; such branches are
    /// addressed positionally (`$[index]`).
    pub fn add_branch(&mut self, name: &str) -> &mut PolicyBranchBuilder {
        self.branches
            .push((name.to_string(), PolicyBranchBuilder::default()));
        &mut self
            .branches
            .last_mut()
            .expect("a branch was just pushed")
            .1
    }
}

/// Builds a [`Policy`] by appending assertions to its root branch.
#[derive(Default)]
pub struct PolicyBuilder {
    root: PolicyBranchBuilder,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root_branch(&mut self) -> &mut PolicyBranchBuilder {
        &mut self.root
    }

    /// Finish building. Fails if any OR node has an invalid branch
    /// count.
    pub fn policy(self) -> Result<Policy> {
        Ok(Policy {
            elements: self.root.build()?,
            authorizations: Vec::new(),
        })
    }
}
