//! Caller identity and visibility scoping.
//!
//! Authentication happens upstream. The authenticated caller is attached
//! to the request as a [`Principal`] extension; requests without one are
//! anonymous.

use crate::error::{ServerError, ServerResult};
use http::Request;
use restfeed_protocol::{ServiceDefinition, CURRENT_USER_TOKEN};
use std::collections::BTreeSet;

/// An authenticated caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    user_id: Option<String>,
    roles: BTreeSet<String>,
}

impl Principal {
    /// An unauthenticated caller with no roles.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller identified by `user_id`.
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            roles: BTreeSet::new(),
        }
    }

    /// Adds a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Returns the user id, if authenticated.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Returns true if the caller holds `role`.
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Reads the principal attached to a request.
    pub fn from_request<B>(request: &Request<B>) -> Self {
        request
            .extensions()
            .get::<Principal>()
            .cloned()
            .unwrap_or_default()
    }
}

/// Checks that `principal` may use the service.
pub(crate) fn authorize(definition: &ServiceDefinition, principal: &Principal) -> ServerResult<()> {
    if definition.is_world_readable() || principal.has_role(definition.required_role()) {
        Ok(())
    } else {
        Err(ServerError::Unauthorized(format!(
            "service '{}' requires role '{}'",
            definition.name,
            definition.required_role()
        )))
    }
}

/// Returns the service constraint specialised for `principal`.
///
/// Anonymous callers substitute an empty id, which matches no owner.
pub(crate) fn scoped_constraint(
    definition: &ServiceDefinition,
    principal: &Principal,
) -> Option<String> {
    let constraint = definition.constraint.as_deref()?.trim();
    if constraint.is_empty() {
        return None;
    }
    Some(constraint.replace(CURRENT_USER_TOKEN, principal.user_id().unwrap_or("")))
}
