//! # Authorization
//!
//! Fail-closed authorization check consulted by the dispatcher and the container
//! manager before every mutating call. Computing permissions (tag expansion, role
//! resolution) is the collaborator's business; the core only asks a yes/no question
//! keyed by the entity's objid.

use crate::constants::objid::WILDCARD;
use crate::error::{CoreError, CoreResult};
use crate::models::objid;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Operation names passed to the authorizer
pub mod operations {
    pub const VIEW: &str = "view";
    pub const INSERT: &str = "insert";
    pub const UPDATE: &str = "update";
    pub const DELETE: &str = "delete";
    pub const USE: &str = "use";
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(())` when allowed, `CoreError::AuthorizationDenied` otherwise
    async fn check_authorization(
        &self,
        objtype: &str,
        objdef: &str,
        objid: &str,
        operation: &str,
    ) -> CoreResult<()>;
}

/// Grants everything. Used when authorization is enforced upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn check_authorization(
        &self,
        _objtype: &str,
        _objdef: &str,
        _objid: &str,
        _operation: &str,
    ) -> CoreResult<()> {
        Ok(())
    }
}

/// A single permission: operations allowed on entities of `objtype`/`objdef` whose objid
/// matches `objid_pattern` (segments may be `*`, and a pattern also covers the subtree
/// below it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub objtype: String,
    pub objdef: String,
    pub objid_pattern: String,
    pub operations: Vec<String>,
}

impl Grant {
    pub fn new(
        objtype: impl Into<String>,
        objdef: impl Into<String>,
        objid_pattern: impl Into<String>,
        operations: &[&str],
    ) -> Self {
        Self {
            objtype: objtype.into(),
            objdef: objdef.into(),
            objid_pattern: objid_pattern.into(),
            operations: operations.iter().map(|op| op.to_string()).collect(),
        }
    }

    fn field_matches(granted: &str, requested: &str) -> bool {
        granted == WILDCARD || granted == requested
    }

    pub fn allows(&self, objtype: &str, objdef: &str, objid: &str, operation: &str) -> bool {
        Self::field_matches(&self.objtype, objtype)
            && Self::field_matches(&self.objdef, objdef)
            && self
                .operations
                .iter()
                .any(|op| Self::field_matches(op, operation))
            && objid::matches_pattern(objid, &self.objid_pattern)
    }
}

/// Authorizer backed by a static grant list
#[derive(Debug, Default, Clone)]
pub struct ObjidScopeAuthorizer {
    grants: Vec<Grant>,
}

impl ObjidScopeAuthorizer {
    pub fn new(grants: Vec<Grant>) -> Self {
        Self { grants }
    }

    pub fn with_grant(mut self, grant: Grant) -> Self {
        self.grants.push(grant);
        self
    }
}

#[async_trait]
impl Authorizer for ObjidScopeAuthorizer {
    async fn check_authorization(
        &self,
        objtype: &str,
        objdef: &str,
        objid: &str,
        operation: &str,
    ) -> CoreResult<()> {
        if self
            .grants
            .iter()
            .any(|grant| grant.allows(objtype, objdef, objid, operation))
        {
            return Ok(());
        }
        tracing::warn!(objtype, objdef, objid, operation, "Authorization denied");
        Err(CoreError::AuthorizationDenied {
            objtype: objtype.to_string(),
            objid: objid.to_string(),
            operation: operation.to_string(),
        })
    }
}
