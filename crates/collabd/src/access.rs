//! Authentication and permission collaborators.
//!
//! The daemon never evaluates credentials or roles itself; it asks an
//! [`Authenticator`] who a token belongs to and a [`PermissionCheck`]
//! whether that user holds a [`Capability`] on a workspace. The bundled
//! implementations are static tables loaded from configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{CollabError, CollabResult};

/// Capabilities a user may hold on a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Capability {
    Read,
    Write,
    Execute,
    Admin,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Read => write!(f, "READ"),
            Capability::Write => write!(f, "WRITE"),
            Capability::Execute => write!(f, "EXECUTE"),
            Capability::Admin => write!(f, "ADMIN"),
        }
    }
}

/// Workspace membership roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn grants(self, capability: Capability) -> bool {
        match (self, capability) {
            (Role::Owner, _) => true,
            (Role::Editor, Capability::Admin) => false,
            (Role::Editor, _) => true,
            (Role::Viewer, Capability::Read) => true,
            (Role::Viewer, _) => false,
        }
    }
}

/// Answers "may this user do this on that workspace".
#[async_trait]
pub trait PermissionCheck: Send + Sync {
    async fn has_access(&self, workspace_id: &str, user_id: &str, capability: Capability) -> bool;
}

/// Resolves a bearer token to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> CollabResult<String>;
}

/// Role table: workspace id -> user id -> role.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleGrants {
    grants: HashMap<String, HashMap<String, Role>>,
}

impl RoleGrants {
    pub fn new(grants: HashMap<String, HashMap<String, Role>>) -> Self {
        Self { grants }
    }

    pub fn grant(&mut self, workspace_id: &str, user_id: &str, role: Role) {
        self.grants
            .entry(workspace_id.to_string())
            .or_default()
            .insert(user_id.to_string(), role);
    }

    pub fn role(&self, workspace_id: &str, user_id: &str) -> Option<Role> {
        self.grants.get(workspace_id)?.get(user_id).copied()
    }
}

#[async_trait]
impl PermissionCheck for RoleGrants {
    async fn has_access(&self, workspace_id: &str, user_id: &str, capability: Capability) -> bool {
        self.role(workspace_id, user_id)
            .is_some_and(|role| role.grants(capability))
    }
}

/// Token table: bearer token -> user id.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl Authenticator for StaticTokens {
    async fn authenticate(&self, token: &str) -> CollabResult<String> {
        if token.is_empty() {
            return Err(CollabError::Auth("missing token".to_string()));
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| CollabError::Auth("invalid token".to_string()))
    }
}
