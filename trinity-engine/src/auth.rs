//! ABOUTME: Role-based authorization for definition and execution operations

use trinity_core::{EngineError, Result};

/// Platform roles, broadest last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Read-only access to executions and definitions.
    Viewer,
    /// Start, cancel, and decide.
    Operator,
    /// Author and publish definitions.
    Designer,
    /// Everything, including circuit resets and recovery introspection.
    Admin,
}

/// Operations gated by roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewExecutions,
    StartExecution,
    CancelExecution,
    DecideApproval,
    CreateDefinition,
    PublishDefinition,
    ResetCircuit,
    ViewRecovery,
}

impl Role {
    #[must_use]
    pub const fn allows(self, permission: Permission) -> bool {
        match self {
            Self::Admin => true,
            Self::Designer => matches!(
                permission,
                Permission::ViewExecutions
                    | Permission::CreateDefinition
                    | Permission::PublishDefinition
            ),
            Self::Operator => matches!(
                permission,
                Permission::ViewExecutions
                    | Permission::StartExecution
                    | Permission::CancelExecution
                    | Permission::DecideApproval
            ),
            Self::Viewer => matches!(permission, Permission::ViewExecutions),
        }
    }
}

/// An authenticated caller: identity plus granted roles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub id: String,
    pub email: Option<String>,
    pub roles: Vec<Role>,
}

impl Actor {
    #[must_use]
    pub fn new(id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            id: id.into(),
            email: None,
            roles,
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// System actor used by internal control flows (cron, recovery).
    #[must_use]
    pub fn system() -> Self {
        Self::new("system", vec![Role::Admin])
    }

    #[must_use]
    pub fn can(&self, permission: Permission) -> bool {
        self.roles.iter().any(|role| role.allows(permission))
    }

    /// Guard an operation, naming it in the refusal.
    pub fn require(&self, permission: Permission) -> Result<()> {
        if self.can(permission) {
            Ok(())
        } else {
            Err(EngineError::Unauthorized {
                message: format!("actor '{}' lacks {permission:?}", self.id),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_permission_matrix() {
        assert!(Role::Viewer.allows(Permission::ViewExecutions));
        assert!(!Role::Viewer.allows(Permission::StartExecution));
        assert!(Role::Operator.allows(Permission::DecideApproval));
        assert!(!Role::Operator.allows(Permission::PublishDefinition));
        assert!(Role::Designer.allows(Permission::PublishDefinition));
        assert!(!Role::Designer.allows(Permission::ResetCircuit));
        assert!(Role::Admin.allows(Permission::ResetCircuit));
    }

    #[test]
    fn require_names_the_actor() {
        let actor = Actor::new("eve", vec![Role::Viewer]);
        let err = actor.require(Permission::CancelExecution).unwrap_err();
        assert!(err.to_string().contains("eve"));
    }
}
