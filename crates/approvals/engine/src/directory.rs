//! People directory: who reports to whom, who holds which role
//!
//! The engine never owns user records. It asks a [`Directory`] to resolve
//! supervisors, department representatives and role members for task
//! assignment, and to look up the performer's role for the permission pass.

use approvals_types::{UserId, WorkflowError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

/// Directory lookup failure
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory unavailable: {0}")]
    Unavailable(String),
}

impl From<DirectoryError> for WorkflowError {
    fn from(err: DirectoryError) -> Self {
        WorkflowError::Directory(err.to_string())
    }
}

/// A role as seen by the permission pass
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub id: String,
    pub name: String,
    /// Coarse seniority; compared against `permissions.supervisor_level`
    #[serde(default)]
    pub level: u8,
    /// Satisfies every `admin` and `supervisor` token
    #[serde(default)]
    pub full_access: bool,
}

impl RoleInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            level: 0,
            full_access: false,
        }
    }

    pub fn with_level(mut self, level: u8) -> Self {
        self.level = level;
        self
    }

    pub fn with_full_access(mut self) -> Self {
        self.full_access = true;
        self
    }

    /// Elevated roles represent their department
    pub fn is_elevated(&self, supervisor_level: u8) -> bool {
        self.full_access || self.level >= supervisor_level
    }
}

/// A directory entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supervisor_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<RoleInfo>,
}

fn default_active() -> bool {
    true
}

impl DirectoryUser {
    pub fn new(id: impl Into<String>) -> Self {
        let id: String = id.into();
        Self {
            display_name: id.clone(),
            id: UserId::new(id),
            active: true,
            supervisor_id: None,
            department_id: None,
            role: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: impl Into<String>) -> Self {
        self.supervisor_id = Some(UserId::new(supervisor));
        self
    }

    pub fn in_department(mut self, department: impl Into<String>) -> Self {
        self.department_id = Some(department.into());
        self
    }

    pub fn with_role(mut self, role: RoleInfo) -> Self {
        self.role = Some(role);
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Read access to the organisation's people
pub trait Directory: Send + Sync {
    fn user(&self, id: &UserId) -> Result<Option<DirectoryUser>, DirectoryError>;

    /// The recorded supervisor of a user, if that supervisor is active
    fn direct_supervisor(&self, id: &UserId) -> Result<Option<UserId>, DirectoryError> {
        let Some(user) = self.user(id)? else {
            return Ok(None);
        };
        let Some(supervisor_id) = user.supervisor_id else {
            return Ok(None);
        };
        Ok(self
            .user(&supervisor_id)?
            .filter(|s| s.active)
            .map(|s| s.id))
    }

    /// An active department member with an elevated role
    fn department_representative(
        &self,
        department_id: &str,
        supervisor_level: u8,
    ) -> Result<Option<UserId>, DirectoryError>;

    /// Any active member holding a role
    fn role_member(&self, role_id: &str) -> Result<Option<UserId>, DirectoryError>;
}

/// In-memory directory for embedding and tests
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    users: RwLock<BTreeMap<UserId, DirectoryUser>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: DirectoryUser) -> Self {
        // A fresh directory has no other lock holders
        if let Ok(mut users) = self.users.write() {
            users.insert(user.id.clone(), user);
        }
        self
    }

    pub fn upsert(&self, user: DirectoryUser) -> Result<(), DirectoryError> {
        self.users
            .write()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?
            .insert(user.id.clone(), user);
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        Ok(self
            .users
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?
            .values()
            .cloned()
            .collect())
    }
}

impl Directory for InMemoryDirectory {
    fn user(&self, id: &UserId) -> Result<Option<DirectoryUser>, DirectoryError> {
        Ok(self
            .users
            .read()
            .map_err(|_| DirectoryError::Unavailable("directory lock poisoned".into()))?
            .get(id)
            .cloned())
    }

    fn department_representative(
        &self,
        department_id: &str,
        supervisor_level: u8,
    ) -> Result<Option<UserId>, DirectoryError> {
        // Highest level wins; ties break on id for determinism
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|u| u.active && u.department_id.as_deref() == Some(department_id))
            .filter_map(|u| {
                let role = u.role.as_ref()?;
                role.is_elevated(supervisor_level)
                    .then(|| (role.full_access, role.level, u.id.clone()))
            })
            .max_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)).then(b.2.cmp(&a.2)))
            .map(|(_, _, id)| id))
    }

    fn role_member(&self, role_id: &str) -> Result<Option<UserId>, DirectoryError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .find(|u| u.active && u.role.as_ref().is_some_and(|r| r.id == role_id))
            .map(|u| u.id))
    }
}
