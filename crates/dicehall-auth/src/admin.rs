//! Admin roles and authorization.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::AuthError;

/// Admin tiers, ordered: `Viewer < Operator < Owner`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    Viewer,
    Operator,
    Owner,
}

impl fmt::Display for AdminRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer => f.write_str("viewer"),
            Self::Operator => f.write_str("operator"),
            Self::Owner => f.write_str("owner"),
        }
    }
}

impl std::str::FromStr for AdminRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "owner" => Ok(Self::Owner),
            other => Err(format!("unknown admin role: {other}")),
        }
    }
}

/// Admin role records keyed by identity subject.
#[derive(Debug, Default)]
pub struct AdminDirectory {
    roles: RwLock<HashMap<String, AdminRole>>,
}

impl AdminDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the directory with `(subject, role)` records.
    pub fn with_records<I, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (S, AdminRole)>,
        S: Into<String>,
    {
        let roles = records.into_iter().map(|(s, r)| (s.into(), r)).collect();
        Self {
            roles: RwLock::new(roles),
        }
    }

    pub fn role_of(&self, subject: &str) -> Option<AdminRole> {
        self.roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subject)
            .copied()
    }

    /// All records, sorted by subject.
    pub fn records(&self) -> Vec<(String, AdminRole)> {
        let mut records: Vec<_> = self
            .roles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(s, r)| (s.clone(), *r))
            .collect();
        records.sort();
        records
    }

    /// Checks that `subject` holds at least `required`.
    pub fn authorize(&self, subject: &str, required: AdminRole) -> Result<AdminRole, AuthError> {
        match self.role_of(subject) {
            Some(role) if role >= required => Ok(role),
            actual => Err(AuthError::Forbidden { required, actual }),
        }
    }

    /// Sets (or with `None`, removes) the role record for `subject`.
    ///
    /// Returns the previous role.
    ///
    /// # Errors
    /// [`AuthError::LastOwner`] if the change would leave no owner.
    pub fn upsert(
        &self,
        subject: &str,
        role: Option<AdminRole>,
    ) -> Result<Option<AdminRole>, AuthError> {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        let previous = roles.get(subject).copied();

        if previous == Some(AdminRole::Owner) && role != Some(AdminRole::Owner) {
            let owners = roles.values().filter(|r| **r == AdminRole::Owner).count();
            if owners <= 1 {
                return Err(AuthError::LastOwner);
            }
        }

        match role {
            Some(role) => roles.insert(subject.to_string(), role),
            None => roles.remove(subject),
        };
        info!(subject, ?previous, ?role, "admin role record updated");
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn directory() -> AdminDirectory {
        AdminDirectory::with_records([
            ("root", AdminRole::Owner),
            ("mod", AdminRole::Operator),
            ("intern", AdminRole::Viewer),
        ])
    }

    #[test]
    fn test_role_ordering() {
        assert!(AdminRole::Viewer < AdminRole::Operator);
        assert!(AdminRole::Operator < AdminRole::Owner);
    }

    #[test]
    fn test_authorize_sufficient_role_ok() {
        let dir = directory();
        assert_eq!(dir.authorize("root", AdminRole::Operator), Ok(AdminRole::Owner));
        assert_eq!(dir.authorize("intern", AdminRole::Viewer), Ok(AdminRole::Viewer));
    }

    #[test]
    fn test_authorize_insufficient_role_forbidden() {
        let err = directory().authorize("intern", AdminRole::Operator).unwrap_err();
        assert_eq!(
            err,
            AuthError::Forbidden {
                required: AdminRole::Operator,
                actual: Some(AdminRole::Viewer),
            }
        );
        assert!(!err.is_authentication());
    }

    #[test]
    fn test_authorize_unknown_subject_forbidden() {
        assert!(matches!(
            directory().authorize("stranger", AdminRole::Viewer),
            Err(AuthError::Forbidden { actual: None, .. })
        ));
    }

    #[test]
    fn test_upsert_returns_previous_role() {
        let dir = directory();
        assert_eq!(dir.upsert("intern", Some(AdminRole::Operator)), Ok(Some(AdminRole::Viewer)));
        assert_eq!(dir.role_of("intern"), Some(AdminRole::Operator));
        assert_eq!(dir.upsert("intern", None), Ok(Some(AdminRole::Operator)));
        assert_eq!(dir.role_of("intern"), None);
    }

    #[test]
    fn test_upsert_demoting_last_owner_rejected() {
        let dir = directory();
        assert_eq!(dir.upsert("root", Some(AdminRole::Viewer)), Err(AuthError::LastOwner));
        dir.upsert("mod", Some(AdminRole::Owner)).unwrap();
        assert!(dir.upsert("root", None).is_ok());
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!("Operator".parse::<AdminRole>(), Ok(AdminRole::Operator));
        assert!("admin".parse::<AdminRole>().is_err());
    }
}
