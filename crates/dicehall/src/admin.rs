//! Role-gated operator tools.

use std::sync::Arc;

use dicehall_auth::{AdminDirectory, AdminRole, Principal};
use dicehall_engine::{Session, SessionSnapshot};
use dicehall_protocol::{ParticipantId, SessionId};
use dicehall_store::SessionStore;
use tracing::info;

use crate::DicehallError;
use crate::registry::SessionRegistry;

pub struct AdminService<S: SessionStore<Session>> {
    registry: Arc<SessionRegistry<S>>,
    directory: Arc<AdminDirectory>,
}

impl<S: SessionStore<Session>> AdminService<S> {
    pub(crate) fn new(registry: Arc<SessionRegistry<S>>, directory: Arc<AdminDirectory>) -> Self {
        Self { registry, directory }
    }

    pub fn directory(&self) -> &AdminDirectory {
        &self.directory
    }

    fn authorize(&self, principal: &Principal, required: AdminRole) -> Result<AdminRole, DicehallError> {
        Ok(self.directory.authorize(&principal.subject, required)?)
    }

    /// Snapshots of every session resident on this server. Viewer.
    pub async fn list_sessions(&self, principal: &Principal) -> Result<Vec<SessionSnapshot>, DicehallError> {
        self.authorize(principal, AdminRole::Viewer)?;
        let mut sessions = Vec::new();
        for handle in self.registry.handles() {
            // A session that expires mid-listing is simply skipped.
            if let Ok(snapshot) = handle.snapshot(None).await {
                sessions.push(snapshot);
            }
        }
        sessions.sort_by_key(|s| s.id);
        Ok(sessions)
    }

    /// Expires a session now. Operator.
    pub async fn force_expire(&self, principal: &Principal, session_id: SessionId) -> Result<(), DicehallError> {
        self.authorize(principal, AdminRole::Operator)?;
        self.registry.get(session_id, None).await?.expire().await?;
        info!(admin = %principal.subject, session = %session_id, "session force-expired");
        Ok(())
    }

    /// Removes a participant and revokes their tokens. Operator.
    pub async fn remove_participant(
        &self,
        principal: &Principal,
        session_id: SessionId,
        participant: ParticipantId,
    ) -> Result<(), DicehallError> {
        self.authorize(principal, AdminRole::Operator)?;
        self.registry
            .get(session_id, None)
            .await?
            .remove(participant)
            .await?;
        let revoked = self.registry.context().tokens.revoke_participant(participant);
        info!(
            admin = %principal.subject,
            session = %session_id,
            %participant,
            revoked,
            "participant removed"
        );
        Ok(())
    }

    /// Clears strikes, mute and ban. Returns whether there was anything to
    /// clear. Operator.
    pub async fn clear_conduct(
        &self,
        principal: &Principal,
        session_id: SessionId,
        participant: ParticipantId,
    ) -> Result<bool, DicehallError> {
        self.authorize(principal, AdminRole::Operator)?;
        let cleared = self
            .registry
            .get(session_id, None)
            .await?
            .clear_conduct(participant)
            .await?;
        info!(admin = %principal.subject, session = %session_id, %participant, cleared, "conduct cleared");
        Ok(cleared)
    }

    /// Sets or removes an admin role record. Returns the previous role.
    /// Owner.
    pub fn upsert_role(
        &self,
        principal: &Principal,
        subject: &str,
        role: Option<AdminRole>,
    ) -> Result<Option<AdminRole>, DicehallError> {
        self.authorize(principal, AdminRole::Owner)?;
        Ok(self.directory.upsert(subject, role)?)
    }
}
