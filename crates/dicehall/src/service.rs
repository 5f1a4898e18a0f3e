//! Player-facing operations, independent of the transport.
//!
//! Every call except [`SessionService::join`], [`SessionService::sign_in`],
//! [`SessionService::refresh_auth`] and [`SessionService::logout`] takes the caller's verified [`Principal`]
//! and the session it addresses; the principal's token must be bound to
//! that session.

use std::sync::Arc;

use dicehall_auth::{Identity, IdentityResolver, Principal, TokenPair};
use dicehall_engine::{Action, Difficulty, JoinInfo, Session, SessionSnapshot, TurnResult};
use dicehall_protocol::{ChatChannel, ParticipantId, RoomRef, SessionId};
use dicehall_store::SessionStore;
use tracing::{debug, info};

use crate::DicehallError;
use crate::registry::SessionRegistry;
use crate::room::{EventSender, SessionHandle};

/// What a client asks for when joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room: RoomRef,
    pub display_name: Option<String>,
    pub as_observer: bool,
    /// Applies only if the join creates the room.
    pub difficulty: Option<Difficulty>,
    /// External identity assertion; `None` joins as a guest.
    pub assertion: Option<String>,
}

impl JoinRequest {
    pub fn new(room: RoomRef) -> Self {
        Self {
            room,
            display_name: None,
            as_observer: false,
            difficulty: None,
            assertion: None,
        }
    }
}

/// A successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Joined {
    pub participant_id: ParticipantId,
    pub session_id: SessionId,
    /// The participant already held a seat and was reconnected to it.
    pub rejoined: bool,
    /// Bound to `session_id`.
    pub tokens: TokenPair,
    pub snapshot: SessionSnapshot,
}

pub struct SessionService<S: SessionStore<Session>> {
    registry: Arc<SessionRegistry<S>>,
    identities: IdentityResolver,
}

impl<S: SessionStore<Session>> SessionService<S> {
    pub(crate) fn new(registry: Arc<SessionRegistry<S>>, identities: IdentityResolver) -> Self {
        Self { registry, identities }
    }

    /// Seats the caller in the addressed room and issues a token pair bound
    /// to it.
    ///
    /// `current` is the caller's existing principal, if the connection
    /// already has one; it keeps the same identity when no assertion is
    /// given.
    pub async fn join(&self, request: JoinRequest, current: Option<&Principal>) -> Result<Joined, DicehallError> {
        let identity = match (&request.assertion, current) {
            (Some(assertion), _) => self.identities.resolve(assertion).await?,
            (None, Some(principal)) => Identity::new(principal.subject.clone()),
            (None, None) => Identity::guest(),
        };
        let participant_id = identity.participant_id();
        let display_name = request
            .display_name
            .clone()
            .or_else(|| identity.display_name.clone())
            .unwrap_or_else(|| format!("Guest {:04}", participant_id.0 % 10_000));

        let handle = self.registry.resolve(&request.room, request.difficulty).await?;
        let session_id = handle.id();
        let (outcome, snapshot) = handle
            .join(JoinInfo {
                participant_id,
                display_name,
                as_observer: request.as_observer,
            })
            .await?;

        let tokens = self
            .registry
            .context()
            .tokens
            .issue_token_pair(&identity, Some(session_id))?;
        info!(
            session = %session_id,
            participant = %participant_id,
            rejoined = outcome.rejoined,
            guest = identity.is_guest(),
            "participant joined"
        );
        Ok(Joined {
            participant_id,
            session_id,
            rejoined: outcome.rejoined,
            tokens,
            snapshot,
        })
    }

    /// Exchanges an identity assertion for a token pair bound to no
    /// session. Admin tools accept it; session calls do not.
    pub async fn sign_in(&self, assertion: &str) -> Result<(Principal, TokenPair), DicehallError> {
        let identity = self.identities.resolve(assertion).await?;
        let tokens = self.registry.context().tokens.issue_token_pair(&identity, None)?;
        let principal = self.authenticate(&tokens.access_token)?;
        info!(participant = %principal.participant_id, "signed in without a seat");
        Ok((principal, tokens))
    }

    /// Verifies an access token.
    pub fn authenticate(&self, access_token: &str) -> Result<Principal, DicehallError> {
        Ok(self.registry.context().tokens.verify_access_token(access_token)?)
    }

    /// Liveness signal; returns the current snapshot.
    pub async fn heartbeat(&self, principal: &Principal, session_id: SessionId) -> Result<SessionSnapshot, DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle.heartbeat(principal.participant_id).await
    }

    /// Rotates a refresh token into a new pair.
    pub fn refresh_auth(&self, refresh_token: &str) -> Result<(Principal, TokenPair), DicehallError> {
        Ok(self.registry.context().tokens.refresh(refresh_token)?)
    }

    pub async fn submit_action(
        &self,
        principal: &Principal,
        session_id: SessionId,
        turn_seq: u64,
        action: Action,
    ) -> Result<TurnResult, DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle
            .submit_action(principal.participant_id, turn_seq, action)
            .await
    }

    pub async fn queue_next(&self, principal: &Principal, session_id: SessionId) -> Result<(), DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle.queue_next(principal.participant_id).await
    }

    /// Sends a chat message through the filter chain.
    ///
    /// # Errors
    /// [`DicehallError::PolicyRejected`] when a filter rejects it.
    pub async fn room_channel_message(
        &self,
        principal: &Principal,
        session_id: SessionId,
        channel: ChatChannel,
        body: String,
    ) -> Result<(), DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle.chat(principal.participant_id, channel, body).await
    }

    /// Returns whether the block list changed.
    pub async fn set_block(
        &self,
        principal: &Principal,
        session_id: SessionId,
        target: ParticipantId,
        blocked: bool,
    ) -> Result<bool, DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle
            .set_block(principal.participant_id, target, blocked)
            .await
    }

    /// Fills empty seats with bots.
    pub async fn add_bots(
        &self,
        principal: &Principal,
        session_id: SessionId,
        count: u32,
    ) -> Result<SessionSnapshot, DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle.add_bots(principal.participant_id, count).await
    }

    /// The authoritative snapshot, at least as new as `known_version`.
    ///
    /// # Errors
    /// [`DicehallError::Store`] with a stale error (410) when the store
    /// never caught up.
    pub async fn resync(
        &self,
        principal: &Principal,
        session_id: SessionId,
        known_version: u64,
    ) -> Result<SessionSnapshot, DicehallError> {
        let handle = self
            .session_for(principal, session_id, Some(known_version))
            .await?;
        handle.snapshot(Some(principal.participant_id)).await
    }

    /// Gives up the seat.
    pub async fn leave(&self, principal: &Principal, session_id: SessionId) -> Result<(), DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        handle.leave(principal.participant_id).await
    }

    /// Revokes `token`.
    pub fn logout(&self, token: &str) -> Result<(), DicehallError> {
        self.registry.context().tokens.revoke(token)?;
        debug!("token revoked on logout");
        Ok(())
    }

    /// Starts delivering the session's broadcasts to `sender`.
    pub(crate) async fn subscribe(
        &self,
        principal: &Principal,
        session_id: SessionId,
        sender: EventSender,
    ) -> Result<(SessionHandle, u64, SessionSnapshot), DicehallError> {
        let handle = self.session_for(principal, session_id, None).await?;
        let (subscription, snapshot) = handle.subscribe(principal.participant_id, sender).await?;
        Ok((handle, subscription, snapshot))
    }

    async fn session_for(
        &self,
        principal: &Principal,
        session_id: SessionId,
        expected_version: Option<u64>,
    ) -> Result<SessionHandle, DicehallError> {
        if principal.session_id != Some(session_id) {
            return Err(DicehallError::NotParticipant(session_id));
        }
        self.registry.get(session_id, expected_version).await
    }
}
