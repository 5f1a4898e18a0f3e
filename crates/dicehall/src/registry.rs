//! Resident sessions, by id and by room code.
//!
//! The registry map is the only cross-session shared state besides the
//! store. Its lock guards map lookups and inserts only; store reads and
//! actor calls happen with the lock released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dicehall_addon::FilterRegistry;
use dicehall_auth::TokenService;
use dicehall_engine::{Difficulty, EngineConfig, LifecycleState, RoomKind, Session};
use dicehall_protocol::{RoomRef, SessionId};
use dicehall_store::{SessionStore, StoreError, StoreSync};
use dicehall_timer::TimerConfig;
use tracing::{debug, info};

use crate::DicehallError;
use crate::clock::Clock;
use crate::config::normalize_code;
use crate::room::{SessionHandle, spawn_session};

/// What every session actor shares.
pub(crate) struct SessionContext<S: SessionStore<Session>> {
    pub(crate) engine: EngineConfig,
    pub(crate) timers: TimerConfig,
    pub(crate) filters: FilterRegistry,
    pub(crate) sync: StoreSync<S, Session>,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) clock: Clock,
    pub(crate) channel_size: usize,
}

#[derive(Default)]
struct Resident {
    sessions: HashMap<SessionId, SessionHandle>,
    codes: HashMap<String, SessionId>,
}

/// Session ids fit in a JSON number exactly.
const ID_MASK: u64 = (1 << 53) - 1;

/// A random nonzero id that is not resident here.
fn fresh_id(resident: &Resident) -> SessionId {
    loop {
        let id = SessionId(rand::random::<u64>() & ID_MASK);
        if id.0 != 0 && !resident.sessions.contains_key(&id) {
            return id;
        }
    }
}

pub(crate) struct SessionRegistry<S: SessionStore<Session>> {
    ctx: Arc<SessionContext<S>>,
    public_rooms: Vec<String>,
    resident: Mutex<Resident>,
}

impl<S: SessionStore<Session>> SessionRegistry<S> {
    pub(crate) fn new(ctx: SessionContext<S>, public_rooms: Vec<String>) -> Self {
        Self {
            ctx: Arc::new(ctx),
            public_rooms,
            resident: Mutex::new(Resident::default()),
        }
    }

    pub(crate) fn context(&self) -> &SessionContext<S> {
        &self.ctx
    }

    fn resident(&self) -> MutexGuard<'_, Resident> {
        self.resident.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Finds the session a join addresses.
    ///
    /// An unknown code creates a room: public if the code is configured as
    /// public, private otherwise. `difficulty` applies only to a room
    /// created here.
    pub(crate) async fn resolve(
        &self,
        room: &RoomRef,
        difficulty: Option<Difficulty>,
    ) -> Result<SessionHandle, DicehallError> {
        match room {
            RoomRef::Id(id) => self.get(*id, None).await,
            RoomRef::Code(code) => Ok(self.by_code(&normalize_code(code), difficulty)),
        }
    }

    fn by_code(&self, code: &str, difficulty: Option<Difficulty>) -> SessionHandle {
        let mut resident = self.resident();
        if let Some(handle) = resident
            .codes
            .get(code)
            .and_then(|id| resident.sessions.get(id))
            .filter(|h| !h.is_closed())
        {
            return handle.clone();
        }

        let kind = if self.public_rooms.iter().any(|c| c == code) {
            RoomKind::Public
        } else {
            RoomKind::Private
        };
        let id = fresh_id(&resident);
        let session = Session::new(
            id,
            code,
            kind,
            self.ctx.engine.game_config(difficulty),
            rand::random(),
            self.ctx.clock.now_ms(),
        );
        info!(session = %id, %code, ?kind, "session created");

        let handle = spawn_session(session, Arc::clone(&self.ctx));
        if let Some(old) = resident.codes.insert(code.to_string(), id) {
            resident.sessions.remove(&old);
        }
        resident.sessions.insert(id, handle.clone());
        handle
    }

    /// The resident actor for `id`, rehydrating it from the store if it is
    /// not loaded here. `expected_version` is the newest version the caller
    /// has seen.
    pub(crate) async fn get(
        &self,
        id: SessionId,
        expected_version: Option<u64>,
    ) -> Result<SessionHandle, DicehallError> {
        if let Some(handle) = self.lookup(id) {
            return Ok(handle);
        }

        let session = self.ctx.sync.rehydrate(id, expected_version).await.map_err(|e| match e {
            StoreError::NotFound(id) => DicehallError::SessionNotFound(id),
            other => DicehallError::Store(other),
        })?;
        if session.state == LifecycleState::Expired {
            return Err(DicehallError::SessionExpired(id));
        }

        let mut resident = self.resident();
        // Another request may have loaded it while the lock was released.
        if let Some(handle) = resident.sessions.get(&id).filter(|h| !h.is_closed()) {
            return Ok(handle.clone());
        }
        debug!(session = %id, version = session.version, "session rehydrated");
        resident.codes.insert(session.code.clone(), id);
        let handle = spawn_session(session, Arc::clone(&self.ctx));
        resident.sessions.insert(id, handle.clone());
        Ok(handle)
    }

    fn lookup(&self, id: SessionId) -> Option<SessionHandle> {
        let mut resident = self.resident();
        match resident.sessions.get(&id) {
            Some(handle) if handle.is_closed() => {
                resident.sessions.remove(&id);
                resident.codes.retain(|_, v| *v != id);
                None
            }
            other => other.cloned(),
        }
    }

    /// Handles of every live resident session.
    pub(crate) fn handles(&self) -> Vec<SessionHandle> {
        let mut resident = self.resident();
        resident.sessions.retain(|_, h| !h.is_closed());
        let live: Vec<SessionId> = resident.sessions.keys().copied().collect();
        resident.codes.retain(|_, id| live.contains(id));
        resident.sessions.values().cloned().collect()
    }

    /// Stops every actor and flushes pending writes.
    pub(crate) async fn shutdown(&self) -> Result<usize, DicehallError> {
        for handle in self.handles() {
            handle.shutdown().await;
        }
        Ok(self.ctx.sync.close().await?)
    }
}
