//! `DicehallServer` builder and accept loop.
//!
//! The builder wires the layers together: store sync, tokens, identity
//! resolution, filters, the session registry and the two services. The
//! services can be built without a listener for embedding and tests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dicehall_addon::{FilterDescriptor, FilterRegistry};
use dicehall_auth::{AdminDirectory, IdentityResolver, IdentityVerifier, JwtAssertionVerifier, LegacyLookup, TokenService};
use dicehall_engine::Session;
use dicehall_protocol::{Codec, JsonCodec};
use dicehall_store::{SessionStore, StoreSync};
use dicehall_transport::{Transport, WebSocketTransport};

use crate::admin::AdminService;
use crate::clock::Clock;
use crate::config::{ServerConfig, normalize_code};
use crate::handler::handle_connection;
use crate::registry::{SessionContext, SessionRegistry};
use crate::service::SessionService;
use crate::DicehallError;

/// Shared state passed to each connection task.
pub(crate) struct ServerState<S: SessionStore<Session>, C: Codec> {
    pub(crate) sessions: Arc<SessionService<S>>,
    pub(crate) admin: Arc<AdminService<S>>,
    pub(crate) codec: C,
    pub(crate) clock: Clock,
    pub(crate) receive_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
}

/// Builder for the Dicehall server.
///
/// # Example
///
/// ```rust,ignore
/// use dicehall::prelude::*;
///
/// let server = DicehallServerBuilder::new()
///     .config(ServerConfig::from_env())
///     .build(Arc::new(MemoryStore::<Session>::new()))
///     .await?;
/// server.run().await
/// ```
pub struct DicehallServerBuilder {
    config: ServerConfig,
    clock: Clock,
    legacy: LegacyLookup,
    filters: Vec<FilterDescriptor>,
}

impl DicehallServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            clock: Clock::default(),
            legacy: LegacyLookup::new(),
            filters: Vec::new(),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the bind address from the config.
    pub fn bind(mut self, addr: &str) -> Self {
        self.config.bind = addr.to_string();
        self
    }

    pub fn clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Accounts accepted by the legacy identity lookup.
    pub fn legacy_accounts(mut self, legacy: LegacyLookup) -> Self {
        self.legacy = legacy;
        self
    }

    /// Adds a chat filter after the built-in ones.
    pub fn filter(mut self, descriptor: FilterDescriptor) -> Self {
        self.filters.push(descriptor);
        self
    }

    /// Builds the services without binding a listener.
    ///
    /// Must be called inside a Tokio runtime; it spawns the store flusher.
    pub fn build_services<S: SessionStore<Session>>(self, store: Arc<S>) -> Result<Services<S>, DicehallError> {
        let config = self.config;

        let mut filters = FilterRegistry::with_defaults(&config.addons);
        for descriptor in self.filters {
            filters.register(descriptor)?;
        }

        let legacy: Arc<dyn IdentityVerifier> = Arc::new(self.legacy);
        let identities = match &config.identity_secret {
            Some(secret) => {
                let jwt = JwtAssertionVerifier::new(secret, config.identity_issuer.as_deref());
                IdentityResolver::new(Arc::new(jwt), config.claims_cache_ttl).with_fallback(legacy)
            }
            None => IdentityResolver::new(legacy, config.claims_cache_ttl),
        };

        let ctx = SessionContext {
            engine: config.engine.clone().validated(),
            timers: config.timers.clone(),
            filters,
            sync: StoreSync::new(store, config.store.clone()),
            tokens: Arc::new(TokenService::new(config.tokens.clone())),
            clock: self.clock,
            channel_size: config.channel_size.max(1),
        };
        let public_rooms = config.public_rooms.iter().map(|c| normalize_code(c)).collect();
        let registry = Arc::new(SessionRegistry::new(ctx, public_rooms));
        let directory = Arc::new(AdminDirectory::with_records(config.admins.clone()));

        Ok(Services {
            sessions: Arc::new(SessionService::new(Arc::clone(&registry), identities)),
            admin: Arc::new(AdminService::new(Arc::clone(&registry), directory)),
            registry,
            config,
        })
    }

    /// Builds the services and binds the WebSocket listener.
    pub async fn build<S: SessionStore<Session>>(self, store: Arc<S>) -> Result<DicehallServer<S, JsonCodec>, DicehallError> {
        let services = self.build_services(store)?;
        let transport = WebSocketTransport::bind(&services.config.bind, services.config.handshake.clone()).await?;

        let state = Arc::new(ServerState {
            sessions: Arc::clone(&services.sessions),
            admin: Arc::clone(&services.admin),
            codec: JsonCodec,
            clock: services.registry.context().clock,
            receive_timeout: services.config.receive_timeout,
            handshake_timeout: services.config.handshake_timeout,
        });

        Ok(DicehallServer {
            transport,
            state,
            services,
        })
    }
}

impl Default for DicehallServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The session and admin services over one registry.
pub struct Services<S: SessionStore<Session>> {
    sessions: Arc<SessionService<S>>,
    admin: Arc<AdminService<S>>,
    registry: Arc<SessionRegistry<S>>,
    config: ServerConfig,
}

impl<S: SessionStore<Session>> Services<S> {
    pub fn sessions(&self) -> Arc<SessionService<S>> {
        Arc::clone(&self.sessions)
    }

    pub fn admin(&self) -> Arc<AdminService<S>> {
        Arc::clone(&self.admin)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stops every session actor and flushes pending store writes.
    /// Returns how many writes the final flush landed.
    pub async fn shutdown(&self) -> Result<usize, DicehallError> {
        self.registry.shutdown().await
    }
}

/// A bound Dicehall server.
///
/// Call [`run()`](Self::run) to start accepting connections.
pub struct DicehallServer<S: SessionStore<Session>, C: Codec> {
    transport: WebSocketTransport,
    state: Arc<ServerState<S, C>>,
    services: Services<S>,
}

impl<S, C> DicehallServer<S, C>
where
    S: SessionStore<Session>,
    C: Codec + 'static,
{
    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn services(&self) -> &Services<S> {
        &self.services
    }

    /// Runs the accept loop until the process is terminated.
    pub async fn run(self) -> Result<(), DicehallError> {
        self.run_until(std::future::pending()).await
    }

    /// Runs the accept loop until `shutdown` resolves, then stops every
    /// session and flushes the store.
    pub async fn run_until(mut self, shutdown: impl Future<Output = ()>) -> Result<(), DicehallError> {
        tracing::info!("dicehall server running");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.transport.accept() => match accepted {
                    Ok(conn) => {
                        let state = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(conn, state).await {
                                tracing::debug!(error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "accept failed");
                    }
                },
                () = &mut shutdown => break,
            }
        }

        let flushed = self.services.shutdown().await?;
        tracing::info!(flushed, "dicehall server stopped");
        Ok(())
    }
}
