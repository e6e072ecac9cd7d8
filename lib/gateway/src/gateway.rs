//! The shared realtime connection.
//!
//! One [`ConnectionGateway`] owns the provider connection for the whole
//! dashboard. Sessions register keyed event handlers on it; a pump task
//! forwards every provider event, in provider order, to every handler.

use crate::error::{ConnectionError, EventError};
use crate::provider::{MessagingProvider, ProviderEvent};
use chrono::{DateTime, Utc};
use rootcause::Report;
use servicebell_core::ParticipantId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Callback invoked for every provider event.
pub type EventHandler = Arc<dyn Fn(&ProviderEvent) -> Result<(), EventError> + Send + Sync>;

/// Proof of a handler registration.
///
/// Removing by registration only succeeds while the registration is still
/// the current one for its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    key: String,
    generation: u64,
}

impl Registration {
    /// The key the handler was registered under.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// The identity the provider accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedIdentity {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub connected_at: DateTime<Utc>,
}

struct HandlerEntry {
    generation: u64,
    handler: EventHandler,
}

#[derive(Default)]
struct HandlerRegistry {
    next_generation: AtomicU64,
    entries: RwLock<HashMap<String, HandlerEntry>>,
}

impl HandlerRegistry {
    fn insert(&self, key: String, handler: EventHandler) -> Registration {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries
            .insert(
                key.clone(),
                HandlerEntry {
                    generation,
                    handler,
                },
            )
            .is_some()
        {
            debug!(key = %key, "replaced existing event handler");
        }
        Registration { key, generation }
    }

    fn remove(&self, key: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key).is_some()
    }

    fn remove_registration(&self, registration: &Registration) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&registration.key) {
            Some(entry) if entry.generation == registration.generation => {
                entries.remove(&registration.key);
                true
            }
            _ => false,
        }
    }

    fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn contains(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn dispatch(&self, event: &ProviderEvent) {
        // Handlers run outside the lock so they may (un)register.
        let handlers: Vec<(String, EventHandler)> = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, entry)| (key.clone(), entry.handler.clone()))
            .collect();

        for (key, handler) in handlers {
            if let Err(e) = handler(event) {
                warn!(key = %key, error = %e, "event handler failed");
            }
        }
    }
}

struct Connection {
    identity: ConnectedIdentity,
    pump: JoinHandle<()>,
}

/// Owner of the single provider connection.
pub struct ConnectionGateway {
    provider: Arc<dyn MessagingProvider>,
    connection: Mutex<Option<Connection>>,
    participant: RwLock<Option<ParticipantId>>,
    handlers: Arc<HandlerRegistry>,
    online: Arc<AtomicBool>,
}

impl ConnectionGateway {
    /// Creates a disconnected gateway.
    #[must_use]
    pub fn new(provider: Arc<dyn MessagingProvider>) -> Self {
        Self {
            provider,
            connection: Mutex::new(None),
            participant: RwLock::new(None),
            handlers: Arc::new(HandlerRegistry::default()),
            online: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The provider channel operations go through.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn MessagingProvider> {
        &self.provider
    }

    /// Connects as `participant_id`.
    ///
    /// Reuses the live connection when it already belongs to the same
    /// participant. Connecting as another participant replaces the
    /// connection; handlers then receive [`ProviderEvent::ConnectionLost`]
    /// since the connection no longer carries the identity they were using.
    ///
    /// # Errors
    ///
    /// Returns an error if the provider is unreachable or rejects the
    /// identity.
    #[instrument(skip(self, display_name), fields(participant_id = %participant_id))]
    pub async fn connect(
        &self,
        participant_id: &ParticipantId,
        display_name: &str,
    ) -> Result<ConnectedIdentity, Report<ConnectionError>> {
        let mut connection = self.connection.lock().await;

        if let Some(existing) = connection.as_ref() {
            if existing.identity.participant_id == *participant_id
                && self.is_online()
                && !existing.pump.is_finished()
            {
                debug!("reusing live connection");
                return Ok(existing.identity.clone());
            }
        }

        let established = self
            .provider
            .connect(participant_id, display_name)
            .await
            .map_err(|e| ConnectionError::from_provider(participant_id, e))?;

        let displaced = connection.take().and_then(|previous| {
            previous.pump.abort();
            debug!(previous = %previous.identity.participant_id, "replaced previous connection");
            (previous.identity.participant_id != established.participant_id)
                .then_some(previous.identity.participant_id)
        });

        let identity = ConnectedIdentity {
            participant_id: established.participant_id,
            display_name: established.nickname,
            connected_at: Utc::now(),
        };
        self.online.store(true, Ordering::SeqCst);
        let pump = tokio::spawn(pump_events(
            established.events,
            self.handlers.clone(),
            self.online.clone(),
        ));
        *self.participant.write().unwrap_or_else(PoisonError::into_inner) =
            Some(identity.participant_id.clone());
        *connection = Some(Connection {
            identity: identity.clone(),
            pump,
        });

        if let Some(previous) = displaced {
            info!(previous = %previous, "connection switched to another participant");
            self.handlers.dispatch(&ProviderEvent::ConnectionLost);
        }
        info!("connected to messaging provider");
        Ok(identity)
    }

    /// Whether the connection is up and carries `participant_id`.
    #[must_use]
    pub fn is_connected_as(&self, participant_id: &ParticipantId) -> bool {
        self.is_online()
            && self
                .participant
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                == Some(participant_id)
    }

    /// Whether the realtime connection is up.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Registers `handler` under `key`, replacing any handler already there.
    pub fn register_handler(&self, key: impl Into<String>, handler: EventHandler) -> Registration {
        let registration = self.handlers.insert(key.into(), handler);
        debug!(key = %registration.key, "event handler registered");
        registration
    }

    /// Removes whatever handler is registered under `key`.
    pub fn remove_handler(&self, key: &str) -> bool {
        let removed = self.handlers.remove(key);
        if removed {
            debug!(key = %key, "event handler removed");
        }
        removed
    }

    /// Removes the handler only if `registration` is still current.
    pub fn remove_registration(&self, registration: &Registration) -> bool {
        let removed = self.handlers.remove_registration(registration);
        if removed {
            debug!(key = %registration.key, "event handler removed");
        }
        removed
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Whether a handler is registered under `key`.
    #[must_use]
    pub fn has_handler(&self, key: &str) -> bool {
        self.handlers.contains(key)
    }

    /// Delivers `event` to every handler, as the pump does.
    pub fn dispatch(&self, event: &ProviderEvent) {
        self.handlers.dispatch(event);
    }
}

impl Drop for ConnectionGateway {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.pump.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGateway")
            .field("online", &self.is_online())
            .field("handlers", &self.handler_count())
            .finish_non_exhaustive()
    }
}

async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ProviderEvent>,
    handlers: Arc<HandlerRegistry>,
    online: Arc<AtomicBool>,
) {
    while let Some(event) = events.recv().await {
        match &event {
            ProviderEvent::ConnectionLost => {
                online.store(false, Ordering::SeqCst);
                warn!("realtime connection lost, provider is reconnecting");
            }
            ProviderEvent::ConnectionRestored => {
                online.store(true, Ordering::SeqCst);
                info!("realtime connection restored");
            }
            _ => {}
        }
        handlers.dispatch(&event);
    }
    online.store(false, Ordering::SeqCst);
    debug!("provider event stream ended");
}
