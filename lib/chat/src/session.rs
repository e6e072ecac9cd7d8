//! Support chat sessions.
//!
//! [`SessionController::open`] returns a [`Session`] right away and
//! bootstraps it on a dedicated task (the session actor):
//!
//! 1. Connect through the shared gateway
//! 2. Resolve the restaurant's channel
//! 3. Adopt the channel, register the event handler, merge history
//! 4. Mark the channel as read
//!
//! The actor then serializes provider events, commands from the [`Session`]
//! handle and its timers (debounced flush, closing grace) in one loop. The
//! UI observes a [`ChatView`] published through a watch channel.

use crate::config::ChatConfig;
use crate::error::{SendError, SessionFailure};
use crate::resolver::ChannelResolver;
use crate::status::{ChannelStatusMachine, ConversationState, Transition};
use crate::sync::{MessageSynchronizer, PendingWrite};
use servicebell_core::{ChannelMetadata, ChannelUrl, Identity, Message, ParticipantId, RestaurantId};
use servicebell_gateway::{
    ConnectionGateway, EventError, EventHandler, MessagingProvider, ProviderError, ProviderEvent,
    Registration, SendMessageParams, convert,
};
use servicebell_store::PersistenceStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{Instrument, debug, info, info_span, warn};

/// Callback run once when the conversation terminates.
pub type OnClose = Box<dyn FnOnce() + Send + 'static>;

/// Gateway handler key of a restaurant's session.
#[must_use]
pub fn handler_key(restaurant_id: &RestaurantId) -> String {
    format!("support-chat:{restaurant_id}")
}

/// Everything the UI renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatView {
    /// The conversation, in order.
    pub messages: Vec<Message>,
    /// Whether the realtime connection is up.
    pub connected: bool,
    /// Whether support is typing.
    pub typing: bool,
    /// Why the session could not start.
    pub error: Option<SessionFailure>,
    /// Whether the session is still starting.
    pub loading: bool,
    /// Lifecycle of the conversation.
    pub state: ConversationState,
    /// The conversation channel, once known.
    pub channel: Option<ChannelMetadata>,
}

impl ChatView {
    fn starting() -> Self {
        Self {
            messages: Vec::new(),
            connected: false,
            typing: false,
            error: None,
            loading: true,
            state: ConversationState::Open,
            channel: None,
        }
    }
}

/// Provider events relevant to one session, already interpreted.
#[derive(Debug)]
enum SessionEvent {
    Message(Message),
    ChannelChanged(ChannelMetadata),
    Typing(Vec<ParticipantId>),
    ConnectionLost,
    ConnectionRestored,
}

enum Command {
    Send {
        text: String,
        reply: oneshot::Sender<Result<Message, SendError>>,
    },
    Retry {
        reply: oneshot::Sender<Result<(), SessionFailure>>,
    },
    Close,
}

/// Shared between the handle and the actor: whether the session is still
/// wanted, and its handler registration.
#[derive(Debug)]
struct Mount {
    mounted: AtomicBool,
    registration: Mutex<Option<Registration>>,
}

impl Mount {
    fn new() -> Self {
        Self {
            mounted: AtomicBool::new(true),
            registration: Mutex::new(None),
        }
    }

    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Registers `handler` unless the session was unmounted meanwhile.
    fn register(&self, gateway: &ConnectionGateway, key: &str, handler: EventHandler) -> bool {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.is_mounted() {
            return false;
        }
        match registration.take() {
            Some(previous) => {
                gateway.remove_registration(&previous);
            }
            None => {
                if gateway.remove_handler(key) {
                    debug!(key = %key, "removed stale handler of a previous session");
                }
            }
        }
        *registration = Some(gateway.register_handler(key, handler));
        true
    }

    /// Marks the session unmounted and removes its handler.
    fn unmount(&self, gateway: &ConnectionGateway) {
        let mut registration = self
            .registration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.mounted.store(false, Ordering::SeqCst);
        if let Some(registration) = registration.take() {
            gateway.remove_registration(&registration);
        }
    }
}

/// Opens support chat sessions.
#[derive(Clone)]
pub struct SessionController {
    gateway: Arc<ConnectionGateway>,
    store: PersistenceStore,
    config: Arc<ChatConfig>,
}

impl SessionController {
    /// Creates a controller over a shared gateway and store.
    #[must_use]
    pub fn new(gateway: Arc<ConnectionGateway>, store: PersistenceStore, config: ChatConfig) -> Self {
        Self {
            gateway,
            store,
            config: Arc::new(config),
        }
    }

    /// Creates a controller with its own gateway and the store `config`
    /// describes.
    #[must_use]
    pub fn from_config(provider: Arc<dyn MessagingProvider>, config: ChatConfig) -> Self {
        let store = config.persistence_store();
        Self::new(Arc::new(ConnectionGateway::new(provider)), store, config)
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<ConnectionGateway> {
        &self.gateway
    }

    #[must_use]
    pub fn store(&self) -> &PersistenceStore {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Opens the support conversation of a restaurant.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn open(&self, restaurant_id: RestaurantId, display_name: impl Into<String>) -> Session {
        self.open_with(Identity::new(restaurant_id, display_name), None)
    }

    /// Opens a session, running `on_close` once the conversation terminates.
    ///
    /// Must be called within a tokio runtime.
    #[must_use]
    pub fn open_with(&self, identity: Identity, on_close: Option<OnClose>) -> Session {
        let (view_tx, view_rx) = watch::channel(ChatView::starting());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mount = Arc::new(Mount::new());
        let span = info_span!("support_chat", restaurant_id = %identity.restaurant_id());
        let sync = MessageSynchronizer::new(
            self.gateway.clone(),
            self.store.clone(),
            identity.restaurant_id().clone(),
            &self.config,
        );
        let pending = sync.pending();

        let actor = SessionActor {
            handler_key: handler_key(identity.restaurant_id()),
            resolver: ChannelResolver::new(self.gateway.clone(), &self.config),
            sync,
            status: ChannelStatusMachine::new(identity.participant_id().clone(), &self.config),
            identity: identity.clone(),
            gateway: self.gateway.clone(),
            mount: mount.clone(),
            view: view_tx,
            event_tx,
            events: event_rx,
            commands: command_rx,
            on_close,
            connected: false,
            ready: false,
            failure: None,
        };
        tokio::spawn(actor.run().instrument(span));

        Session {
            identity,
            commands: command_tx,
            view: view_rx,
            mount,
            pending,
            gateway: self.gateway.clone(),
        }
    }
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("gateway", &self.gateway)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

/// Handle to one support conversation.
///
/// Dropping the handle closes the session.
pub struct Session {
    identity: Identity,
    commands: mpsc::UnboundedSender<Command>,
    view: watch::Receiver<ChatView>,
    mount: Arc<Mount>,
    pending: Arc<PendingWrite>,
    gateway: Arc<ConnectionGateway>,
}

impl Session {
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// The current state of the conversation.
    #[must_use]
    pub fn view(&self) -> ChatView {
        self.view.borrow().clone()
    }

    /// Receiver notified on every change of the view.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ChatView> {
        self.view.clone()
    }

    /// Whether the session has not been closed.
    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.mount.is_mounted()
    }

    /// Waits until the session has started.
    ///
    /// # Errors
    ///
    /// Returns the failure shown in [`ChatView::error`].
    pub async fn ready(&self) -> servicebell_core::Result<(), SessionFailure> {
        let mut view = self.view.clone();
        let outcome = view.wait_for(|v| !v.loading).await.map(|v| v.error.clone());
        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(failure)) => Err(failure.into()),
            Err(_) => Err(SessionFailure::Closed.into()),
        }
    }

    /// Starts the session again after a failure.
    ///
    /// Does nothing if the session already started.
    ///
    /// # Errors
    ///
    /// Returns the failure of the new attempt.
    pub async fn retry(&self) -> servicebell_core::Result<(), SessionFailure> {
        let (reply, outcome) = oneshot::channel();
        if self.commands.send(Command::Retry { reply }).is_err() {
            return Err(SessionFailure::Closed.into());
        }
        match outcome.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SessionFailure::Closed.into()),
        }
    }

    /// Sends a text message to support.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is empty, the session is not ready,
    /// the connection is down, the conversation ended, or the provider
    /// refused the message. The conversation is unchanged on error.
    pub async fn send(&self, text: impl Into<String>) -> servicebell_core::Result<Message, SendError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(SendError::EmptyMessage.into());
        }
        if self.view.borrow().loading {
            return Err(SendError::NotReady.into());
        }
        let (reply, outcome) = oneshot::channel();
        if self.commands.send(Command::Send { text, reply }).is_err() {
            return Err(SendError::SessionClosed.into());
        }
        match outcome.await {
            Ok(result) => result.map_err(Into::into),
            Err(_) => Err(SendError::SessionClosed.into()),
        }
    }

    /// Closes the session: removes its handler, writes unsaved messages and
    /// stops its timers. The remote channel stays as it is.
    ///
    /// Does not wait for a start that is still in progress; its result is
    /// discarded.
    pub fn close(&self) {
        self.mount.unmount(&self.gateway);
        self.pending.write_now();
        let _ = self.commands.send(Command::Close);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("restaurant_id", self.identity.restaurant_id())
            .field("mounted", &self.is_mounted())
            .finish_non_exhaustive()
    }
}

/// Translates provider events of one channel into session events.
fn event_handler(
    key: String,
    channel_url: ChannelUrl,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> EventHandler {
    Arc::new(move |event: &ProviderEvent| -> Result<(), EventError> {
        let translated = match event {
            ProviderEvent::MessageReceived { message } if message.channel_url == channel_url => {
                SessionEvent::Message(convert::message_from_remote(message)?)
            }
            ProviderEvent::ChannelChanged { channel } if channel.url == channel_url => {
                SessionEvent::ChannelChanged(convert::channel_from_remote(channel)?)
            }
            ProviderEvent::TypingStatusUpdated {
                channel_url: url,
                typing_member_ids,
            } if *url == channel_url => SessionEvent::Typing(typing_member_ids.clone()),
            ProviderEvent::ConnectionLost => SessionEvent::ConnectionLost,
            ProviderEvent::ConnectionRestored => SessionEvent::ConnectionRestored,
            _ => return Ok(()),
        };
        events
            .send(translated)
            .map_err(|_| EventError::ReceiverGone { key: key.clone() })
    })
}

fn log_transition(transition: Transition) {
    if let Transition::Closing {
        status,
        notice_delivered,
    } = transition
    {
        info!(%status, notice_delivered, "support closed the conversation");
    }
}

struct SessionActor {
    identity: Identity,
    handler_key: String,
    gateway: Arc<ConnectionGateway>,
    resolver: ChannelResolver,
    sync: MessageSynchronizer,
    status: ChannelStatusMachine,
    mount: Arc<Mount>,
    view: watch::Sender<ChatView>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    on_close: Option<OnClose>,
    connected: bool,
    ready: bool,
    failure: Option<SessionFailure>,
}

impl SessionActor {
    async fn run(mut self) {
        debug!("session actor started");

        if self.sync.restore_cached().is_some() {
            self.publish();
        }
        let result = self.bootstrap().await;
        self.finish_bootstrap(&result);

        self.command_loop().await;
        debug!("session actor stopped");
    }

    async fn command_loop(&mut self) {
        loop {
            let flush_at = self.sync.flush_deadline();
            let grace_at = self.status.grace_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Send { text, reply }) => {
                            let result = self.send(text).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Retry { reply }) => {
                            let result = self.retry().await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Close) => {
                            self.shutdown();
                            break;
                        }
                        None => {
                            debug!("all handles dropped, shutting down");
                            self.shutdown();
                            break;
                        }
                    }
                }

                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }

                () = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    if self.sync.flush_due(Instant::now()) {
                        self.publish();
                    }
                }

                () = sleep_until(grace_at.unwrap_or_else(Instant::now)), if grace_at.is_some() => {
                    if self.status.grace_expired(Instant::now()) {
                        self.terminate();
                    }
                }
            }
        }
    }

    /// Connects, resolves the channel and loads its history.
    async fn bootstrap(&mut self) -> Result<(), SessionFailure> {
        self.gateway
            .connect(self.identity.participant_id(), self.identity.display_name())
            .await
            .map_err(|e| SessionFailure::Connection(e.current_context().clone()))?;
        self.ensure_mounted()?;
        self.connected = true;
        self.publish();

        let cached = self.sync.channel().cloned();
        let channel = self
            .resolver
            .resolve(&self.identity, cached.as_ref())
            .await
            .map_err(|e| SessionFailure::Channel(e.current_context().clone()))?;
        self.ensure_mounted()?;

        let channel_url = channel.channel_url.clone();
        self.sync.adopt(channel);
        let handler = event_handler(
            self.handler_key.clone(),
            channel_url.clone(),
            self.event_tx.clone(),
        );
        if !self.mount.register(&self.gateway, &self.handler_key, handler) {
            return Err(SessionFailure::Closed);
        }

        let page = self.sync.load_history().await;
        self.ensure_mounted()?;
        self.sync.merge_history(&page);
        log_transition(self.status.on_loaded(&mut self.sync));

        if let Err(e) = self.gateway.provider().mark_as_read(&channel_url).await {
            debug!(channel_url = %channel_url, error = %e, "failed to mark channel as read");
        }
        Ok(())
    }

    fn ensure_mounted(&self) -> Result<(), SessionFailure> {
        if self.mount.is_mounted() {
            Ok(())
        } else {
            Err(SessionFailure::Closed)
        }
    }

    fn finish_bootstrap(&mut self, result: &Result<(), SessionFailure>) {
        match result {
            Ok(()) => {
                self.ready = true;
                self.failure = None;
                self.connected = self.gateway.is_connected_as(self.identity.participant_id());
                info!(
                    messages = self.sync.messages().len(),
                    state = %self.status.state(),
                    "support chat ready"
                );
            }
            Err(SessionFailure::Closed) => {
                debug!("session closed while starting");
                self.failure = Some(SessionFailure::Closed);
            }
            Err(failure) => {
                warn!(error = %failure, "support chat failed to start");
                self.failure = Some(failure.clone());
            }
        }
        self.publish();
    }

    async fn retry(&mut self) -> Result<(), SessionFailure> {
        if self.ready {
            return Ok(());
        }
        self.ensure_mounted()?;
        info!("retrying support chat");
        self.failure = None;
        self.publish();

        let result = self.bootstrap().await;
        self.finish_bootstrap(&result);
        result
    }

    async fn send(&mut self, text: String) -> Result<Message, SendError> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if !self.mount.is_mounted() {
            return Err(SendError::SessionClosed);
        }
        let Some(channel) = self.sync.channel().filter(|_| self.ready) else {
            return Err(SendError::NotReady);
        };
        if self.status.state() != ConversationState::Open || !channel.is_active() {
            return Err(SendError::ChannelTerminal {
                status: channel.status,
            });
        }
        // The shared connection may have switched to another restaurant.
        if !self.connected || !self.gateway.is_connected_as(self.identity.participant_id()) {
            return Err(SendError::Disconnected);
        }

        let channel_url = channel.channel_url.clone();
        let remote = self
            .gateway
            .provider()
            .send_message(&channel_url, SendMessageParams::text(body))
            .await
            .map_err(|e| match e {
                ProviderError::Unreachable { .. } => SendError::Disconnected,
                other => SendError::Rejected {
                    reason: other.to_string(),
                },
            })?;
        let message = convert::message_from_remote(&remote).map_err(|e| SendError::Rejected {
            reason: e.to_string(),
        })?;

        self.status.on_message(&mut self.sync, message.clone());
        self.publish();
        debug!(message_id = %message.id, "message sent");
        Ok(message)
    }

    async fn handle_event(&mut self, event: SessionEvent) {
        if self.status.state() == ConversationState::Terminated {
            return;
        }
        match event {
            SessionEvent::Message(message) => {
                if let Some(transition) = self.status.on_message(&mut self.sync, message) {
                    log_transition(transition);
                    self.publish();
                }
            }
            SessionEvent::ChannelChanged(channel) => {
                log_transition(self.status.on_channel_changed(&mut self.sync, &channel));
                self.publish();
            }
            SessionEvent::Typing(members) => {
                if self.status.on_typing(&members) {
                    self.publish();
                }
            }
            SessionEvent::ConnectionLost => {
                self.connected = false;
                self.publish();
            }
            SessionEvent::ConnectionRestored => {
                self.connected = self.gateway.is_connected_as(self.identity.participant_id());
                self.publish();
                if self.connected {
                    self.resync().await;
                }
            }
        }
    }

    /// Covers what was missed while the connection was down.
    async fn resync(&mut self) {
        if !self.ready || !self.mount.is_mounted() {
            return;
        }
        let Some(channel_url) = self.sync.channel().map(|c| c.channel_url.clone()) else {
            return;
        };

        match self.gateway.provider().get_channel(&channel_url).await {
            Ok(Some(remote)) => match convert::channel_from_remote(&remote) {
                Ok(channel) => {
                    log_transition(self.status.on_channel_changed(&mut self.sync, &channel));
                }
                Err(e) => warn!(channel_url = %channel_url, error = %e, "unreadable channel after reconnect"),
            },
            Ok(None) => warn!(channel_url = %channel_url, "channel missing after reconnect"),
            Err(e) => warn!(channel_url = %channel_url, error = %e, "failed to refresh channel after reconnect"),
        }

        let page = self.sync.load_history().await;
        let added = self.sync.merge_history(&page);
        log_transition(self.status.on_loaded(&mut self.sync));
        debug!(added, "resynchronized after reconnect");
        self.publish();
    }

    fn terminate(&mut self) {
        let closed_by_handle = !self.mount.is_mounted();
        self.mount.unmount(&self.gateway);
        self.sync.flush_pending();
        self.publish();
        if closed_by_handle {
            return;
        }
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }

    fn shutdown(&mut self) {
        self.mount.unmount(&self.gateway);
        self.status.cancel();
        self.sync.flush_pending();
        self.sync.cancel();
        debug!("session closed");
    }

    fn publish(&self) {
        self.view.send_replace(ChatView {
            messages: self.sync.messages().to_vec(),
            connected: self.connected,
            typing: self.status.typing(),
            error: self.failure.clone(),
            loading: !self.ready && self.failure.is_none(),
            state: self.status.state(),
            channel: self.sync.channel().cloned(),
        });
    }
}
