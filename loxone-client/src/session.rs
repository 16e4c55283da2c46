//! The WebSocket session controller.
//!
//! Owns the socket lifecycle: one transport per connection (recreated on
//! reconnect under the slot's write lock), the auth engine (persists
//! across reconnects, reset when the socket dies), and the shared
//! scheduler. Senders take the slot's read lock, wait on the
//! authentication gate and write to the wire; recoverable failures stay
//! inside the retry loop and only `AuthTimeoutExceeded` surfaces to the
//! caller.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use secrecy::SecretString;
use tokio::sync::{RwLock, mpsc};

use loxone_types::command::{Command, ENCRYPTED_PREFIX, SecuredCommand};
use loxone_types::{LoxoneEndpoint, ResponseCode, auth::ApiInfo};

use crate::Error;
use crate::auth::AuthEngine;
use crate::codec::{self, MessageHeader};
use crate::dispatch::Dispatcher;
use crate::http::{HttpFetcher, ReqwestFetcher};
use crate::latch::Latch;
use crate::listener::{
    AuthListener, CommandResponseListener, LoxoneEventListener, LoxoneWebSocketListener,
};
use crate::registry::CommandRegistry;
use crate::scheduler::Scheduler;
use crate::transport::{
    TransportEvents, TransportFactory, TungsteniteFactory, WebSocketTransport,
};

const RETRY_BACKOFF: Duration = Duration::from_millis(10);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(240);

/// Credentials for one miniserver user.
#[derive(Debug, Clone)]
pub struct LoxoneProfile {
    /// User to authenticate as.
    pub user: String,
    /// Primary password.
    pub password: SecretString,
    /// Visualisation password, required for secured commands.
    pub visu_password: Option<SecretString>,
}

impl LoxoneProfile {
    /// Creates a profile without a visualisation password.
    pub fn new(user: impl Into<String>, password: SecretString) -> Self {
        Self {
            user: user.into(),
            password,
            visu_password: None,
        }
    }

    /// Adds the visualisation password.
    pub fn with_visu_password(mut self, visu_password: SecretString) -> Self {
        self.visu_password = Some(visu_password);
        self
    }
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transport exists.
    Disconnected,
    /// A transport is being established.
    Connecting,
    /// The socket is open, the handshake is running.
    Authenticating,
    /// Commands may flow.
    Ready,
    /// `close` is tearing the session down.
    Closing,
}

struct Tuning {
    auth_timeout: Duration,
    visu_timeout: Duration,
    retries: u32,
    auto_restart: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(3),
            visu_timeout: Duration::from_secs(3),
            retries: 5,
            auto_restart: false,
        }
    }
}

#[derive(Default)]
struct ConnSlot {
    transport: Option<Arc<dyn WebSocketTransport>>,
}

/// The session controller and public entry point of this crate.
pub struct LoxoneWebSocket {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    endpoint: LoxoneEndpoint,
    http: Arc<dyn HttpFetcher>,
    factory: Arc<dyn TransportFactory>,
    scheduler: Scheduler,
    registry: CommandRegistry,
    dispatcher: Dispatcher,
    auth: Arc<AuthEngine>,
    conn: RwLock<ConnSlot>,
    auth_latch: Mutex<Option<Latch>>,
    visu_latch: Mutex<Option<Latch>>,
    state: Mutex<SessionState>,
    tuning: Mutex<Tuning>,
    restart_task: Mutex<Option<tokio_util::sync::CancellationToken>>,
    keep_alive_task: Mutex<Option<tokio_util::sync::CancellationToken>>,
    me: OnceLock<Weak<SessionInner>>,
}

impl LoxoneWebSocket {
    /// Creates a session with the production collaborators (reqwest
    /// bootstrap, tokio-tungstenite transport). Nothing connects until
    /// the first send.
    pub fn new(endpoint: LoxoneEndpoint, profile: LoxoneProfile) -> Self {
        let http = Arc::new(ReqwestFetcher::new(endpoint.clone()));
        Self::with_collaborators(endpoint, profile, http, Arc::new(TungsteniteFactory))
    }

    /// Creates a session with injected collaborators.
    pub fn with_collaborators(
        endpoint: LoxoneEndpoint,
        profile: LoxoneProfile,
        http: Arc<dyn HttpFetcher>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let scheduler = Scheduler::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let auth = Arc::new(AuthEngine::new(
            profile.user,
            profile.password,
            profile.visu_password,
            tx,
            scheduler.clone(),
        ));
        auth.bind(Arc::downgrade(&auth));

        let inner = Arc::new(SessionInner {
            endpoint,
            http,
            factory,
            scheduler,
            registry: CommandRegistry::new(),
            dispatcher: Dispatcher::new(),
            auth: Arc::clone(&auth),
            conn: RwLock::new(ConnSlot::default()),
            auth_latch: Mutex::new(None),
            visu_latch: Mutex::new(None),
            state: Mutex::new(SessionState::Disconnected),
            tuning: Mutex::new(Tuning::default()),
            restart_task: Mutex::new(None),
            keep_alive_task: Mutex::new(None),
            me: OnceLock::new(),
        });
        let _ = inner.me.set(Arc::downgrade(&inner));

        // the auth engine sees its own responses and the session opens
        // the latches on its completion signals
        inner
            .dispatcher
            .register_command_listener(Arc::clone(&auth) as Arc<dyn CommandResponseListener>);
        auth.add_listener(Arc::new(LatchOpener {
            inner: Arc::downgrade(&inner),
        }));

        // outbox pump: auth commands bypass the latch gate
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Err(err) = inner.send_raw(&command).await {
                    tracing::warn!(
                        command = command.command(),
                        "auth command not written: {err}"
                    );
                }
            }
        });

        Self { inner }
    }

    /// Submits a command, establishing and authenticating the connection
    /// as needed. Responses arrive through the registered listeners.
    pub async fn send_command(&self, command: Command) -> Result<(), Error> {
        self.inner.send_with_retry(command, false).await
    }

    /// Submits a control command under the secured wrapper, running the
    /// visualisation handshake on first use.
    pub async fn send_secure_command(&self, command: Command) -> Result<(), Error> {
        self.inner.send_with_retry(command, true).await
    }

    /// Writes a keep-alive ping; never enqueued for correlation.
    pub async fn send_keep_alive(&self) -> Result<(), Error> {
        self.inner.send_raw(&Command::keep_alive()).await
    }

    /// How long senders wait for the authentication gate.
    pub fn set_auth_timeout(&self, timeout: Duration) {
        self.inner.tuning.lock().auth_timeout = timeout;
    }

    /// How long secure senders wait for the visualisation gate.
    pub fn set_visu_timeout(&self, timeout: Duration) {
        self.inner.tuning.lock().visu_timeout = timeout;
    }

    /// How often a failed send is retried before surfacing.
    pub fn set_retries(&self, retries: u32) {
        self.inner.tuning.lock().retries = retries;
    }

    /// Reconnect periodically after a remote close.
    pub fn set_auto_restart(&self, auto_restart: bool) {
        self.inner.tuning.lock().auto_restart = auto_restart;
    }

    /// Registers a command-response listener.
    pub fn register_command_listener(&self, listener: Arc<dyn CommandResponseListener>) {
        self.inner.dispatcher.register_command_listener(listener);
    }

    /// Registers a binary-event listener.
    pub fn register_event_listener(&self, listener: Arc<dyn LoxoneEventListener>) {
        self.inner.dispatcher.register_event_listener(listener);
    }

    /// Registers a socket lifecycle listener.
    pub fn register_web_socket_listener(&self, listener: Arc<dyn LoxoneWebSocketListener>) {
        self.inner.dispatcher.register_ws_listener(listener);
    }

    /// Registers an authentication listener.
    pub fn register_auth_listener(&self, listener: Arc<dyn AuthListener>) {
        self.inner.auth.add_listener(listener);
    }

    /// The current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    /// Bootstrap info of the connected miniserver, once fetched.
    pub fn api_info(&self) -> Option<ApiInfo> {
        self.inner.auth.api_info()
    }

    /// Shuts the session down: cancels all background tasks and closes
    /// the transport, surfacing transport errors.
    pub async fn close(&self) -> Result<(), Error> {
        tracing::debug!("closing session");
        *self.inner.state.lock() = SessionState::Closing;
        self.inner.scheduler.shutdown().await;
        let result = self.inner.close_transport().await;
        *self.inner.state.lock() = SessionState::Disconnected;
        result
    }
}

impl SessionInner {
    fn weak(&self) -> Weak<SessionInner> {
        self.me.get().cloned().unwrap_or_default()
    }

    /// Establishes or reuses a connection.
    ///
    /// Exactly one writer recreates the transport; losers proceed to the
    /// wait phase. With an open transport but an unusable token, a fresh
    /// gate is installed and the handshake restarted instead.
    async fn ensure_connection(self: &Arc<Self>) -> Result<(), Error> {
        if !self.auth.initialized() {
            self.auth.initialize(self.http.as_ref()).await?;
        }
        {
            let slot = self.conn.read().await;
            if let Some(transport) = slot.transport.as_ref()
                && transport.is_open()
            {
                if self.auth.usable() {
                    return Ok(());
                }
                // a cycle is active while its gate is still closed
                let cycle_active = self
                    .auth_latch
                    .lock()
                    .as_ref()
                    .is_some_and(|latch| !latch.is_open());
                if cycle_active {
                    return Ok(());
                }
            }
        }
        let mut slot = self.conn.write().await;
        let transport_open = slot.transport.as_ref().is_some_and(|t| t.is_open());
        if !transport_open {
            // tear down the previous connection's correlation state
            // before anything new goes in flight
            if slot.transport.take().is_some() {
                self.teardown_correlation();
            }
            if !self.auth.initialized() {
                self.auth.initialize(self.http.as_ref()).await?;
            }
            *self.auth_latch.lock() = Some(Latch::new());
            *self.state.lock() = SessionState::Connecting;
            let events: Arc<dyn TransportEvents> = self
                .me
                .get()
                .and_then(Weak::upgrade)
                .ok_or(Error::ConnectionFailure)?;
            let transport = self
                .factory
                .create(Arc::downgrade(&events), self.endpoint.ws_uri());
            if let Err(err) = transport.connect().await {
                tracing::warn!("connect failed: {err}");
                *self.state.lock() = SessionState::Disconnected;
                return Err(Error::ConnectionFailure);
            }
            slot.transport = Some(transport);
        } else if !self.auth.usable() {
            {
                let mut latch = self.auth_latch.lock();
                if latch.as_ref().is_none_or(Latch::is_open) {
                    *latch = Some(Latch::new());
                }
            }
            self.auth.start_authentication();
        }
        Ok(())
    }

    /// The retry ladder around one submission.
    async fn send_with_retry(self: &Arc<Self>, command: Command, secure: bool) -> Result<(), Error> {
        if !command.ws_supported() {
            return Err(Error::WsNotSupported(command.command().to_owned()));
        }
        let retries = self.tuning.lock().retries;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.try_send(&command, secure).await {
                Ok(()) => return Ok(()),
                Err(Error::ConnectionFailure) if attempts <= retries => {
                    tracing::debug!(attempts, "send attempt failed; backing off");
                    tokio::time::sleep(RETRY_BACKOFF).await;
                }
                Err(Error::ConnectionFailure) => {
                    return Err(Error::AuthTimeoutExceeded { attempts });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn try_send(self: &Arc<Self>, command: &Command, secure: bool) -> Result<(), Error> {
        self.ensure_connection().await?;
        let (auth_timeout, visu_timeout) = {
            let tuning = self.tuning.lock();
            (tuning.auth_timeout, tuning.visu_timeout)
        };
        let auth_latch = self
            .auth_latch
            .lock()
            .clone()
            .ok_or(Error::ConnectionFailure)?;

        let slot = self.conn.read().await;
        if !auth_latch.wait(auth_timeout).await {
            drop(slot);
            tracing::warn!("authentication gate timed out; closing socket");
            let _ = self.close_transport().await;
            return Err(Error::ConnectionFailure);
        }

        let wire = if secure {
            // a fresh gate per handshake; a completed one is stale since
            // the credential may have rotated with the connection
            let visu_latch = {
                let mut guard = self.visu_latch.lock();
                match guard.as_ref() {
                    Some(latch) if !latch.is_open() => latch.clone(),
                    _ => {
                        let latch = Latch::new();
                        *guard = Some(latch.clone());
                        drop(guard);
                        self.auth.start_visu_authentication();
                        latch
                    }
                }
            };
            if !visu_latch.wait(visu_timeout).await {
                tracing::warn!("visualisation gate timed out");
                return Err(Error::ConnectionFailure);
            }
            let credential = self
                .auth
                .visu_credential()
                .ok_or(Error::ConnectionFailure)?;
            SecuredCommand::wrap(command.clone(), &credential).to_command()
        } else {
            command.clone()
        };

        let Some(transport) = slot.transport.as_ref().filter(|t| t.is_open()) else {
            return Err(Error::ConnectionFailure);
        };
        // enqueue before writing so a fast response never orphans
        self.registry.submit(&wire);
        transport.send(wire.command()).await.map_err(|err| {
            tracing::warn!("write failed: {err}");
            Error::ConnectionFailure
        })
    }

    /// Writes a command without waiting on the authentication gate. Used
    /// by the handshake itself and the keep-alive.
    async fn send_raw(&self, command: &Command) -> Result<(), Error> {
        let slot = self.conn.read().await;
        let Some(transport) = slot.transport.as_ref().filter(|t| t.is_open()) else {
            return Err(Error::ConnectionFailure);
        };
        self.registry.submit(command);
        transport.send(command.command()).await
    }

    /// Drops everything bound to a dead connection: in-flight commands,
    /// the auth engine state and both gates.
    fn teardown_correlation(&self) {
        self.registry.drain();
        self.auth.ws_closed();
        *self.auth_latch.lock() = None;
        *self.visu_latch.lock() = None;
    }

    async fn close_transport(&self) -> Result<(), Error> {
        let transport = {
            let mut slot = self.conn.write().await;
            slot.transport.take()
        };
        match transport {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    fn arm_auto_restart(&self) {
        let (retries, auth_timeout) = {
            let tuning = self.tuning.lock();
            (tuning.retries, tuning.auth_timeout)
        };
        let period = auth_timeout * (retries + 1) + Duration::from_secs(1);
        tracing::debug!(?period, "arming auto-restart");
        let weak = self.weak();
        let token = self.scheduler.schedule_repeating(period, move || {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(err) = inner.ensure_connection().await {
                    tracing::debug!("auto-restart attempt failed: {err}");
                }
            }
        });
        let mut guard = self.restart_task.lock();
        if let Some(old) = guard.replace(token) {
            old.cancel();
        }
    }
}

#[async_trait]
impl TransportEvents for SessionInner {
    async fn connection_opened(&self) {
        tracing::debug!("connection opened");
        if let Some(restart) = self.restart_task.lock().take() {
            restart.cancel();
        }
        *self.state.lock() = SessionState::Authenticating;

        // authentication is driven off the transport's I/O task
        let weak = self.weak();
        self.scheduler.schedule_once(Duration::ZERO, move || async move {
            let Some(inner) = weak.upgrade() else { return };
            inner.auth.start_authentication();
            inner.dispatcher.notify_opened();
        });

        let weak = self.weak();
        let keep_alive = self
            .scheduler
            .schedule_repeating(KEEP_ALIVE_INTERVAL, move || {
                let weak = weak.clone();
                async move {
                    let Some(inner) = weak.upgrade() else { return };
                    if let Err(err) = inner.send_raw(&Command::keep_alive()).await {
                        tracing::debug!("keep-alive not written: {err}");
                    }
                }
            });
        let mut guard = self.keep_alive_task.lock();
        if let Some(old) = guard.replace(keep_alive) {
            old.cancel();
        }
    }

    async fn process_message(&self, text: &str) {
        tracing::trace!("< {text}");
        let Some(command) = self.registry.pop() else {
            tracing::warn!("response with no in-flight command; dropping");
            return;
        };
        match codec::parse_message(text) {
            Ok(message) => {
                if message.control.starts_with(ENCRYPTED_PREFIX) {
                    tracing::warn!(
                        control = %message.control,
                        "encrypted command channel is unsupported"
                    );
                    return;
                }
                match message.response_code() {
                    ResponseCode::Ok => {
                        if command.matches_control(&message.control) {
                            self.dispatcher.process_command(&command, &message);
                        } else {
                            let err = Error::ProtocolMismatch {
                                expected: command.should_contain().unwrap_or_default().to_owned(),
                                actual: message.control.clone(),
                            };
                            tracing::warn!("dropping response: {err}");
                        }
                    }
                    ResponseCode::NotAuthenticated => {
                        tracing::debug!("not yet authenticated; dropping response");
                    }
                    ResponseCode::AuthFailed | ResponseCode::AuthTooLong => {
                        self.auth.auth_failed(message.code);
                    }
                    ResponseCode::Unauthorized => self.auth.visu_auth_failed(),
                    code => {
                        tracing::warn!(%code, control = %message.control, "dropping response");
                    }
                }
            }
            Err(_) => match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => match command.ensure_response(value) {
                    Some(message) => self.dispatcher.process_command(&command, &message),
                    None => tracing::warn!(
                        command = command.command(),
                        "response shape mismatch; dropping"
                    ),
                },
                Err(err) => tracing::warn!("bad json response dropped: {err}"),
            },
        }
    }

    async fn process_events(&self, header: &MessageHeader, payload: &[u8]) {
        self.dispatcher.process_events(header, payload);
    }

    async fn connection_closed(&self, code: u16, remote: bool) {
        tracing::debug!(code, remote, "connection closed");
        if let Some(keep_alive) = self.keep_alive_task.lock().take() {
            keep_alive.cancel();
        }
        {
            let mut state = self.state.lock();
            if *state != SessionState::Closing {
                *state = SessionState::Disconnected;
            }
        }
        self.dispatcher.notify_closed(code, remote);
        if remote && self.tuning.lock().auto_restart {
            self.arm_auto_restart();
        }
    }

    async fn ws_closed(&self) {
        {
            let mut slot = self.conn.write().await;
            if slot.transport.as_ref().is_some_and(|t| t.is_open()) {
                // a newer connection owns the slot; its predecessor was
                // already torn down on reconnect
                return;
            }
            slot.transport = None;
        }
        tracing::debug!("socket gone; dropping correlation state");
        self.teardown_correlation();
    }
}

/// Opens the session's gates on the engine's completion signals.
struct LatchOpener {
    inner: Weak<SessionInner>,
}

impl AuthListener for LatchOpener {
    fn auth_completed(&self) {
        let Some(inner) = self.inner.upgrade() else { return };
        let had_latch = {
            let guard = inner.auth_latch.lock();
            match guard.as_ref() {
                Some(latch) => {
                    latch.open();
                    true
                }
                None => false,
            }
        };
        if had_latch {
            *inner.state.lock() = SessionState::Ready;
            tracing::debug!("session ready");
        } else {
            tracing::error!(
                "{}",
                Error::InvariantViolation("authentication completed without an active latch")
            );
        }
    }

    fn visu_auth_completed(&self) {
        let Some(inner) = self.inner.upgrade() else { return };
        match inner.visu_latch.lock().as_ref() {
            Some(latch) => {
                latch.open();
            }
            None => tracing::error!(
                "{}",
                Error::InvariantViolation(
                    "visualisation handshake completed without an active latch"
                )
            ),
        }
    }
}
