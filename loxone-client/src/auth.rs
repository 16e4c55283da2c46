//! The authentication engine.
//!
//! Drives the challenge/response handshake on a fresh connection:
//! key-exchange under the miniserver's RSA key, the `getkey2` credential
//! challenge, token acquisition and its proactive refresh, plus the
//! on-demand visualisation handshake for secured commands. The engine
//! never owns the socket: outbound commands leave through an injected
//! sender and inbound responses arrive through the command-response
//! listener registration. It never spawns tasks of its own; the refresh
//! runs on the shared scheduler.

use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rsa::RsaPublicKey;
use secrecy::SecretString;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use loxone_types::LoxoneMessage;
use loxone_types::auth::{ApiInfo, TokenResponse, UserKeyResponse, VisuSaltResponse};
use loxone_types::command::{Command, ResponseKind};
use loxone_types::crypto::{self, SessionKey, VisuCredential};

use crate::Error;
use crate::http::HttpFetcher;
use crate::listener::{AuthListener, CommandResponseListener, Disposition};
use crate::scheduler::Scheduler;

/// Permission requested with `gettoken`; 4 grants app-level access.
const TOKEN_PERMISSION: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AuthState {
    Uninitialised,
    KeyExchanged,
    Challenged,
    TokenIssued,
    Refreshing,
    Failed,
}

struct TokenState {
    token: String,
    issued: Instant,
    valid: Duration,
}

struct EngineState {
    phase: AuthState,
    in_progress: bool,
    api_info: Option<ApiInfo>,
    public_key: Option<RsaPublicKey>,
    user_key: Option<UserKeyResponse>,
    token: Option<TokenState>,
    visu: Option<VisuCredential>,
    visu_in_progress: bool,
    refresh_task: Option<CancellationToken>,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            phase: AuthState::Uninitialised,
            in_progress: false,
            api_info: None,
            public_key: None,
            user_key: None,
            token: None,
            visu: None,
            visu_in_progress: false,
            refresh_task: None,
        }
    }
}

enum Signal {
    Auth,
    Visu,
}

pub(crate) struct AuthEngine {
    user: String,
    password: SecretString,
    visu_password: Option<SecretString>,
    client_id: Uuid,
    client_info: String,
    sender: mpsc::UnboundedSender<Command>,
    scheduler: Scheduler,
    me: OnceLock<Weak<AuthEngine>>,
    listeners: RwLock<Vec<Arc<dyn AuthListener>>>,
    state: Mutex<EngineState>,
}

impl AuthEngine {
    pub(crate) fn new(
        user: String,
        password: SecretString,
        visu_password: Option<SecretString>,
        sender: mpsc::UnboundedSender<Command>,
        scheduler: Scheduler,
    ) -> Self {
        Self {
            user,
            password,
            visu_password,
            client_id: Uuid::new_v4(),
            client_info: format!("loxone-client/{}", env!("CARGO_PKG_VERSION")),
            sender,
            scheduler,
            me: OnceLock::new(),
            listeners: RwLock::new(Vec::new()),
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Self-reference for tasks scheduled by the engine.
    pub(crate) fn bind(&self, me: Weak<AuthEngine>) {
        let _ = self.me.set(me);
    }

    pub(crate) fn add_listener(&self, listener: Arc<dyn AuthListener>) {
        self.listeners.write().push(listener);
    }

    pub(crate) fn initialized(&self) -> bool {
        self.state.lock().public_key.is_some()
    }

    #[cfg(test)]
    pub(crate) fn phase(&self) -> AuthState {
        self.state.lock().phase
    }

    /// Fetches API info and the RSA public key through the bootstrap
    /// collaborator.
    pub(crate) async fn initialize(&self, http: &dyn HttpFetcher) -> Result<(), Error> {
        let api_info: ApiInfo = http.get(&Command::api_info()).await?.value_as()?;
        tracing::debug!(snr = %api_info.snr, version = %api_info.version, "fetched api info");
        let key_msg = http.get(&Command::public_key()).await?;
        let pem = key_msg.value.as_str().ok_or_else(|| {
            Error::Bootstrap("public key response is not a string".to_owned())
        })?;
        let public_key = crypto::parse_public_key(pem)?;
        let mut state = self.state.lock();
        state.api_info = Some(api_info);
        state.public_key = Some(public_key);
        Ok(())
    }

    /// `true` while an issued token is still within its validity window.
    pub(crate) fn usable(&self) -> bool {
        usable(&self.state.lock())
    }

    /// Kicks off the token handshake.
    ///
    /// No-op while a cycle is already in flight or the current token is
    /// still usable; from [`AuthState::Failed`] the sequence restarts.
    pub(crate) fn start_authentication(&self) {
        let encrypted = {
            let mut state = self.state.lock();
            if state.in_progress {
                tracing::trace!("authentication already in flight");
                return;
            }
            if usable(&state) {
                tracing::trace!("token still valid; skipping authentication");
                return;
            }
            let Some(public_key) = state.public_key.clone() else {
                tracing::warn!("cannot authenticate before initialisation");
                return;
            };
            let session_key = SessionKey::generate(&mut OsRng);
            match session_key.encrypt_for(&mut OsRng, &public_key) {
                Ok(encrypted) => {
                    state.phase = AuthState::Uninitialised;
                    state.in_progress = true;
                    encrypted
                }
                Err(err) => {
                    tracing::warn!("cannot encrypt session key: {err}");
                    state.phase = AuthState::Failed;
                    return;
                }
            }
        };
        tracing::debug!("starting authentication sequence");
        self.send(Command::key_exchange(&encrypted));
    }

    /// Kicks off the visualisation handshake.
    ///
    /// No-op while the handshake is in flight. With a credential already
    /// held the completion signal is re-emitted so a freshly installed
    /// latch opens immediately.
    pub(crate) fn start_visu_authentication(&self) {
        {
            let mut state = self.state.lock();
            if state.visu_in_progress {
                tracing::trace!("visualisation handshake already in flight");
                return;
            }
            if state.visu.is_some() {
                drop(state);
                self.emit(Signal::Visu);
                return;
            }
            if self.visu_password.is_none() {
                tracing::warn!("no visualisation password configured; secure commands will time out");
                return;
            }
            state.visu_in_progress = true;
        }
        tracing::debug!("starting visualisation handshake");
        self.send(Command::get_visu_salt(&self.user));
    }

    pub(crate) fn visu_credential(&self) -> Option<VisuCredential> {
        self.state.lock().visu.clone()
    }

    /// Bootstrap info of the connected miniserver, once initialised.
    pub(crate) fn api_info(&self) -> Option<ApiInfo> {
        self.state.lock().api_info.clone()
    }

    /// The miniserver rejected the credential (401) or gave up on the
    /// cycle (420).
    pub(crate) fn auth_failed(&self, code: u16) {
        tracing::warn!(code, "authentication cycle failed");
        let mut state = self.state.lock();
        state.phase = AuthState::Failed;
        state.in_progress = false;
        state.token = None;
        if let Some(task) = state.refresh_task.take() {
            task.cancel();
        }
    }

    /// The miniserver rejected a secured action (500).
    pub(crate) fn visu_auth_failed(&self) {
        tracing::warn!("visualisation handshake failed");
        let mut state = self.state.lock();
        state.visu_in_progress = false;
        state.visu = None;
    }

    /// Resets the engine after the socket closed.
    pub(crate) fn ws_closed(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.refresh_task.take() {
            task.cancel();
        }
        *state = EngineState::default();
    }

    fn send(&self, command: Command) {
        if self.sender.send(command).is_err() {
            tracing::trace!("command sink gone; session closed");
        }
    }

    fn emit(&self, signal: Signal) {
        let listeners = self.listeners.read().clone();
        for listener in &listeners {
            match signal {
                Signal::Auth => listener.auth_completed(),
                Signal::Visu => listener.visu_auth_completed(),
            }
        }
    }

    fn schedule_refresh(&self, valid: Duration) {
        let Some(weak) = self.me.get().cloned() else {
            return;
        };
        // refresh at roughly 80% of the validity window
        let delay = valid * 4 / 5;
        let token = self.scheduler.schedule_once(delay, move || async move {
            if let Some(engine) = weak.upgrade() {
                engine.refresh();
            }
        });
        let mut state = self.state.lock();
        if let Some(old) = state.refresh_task.replace(token) {
            old.cancel();
        }
    }

    fn refresh(&self) {
        let hash = {
            let mut state = self.state.lock();
            if state.phase != AuthState::TokenIssued {
                return;
            }
            let (Some(token), Some(user_key)) = (state.token.as_ref(), state.user_key.as_ref())
            else {
                return;
            };
            match crypto::token_hash(&token.token, user_key) {
                Ok(hash) => {
                    state.phase = AuthState::Refreshing;
                    hash
                }
                Err(err) => {
                    tracing::warn!("cannot hash token for refresh: {err}");
                    return;
                }
            }
        };
        tracing::debug!("refreshing session token");
        self.send(Command::refresh_token(&hash, &self.user));
    }

    fn handle_key_exchanged(&self) -> Disposition {
        self.state.lock().phase = AuthState::KeyExchanged;
        tracing::debug!("session key exchanged");
        self.send(Command::get_key(&self.user));
        Disposition::Consumed
    }

    fn handle_user_key(&self, message: &LoxoneMessage) -> Disposition {
        let challenge: UserKeyResponse = match message.value_as() {
            Ok(challenge) => challenge,
            Err(err) => {
                tracing::warn!("user key challenge malformed: {err}");
                self.auth_failed(message.code);
                return Disposition::Consumed;
            }
        };
        match crypto::user_hash(&self.user, &self.password, &challenge) {
            Ok(hash) => {
                {
                    let mut state = self.state.lock();
                    state.user_key = Some(challenge);
                    state.phase = AuthState::Challenged;
                }
                self.send(Command::get_token(
                    &hash,
                    &self.user,
                    TOKEN_PERMISSION,
                    &self.client_id.to_string(),
                    &self.client_info,
                ));
            }
            Err(err) => {
                tracing::warn!("cannot hash credential: {err}");
                self.auth_failed(message.code);
            }
        }
        Disposition::Consumed
    }

    fn handle_token(&self, message: &LoxoneMessage) -> Disposition {
        let token: TokenResponse = match message.value_as() {
            Ok(token) => token,
            Err(err) => {
                tracing::warn!("token response malformed: {err}");
                self.auth_failed(message.code);
                return Disposition::Consumed;
            }
        };
        let valid = Duration::from_secs(token.valid_seconds);
        let was_refresh = {
            let mut state = self.state.lock();
            let was_refresh = state.phase == AuthState::Refreshing;
            state.token = Some(TokenState {
                token: token.token,
                issued: Instant::now(),
                valid,
            });
            state.phase = AuthState::TokenIssued;
            state.in_progress = false;
            was_refresh
        };
        tracing::debug!(valid_seconds = token.valid_seconds, "session token issued");
        self.schedule_refresh(valid);
        if !was_refresh {
            self.emit(Signal::Auth);
        }
        Disposition::Consumed
    }

    fn handle_visu_salt(&self, message: &LoxoneMessage) -> Disposition {
        let Some(visu_password) = &self.visu_password else {
            tracing::warn!("visualisation salt without configured password");
            return Disposition::Consumed;
        };
        let response: VisuSaltResponse = match message.value_as() {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!("visualisation salt malformed: {err}");
                self.visu_auth_failed();
                return Disposition::Consumed;
            }
        };
        match VisuCredential::derive(visu_password, &response) {
            Ok(credential) => {
                let auth_hash = credential.auth_hash().to_owned();
                self.state.lock().visu = Some(credential);
                self.send(Command::auth_with_visu_hash(&auth_hash, &self.user));
            }
            Err(err) => {
                tracing::warn!("cannot derive visualisation credential: {err}");
                self.visu_auth_failed();
            }
        }
        Disposition::Consumed
    }

    fn handle_visu_auth(&self) -> Disposition {
        self.state.lock().visu_in_progress = false;
        tracing::debug!("visualisation handshake completed");
        self.emit(Signal::Visu);
        Disposition::Consumed
    }
}

fn usable(state: &EngineState) -> bool {
    matches!(state.phase, AuthState::TokenIssued | AuthState::Refreshing)
        && state
            .token
            .as_ref()
            .is_some_and(|token| token.issued.elapsed() < token.valid)
}

impl CommandResponseListener for AuthEngine {
    fn accepts(&self, kind: ResponseKind) -> bool {
        matches!(
            kind,
            ResponseKind::SessionKey
                | ResponseKind::UserKey
                | ResponseKind::Token
                | ResponseKind::VisuSalt
                | ResponseKind::VisuAuth
        )
    }

    fn on_command(&self, command: &Command, message: &LoxoneMessage) -> Disposition {
        match command.kind() {
            ResponseKind::SessionKey => self.handle_key_exchanged(),
            ResponseKind::UserKey => self.handle_user_key(message),
            ResponseKind::Token => self.handle_token(message),
            ResponseKind::VisuSalt => self.handle_visu_salt(message),
            ResponseKind::VisuAuth => self.handle_visu_auth(),
            _ => Disposition::Ignored,
        }
    }
}
