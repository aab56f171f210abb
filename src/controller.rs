//! Account configuration state machine

use crate::config::Credentials;
use crate::error::{Error, ErrorCode, NegotiationError, Result};
use crate::event::{Event, EventFilter, EventHub, EventReceiver, Progress};
use crate::imap::ImapNegotiator;
use crate::negotiate::Negotiator;
use crate::settings::ConfiguredSettings;
use crate::store::AccountStore;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Lifecycle state of the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigState {
    Unconfigured,
    Configuring,
    Configured,
    Failed,
}

impl ConfigState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "unconfigured",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ConfigState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `configure` does while another attempt is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Refuse with [`Error::Busy`].
    #[default]
    Reject,
    /// Run the new attempt after the running one(s), in call order.
    Queue,
}

#[derive(Debug)]
struct Shared {
    state: ConfigState,
    pending: usize,
    offline: bool,
    last_attempt: Option<JoinHandle<()>>,
}

/// Owns the configuration lifecycle of one account.
///
/// `configure` never blocks: the negotiation runs on the tokio runtime
/// the controller was created on, and its outcome is reported through
/// events. Subscribe before calling `configure` to be sure to see the
/// terminal event.
pub struct ConfigurationController<N: Negotiator = ImapNegotiator> {
    store: Arc<AccountStore>,
    negotiator: Arc<N>,
    events: EventHub,
    shared: Arc<Mutex<Shared>>,
    policy: BusyPolicy,
    runtime: Handle,
}

impl<N: Negotiator> ConfigurationController<N> {
    /// Open the account store at `path` and bind a controller to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be loaded or no tokio
    /// runtime is running.
    pub async fn open(path: impl AsRef<Path>, negotiator: N) -> Result<Self> {
        let store = AccountStore::open(path).await?;
        Self::with_store(store, negotiator)
    }

    /// Bind a controller to an already opened store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when called outside a tokio runtime.
    pub fn with_store(store: AccountStore, negotiator: N) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Config(format!("No tokio runtime available: {e}")))?;

        let state = if store.is_configured() {
            ConfigState::Configured
        } else {
            ConfigState::Unconfigured
        };

        Ok(Self {
            store: Arc::new(store),
            negotiator: Arc::new(negotiator),
            events: EventHub::default(),
            shared: Arc::new(Mutex::new(Shared {
                state,
                pending: 0,
                offline: false,
                last_attempt: None,
            })),
            policy: BusyPolicy::default(),
            runtime,
        })
    }

    #[must_use]
    pub const fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Whether validated settings are stored for the account.
    ///
    /// A failed re-configuration leaves earlier settings in place, so
    /// this can be true while [`Self::state`] is `Failed`.
    #[must_use]
    pub fn is_configured(&self) -> bool {
        self.store.is_configured()
    }

    #[must_use]
    pub fn state(&self) -> ConfigState {
        self.lock().state
    }

    /// The configured address, if any.
    #[must_use]
    pub fn addr(&self) -> Option<String> {
        self.store.load().addr().map(str::to_owned)
    }

    #[must_use]
    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Register a listener. Only events emitted from now on are
    /// delivered.
    #[must_use]
    pub fn subscribe(&self, filter: EventFilter) -> EventReceiver {
        self.events.subscribe(filter)
    }

    /// Mark the network as unavailable. Attempts that start while
    /// offline fail without contacting the provider.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
        info!("Network marked {}", if offline { "offline" } else { "online" });
    }

    #[must_use]
    pub fn is_offline(&self) -> bool {
        self.lock().offline
    }

    /// Start configuring the account with `credentials`.
    ///
    /// Returns as soon as the attempt is scheduled. Progress and the
    /// single terminal `Ready` or `Error` event follow on the event
    /// channel.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidCredentials`] if the address or password is
    ///   missing or malformed. No state change, no event.
    /// - [`Error::Busy`] if an attempt is running and the policy is
    ///   [`BusyPolicy::Reject`]. The running attempt is unaffected.
    pub fn configure(&self, credentials: Credentials) -> Result<()> {
        credentials.validate()?;

        let mut shared = self.lock();
        if shared.state == ConfigState::Configuring && self.policy == BusyPolicy::Reject {
            warn!("Rejecting configure for {}: busy", credentials.address());
            return Err(Error::Busy);
        }
        shared.state = ConfigState::Configuring;
        shared.pending += 1;

        info!("Configuring account {}", credentials.address());

        let attempt = Attempt {
            store: Arc::clone(&self.store),
            negotiator: Arc::clone(&self.negotiator),
            events: self.events.clone(),
            shared: Arc::clone(&self.shared),
        };
        // Each attempt waits for its predecessor, so queued attempts
        // run and report in call order.
        let previous = shared.last_attempt.take();
        shared.last_attempt = Some(self.runtime.spawn(attempt.run(credentials, previous)));
        Ok(())
    }

    /// Key/value summary of the account, without secrets.
    #[must_use]
    pub fn info(&self) -> BTreeMap<String, String> {
        let account = self.store.load();
        let mut info = BTreeMap::new();

        info.insert("version".into(), env!("CARGO_PKG_VERSION").into());
        info.insert("state".into(), self.state().to_string());
        info.insert("configured".into(), account.is_configured().to_string());
        info.insert("offline".into(), self.is_offline().to_string());
        info.insert(
            "store".into(),
            self.store
                .path()
                .map_or_else(|| "<memory>".to_string(), |p| p.display().to_string()),
        );

        if let Some(settings) = account.configured {
            info.insert("addr".into(), settings.addr);
            info.insert(
                "imap".into(),
                format!("{} ({})", settings.imap.endpoint(), settings.imap.security),
            );
            info.insert("imap_user".into(), settings.imap.username);
            info.insert(
                "smtp".into(),
                format!("{} ({})", settings.smtp.endpoint(), settings.smtp.security),
            );
            info.insert("smtp_user".into(), settings.smtp.username);
            info.insert("configured_at".into(), settings.configured_at.to_rfc3339());
        }

        info
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One scheduled `configure` invocation.
struct Attempt<N> {
    store: Arc<AccountStore>,
    negotiator: Arc<N>,
    events: EventHub,
    shared: Arc<Mutex<Shared>>,
}

impl<N: Negotiator> Attempt<N> {
    async fn run(self, credentials: Credentials, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            // A panicked predecessor has already been accounted for.
            previous.await.ok();
        }
        let progress = Progress::new(self.events.clone());

        let outcome = self.negotiate(&credentials, &progress).await;
        let outcome = match outcome {
            Ok(settings) => {
                progress.permille(900);
                let addr = settings.addr.clone();
                self.store
                    .save_settings(settings)
                    .await
                    .map(|()| addr)
                    .map_err(|e| NegotiationError::new(ErrorCode::Storage, e.to_string()))
            }
            Err(e) => Err(e),
        };

        {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.pending = shared.pending.saturating_sub(1);
            shared.state = match (&outcome, shared.pending) {
                (_, 1..) => ConfigState::Configuring,
                (Ok(_), 0) => ConfigState::Configured,
                (Err(_), 0) => ConfigState::Failed,
            };
        }

        let event = match outcome {
            Ok(addr) => {
                info!("Account {} configured", addr);
                Event::Ready { addr }
            }
            Err(e) => {
                warn!("Configuring {} failed: {}", credentials.address(), e);
                Event::Error {
                    code: e.code,
                    message: e.message,
                }
            }
        };
        progress.close();
        self.events.emit(event);
    }

    async fn negotiate(
        &self,
        credentials: &Credentials,
        progress: &Progress,
    ) -> std::result::Result<ConfiguredSettings, NegotiationError> {
        let offline = self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .offline;
        if offline {
            return Err(NegotiationError::new(
                ErrorCode::Offline,
                "Network is marked offline",
            ));
        }

        progress.permille(10);
        AssertUnwindSafe(self.negotiator.negotiate(credentials, progress))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(NegotiationError::new(
                    ErrorCode::Protocol,
                    "Negotiation backend panicked",
                ))
            })
    }
}
