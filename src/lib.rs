//! Mail account configuration
//!
//! Drives a single mail account from "unconfigured" to "configured":
//! credentials go in, an IMAP login check runs in the background, and
//! the outcome comes back as [`Event`]s. Validated settings are kept
//! in a durable [`AccountStore`] so the account stays configured
//! across restarts.
//!
//! ```no_run
//! use mail_configure::{ConfigurationController, Credentials, EventFilter, ImapNegotiator};
//!
//! # async fn run() -> mail_configure::Result<()> {
//! let ctl = ConfigurationController::open("account.json", ImapNegotiator::new()).await?;
//! if !ctl.is_configured() {
//!     let mut events = ctl.subscribe(EventFilter::All);
//!     ctl.configure(Credentials::new("user@example.com", "secret"))?;
//!     let outcome = events.wait_terminal().await;
//!     println!("{outcome:?}");
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod controller;
mod error;
mod event;
mod imap;
mod negotiate;
mod settings;
mod store;

pub use config::Credentials;
pub use controller::{BusyPolicy, ConfigState, ConfigurationController};
pub use error::{Error, ErrorCode, NegotiationError, Result};
pub use event::{Event, EventClass, EventFilter, EventReceiver, Progress};
pub use imap::{ImapNegotiator, imap_candidates, smtp_settings};
pub use negotiate::Negotiator;
pub use settings::{ConfiguredSettings, Security, ServerSettings};
pub use store::{AccountStore, StoredAccount};
