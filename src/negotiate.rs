//! Negotiation backend seam
//!
//! The controller only knows that a negotiator turns credentials into
//! settings or a structured failure. [`crate::ImapNegotiator`] is the
//! production implementation.

use crate::config::Credentials;
use crate::error::NegotiationError;
use crate::event::Progress;
use crate::settings::ConfiguredSettings;
use std::future::Future;

/// Performs the provider handshake for a configuration attempt.
///
/// Implementations may report non-terminal events through `progress`.
/// The terminal event is emitted by the controller from the returned
/// value.
pub trait Negotiator: Send + Sync + 'static {
    fn negotiate(
        &self,
        credentials: &Credentials,
        progress: &Progress,
    ) -> impl Future<Output = std::result::Result<ConfiguredSettings, NegotiationError>> + Send;
}
