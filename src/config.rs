//! Account credentials
//!
//! The transient input to `configure`. Loaded from the process
//! environment by the driver, or built directly by library users.

use crate::error::{Error, Result};
use crate::settings::Security;
use std::env;
use std::fmt;

/// Credentials and optional provider overrides for one account.
///
/// Only `addr` and `mail_pw` are required. Every other field pins a
/// setting that would otherwise be guessed from the address domain.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub addr: String,
    pub mail_pw: String,
    pub mail_server: Option<String>,
    pub mail_port: Option<u16>,
    pub mail_user: Option<String>,
    pub mail_security: Option<Security>,
    pub send_server: Option<String>,
    pub send_port: Option<u16>,
    pub send_user: Option<String>,
    pub send_pw: Option<String>,
}

impl Credentials {
    #[must_use]
    pub fn new(addr: impl Into<String>, mail_pw: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            mail_pw: mail_pw.into(),
            ..Self::default()
        }
    }

    /// Load credentials from environment variables
    ///
    /// Reads from `.env` file if present. Required variables:
    /// - `DC_ADDR`
    /// - `DC_MAIL_PW`
    ///
    /// Optional overrides:
    /// - `DC_MAIL_SERVER`, `DC_MAIL_PORT`, `DC_MAIL_USER`,
    ///   `DC_MAIL_SECURITY` (`tls` or `starttls`)
    /// - `DC_SEND_SERVER`, `DC_SEND_PORT`, `DC_SEND_USER`, `DC_SEND_PW`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a required variable is missing or
    /// an override cannot be parsed.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            addr: env::var("DC_ADDR").map_err(|_| Error::Config("DC_ADDR not set".into()))?,
            mail_pw: env::var("DC_MAIL_PW")
                .map_err(|_| Error::Config("DC_MAIL_PW not set".into()))?,
            mail_server: optional_var("DC_MAIL_SERVER"),
            mail_port: optional_port("DC_MAIL_PORT")?,
            mail_user: optional_var("DC_MAIL_USER"),
            mail_security: optional_var("DC_MAIL_SECURITY")
                .map(|s| {
                    s.parse::<Security>()
                        .map_err(|e| Error::Config(format!("Invalid DC_MAIL_SECURITY: {e}")))
                })
                .transpose()?,
            send_server: optional_var("DC_SEND_SERVER"),
            send_port: optional_port("DC_SEND_PORT")?,
            send_user: optional_var("DC_SEND_USER"),
            send_pw: optional_var("DC_SEND_PW"),
        })
    }

    /// Check the input shape before any negotiation is attempted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCredentials`] if the address or the
    /// password is missing, or the address is not `local@domain`.
    pub fn validate(&self) -> Result<()> {
        let addr = self.addr.trim();
        if addr.is_empty() {
            return Err(Error::InvalidCredentials("address is empty".into()));
        }
        if self.mail_pw.is_empty() {
            return Err(Error::InvalidCredentials("password is empty".into()));
        }
        match addr.split_once('@') {
            Some((local, domain))
                if !local.is_empty() && !domain.is_empty() && !domain.contains('@') =>
            {
                Ok(())
            }
            _ => Err(Error::InvalidCredentials(format!(
                "'{addr}' is not a valid email address"
            ))),
        }
    }

    /// The address with surrounding whitespace removed.
    #[must_use]
    pub fn address(&self) -> &str {
        self.addr.trim()
    }

    /// The domain part of the address, lowercased.
    #[must_use]
    pub fn domain(&self) -> String {
        self.address()
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default()
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("addr", &self.addr)
            .field("mail_server", &self.mail_server)
            .field("mail_port", &self.mail_port)
            .field("mail_user", &self.mail_user)
            .field("mail_security", &self.mail_security)
            .field("send_server", &self.send_server)
            .field("send_port", &self.send_port)
            .field("send_user", &self.send_user)
            .finish_non_exhaustive()
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn optional_port(name: &str) -> Result<Option<u16>> {
    optional_var(name)
        .map(|v| {
            v.trim()
                .parse::<u16>()
                .map_err(|e| Error::Config(format!("Invalid {name}: {e}")))
        })
        .transpose()
}
