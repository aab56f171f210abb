//! IMAP-backed negotiation
//!
//! Resolves candidate servers for the account, logs in to the first
//! one that answers and logs out again. The SMTP side is derived from
//! the credentials and the address domain without a wire check.

use crate::config::Credentials;
use crate::error::{ErrorCode, NegotiationError};
use crate::event::Progress;
use crate::negotiate::Negotiator;
use crate::settings::{ConfiguredSettings, Security, ServerSettings};
use chrono::Utc;
use rustls::pki_types::ServerName;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::compat::TokioAsyncReadCompatExt;
use tracing::{debug, info, warn};

type NegotiationResult<T> = std::result::Result<T, NegotiationError>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Negotiator that validates credentials with an IMAP LOGIN.
#[derive(Debug, Clone)]
pub struct ImapNegotiator {
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl Default for ImapNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl ImapNegotiator {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }

    /// Upper bound for connecting to and logging in on one candidate.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip certificate verification.
    ///
    /// Needed for local bridges that serve self-signed certificates.
    #[must_use]
    pub const fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    async fn try_login(&self, server: &ServerSettings) -> NegotiationResult<()> {
        tokio::time::timeout(self.timeout, self.login(server))
            .await
            .map_err(|_| {
                NegotiationError::new(
                    ErrorCode::Unreachable,
                    format!("Timed out after {:?} on {}", self.timeout, server.endpoint()),
                )
            })?
    }

    async fn login(&self, server: &ServerSettings) -> NegotiationResult<()> {
        let addr = server.endpoint();
        debug!("Connecting to IMAP server at {}", addr);

        let tcp_stream = TcpStream::connect(&addr).await.map_err(|e| {
            NegotiationError::new(ErrorCode::Unreachable, format!("{addr}: {e}"))
        })?;

        let tcp_stream = match server.security {
            Security::Tls => tcp_stream,
            Security::Starttls => {
                let mut client = async_imap::Client::new(tcp_stream.compat());
                client
                    .run_command_and_check_ok("STARTTLS", None)
                    .await
                    .map_err(|e| {
                        NegotiationError::new(ErrorCode::Tls, format!("STARTTLS failed: {e}"))
                    })?;
                client.into_inner().into_inner()
            }
        };

        let connector = tls_connector(self.accept_invalid_certs)?;
        let server_name = ServerName::try_from(server.host.clone()).map_err(|e| {
            NegotiationError::new(ErrorCode::Tls, format!("Invalid server name: {e}"))
        })?;
        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| NegotiationError::new(ErrorCode::Tls, e.to_string()))?;

        login_and_logout(async_imap::Client::new(tls_stream.compat()), server).await
    }
}

impl Negotiator for ImapNegotiator {
    async fn negotiate(
        &self,
        credentials: &Credentials,
        progress: &Progress,
    ) -> NegotiationResult<ConfiguredSettings> {
        progress.permille(100);
        let candidates = imap_candidates(credentials);
        info!(
            "Configuring {} with {} IMAP candidate(s)",
            credentials.address(),
            candidates.len()
        );

        let step = (500 / candidates.len().max(1)).max(1);
        let mut last_error = None;
        let mut imap = None;

        for (candidate, permille) in candidates.into_iter().zip((200_u16..).step_by(step)) {
            progress.permille(permille);
            progress.info(format!(
                "Trying IMAP {} ({})",
                candidate.endpoint(),
                candidate.security
            ));

            match self.try_login(&candidate).await {
                Ok(()) => {
                    imap = Some(candidate);
                    break;
                }
                Err(e) if e.code == ErrorCode::AuthFailed => return Err(e),
                Err(e) => {
                    warn!("IMAP candidate {} failed: {}", candidate.endpoint(), e);
                    progress.warning(format!("{}: {}", candidate.endpoint(), e.message));
                    last_error = Some(e);
                }
            }
        }

        let imap = imap.ok_or_else(|| {
            last_error.unwrap_or_else(|| {
                NegotiationError::new(ErrorCode::Unreachable, "No IMAP server candidates")
            })
        })?;
        progress.permille(700);
        progress.info(format!("Logged in to {}", imap.endpoint()));

        let smtp = smtp_settings(credentials, &imap);
        progress.permille(800);
        progress.info(format!("Using SMTP {} ({})", smtp.endpoint(), smtp.security));

        Ok(ConfiguredSettings {
            addr: credentials.address().to_string(),
            imap,
            smtp,
            configured_at: Utc::now(),
        })
    }
}

/// IMAP servers to try, in order.
///
/// Explicit settings in the credentials pin the host, port or
/// security; anything missing is guessed from the address domain.
#[must_use]
pub fn imap_candidates(credentials: &Credentials) -> Vec<ServerSettings> {
    let domain = credentials.domain();
    let hosts = credentials.mail_server.clone().map_or_else(
        || vec![format!("imap.{domain}"), format!("mail.{domain}"), domain.clone()],
        |host| vec![host],
    );

    let securities = match (credentials.mail_security, credentials.mail_port) {
        (Some(security), _) => vec![security],
        (None, Some(993)) => vec![Security::Tls],
        (None, Some(_)) => vec![Security::Starttls, Security::Tls],
        (None, None) => vec![Security::Tls, Security::Starttls],
    };

    let username = credentials
        .mail_user
        .clone()
        .unwrap_or_else(|| credentials.address().to_string());

    hosts
        .iter()
        .flat_map(|host| {
            securities.iter().map(|&security| ServerSettings {
                host: host.clone(),
                port: credentials.mail_port.unwrap_or_else(|| security.imap_port()),
                username: username.clone(),
                password: credentials.mail_pw.clone(),
                security,
            })
        })
        .collect()
}

/// SMTP settings derived from the credentials and the working IMAP
/// login.
#[must_use]
pub fn smtp_settings(credentials: &Credentials, imap: &ServerSettings) -> ServerSettings {
    let security = match credentials.send_port {
        Some(465) => Security::Tls,
        _ => Security::Starttls,
    };

    ServerSettings {
        host: credentials
            .send_server
            .clone()
            .unwrap_or_else(|| format!("smtp.{}", credentials.domain())),
        port: credentials
            .send_port
            .unwrap_or_else(|| security.smtp_port()),
        username: credentials
            .send_user
            .clone()
            .unwrap_or_else(|| imap.username.clone()),
        password: credentials
            .send_pw
            .clone()
            .unwrap_or_else(|| imap.password.clone()),
        security,
    }
}

async fn login_and_logout<T>(
    client: async_imap::Client<T>,
    server: &ServerSettings,
) -> NegotiationResult<()>
where
    T: futures::AsyncRead + futures::AsyncWrite + Unpin + Debug + Send,
{
    let mut session = client
        .login(&server.username, &server.password)
        .await
        .map_err(|(e, _)| {
            NegotiationError::new(classify_login_error(&e), format!("Login failed: {e}"))
        })?;

    info!("Logged in to IMAP server {}", server.endpoint());
    if let Err(e) = session.logout().await {
        debug!("LOGOUT from {} failed: {}", server.endpoint(), e);
    }
    Ok(())
}

fn classify_login_error(error: &async_imap::error::Error) -> ErrorCode {
    match error {
        async_imap::error::Error::No(_) => ErrorCode::AuthFailed,
        async_imap::error::Error::Io(_) => ErrorCode::Unreachable,
        _ => ErrorCode::Protocol,
    }
}

fn tls_connector(accept_invalid_certs: bool) -> NegotiationResult<TlsConnector> {
    let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| NegotiationError::new(ErrorCode::Tls, e.to_string()))?;

    let config = if accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    } else {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        builder.with_root_certificates(roots).with_no_client_auth()
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts all certificates
/// (for self-signed local bridges).
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
