//! In-process fake IMAP server for integration testing
//!
//! ## Connection lifecycle
//!
//! ```text
//!   Client connects via TCP
//!       |
//!   Server sends greeting: "* OK IMAP4rev1 ready\r\n"
//!       |
//!   Client sends STARTTLS to upgrade the connection
//!       |
//!   TLS handshake (after this, all traffic is encrypted)
//!       |
//!   (with `Handshake::Implicit` the TLS handshake comes first and
//!    the greeting is sent over TLS)
//!       |
//!   Client sends LOGIN with username and password
//!       |
//!   Server answers OK, or NO [AUTHENTICATIONFAILED]
//!       |
//!   Client sends LOGOUT
//! ```
//!
//! Every client command starts with a tag (async-imap uses `A0001`,
//! `A0002`, ...) that the server echoes in its completion response.

use super::handlers::{handle_login, handle_logout};
use super::io::write_line;
use super::users::Users;
use imap_codec::CommandCodec;
use imap_codec::decode::Decoder;
use imap_codec::imap_types::command::CommandBody;
use imap_codec::imap_types::core::AString;
use rcgen::generate_simple_self_signed;
use rustls::pki_types::PrivatePkcs8KeyDer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

/// How a connection reaches TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handshake {
    /// Plain greeting, then STARTTLS (port 143 style).
    Starttls,
    /// TLS from the first byte (port 993 style).
    Implicit,
}

/// A fake IMAP server that runs on localhost with an OS-assigned port.
///
/// The server generates a self-signed TLS certificate for `127.0.0.1`
/// at startup using `rcgen`, so clients must accept invalid
/// certificates.
pub struct FakeImapServer {
    port: u16,
    logins: Arc<AtomicUsize>,
    /// Accept loop, aborted when the server is dropped.
    handle: tokio::task::JoinHandle<()>,
}

impl FakeImapServer {
    /// Start a new STARTTLS fake IMAP server that accepts `users`.
    pub async fn start(users: Users) -> Self {
        Self::start_with(users, Handshake::Starttls).await
    }

    /// Start a fake IMAP server that only speaks implicit TLS.
    pub async fn start_implicit_tls(users: Users) -> Self {
        Self::start_with(users, Handshake::Implicit).await
    }

    async fn start_with(users: Users, handshake: Handshake) -> Self {
        // Several tests may race to install the provider; only the
        // first one wins, which is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind to ephemeral port");
        let port = listener.local_addr().unwrap().port();

        let cert = generate_simple_self_signed(vec!["127.0.0.1".to_string()])
            .expect("generate self-signed cert");

        let cert_der = cert.cert.der().clone();
        let key_der = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der.into())
            .expect("build server TLS config");

        let acceptor = TlsAcceptor::from(Arc::new(tls_config));
        let users = Arc::new(users);
        let logins = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&logins);
        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, _addr)) = listener.accept().await else {
                    break;
                };
                let acceptor = acceptor.clone();
                let users = Arc::clone(&users);
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    match handshake {
                        Handshake::Starttls => {
                            handle_connection(stream, acceptor, &users, &counter).await;
                        }
                        Handshake::Implicit => {
                            handle_tls_connection(stream, acceptor, &users, &counter).await;
                        }
                    }
                });
            }
        });

        Self {
            port,
            logins,
            handle,
        }
    }

    /// The port the server is listening on.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Number of LOGIN commands received so far.
    pub fn login_attempts(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

impl Drop for FakeImapServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A localhost port with nothing listening on it.
pub async fn unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to ephemeral port");
    listener.local_addr().unwrap().port()
}

/// Handle a single IMAP client connection: greeting, STARTTLS, then
/// the command loop over TLS.
async fn handle_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    users: &Users,
    logins: &AtomicUsize,
) {
    let mut reader = BufReader::new(stream);

    // RFC 3501 Section 7.1.1: Server greeting
    if write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    let mut line = String::new();
    if reader.read_line(&mut line).await.is_err() {
        return;
    }

    let parts: Vec<&str> = line.trim().splitn(2, ' ').collect();
    if parts.len() < 2 {
        return;
    }
    let tag = parts[0];
    let command = parts[1].to_uppercase();

    if command != "STARTTLS" {
        let resp = format!("{tag} BAD Expected STARTTLS\r\n");
        let _ = write_line(&mut reader, &resp).await;
        return;
    }

    let resp = format!("{tag} OK Begin TLS negotiation now\r\n");
    if write_line(&mut reader, &resp).await.is_err() {
        return;
    }

    let tcp = reader.into_inner();
    let Ok(tls_stream) = acceptor.accept(tcp).await else {
        return;
    };

    handle_imap_session(tls_stream, users, logins).await;
}

/// Handle an implicit TLS connection: handshake first, then the
/// greeting and the command loop.
async fn handle_tls_connection(
    stream: tokio::net::TcpStream,
    acceptor: TlsAcceptor,
    users: &Users,
    logins: &AtomicUsize,
) {
    // A plaintext client (e.g. one sending STARTTLS) fails the handshake
    // and gets disconnected.
    let Ok(tls_stream) = acceptor.accept(stream).await else {
        return;
    };

    let mut reader = BufReader::new(tls_stream);
    if write_line(&mut reader, "* OK IMAP4rev1 Fake server ready\r\n")
        .await
        .is_err()
    {
        return;
    }

    // Nothing has been read yet, so no buffered input is lost.
    handle_imap_session(reader.into_inner(), users, logins).await;
}

fn astring(value: &AString<'_>) -> String {
    let bytes: &[u8] = value.as_ref();
    String::from_utf8_lossy(bytes).into_owned()
}

/// Run the IMAP command loop over an established stream.
///
/// Uses `imap-codec`'s `CommandCodec` to parse each client command
/// and dispatches on the `CommandBody` variant.
async fn handle_imap_session<S: AsyncRead + AsyncWrite + Unpin>(
    stream: S,
    users: &Users,
    logins: &AtomicUsize,
) {
    let mut reader = BufReader::new(stream);
    let codec = CommandCodec::default();

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let Ok((_, command)) = codec.decode(line.as_bytes()) else {
            let tag = trimmed.split_whitespace().next().unwrap_or("*");
            let resp = format!("{tag} BAD Parse error\r\n");
            if write_line(&mut reader, &resp).await.is_err() {
                break;
            }
            continue;
        };

        let tag = command.tag.inner();

        match command.body {
            CommandBody::Login {
                ref username,
                ref password,
            } => {
                logins.fetch_add(1, Ordering::SeqCst);
                let username = astring(username);
                let password = astring(password.declassify());
                if !handle_login(tag, &username, &password, users, &mut reader).await {
                    break;
                }
            }
            CommandBody::Logout => {
                handle_logout(tag, &mut reader).await;
                break;
            }
            _ => {
                let resp = format!("{tag} BAD Unknown command\r\n");
                if write_line(&mut reader, &resp).await.is_err() {
                    break;
                }
            }
        }
    }
}
