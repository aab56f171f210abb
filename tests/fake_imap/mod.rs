//! Fake IMAP server for integration testing
//!
//! An in-process server that speaks just enough IMAP to exercise a
//! configuration attempt end-to-end:
//!
//! TCP -> greeting -> STARTTLS -> TLS handshake -> LOGIN -> LOGOUT
//! TCP -> TLS handshake -> greeting -> LOGIN -> LOGOUT (implicit TLS)
//!
//! ## Module layout
//!
//! - `server` -- TCP listener, TLS setup, and connection dispatch
//! - `handlers/` -- LOGIN and LOGOUT
//! - `users` -- the credentials the server accepts
//! - `io` -- shared write helpers

// Each test binary uses a different subset of the helpers.
#![allow(dead_code)]

mod handlers;
mod io;
mod server;
pub mod users;

pub use server::{FakeImapServer, unused_port};
pub use users::Users;
