//! IMAP command handlers for the fake server.
//!
//! One module per command the configuration check sends (LOGIN,
//! LOGOUT). Everything else is answered with BAD by the server loop.


pub use login::handle_login;
pub use logout::handle_logout;
