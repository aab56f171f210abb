//! Accounts known to the fake IMAP server
//!
//! ```ignore
//! let users = Users::new()
//!     .user("alice@example.com", "correct-pw")
//!     .user("bob@example.com", "hunter2");
//! ```

/// The username/password pairs LOGIN accepts. Anything else is
/// answered with `NO [AUTHENTICATIONFAILED]`.
#[derive(Debug, Clone, Default)]
pub struct Users {
    entries: Vec<(String, String)>,
}

impl Users {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `username` with `password`.
    pub fn user(mut self, username: &str, password: &str) -> Self {
        self.entries
            .push((username.to_string(), password.to_string()));
        self
    }

    /// Whether the pair is accepted (case-sensitive on both sides).
    pub fn check(&self, username: &str, password: &str) -> bool {
        self.entries
            .iter()
            .any(|(u, p)| u == username && p == password)
    }
}
