//! # User Authentication
//!
//! Username/password validation for RFC 1929 sub-negotiation. The session parses the
//! credentials off the wire and hands a [`User`] to a [`UserAuthenticator`]; the answer
//! decides between `[0x01, 0x00]` and `[0x01, 0xFF]`.
//!
//! ```rust
//! use ranger::auth::{User, UserAuthenticator, UserTable};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let table = UserTable::new();
//! assert!(table.add_user("admin", "password"));
//!
//! let user = User::new("admin", "password");
//! assert!(table.authenticate_user(user).await);
//! # }
//! ```

use std::future::Future;

mod user_table;

pub use user_table::UserTable;

/// Represents a user with a username and password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub password: String,
}

impl User {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        User {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// The `UserAuthenticator` trait defines the functionality for validating user credentials.
pub trait UserAuthenticator {
    /// Whether any credentials are configured at all. Listeners only ask clients for
    /// username/password when this is true.
    fn requires_auth(&self) -> bool;

    /// Resolves to `true` when `user` may use the proxy.
    fn authenticate_user(&self, user: User) -> impl Future<Output = bool> + Send;
}
