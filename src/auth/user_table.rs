use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use tracing::{debug, trace};

use super::{User, UserAuthenticator};

/// Username to password map shared by every session of a listener.
///
/// Lookups take the read lock, so concurrent authentications do not serialize; inserts are
/// rare and take the write lock.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: Arc<RwLock<HashMap<String, String>>>,
}

impl UserTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a user. Returns `false` when the username already exists; the stored password
    /// is left untouched in that case.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) -> bool {
        let username = username.into();
        let mut users = match self.users.write() {
            Ok(users) => users,
            Err(poisoned) => poisoned.into_inner(),
        };

        if users.contains_key(&username) {
            debug!("User {:?} already exists", username);
            return false;
        }
        users.insert(username, password.into());
        true
    }

    pub fn len(&self) -> usize {
        self.read(|users| users.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn check(&self, user: &User) -> bool {
        trace!(
            "Checking username: {:?}, and password: {:?}",
            user.username,
            user.password
        );
        self.read(|users| {
            users
                .get(&user.username)
                .is_some_and(|password| *password == user.password)
        })
    }

    fn read<R>(&self, f: impl FnOnce(&HashMap<String, String>) -> R) -> R {
        match self.users.read() {
            Ok(users) => f(&users),
            Err(poisoned) => f(&poisoned.into_inner()),
        }
    }
}

impl UserAuthenticator for UserTable {
    fn requires_auth(&self) -> bool {
        !self.is_empty()
    }

    async fn authenticate_user(&self, user: User) -> bool {
        self.check(&user)
    }
}
