use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const DEFAULT_ROLE: &str = "user";

/// A user record as it sits in the credential store, password hash included.
/// Never serialized to clients; convert with `to_public` first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUser {
    pub email: String,
    pub name: String,
    pub role: String,
    pub password_hash: Option<String>,
}

/// Client-safe view of a user.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublicUser {
    pub email: String,
    pub name: String,
    pub role: String,
}

/// Input for `CredentialStore::store_user`; the password is plaintext here and hashed
/// before anything is written.
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    pub role: String,
    pub password: Option<String>,
}

/// Partial update; only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub role: Option<String>,
    pub password: Option<String>,
}

impl StoredUser {
    pub(crate) fn from_fields(mut fields: HashMap<String, String>) -> Option<Self> {
        if fields.is_empty() { return None; }
        Some(Self {
            email: fields.remove("email").unwrap_or_default(),
            name: fields.remove("name").unwrap_or_default(),
            role: fields.remove("role").unwrap_or_default(),
            password_hash: fields.remove("password").filter(|h| !h.is_empty()),
        })
    }

    pub fn to_public(&self) -> PublicUser {
        PublicUser { email: self.email.clone(), name: self.name.clone(), role: self.role.clone() }
    }
}

impl From<StoredUser> for PublicUser {
    fn from(u: StoredUser) -> Self {
        PublicUser { email: u.email, name: u.name, role: u.role }
    }
}
