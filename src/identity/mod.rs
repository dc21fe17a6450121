//! Identity: who a caller is and how that is proven.
//! Credential storage and token signing are independent leaves; the HTTP gateway in
//! `server::auth` composes them.

mod principal;
mod credentials;
mod token;

pub use principal::{StoredUser, PublicUser, NewUser, UserUpdate, DEFAULT_ROLE};
pub use credentials::{CredentialStore, CredentialError, CredentialResult, SESSION_TTL};
pub use token::{TokenService, TokenError, Claims, DEFAULT_TOKEN_TTL};
