// Authentication module
// Credential types, the identity provider contract and the Firebase adapter

mod firebase;
mod manager;
mod provider;
mod refresh;
mod types;

pub use firebase::{FederatedToken, FirebaseIdentity};
pub use manager::TokenManager;
pub use provider::IdentityProvider;
pub use refresh::{ProviderEndpoints, DEFAULT_IDENTITY_ENDPOINT, DEFAULT_TOKEN_ENDPOINT};
pub use types::{Credential, Principal, TokenData, TokenSource};
