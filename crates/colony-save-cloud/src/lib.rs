//! REST adapters for colony save sync.
//!
//! - [`RestRemoteBackend`]: `RemoteBackend` over a PostgREST-style table
//! - [`RestAuthProvider`]: password sign-in against the matching auth API

mod auth;
mod config;
mod rest;

pub use auth::RestAuthProvider;
pub use config::RestConfig;
pub use rest::RestRemoteBackend;
