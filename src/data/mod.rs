//! Data at rest inside the enclave
//!
//! - Per-session symmetric keys ([`SessionKeyStore`])
//! - Dataset registry and sealed storage ([`DatasetVault`])

mod session_keys;
mod vault;

pub use session_keys::*;
pub use vault::*;
