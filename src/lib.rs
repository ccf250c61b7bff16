//! Elohim Custodian - origin-gated key custody for Elohim apps
//!
//! An embedding app asks a custodian it cannot inspect to disclose its
//! identity, sign, or verify. Private keys never cross the channel.
//!
//! ## Architecture
//!
//! ```text
//! caller ── CustodianClient ──(Link: JSON frames)──> Custodian
//!              pending map                            origin guard
//!              timeouts / probe                       key store + vault
//!                                                     backup codec
//! ```
//!
//! - **origin**: two-tier allowlist consulted before anything else
//! - **keys**: secp256k1 keys exposed as `did:key` identifiers
//! - **protocol**: correlated request/reply frames
//! - **channel**: in-process and WebSocket links
//! - **client**: the caller's stub
//! - **custodian**: state owner and request handler
//! - **backup**: Argon2id + ChaCha20-Poly1305 archives of the whole state
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-custodian/
//! ├── config.toml
//! └── vault/
//!     ├── keys                  # key store + active pointer (0600)
//!     ├── allowlist.user        # origins added by the owner
//!     └── allowlist.defaults    # built-in origins, for reference
//! ```

pub mod backup;
pub mod channel;
pub mod client;
pub mod config;
pub mod custodian;
pub mod error;
pub mod keys;
pub mod origin;
pub mod protocol;
pub mod vault;

// Re-exports
pub use backup::{BackupArchive, BackupSnapshot, ImportSummary};
pub use channel::{
    serve_websocket, Frame, InProcessLauncher, Launcher, Link, WebSocketLauncher,
};
pub use client::{ClientConfig, CustodianClient};
pub use config::Config;
pub use custodian::Custodian;
pub use error::{CustodyError, OperationError, Result};
pub use keys::{KeyStore, KeySummary};
pub use origin::{AllowlistImport, AllowlistSnapshot, OriginPolicy};
pub use protocol::{Operation, Outcome, Reply, RequestFrame};
pub use vault::{write_owner_only, FileVault, MemoryVault, Vault};
