//! Storage peer for meshvault: holds opaque ciphertext chunks by content
//! address and answers `store`/`retrieve`/`exists`/`delete`/`verify`/`ping`
//! over HTTP and over an outbound duplex link to the coordinator.

pub mod identity;
pub mod node;
pub mod server;
pub mod store;
pub mod ws_bridge;

pub use identity::load_or_create_identity;
pub use node::{NodeError, StorageNode};
pub use store::{ChunkCheck, SecureBlockStore, StoreError, StoreOutcome};
pub use ws_bridge::WsBridge;
