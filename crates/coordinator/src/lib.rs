//! meshvault coordinator: picks peers for each encrypted chunk, pushes
//! replicas over a request/reply or duplex transport, records every file
//! in a hash-linked consensus ledger, and verifies everything it reads
//! back.

pub mod config;
pub mod directory;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod placement;
pub mod retrieval;
pub mod server;
pub mod transport;

pub use config::{CoordinatorConfig, TransportKind};
pub use directory::{Addressed, Peer, PeerDirectory, PeerRoster, StaticDirectory};
pub use error::{CoreError, TransportError};
pub use ledger::{Block, BlockStatus, Ledger, LedgerError, QuorumPolicy};
pub use orchestrator::{Orchestrator, UploadReport};
pub use placement::PlacementPlanner;
pub use retrieval::{RetrievalVerifier, RetrievedFile};
pub use transport::{HttpTransport, MemoryTransport, PeerHub, ReplicaTransport};
