//! # galena-node
//! Full node composition: lifecycle state machine, message dispatch,
//! wire framing, and RocksDB-backed storage.

pub mod config;
pub mod messages;
pub mod node;
pub mod peer;
pub mod storage;

pub use config::{ConfigError, NetworkConfig, NodeConfig};
pub use messages::{FrameError, InvItem, InvKind, Message};
pub use node::{Node, NodeState};
pub use peer::{ChannelConnection, Connection, PeerEvent, PeerManager, StaticPeerManager, TxRebroadcast};
pub use storage::RocksStorage;
