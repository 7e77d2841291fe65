//! driftsync-transport: RPC between replicas and a remote engine
//!
//! A replica talks to a [`SyncService`](driftsync_core::SyncService); the
//! types here let that service live in another process.

pub mod dispatch;
pub mod local;
pub mod rpc;
pub mod tcp;

pub use dispatch::dispatch;
pub use local::{LoopbackChannel, loopback};
pub use rpc::{Channel, RpcClient};
pub use tcp::{TcpChannel, TcpServer, connect};
