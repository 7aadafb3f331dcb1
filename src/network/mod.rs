//! Peer transport: framed bincode messages over TCP.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{
    serve_store_op, PeerClient, RemoteShardStore, RemoteStoreProvider, TransportConfig,
};
pub use rpc::{Message, RemoteError, StoreOp, StoreReply, StoreRequest};
pub use server::{MessageHandler, PeerServer};
