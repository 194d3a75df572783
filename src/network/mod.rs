//! Network communication layer.

pub mod client;
pub mod rpc;
pub mod server;

pub use client::{ClientConfig, RpcClient, TcpConnector};
pub use rpc::{CacheReply, CacheRequest, Message};
pub use server::{MessageHandler, NetworkServer};
