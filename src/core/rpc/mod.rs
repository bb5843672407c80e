// src/core/rpc/mod.rs

//! Control RPC: the request/reply protocol the coordinator uses to talk to
//! its peers (node flags, election votes, map pushes, database pull/push).

pub mod transport;
pub mod wire;

pub use transport::{fan_out, FakeTransport, RpcTransport, TcpTransport};
pub use wire::{ControlMessage, ElectionKey};
