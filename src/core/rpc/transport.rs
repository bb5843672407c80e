// src/core/rpc/transport.rs

//! The Control RPC transport: a length-delimited, bincode-encoded framing
//! over TCP, plus a fan-out helper that dispatches a request to many nodes
//! concurrently and collects whichever replies arrive within a deadline.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bincode::config::Configuration;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::core::errors::{RecoverdError, Result};
use crate::core::model::Pnn;
use crate::core::rpc::wire::ControlMessage;

fn codec_config() -> Configuration {
    bincode::config::standard()
}

pub fn encode(msg: &ControlMessage) -> Result<Bytes> {
    bincode::serde::encode_to_vec(msg, codec_config())
        .map(Bytes::from)
        .map_err(|e| RecoverdError::Protocol(e.to_string()))
}

pub fn decode(buf: &[u8]) -> Result<ControlMessage> {
    bincode::serde::decode_from_slice(buf, codec_config())
        .map(|(msg, _)| msg)
        .map_err(|e| RecoverdError::Protocol(e.to_string()))
}

/// Abstracts "send one request to one node, get one reply back" so that
/// election, dispatch, and recovery code can be tested against an in-memory
/// fake instead of real sockets.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn request(
        &self,
        pnn: Pnn,
        address: SocketAddr,
        msg: ControlMessage,
        timeout_duration: Duration,
    ) -> Result<ControlMessage>;
}

/// A plain, connect-per-request TCP transport. Connections are not pooled:
/// recovery traffic is bursty rather than steady-state, and a fresh
/// connection sidesteps half-open-socket bookkeeping during node flapping.
#[derive(Debug, Default)]
pub struct TcpTransport;

#[async_trait]
impl RpcTransport for TcpTransport {
    async fn request(
        &self,
        pnn: Pnn,
        address: SocketAddr,
        msg: ControlMessage,
        timeout_duration: Duration,
    ) -> Result<ControlMessage> {
        let fut = async {
            let stream = TcpStream::connect(address)
                .await
                .map_err(|e| RecoverdError::RpcFailed { pnn, reason: e.to_string() })?;
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let payload = encode(&msg)?;
            framed
                .send(payload)
                .await
                .map_err(|e| RecoverdError::RpcFailed { pnn, reason: e.to_string() })?;
            let frame = framed
                .next()
                .await
                .ok_or_else(|| RecoverdError::RpcFailed { pnn, reason: "connection closed".into() })?
                .map_err(|e| RecoverdError::RpcFailed { pnn, reason: e.to_string() })?;
            decode(&frame)
        };
        match timeout(timeout_duration, fut).await {
            Ok(result) => result,
            Err(_) => Err(RecoverdError::RpcTimeout { pnn }),
        }
    }
}

/// Sends `msg` to every `(pnn, address)` pair concurrently and returns the
/// replies that arrived before `timeout_duration`, keyed by pnn. Nodes that
/// time out or fail are simply absent from the result map; callers treat
/// absence as "did not respond" per the election and recovery protocols.
pub async fn fan_out(
    transport: &dyn RpcTransport,
    targets: &[(Pnn, SocketAddr)],
    msg: ControlMessage,
    timeout_duration: Duration,
) -> HashMap<Pnn, ControlMessage> {
    let futures = targets.iter().map(|(pnn, addr)| {
        let msg = msg.clone();
        async move {
            let result = transport.request(*pnn, *addr, msg, timeout_duration).await;
            (*pnn, result)
        }
    });
    let results = futures::future::join_all(futures).await;
    let mut replies = HashMap::with_capacity(results.len());
    for (pnn, result) in results {
        match result {
            Ok(reply) => {
                replies.insert(pnn, reply);
            }
            Err(e) => {
                debug!(pnn, error = %e, "fan-out request did not complete");
            }
        }
    }
    replies
}

type HandlerFn = Arc<
    dyn Fn(ControlMessage) -> Pin<Box<dyn Future<Output = ControlMessage> + Send>> + Send + Sync,
>;

/// An in-process transport backed by a shared handler table, for tests that
/// need several simulated nodes talking to each other without real sockets.
#[derive(Clone, Default)]
pub struct FakeTransport {
    handlers: Arc<Mutex<HashMap<Pnn, HandlerFn>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register<F, Fut>(&self, pnn: Pnn, handler: F)
    where
        F: Fn(ControlMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ControlMessage> + Send + 'static,
    {
        let wrapped: HandlerFn = Arc::new(move |msg| Box::pin(handler(msg)));
        self.handlers.lock().await.insert(pnn, wrapped);
    }

    pub async fn unregister(&self, pnn: Pnn) {
        self.handlers.lock().await.remove(&pnn);
    }
}

#[async_trait]
impl RpcTransport for FakeTransport {
    async fn request(
        &self,
        pnn: Pnn,
        _address: SocketAddr,
        msg: ControlMessage,
        timeout_duration: Duration,
    ) -> Result<ControlMessage> {
        let handler = {
            let handlers = self.handlers.lock().await;
            handlers.get(&pnn).cloned()
        };
        let Some(handler) = handler else {
            warn!(pnn, "fake transport: no handler registered");
            return Err(RecoverdError::NoRoute(pnn));
        };
        match timeout(timeout_duration, handler(msg)).await {
            Ok(reply) => Ok(reply),
            Err(_) => Err(RecoverdError::RpcTimeout { pnn }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let msg = ControlMessage::SetNodeFlags { pnn: 3, flags: crate::core::model::NodeFlags::BANNED };
        let bytes = encode(&msg).unwrap();
        let decoded = decode(&bytes).unwrap();
        match decoded {
            ControlMessage::SetNodeFlags { pnn, flags } => {
                assert_eq!(pnn, 3);
                assert_eq!(flags, crate::core::model::NodeFlags::BANNED);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn fake_transport_routes_to_registered_handler() {
        let transport = FakeTransport::new();
        transport
            .register(1, |_msg| async { ControlMessage::Ack })
            .await;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let reply = transport
            .request(1, addr, ControlMessage::GetNodeFlags, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(matches!(reply, ControlMessage::Ack));
    }

    #[tokio::test]
    async fn fake_transport_unregistered_is_no_route() {
        let transport = FakeTransport::new();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let err = transport
            .request(9, addr, ControlMessage::GetNodeFlags, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RecoverdError::NoRoute(9)));
    }

    #[tokio::test]
    async fn fan_out_collects_only_successful_replies() {
        let transport = FakeTransport::new();
        transport.register(1, |_| async { ControlMessage::Ack }).await;
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let targets = vec![(1u32, addr), (2u32, addr)];
        let replies = fan_out(&transport, &targets, ControlMessage::GetNodeFlags, Duration::from_millis(200)).await;
        assert_eq!(replies.len(), 1);
        assert!(replies.contains_key(&1));
    }
}
