// src/core/broker/tcp.rs

//! RESP over TCP: the production broker backend.

use super::{BrokerSession, Connector};
use crate::core::SyncError;
use crate::core::protocol::{RespFrame, RespFrameCodec};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

/// Opens TCP sessions to a RESP broker, authenticating when a password is set.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    password: Option<String>,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            password: None,
            connect_timeout: None,
        }
    }

    /// An empty password means no authentication.
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password.filter(|p| !p.is_empty());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn open_stream(&self) -> Result<TcpStream, SyncError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| SyncError::Timeout(limit))??,
            None => connect.await?,
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, SyncError> {
        let stream = self.open_stream().await?;
        let mut session = TcpSession {
            framed: Framed::new(stream, RespFrameCodec),
        };

        if let Some(password) = &self.password {
            let reply = session
                .call(RespFrame::command([
                    "AUTH".to_string(),
                    password.clone(),
                ]))
                .await?;
            reply.into_result()?;
            debug!("Authenticated broker session to {}.", self.describe());
        }

        Ok(Box::new(session))
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A single framed TCP connection to the broker.
pub struct TcpSession {
    framed: Framed<TcpStream, RespFrameCodec>,
}

#[async_trait]
impl BrokerSession for TcpSession {
    async fn call(&mut self, request: RespFrame) -> Result<RespFrame, SyncError> {
        self.framed.send(request).await?;
        self.next_push().await
    }

    async fn next_push(&mut self) -> Result<RespFrame, SyncError> {
        match self.framed.next().await {
            Some(frame) => frame,
            None => Err(SyncError::ConnectionClosed),
        }
    }
}
