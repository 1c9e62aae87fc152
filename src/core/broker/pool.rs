// src/core/broker/pool.rs

//! A small pool of broker sessions with an RAII checkout guard.

use super::{BrokerSession, Connector};
use crate::core::SyncError;
use crate::core::protocol::RespFrame;
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, trace};

/// Hands out broker sessions, reusing idle ones.
///
/// At most `size` sessions are checked out at a time; callers beyond that wait
/// for a permit. Sessions dedicated to a subscription are detached and no longer
/// count against the limit.
pub struct SessionPool {
    connector: Arc<dyn Connector>,
    idle: Mutex<Vec<Box<dyn BrokerSession>>>,
    permits: Arc<Semaphore>,
    max_idle: usize,
}

impl SessionPool {
    pub fn new(connector: Arc<dyn Connector>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            connector,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
            max_idle: size,
        }
    }

    pub fn connector(&self) -> &Arc<dyn Connector> {
        &self.connector
    }

    /// Checks out a session, opening a new one when none is idle.
    pub async fn get(&self) -> Result<PooledSession<'_>, SyncError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| SyncError::PoolClosed)?;

        let reused = self.idle.lock().pop();
        let session = match reused {
            Some(session) => {
                trace!("Reusing idle broker session.");
                session
            }
            None => {
                debug!("Opening new broker session to {}.", self.connector.describe());
                self.connector.connect().await?
            }
        };

        Ok(PooledSession {
            pool: self,
            session: Some(session),
            permit: Some(permit),
            broken: false,
            in_flight: false,
        })
    }

    /// Closes the pool: pending and future checkouts fail with `PoolClosed` and
    /// all idle sessions are dropped.
    pub fn close(&self) {
        self.permits.close();
        let drained: Vec<_> = std::mem::take(&mut *self.idle.lock());
        debug!("Session pool closed, dropped {} idle session(s).", drained.len());
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    fn release(&self, session: Box<dyn BrokerSession>) {
        if self.is_closed() {
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(session);
        }
    }
}

/// A checked-out session. Returned to the pool on drop unless it was discarded
/// (broken), detached, or dropped with a request still waiting for its reply.
pub struct PooledSession<'a> {
    pool: &'a SessionPool,
    session: Option<Box<dyn BrokerSession>>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
    /// Set while a request is waiting for its reply.
    in_flight: bool,
}

impl PooledSession<'_> {
    /// Marks the session as broken so it is dropped instead of reused.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// Sends a request and waits for its reply.
    ///
    /// A caller cancelled mid-request leaves the reply unread on the session, so
    /// such a session is dropped rather than pooled. Connectivity errors mark it
    /// broken.
    pub async fn call(&mut self, request: RespFrame) -> Result<RespFrame, SyncError> {
        let Some(session) = self.session.as_deref_mut() else {
            return Err(SyncError::Internal("pooled session already taken".into()));
        };
        self.in_flight = true;
        let reply = session.call(request).await;
        self.in_flight = false;
        if matches!(&reply, Err(e) if e.is_connectivity()) {
            self.broken = true;
        }
        reply
    }

    /// Takes the session out of the pool for good, releasing its permit.
    pub fn detach(mut self) -> Box<dyn BrokerSession> {
        self.permit.take();
        self.session
            .take()
            .expect("session is present until the guard is consumed")
    }
}

impl Deref for PooledSession<'_> {
    type Target = dyn BrokerSession;

    fn deref(&self) -> &Self::Target {
        self.session
            .as_deref()
            .expect("session is present until the guard is consumed")
    }
}

impl DerefMut for PooledSession<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session
            .as_deref_mut()
            .expect("session is present until the guard is consumed")
    }
}

impl Drop for PooledSession<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.in_flight {
                debug!("Dropping broker session with a request still in flight.");
            } else if self.broken {
                trace!("Dropping broken broker session.");
            } else {
                self.pool.release(session);
            }
        }
        // The permit is released after the session is back in the idle list.
        self.permit.take();
    }
}
