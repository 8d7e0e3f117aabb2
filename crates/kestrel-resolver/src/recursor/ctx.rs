//! Per-query recursion state and the fixed-size pool it is checked out of.

use crate::nsas::NameServer;
use hickory_proto::op::Query;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use tokio::time::Instant;

/// State of one iterative resolution.
#[derive(Debug, Clone)]
pub struct RecursorCtx {
    /// Local address outbound queries are sent from.
    pub query_source: Option<IpAddr>,
    /// Question being resolved.
    pub question: Query,
    /// Client address announced through EDNS client-subnet.
    pub client_subnet: Option<IpAddr>,
    /// Number of query rounds so far.
    pub depth: u32,
    /// When the resolution started.
    pub start_time: Instant,
    /// Servers used when the NSAS knows no enclosing zone.
    pub root_servers: Vec<NameServer>,
}

impl RecursorCtx {
    fn empty() -> Self {
        Self {
            query_source: None,
            question: Query::new(),
            client_subnet: None,
            depth: 0,
            start_time: Instant::now(),
            root_servers: Vec::new(),
        }
    }

    /// Resets the context for a new resolution.
    pub fn init(
        &mut self,
        query_source: Option<IpAddr>,
        client_subnet: Option<IpAddr>,
        question: Query,
        root_servers: Vec<NameServer>,
    ) {
        self.query_source = query_source;
        self.client_subnet = client_subnet;
        self.question = question;
        self.depth = 0;
        self.start_time = Instant::now();
        self.root_servers = root_servers;
    }
}

/// Bounds the number of resolutions in flight.
#[derive(Debug)]
pub struct CtxPool {
    free: Mutex<Vec<RecursorCtx>>,
    capacity: usize,
}

impl CtxPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new((0..capacity).map(|_| RecursorCtx::empty()).collect()),
            capacity,
        })
    }

    /// Checks a context out, or returns `None` when all are in use.
    pub fn acquire(self: &Arc<Self>) -> Option<CtxGuard> {
        let ctx = self.free.lock().pop()?;
        Some(CtxGuard {
            ctx,
            pool: Arc::clone(self),
        })
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// A checked-out context; returned to the pool on drop.
#[derive(Debug)]
pub struct CtxGuard {
    ctx: RecursorCtx,
    pool: Arc<CtxPool>,
}

impl Deref for CtxGuard {
    type Target = RecursorCtx;

    fn deref(&self) -> &RecursorCtx {
        &self.ctx
    }
}

impl DerefMut for CtxGuard {
    fn deref_mut(&mut self) -> &mut RecursorCtx {
        &mut self.ctx
    }
}

impl Drop for CtxGuard {
    fn drop(&mut self) {
        let ctx = std::mem::replace(&mut self.ctx, RecursorCtx::empty());
        self.pool.free.lock().push(ctx);
    }
}
