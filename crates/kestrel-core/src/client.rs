//! The query envelope passed through every pipeline stage.

use hickory_proto::op::{Message, Query};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};

use super::{CoreError, Result};

/// Fingerprint of an in-flight query: lowercased name, type, class and view.
pub type QueryKey = u64;

/// A client query and everything the stages learn while answering it.
#[derive(Debug, Clone)]
pub struct Client {
    /// The request as received (its question tracks [`Client::question`]).
    pub request: Message,

    /// The response built so far, if any stage produced one.
    pub response: Option<Message>,

    /// View the client was mapped to.
    pub view: String,

    /// Source address of the query.
    pub addr: SocketAddr,

    /// Whether the response may be stored by the message cache.
    pub cache_answer: bool,

    /// Set by the cache stage when the response came from cache.
    pub cache_hit: bool,

    question: Query,
}

impl Client {
    /// Builds an envelope for a request. Requests without a question are rejected.
    pub fn new(request: Message, addr: SocketAddr, view: impl Into<String>) -> Result<Self> {
        let question = request
            .queries()
            .first()
            .cloned()
            .ok_or(CoreError::MissingQuestion)?;

        Ok(Self {
            request,
            response: None,
            view: view.into(),
            addr,
            cache_answer: false,
            cache_hit: false,
            question,
        })
    }

    /// The current question.
    pub fn question(&self) -> &Query {
        &self.question
    }

    /// Replaces the question in both the envelope and the request.
    pub fn set_question(&mut self, question: Query) {
        self.request.take_queries();
        self.request.add_query(question.clone());
        self.question = question;
    }

    /// Client IP address.
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Request id.
    pub fn id(&self) -> u16 {
        self.request.id()
    }

    /// Fingerprint used for single-flight and prefetch de-duplication.
    pub fn query_key(&self) -> QueryKey {
        let mut hasher = DefaultHasher::new();
        self.question.name().to_lowercase().hash(&mut hasher);
        u16::from(self.question.query_type()).hash(&mut hasher);
        u16::from(self.question.query_class()).hash(&mut hasher);
        self.view.hash(&mut hasher);
        hasher.finish()
    }
}
