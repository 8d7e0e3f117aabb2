//! Stage traits.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

use super::client::Client;
use super::message::{classify_response, ResponseCategory};

/// A pipeline stage that answers a query, possibly by delegating downstream.
///
/// Handlers communicate only through the [`Client`]: a stage that produced an
/// answer leaves it in `client.response`.
#[async_trait]
pub trait QueryHandler: Send + Sync {
    /// Handles the query held by `client`.
    async fn handle_query(&self, client: &mut Client);
}

/// A resolution strategy (authoritative data, forwarding, recursion, ...).
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolves the current question of `client` into `client.response`.
    async fn resolve(&self, client: &mut Client);
}

/// Runs resolvers in order until one leaves a non-referral response.
///
/// A referral is passed on so later stages (the recursor) can continue from
/// the delegation instead of starting at the root.
#[derive(Clone, Default)]
pub struct ResolverChain {
    stages: Vec<Arc<dyn Resolver>>,
}

impl ResolverChain {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a stage.
    pub fn with(mut self, stage: Arc<dyn Resolver>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the chain has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[async_trait]
impl Resolver for ResolverChain {
    async fn resolve(&self, client: &mut Client) {
        for (i, stage) in self.stages.iter().enumerate() {
            stage.resolve(client).await;
            match client.response.as_ref().map(classify_response) {
                Some(ResponseCategory::Referral) | None => {
                    trace!(stage = i, "stage inconclusive, continuing");
                }
                Some(_) => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::make_response;
    use hickory_proto::op::{Message, Query};
    use hickory_proto::rr::rdata::{A, NS};
    use hickory_proto::rr::{Name, RData, Record, RecordType};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Outcome {
        Nothing,
        Referral,
        Answer,
    }

    struct Stage {
        outcome: Outcome,
        calls: AtomicUsize,
    }

    impl Stage {
        fn new(outcome: Outcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Resolver for Stage {
        async fn resolve(&self, client: &mut Client) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = client.question().name().clone();
            match self.outcome {
                Outcome::Nothing => {}
                Outcome::Referral => {
                    let mut resp = make_response(&client.request);
                    resp.add_name_server(Record::from_rdata(
                        Name::from_str("com.").unwrap(),
                        3600,
                        RData::NS(NS(Name::from_str("a.gtld-servers.net.").unwrap())),
                    ));
                    client.response = Some(resp);
                }
                Outcome::Answer => {
                    let mut resp = make_response(&client.request);
                    resp.add_answer(Record::from_rdata(name, 60, RData::A(A::new(1, 2, 3, 4))));
                    client.response = Some(resp);
                }
            }
        }
    }

    fn client() -> Client {
        let mut msg = Message::new();
        msg.add_query(Query::query(
            Name::from_str("www.example.com.").unwrap(),
            RecordType::A,
        ));
        Client::new(msg, "127.0.0.1:53".parse().unwrap(), "default").unwrap()
    }

    #[tokio::test]
    async fn test_chain_stops_at_answer() {
        let first = Stage::new(Outcome::Nothing);
        let second = Stage::new(Outcome::Answer);
        let third = Stage::new(Outcome::Answer);
        let chain = ResolverChain::new()
            .with(first.clone())
            .with(second.clone())
            .with(third.clone());

        let mut client = client();
        chain.resolve(&mut client).await;

        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
        assert_eq!(client.response.unwrap().answers().len(), 1);
    }

    #[tokio::test]
    async fn test_chain_passes_referral_on() {
        let referral = Stage::new(Outcome::Referral);
        let answer = Stage::new(Outcome::Answer);
        let chain = ResolverChain::new().with(referral.clone()).with(answer.clone());

        let mut client = client();
        chain.resolve(&mut client).await;

        assert_eq!(answer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            classify_response(client.response.as_ref().unwrap()),
            ResponseCategory::Answer
        );
    }
}
