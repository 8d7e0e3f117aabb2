//! CNAME chain following.
//!
//! Wraps the resolver stack: when an answer ends in (or, in indirect mode,
//! starts with) a CNAME, the alias is resolved through the whole stack again
//! and the answers are merged into the first response.

use crate::{ResolverError, Result};
use async_trait::async_trait;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{Name, RecordType};
use kestrel_core::message::{cname_target, rrset_ranges, truncate_answers_to_first_rrset};
use kestrel_core::{Client, Resolver};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Maximum number of alias hops.
pub const MAX_REDIRECT_COUNT: usize = 16;

/// Follows CNAME chains through the wrapped resolver.
pub struct CNameHandler {
    resolver: Arc<dyn Resolver>,
    check_cname_indirect: AtomicBool,
}

struct CNameContext {
    original_question: Query,
    redirect_count: usize,
    response: Message,
    name_chain: Vec<Name>,
}

impl CNameContext {
    fn add_redirect(&mut self, next: Name) -> Result<()> {
        if self.name_chain.contains(&next) {
            error!(name = %next, "CNAME loop detected");
            return Err(ResolverError::CNameCircleDetected);
        }
        self.name_chain.push(next);
        Ok(())
    }

    fn redirect_query(&mut self) -> Result<Query> {
        self.redirect_count += 1;
        if self.redirect_count > MAX_REDIRECT_COUNT {
            return Err(ResolverError::CNameChainTooLong);
        }

        let name = self
            .name_chain
            .last()
            .cloned()
            .unwrap_or_else(|| self.original_question.name().clone());
        let mut query = Query::query(name, self.original_question.query_type());
        query.set_query_class(self.original_question.query_class());
        Ok(query)
    }

    fn merge(&mut self, mut response: Message) {
        self.response.add_answers(response.take_answers());
        self.response.set_response_code(response.response_code());
    }

    fn assemble(mut self, client: &mut Client) {
        client.set_question(self.original_question.clone());
        self.response.take_queries();
        self.response.add_query(self.original_question);
        self.response.set_id(client.id());
        client.response = Some(self.response);
    }
}

impl CNameHandler {
    pub fn new(resolver: Arc<dyn Resolver>, check_cname_indirect: bool) -> Self {
        Self {
            resolver,
            check_cname_indirect: AtomicBool::new(check_cname_indirect),
        }
    }

    pub fn set_check_cname_indirect(&self, enabled: bool) {
        self.check_cname_indirect.store(enabled, Ordering::Relaxed);
    }

    pub fn check_cname_indirect(&self) -> bool {
        self.check_cname_indirect.load(Ordering::Relaxed)
    }

    /// The alias to follow, if the response is a CNAME redirection.
    fn redirect_target(msg: &Message, indirect: bool) -> Option<Name> {
        let answers = msg.answers();
        let rrset = if indirect {
            rrset_ranges(answers).into_iter().next()?
        } else {
            rrset_ranges(answers).pop()?
        };
        let record = &answers[rrset.start];
        if record.record_type() != RecordType::CNAME {
            return None;
        }
        cname_target(record).cloned()
    }

    /// Resolves the client's question and follows any alias chain.
    ///
    /// Whatever was assembled is left in `client.response` even when the
    /// chain is cut short by an error.
    pub async fn resolve_chain(&self, client: &mut Client) -> Result<()> {
        let indirect = self.check_cname_indirect();
        self.resolver.resolve(client).await;

        let Some(next) = client
            .response
            .as_ref()
            .and_then(|r| Self::redirect_target(r, indirect))
        else {
            return Ok(());
        };
        let Some(mut response) = client.response.take() else {
            return Ok(());
        };
        if indirect {
            truncate_answers_to_first_rrset(&mut response);
        }

        let mut ctx = CNameContext {
            original_question: client.question().clone(),
            redirect_count: 0,
            response,
            name_chain: vec![client.question().name().clone()],
        };
        let result = self.follow(&mut ctx, client, next, indirect).await;
        ctx.assemble(client);
        result
    }

    async fn follow(
        &self,
        ctx: &mut CNameContext,
        client: &mut Client,
        mut next: Name,
        indirect: bool,
    ) -> Result<()> {
        loop {
            ctx.add_redirect(next)?;
            let query = ctx.redirect_query()?;
            debug!(alias = %query.name(), "Following CNAME");

            client.response = None;
            client.set_question(query);
            self.resolver.resolve(client).await;

            let Some(mut response) = client.response.take() else {
                error!(alias = %client.question().name(), "Nothing returned for CNAME target");
                return Ok(());
            };

            let target = Self::redirect_target(&response, indirect);
            if target.is_some() && indirect {
                truncate_answers_to_first_rrset(&mut response);
            }
            ctx.merge(response);

            match target {
                Some(target) => next = target,
                None => return Ok(()),
            }
        }
    }
}

#[async_trait]
impl Resolver for CNameHandler {
    async fn resolve(&self, client: &mut Client) {
        if let Err(e) = self.resolve_chain(client).await {
            error!(question = %client.question().name(), error = %e, "CNAME chain aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::{A, CNAME};
    use hickory_proto::rr::{RData, Record};
    use kestrel_core::message::make_response;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    /// Returns canned responses in order, checking the question name.
    #[derive(Default)]
    struct Scripted {
        responses: Mutex<VecDeque<Message>>,
        calls: Mutex<usize>,
    }

    impl Scripted {
        fn new(responses: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl Resolver for Scripted {
        async fn resolve(&self, client: &mut Client) {
            *self.calls.lock() += 1;
            let Some(response) = self.responses.lock().pop_front() else {
                return;
            };
            assert_eq!(client.question().name(), response.queries()[0].name());
            client.response = Some(response);
        }
    }

    /// Answers every name `aN.cn.` with a CNAME to `aN+1.cn.`.
    struct Endless {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Resolver for Endless {
        async fn resolve(&self, client: &mut Client) {
            *self.calls.lock() += 1;
            let label = client.question().name().to_string();
            let n: usize = label.trim_start_matches('a').trim_end_matches(".cn.").parse().unwrap();
            let mut response = make_response(&client.request);
            response.add_answer(cname(&label, &format!("a{}.cn.", n + 1)));
            client.response = Some(response);
        }
    }

    fn name(s: &str) -> Name {
        Name::from_str(s).unwrap()
    }

    fn cname(source: &str, target: &str) -> Record {
        Record::from_rdata(name(source), 3600, RData::CNAME(CNAME(name(target))))
    }

    fn a(owner: &str, ip: [u8; 4]) -> Record {
        Record::from_rdata(name(owner), 3600, RData::A(A(Ipv4Addr::from(ip))))
    }

    fn response(qname: &str, answers: Vec<Record>) -> Message {
        let mut request = Message::new();
        request.add_query(Query::query(name(qname), RecordType::A));
        let mut response = make_response(&request);
        response.add_answers(answers);
        response
    }

    fn client(qname: &str) -> Client {
        let mut request = Message::new();
        request.set_id(4321);
        request.add_query(Query::query(name(qname), RecordType::A));
        Client::new(request, "127.0.0.1:53000".parse().unwrap(), "v1").unwrap()
    }

    fn rdata(msg: &Message) -> Vec<String> {
        msg.answers()
            .iter()
            .map(|r| r.data().unwrap().to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_non_cname_result() {
        let scripted = Scripted::new(vec![response("a1.cn.", vec![a("a1.cn.", [1, 1, 1, 1])])]);
        let handler = CNameHandler::new(scripted.clone(), false);

        let mut client = client("a1.cn.");
        handler.resolve(&mut client).await;
        assert_eq!(rdata(client.response.as_ref().unwrap()), ["1.1.1.1"]);
        assert_eq!(*scripted.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_cname_chain() {
        let hops = vec![
            response("a1.cn.", vec![cname("a1.cn.", "a2.cn.")]),
            response("a2.cn.", vec![cname("a2.cn.", "a3.cn.")]),
            response("a3.cn.", vec![cname("a3.cn.", "a4.cn.")]),
            response("a4.cn.", vec![cname("a4.cn.", "a5.cn.")]),
            response("a5.cn.", vec![a("a5.cn.", [2, 2, 2, 2])]),
        ];
        let expected: Vec<Record> = hops.iter().map(|m| m.answers()[0].clone()).collect();
        let handler = CNameHandler::new(Scripted::new(hops), false);

        let mut client = client("a1.cn.");
        handler.resolve_chain(&mut client).await.unwrap();

        let response = client.response.as_ref().unwrap();
        assert_eq!(response.answers(), expected.as_slice());
        assert_eq!(response.id(), 4321);
        assert_eq!(response.queries()[0].name(), &name("a1.cn."));
        assert_eq!(client.question().name(), &name("a1.cn."));
        assert_eq!(client.request.queries()[0].name(), &name("a1.cn."));
    }

    #[tokio::test]
    async fn test_cname_indirect() {
        let hops = vec![
            response(
                "a1.cn.",
                vec![
                    cname("a1.cn.", "a2.cn."),
                    cname("a2.cn.", "a3.cn."),
                    a("a3.cn.", [1, 1, 1, 1]),
                ],
            ),
            response("a2.cn.", vec![cname("a2.cn.", "a4.cn."), a("a4.cn.", [2, 2, 2, 2])]),
            response("a4.cn.", vec![a("a4.cn.", [3, 3, 3, 3])]),
        ];
        let handler = CNameHandler::new(Scripted::new(hops), true);

        let mut client = client("a1.cn.");
        handler.resolve_chain(&mut client).await.unwrap();
        assert_eq!(rdata(client.response.as_ref().unwrap()), ["a2.cn.", "a4.cn.", "3.3.3.3"]);
    }

    #[tokio::test]
    async fn test_cname_redirect_uses_last_rrset() {
        let hops = vec![
            response("a1.cn.", vec![cname("a1.cn.", "a2.cn."), cname("a2.cn.", "a3.cn.")]),
            response("a3.cn.", vec![cname("a3.cn.", "a4.cn."), cname("a4.cn.", "a5.cn.")]),
            response("a5.cn.", vec![a("a5.cn.", [5, 5, 5, 5])]),
        ];
        let handler = CNameHandler::new(Scripted::new(hops), false);

        let mut client = client("a1.cn.");
        handler.resolve_chain(&mut client).await.unwrap();
        assert_eq!(
            rdata(client.response.as_ref().unwrap()),
            ["a2.cn.", "a3.cn.", "a4.cn.", "a5.cn.", "5.5.5.5"]
        );
    }

    #[tokio::test]
    async fn test_cname_cycle() {
        let scripted = Scripted::new(vec![
            response("a1.cn.", vec![cname("a1.cn.", "a2.cn.")]),
            response("a2.cn.", vec![cname("a2.cn.", "a1.cn.")]),
            response("a1.cn.", vec![a("a1.cn.", [9, 9, 9, 9])]),
        ]);
        let handler = CNameHandler::new(scripted.clone(), false);

        let mut client = client("a1.cn.");
        let err = handler.resolve_chain(&mut client).await.unwrap_err();
        assert!(matches!(err, ResolverError::CNameCircleDetected));
        assert_eq!(*scripted.calls.lock(), 2);

        let response = client.response.as_ref().unwrap();
        assert_eq!(rdata(response), ["a2.cn.", "a1.cn."]);
        assert_eq!(response.queries()[0].name(), &name("a1.cn."));
    }

    #[tokio::test]
    async fn test_cname_chain_too_long() {
        let endless = Arc::new(Endless { calls: Mutex::new(0) });
        let handler = CNameHandler::new(endless.clone(), false);

        let mut client = client("a0.cn.");
        let err = handler.resolve_chain(&mut client).await.unwrap_err();
        assert!(matches!(err, ResolverError::CNameChainTooLong));
        assert_eq!(*endless.calls.lock(), MAX_REDIRECT_COUNT + 1);
        assert_eq!(client.response.as_ref().unwrap().answers().len(), MAX_REDIRECT_COUNT + 1);
        assert_eq!(client.response.as_ref().unwrap().id(), 4321);
    }

    #[tokio::test]
    async fn test_missing_hop_response_keeps_partial_answer() {
        let handler = CNameHandler::new(
            Scripted::new(vec![response("a1.cn.", vec![cname("a1.cn.", "a2.cn.")])]),
            false,
        );

        let mut client = client("a1.cn.");
        handler.resolve_chain(&mut client).await.unwrap();
        assert_eq!(rdata(client.response.as_ref().unwrap()), ["a2.cn."]);
    }
}
