use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hickory_proto::op::{Message, MessageType, Query};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record, RecordType};
use kestrel_cache::{CacheConfig, MessageCache};
use kestrel_core::Client;
use std::str::FromStr;

fn response(qname: &Name) -> Message {
    let mut msg = Message::new();
    msg.set_message_type(MessageType::Response);
    msg.add_query(Query::query(qname.clone(), RecordType::A));
    for i in 0..4 {
        msg.add_answer(Record::from_rdata(
            qname.clone(),
            300,
            RData::A(A::new(192, 0, 2, i)),
        ));
    }
    msg
}

fn client(qname: &Name) -> Client {
    let mut msg = Message::new();
    msg.add_query(Query::query(qname.clone(), RecordType::A));
    Client::new(msg, "127.0.0.1:5353".parse().unwrap(), "default").unwrap()
}

fn bench_message_cache(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let _guard = rt.enter();

    let mut group = c.benchmark_group("message_cache");
    for size in [1_000usize, 10_000] {
        let cache = MessageCache::new(
            CacheConfig {
                max_cache_size: size,
                ..CacheConfig::default()
            },
            None,
        );
        let names: Vec<Name> = (0..size)
            .map(|i| Name::from_str(&format!("host{i}.example.com.")).unwrap())
            .collect();
        for name in &names {
            cache.add(&mut response(name));
        }
        let clients: Vec<Client> = names.iter().map(client).collect();

        group.bench_with_input(BenchmarkId::new("get_hit", size), &size, |b, _| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % clients.len();
                black_box(cache.get(&clients[i]))
            })
        });

        group.bench_with_input(BenchmarkId::new("add_evict", size), &size, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let name = Name::from_str(&format!("new{i}.example.com.")).unwrap();
                cache.add(black_box(&mut response(&name)));
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_message_cache);
criterion_main!(benches);
