use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode, Throughput};
use serde_json::{json, Map};

use canopy::identity::AuthContext;
use canopy::realtime::{ClientTransport, Dispatcher, EventKind, ServerMessage, SubscribeRequest, TransportError};
use canopy::rules::{RuleEngine, RuleTree};
use canopy::storage::SharedTree;

/// Accepts and discards every message so the bench measures fan-out only.
struct Sink;

impl ClientTransport for Sink {
    fn send(&self, message: ServerMessage) -> Result<(), TransportError> {
        criterion::black_box(message);
        Ok(())
    }
}

fn setup(clients: usize, rules: &str) -> (Dispatcher, SharedTree) {
    let engine = Arc::new(RuleEngine::new(RuleTree::from_json_str(rules).unwrap_or_else(|e| panic!("rules: {}", e))));
    let tree = SharedTree::new();
    let mut d = Dispatcher::new(engine, Arc::new(tree.clone()));
    for i in 0..clients {
        let id = format!("c{}", i);
        d.connect(id.clone(), Box::new(Sink), AuthContext::for_uid(&format!("u{}", i), Map::new()));
        let req = SubscribeRequest { id: Some("s".into()), path: "/rooms/lobby".into(), events: vec![EventKind::ChildAdded, EventKind::ChildChanged], query: None };
        if let Err(e) = d.subscribe(&id, req) {
            panic!("subscribe: {}", e.message());
        }
    }
    (d, tree)
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_fanout");
    group.sampling_mode(SamplingMode::Flat);
    group.sample_size(20);

    let open = r#"{"rules": {".read": true}}"#;
    let gated = r#"{"rules": {"rooms/$room": {".read": "auth !== null && (data === null || data.private !== true)"}}}"#;
    for &(name, rules) in &[("open", open), ("gated", gated)] {
        for &clients in &[10usize, 1_000usize] {
            let (mut d, tree) = setup(clients, rules);
            group.throughput(Throughput::Elements(clients as u64));
            let mut n = 0u64;
            group.bench_with_input(BenchmarkId::new(name, clients), &clients, |b, _| {
                b.iter(|| {
                    n += 1;
                    let ev = match tree.set(&format!("/rooms/lobby/m{}", n % 64), json!({"n": n}), Map::new()) {
                        Ok(ev) => ev,
                        Err(e) => panic!("set: {}", e),
                    };
                    criterion::black_box(d.on_change(&ev).delivered)
                });
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_fanout);
criterion_main!(benches);
