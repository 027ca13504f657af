use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;
use watchpost::error::TaskError;
use watchpost::itemkey::ItemKey;
use watchpost::plugin::Registry;
use watchpost::protocol::{encode, encode_passive_result, AgentValue};
use watchpost::scheduler::{Manager, SchedulerOptions};

/// Benchmark item key parsing
fn bench_item_key_parsing(c: &mut Criterion) {
    c.bench_function("parse_plain_key", |b| {
        b.iter(|| ItemKey::parse(black_box("agent.ping")));
    });

    c.bench_function("parse_quoted_key", |b| {
        b.iter(|| ItemKey::parse(black_box(r#"vfs.fs.size["/var/lib, data",pfree]"#)));
    });
}

/// Benchmark wire framing
fn bench_framing(c: &mut Criterion) {
    let payload = vec![b'x'; 4096];

    c.bench_function("encode_frame_4k", |b| {
        b.iter(|| encode(black_box(&payload)));
    });

    c.bench_function("encode_passive_error", |b| {
        let result: Result<String, TaskError> = Err(TaskError::Timeout(Duration::from_secs(3)));
        b.iter(|| encode_passive_result(black_box(&result)));
    });

    let values: Vec<AgentValue> = (0..100)
        .map(|id| AgentValue {
            id,
            host: "bench-host".to_string(),
            key: format!("net.if.in[eth{}]", id),
            value: "123456".to_string(),
            state: None,
            clock: 1_700_000_000,
            ns: 0,
        })
        .collect();
    c.bench_function("serialize_agent_values_100", |b| {
        b.iter(|| serde_json::to_vec(black_box(&values)));
    });
}

/// Benchmark a full scheduler round trip through a built-in plugin
fn bench_perform_task(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let manager = Manager::new(Registry::builtin().unwrap(), SchedulerOptions::default());
    runtime.block_on(manager.start()).unwrap();

    c.bench_function("perform_agent_ping", |b| {
        b.iter(|| {
            runtime
                .block_on(manager.perform_task(black_box("agent.ping"), Duration::from_secs(3)))
        });
    });

    runtime.block_on(manager.stop());
}

criterion_group!(
    benches,
    bench_item_key_parsing,
    bench_framing,
    bench_perform_task
);
criterion_main!(benches);
