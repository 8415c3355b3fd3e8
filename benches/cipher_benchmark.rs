use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use passkey_vault::crypto;
use passkey_vault::keys;
use serde_json::{json, Map, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap()
}

fn benchmark_cipher(c: &mut Criterion) {
    let rt = runtime();
    let key = keys::generate_unit_key().unwrap();
    let key = &key;
    let mut group = c.benchmark_group("cipher");

    let sizes = [("100B", 100), ("1KB", 1024), ("10KB", 10 * 1024)];
    for (name, size) in sizes {
        let plaintext = "x".repeat(size);
        let payload = rt.block_on(crypto::encrypt(&plaintext, key)).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encrypt", name), &plaintext, |b, text| {
            b.to_async(&rt)
                .iter(|| async move { crypto::encrypt(black_box(text), key).await.unwrap() });
        });
        group.bench_with_input(BenchmarkId::new("decrypt", name), &payload, |b, payload| {
            b.to_async(&rt)
                .iter(|| async move { crypto::decrypt(black_box(payload), key).await.unwrap() });
        });
    }
    group.finish();
}

fn benchmark_derivation(c: &mut Criterion) {
    let rt = runtime();
    let params = keys::generate_parameters().unwrap();
    let params = &params;
    let prf = &[7u8; 32];
    c.bench_function("derive_key", |b| {
        b.to_async(&rt)
            .iter(|| async move { keys::derive_key(black_box(prf), params).await.unwrap() });
    });
}

fn benchmark_fields(c: &mut Criterion) {
    let rt = runtime();
    let key = keys::generate_unit_key().unwrap();
    let mut record = Map::new();
    let names: Vec<String> = (0..16).map(|i| format!("field_{i}")).collect();
    for name in &names {
        record.insert(name.clone(), json!({ "text": "lorem ipsum dolor sit amet" }));
    }
    record.insert("id".into(), Value::from(42));
    let fields: Vec<&str> = names.iter().map(String::as_str).collect();
    let (record, fields, key) = (&record, fields.as_slice(), &key);

    c.bench_function("encrypt_fields/16", |b| {
        b.to_async(&rt).iter(|| async move {
            crypto::encrypt_fields(black_box(record), fields, key)
                .await
                .unwrap()
        });
    });
}

criterion_group!(benches, benchmark_cipher, benchmark_derivation, benchmark_fields);
criterion_main!(benches);
