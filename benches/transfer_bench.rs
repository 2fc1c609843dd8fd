use std::sync::Arc;

use bankledger::{CreateAccountParams, SqliteBackend, Store, TransferTxParams};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn setup(dir: &tempfile::TempDir) -> (Store, i64, i64) {
    let path = dir.path().join("bench.db");
    let backend = SqliteBackend::new(path.to_str().unwrap()).unwrap();
    let store = Store::new(Arc::new(backend));

    let mut q = store.queries().unwrap();
    let mut open = |owner: &str| {
        q.create_account(&CreateAccountParams {
            owner: owner.to_string(),
            balance: 1_000_000,
            currency: "USD".to_string(),
        })
        .unwrap()
        .id
    };
    let a = open("alice");
    let b = open("bob");
    drop(q);
    (store, a, b)
}

fn bench_transfer(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let (store, a, b) = setup(&dir);

    c.bench_function("transfer_tx", |bench| {
        bench.iter(|| {
            store
                .transfer_tx(black_box(&TransferTxParams {
                    from_account_id: a,
                    to_account_id: b,
                    amount: 1,
                }))
                .unwrap()
        })
    });

    c.bench_function("transfer_tx_alternating", |bench| {
        let mut forward = true;
        bench.iter(|| {
            let (from, to) = if forward { (a, b) } else { (b, a) };
            forward = !forward;
            store
                .transfer_tx(black_box(&TransferTxParams {
                    from_account_id: from,
                    to_account_id: to,
                    amount: 1,
                }))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_transfer);
criterion_main!(benches);
