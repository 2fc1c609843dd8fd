use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bankledger::{
    Account, AddAccountBalanceParams, Backend, CreateAccountParams, CreateEntryParams, Entry,
    ListParams, PostgresBackend, SqliteBackend, Store, StoreError, TransferTxParams,
    TransferTxResult, UpdateAccountParams,
};

const POSTGRES_URL_VAR: &str = "BANKLEDGER_TEST_POSTGRES_URL";
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);

static OWNER_SEQ: AtomicU64 = AtomicU64::new(1);

fn sqlite_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("ledger.db");
    let backend = SqliteBackend::new(path.to_str().unwrap()).expect("Failed to open sqlite");
    (dir, Store::new(Arc::new(backend)))
}

fn postgres_backend(lock_timeout: Duration) -> Option<PostgresBackend> {
    match std::env::var(POSTGRES_URL_VAR) {
        Ok(url) => Some(
            PostgresBackend::with_lock_timeout(&url, lock_timeout)
                .expect("Failed to open postgres"),
        ),
        Err(_) => {
            eprintln!("{} not set, skipping postgres test", POSTGRES_URL_VAR);
            None
        }
    }
}

fn postgres_store() -> Option<Store> {
    postgres_backend(LOCK_TIMEOUT).map(|backend| Store::new(Arc::new(backend)))
}

fn create_account(store: &Store, balance: i64) -> Account {
    let owner = format!("owner-{}", OWNER_SEQ.fetch_add(1, Ordering::SeqCst));
    let params = CreateAccountParams {
        owner: owner.clone(),
        balance,
        currency: "USD".to_string(),
    };
    let account = store.queries().unwrap().create_account(&params).unwrap();

    assert!(account.id > 0);
    assert_eq!(account.owner, owner);
    assert_eq!(account.balance, balance);
    assert_eq!(account.currency, "USD");
    account
}

fn create_entry(store: &Store) -> Entry {
    let account = create_account(store, 100);
    let entry = store
        .queries()
        .unwrap()
        .create_entry(&CreateEntryParams {
            account_id: account.id,
            amount: account.balance / 2,
        })
        .unwrap();

    assert!(entry.id > 0);
    assert_eq!(entry.account_id, account.id);
    assert_eq!(entry.amount, 50);
    entry
}

fn create_and_get_account(store: &Store) {
    let created = create_account(store, 250);
    let fetched = store.queries().unwrap().get_account(created.id).unwrap();
    assert_eq!(fetched, created);
}

fn update_account(store: &Store) {
    let created = create_account(store, 250);
    let updated = store
        .queries()
        .unwrap()
        .update_account(&UpdateAccountParams { id: created.id, balance: 777 })
        .unwrap();

    assert_eq!(updated.id, created.id);
    assert_eq!(updated.balance, 777);
    assert_eq!(updated.owner, created.owner);
    assert_eq!(updated.currency, created.currency);
    assert_eq!(updated.created_at, created.created_at);
}

fn delete_account(store: &Store) {
    let created = create_account(store, 10);
    let mut q = store.queries().unwrap();
    q.delete_account(created.id).unwrap();

    let err = q.get_account(created.id).unwrap_err();
    assert!(
        matches!(err, StoreError::NotFound { entity: "account", id } if id == created.id),
        "got {:?}",
        err
    );
}

fn list_accounts_pages(store: &Store) {
    for _ in 0..10 {
        create_account(store, 1);
    }
    let mut q = store.queries().unwrap();

    let first = q.list_accounts(&ListParams::new(5, 0)).unwrap();
    let second = q.list_accounts(&ListParams::new(5, 5)).unwrap();

    assert_eq!(first.len(), 5);
    assert_eq!(second.len(), 5);
    let first_ids: HashSet<i64> = first.iter().map(|a| a.id).collect();
    assert!(second.iter().all(|a| !first_ids.contains(&a.id)));
    assert!(second.windows(2).all(|w| w[0].id < w[1].id));
}

fn create_and_get_entry(store: &Store) {
    let created = create_entry(store);
    let fetched = store.queries().unwrap().get_entry(created.id).unwrap();
    assert_eq!(fetched, created);
}

fn list_entries_pages(store: &Store) {
    for _ in 0..10 {
        create_entry(store);
    }
    let entries = store
        .queries()
        .unwrap()
        .list_entries(&ListParams::new(5, 5))
        .unwrap();
    assert_eq!(entries.len(), 5);
}

fn add_account_balance_roundtrip(store: &Store) {
    let account = create_account(store, 40);
    let mut q = store.queries().unwrap();

    let updated = q
        .add_account_balance(&AddAccountBalanceParams { id: account.id, amount: -65 })
        .unwrap();
    assert_eq!(updated.balance, -25);
    assert_eq!(q.get_account(account.id).unwrap().balance, account.balance - 65);
}

fn check_transfer_result(
    store: &Store,
    res: &TransferTxResult,
    from: &Account,
    to: &Account,
    amount: i64,
) {
    let mut q = store.queries().unwrap();

    assert_eq!(res.transfer.from_account_id, from.id);
    assert_eq!(res.transfer.to_account_id, to.id);
    assert_eq!(res.transfer.amount, amount);
    assert!(res.transfer.id > 0);
    assert_eq!(q.get_transfer(res.transfer.id).unwrap(), res.transfer);

    assert_eq!(res.from_entry.account_id, from.id);
    assert_eq!(res.from_entry.amount, -amount);
    assert_eq!(q.get_entry(res.from_entry.id).unwrap(), res.from_entry);

    assert_eq!(res.to_entry.account_id, to.id);
    assert_eq!(res.to_entry.amount, amount);
    assert_eq!(q.get_entry(res.to_entry.id).unwrap(), res.to_entry);

    assert_eq!(res.from_account.id, from.id);
    assert_eq!(res.to_account.id, to.id);
}

fn transfer_creates_consistent_rows(store: &Store) {
    let from = create_account(store, 100);
    let to = create_account(store, 100);

    let res = store
        .transfer_tx(&TransferTxParams {
            from_account_id: from.id,
            to_account_id: to.id,
            amount: 30,
        })
        .unwrap();

    check_transfer_result(store, &res, &from, &to, 30);
    assert_eq!(res.from_account.balance, 70);
    assert_eq!(res.to_account.balance, 130);
}

fn transfer_towards_lower_id(store: &Store) {
    let low = create_account(store, 100);
    let high = create_account(store, 100);
    assert!(low.id < high.id);

    let res = store
        .transfer_tx(&TransferTxParams {
            from_account_id: high.id,
            to_account_id: low.id,
            amount: 25,
        })
        .unwrap();

    check_transfer_result(store, &res, &high, &low, 25);
    assert_eq!(res.from_account.balance, 75);
    assert_eq!(res.to_account.balance, 125);
}

fn transfer_may_overdraw(store: &Store) {
    let from = create_account(store, 5);
    let to = create_account(store, 0);

    let res = store
        .transfer_tx(&TransferTxParams {
            from_account_id: from.id,
            to_account_id: to.id,
            amount: 20,
        })
        .unwrap();
    assert_eq!(res.from_account.balance, -15);
}

fn failed_transfer_leaves_no_rows(store: &Store) {
    let from = create_account(store, 100);
    let missing = i64::MAX;

    let err = store
        .transfer_tx(&TransferTxParams {
            from_account_id: from.id,
            to_account_id: missing,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::ConstraintViolation(_)), "got {:?}", err);

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(from.id).unwrap().balance, 100);
    assert!(q
        .list_account_entries(from.id, &ListParams::new(10, 0))
        .unwrap()
        .is_empty());
}

fn exec_tx_rolls_back_partial_work(store: &Store) {
    let account = create_account(store, 100);

    let err = store
        .exec_tx(|q| {
            q.create_entry(&CreateEntryParams { account_id: account.id, amount: -40 })?;
            q.add_account_balance(&AddAccountBalanceParams { id: account.id, amount: -40 })?;
            q.get_account(i64::MAX)
        })
        .unwrap_err();
    assert!(err.is_not_found());

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(account.id).unwrap().balance, 100);
    assert_eq!(q.sum_account_entries(account.id).unwrap(), 0);
}

fn exec_tx_commits_work(store: &Store) {
    let account = create_account(store, 0);

    let entry = store
        .exec_tx(|q| {
            let entry = q.create_entry(&CreateEntryParams { account_id: account.id, amount: 15 })?;
            let locked = q.get_account_for_update(account.id)?;
            q.update_account(&UpdateAccountParams {
                id: locked.id,
                balance: locked.balance + entry.amount,
            })?;
            Ok(entry)
        })
        .unwrap();

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_entry(entry.id).unwrap(), entry);
    assert_eq!(q.get_account(account.id).unwrap().balance, 15);
}

fn concurrent_transfers(store: &Store) {
    let from = create_account(store, 1000);
    let to = create_account(store, 1000);
    let n = 5;
    let amount = 10;
    let params = TransferTxParams {
        from_account_id: from.id,
        to_account_id: to.id,
        amount,
    };

    let results: Vec<Result<TransferTxResult, StoreError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n).map(|_| s.spawn(|| store.transfer_tx(&params))).collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let mut seen = HashSet::new();
    for result in results {
        let res = result.unwrap();
        check_transfer_result(store, &res, &from, &to, amount);

        let sent = from.balance - res.from_account.balance;
        let received = res.to_account.balance - to.balance;
        assert_eq!(sent, received);
        assert!(sent > 0);
        assert_eq!(sent % amount, 0);

        let k = sent / amount;
        assert!((1..=n).contains(&k), "k = {}", k);
        assert!(seen.insert(k), "k = {} seen twice", k);
    }

    let mut q = store.queries().unwrap();
    let updated_from = q.get_account(from.id).unwrap();
    let updated_to = q.get_account(to.id).unwrap();
    assert_eq!(updated_from.balance, from.balance - n * amount);
    assert_eq!(updated_to.balance, to.balance + n * amount);

    // balance moved exactly by the sum of the entries
    assert_eq!(updated_from.balance - from.balance, q.sum_account_entries(from.id).unwrap());
    assert_eq!(updated_to.balance - to.balance, q.sum_account_entries(to.id).unwrap());
}

fn concurrent_transfers_both_directions(store: &Store) {
    let a = create_account(store, 1000);
    let b = create_account(store, 1000);
    let n = 10;
    let amount = 10;

    let results: Vec<Result<TransferTxResult, StoreError>> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let (from, to) = if i % 2 == 1 { (b.id, a.id) } else { (a.id, b.id) };
                s.spawn(move || {
                    store.transfer_tx(&TransferTxParams {
                        from_account_id: from,
                        to_account_id: to,
                        amount,
                    })
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for result in results {
        result.unwrap();
    }

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(a.id).unwrap().balance, a.balance);
    assert_eq!(q.get_account(b.id).unwrap().balance, b.balance);
    assert_eq!(q.sum_account_entries(a.id).unwrap(), 0);
    assert_eq!(q.sum_account_entries(b.id).unwrap(), 0);
}

#[test]
fn postgres_transfer_blocked_past_lock_timeout_is_rolled_back() {
    let Some(backend) = postgres_backend(Duration::from_millis(200)) else {
        return;
    };
    let backend = Arc::new(backend);
    let store = Store::new(backend.clone());
    let a = create_account(&store, 100);
    let b = create_account(&store, 100);

    let mut holder = backend.begin().unwrap();
    holder
        .queries()
        .add_account_balance(&AddAccountBalanceParams { id: a.id, amount: 0 })
        .unwrap();

    let err = store
        .transfer_tx(&TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "got {:?}", err);
    holder.rollback().unwrap();

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(a.id).unwrap().balance, 100);
    assert_eq!(q.get_account(b.id).unwrap().balance, 100);
    for id in [a.id, b.id] {
        assert!(q
            .list_account_entries(id, &ListParams::new(10, 0))
            .unwrap()
            .is_empty());
    }
}

#[test]
fn sqlite_transfer_blocked_past_busy_timeout_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let backend =
        SqliteBackend::with_busy_timeout(path.to_str().unwrap(), Duration::from_millis(50))
            .unwrap();
    let backend = Arc::new(backend);
    let store = Store::new(backend.clone());
    let a = create_account(&store, 100);
    let b = create_account(&store, 100);

    let holder = backend.begin().unwrap();
    let err = store
        .transfer_tx(&TransferTxParams {
            from_account_id: a.id,
            to_account_id: b.id,
            amount: 10,
        })
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)), "got {:?}", err);
    holder.rollback().unwrap();

    let mut q = store.queries().unwrap();
    assert_eq!(q.get_account(a.id).unwrap().balance, 100);
    assert!(q.list_transfers(&ListParams::new(10, 0)).unwrap().is_empty());
}

macro_rules! backend_tests {
    ($($name:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[test]
                fn [<sqlite_ $name>]() {
                    let (_dir, store) = sqlite_store();
                    $name(&store);
                }

                #[test]
                fn [<postgres_ $name>]() {
                    if let Some(store) = postgres_store() {
                        $name(&store);
                    }
                }
            )*
        }
    };
}

backend_tests!(
    create_and_get_account,
    update_account,
    delete_account,
    list_accounts_pages,
    create_and_get_entry,
    list_entries_pages,
    add_account_balance_roundtrip,
    transfer_creates_consistent_rows,
    transfer_towards_lower_id,
    transfer_may_overdraw,
    failed_transfer_leaves_no_rows,
    exec_tx_rolls_back_partial_work,
    exec_tx_commits_work,
    concurrent_transfers,
    concurrent_transfers_both_directions,
);
