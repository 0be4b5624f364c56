mod common;

use std::sync::Arc;

use common::*;
use minirel_concurrency::LockType;
use minirel_recovery::{
    DiskSpaceManager, FileLog, FileLogConfig, LogRecord, LogType, MASTER_LSN,
    RecoveryConfig,
};
use minirel_transaction::{Transaction, TransactionStatus};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serial_test::serial;

fn log_types(db: &TestDatabase) -> Vec<LogType> {
    db.log
        .scan_from(MASTER_LSN)
        .unwrap()
        .map(|entry| entry.unwrap().record.log_type())
        .collect()
}

#[test]
fn test_restart_redoes_then_undoes_uncommitted_write() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(5), 0, b"loser");
    let t2 = db.begin();
    db.write(&t2, data_page(6), 0, b"winner");
    // Committing T2 also makes T1's write durable.
    db.commit(&t2);

    let db = db.crash();
    let finish = db.recovery.restart().unwrap();

    // After redo the loser's change is back in the buffer pool, locked and pending undo.
    assert_eq!(db.read(data_page(5), 0, 5), b"loser");
    assert_eq!(db.recovery.active_transactions(), vec![t1.trans_num()]);
    let recovered = db.recovery.transaction(t1.trans_num()).unwrap();
    assert_eq!(recovered.status(), TransactionStatus::RecoveryAborting);
    assert_eq!(db.page_lock(t1.trans_num(), data_page(5)), LockType::X);

    finish().unwrap();
    assert_eq!(db.read(data_page(5), 0, 5), vec![0; 5]);
    assert_eq!(db.read(data_page(6), 0, 6), b"winner");
    assert!(db.recovery.active_transactions().is_empty());
    assert_eq!(recovered.status(), TransactionStatus::Complete);
    assert_eq!(db.page_lock(t1.trans_num(), data_page(5)), LockType::NL);

    let tail: Vec<LogType> = log_types(&db).into_iter().rev().take(5).collect();
    assert_eq!(tail, vec![
        LogType::EndCheckpoint,
        LogType::BeginCheckpoint,
        LogType::EndTransaction,
        LogType::UndoUpdatePage,
        LogType::AbortTransaction,
    ]);
}

#[test]
fn test_committed_changes_survive_crash() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(1), 100, b"durable");
    db.write(&t1, data_page(2), 0, &[7; 64]);
    db.commit(&t1);

    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(1), 100, 7), b"durable");
    assert_eq!(db.read(data_page(2), 0, 64), vec![7; 64]);
    assert!(db.recovery.active_transactions().is_empty());
}

#[test]
fn test_unflushed_transaction_leaves_no_trace() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(3), 0, b"gone");

    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(3), 0, 4), vec![0; 4]);
    assert!(!log_types(&db).contains(&LogType::UpdatePage));
}

#[test]
fn test_committing_transaction_is_ended_by_analysis() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(4), 0, b"abc");
    db.recovery.commit(t1.trans_num()).unwrap();

    let db = db.crash();
    db.recovery.restart_analysis().unwrap();
    assert!(db.recovery.active_transactions().is_empty());
    assert_eq!(db.page_lock(t1.trans_num(), data_page(4)), LockType::NL);
    assert_eq!(log_types(&db).last(), Some(&LogType::EndTransaction));
    // New transactions are numbered after every transaction seen in the log.
    assert!(db.trans_counter.current() > t1.trans_num().raw());
}

#[test]
fn test_redo_skips_pages_already_on_disk() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(7), 0, b"flushed");
    db.commit(&t1);
    db.buffer.evict_all().unwrap();
    assert!(db.recovery.dirty_page_table().is_empty());

    let db = db.crash();
    db.recovery.restart_analysis().unwrap();
    assert!(db.recovery.dirty_page_table().contains_key(&data_page(7)));
    db.recovery.restart_redo().unwrap();
    assert!(!db.buffer.is_dirty(data_page(7)));
    assert_eq!(db.read(data_page(7), 0, 7), b"flushed");
}

#[test]
fn test_restart_is_idempotent() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(0), 0, b"keep");
    db.commit(&t1);
    let t2 = db.begin();
    db.write(&t2, data_page(0), 4, b"drop");
    db.write(&t2, data_page(1), 0, b"drop");
    db.log.flush_to_lsn(u64::MAX).unwrap();

    // Crash in the middle of restart, before undo runs.
    let db = db.crash();
    let _unfinished = db.recovery.restart().unwrap();
    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(0), 0, 8), b"keep\0\0\0\0");
    assert_eq!(db.read(data_page(1), 0, 4), vec![0; 4]);

    // Crash again after a full restart; nothing is left to do.
    db.log.flush_to_lsn(u64::MAX).unwrap();
    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(0), 0, 8), b"keep\0\0\0\0");
    assert_eq!(db.read(data_page(1), 0, 4), vec![0; 4]);
    let undos = log_types(&db)
        .into_iter()
        .filter(|t| *t == LogType::UndoUpdatePage)
        .count();
    assert_eq!(undos, 2);
}

#[test]
fn test_fuzzy_checkpoint_carries_active_transactions() {
    let db = TestDatabase::new(RecoveryConfig {
        end_checkpoint_capacity: 2,
        ..RecoveryConfig::default()
    });
    let t1 = db.begin();
    db.write(&t1, data_page(8), 0, b"before");
    db.write(&t1, data_page(9), 0, b"before");
    db.recovery.checkpoint().unwrap();
    db.write(&t1, data_page(10), 0, b"after");
    let t2 = db.begin();
    db.write(&t2, data_page(11), 0, b"winner");
    db.commit(&t2);

    let db = db.crash();
    db.restart().unwrap();
    for page in [8, 9] {
        assert_eq!(db.read(data_page(page), 0, 6), vec![0; 6]);
    }
    assert_eq!(db.read(data_page(10), 0, 5), vec![0; 5]);
    assert_eq!(db.read(data_page(11), 0, 6), b"winner");
}

#[test]
fn test_partial_rollback_is_not_undone_twice() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(12), 0, &[1]);
    db.recovery.savepoint(t1.trans_num(), "sp").unwrap();
    db.write(&t1, data_page(12), 1, &[2]);
    db.write(&t1, data_page(12), 2, &[3]);
    db.recovery
        .rollback_to_savepoint(t1.trans_num(), "sp")
        .unwrap();
    assert_eq!(db.read(data_page(12), 0, 3), vec![1, 0, 0]);
    db.log.flush_to_lsn(u64::MAX).unwrap();

    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(12), 0, 3), vec![0, 0, 0]);
    let undos = log_types(&db)
        .into_iter()
        .filter(|t| *t == LogType::UndoUpdatePage)
        .count();
    assert_eq!(undos, 3);
}

#[test]
fn test_aborted_transaction_is_not_undone_again() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(13), 0, b"oops");
    db.abort(&t1);
    assert_eq!(db.read(data_page(13), 0, 4), vec![0; 4]);
    let t2 = db.begin();
    db.write(&t2, data_page(14), 0, b"ok");
    db.commit(&t2);

    let db = db.crash();
    db.restart().unwrap();
    assert_eq!(db.read(data_page(13), 0, 4), vec![0; 4]);
    assert_eq!(db.read(data_page(14), 0, 2), b"ok");
    let undos = log_types(&db)
        .into_iter()
        .filter(|t| *t == LogType::UndoUpdatePage)
        .count();
    assert_eq!(undos, 1);
}

#[test]
fn test_uncommitted_page_allocation_is_undone() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    let page = data_page(DATA_PAGES + 1);
    db.recovery
        .log_alloc_page(t1.trans_num(), page)
        .unwrap()
        .unwrap();
    db.disk.alloc_page(page).unwrap();

    let db = db.crash();
    assert!(db.disk.is_page_allocated(page));
    db.restart().unwrap();
    assert!(!db.disk.is_page_allocated(page));
    assert!(log_types(&db).contains(&LogType::UndoAllocPage));
}

#[test]
fn test_master_points_at_last_checkpoint() {
    let db = TestDatabase::new(RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(15), 0, b"x");
    db.commit(&t1);
    db.recovery.checkpoint().unwrap();

    let LogRecord::Master {
        last_checkpoint_lsn,
    } = db.log.fetch(MASTER_LSN).unwrap().record
    else {
        panic!("missing master record");
    };
    assert_eq!(
        db.log.fetch(last_checkpoint_lsn).unwrap().record.log_type(),
        LogType::BeginCheckpoint
    );
}

#[test]
#[serial]
fn test_restart_from_log_file() {
    let temp_file = temp_file::TempFileBuilder::new()
        .prefix("test_restart_")
        .suffix(".log")
        .build()
        .unwrap();
    let config = FileLogConfig {
        log_path: temp_file.path().to_owned(),
    };
    let log = Arc::new(FileLog::open(config.clone()).unwrap());
    let db = TestDatabase::with_log(log.clone(), RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(2), 0, b"kept");
    db.commit(&t1);
    let t2 = db.begin();
    db.write(&t2, data_page(3), 0, b"lost");
    db.log.flush_to_lsn(u64::MAX).unwrap();
    drop(log);

    let reopened = Arc::new(FileLog::open(config).unwrap());
    let db = db.reopen_with_log(reopened);
    db.restart().unwrap();
    assert_eq!(db.read(data_page(2), 0, 4), b"kept");
    assert_eq!(db.read(data_page(3), 0, 4), vec![0; 4]);
}

#[test]
#[serial]
fn test_restart_after_torn_log_record() {
    let temp_file = temp_file::TempFileBuilder::new()
        .prefix("test_restart_torn_")
        .suffix(".log")
        .build()
        .unwrap();
    let config = FileLogConfig {
        log_path: temp_file.path().to_owned(),
    };
    let log = Arc::new(FileLog::open(config.clone()).unwrap());
    let db = TestDatabase::with_log(log.clone(), RecoveryConfig::default());
    let t1 = db.begin();
    db.write(&t1, data_page(2), 0, b"kept");
    db.commit(&t1);
    let t2 = db.begin();
    db.write(&t2, data_page(3), 0, b"torn");
    db.log.flush_to_lsn(u64::MAX).unwrap();
    let last = db.log.scan_from(MASTER_LSN).unwrap().last().unwrap().unwrap();
    assert_eq!(last.record.trans_num(), Some(t2.trans_num()));
    db.log.close().unwrap();
    drop(log);

    // Crash in the middle of writing T2's update.
    let len = std::fs::metadata(temp_file.path()).unwrap().len();
    std::fs::OpenOptions::new()
        .write(true)
        .open(temp_file.path())
        .unwrap()
        .set_len(len - 3)
        .unwrap();

    let reopened = Arc::new(FileLog::open(config).unwrap());
    assert_eq!(std::fs::metadata(temp_file.path()).unwrap().len(), last.lsn);
    let db = db.reopen_with_log(reopened);
    db.restart().unwrap();
    assert_eq!(db.read(data_page(2), 0, 4), b"kept");
    assert_eq!(db.read(data_page(3), 0, 4), vec![0; 4]);

    // Records written after restart follow the last complete one.
    let types = log_types(&db);
    assert_eq!(
        types.iter().filter(|&&t| t == LogType::UpdatePage).count(),
        1
    );
    assert_eq!(types.last(), Some(&LogType::EndCheckpoint));
}

#[test]
fn test_random_workload_recovers_committed_state() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let db = TestDatabase::new(RecoveryConfig {
        end_checkpoint_capacity: 4,
        ..RecoveryConfig::default()
    });
    let mut expected = vec![0u8; DATA_PAGES as usize];

    for round in 0..40 {
        let transaction = db.begin();
        let page = rng.random_range(0..DATA_PAGES);
        let value = rng.random_range(1..=u8::MAX);
        db.write(&transaction, data_page(page), 0, &[value]);
        if rng.random_bool(0.6) {
            db.commit(&transaction);
            expected[page as usize] = value;
        } else {
            db.abort(&transaction);
        }
        if round % 10 == 9 {
            db.recovery.checkpoint().unwrap();
        }
        if rng.random_bool(0.2) {
            db.buffer.flush_page(data_page(page)).unwrap();
        }
    }
    // A loser holding its lock when the crash hits.
    let loser = db.begin();
    let page = rng.random_range(0..DATA_PAGES);
    db.write(&loser, data_page(page), 0, &[0xff]);
    db.log.flush_to_lsn(u64::MAX).unwrap();

    let db = db.crash();
    db.restart().unwrap();
    for (index, value) in expected.iter().enumerate() {
        assert_eq!(db.read(data_page(index as u64), 0, 1), vec![*value], "page {index}");
    }
}
