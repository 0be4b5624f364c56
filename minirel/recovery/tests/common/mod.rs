use std::sync::{Arc, Weak};

use minirel_concurrency::{LockManager, LockType, ensure_sufficient_lock_held};
use minirel_recovery::{
    AriesRecoveryManager, BufferManager, DiskSpaceManager, FlushListener, LogStore,
    MemoryBufferManager, MemoryDiskSpaceManager, MemoryLog, PageNum, RecoveryConfig,
    RecoveryResult, page_num, part_num,
};
use minirel_transaction::{
    Transaction, TransNum, TransNumGenerator, TransactionContext, TransactionStatus,
};
use parking_lot::RwLock;

pub const DATA_PART: u32 = 1;
pub const DATA_PAGES: u64 = 16;

pub fn data_page(index: u64) -> PageNum {
    page_num(DATA_PART, index)
}

/// Transaction whose cleanup releases its locks.
pub struct TestTransaction {
    context: Arc<TransactionContext>,
    status: RwLock<TransactionStatus>,
    locks: Arc<LockManager>,
}

impl TestTransaction {
    pub fn new(trans_num: TransNum, locks: Arc<LockManager>) -> Self {
        Self {
            context: Arc::new(TransactionContext::new(trans_num)),
            status: RwLock::new(TransactionStatus::Running),
            locks,
        }
    }
}

impl Transaction for TestTransaction {
    fn trans_num(&self) -> TransNum {
        self.context.trans_num()
    }

    fn status(&self) -> TransactionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.write() = status;
    }

    fn context(&self) -> &Arc<TransactionContext> {
        &self.context
    }

    fn cleanup(&self) {
        self.locks.release_all(&self.context);
    }
}

/// A database made of a log, a disk, a buffer pool, a lock manager and a recovery
/// manager. The log and the disk survive [`TestDatabase::crash`].
pub struct TestDatabase {
    pub log: Arc<dyn LogStore>,
    pub memory_log: Option<Arc<MemoryLog>>,
    pub disk: Arc<MemoryDiskSpaceManager>,
    pub buffer: Arc<MemoryBufferManager>,
    pub locks: Arc<LockManager>,
    pub trans_counter: Arc<TransNumGenerator>,
    pub recovery: Arc<AriesRecoveryManager>,
    config: RecoveryConfig,
}

impl TestDatabase {
    /// Fresh database over an in-memory log, with [`DATA_PAGES`] pages allocated.
    pub fn new(config: RecoveryConfig) -> Self {
        let memory_log = Arc::new(MemoryLog::new());
        let db = Self::with_log(memory_log.clone(), config);
        Self {
            memory_log: Some(memory_log),
            ..db
        }
    }

    /// Fresh database over `log`.
    pub fn with_log(log: Arc<dyn LogStore>, config: RecoveryConfig) -> Self {
        let disk = Arc::new(MemoryDiskSpaceManager::new());
        disk.alloc_part(DATA_PART).unwrap();
        for index in 0..DATA_PAGES {
            disk.alloc_page(data_page(index)).unwrap();
        }
        let db = Self::open(log, None, disk, config);
        db.recovery.initialize().unwrap();
        db
    }

    fn open(
        log: Arc<dyn LogStore>,
        memory_log: Option<Arc<MemoryLog>>,
        disk: Arc<MemoryDiskSpaceManager>,
        config: RecoveryConfig,
    ) -> Self {
        let buffer = Arc::new(MemoryBufferManager::new(disk.clone()));
        let locks = Arc::new(LockManager::new());
        let trans_counter = Arc::new(TransNumGenerator::new());
        let factory_locks = locks.clone();
        let recovery = Arc::new(AriesRecoveryManager::new(
            locks.database_context(),
            log.clone(),
            disk.clone(),
            buffer.clone(),
            trans_counter.clone(),
            Box::new(move |trans_num| {
                Arc::new(TestTransaction::new(trans_num, factory_locks.clone()))
                    as Arc<dyn Transaction>
            }),
            config.clone(),
        ));
        let listener: Weak<dyn FlushListener> = Arc::downgrade(&recovery) as Weak<dyn FlushListener>;
        buffer.set_flush_listener(listener);
        Self {
            log,
            memory_log,
            disk,
            buffer,
            locks,
            trans_counter,
            recovery,
            config,
        }
    }

    /// Lose the buffer pool, the unflushed log tail and every in-memory table.
    pub fn crash(self) -> Self {
        if let Some(memory_log) = &self.memory_log {
            memory_log.crash();
        }
        Self::open(self.log, self.memory_log, self.disk, self.config)
    }

    /// Reopen over another handle to the same log, as after a process restart.
    pub fn reopen_with_log(self, log: Arc<dyn LogStore>) -> Self {
        Self::open(log, None, self.disk, self.config)
    }

    /// Run the whole restart, undo included.
    pub fn restart(&self) -> RecoveryResult<()> {
        let finish = self.recovery.restart()?;
        finish()
    }

    pub fn begin(&self) -> Arc<TestTransaction> {
        let trans_num = self.trans_counter.next().unwrap();
        let transaction = Arc::new(TestTransaction::new(trans_num, self.locks.clone()));
        self.recovery.start_transaction(transaction.clone());
        transaction
    }

    /// Lock the page, log the change and apply it to the buffer pool.
    pub fn write(&self, transaction: &TestTransaction, page: PageNum, offset: usize, bytes: &[u8]) {
        let context = self
            .locks
            .database_context()
            .child(part_num(page) as u64)
            .child(page);
        ensure_sufficient_lock_held(&context, transaction.context(), LockType::X).unwrap();
        let before = self.buffer.read(page, offset, bytes.len()).unwrap();
        let lsn = self
            .recovery
            .log_page_write(transaction.trans_num(), page, offset as u16, &before, bytes)
            .unwrap();
        self.buffer.write_page(page, offset, bytes, lsn).unwrap();
    }

    pub fn read(&self, page: PageNum, offset: usize, len: usize) -> Vec<u8> {
        self.buffer.read(page, offset, len).unwrap()
    }

    pub fn commit(&self, transaction: &TestTransaction) {
        let trans_num = transaction.trans_num();
        self.recovery.commit(trans_num).unwrap();
        self.recovery.end(trans_num).unwrap();
        transaction.cleanup();
    }

    pub fn abort(&self, transaction: &TestTransaction) {
        let trans_num = transaction.trans_num();
        self.recovery.abort(trans_num).unwrap();
        self.recovery.end(trans_num).unwrap();
        transaction.cleanup();
    }

    pub fn page_lock(&self, trans_num: TransNum, page: PageNum) -> LockType {
        self.locks
            .database_context()
            .child(part_num(page) as u64)
            .child(page)
            .explicit_lock_type(trans_num)
    }
}
