pub mod actions;
pub mod clock;
pub mod error;
pub mod index;
pub mod manager;
pub mod model;
pub mod name;
pub mod parser;
pub mod query;
pub mod repository;
pub mod server;
pub mod storage;

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::actions::{Action, ActionOutcome, ActionRequest, Contract};
use crate::clock::{Clock, SystemClock};
use crate::error::{LedgerError, Result};
use crate::query::{TableQuery, TableRows};
use crate::repository::RecordRepository;
use crate::storage::{Backend, Compact, CompactionStats, MemoryBackend, SegmentBackend};

/// Thread-safe host for the record contract. Invocations run one at a time.
pub struct Ledger<B> {
    contract: Mutex<Contract<B>>,
}

impl<B> fmt::Debug for Ledger<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("poisoned", &self.contract.is_poisoned())
            .finish()
    }
}

impl<B: Backend> Ledger<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self {
            contract: Mutex::new(Contract::new(RecordRepository::new(backend, clock))),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Contract<B>>> {
        self.contract.lock().map_err(|_| LedgerError::Poisoned)
    }

    /// Decodes and runs one action. Nothing is persisted if it fails.
    pub fn push_action(&self, request: ActionRequest) -> Result<ActionOutcome> {
        let ctx = request.context();
        let action = Action::from_request(request.name, request.data)?;
        let result = self.lock()?.dispatch(&ctx, action);
        if let Err(e) = &result {
            warn!(account = %request.account, action = %request.name, error = %e, "action rejected");
        }
        result
    }

    pub fn get_table_rows(&self, query: &TableQuery) -> Result<TableRows> {
        query::get_table_rows(self.lock()?.repository_mut(), query)
    }

    /// Runs `f` with exclusive access to the repository.
    pub fn with_repository<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RecordRepository<B>) -> Result<R>,
    {
        f(self.lock()?.repository_mut())
    }
}

impl<B: Backend + Compact> Ledger<B> {
    pub fn compact(&self) -> Result<CompactionStats> {
        self.lock()?.repository_mut().backend_mut().compact()
    }
}

impl Ledger<MemoryBackend> {
    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new(), Arc::new(SystemClock))
    }
}

impl Ledger<SegmentBackend> {
    pub fn open(path: &Path, strict: bool) -> Result<Self> {
        Self::open_with_clock(path, strict, Arc::new(SystemClock))
    }

    pub fn open_with_clock(path: &Path, strict: bool, clock: Arc<dyn Clock>) -> Result<Self> {
        Ok(Self::new(SegmentBackend::open(path, strict)?, clock))
    }

    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.lock()?.repository().backend().size_bytes())
    }
}
