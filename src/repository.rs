use std::sync::Arc;

use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::index::{IndexedStore, Row};
use crate::model::{Table, TestRecord};
use crate::name::Name;
use crate::storage::{Backend, Staged};

/// Hands out store views for the record tables of any namespace.
///
/// Stores need no setup: a namespace's table springs into existence with its
/// first insert and every later view of the same `(scope, table)` sees the
/// same rows.
pub struct RecordRepository<B> {
    backend: B,
    clock: Arc<dyn Clock>,
}

impl<B: Backend> RecordRepository<B> {
    pub fn new(backend: B, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    pub fn store<T: Row>(&mut self, table: Name, scope: Name) -> IndexedStore<'_, T, B> {
        IndexedStore::new(&mut self.backend, self.clock.as_ref(), scope, table)
    }

    pub fn table(&mut self, table: Table, scope: Name) -> IndexedStore<'_, TestRecord, B> {
        self.store(table.name(), scope)
    }

    pub fn tests(&mut self, scope: Name) -> IndexedStore<'_, TestRecord, B> {
        self.table(Table::Tests, scope)
    }

    pub fn timed_tests(&mut self, scope: Name) -> IndexedStore<'_, TestRecord, B> {
        self.table(Table::TimedTests, scope)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Runs `f` against a staged view and commits its writes as one batch
    /// only if it returns `Ok`. On error nothing reaches the backend.
    pub fn transact<R, F>(&mut self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RecordRepository<Staged<'_, B>>) -> Result<R>,
    {
        let (result, batch) = {
            let mut staged = RecordRepository {
                backend: Staged::new(&self.backend),
                clock: Arc::clone(&self.clock),
            };
            let result = f(&mut staged)?;
            (result, staged.backend.into_batch())
        };
        if !batch.is_empty() {
            debug!(mutations = batch.len(), "committing invocation");
            self.backend.write(batch)?;
        }
        Ok(result)
    }
}
