use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::index::RowScan;
use crate::model::{Table, TestIndex, TestRecord};
use crate::name::Name;
use crate::repository::RecordRepository;
use crate::storage::Backend;

pub const DEFAULT_LIMIT: usize = 10;

/// Bounded read of one table, by primary key or by a secondary index.
/// Both bounds are inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQuery {
    pub code: Name,
    pub table: Name,
    /// Defaults to `code`
    #[serde(default)]
    pub scope: Option<Name>,
    /// `id` or one of `timestamp`, `users`, `testid`. Defaults to `id`.
    #[serde(default)]
    pub index: Option<String>,
    #[serde(default)]
    pub lower_bound: Option<String>,
    #[serde(default)]
    pub upper_bound: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl TableQuery {
    pub fn new(code: Name, table: Table) -> Self {
        Self {
            code,
            table: table.name(),
            scope: None,
            index: None,
            lower_bound: None,
            upper_bound: None,
            limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRows {
    pub rows: Vec<TestRecord>,
    /// Whether rows past `limit` matched
    pub more: bool,
    /// Position of the first row not returned, usable as the next
    /// `lower_bound`. On a secondary index it is `<key>:<id>`, so a page can
    /// resume inside a run of rows sharing one key.
    pub next_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOrder {
    Primary,
    Secondary(TestIndex),
}

impl KeyOrder {
    fn resolve(table: Name, index: Option<&str>) -> Result<Self> {
        match index {
            None | Some("") | Some("id") | Some("primary") => Ok(KeyOrder::Primary),
            Some(other) => TestIndex::from_str_opt(other)
                .map(KeyOrder::Secondary)
                .ok_or_else(|| LedgerError::UnknownIndex { table, index: other.to_string() }),
        }
    }

    fn parse_bound(self, raw: &str) -> Result<u64> {
        match self {
            KeyOrder::Primary => raw
                .parse::<u64>()
                .map_err(|_| LedgerError::InvalidArgument(format!("'{}' is not a primary key", raw))),
            KeyOrder::Secondary(index) => index.parse_bound(raw),
        }
    }

    /// A lower bound, which on a secondary index may carry the primary key
    /// to resume from.
    fn parse_start(self, raw: &str) -> Result<(u64, u64)> {
        match (self, raw.rsplit_once(':')) {
            (KeyOrder::Secondary(_), Some((key, id))) => {
                let id = id
                    .parse::<u64>()
                    .map_err(|_| LedgerError::InvalidArgument(format!("'{}' is not a primary key", id)))?;
                Ok((self.parse_bound(key)?, id))
            }
            _ => Ok((self.parse_bound(raw)?, 0)),
        }
    }

    fn key_of(self, record: &TestRecord) -> String {
        match self {
            KeyOrder::Primary => record.id.to_string(),
            KeyOrder::Secondary(TestIndex::CreatedAt) => format!("{}:{}", record.created_at, record.id),
            KeyOrder::Secondary(TestIndex::Owner) => format!("{}:{}", record.owner, record.id),
            KeyOrder::Secondary(TestIndex::TestId) => format!("{}:{}", record.test_id, record.id),
        }
    }
}

pub fn get_table_rows<B: Backend>(repo: &mut RecordRepository<B>, query: &TableQuery) -> Result<TableRows> {
    let table = Table::from_name(query.table)?;
    let ordering = KeyOrder::resolve(query.table, query.index.as_deref())?;
    let (lo, lo_id) = match query.lower_bound.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => ordering.parse_start(raw)?,
        None => (0, 0),
    };
    let hi = match query.upper_bound.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => ordering.parse_bound(raw)?,
        None => u64::MAX,
    };
    let limit = match query.limit {
        Some(0) => return Err(LedgerError::InvalidArgument("limit must be at least 1".to_string())),
        Some(limit) => limit,
        None => DEFAULT_LIMIT,
    };

    let store = repo.table(table, query.scope.unwrap_or(query.code));
    let scan = match ordering {
        KeyOrder::Primary => store.scan_primary(lo..=hi)?,
        KeyOrder::Secondary(index) => store.scan_by_secondary_from(index.as_str(), (lo, lo_id), hi)?,
    };
    collect_page(scan, ordering, limit)
}

fn collect_page<B: Backend + ?Sized>(
    mut scan: RowScan<'_, TestRecord, B>,
    ordering: KeyOrder,
    limit: usize,
) -> Result<TableRows> {
    let mut rows = Vec::with_capacity(limit.min(scan.remaining()));
    while rows.len() < limit {
        match scan.next() {
            Some(row) => rows.push(row?),
            None => break,
        }
    }
    let next_key = match scan.next() {
        Some(row) => Some(ordering.key_of(&row?)),
        None => None,
    };
    Ok(TableRows {
        rows,
        more: next_key.is_some(),
        next_key,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryBackend;

    const T0: u64 = 1_700_000_000;

    fn n(s: &str) -> Name {
        Name::new(s).unwrap()
    }

    /// Six rows, ten seconds apart, alternating owners.
    fn seeded() -> RecordRepository<MemoryBackend> {
        let clock = Arc::new(ManualClock::new(T0));
        let mut repo = RecordRepository::new(MemoryBackend::new(), clock.clone());
        for i in 0..6u64 {
            let owner = if i % 2 == 0 { "alice" } else { "bob" };
            repo.tests(n("llmtest"))
                .insert(|stamp| TestRecord::new(stamp, n(owner), n("t1"), format!("run {}", i), vec![i as f64]))
                .unwrap();
            clock.advance(10);
        }
        repo
    }

    fn query() -> TableQuery {
        TableQuery::new(n("llmtest"), Table::Tests)
    }

    fn ids(rows: &TableRows) -> Vec<u64> {
        rows.rows.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_default_query_reads_by_primary_key() {
        let mut repo = seeded();
        let page = get_table_rows(&mut repo, &query()).unwrap();
        assert_eq!(ids(&page), vec![0, 1, 2, 3, 4, 5]);
        assert!(!page.more);
        assert_eq!(page.next_key, None);
    }

    #[test]
    fn test_limit_and_continuation() {
        let mut repo = seeded();
        let mut q = query();
        q.limit = Some(4);
        let page = get_table_rows(&mut repo, &q).unwrap();
        assert_eq!(ids(&page), vec![0, 1, 2, 3]);
        assert!(page.more);
        assert_eq!(page.next_key.as_deref(), Some("4"));

        q.lower_bound = page.next_key;
        let page = get_table_rows(&mut repo, &q).unwrap();
        assert_eq!(ids(&page), vec![4, 5]);
        assert!(!page.more);
    }

    #[test]
    fn test_secondary_index_bounds_are_inclusive() {
        let mut repo = seeded();
        let mut q = query();
        q.index = Some("timestamp".into());
        q.lower_bound = Some((T0 + 10).to_string());
        q.upper_bound = Some((T0 + 30).to_string());
        assert_eq!(ids(&get_table_rows(&mut repo, &q).unwrap()), vec![1, 2, 3]);

        let mut q = query();
        q.index = Some("users".into());
        q.lower_bound = Some("bob".into());
        q.upper_bound = Some("bob".into());
        q.limit = Some(2);
        let page = get_table_rows(&mut repo, &q).unwrap();
        assert_eq!(ids(&page), vec![1, 3]);
        assert_eq!(page.next_key.as_deref(), Some("bob:5"));
    }

    #[test]
    fn test_paging_walks_through_tied_keys() {
        let mut repo = seeded();
        let mut q = query();
        q.index = Some("testid".into());
        q.limit = Some(4);

        let mut seen = Vec::new();
        let mut pages = 0;
        loop {
            let page = get_table_rows(&mut repo, &q).unwrap();
            seen.extend(ids(&page));
            pages += 1;
            assert!(pages <= 2, "paging did not advance");
            match page.next_key {
                Some(next) => q.lower_bound = Some(next),
                None => break,
            }
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(pages, 2);

        q.lower_bound = Some("t1:3".into());
        q.upper_bound = Some("t1".into());
        assert_eq!(ids(&get_table_rows(&mut repo, &q).unwrap()), vec![3, 4, 5]);
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        let mut repo = seeded();
        let mut q = query();
        q.limit = Some(0);
        assert!(matches!(get_table_rows(&mut repo, &q), Err(LedgerError::InvalidArgument(_))));
    }

    #[test]
    fn test_scope_selects_namespace() {
        let mut repo = seeded();
        let mut q = query();
        q.scope = Some(n("other"));
        assert!(get_table_rows(&mut repo, &q).unwrap().rows.is_empty());
    }

    #[test]
    fn test_bad_queries_are_rejected() {
        let mut repo = seeded();
        let mut q = query();
        q.index = Some("colour".into());
        assert!(matches!(get_table_rows(&mut repo, &q), Err(LedgerError::UnknownIndex { .. })));

        let mut q = query();
        q.lower_bound = Some("alice".into());
        assert!(matches!(get_table_rows(&mut repo, &q), Err(LedgerError::InvalidArgument(_))));

        let mut q = query();
        q.lower_bound = Some("3:1".into());
        assert!(matches!(get_table_rows(&mut repo, &q), Err(LedgerError::InvalidArgument(_))));

        let mut q = query();
        q.index = Some("users".into());
        q.lower_bound = Some("alice:x".into());
        assert!(matches!(get_table_rows(&mut repo, &q), Err(LedgerError::InvalidArgument(_))));

        let mut q = query();
        q.table = n("accounts");
        assert!(get_table_rows(&mut repo, &q).is_err());
    }

    #[test]
    fn test_inverted_bounds_return_nothing() {
        let mut repo = seeded();
        let mut q = query();
        q.lower_bound = Some("5".into());
        q.upper_bound = Some("2".into());
        let page = get_table_rows(&mut repo, &q).unwrap();
        assert!(page.rows.is_empty());
        assert!(!page.more);
    }

    #[test]
    fn test_query_json_shape() {
        let q: TableQuery = serde_json::from_str(
            r#"{"code":"llmtest","table":"timetable","index":"testid","lower_bound":"t1","limit":3}"#,
        )
        .unwrap();
        assert_eq!(q.table, Table::TimedTests.name());
        assert_eq!(q.scope, None);
        assert_eq!(q.limit, Some(3));
    }
}
