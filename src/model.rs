use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::index::{Row, RowStamp};
use crate::name::Name;

/// The two record tables. Both share the [`TestRecord`] shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Tests,
    TimedTests,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Tests, Table::TimedTests];

    pub const fn name(self) -> Name {
        match self {
            Table::Tests => Name::constant("testtable"),
            Table::TimedTests => Name::constant("timetable"),
        }
    }

    pub fn from_name(name: Name) -> Result<Self> {
        Table::ALL
            .into_iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| LedgerError::InvalidArgument(format!("unknown table {}", name)))
    }
}

/// Secondary orderings of a [`TestRecord`], in storage position order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestIndex {
    CreatedAt,
    Owner,
    TestId,
}

impl TestIndex {
    pub const ALL: [TestIndex; 3] = [TestIndex::CreatedAt, TestIndex::Owner, TestIndex::TestId];

    pub const fn as_str(self) -> &'static str {
        match self {
            TestIndex::CreatedAt => "timestamp",
            TestIndex::Owner => "users",
            TestIndex::TestId => "testid",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        TestIndex::ALL.into_iter().find(|i| i.as_str() == s)
    }

    /// Parses a bound for this index: a name for `users`/`testid`, epoch
    /// seconds for `timestamp`.
    pub fn parse_bound(self, raw: &str) -> Result<u64> {
        match self {
            TestIndex::CreatedAt => raw
                .parse::<u64>()
                .map_err(|_| LedgerError::InvalidArgument(format!("'{}' is not a timestamp", raw))),
            TestIndex::Owner | TestIndex::TestId => Ok(Name::new(raw)?.value()),
        }
    }
}

/// One persisted test execution.
#[derive(Archive, RkyvDeserialize, RkyvSerialize, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[archive(check_bytes)]
pub struct TestRecord {
    pub id: u64,

    /// Who ran the test
    #[serde(rename = "userid")]
    pub owner: Name,

    #[serde(rename = "testid")]
    pub test_id: Name,

    /// Seconds since the epoch, stamped by the store
    pub created_at: u64,

    pub results: Vec<f64>,

    pub description: String,
}

impl TestRecord {
    pub fn new(stamp: RowStamp, owner: Name, test_id: Name, description: String, results: Vec<f64>) -> Self {
        Self {
            id: stamp.id,
            owner,
            test_id,
            created_at: stamp.created_at,
            results,
            description,
        }
    }
}

impl Row for TestRecord {
    const INDEXES: &'static [&'static str] = &[
        TestIndex::CreatedAt.as_str(),
        TestIndex::Owner.as_str(),
        TestIndex::TestId.as_str(),
    ];

    fn primary_key(&self) -> u64 {
        self.id
    }

    fn secondary_keys(&self) -> Vec<u64> {
        vec![self.created_at, self.owner.value(), self.test_id.value()]
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let bytes = rkyv::to_bytes::<_, 256>(self)
            .map_err(|e| LedgerError::Serialization(e.to_string()))?;
        Ok(bytes.into_vec())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let mut aligned = rkyv::AlignedVec::with_capacity(bytes.len());
        aligned.extend_from_slice(bytes);
        let archived = rkyv::check_archived_root::<TestRecord>(&aligned)
            .map_err(|e| LedgerError::Corruption(format!("test record: {:?}", e)))?;
        let record: std::result::Result<TestRecord, _> =
            rkyv::Deserialize::deserialize(archived, &mut rkyv::Infallible);
        Ok(record.unwrap_or_else(|never| match never {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TestRecord {
        TestRecord::new(
            RowStamp { id: 4, created_at: 1_700_000_000 },
            Name::new("alice").unwrap(),
            Name::new("t1").unwrap(),
            "first".to_string(),
            vec![1.0, 2.5],
        )
    }

    #[test]
    fn test_row_encoding_survives_decode() {
        let record = sample();
        let bytes = record.encode().unwrap();
        assert_eq!(TestRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(TestRecord::decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_secondary_keys_follow_index_order() {
        let record = sample();
        let keys = record.secondary_keys();
        assert_eq!(keys.len(), TestRecord::INDEXES.len());
        assert_eq!(keys[0], 1_700_000_000);
        assert_eq!(keys[1], Name::new("alice").unwrap().value());
        assert_eq!(keys[2], Name::new("t1").unwrap().value());
    }

    #[test]
    fn test_table_names() {
        assert_eq!(Table::Tests.name().to_string(), "testtable");
        assert_eq!(Table::from_name(Name::new("timetable").unwrap()).unwrap(), Table::TimedTests);
        assert!(Table::from_name(Name::new("nope").unwrap()).is_err());
    }

    #[test]
    fn test_index_bounds() {
        assert_eq!(TestIndex::CreatedAt.parse_bound("42").unwrap(), 42);
        assert_eq!(TestIndex::Owner.parse_bound("bob").unwrap(), Name::new("bob").unwrap().value());
        assert!(TestIndex::CreatedAt.parse_bound("soon").is_err());
        assert!(TestIndex::TestId.parse_bound("Bad!").is_err());
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["userid"], "alice");
        assert_eq!(json["testid"], "t1");
        assert_eq!(json["results"][1], 2.5);
    }
}
