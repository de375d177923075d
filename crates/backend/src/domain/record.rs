//! Record types delivered by crawl workers.
//!
//! Workers send two kinds of payloads over the record transport: structured
//! table rows ([`Record`]) and raw page content ([`ContentRecord`]). Both flow
//! through the same [`RecordSource`](crate::transport::RecordSource) and are
//! dispatched to different backend handlers.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Field that identifies the browser instance a record came from.
pub const CRAWL_ID_FIELD: &str = "crawl_id";
/// Field that identifies the site visit a record belongs to.
pub const VISIT_ID_FIELD: &str = "visit_id";
/// Conventional table name for page content blobs.
pub const CONTENT_TABLE: &str = "page_content";

/// Identifies one worker / browser instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CrawlId(pub i64);

/// Identifies one browsing session of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VisitId(pub i64);

impl fmt::Display for CrawlId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl fmt::Display for VisitId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<i64> for CrawlId {
  fn from(value: i64) -> Self {
    Self(value)
  }
}

impl From<i64> for VisitId {
  fn from(value: i64) -> Self {
    Self(value)
  }
}

/// Column name → value mapping of a structured record.
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// A structured row destined for `table`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
  pub table: String,
  pub data: Fields,
}

/// Why a record could not be attributed to a visit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissingKey {
  CrawlId,
  VisitId,
}

impl fmt::Display for MissingKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      MissingKey::CrawlId => f.write_str("crawl id"),
      MissingKey::VisitId => f.write_str("visit id"),
    }
  }
}

impl Record {
  pub fn new(table: impl Into<String>, data: Fields) -> Self {
    Self {
      table: table.into(),
      data,
    }
  }

  /// The visit id if present, without requiring a crawl id.
  pub fn visit_id(&self) -> Option<VisitId> {
    int_field(&self.data, VISIT_ID_FIELD).map(VisitId)
  }
}

/// Extract the `(crawl_id, visit_id)` pair from a record's fields.
///
/// Both must be present and integral; anything else makes the record
/// unattributable. The visit id is checked first so a record missing both
/// reports the visit id.
pub fn record_keys(data: &Fields) -> Result<(CrawlId, VisitId), MissingKey> {
  let visit_id = int_field(data, VISIT_ID_FIELD).ok_or(MissingKey::VisitId)?;
  let crawl_id = int_field(data, CRAWL_ID_FIELD).ok_or(MissingKey::CrawlId)?;
  Ok((CrawlId(crawl_id), VisitId(visit_id)))
}

fn int_field(data: &Fields, key: &str) -> Option<i64> {
  data.get(key).and_then(serde_json::Value::as_i64)
}

/// A raw content blob, addressed by its hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentRecord {
  pub table: String,
  #[serde(with = "hex_bytes")]
  pub content: Vec<u8>,
  pub content_hash: String,
}

impl ContentRecord {
  /// Build a content record, hashing `content` with SHA-256.
  pub fn new(table: impl Into<String>, content: Vec<u8>) -> Self {
    let content_hash = content_hash(&content);
    Self {
      table: table.into(),
      content,
      content_hash,
    }
  }
}

/// Lowercase hex SHA-256 of `content`.
pub fn content_hash(content: &[u8]) -> String {
  hex::encode(Sha256::digest(content))
}

/// One frame on the record transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IncomingRecord {
  Record(Record),
  Content(ContentRecord),
}

impl IncomingRecord {
  pub fn table(&self) -> &str {
    match self {
      IncomingRecord::Record(r) => &r.table,
      IncomingRecord::Content(c) => &c.table,
    }
  }
}

impl From<Record> for IncomingRecord {
  fn from(record: Record) -> Self {
    IncomingRecord::Record(record)
  }
}

impl From<ContentRecord> for IncomingRecord {
  fn from(record: ContentRecord) -> Self {
    IncomingRecord::Content(record)
  }
}

mod hex_bytes {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    hex::decode(s).map_err(serde::de::Error::custom)
  }
}
