pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::{CallerRecord, ContractRecord, SignatureRecord, TaggedSet, TagBatch, Transaction};
use crate::error::{BotRadarError, Result};
use crate::tags::{Tag, Whitelist, normalize_address};

/// Data access used by the pipeline: read inputs, merge-upsert outputs.
pub trait DataStore {
    /// Transactions with `block_timestamp > since`.
    fn transaction_window(&self, since: DateTime<Utc>) -> Result<Vec<Transaction>>;
    /// Every persisted contract, signature and caller, suspicious or bot.
    fn tagged_entities(&self) -> Result<TaggedSet>;
    fn whitelist(&self) -> Result<Whitelist>;
    /// Merge-upsert all three tables atomically: either every row lands or none does.
    fn merge_batch(&self, batch: &TagBatch) -> Result<usize>;
}

/// Counts of stored rows, for run summaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub transactions: usize,
    pub contracts: usize,
    pub signatures: usize,
    pub callers: usize,
    pub whitelist: usize,
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::open(path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Database>> {
        self.inner.lock().map_err(|_| BotRadarError::LockPoisoned)
    }

    pub fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        self.lock()?.insert_transaction(tx)
    }

    pub fn insert_whitelisted(&self, address: &str, name: Option<&str>) -> Result<()> {
        self.lock()?.insert_whitelisted(address, name)
    }

    /// Bulk-load transactions from a CSV file.
    pub fn load_transactions_from_csv(&self, path: &Path) -> Result<usize> {
        self.lock()?.load_transactions_from_csv(path)
    }

    /// Bulk-load whitelist addresses from a CSV file.
    pub fn load_whitelist_from_csv(&self, path: &Path) -> Result<usize> {
        self.lock()?.load_whitelist_from_csv(path)
    }

    pub fn all_contracts(&self) -> Result<Vec<ContractRecord>> {
        self.lock()?.contracts()
    }

    pub fn all_signatures(&self) -> Result<Vec<SignatureRecord>> {
        self.lock()?.signatures()
    }

    pub fn all_callers(&self) -> Result<Vec<CallerRecord>> {
        self.lock()?.callers()
    }

    pub fn counts(&self) -> Result<TableCounts> {
        self.lock()?.counts()
    }
}

impl DataStore for SharedDatabase {
    fn transaction_window(&self, since: DateTime<Utc>) -> Result<Vec<Transaction>> {
        self.lock()?.transaction_window(since)
    }

    fn tagged_entities(&self) -> Result<TaggedSet> {
        let db = self.lock()?;
        Ok(TaggedSet {
            contracts: db.contracts()?,
            signatures: db.signatures()?,
            callers: db.callers()?,
        })
    }

    fn whitelist(&self) -> Result<Whitelist> {
        self.lock()?.whitelist()
    }

    fn merge_batch(&self, batch: &TagBatch) -> Result<usize> {
        self.lock()?.merge_batch(batch)
    }
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| BotRadarError::InvalidTimestamp(secs.to_string()))
}

/// Unix seconds or RFC 3339.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return from_unix(secs);
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| BotRadarError::InvalidTimestamp(raw.to_string()))
}

fn optional_field(raw: &str) -> Option<String> {
    let value = normalize_address(raw);
    (!value.is_empty()).then_some(value)
}

/// Rows whose tag column doesn't parse are skipped rather than failing the read.
fn parse_tag(raw: &str, table: &str) -> Option<Tag> {
    match raw.parse::<Tag>() {
        Ok(tag) => Some(tag),
        Err(e) => {
            tracing::warn!("Skipping {table} row with unreadable tag: {e}");
            None
        }
    }
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }

    /// Addresses are stored normalized so one contract never splits into two keys.
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<()> {
        self.conn.execute(
            "INSERT INTO transactions (from_address, to_address, input, created_contract_address, block_timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                normalize_address(&tx.from_address),
                tx.to_address.as_deref().map(normalize_address),
                tx.input,
                tx.created_contract_address.as_deref().map(normalize_address),
                tx.block_timestamp.timestamp()
            ],
        )?;
        Ok(())
    }

    pub fn insert_whitelisted(&self, address: &str, name: Option<&str>) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO smart_contracts (address_hash, name) VALUES (?1, ?2)",
            rusqlite::params![normalize_address(address), name],
        )?;
        Ok(())
    }

    /// Columns: from, to, input, created_contract, block_timestamp. Header line skipped.
    pub fn load_transactions_from_csv(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        for (n, line) in content.lines().enumerate().skip(1) {
            let parts: Vec<&str> = line.splitn(5, ',').collect();
            if parts.len() < 5 || parts[0].trim().is_empty() {
                tracing::warn!("Skipping malformed transaction row {}", n + 1);
                continue;
            }
            let block_timestamp = match parse_timestamp(parts[4]) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Skipping transaction row {}: {e}", n + 1);
                    continue;
                }
            };
            self.insert_transaction(&Transaction {
                from_address: normalize_address(parts[0]),
                to_address: optional_field(parts[1]),
                input: parts[2].trim().to_string(),
                created_contract_address: optional_field(parts[3]),
                block_timestamp,
            })?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }

    /// Columns: address_hash[, name]. Header line skipped.
    pub fn load_whitelist_from_csv(&self, path: &Path) -> Result<usize> {
        let content = std::fs::read_to_string(path)?;
        let tx = self.conn.unchecked_transaction()?;
        let mut count = 0;
        for line in content.lines().skip(1) {
            let parts: Vec<&str> = line.splitn(2, ',').collect();
            let address = parts[0].trim();
            if address.is_empty() {
                continue;
            }
            let name = parts.get(1).map(|s| s.trim()).filter(|s| !s.is_empty());
            self.insert_whitelisted(address, name)?;
            count += 1;
        }
        tx.commit()?;
        Ok(count)
    }

    pub fn transaction_window(&self, since: DateTime<Utc>) -> Result<Vec<Transaction>> {
        let mut stmt = self.conn.prepare(
            "SELECT from_address, to_address, input, created_contract_address, block_timestamp
             FROM transactions WHERE block_timestamp > ?1 ORDER BY block_timestamp, id",
        )?;
        let rows = stmt.query_map(rusqlite::params![since.timestamp()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;
        let mut transactions = Vec::new();
        for row in rows {
            let (from_address, to_address, input, created_contract_address, secs) = row?;
            transactions.push(Transaction {
                from_address: normalize_address(&from_address),
                to_address: to_address.as_deref().and_then(optional_field),
                input: input.unwrap_or_default(),
                created_contract_address: created_contract_address.as_deref().and_then(optional_field),
                block_timestamp: from_unix(secs)?,
            });
        }
        Ok(transactions)
    }

    pub fn whitelist(&self) -> Result<Whitelist> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT address_hash FROM smart_contracts")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let addresses = rows.collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(Whitelist::new(addresses))
    }

    fn contracts(&self) -> Result<Vec<ContractRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT to_address, tags, block_timestamp, updated_at FROM contracts ORDER BY to_address",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (to_address, tags, block_timestamp, updated_at) = row?;
            let Some(tag) = parse_tag(&tags, "contracts") else { continue };
            records.push(ContractRecord {
                to_address: normalize_address(&to_address),
                tag,
                block_timestamp: from_unix(block_timestamp)?,
                updated_at: updated_at.map(from_unix).transpose()?,
            });
        }
        Ok(records)
    }

    fn signatures(&self) -> Result<Vec<SignatureRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT to_address, signature, invocations, tags, block_timestamp, updated_at FROM signatures
             ORDER BY to_address, signature",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<i64>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Option<i64>>(5)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (to_address, signature, invocations, tags, block_timestamp, updated_at) = row?;
            let Some(tag) = parse_tag(&tags, "signatures") else { continue };
            records.push(SignatureRecord {
                to_address: normalize_address(&to_address),
                signature: normalize_address(&signature),
                // null or negative counts read as 0
                invocations: invocations.unwrap_or(0).max(0) as u64,
                tag,
                block_timestamp: from_unix(block_timestamp)?,
                updated_at: updated_at.map(from_unix).transpose()?,
            });
        }
        Ok(records)
    }

    fn callers(&self) -> Result<Vec<CallerRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT caller, to_address, tags, block_timestamp, updated_at FROM callers ORDER BY caller, to_address",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<i64>>(4)?,
            ))
        })?;
        let mut records = Vec::new();
        for row in rows {
            let (caller, to_address, tags, block_timestamp, updated_at) = row?;
            let Some(tag) = parse_tag(&tags, "callers") else { continue };
            records.push(CallerRecord {
                caller: normalize_address(&caller),
                to_address: normalize_address(&to_address),
                tag,
                block_timestamp: from_unix(block_timestamp)?,
                updated_at: updated_at.map(from_unix).transpose()?,
            });
        }
        Ok(records)
    }

    /// Update `tags`/`updated_at` on key match, insert the full row otherwise.
    pub fn merge_batch(&self, batch: &TagBatch) -> Result<usize> {
        let tx = self.conn.unchecked_transaction()?;
        let mut merged = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO contracts (to_address, tags, block_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(to_address) DO UPDATE SET tags = excluded.tags, updated_at = excluded.updated_at",
            )?;
            for c in &batch.contracts {
                merged += stmt.execute(rusqlite::params![
                    c.to_address,
                    c.tag.to_string(),
                    c.block_timestamp.timestamp(),
                    c.updated_at.map(|t| t.timestamp())
                ])?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT INTO signatures (to_address, signature, invocations, tags, block_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(to_address, signature) DO UPDATE SET tags = excluded.tags, updated_at = excluded.updated_at",
            )?;
            for s in &batch.signatures {
                merged += stmt.execute(rusqlite::params![
                    s.to_address,
                    s.signature,
                    i64::try_from(s.invocations).unwrap_or(i64::MAX),
                    s.tag.to_string(),
                    s.block_timestamp.timestamp(),
                    s.updated_at.map(|t| t.timestamp())
                ])?;
            }

            let mut stmt = tx.prepare_cached(
                "INSERT INTO callers (caller, to_address, tags, block_timestamp, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(caller, to_address) DO UPDATE SET tags = excluded.tags, updated_at = excluded.updated_at",
            )?;
            for c in &batch.callers {
                merged += stmt.execute(rusqlite::params![
                    c.caller,
                    c.to_address,
                    c.tag.to_string(),
                    c.block_timestamp.timestamp(),
                    c.updated_at.map(|t| t.timestamp())
                ])?;
            }
        }
        tx.commit()?;
        Ok(merged)
    }

    pub fn counts(&self) -> Result<TableCounts> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
            Ok(n as usize)
        };
        Ok(TableCounts {
            transactions: count("transactions")?,
            contracts: count("contracts")?,
            signatures: count("signatures")?,
            callers: count("callers")?,
            whitelist: count("smart_contracts")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicU64, Ordering};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    fn temp_path(prefix: &str) -> std::path::PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("{prefix}_{}_{}", std::process::id(), id))
    }

    fn open_temp_db() -> SharedDatabase {
        let path = temp_path("botradar_test").with_extension("db");
        // Remove if leftover from previous run
        let _ = std::fs::remove_file(&path);
        SharedDatabase::open(&path).unwrap()
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn contract(address: &str, tag: Tag, secs: i64) -> ContractRecord {
        ContractRecord {
            to_address: address.into(),
            tag,
            block_timestamp: ts(secs),
            updated_at: Some(ts(secs + 1)),
        }
    }

    fn signature(address: &str, sig: &str, invocations: u64, tag: Tag) -> SignatureRecord {
        SignatureRecord {
            to_address: address.into(),
            signature: sig.into(),
            invocations,
            tag,
            block_timestamp: ts(10),
            updated_at: Some(ts(11)),
        }
    }

    fn caller(caller: &str, address: &str, tag: Tag) -> CallerRecord {
        CallerRecord {
            caller: caller.into(),
            to_address: address.into(),
            tag,
            block_timestamp: ts(10),
            updated_at: Some(ts(11)),
        }
    }

    #[test]
    fn transaction_window_filters_by_time() {
        let db = open_temp_db();
        for secs in [100, 200, 300] {
            db.insert_transaction(&Transaction {
                from_address: "0xa".into(),
                to_address: Some("0xx".into()),
                input: "0xaaaaaaaa".into(),
                created_contract_address: None,
                block_timestamp: ts(secs),
            })
            .unwrap();
        }
        let window = db.transaction_window(ts(150)).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].block_timestamp, ts(200));
        assert_eq!(window[0].to_address.as_deref(), Some("0xx"));
    }

    #[test]
    fn merge_inserts_then_updates_tags_only() {
        let db = open_temp_db();
        let first = TagBatch {
            contracts: vec![contract("0xx", Tag::suspicious(), 100)],
            signatures: vec![signature("0xx", "0xaaaaaaaa", 10, Tag::suspicious())],
            callers: vec![caller("0xa", "0xx", Tag::suspicious())],
        };
        assert_eq!(db.merge_batch(&first).unwrap(), 3);

        let second = TagBatch {
            contracts: vec![contract("0xx", Tag::bot(0.95), 999)],
            signatures: vec![signature("0xx", "0xaaaaaaaa", 77, Tag::bot(1.0))],
            callers: vec![caller("0xa", "0xx", Tag::bot(0.6))],
        };
        db.merge_batch(&second).unwrap();

        let contracts = db.all_contracts().unwrap();
        assert_eq!(contracts.len(), 1);
        assert_eq!(contracts[0].tag, Tag::bot(0.95));
        // block_timestamp is only written on insert
        assert_eq!(contracts[0].block_timestamp, ts(100));
        assert_eq!(contracts[0].updated_at, Some(ts(1000)));

        let signatures = db.all_signatures().unwrap();
        assert_eq!(signatures.len(), 1);
        assert_eq!(signatures[0].tag, Tag::bot(1.0));
        assert_eq!(signatures[0].invocations, 10);

        let callers = db.all_callers().unwrap();
        assert_eq!(callers[0].tag, Tag::bot(0.6));
    }

    #[test]
    fn tagged_entities_include_bots() {
        let db = open_temp_db();
        db.merge_batch(&TagBatch {
            contracts: vec![
                contract("0xs", Tag::suspicious(), 1),
                contract("0xb", Tag::bot(0.95), 1),
            ],
            signatures: vec![
                signature("0xs", "0x11111111", 5, Tag::suspicious()),
                signature("0xb", "0x11111111", 5, Tag::bot(1.0)),
            ],
            callers: vec![caller("0xa", "0xs", Tag::suspicious()), caller("0xa", "0xb", Tag::bot(1.0))],
        })
        .unwrap();

        let set = db.tagged_entities().unwrap();
        assert_eq!(set.contracts.len(), 2);
        assert_eq!(set.contracts[0].to_address, "0xb");
        assert_eq!(set.contracts[0].tag, Tag::bot(0.95));
        assert_eq!(set.contracts[1].tag, Tag::suspicious());
        assert_eq!(set.signatures.len(), 2);
        assert_eq!(set.callers.len(), 2);
    }

    #[test]
    fn null_invocations_read_as_zero() {
        let db = open_temp_db();
        {
            let inner = db.lock().unwrap();
            inner
                .conn
                .execute(
                    "INSERT INTO signatures (to_address, signature, invocations, tags, block_timestamp)
                     VALUES ('0xx', '0x11111111', NULL, '(''suspicious'', ''1'')', 5)",
                    [],
                )
                .unwrap();
        }
        let set = db.tagged_entities().unwrap();
        assert_eq!(set.signatures.len(), 1);
        assert_eq!(set.signatures[0].invocations, 0);
        assert_eq!(set.signatures[0].updated_at, None);
    }

    #[test]
    fn unreadable_tags_are_skipped() {
        let db = open_temp_db();
        {
            let inner = db.lock().unwrap();
            inner
                .conn
                .execute(
                    "INSERT INTO contracts (to_address, tags, block_timestamp) VALUES ('0xx', 'suspicious?', 5)",
                    [],
                )
                .unwrap();
        }
        assert!(db.tagged_entities().unwrap().contracts.is_empty());
        assert!(db.all_contracts().unwrap().is_empty());
    }

    #[test]
    fn mixed_case_addresses_share_one_key() {
        let db = open_temp_db();
        for (from, to) in [("0xAbC", "0xDEAD"), ("0xabc", "0xdead")] {
            db.insert_transaction(&Transaction {
                from_address: from.into(),
                to_address: Some(to.into()),
                input: "0xaaaaaaaa".into(),
                created_contract_address: None,
                block_timestamp: ts(100),
            })
            .unwrap();
        }
        let window = db.transaction_window(ts(0)).unwrap();
        assert!(window.iter().all(|t| t.from_address == "0xabc"));
        assert!(window.iter().all(|t| t.to_address.as_deref() == Some("0xdead")));

        // rows written by another tool keep their case in the table but read back normalized
        {
            let inner = db.lock().unwrap();
            inner
                .conn
                .execute(
                    "INSERT INTO callers (caller, to_address, tags, block_timestamp) VALUES ('0xAbC', '0xDEAD', '(''suspicious'', ''1'')', 5)",
                    [],
                )
                .unwrap();
        }
        let callers = db.tagged_entities().unwrap().callers;
        assert_eq!((callers[0].caller.as_str(), callers[0].to_address.as_str()), ("0xabc", "0xdead"));
        assert!(db.whitelist().unwrap().is_empty());
    }

    #[test]
    fn whitelist_roundtrip() {
        let db = open_temp_db();
        db.insert_whitelisted("0xLEGIT", Some("Token")).unwrap();
        db.insert_whitelisted("0xlegit", None).unwrap();
        let whitelist = db.whitelist().unwrap();
        assert_eq!(whitelist.len(), 1);
        assert!(whitelist.contains("0xlegit"));
    }

    #[test]
    fn csv_import() {
        let db = open_temp_db();
        let tx_csv = temp_path("botradar_tx").with_extension("csv");
        std::fs::write(
            &tx_csv,
            "from,to,input,created_contract,block_timestamp\n\
             0xA,0xX,0xaaaaaaaa00,,100\n\
             0xD,,0x60806040,0xNEW,2024-01-01T00:00:00Z\n\
             broken row\n\
             0xA,0xX,0xaaaaaaaa,,not-a-time\n",
        )
        .unwrap();
        assert_eq!(db.load_transactions_from_csv(&tx_csv).unwrap(), 2);

        let window = db.transaction_window(ts(0)).unwrap();
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].from_address, "0xa");
        assert_eq!(window[0].to_address.as_deref(), Some("0xx"));
        assert_eq!(window[1].to_address, None);
        assert_eq!(window[1].created_contract_address.as_deref(), Some("0xnew"));

        let wl_csv = temp_path("botradar_wl").with_extension("csv");
        std::fs::write(&wl_csv, "address_hash,name\n0xlegit,Token\n\n0xother\n").unwrap();
        assert_eq!(db.load_whitelist_from_csv(&wl_csv).unwrap(), 2);

        let counts = db.counts().unwrap();
        assert_eq!(counts.transactions, 2);
        assert_eq!(counts.whitelist, 2);
    }

    #[test]
    fn timestamp_formats() {
        assert_eq!(parse_timestamp("100").unwrap(), ts(100));
        assert_eq!(parse_timestamp("1970-01-01T00:01:40Z").unwrap(), ts(100));
        assert!(parse_timestamp("yesterday").is_err());
    }
}
