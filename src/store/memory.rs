//! Process-local infraction store.
//!
//! Records live in a mutex-guarded map and never expire on their own; the
//! reconciler's pruning is the only thing that removes them.
//!
//! Each record gets a sequence number when it is created, and the scan
//! cursor is the next sequence number to visit. Deleting a record never
//! moves the ones after it, so a sweep that releases records as it goes
//! still reaches every record that existed when it started.

use super::{InfractionStore, ScanPage, SCAN_START};
use crate::address::Address;
use crate::error::{JailError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

struct Record {
    seq: u64,
    infractions: Vec<DateTime<Utc>>,
}

struct Records {
    by_addr: HashMap<Address, Record>,
    by_seq: BTreeMap<u64, Address>,
    next_seq: u64,
}

impl Default for Records {
    fn default() -> Self {
        Self {
            by_addr: HashMap::new(),
            by_seq: BTreeMap::new(),
            // sequence numbers start after the scan sentinel
            next_seq: SCAN_START + 1,
        }
    }
}

/// Single-instance infraction store.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>> {
        self.records
            .lock()
            .map_err(|_| JailError::Transient("infraction store lock poisoned".to_string()))
    }

    /// Number of tracked addresses.
    pub fn tracked(&self) -> usize {
        self.records.lock().map(|r| r.by_addr.len()).unwrap_or(0)
    }
}

#[async_trait]
impl InfractionStore for MemoryStore {
    async fn append(&self, addr: &Address, at: DateTime<Utc>) -> Result<usize> {
        let mut guard = self.records()?;
        let records = &mut *guard;

        let record = records.by_addr.entry(addr.clone()).or_insert_with(|| {
            let seq = records.next_seq;
            records.next_seq += 1;
            records.by_seq.insert(seq, addr.clone());
            Record {
                seq,
                infractions: Vec::new(),
            }
        });
        record.infractions.push(at);
        Ok(record.infractions.len())
    }

    async fn list(&self, addr: &Address) -> Result<Vec<DateTime<Utc>>> {
        Ok(self
            .records()?
            .by_addr
            .get(addr)
            .map(|r| r.infractions.clone())
            .unwrap_or_default())
    }

    async fn len(&self, addr: &Address) -> Result<usize> {
        Ok(self
            .records()?
            .by_addr
            .get(addr)
            .map_or(0, |r| r.infractions.len()))
    }

    async fn trim(&self, addr: &Address, keep_from: usize) -> Result<()> {
        let mut guard = self.records()?;
        let records = &mut *guard;

        let emptied = match records.by_addr.get_mut(addr) {
            Some(record) => {
                let end = keep_from.min(record.infractions.len());
                record.infractions.drain(..end);
                record.infractions.is_empty().then_some(record.seq)
            }
            None => None,
        };
        if let Some(seq) = emptied {
            records.by_addr.remove(addr);
            records.by_seq.remove(&seq);
        }
        Ok(())
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage> {
        let records = self.records()?;
        let from = cursor.max(SCAN_START + 1);

        let mut addresses = Vec::with_capacity(count.min(records.by_seq.len()));
        let mut last = None;
        for (seq, addr) in records.by_seq.range(from..).take(count) {
            addresses.push(addr.clone());
            last = Some(*seq);
        }

        let cursor = match last {
            Some(seq) if records.by_seq.range(seq + 1..).next().is_some() => seq + 1,
            _ => SCAN_START,
        };

        Ok(ScanPage { addresses, cursor })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn addr(s: &str) -> Address {
        Address::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let store = MemoryStore::new();
        let a = addr("10.0.0.1");

        assert_eq!(store.append(&a, at(0)).await.unwrap(), 1);
        assert_eq!(store.append(&a, at(5)).await.unwrap(), 2);
        assert_eq!(store.list(&a).await.unwrap(), vec![at(0), at(5)]);
        assert_eq!(store.len(&a).await.unwrap(), 2);

        let b = addr("10.0.0.2");
        assert!(store.list(&b).await.unwrap().is_empty());
        assert_eq!(store.len(&b).await.unwrap(), 0);
        assert_eq!(store.tracked(), 1);
    }

    #[tokio::test]
    async fn test_trim_discards_prefix() {
        let store = MemoryStore::new();
        let a = addr("10.0.0.1");
        for s in [0, 5, 10] {
            store.append(&a, at(s)).await.unwrap();
        }

        store.trim(&a, 2).await.unwrap();
        assert_eq!(store.list(&a).await.unwrap(), vec![at(10)]);

        store.trim(&a, 0).await.unwrap();
        assert_eq!(store.len(&a).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trim_to_empty_deletes_record() {
        let store = MemoryStore::new();
        let a = addr("10.0.0.1");
        store.append(&a, at(0)).await.unwrap();

        store.trim(&a, 5).await.unwrap();
        assert_eq!(store.tracked(), 0);

        // trimming an unknown address is a no-op
        store.trim(&addr("10.0.0.9"), 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_pages() {
        let store = MemoryStore::new();
        for s in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            store.append(&addr(s), at(0)).await.unwrap();
        }

        let page = store.scan(SCAN_START, 2).await.unwrap();
        assert_eq!(page.addresses.len(), 2);
        assert_ne!(page.cursor, SCAN_START);

        let page = store.scan(page.cursor, 2).await.unwrap();
        assert_eq!(page.addresses, vec![addr("10.0.0.3")]);
        assert_eq!(page.cursor, SCAN_START);
    }

    #[tokio::test]
    async fn test_scan_survives_deleting_visited_records() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.append(&addr(&format!("10.0.0.{}", i)), at(0)).await.unwrap();
        }

        let first = store.scan(SCAN_START, 2).await.unwrap();
        for a in &first.addresses {
            store.trim(a, 1).await.unwrap();
        }

        let second = store.scan(first.cursor, 2).await.unwrap();
        assert_eq!(second.addresses, vec![addr("10.0.0.2"), addr("10.0.0.3")]);
        let third = store.scan(second.cursor, 2).await.unwrap();
        assert_eq!(third.addresses, vec![addr("10.0.0.4")]);
        assert_eq!(third.cursor, SCAN_START);
    }

    #[tokio::test]
    async fn test_recreated_record_is_scanned_again() {
        let store = MemoryStore::new();
        let a = addr("10.0.0.1");
        store.append(&a, at(0)).await.unwrap();
        store.trim(&a, 1).await.unwrap();
        store.append(&a, at(5)).await.unwrap();

        let page = store.scan(SCAN_START, 10).await.unwrap();
        assert_eq!(page.addresses, vec![a.clone()]);
        assert_eq!(store.list(&a).await.unwrap(), vec![at(5)]);
    }
}
