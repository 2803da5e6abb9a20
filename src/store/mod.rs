//! Infraction stores.
//!
//! A store keeps, per address, the ordered list of infraction timestamps.
//! Two variants share one contract: [`memory::MemoryStore`] for a single
//! process and [`redis::RedisStore`] for replicas sharing one backend.
//!
//! Each call is atomic for its address. Sequences of calls are not, so
//! callers only ever trim from the front and only ever append at the back.

pub mod memory;
pub mod redis;

use crate::address::Address;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// First page size of a full enumeration.
pub const INITIAL_SCAN_COUNT: usize = 100;

/// Page size cap of a full enumeration.
pub const MAX_SCAN_COUNT: usize = 1000;

/// Cursor value that starts, and ends, an enumeration.
pub const SCAN_START: u64 = 0;

/// One page of tracked addresses.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub addresses: Vec<Address>,
    /// Cursor for the next page; [`SCAN_START`] once the scan wrapped.
    pub cursor: u64,
}

/// Durable per-address infraction log.
#[async_trait]
pub trait InfractionStore: Send + Sync {
    /// Append an infraction, returning the new record length.
    async fn append(&self, addr: &Address, at: DateTime<Utc>) -> Result<usize>;

    /// All infractions of an address, oldest first.
    async fn list(&self, addr: &Address) -> Result<Vec<DateTime<Utc>>>;

    /// Record length.
    async fn len(&self, addr: &Address) -> Result<usize>;

    /// Discard entries before `keep_from`. A record left empty is deleted.
    async fn trim(&self, addr: &Address, keep_from: usize) -> Result<()>;

    /// One page of tracked addresses. Concurrent mutation may cause an
    /// address to be returned more than once, or not at all.
    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    /// Release connections. Later calls fail.
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Store name for logging.
    fn name(&self) -> &str;
}

/// Paginated walk over every tracked address.
///
/// Page size starts at [`INITIAL_SCAN_COUNT`] and doubles up to
/// [`MAX_SCAN_COUNT`]. The walk ends when the cursor returns to
/// [`SCAN_START`] or a page comes back empty.
pub struct AddressScan<'a> {
    store: &'a dyn InfractionStore,
    cursor: u64,
    count: usize,
    pages: usize,
    done: bool,
}

impl<'a> AddressScan<'a> {
    pub fn new(store: &'a dyn InfractionStore) -> Self {
        Self {
            store,
            cursor: SCAN_START,
            count: INITIAL_SCAN_COUNT,
            pages: 0,
            done: false,
        }
    }

    /// Next non-empty page, or `None` once the walk is over.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Address>>> {
        if self.done {
            return Ok(None);
        }

        let page = self.store.scan(self.cursor, self.count).await?;
        self.pages += 1;

        if page.cursor == SCAN_START || page.addresses.is_empty() {
            self.done = true;
        } else {
            self.cursor = page.cursor;
            self.count = (self.count * 2).min(MAX_SCAN_COUNT);
        }

        if page.addresses.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page.addresses))
        }
    }

    /// Start over from the beginning.
    pub fn restart(&mut self) {
        self.cursor = SCAN_START;
        self.count = INITIAL_SCAN_COUNT;
        self.pages = 0;
        self.done = false;
    }

    /// Pages fetched so far.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Page size of the next request.
    pub fn page_size(&self) -> usize {
        self.count
    }
}
