//! Shared infraction store on Redis.
//!
//! Each address is a Redis list of unix timestamps under
//! `<prefix>-<address>`. Every append refreshes the key expiry to twice the
//! ban time, so records abandoned by every replica expire on their own.

use super::{InfractionStore, ScanPage};
use crate::address::Address;
use crate::error::{JailError, Result};
use ::redis::aio::ConnectionManager;
use ::redis::RedisResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Multi-instance infraction store.
pub struct RedisStore {
    conn: Mutex<Option<ConnectionManager>>,
    prefix: String,
    expiry_seconds: u64,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis. Fails if the server cannot be reached.
    pub async fn connect(
        url: &str,
        prefix: &str,
        ban_time: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|e| JailError::Configuration(format!("invalid redis url {}: {}", url, e)))?;

        let conn = match tokio::time::timeout(timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(JailError::Configuration(format!(
                    "unable to connect to redis at {}: {}",
                    url, e
                )))
            }
            Err(_) => {
                return Err(JailError::Configuration(format!(
                    "timed out connecting to redis at {}",
                    url
                )))
            }
        };

        info!(url = %url, prefix = %prefix, "Connected to redis");

        Ok(Self {
            conn: Mutex::new(Some(conn)),
            prefix: prefix.to_string(),
            expiry_seconds: record_expiry(ban_time).as_secs(),
            timeout,
        })
    }

    fn connection(&self) -> Result<ConnectionManager> {
        self.conn
            .lock()
            .ok()
            .and_then(|c| c.clone())
            .ok_or_else(|| JailError::Transient("redis store is closed".to_string()))
    }

    fn key(&self, addr: &Address) -> String {
        record_key(&self.prefix, addr)
    }

    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(JailError::from),
            Err(_) => Err(JailError::timeout(what)),
        }
    }
}

/// Record expiry: twice the ban time.
pub fn record_expiry(ban_time: Duration) -> Duration {
    ban_time * 2
}

/// Key of an address record.
pub fn record_key(prefix: &str, addr: &Address) -> String {
    format!("{}-{}", prefix, addr)
}

/// Address of a record key, if the key belongs to this prefix.
pub fn key_address(prefix: &str, key: &str) -> Result<Address> {
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('-'))
        .ok_or_else(|| JailError::validation("record key", key))
        .and_then(Address::parse)
}

/// Parse a stored unix timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| JailError::validation("timestamp", value))
}

#[async_trait]
impl InfractionStore for RedisStore {
    async fn append(&self, addr: &Address, at: DateTime<Utc>) -> Result<usize> {
        let key = self.key(addr);
        let mut conn = self.connection()?;
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(&key)
            .arg(at.timestamp())
            .cmd("EXPIRE")
            .arg(&key)
            .arg(self.expiry_seconds)
            .ignore();

        let (len,): (usize,) = self
            .timed("redis append", async move { pipe.query_async(&mut conn).await })
            .await?;
        Ok(len)
    }

    async fn list(&self, addr: &Address) -> Result<Vec<DateTime<Utc>>> {
        let key = self.key(addr);
        let mut conn = self.connection()?;
        let values: Vec<String> = self
            .timed("redis list", async move {
                ::redis::cmd("LRANGE")
                    .arg(&key)
                    .arg(0)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        values.iter().map(|v| parse_timestamp(v)).collect()
    }

    async fn len(&self, addr: &Address) -> Result<usize> {
        let key = self.key(addr);
        let mut conn = self.connection()?;
        self.timed("redis len", async move {
            ::redis::cmd("LLEN").arg(&key).query_async(&mut conn).await
        })
        .await
    }

    async fn trim(&self, addr: &Address, keep_from: usize) -> Result<()> {
        if keep_from == 0 {
            return Ok(());
        }

        // Redis deletes a list once LTRIM leaves it empty
        let key = self.key(addr);
        let mut conn = self.connection()?;
        let _: () = self
            .timed("redis trim", async move {
                ::redis::cmd("LTRIM")
                    .arg(&key)
                    .arg(keep_from)
                    .arg(-1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(())
    }

    async fn scan(&self, cursor: u64, count: usize) -> Result<ScanPage> {
        let pattern = format!("{}-*", self.prefix);
        let mut conn = self.connection()?;
        let (next, keys): (u64, Vec<String>) = self
            .timed("redis scan", async move {
                ::redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(&pattern)
                    .arg("COUNT")
                    .arg(count)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let addresses = keys
            .iter()
            .filter_map(|key| match key_address(&self.prefix, key) {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unparseable record key");
                    None
                }
            })
            .collect();

        Ok(ScanPage {
            addresses,
            cursor: next,
        })
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let _: String = self
            .timed("redis ping", async move {
                ::redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut conn) = self.conn.lock() {
            if conn.take().is_some() {
                debug!("Redis connection released");
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}
