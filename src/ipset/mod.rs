//! External banned-address set.
//!
//! The set is owned by a provider (a regional WAF IP set) and guarded by a
//! version token: a write only lands if it carries the token of the version
//! it was computed from. [`AddressSetGateway`] wraps that read-modify-write
//! cycle with bounded retries.
//!
//! Two separate guarantees apply:
//!
//! - Within one process, `add` and `del` on a gateway are serialized by a
//!   local lock, so two local callers never race their own writes.
//! - Across processes, only the provider's token check protects the set.
//!   Concurrent replicas converge through retries; they are not linearizable.

pub mod aws;

#[cfg(test)]
pub(crate) mod testing;

use crate::address::Address;
use crate::error::{JailError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum number of entries the external set holds.
pub const MAX_CAPACITY: usize = 10000;

/// Optimistic-concurrency token of one set version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionToken(pub String);

/// Identity of a provider-hosted set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetId {
    pub name: String,
    pub id: String,
}

/// Raw contents of the external set.
#[derive(Debug, Clone)]
pub struct RawAddressSet {
    /// Entries as the provider stores them: hosts and ranges in CIDR form.
    pub entries: Vec<String>,
    pub token: VersionToken,
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The token was stale; nothing was written.
    Conflict,
}

/// Provider hosting the external set.
#[async_trait]
pub trait AddressSetProvider: Send + Sync {
    /// Resolve a set name to its id.
    async fn find_set(&self, name: &str) -> Result<Option<SetId>>;

    /// Read the set with its current token.
    async fn get_set(&self, set: &SetId) -> Result<RawAddressSet>;

    /// Replace the set contents if `token` is still current.
    async fn update_set(
        &self,
        set: &SetId,
        token: &VersionToken,
        entries: &[String],
    ) -> Result<UpdateOutcome>;

    /// Provider name for logging.
    fn name(&self) -> &str;
}

/// Effective membership of the external set.
#[derive(Debug, Clone)]
pub struct AddressSet {
    /// Host entries.
    pub members: HashSet<Address>,
    /// Range entries, kept verbatim and written back untouched.
    pub passthrough: Vec<String>,
    pub token: VersionToken,
}

impl AddressSet {
    /// Normalize raw provider entries. Ranges go to `passthrough`;
    /// unparseable entries are dropped.
    pub fn from_raw(raw: RawAddressSet) -> Self {
        let mut members = HashSet::with_capacity(raw.entries.len());
        let mut passthrough = Vec::new();

        for entry in raw.entries {
            match Address::from_set_entry(&entry) {
                Ok(Some(addr)) => {
                    members.insert(addr);
                }
                Ok(None) => {
                    warn!(entry = %entry, "Non-host entry in address set, left untouched");
                    passthrough.push(entry);
                }
                Err(e) => {
                    warn!(entry = %entry, error = %e, "Dropping invalid address set entry");
                }
            }
        }

        Self {
            members,
            passthrough,
            token: raw.token,
        }
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.members.contains(addr)
    }

    /// Total entries, hosts and ranges.
    pub fn len(&self) -> usize {
        self.members.len() + self.passthrough.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries to write: the passthrough ranges plus the given hosts, sorted
    /// so repeated writes of the same membership are identical.
    fn entries_with<'a>(&self, hosts: impl Iterator<Item = &'a Address>) -> Vec<String> {
        let mut hosts: Vec<String> = hosts.map(Address::to_set_entry).collect();
        hosts.sort();
        let mut entries = self.passthrough.clone();
        entries.extend(hosts);
        entries
    }
}

/// Retry schedule for conditional writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Attempt `n` waits `n * backoff_step` before the next one.
    pub backoff_step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff_step: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Wait after failed attempt `attempt` (1-based); none after the last.
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.attempts).then(|| self.backoff_step * attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Del,
}

impl Op {
    fn name(self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Del => "delete",
        }
    }
}

/// Gateway to the external banned-address set.
pub struct AddressSetGateway {
    provider: Arc<dyn AddressSetProvider>,
    set: SetId,
    capacity: usize,
    retry: RetryPolicy,
    timeout: Duration,
    write_lock: Mutex<()>,
}

impl AddressSetGateway {
    /// Resolve the named set. An unknown name is a configuration error.
    pub async fn connect(
        provider: Arc<dyn AddressSetProvider>,
        name: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let set = match tokio::time::timeout(timeout, provider.find_set(name)).await {
            Ok(Ok(Some(set))) => set,
            Ok(Ok(None)) => {
                return Err(JailError::Configuration(format!(
                    "no {} address set found",
                    name
                )))
            }
            Ok(Err(e)) => {
                return Err(JailError::Configuration(format!(
                    "unable to list address sets: {}",
                    e
                )))
            }
            Err(_) => {
                return Err(JailError::Configuration(
                    "timed out listing address sets".to_string(),
                ))
            }
        };

        info!(set = %set.name, id = %set.id, provider = provider.name(), "Address set resolved");

        Ok(Self {
            provider,
            set,
            capacity: MAX_CAPACITY,
            retry: RetryPolicy::default(),
            timeout,
            write_lock: Mutex::new(()),
        })
    }

    pub fn name(&self) -> &str {
        &self.set.name
    }

    async fn timed<T>(&self, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or_else(|_| Err(JailError::timeout(what)))
    }

    /// Current membership and version token.
    pub async fn get(&self) -> Result<AddressSet> {
        let raw = self
            .timed("address set read", self.provider.get_set(&self.set))
            .await?;
        Ok(AddressSet::from_raw(raw))
    }

    /// Whether `addr` is currently in the set.
    pub async fn contains(&self, addr: &Address) -> Result<bool> {
        Ok(self.get().await?.contains(addr))
    }

    /// Add `addr`. A no-op if already present.
    pub async fn add(&self, addr: &Address) -> Result<()> {
        self.mutate(Op::Add, addr).await
    }

    /// Remove `addr`. A no-op if absent.
    pub async fn del(&self, addr: &Address) -> Result<()> {
        self.mutate(Op::Del, addr).await
    }

    async fn mutate(&self, op: Op, addr: &Address) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        for attempt in 1..=self.retry.attempts {
            let set = self.get().await?;

            let entries = match op {
                Op::Add => {
                    if set.contains(addr) {
                        debug!(addr = %addr, "Already in address set");
                        return Ok(());
                    }
                    if set.len() >= self.capacity {
                        return Err(JailError::CapacityExceeded {
                            set: self.set.name.clone(),
                            capacity: self.capacity,
                        });
                    }
                    set.entries_with(set.members.iter().chain(std::iter::once(addr)))
                }
                Op::Del => {
                    if !set.contains(addr) {
                        debug!(addr = %addr, "Not in address set");
                        return Ok(());
                    }
                    set.entries_with(set.members.iter().filter(|m| *m != addr))
                }
            };

            let outcome = self
                .timed(
                    "address set update",
                    self.provider.update_set(&self.set, &set.token, &entries),
                )
                .await;

            match outcome {
                Ok(UpdateOutcome::Applied) => {
                    debug!(addr = %addr, op = op.name(), attempt, "Address set updated");
                    return Ok(());
                }
                Ok(UpdateOutcome::Conflict) => {
                    warn!(addr = %addr, op = op.name(), attempt, "Address set version conflict");
                }
                Err(e) if e.is_transient() => {
                    warn!(addr = %addr, op = op.name(), attempt, error = %e, "Address set update failed");
                }
                Err(e) => return Err(e),
            }

            if let Some(wait) = self.retry.backoff(attempt) {
                tokio::time::sleep(wait).await;
            }
        }

        Err(JailError::LockContention {
            op: op.name(),
            addr: addr.to_string(),
            attempts: self.retry.attempts,
        })
    }
}
