//! Jail facade.

use crate::address::Address;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StoreBackend};
use crate::error::{JailError, Result};
use crate::ipset::aws::AwsWafProvider;
use crate::ipset::AddressSetGateway;
use crate::policy::JailPolicy;
use crate::reconciler::{jitter, Reconciler, ReconcilerHandle, Schedule};
use crate::store::memory::MemoryStore;
use crate::store::redis::RedisStore;
use crate::store::{AddressScan, InfractionStore};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::fmt::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Timestamp format of the state dump.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Infraction-driven banning.
#[async_trait]
pub trait Jail: Send + Sync {
    /// Record an infraction, banning the address once the policy says so.
    ///
    /// The infraction stays recorded even if the ban then fails.
    async fn add_infraction(&self, addr: &Address) -> Result<()>;

    /// Add the address to the banned set. A no-op if already present.
    async fn ban(&self, addr: &Address) -> Result<()>;

    /// Remove the address from the banned set. A no-op if absent.
    async fn unban(&self, addr: &Address) -> Result<()>;

    /// Stop background work and release the store. Safe to call twice.
    async fn close(&self) -> Result<()>;

    /// Human-readable dump of every record, one line per address.
    async fn write_state(&self, out: &mut (dyn Write + Send)) -> Result<()>;
}

/// [`Jail`] over an infraction store and an external address set.
pub struct Jailer {
    policy: JailPolicy,
    store: Arc<dyn InfractionStore>,
    gateway: Arc<AddressSetGateway>,
    clock: Arc<dyn Clock>,
    reconciler: Arc<Reconciler>,
    handle: Mutex<Option<ReconcilerHandle>>,
    closed: AtomicBool,
}

impl Jailer {
    /// Create a jailer. Nothing runs in the background until [`Jailer::start`].
    pub fn new(
        policy: JailPolicy,
        store: Arc<dyn InfractionStore>,
        gateway: Arc<AddressSetGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let reconciler = Arc::new(Reconciler::new(
            policy,
            store.clone(),
            gateway.clone(),
            clock.clone(),
        ));

        Self {
            policy,
            store,
            gateway,
            clock,
            reconciler,
            handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Build and start a jailer from configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let provider = Arc::new(AwsWafProvider::new(
            config.ip_set.aws_cli.clone(),
            config.ip_set.region.clone(),
        ));
        let gateway = AddressSetGateway::connect(
            provider,
            &config.ip_set.name,
            Duration::from_millis(config.ip_set.timeout_ms),
        )
        .await?;

        let store: Arc<dyn InfractionStore> = match config.store.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::Redis => Arc::new(
                RedisStore::connect(
                    &config.store.redis_url,
                    &config.store.key_prefix,
                    config.jail.ban_time(),
                    Duration::from_millis(config.store.timeout_ms),
                )
                .await?,
            ),
        };
        store
            .ping()
            .await
            .map_err(|e| JailError::Configuration(format!("{} store unreachable: {}", store.name(), e)))?;

        let policy = config.jail.policy();
        info!(
            max_retry = policy.max_retry,
            find_time = config.jail.find_time_seconds,
            ban_time = config.jail.ban_time_seconds,
            store = store.name(),
            set = gateway.name(),
            "Jail initialized"
        );

        let jailer = Self::new(policy, store, Arc::new(gateway), Arc::new(SystemClock));
        let schedule = Schedule::every(Duration::from_secs(config.reconciler.period_seconds))
            .with_jitter(Duration::from_secs(config.reconciler.jitter_seconds));
        jailer
            .start(
                schedule,
                Duration::from_secs(config.reconciler.startup_jitter_seconds),
            )
            .await?;

        Ok(jailer)
    }

    /// Back-fill the current set members, then start the reconciler.
    ///
    /// Waits a random delay of up to `startup_jitter` first. Calling this on
    /// a running or closed jailer does nothing.
    pub async fn start(&self, schedule: Schedule, startup_jitter: Duration) -> Result<()> {
        let mut handle = self.handle.lock().await;
        if handle.is_some() || self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }

        let delay = jitter(startup_jitter);
        if !delay.is_zero() {
            info!(delay_ms = delay.as_millis() as u64, "Delaying startup");
            tokio::time::sleep(delay).await;
        }

        self.reconciler.backfill().await?;
        *handle = Some(self.reconciler.clone().spawn(schedule));

        info!(
            period_seconds = schedule.period.as_secs(),
            jitter_seconds = schedule.jitter.as_secs(),
            "Reconciler started"
        );
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(JailError::Transient("jail is closed".to_string()));
        }
        Ok(())
    }
}

fn state_error(_: std::fmt::Error) -> JailError {
    JailError::Transient("unable to write state".to_string())
}

#[async_trait]
impl Jail for Jailer {
    async fn add_infraction(&self, addr: &Address) -> Result<()> {
        self.ensure_open()?;

        let now = self.clock.now();
        let len = self.store.append(addr, now).await?;
        debug!(addr = %addr, at = %now.format(TIME_FORMAT), infractions = len, "Infraction recorded");

        if len < self.policy.max_retry {
            return Ok(());
        }

        let infractions = self.store.list(addr).await?;
        let count = self.policy.count_in_window(&infractions, now);
        if count < self.policy.max_retry {
            return Ok(());
        }

        if self.gateway.contains(addr).await? {
            debug!(addr = %addr, "Already banned");
            return Ok(());
        }

        info!(addr = %addr, infractions = count, "Banning after {} infractions", count);
        self.ban(addr).await
    }

    async fn ban(&self, addr: &Address) -> Result<()> {
        self.ensure_open()?;
        self.gateway.add(addr).await
    }

    async fn unban(&self, addr: &Address) -> Result<()> {
        self.ensure_open()?;
        self.gateway.del(addr).await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
        self.store.close().await?;

        info!("Jail closed");
        Ok(())
    }

    async fn write_state(&self, out: &mut (dyn Write + Send)) -> Result<()> {
        let mut addresses = BTreeSet::new();
        let mut scan = AddressScan::new(self.store.as_ref());
        while let Some(page) = scan.next_page().await? {
            addresses.extend(page);
        }

        let now = self.clock.now();
        for addr in addresses {
            let infractions = match self.store.list(&addr).await {
                Ok(infractions) => infractions,
                Err(e) => {
                    writeln!(out, "{}: <{}>", addr, e).map_err(state_error)?;
                    continue;
                }
            };
            if infractions.is_empty() {
                continue;
            }

            write!(out, "{}:", addr).map_err(state_error)?;
            for at in &infractions {
                write!(out, " {}", at.format(TIME_FORMAT)).map_err(state_error)?;
            }

            let verdict = self.policy.evaluate(&infractions, now);
            let line_end = match verdict.banned_until {
                Some(until) if verdict.is_banned(now) => {
                    writeln!(out, " (banned until {})", until.format(TIME_FORMAT))
                }
                _ => writeln!(out),
            };
            line_end.map_err(state_error)?;
        }

        Ok(())
    }
}
