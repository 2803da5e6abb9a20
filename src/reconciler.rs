//! Background reconciliation of infraction records and the address set.
//!
//! Each sweep walks every tracked address, prunes infractions that no
//! longer matter, lifts bans whose time is up and re-applies bans that are
//! missing from the address set. After a successful sweep the address set
//! matches the records' ban state.
//!
//! Several replicas may sweep the same shared store at once. That is safe
//! because every address set write goes through the version-token retry
//! protocol, not because sweeps are spread out in time.

use crate::address::Address;
use crate::clock::Clock;
use crate::error::Result;
use crate::ipset::{AddressSet, AddressSetGateway};
use crate::policy::JailPolicy;
use crate::store::{AddressScan, InfractionStore};
use rand::Rng;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sweep timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub period: Duration,
    /// Upper bound of a random delay added to every period.
    pub jitter: Duration,
}

impl Schedule {
    pub fn every(period: Duration) -> Self {
        Self {
            period,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next sweep.
    pub fn next_delay(&self) -> Duration {
        self.period + jitter(self.jitter)
    }
}

/// Random duration in `[0, max]`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}

/// Counters for one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evaluated: usize,
    pub pages: usize,
    pub unbanned: usize,
    pub rebanned: usize,
    /// Records deleted because nothing in them was worth keeping.
    pub released: usize,
    pub pruned: usize,
    pub failed: usize,
    pub cancelled: bool,
}

fn plural(n: usize) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}

/// Reconciles infraction records with the external address set.
pub struct Reconciler {
    policy: JailPolicy,
    store: Arc<dyn InfractionStore>,
    gateway: Arc<AddressSetGateway>,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        policy: JailPolicy,
        store: Arc<dyn InfractionStore>,
        gateway: Arc<AddressSetGateway>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            policy,
            store,
            gateway,
            clock,
        }
    }

    /// Give every address already in the set enough infractions to justify
    /// its ban, so sweeps compute a real expiry instead of lifting it at once.
    ///
    /// Records that already justify a ban, expired or not, are left alone.
    pub async fn backfill(&self) -> Result<usize> {
        let set = self.gateway.get().await?;
        let now = self.clock.now();
        let mut appended = 0;

        for addr in &set.members {
            let infractions = match self.store.list(addr).await {
                Ok(infractions) => infractions,
                Err(e) => {
                    error!(addr = %addr, error = %e, "Unable to read infractions for back-fill");
                    continue;
                }
            };
            if self.policy.last_qualifying(&infractions).is_some() {
                continue;
            }

            let missing = self
                .policy
                .max_retry
                .saturating_sub(self.policy.count_in_window(&infractions, now));
            let mut filled = 0;
            for _ in 0..missing {
                if let Err(e) = self.store.append(addr, now).await {
                    error!(addr = %addr, error = %e, "Unable to back-fill infraction");
                    break;
                }
                filled += 1;
            }
            appended += filled;
            debug!(addr = %addr, appended = filled, missing, "Back-filled banned address");
        }

        info!(
            members = set.members.len(),
            synthetic_infractions = appended,
            "Address set contents are being managed"
        );
        Ok(appended)
    }

    /// Run one sweep over every tracked address.
    ///
    /// Fails only if the address set or the store's key scan cannot be read;
    /// a failure on a single address is logged and the sweep moves on.
    pub async fn sweep(&self, cancel: &CancellationToken) -> Result<SweepReport> {
        let set = self.gateway.get().await?;
        let mut report = SweepReport::default();
        let mut seen = HashSet::new();
        let mut scan = AddressScan::new(self.store.as_ref());

        'pages: while let Some(page) = scan.next_page().await? {
            for addr in page {
                if cancel.is_cancelled() {
                    report.cancelled = true;
                    break 'pages;
                }
                if !seen.insert(addr.clone()) {
                    continue;
                }

                report.evaluated += 1;
                if let Err(e) = self.reconcile(&addr, &set, &mut report).await {
                    error!(addr = %addr, error = %e, "Unable to reconcile address");
                    report.failed += 1;
                }
            }
        }
        report.pages = scan.pages();

        self.log_report(&report);
        Ok(report)
    }

    async fn reconcile(&self, addr: &Address, set: &AddressSet, report: &mut SweepReport) -> Result<()> {
        let infractions = self.store.list(addr).await?;
        if infractions.is_empty() {
            return Ok(());
        }

        let now = self.clock.now();
        let verdict = self.policy.evaluate(&infractions, now);
        let banned = verdict.is_banned(now);

        if banned {
            if let Some(until) = verdict.banned_until {
                debug!(addr = %addr, until = %until.format("%Y-%m-%dT%H:%M:%S"), "Banned");
            }
        }

        match (banned, set.contains(addr)) {
            (false, true) => {
                info!(addr = %addr, "Unbanned");
                self.gateway.del(addr).await?;
                report.unbanned += 1;
            }
            (true, false) => {
                warn!(addr = %addr, "Banned address missing from address set, adding");
                self.gateway.add(addr).await?;
                report.rebanned += 1;
            }
            _ => {}
        }

        if verdict.keep_from > 0 {
            self.store.trim(addr, verdict.keep_from).await?;
            report.pruned += verdict.keep_from.min(infractions.len());
            if verdict.is_idle() {
                report.released += 1;
            }
        }

        Ok(())
    }

    fn log_report(&self, report: &SweepReport) {
        debug!(
            "Sweep: {} key{} evaluated in {} scan iteration{}",
            report.evaluated,
            plural(report.evaluated),
            report.pages,
            plural(report.pages)
        );

        if report.unbanned > 0 || report.rebanned > 0 {
            info!(
                unbanned = report.unbanned,
                rebanned = report.rebanned,
                "Sweep: address set updated"
            );
        }
        if report.pruned > 0 {
            info!(
                infractions = report.pruned,
                released = report.released,
                "Sweep: {} infraction{} pruned",
                report.pruned,
                plural(report.pruned)
            );
        }
        if report.failed > 0 {
            warn!(failed = report.failed, "Sweep: some addresses will be retried next period");
        }
    }

    /// Run sweeps on `schedule` until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>, schedule: Schedule) -> ReconcilerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        let task = tokio::spawn(async move {
            loop {
                let delay = schedule.next_delay();
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        if let Err(e) = self.sweep(&token).await {
                            error!(error = %e, "Sweep abandoned, retrying next period");
                        }
                    }
                }
            }
            debug!("Reconciler stopped");
        });

        ReconcilerHandle { cancel, task }
    }
}

/// Owner of a running reconciler task.
pub struct ReconcilerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop the loop and wait for it. A sweep in progress stops at the next
    /// address; an address set write in progress completes first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Reconciler task ended abnormally");
        }
    }
}
