//! In-memory address set provider for tests.

use super::{AddressSetProvider, RawAddressSet, SetId, UpdateOutcome, VersionToken};
use crate::error::{JailError, Result};
use async_trait::async_trait;
use std::sync::Mutex;

pub(crate) const SET_NAME: &str = "fail2ban";
const SET_ID: &str = "a1b2c3d4-fail2ban";

#[derive(Default)]
struct State {
    entries: Vec<String>,
    version: u64,
    conflicts: usize,
    failures: usize,
    rejections: usize,
    unreachable: bool,
    gets: usize,
    writes: usize,
}

/// Versioned set with scriptable conflicts and failures.
#[derive(Default)]
pub(crate) struct FakeAddressSet {
    state: Mutex<State>,
}

impl FakeAddressSet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_entries(entries: &[&str]) -> Self {
        Self::with_owned_entries(entries.iter().map(|e| e.to_string()).collect())
    }

    pub(crate) fn with_owned_entries(entries: Vec<String>) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().entries = entries;
        fake
    }

    /// The next `n` writes lose the race to another writer.
    pub(crate) fn inject_conflicts(&self, n: usize) {
        self.state.lock().unwrap().conflicts = n;
    }

    /// The next `n` writes fail with a transient error.
    pub(crate) fn inject_failures(&self, n: usize) {
        self.state.lock().unwrap().failures = n;
    }

    /// The next `n` writes are refused as invalid.
    pub(crate) fn inject_rejections(&self, n: usize) {
        self.state.lock().unwrap().rejections = n;
    }

    /// Every read fails while set.
    pub(crate) fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Change the set behind the gateway's back, as another replica would.
    pub(crate) fn replace_entries(&self, entries: &[&str]) {
        let mut state = self.state.lock().unwrap();
        state.entries = entries.iter().map(|e| e.to_string()).collect();
        state.version += 1;
    }

    pub(crate) fn entries(&self) -> Vec<String> {
        self.state.lock().unwrap().entries.clone()
    }

    pub(crate) fn gets(&self) -> usize {
        self.state.lock().unwrap().gets
    }

    /// Write attempts, including rejected ones.
    pub(crate) fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }
}

#[async_trait]
impl AddressSetProvider for FakeAddressSet {
    async fn find_set(&self, name: &str) -> Result<Option<SetId>> {
        Ok((name == SET_NAME).then(|| SetId {
            name: SET_NAME.to_string(),
            id: SET_ID.to_string(),
        }))
    }

    async fn get_set(&self, set: &SetId) -> Result<RawAddressSet> {
        assert_eq!(set.id, SET_ID);
        let mut state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(JailError::Transient("provider unreachable".to_string()));
        }
        state.gets += 1;
        Ok(RawAddressSet {
            entries: state.entries.clone(),
            token: VersionToken(state.version.to_string()),
        })
    }

    async fn update_set(
        &self,
        set: &SetId,
        token: &VersionToken,
        entries: &[String],
    ) -> Result<UpdateOutcome> {
        assert_eq!(set.id, SET_ID);
        let mut state = self.state.lock().unwrap();
        state.writes += 1;

        if state.failures > 0 {
            state.failures -= 1;
            return Err(JailError::Transient("provider unavailable".to_string()));
        }
        if state.rejections > 0 {
            state.rejections -= 1;
            return Err(JailError::validation("address set update", "invalid entry"));
        }
        if state.conflicts > 0 {
            state.conflicts -= 1;
            state.version += 1;
            return Ok(UpdateOutcome::Conflict);
        }
        if token.0 != state.version.to_string() {
            return Ok(UpdateOutcome::Conflict);
        }

        state.entries = entries.to_vec();
        state.version += 1;
        Ok(UpdateOutcome::Applied)
    }

    fn name(&self) -> &str {
        "fake"
    }
}
