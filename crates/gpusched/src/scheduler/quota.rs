use crate::store::{SlotContents, StoreGuard};
use crate::{GpuIndex, Map, Set};

/// Per-user GPU allowances together with the GPUs currently held by each user.
///
/// Usage is counted in distinct devices: a user that holds GPU 3 through two records
/// uses one GPU.
#[derive(Debug, Default, Clone)]
pub struct QuotaLedger {
    quotas: Map<String, f64>,
    usage: Map<String, Set<GpuIndex>>,
}

impl QuotaLedger {
    /// Reads the quota of every user with an inbox or a live record.
    /// Unreadable quota files are logged and treated as a zero quota.
    pub fn load(guard: &StoreGuard<'_>, slots: &SlotContents) -> crate::Result<Self> {
        let mut ledger = Self::from_slots(slots);
        let mut users: Set<String> = guard.users()?.into_iter().collect();
        users.extend(ledger.usage.keys().cloned());
        for user in users {
            match guard.read_quota(&user) {
                Ok(Some(quota)) => {
                    ledger.quotas.insert(user, quota);
                }
                Ok(None) => {}
                Err(error) => log::error!("Cannot read quota of {user}: {error}"),
            }
        }
        Ok(ledger)
    }

    pub fn from_slots(slots: &SlotContents) -> Self {
        let mut usage: Map<String, Set<GpuIndex>> = Map::new();
        for (gpu, records) in &slots.slots {
            for record in records {
                usage
                    .entry(record.user().to_string())
                    .or_default()
                    .insert(*gpu);
            }
        }
        Self {
            quotas: Map::new(),
            usage,
        }
    }

    pub fn set_quota(&mut self, user: &str, quota: f64) {
        self.quotas.insert(user.to_string(), quota);
    }

    pub fn quota(&self, user: &str) -> Option<f64> {
        self.quotas.get(user).copied()
    }

    pub fn usage(&self, user: &str) -> u32 {
        self.usage
            .get(user)
            .map(|gpus| gpus.len() as u32)
            .unwrap_or(0)
    }

    /// Number of further GPUs the user may hold. Users without a quota get nothing.
    pub fn remaining(&self, user: &str) -> f64 {
        let quota = self.quota(user).unwrap_or(0.0);
        (quota - self.usage(user) as f64).max(0.0)
    }

    pub fn admit(&self, user: &str, requested: u32) -> bool {
        match self.quota(user) {
            Some(quota) => (self.usage(user) + requested) as f64 <= quota,
            None => false,
        }
    }

    /// Records that `user` now holds `gpus`.
    pub fn charge(&mut self, user: &str, gpus: &[GpuIndex]) {
        self.usage
            .entry(user.to_string())
            .or_default()
            .extend(gpus.iter().copied());
    }
}

#[cfg(test)]
mod tests {
    use crate::scheduler::quota::QuotaLedger;
    use crate::store::SlotContents;
    use crate::store::layout::Location;
    use crate::tests::utils::{TestStore, assigned, interactive_job};

    #[test]
    fn usage_counts_distinct_gpus() {
        let mut slots = SlotContents::default();
        let a = assigned(interactive_job("alice", 1, 2));
        let b = assigned(interactive_job("alice", 2, 1));
        slots.slots.insert(0, vec![a.clone()]);
        slots.slots.insert(1, vec![a, b]);
        slots.slots.insert(2, vec![]);
        let ledger = QuotaLedger::from_slots(&slots);
        assert_eq!(ledger.usage("alice"), 2);
        assert_eq!(ledger.usage("bob"), 0);
    }

    #[test]
    fn admit_and_remaining() {
        let mut ledger = QuotaLedger::default();
        ledger.set_quota("alice", 2.0);
        assert!(ledger.admit("alice", 2));
        assert!(!ledger.admit("alice", 3));
        ledger.charge("alice", &[4]);
        assert_eq!(ledger.remaining("alice"), 1.0);
        assert!(ledger.admit("alice", 1));
        assert!(!ledger.admit("alice", 2));
        ledger.charge("alice", &[4, 5]);
        assert_eq!(ledger.usage("alice"), 2);
        assert_eq!(ledger.remaining("alice"), 0.0);
    }

    #[test]
    fn fractional_quota() {
        let mut ledger = QuotaLedger::default();
        ledger.set_quota("alice", 1.5);
        assert!(ledger.admit("alice", 1));
        assert!(!ledger.admit("alice", 2));
    }

    #[test]
    fn no_quota_means_no_gpus() {
        let ledger = QuotaLedger::default();
        assert!(!ledger.admit("bob", 1));
        assert_eq!(ledger.remaining("bob"), 0.0);
    }

    #[test]
    fn over_quota_is_clamped() {
        let mut ledger = QuotaLedger::default();
        ledger.set_quota("alice", 1.0);
        ledger.charge("alice", &[0, 1, 2]);
        assert_eq!(ledger.remaining("alice"), 0.0);
    }

    #[test]
    fn load_from_store() {
        let ctx = TestStore::new(2);
        ctx.add_user("alice", 2.0);
        ctx.add_user("bob", 1.0);
        ctx.put(&Location::Slot(1), &assigned(interactive_job("alice", 1, 1)));

        let guard = ctx.store.lock().unwrap();
        let slots = guard.read_slots().unwrap();
        let ledger = QuotaLedger::load(&guard, &slots).unwrap();
        assert_eq!(ledger.quota("alice"), Some(2.0));
        assert_eq!(ledger.quota("bob"), Some(1.0));
        assert_eq!(ledger.usage("alice"), 1);
        assert_eq!(ledger.remaining("alice"), 1.0);
    }
}
