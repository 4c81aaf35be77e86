//! Weighted random pick among the hosts of one virtual host.

use rand::Rng;

use crate::identity::HostId;

/// Immutable cumulative-weight table. Built once, picked from many times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedSelector {
    /// (cumulative weight, host), ascending by cumulative weight.
    entries: Vec<(u64, HostId)>,
    total: u64,
}

impl WeightedSelector {
    /// Build from (host, weight) pairs. Fails on an empty input or any weight ≤ 0.
    pub fn build<I>(candidates: I) -> Result<Self, SelectorError>
    where
        I: IntoIterator<Item = (HostId, i32)>,
    {
        let mut entries = Vec::new();
        let mut total: u64 = 0;
        for (host, weight) in candidates {
            if weight <= 0 {
                return Err(SelectorError::NonPositiveWeight { host, weight });
            }
            total += weight as u64;
            entries.push((total, host));
        }
        if entries.is_empty() {
            return Err(SelectorError::Empty);
        }
        Ok(Self { entries, total })
    }

    /// Pick a host using the thread-local RNG.
    pub fn pick(&self) -> HostId {
        if let [(_, only)] = self.entries.as_slice() {
            return *only;
        }
        self.pick_with(&mut rand::thread_rng())
    }

    /// Pick a host using the given RNG.
    pub fn pick_with<R: Rng + ?Sized>(&self, rng: &mut R) -> HostId {
        if let [(_, only)] = self.entries.as_slice() {
            return *only;
        }
        let draw = rng.gen_range(0..self.total);
        self.entries
            .iter()
            .find(|(cumulative, _)| *cumulative > draw)
            .map(|(_, host)| *host)
            .unwrap_or(self.entries[self.entries.len() - 1].1)
    }

    pub fn total_weight(&self) -> u64 {
        self.total
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hosts in selection order.
    pub fn hosts(&self) -> impl Iterator<Item = HostId> + '_ {
        self.entries.iter().map(|(_, h)| *h)
    }

    pub fn contains(&self, host: &HostId) -> bool {
        self.entries.iter().any(|(_, h)| h == host)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("no candidates")]
    Empty,
    #[error("host {host} has non-positive weight {weight}")]
    NonPositiveWeight { host: HostId, weight: i32 },
}
