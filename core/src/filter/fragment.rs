use starknet_types_core::felt::Felt;

use crate::helpers::padded_hex;

/// The smallest key under which completed-interval records are kept.
///
/// A log filter with three addresses and two topic0 values expands to six
/// fragments; two filters that share a fragment share the sync work already
/// done for it. The id is a canonical string so it can be persisted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fragment {
    pub id: String,
    /// Concrete address to fetch for, when the fragment pins one.
    pub address: Option<Felt>,
    /// Factory whose child addresses stand in for a concrete address.
    pub factory_id: Option<String>,
    /// Concrete event selector to fetch for, when the fragment pins one.
    pub topic0: Option<Felt>,
}

impl Fragment {
    pub fn log(chain_id: u64, address: LogAddressPart, topic0: Option<Felt>) -> Fragment {
        let (address_key, address, factory_id) = match address {
            LogAddressPart::Any => ("*".to_string(), None, None),
            LogAddressPart::Address(addr) => (padded_hex(&addr), Some(addr), None),
            LogAddressPart::Factory(id) => (format!("factory:{id}"), None, Some(id)),
        };
        let topic_key = topic0.as_ref().map(padded_hex).unwrap_or_else(|| "*".to_string());

        Fragment {
            id: format!("log_{chain_id}_{address_key}_{topic_key}"),
            address,
            factory_id,
            topic0,
        }
    }

    pub fn block(chain_id: u64, interval: u64, offset: u64) -> Fragment {
        Fragment {
            id: format!("block_{chain_id}_{interval}_{offset}"),
            address: None,
            factory_id: None,
            topic0: None,
        }
    }

    pub fn transaction(chain_id: u64, from: Option<Felt>) -> Fragment {
        let from_key = from.as_ref().map(padded_hex).unwrap_or_else(|| "*".to_string());
        Fragment {
            id: format!("tx_{chain_id}_{from_key}"),
            address: from,
            factory_id: None,
            topic0: None,
        }
    }

    pub fn trace(chain_id: u64, from: Option<Felt>, to: LogAddressPart) -> Fragment {
        let from_key = from.as_ref().map(padded_hex).unwrap_or_else(|| "*".to_string());
        let (to_key, address, factory_id) = match to {
            LogAddressPart::Any => ("*".to_string(), None, None),
            LogAddressPart::Address(addr) => (padded_hex(&addr), Some(addr), None),
            LogAddressPart::Factory(id) => (format!("factory:{id}"), None, Some(id)),
        };
        Fragment {
            id: format!("trace_{chain_id}_{from_key}_{to_key}"),
            address: address.or(from),
            factory_id,
            topic0: None,
        }
    }

    pub fn transfer(chain_id: u64, from: Option<Felt>, to: Option<Felt>) -> Fragment {
        let from_key = from.as_ref().map(padded_hex).unwrap_or_else(|| "*".to_string());
        let to_key = to.as_ref().map(padded_hex).unwrap_or_else(|| "*".to_string());
        Fragment {
            id: format!("transfer_{chain_id}_{from_key}_{to_key}"),
            address: None,
            factory_id: None,
            topic0: None,
        }
    }
}

/// Address position of a fragment: pinned, factory-derived, or match-any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogAddressPart {
    Any,
    Address(Felt),
    Factory(String),
}

/// A union of inclusive block intervals, kept sorted, disjoint and
/// adjacency-merged. This is the shape completed work is tracked in, both
/// in memory and through the sync store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<(u64, u64)>,
}

impl IntervalSet {
    pub fn new() -> Self {
        IntervalSet::default()
    }

    pub fn from_interval(interval: (u64, u64)) -> Self {
        let mut set = IntervalSet::new();
        set.insert(interval);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.intervals.iter().copied()
    }

    pub fn total_blocks(&self) -> u64 {
        self.intervals.iter().map(|(lo, hi)| hi - lo + 1).sum()
    }

    /// Insert `[lo, hi]`, merging overlapping and adjacent intervals.
    pub fn insert(&mut self, (lo, hi): (u64, u64)) {
        if lo > hi {
            return;
        }

        let mut merged = Vec::with_capacity(self.intervals.len() + 1);
        let mut new_lo = lo;
        let mut new_hi = hi;
        let mut placed = false;

        for &(a, b) in &self.intervals {
            if b < new_lo && new_lo - b > 1 {
                // Entirely before the new interval, not adjacent.
                merged.push((a, b));
            } else if a > new_hi && a - new_hi > 1 {
                // Entirely after the new interval, not adjacent.
                if !placed {
                    merged.push((new_lo, new_hi));
                    placed = true;
                }
                merged.push((a, b));
            } else {
                new_lo = new_lo.min(a);
                new_hi = new_hi.max(b);
            }
        }
        if !placed {
            merged.push((new_lo, new_hi));
        }

        self.intervals = merged;
    }

    pub fn contains(&self, (lo, hi): (u64, u64)) -> bool {
        self.intervals.iter().any(|&(a, b)| a <= lo && hi <= b)
    }

    pub fn intersect(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for &(a, b) in &self.intervals {
            for &(c, d) in &other.intervals {
                let lo = a.max(c);
                let hi = b.min(d);
                if lo <= hi {
                    out.insert((lo, hi));
                }
            }
        }
        out
    }

    /// Blocks in `self` not covered by `other`.
    pub fn difference(&self, other: &IntervalSet) -> IntervalSet {
        let mut out = IntervalSet::new();
        for &(a, b) in &self.intervals {
            let mut cursor = a;
            for &(c, d) in &other.intervals {
                if d < cursor || c > b {
                    continue;
                }
                if c > cursor {
                    out.insert((cursor, c - 1));
                }
                cursor = cursor.max(d.saturating_add(1));
                if cursor > b {
                    break;
                }
            }
            if cursor <= b {
                out.insert((cursor, b));
            }
        }
        out
    }
}
