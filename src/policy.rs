//! Replication-policy validation.
//!
//! A policy is a predicate over a set of process localities deciding
//! whether the set can hold a full replica team (e.g. "two distinct
//! zones"). The fault controller consults the transaction-log and storage
//! policies before allowing a destructive kill.

use std::fmt;
use std::rc::Rc;

use crate::locality::{LocalityAttrib, LocalityData};

/// A set of localities under policy evaluation.
#[derive(Debug, Clone, Default)]
pub struct LocalityGroup {
    entries: Vec<LocalityData>,
}

impl LocalityGroup {
    /// An empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a group from a list of localities.
    pub fn from_localities(entries: Vec<LocalityData>) -> Self {
        Self { entries }
    }

    /// Add one locality.
    pub fn add(&mut self, locality: LocalityData) {
        self.entries.push(locality);
    }

    /// Number of localities in the group.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the group is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The localities in insertion order.
    pub fn entries(&self) -> &[LocalityData] {
        &self.entries
    }
}

/// Predicate over a locality set deciding replication feasibility.
pub trait ReplicationPolicy {
    /// True if `group` satisfies this policy.
    fn validate(&self, group: &LocalityGroup) -> bool;

    /// Human-readable description, used in trace events.
    fn info(&self) -> String;
}

impl fmt::Debug for dyn ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.info())
    }
}

/// Satisfied by any non-empty group.
#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyOne;

impl ReplicationPolicy for PolicyOne {
    fn validate(&self, group: &LocalityGroup) -> bool {
        !group.is_empty()
    }

    fn info(&self) -> String {
        "One".to_string()
    }
}

/// Requires `count` distinct values of `attrib`, each of whose subgroup
/// satisfies the inner policy.
///
/// `PolicyAcross::new(2, LocalityAttrib::ZoneId, PolicyOne)` reads as
/// "replicas across at least two zones".
pub struct PolicyAcross {
    count: usize,
    attrib: LocalityAttrib,
    inner: Rc<dyn ReplicationPolicy>,
}

impl PolicyAcross {
    /// Create an across-policy.
    pub fn new(count: usize, attrib: LocalityAttrib, inner: impl ReplicationPolicy + 'static) -> Self {
        Self {
            count,
            attrib,
            inner: Rc::new(inner),
        }
    }
}

impl ReplicationPolicy for PolicyAcross {
    fn validate(&self, group: &LocalityGroup) -> bool {
        // Group entries by attribute value; entries missing the attribute
        // cannot contribute to any bucket.
        let mut buckets: std::collections::BTreeMap<&str, LocalityGroup> =
            std::collections::BTreeMap::new();
        for entry in group.entries() {
            if let Some(value) = entry.get(self.attrib) {
                buckets.entry(value).or_default().add(entry.clone());
            }
        }
        let satisfied = buckets
            .values()
            .filter(|sub| self.inner.validate(sub))
            .count();
        satisfied >= self.count
    }

    fn info(&self) -> String {
        format!("Across({},{:?},{})", self.count, self.attrib, self.inner.info())
    }
}

/// Anti-quorum feasibility check.
///
/// Returns `true` iff for every combination of `anti_quorum` localities
/// drawn from `available`, the dead set extended by that combination still
/// does NOT satisfy `policy`. A `false` result means some additional
/// anti-quorum loss would silently complete a policy-covering dead set, so
/// the kill under test must be downgraded.
pub fn validate_all_combinations(
    dead: &LocalityGroup,
    policy: &dyn ReplicationPolicy,
    available: &[LocalityData],
    anti_quorum: usize,
) -> bool {
    if anti_quorum == 0 {
        return true;
    }
    if anti_quorum > available.len() {
        return true;
    }

    let mut indices: Vec<usize> = (0..anti_quorum).collect();
    loop {
        let mut candidate = dead.clone();
        for &i in &indices {
            candidate.add(available[i].clone());
        }
        if policy.validate(&candidate) {
            return false;
        }

        // Advance to the next combination in lexicographic order.
        let mut pos = anti_quorum;
        loop {
            if pos == 0 {
                return true;
            }
            pos -= 1;
            if indices[pos] != pos + available.len() - anti_quorum {
                break;
            }
        }
        indices[pos] += 1;
        for j in pos + 1..anti_quorum {
            indices[j] = indices[j - 1] + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(z: &str) -> LocalityData {
        LocalityData::for_zone(z)
    }

    fn two_of_zones() -> PolicyAcross {
        PolicyAcross::new(2, LocalityAttrib::ZoneId, PolicyOne)
    }

    #[test]
    fn policy_one() {
        let policy = PolicyOne;
        assert!(!policy.validate(&LocalityGroup::new()));
        assert!(policy.validate(&LocalityGroup::from_localities(vec![zone("z1")])));
    }

    #[test]
    fn across_counts_distinct_attribute_values() {
        let policy = two_of_zones();
        let one = LocalityGroup::from_localities(vec![zone("z1"), zone("z1")]);
        assert!(!policy.validate(&one));

        let two = LocalityGroup::from_localities(vec![zone("z1"), zone("z2")]);
        assert!(policy.validate(&two));
    }

    #[test]
    fn across_ignores_missing_attribute() {
        let policy = two_of_zones();
        let mut group = LocalityGroup::new();
        group.add(LocalityData {
            zone_id: None,
            data_hall_id: None,
            dc_id: None,
            machine_id: None,
        });
        group.add(zone("z1"));
        assert!(!policy.validate(&group));
    }

    #[test]
    fn anti_quorum_detects_completable_dead_set() {
        let policy = two_of_zones();
        let dead = LocalityGroup::from_localities(vec![zone("z1")]);
        let available = vec![zone("z2"), zone("z3")];

        // One more zone loss would complete a two-zone dead set.
        assert!(!validate_all_combinations(&dead, &policy, &available, 1));

        // With nothing dead, a single extra loss cannot cover two zones.
        let empty = LocalityGroup::new();
        assert!(validate_all_combinations(&empty, &policy, &available, 1));
    }

    #[test]
    fn anti_quorum_zero_is_trivially_safe() {
        let policy = two_of_zones();
        let dead = LocalityGroup::from_localities(vec![zone("z1"), zone("z2")]);
        assert!(validate_all_combinations(&dead, &policy, &[], 0));
    }
}
