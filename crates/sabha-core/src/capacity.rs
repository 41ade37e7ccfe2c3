use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Scope a bounded counter applies to.
///
/// Scopes are the only shared mutable counters in the system; every mutation
/// goes through the store's atomic `reserve`, never through direct writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope")]
pub enum PoolScope {
    /// Councilor roster of one unit, bounded by a step function of member count.
    CouncilorRoster { unit_id: Uuid },
    /// Conference delegate seats of one district.
    DelegateSeats { district_id: Uuid },
    /// Total participants registered into one event.
    EventTotal { event_id: Uuid },
    /// Participants from one unit in one event (the per-unit sub-ceiling).
    UnitEvent { event_id: Uuid, unit_id: Uuid },
    /// Individual events one member is registered for.
    MemberEvents { member_id: Uuid },
    /// Teams fielded by one district in one group event.
    DistrictTeams { event_id: Uuid, district_id: Uuid },
}

impl PoolScope {
    /// Stable storage key; also the scope label in capacity errors.
    pub fn key(&self) -> String {
        match self {
            Self::CouncilorRoster { unit_id } => format!("councilor-roster/{unit_id}"),
            Self::DelegateSeats { district_id } => format!("delegate-seats/{district_id}"),
            Self::EventTotal { event_id } => format!("event-total/{event_id}"),
            Self::UnitEvent { event_id, unit_id } => {
                format!("unit-event/{event_id}/{unit_id}")
            }
            Self::MemberEvents { member_id } => format!("member-events/{member_id}"),
            Self::DistrictTeams {
                event_id,
                district_id,
            } => format!("district-teams/{event_id}/{district_id}"),
        }
    }
}

/// Bounded counter state for one scope.
///
/// Invariant: `minimum_allowed <= current_count <= maximum_allowed` after
/// every committed change; a reservation that would break it is aborted
/// before any persistent write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityPool {
    pub scope_key: String,
    pub current_count: i64,
    pub minimum_allowed: i64,
    pub maximum_allowed: i64,
}

impl CapacityPool {
    pub fn new(scope: &PoolScope, minimum_allowed: i64, maximum_allowed: i64) -> Self {
        Self {
            scope_key: scope.key(),
            current_count: minimum_allowed.max(0),
            minimum_allowed,
            maximum_allowed,
        }
    }

    pub fn admits(&self, delta: i64) -> bool {
        let next = self.current_count + delta;
        next >= self.minimum_allowed && next <= self.maximum_allowed
    }
}

/// Capacity one change request consumes on approval and frees on revert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityDemand {
    pub scope: PoolScope,
    pub delta: i64,
}

impl CapacityDemand {
    pub fn new(scope: PoolScope, delta: i64) -> Self {
        Self { scope, delta }
    }
}

/// Counter scope for structured identifier sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequenceScope {
    /// Individual entries of one event: each entry gets a fresh number.
    IndividualEntries { event_id: Uuid },
    /// Teams of one group event: one number per team, shared by its members.
    TeamEntries { event_id: Uuid },
}

impl SequenceScope {
    pub fn key(&self) -> String {
        match self {
            Self::IndividualEntries { event_id } => format!("seq/individual/{event_id}"),
            Self::TeamEntries { event_id } => format!("seq/team/{event_id}"),
        }
    }
}

/// Limit policy configuration.
///
/// These are rules, not mechanism: the allocator enforces whatever bounds the
/// policy computes. Defaults carry the production values of the original
/// deployment.
#[derive(Debug, Clone)]
pub struct CapacityPolicy {
    /// Councilor slots by unit member count: (inclusive upper bound, slots).
    pub councilor_steps: Vec<(u32, i64)>,
    /// Councilor slots above the last step.
    pub councilor_ceiling: i64,
    /// Delegate seats per district unless overridden.
    pub delegate_default: i64,
    /// Per-district delegate seat overrides.
    pub delegate_overrides: BTreeMap<Uuid, i64>,
    /// Individual events one member may enter.
    pub max_individual_events_per_member: i64,
    /// Participants per unit per individual event.
    pub max_per_unit_per_individual_event: i64,
    /// Teams per district per group event.
    pub max_teams_per_district: i64,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            councilor_steps: vec![(25, 1), (50, 2), (75, 3), (100, 4)],
            councilor_ceiling: 5,
            delegate_default: 20,
            delegate_overrides: BTreeMap::new(),
            max_individual_events_per_member: 5,
            max_per_unit_per_individual_event: 2,
            max_teams_per_district: 2,
        }
    }
}

impl CapacityPolicy {
    /// Councilor roster maximum as a step function of unit member count.
    pub fn councilor_roster_limit(&self, member_count: u32) -> i64 {
        if member_count == 0 {
            return 0;
        }
        for (upper, slots) in &self.councilor_steps {
            if member_count <= *upper {
                return *slots;
            }
        }
        self.councilor_ceiling
    }

    pub fn delegate_ceiling(&self, district_id: Uuid) -> i64 {
        self.delegate_overrides
            .get(&district_id)
            .copied()
            .unwrap_or(self.delegate_default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn councilor_steps_match_member_count_bands() {
        let policy = CapacityPolicy::default();
        assert_eq!(policy.councilor_roster_limit(0), 0);
        assert_eq!(policy.councilor_roster_limit(1), 1);
        assert_eq!(policy.councilor_roster_limit(25), 1);
        assert_eq!(policy.councilor_roster_limit(26), 2);
        assert_eq!(policy.councilor_roster_limit(50), 2);
        assert_eq!(policy.councilor_roster_limit(75), 3);
        assert_eq!(policy.councilor_roster_limit(100), 4);
        assert_eq!(policy.councilor_roster_limit(101), 5);
        assert_eq!(policy.councilor_roster_limit(4_000), 5);
    }

    #[test]
    fn delegate_ceiling_prefers_override() {
        let district = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut policy = CapacityPolicy::default();
        policy.delegate_overrides.insert(district, 25);

        assert_eq!(policy.delegate_ceiling(district), 25);
        assert_eq!(policy.delegate_ceiling(other), 20);
    }

    #[test]
    fn pool_admits_only_within_bounds() {
        let scope = PoolScope::EventTotal {
            event_id: Uuid::new_v4(),
        };
        let mut pool = CapacityPool::new(&scope, 0, 3);
        assert!(pool.admits(3));
        assert!(!pool.admits(4));
        assert!(!pool.admits(-1));

        pool.current_count = 3;
        assert!(pool.admits(-3));
        assert!(!pool.admits(1));
    }

    #[test]
    fn scope_keys_are_distinct_per_coordinate() {
        let event_id = Uuid::new_v4();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let unit_a = PoolScope::UnitEvent {
            event_id,
            unit_id: a,
        };
        let unit_b = PoolScope::UnitEvent {
            event_id,
            unit_id: b,
        };
        assert_ne!(unit_a.key(), unit_b.key());
        assert_ne!(
            PoolScope::EventTotal { event_id }.key(),
            PoolScope::DistrictTeams {
                event_id,
                district_id: a
            }
            .key()
        );
    }
}
