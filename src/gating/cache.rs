//! Decision cache keyed by `(user, resource)`.
//!
//! Invalidations bump a generation counter and leave a mark behind. A put
//! carries the generation observed before its computation started and is
//! dropped if any covering mark is newer, so an invalidation always beats
//! a computation that was already in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};

use crate::gating::clock::Clock;
use crate::gating::types::{AccessCheckResult, ResourceKey};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Every cached decision of one learner within one course
    UserCourse { user_id: String, course_id: String },
    /// Every cached decision of one learner in any course
    User { user_id: String },
    /// Every learner's decision for one resource
    Resource(ResourceKey),
    All,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedDecision {
    pub result: AccessCheckResult,
    pub computed_at: DateTime<Utc>,
}

/// A decision offered to the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub user_id: String,
    pub resource: ResourceKey,
    pub course_id: String,
    pub result: AccessCheckResult,
    /// Read from the clock before `ticket` was taken
    pub computed_at: DateTime<Utc>,
    pub ticket: u64,
}

pub trait DecisionCache: Send + Sync {
    /// Generation to attach to a computation that is about to start.
    fn ticket(&self) -> u64;

    fn get(&self, user_id: &str, resource: &ResourceKey) -> Option<CachedDecision>;

    /// Store `entry` unless it is already expired or an invalidation covering
    /// it happened after its ticket was taken. Returns whether it was stored.
    fn put(&self, entry: CacheEntry) -> bool;

    /// Drop covered entries and record the invalidation. Returns the number
    /// of entries removed.
    fn invalidate(&self, scope: &InvalidationScope) -> usize;

    /// Drop expired entries and invalidation marks that can no longer reject
    /// a put.
    fn purge_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    generation: u64,
    at: DateTime<Utc>,
}

#[derive(Debug)]
struct StoredDecision {
    course_id: String,
    result: AccessCheckResult,
    computed_at: DateTime<Utc>,
    ticket: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, HashMap<ResourceKey, StoredDecision>>,
    user_course_marks: HashMap<(String, String), Mark>,
    user_marks: HashMap<String, Mark>,
    resource_marks: HashMap<ResourceKey, Mark>,
    global_mark: Option<Mark>,
}

impl CacheState {
    /// Newest invalidation generation covering the entry.
    fn covering_generation(&self, user_id: &str, course_id: &str, resource: &ResourceKey) -> u64 {
        let user_course = self
            .user_course_marks
            .get(&(user_id.to_string(), course_id.to_string()))
            .map(|m| m.generation);
        let user = self.user_marks.get(user_id).map(|m| m.generation);
        let resource = self.resource_marks.get(resource).map(|m| m.generation);
        let global = self.global_mark.map(|m| m.generation);
        [user_course, user, resource, global]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(0)
    }

    fn len(&self) -> usize {
        self.entries.values().map(|m| m.len()).sum()
    }
}

#[derive(Debug)]
pub struct InMemoryDecisionCache {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    state: RwLock<CacheState>,
    generation: AtomicU64,
}

impl InMemoryDecisionCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            state: RwLock::new(CacheState::default()),
            generation: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_expired(&self, computed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        computed_at + self.ttl <= now
    }
}

impl DecisionCache for InMemoryDecisionCache {
    fn ticket(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn get(&self, user_id: &str, resource: &ResourceKey) -> Option<CachedDecision> {
        let now = self.clock.now();
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let stored = state.entries.get(user_id)?.get(resource)?;
        if self.is_expired(stored.computed_at, now) {
            return None;
        }
        // a lock that has since timed out, or a grant whose window has
        // closed, must be re-evaluated
        if stored.result.unlocks_at.is_some_and(|t| t <= now)
            || stored.result.valid_until.is_some_and(|t| t <= now)
        {
            return None;
        }
        if stored.ticket < state.covering_generation(user_id, &stored.course_id, resource) {
            return None;
        }
        Some(CachedDecision {
            result: stored.result.clone(),
            computed_at: stored.computed_at,
        })
    }

    fn put(&self, entry: CacheEntry) -> bool {
        let now = self.clock.now();
        if self.is_expired(entry.computed_at, now) {
            return false;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let covering =
            state.covering_generation(&entry.user_id, &entry.course_id, &entry.resource);
        if entry.ticket < covering {
            tracing::debug!(
                user_id = %entry.user_id,
                resource = %entry.resource,
                ticket = entry.ticket,
                covering,
                "Discarding decision computed before an invalidation"
            );
            return false;
        }

        let slot = state.entries.entry(entry.user_id).or_default();
        if let Some(existing) = slot.get(&entry.resource) {
            if existing.ticket > entry.ticket {
                return false;
            }
        }
        slot.insert(
            entry.resource,
            StoredDecision {
                course_id: entry.course_id,
                result: entry.result,
                computed_at: entry.computed_at,
                ticket: entry.ticket,
            },
        );
        true
    }

    fn invalidate(&self, scope: &InvalidationScope) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // Both read under the write lock: a ticket never outruns its mark, and
        // the mark is never older than a put it must reject.
        let mark = Mark {
            generation: self.generation.fetch_add(1, Ordering::SeqCst) + 1,
            at: self.clock.now(),
        };

        let removed = match scope {
            InvalidationScope::UserCourse { user_id, course_id } => {
                state
                    .user_course_marks
                    .insert((user_id.clone(), course_id.clone()), mark);
                match state.entries.get_mut(user_id) {
                    Some(by_resource) => {
                        let before = by_resource.len();
                        by_resource.retain(|_, d| &d.course_id != course_id);
                        before - by_resource.len()
                    }
                    None => 0,
                }
            }
            InvalidationScope::User { user_id } => {
                state.user_marks.insert(user_id.clone(), mark);
                state.entries.remove(user_id).map_or(0, |by_resource| by_resource.len())
            }
            InvalidationScope::Resource(resource) => {
                state.resource_marks.insert(resource.clone(), mark);
                state
                    .entries
                    .values_mut()
                    .filter_map(|by_resource| by_resource.remove(resource))
                    .count()
            }
            InvalidationScope::All => {
                state.global_mark = Some(mark);
                state.user_course_marks.clear();
                state.user_marks.clear();
                state.resource_marks.clear();
                let removed = state.len();
                state.entries.clear();
                removed
            }
        };
        state.entries.retain(|_, by_resource| !by_resource.is_empty());

        tracing::debug!(
            ?scope,
            removed,
            generation = mark.generation,
            "Invalidated cached decisions"
        );
        removed
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.ttl;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let before = state.len();
        for by_resource in state.entries.values_mut() {
            by_resource.retain(|_, d| {
                d.computed_at + ttl > now && !d.result.valid_until.is_some_and(|t| t <= now)
            });
        }
        state.entries.retain(|_, by_resource| !by_resource.is_empty());
        let removed = before - state.len();

        // Any put older than a mark is rejected as expired once the mark is
        // a full TTL old, so the mark is no longer needed.
        state.user_course_marks.retain(|_, m| m.at + ttl >= now);
        state.user_marks.retain(|_, m| m.at + ttl >= now);
        state.resource_marks.retain(|_, m| m.at + ttl >= now);
        if state.global_mark.is_some_and(|m| m.at + ttl < now) {
            state.global_mark = None;
        }
        removed
    }

    fn len(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gating::clock::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (Arc<ManualClock>, InMemoryDecisionCache) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap(),
        ));
        let cache = InMemoryDecisionCache::new(Duration::seconds(300), clock.clone());
        (clock, cache)
    }

    fn entry(
        cache: &InMemoryDecisionCache,
        clock: &ManualClock,
        user: &str,
        course: &str,
        lesson: &str,
    ) -> CacheEntry {
        CacheEntry {
            user_id: user.into(),
            resource: ResourceKey::lesson(lesson),
            course_id: course.into(),
            result: AccessCheckResult::granted(),
            computed_at: clock.now(),
            ticket: cache.ticket(),
        }
    }

    #[test]
    fn test_hit_and_expiry() {
        let (clock, cache) = setup();
        assert!(cache.put(entry(&cache, &clock, "u1", "c1", "l1")));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_some());
        assert!(cache.get("u2", &ResourceKey::lesson("l1")).is_none());

        clock.advance(Duration::seconds(299));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_some());
        clock.advance(Duration::seconds(1));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_none());
    }

    #[test]
    fn test_user_course_invalidation() {
        let (clock, cache) = setup();
        cache.put(entry(&cache, &clock, "u1", "c1", "l1"));
        cache.put(entry(&cache, &clock, "u1", "c2", "x1"));
        cache.put(entry(&cache, &clock, "u2", "c1", "l1"));

        let removed = cache.invalidate(&InvalidationScope::UserCourse {
            user_id: "u1".into(),
            course_id: "c1".into(),
        });
        assert_eq!(removed, 1);
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_none());
        assert!(cache.get("u1", &ResourceKey::lesson("x1")).is_some());
        assert!(cache.get("u2", &ResourceKey::lesson("l1")).is_some());
    }

    #[test]
    fn test_resource_invalidation_spans_users() {
        let (clock, cache) = setup();
        cache.put(entry(&cache, &clock, "u1", "c1", "l1"));
        cache.put(entry(&cache, &clock, "u2", "c1", "l1"));
        cache.put(entry(&cache, &clock, "u2", "c1", "l2"));

        let removed = cache.invalidate(&InvalidationScope::Resource(ResourceKey::lesson("l1")));
        assert_eq!(removed, 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidation_beats_in_flight_put() {
        let (clock, cache) = setup();
        // computation starts
        let stale = entry(&cache, &clock, "u1", "c1", "l1");
        // progress changes while it runs
        cache.invalidate(&InvalidationScope::UserCourse {
            user_id: "u1".into(),
            course_id: "c1".into(),
        });
        assert!(!cache.put(stale));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_none());

        // a computation started after the invalidation is accepted
        assert!(cache.put(entry(&cache, &clock, "u1", "c1", "l1")));
    }

    #[test]
    fn test_global_invalidation() {
        let (clock, cache) = setup();
        let stale = entry(&cache, &clock, "u9", "c9", "l9");
        cache.put(entry(&cache, &clock, "u1", "c1", "l1"));
        assert_eq!(cache.invalidate(&InvalidationScope::All), 1);
        assert!(!cache.put(stale));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lock_past_unlock_time_is_a_miss() {
        let (clock, cache) = setup();
        let mut locked = entry(&cache, &clock, "u1", "c1", "l1");
        locked.result = AccessCheckResult {
            has_access: false,
            reason: Some("not yet".into()),
            unlocks_at: Some(clock.now() + Duration::seconds(60)),
            required_actions: Vec::new(),
            valid_until: None,
        };
        cache.put(locked);
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_some());
        clock.advance(Duration::seconds(60));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_none());
    }

    #[test]
    fn test_grant_past_window_close_is_a_miss() {
        let (clock, cache) = setup();
        let mut open = entry(&cache, &clock, "u1", "c1", "l1");
        open.result.valid_until = Some(clock.now() + Duration::seconds(30));
        cache.put(open);
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_some());

        clock.advance(Duration::seconds(30));
        assert!(cache.get("u1", &ResourceKey::lesson("l1")).is_none());
        assert_eq!(cache.purge_expired(), 1);
    }

    #[test]
    fn test_user_invalidation_spans_courses() {
        let (clock, cache) = setup();
        let in_flight = entry(&cache, &clock, "u1", "c3", "y1");
        cache.put(entry(&cache, &clock, "u1", "c1", "l1"));
        cache.put(entry(&cache, &clock, "u1", "c2", "x1"));
        cache.put(entry(&cache, &clock, "u2", "c1", "l1"));

        let removed = cache.invalidate(&InvalidationScope::User {
            user_id: "u1".into(),
        });
        assert_eq!(removed, 2);
        assert!(cache.get("u1", &ResourceKey::lesson("x1")).is_none());
        assert!(cache.get("u2", &ResourceKey::lesson("l1")).is_some());
        assert!(!cache.put(in_flight));
    }

    #[test]
    fn test_purge_expired() {
        let (clock, cache) = setup();
        cache.put(entry(&cache, &clock, "u1", "c1", "l1"));
        clock.advance(Duration::seconds(200));
        cache.put(entry(&cache, &clock, "u1", "c1", "l2"));
        clock.advance(Duration::seconds(150));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("u1", &ResourceKey::lesson("l2")).is_some());
    }

    #[test]
    fn test_expired_put_rejected() {
        let (clock, cache) = setup();
        let slow = entry(&cache, &clock, "u1", "c1", "l1");
        clock.advance(Duration::seconds(301));
        assert!(!cache.put(slow));
    }
}
