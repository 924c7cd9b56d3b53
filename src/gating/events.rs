//! Change notifications that invalidate cached decisions, and the broadcast
//! bus that carries them to the engine.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::gating::cache::InvalidationScope;
use crate::gating::engine::GatingEngine;
use crate::gating::types::{ResourceKey, ResourceType};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum GatingEvent {
    #[serde(rename_all = "camelCase")]
    ProgressChanged {
        user_id: String,
        course_id: String,
        resource_id: String,
    },
    #[serde(rename_all = "camelCase")]
    RuleChanged {
        resource_type: ResourceType,
        resource_id: String,
    },
    #[serde(rename_all = "camelCase")]
    EnrollmentChanged { user_id: String, course_id: String },
}

impl GatingEvent {
    /// Cached decisions this event makes stale.
    ///
    /// Enrollment and group changes reach every course of the learner: an
    /// ENROLLMENT prerequisite gates one course on enrollment in another.
    pub fn scope(&self) -> InvalidationScope {
        match self {
            GatingEvent::ProgressChanged {
                user_id, course_id, ..
            } => InvalidationScope::UserCourse {
                user_id: user_id.clone(),
                course_id: course_id.clone(),
            },
            GatingEvent::EnrollmentChanged { user_id, .. } => InvalidationScope::User {
                user_id: user_id.clone(),
            },
            GatingEvent::RuleChanged {
                resource_type,
                resource_id,
            } => InvalidationScope::Resource(ResourceKey::new(
                (*resource_type).into(),
                resource_id.clone(),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatingEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns the number of listeners that will see the event.
    pub fn publish(&self, event: GatingEvent) -> usize {
        match self.sender.send(event) {
            Ok(n) => n,
            Err(broadcast::error::SendError(event)) => {
                tracing::debug!(?event, "No listeners for gating event");
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatingEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Apply every event on the bus to the engine's cache until the bus closes.
/// A lagging listener has lost events, so it clears the whole cache.
pub fn spawn_invalidation_listener(engine: Arc<GatingEngine>, bus: &EventBus) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    engine.apply_event(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(
                        missed,
                        "Invalidation listener lagged; clearing decision cache"
                    );
                    engine.invalidate(&InvalidationScope::All);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gating::cache::{CacheEntry, DecisionCache, InMemoryDecisionCache};
    use crate::gating::clock::ManualClock;
    use crate::gating::memory::{InMemoryProgressOracle, InMemoryRuleStore};
    use crate::gating::types::AccessCheckResult;
    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    fn cached_engine() -> (Arc<GatingEngine>, Arc<InMemoryDecisionCache>) {
        let clock = Arc::new(ManualClock::new(start()));
        let cache = Arc::new(InMemoryDecisionCache::new(
            chrono::Duration::minutes(5),
            clock.clone(),
        ));
        let engine = GatingEngine::new(
            Arc::new(InMemoryRuleStore::new()),
            Arc::new(InMemoryProgressOracle::new()),
        )
        .with_clock(clock)
        .with_cache(cache.clone());
        (Arc::new(engine), cache)
    }

    fn remember(cache: &InMemoryDecisionCache, user: &str, course: &str, lesson: &str) {
        cache.put(CacheEntry {
            user_id: user.into(),
            resource: ResourceKey::lesson(lesson),
            course_id: course.into(),
            result: AccessCheckResult::granted(),
            computed_at: start(),
            ticket: cache.ticket(),
        });
    }

    async fn settle(cache: &InMemoryDecisionCache, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while cache.len() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("listener applied the events");
    }

    #[test]
    fn test_event_wire_format() {
        let event: GatingEvent = serde_json::from_value(json!({
            "event": "ProgressChanged",
            "userId": "u1",
            "courseId": "c1",
            "resourceId": "l1"
        }))
        .unwrap();
        assert_eq!(
            event.scope(),
            InvalidationScope::UserCourse {
                user_id: "u1".into(),
                course_id: "c1".into()
            }
        );

        let event: GatingEvent = serde_json::from_value(json!({
            "event": "RuleChanged",
            "resourceType": "MODULE",
            "resourceId": "m2"
        }))
        .unwrap();
        assert_eq!(
            event.scope(),
            InvalidationScope::Resource(ResourceKey::module("m2"))
        );
    }

    #[tokio::test]
    async fn test_publish_without_listeners() {
        let bus = EventBus::new(4);
        let sent = bus.publish(GatingEvent::EnrollmentChanged {
            user_id: "u1".into(),
            course_id: "c1".into(),
        });
        assert_eq!(sent, 0);

        let mut rx = bus.subscribe();
        let event = GatingEvent::EnrollmentChanged {
            user_id: "u2".into(),
            course_id: "c1".into(),
        };
        assert_eq!(bus.publish(event.clone()), 1);
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_enrollment_change_spans_courses() {
        let event = GatingEvent::EnrollmentChanged {
            user_id: "u1".into(),
            course_id: "intro".into(),
        };
        assert_eq!(
            event.scope(),
            InvalidationScope::User {
                user_id: "u1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_listener_applies_events() {
        let (engine, cache) = cached_engine();
        let bus = EventBus::new(8);
        let listener = spawn_invalidation_listener(engine, &bus);

        remember(&cache, "u1", "c1", "l1");
        remember(&cache, "u1", "c2", "x1");
        remember(&cache, "u2", "c1", "l1");
        bus.publish(GatingEvent::ProgressChanged {
            user_id: "u1".into(),
            course_id: "c1".into(),
            resource_id: "l0".into(),
        });
        settle(&cache, 2).await;
        assert!(cache.get("u1", &ResourceKey::lesson("x1")).is_some());

        bus.publish(GatingEvent::EnrollmentChanged {
            user_id: "u1".into(),
            course_id: "c9".into(),
        });
        settle(&cache, 1).await;
        assert!(cache.get("u2", &ResourceKey::lesson("l1")).is_some());

        drop(bus);
        listener.await.unwrap();
    }

    #[tokio::test]
    async fn test_lagging_listener_clears_cache() {
        let (engine, cache) = cached_engine();
        let bus = EventBus::new(1);
        let listener = spawn_invalidation_listener(engine, &bus);

        remember(&cache, "u1", "c1", "l1");
        remember(&cache, "u2", "c2", "x1");
        // none of these touch the cached entries, but the listener has not
        // run yet and loses all but the last
        for user in ["u7", "u8", "u9"] {
            bus.publish(GatingEvent::ProgressChanged {
                user_id: user.into(),
                course_id: "c5".into(),
                resource_id: "l1".into(),
            });
        }
        settle(&cache, 0).await;

        drop(bus);
        listener.await.unwrap();
    }
}
