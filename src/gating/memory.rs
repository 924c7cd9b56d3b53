//! In-memory Rule Store and Progress Oracle for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::gating::errors::GatingError;
use crate::gating::sources::{ProgressOracle, RuleStore};
use crate::gating::types::{AccessControl, CourseOutline, ResourceType, UserContext};

#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<Vec<AccessControl>>,
    outlines: RwLock<HashMap<String, CourseOutline>>,
    unavailable: AtomicBool,
    reads: AtomicUsize,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace (by id).
    pub async fn put_rule(&self, rule: AccessControl) {
        let mut rules = self.rules.write().await;
        match rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Option<AccessControl> {
        let mut rules = self.rules.write().await;
        let pos = rules.iter().position(|r| r.id == rule_id)?;
        Some(rules.remove(pos))
    }

    pub async fn set_outline(&self, outline: CourseOutline) {
        self.outlines
            .write()
            .await
            .insert(outline.course_id.clone(), outline);
    }

    /// Make every read fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of reads served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn begin_read(&self) -> Result<(), GatingError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatingError::Upstream {
                source_name: "rule store",
                message: "connection refused".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn get_active_rules(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError> {
        self.begin_read()?;
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|r| {
                r.active && r.resource_type == resource_type && r.resource_id == resource_id
            })
            .cloned()
            .collect())
    }

    async fn get_all_active_rules_for_course(
        &self,
        course_id: &str,
    ) -> Result<Vec<AccessControl>, GatingError> {
        self.begin_read()?;
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|r| r.active && r.course_id == course_id)
            .cloned()
            .collect())
    }

    async fn get_course_outline(&self, course_id: &str) -> Result<CourseOutline, GatingError> {
        self.begin_read()?;
        let outlines = self.outlines.read().await;
        Ok(outlines
            .get(course_id)
            .cloned()
            .unwrap_or_else(|| CourseOutline::new(course_id)))
    }
}

#[derive(Default)]
pub struct InMemoryProgressOracle {
    contexts: RwLock<HashMap<(String, String), UserContext>>,
    unavailable: AtomicBool,
    delay: std::sync::Mutex<Option<Duration>>,
}

impl InMemoryProgressOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_context(&self, context: UserContext) {
        let key = (context.user_id.clone(), context.course_id.clone());
        self.contexts.write().await.insert(key, context);
    }

    /// Edit a learner's context in place, creating it if missing.
    pub async fn update(&self, user_id: &str, course_id: &str, f: impl FnOnce(&mut UserContext)) {
        let mut contexts = self.contexts.write().await;
        let context = contexts
            .entry((user_id.to_string(), course_id.to_string()))
            .or_insert_with(|| UserContext::new(user_id, course_id));
        f(context);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every answer, for timeout tests.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }
}

#[async_trait]
impl ProgressOracle for InMemoryProgressOracle {
    async fn get_user_context(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<UserContext, GatingError> {
        let delay = *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(GatingError::Upstream {
                source_name: "progress oracle",
                message: "connection refused".to_string(),
            });
        }
        let contexts = self.contexts.read().await;
        Ok(contexts
            .get(&(user_id.to_string(), course_id.to_string()))
            .cloned()
            .unwrap_or_else(|| UserContext::new(user_id, course_id)))
    }
}
