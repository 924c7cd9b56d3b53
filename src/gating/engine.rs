//! The gating engine: loads rules and learner state, runs one evaluator per
//! rule and AND-combines the results.
//!
//! Every failure path ends in a locked decision. Lenient checks never return
//! an error; strict checks hand upstream failures back to the caller.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::gating::cache::{CacheEntry, DecisionCache, InvalidationScope};
use crate::gating::clock::{Clock, SystemClock};
use crate::gating::errors::GatingError;
use crate::gating::evaluators::{CustomRule, EvalContext, EvaluatorRegistry};
use crate::gating::events::GatingEvent;
use crate::gating::graph::{self, PrerequisiteGraph};
use crate::gating::sources::{ProgressOracle, RuleStore};
use crate::gating::types::{
    evaluation_error_action, AccessCheckResult, AccessControl, AccessControlConfig,
    CourseOutline, EvaluationMode, PartialDecision, ResourceKey, ResourceType, UserContext,
    REASON_EVALUATION_ERROR,
};

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_ORACLE_TIMEOUT: Duration = Duration::from_secs(2);

/// Everything needed to evaluate any resource of one course for one learner.
#[derive(Debug, Clone)]
pub struct CourseSnapshot {
    pub rules: Vec<AccessControl>,
    pub outline: CourseOutline,
    pub graph: PrerequisiteGraph,
    pub user: UserContext,
}

impl CourseSnapshot {
    pub fn new(rules: Vec<AccessControl>, outline: CourseOutline, user: UserContext) -> Self {
        let graph = PrerequisiteGraph::from_rules(&rules);
        Self {
            rules,
            outline,
            graph,
            user,
        }
    }

    /// Active rules attached to `resource`, oldest first.
    pub fn rules_for(&self, resource: &ResourceKey) -> Vec<AccessControl> {
        self.rules
            .iter()
            .filter(|r| r.active && &r.resource_key() == resource)
            .cloned()
            .collect()
    }
}

/// Findings of a consistency audit over one course's stored rules.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub course_id: String,
    pub rules_checked: usize,
    pub cycle: Option<Vec<String>>,
    /// rule id -> why its configuration cannot be evaluated
    pub invalid_rules: BTreeMap<String, String>,
    /// Rules attached to a resource missing from the outline
    pub orphaned_rules: Vec<String>,
    /// `rule id: target` for prerequisites pointing at missing items
    pub dangling_prerequisites: Vec<String>,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.cycle.is_none()
            && self.invalid_rules.is_empty()
            && self.orphaned_rules.is_empty()
            && self.dangling_prerequisites.is_empty()
    }
}

pub struct GatingEngine {
    rules: Arc<dyn RuleStore>,
    oracle: Arc<dyn ProgressOracle>,
    cache: Option<Arc<dyn DecisionCache>>,
    evaluators: EvaluatorRegistry,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    oracle_timeout: Duration,
}

impl GatingEngine {
    pub fn new(rules: Arc<dyn RuleStore>, oracle: Arc<dyn ProgressOracle>) -> Self {
        Self {
            rules,
            oracle,
            cache: None,
            evaluators: EvaluatorRegistry::new(),
            clock: Arc::new(SystemClock),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            oracle_timeout: DEFAULT_ORACLE_TIMEOUT,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn DecisionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeouts(mut self, store: Duration, oracle: Duration) -> Self {
        self.store_timeout = store;
        self.oracle_timeout = oracle;
        self
    }

    pub fn with_custom_rule(mut self, rule: Arc<dyn CustomRule>) -> Self {
        self.evaluators.register_custom(rule);
        self
    }

    pub fn evaluators(&self) -> &EvaluatorRegistry {
        &self.evaluators
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Decide whether `user_id` may open the resource. Never fails: errors
    /// become a locked "evaluation error" decision.
    pub async fn check_access(
        &self,
        user_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> AccessCheckResult {
        match self
            .check(user_id, resource_type, resource_id, EvaluationMode::Lenient)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(
                    user_id,
                    resource = %ResourceKey::new(resource_type.into(), resource_id),
                    error = %e,
                    "Access check failed; denying"
                );
                AccessCheckResult::evaluation_error()
            }
        }
    }

    /// Like [`check_access`](Self::check_access) but bypasses cached
    /// decisions and returns Rule Store / Progress Oracle failures as errors.
    /// Broken rules still fail closed inside the decision.
    pub async fn check_access_strict(
        &self,
        user_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<AccessCheckResult, GatingError> {
        self.check(user_id, resource_type, resource_id, EvaluationMode::Strict)
            .await
    }

    async fn check(
        &self,
        user_id: &str,
        resource_type: ResourceType,
        resource_id: &str,
        mode: EvaluationMode,
    ) -> Result<AccessCheckResult, GatingError> {
        let resource = ResourceKey::new(resource_type.into(), resource_id);

        if mode == EvaluationMode::Lenient {
            if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(user_id, &resource)) {
                tracing::trace!(user_id, %resource, "Decision served from cache");
                return Ok(cached.result);
            }
        }

        // read the clock before the ticket, see `CacheEntry::computed_at`
        let now = self.clock.now();
        let ticket = self.cache.as_ref().map(|c| c.ticket());

        let rules = timed(
            "rule store",
            self.store_timeout,
            self.rules.get_active_rules(resource_type, resource_id),
        )
        .await?;

        let Some(course_id) = rules.first().map(|r| r.course_id.clone()) else {
            return Ok(AccessCheckResult::unrestricted());
        };

        let snapshot = self.load_course(user_id, &course_id).await?;
        let result = self.decide(&resource, &rules, &snapshot, now);

        if let (Some(cache), Some(ticket)) = (&self.cache, ticket) {
            cache.put(CacheEntry {
                user_id: user_id.to_string(),
                resource: resource.clone(),
                course_id,
                result: result.clone(),
                computed_at: now,
                ticket,
            });
        }

        tracing::debug!(user_id, %resource, has_access = result.has_access, "Access decided");
        Ok(result)
    }

    /// Decisions for every gated item of a course, keyed by `KIND/id`. The
    /// course is loaded once for the whole batch.
    ///
    /// A Progress Oracle failure denies every ruled resource with an
    /// "evaluation error" decision; unruled resources stay unrestricted. Rule
    /// Store failures are returned since there is no outline to answer for.
    pub async fn check_access_batch(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<BTreeMap<String, AccessCheckResult>, GatingError> {
        self.batch(user_id, course_id, EvaluationMode::Lenient).await
    }

    /// Batch counterpart of [`check_access_strict`](Self::check_access_strict):
    /// cached decisions are not read and every upstream failure is returned.
    pub async fn check_access_batch_strict(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<BTreeMap<String, AccessCheckResult>, GatingError> {
        self.batch(user_id, course_id, EvaluationMode::Strict).await
    }

    async fn batch(
        &self,
        user_id: &str,
        course_id: &str,
        mode: EvaluationMode,
    ) -> Result<BTreeMap<String, AccessCheckResult>, GatingError> {
        let now = self.clock.now();
        let ticket = self.cache.as_ref().map(|c| c.ticket());
        let (structure, user) = tokio::join!(
            self.load_structure(course_id),
            timed(
                "progress oracle",
                self.oracle_timeout,
                self.oracle.get_user_context(user_id, course_id),
            ),
        );
        let (rules, outline) = structure?;

        let mut resources: BTreeSet<ResourceKey> =
            outline.gated_resources().into_iter().collect();
        resources.extend(rules.iter().map(|r| r.resource_key()));

        let user = match user {
            Ok(user) => user,
            Err(e) if mode == EvaluationMode::Lenient => {
                tracing::warn!(
                    user_id,
                    course_id,
                    error = %e,
                    "Batch access check failed; denying"
                );
                let ruled: HashSet<ResourceKey> = rules
                    .iter()
                    .filter(|r| r.active)
                    .map(|r| r.resource_key())
                    .collect();
                return Ok(resources
                    .into_iter()
                    .map(|resource| {
                        let result = if ruled.contains(&resource) {
                            AccessCheckResult::evaluation_error()
                        } else {
                            AccessCheckResult::unrestricted()
                        };
                        (resource.to_string(), result)
                    })
                    .collect());
            }
            Err(e) => return Err(e),
        };
        let snapshot = CourseSnapshot::new(rules, outline, user);

        let mut results = BTreeMap::new();
        for resource in resources {
            if mode == EvaluationMode::Lenient {
                if let Some(cached) = self.cache.as_ref().and_then(|c| c.get(user_id, &resource)) {
                    results.insert(resource.to_string(), cached.result);
                    continue;
                }
            }

            let rules = snapshot.rules_for(&resource);
            let result = if rules.is_empty() {
                AccessCheckResult::unrestricted()
            } else {
                self.decide(&resource, &rules, &snapshot, now)
            };
            if let (Some(cache), Some(ticket)) = (&self.cache, ticket) {
                cache.put(CacheEntry {
                    user_id: user_id.to_string(),
                    resource: resource.clone(),
                    course_id: course_id.to_string(),
                    result: result.clone(),
                    computed_at: now,
                    ticket,
                });
            }
            results.insert(resource.to_string(), result);
        }

        tracing::debug!(user_id, course_id, resources = results.len(), "Batch access check");
        Ok(results)
    }

    /// Course rules, outline and learner context, fetched concurrently under
    /// the configured timeouts.
    pub async fn load_course(
        &self,
        user_id: &str,
        course_id: &str,
    ) -> Result<CourseSnapshot, GatingError> {
        let ((rules, outline), user) = tokio::try_join!(
            self.load_structure(course_id),
            timed(
                "progress oracle",
                self.oracle_timeout,
                self.oracle.get_user_context(user_id, course_id),
            ),
        )?;
        Ok(CourseSnapshot::new(rules, outline, user))
    }

    async fn load_structure(
        &self,
        course_id: &str,
    ) -> Result<(Vec<AccessControl>, CourseOutline), GatingError> {
        tokio::try_join!(
            timed(
                "rule store",
                self.store_timeout,
                self.rules.get_all_active_rules_for_course(course_id),
            ),
            timed(
                "rule store",
                self.store_timeout,
                self.rules.get_course_outline(course_id),
            ),
        )
    }

    /// Evaluate `rules` of `resource` against a loaded course and combine.
    /// Pure apart from logging.
    pub fn decide(
        &self,
        resource: &ResourceKey,
        rules: &[AccessControl],
        snapshot: &CourseSnapshot,
        now: DateTime<Utc>,
    ) -> AccessCheckResult {
        let mut ordered: Vec<&AccessControl> = rules.iter().filter(|r| r.active).collect();
        if ordered.is_empty() {
            return AccessCheckResult::unrestricted();
        }
        ordered.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let partials = ordered
            .into_iter()
            .map(|rule| self.evaluate_rule(resource, rule, snapshot, now))
            .collect();
        combine(partials)
    }

    fn evaluate_rule(
        &self,
        resource: &ResourceKey,
        rule: &AccessControl,
        snapshot: &CourseSnapshot,
        now: DateTime<Utc>,
    ) -> PartialDecision {
        let ctx = EvalContext {
            resource,
            rule,
            user: &snapshot.user,
            outline: &snapshot.outline,
            course_rules: &snapshot.rules,
            graph: &snapshot.graph,
            now,
        };

        let outcome = rule.config().and_then(|config| {
            let evaluator = self.evaluators.get(rule.rule_type).ok_or_else(|| {
                GatingError::InvalidConfiguration {
                    rule_id: rule.id.clone(),
                    message: format!("no evaluator registered for {}", rule.rule_type),
                }
            })?;
            evaluator.evaluate(&config, &ctx)
        });

        match outcome {
            Ok(partial) => partial,
            Err(e) => {
                tracing::warn!(
                    rule_id = %rule.id,
                    course_id = %rule.course_id,
                    resource = %resource,
                    error = %e,
                    "Rule could not be evaluated; failing closed"
                );
                failed_closed()
            }
        }
    }

    /// Drop cached decisions made stale by `event`.
    pub fn apply_event(&self, event: &GatingEvent) -> usize {
        let removed = self.invalidate(&event.scope());
        tracing::debug!(?event, removed, "Applied gating event");
        removed
    }

    pub fn invalidate(&self, scope: &InvalidationScope) -> usize {
        self.cache.as_ref().map_or(0, |c| c.invalidate(scope))
    }

    pub fn purge_expired(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.purge_expired())
    }

    pub fn cached_decisions(&self) -> usize {
        self.cache.as_ref().map_or(0, |c| c.len())
    }

    /// Check every stored rule of a course: cycles, undecodable or unknown
    /// configurations, rules on missing items and dangling prerequisites.
    /// Store failures are returned, not masked.
    pub async fn audit_course(&self, course_id: &str) -> Result<AuditReport, GatingError> {
        let (rules, outline) = self.load_structure(course_id).await?;

        let mut report = AuditReport {
            course_id: course_id.to_string(),
            rules_checked: rules.len(),
            ..Default::default()
        };

        if let Err(GatingError::CycleDetected { path, .. }) =
            graph::validate_course(course_id, &rules)
        {
            report.cycle = Some(path.0.iter().map(|k| k.to_string()).collect());
        }

        for rule in &rules {
            if !outline.contains(&rule.resource_key()) {
                report.orphaned_rules.push(rule.id.clone());
            }
            match rule.config() {
                Err(e) => {
                    report.invalid_rules.insert(rule.id.clone(), e.to_string());
                }
                Ok(AccessControlConfig::Custom(cfg))
                    if !self.evaluators.has_custom(&cfg.condition_name) =>
                {
                    report.invalid_rules.insert(
                        rule.id.clone(),
                        format!("unknown custom rule `{}`", cfg.condition_name),
                    );
                }
                Ok(AccessControlConfig::Prerequisite(cfg)) => {
                    for target in cfg.prerequisites.iter().filter_map(|e| e.target()) {
                        if !outline.contains(&target) {
                            report
                                .dangling_prerequisites
                                .push(format!("{}: {target}", rule.id));
                        }
                    }
                }
                Ok(_) => {}
            }
        }

        if report.is_clean() {
            tracing::debug!(course_id, rules = report.rules_checked, "Course rules consistent");
        } else {
            tracing::warn!(
                course_id,
                cycle = ?report.cycle,
                invalid = report.invalid_rules.len(),
                orphaned = report.orphaned_rules.len(),
                dangling = report.dangling_prerequisites.len(),
                "Course rules need attention"
            );
        }
        Ok(report)
    }
}

fn failed_closed() -> PartialDecision {
    PartialDecision::locked(REASON_EVALUATION_ERROR).with_action(evaluation_error_action())
}

/// AND-combine per-rule decisions. `partials` must be in rule order.
///
/// The combined decision holds until the earliest `valid_until` of any rule.
pub fn combine(partials: Vec<PartialDecision>) -> AccessCheckResult {
    let valid_until = partials.iter().filter_map(|p| p.valid_until).min();
    let unsatisfied: Vec<PartialDecision> = partials.into_iter().filter(|p| !p.satisfied).collect();
    if unsatisfied.is_empty() {
        return AccessCheckResult {
            valid_until,
            ..AccessCheckResult::granted()
        };
    }

    let reason = unsatisfied
        .iter()
        .find_map(|p| p.reason.clone())
        .unwrap_or_else(|| "access restricted".to_string());

    // waiting only helps if every blocking rule resolves with time
    let unlocks_at = if unsatisfied.iter().all(|p| p.unlocks_at.is_some()) {
        unsatisfied.iter().filter_map(|p| p.unlocks_at).min()
    } else {
        None
    };

    let mut seen = HashSet::new();
    let required_actions = unsatisfied
        .into_iter()
        .flat_map(|p| p.required_actions)
        .filter(|a| seen.insert((a.action_type, a.resource_id.clone())))
        .collect();

    AccessCheckResult {
        has_access: false,
        reason: Some(reason),
        unlocks_at,
        required_actions,
        valid_until,
    }
}

async fn timed<T>(
    source_name: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, GatingError>>,
) -> Result<T, GatingError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatingError::Timeout {
            source_name,
            after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gating::cache::InMemoryDecisionCache;
    use crate::gating::clock::ManualClock;
    use crate::gating::memory::{InMemoryProgressOracle, InMemoryRuleStore};
    use crate::gating::types::*;
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        store: Arc<InMemoryRuleStore>,
        oracle: Arc<InMemoryProgressOracle>,
        clock: Arc<ManualClock>,
        engine: GatingEngine,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 9, 1, 9, 0, 0).unwrap()
    }

    fn item(kind: ItemKind, id: &str, parent: Option<&str>, position: i64) -> CourseItem {
        CourseItem {
            kind,
            id: id.into(),
            parent_id: parent.map(String::from),
            position,
        }
    }

    async fn harness() -> Harness {
        let store = Arc::new(InMemoryRuleStore::new());
        let oracle = Arc::new(InMemoryProgressOracle::new());
        let clock = Arc::new(ManualClock::new(start()));

        let mut outline = CourseOutline::new("c1");
        outline.items = vec![
            item(ItemKind::Module, "m1", None, 1),
            item(ItemKind::Module, "m2", None, 2),
            item(ItemKind::Lesson, "l1", Some("m1"), 1),
            item(ItemKind::Lesson, "l2", Some("m1"), 2),
        ];
        store.set_outline(outline).await;

        let cache = Arc::new(InMemoryDecisionCache::new(
            chrono::Duration::seconds(300),
            clock.clone(),
        ));
        let engine = GatingEngine::new(store.clone(), oracle.clone())
            .with_clock(clock.clone())
            .with_cache(cache);
        Harness {
            store,
            oracle,
            clock,
            engine,
        }
    }

    fn rule(id: &str, rt: ResourceType, rid: &str, config: AccessControlConfig) -> AccessControl {
        AccessControl::new(id, rt, rid, "c1", config)
    }

    fn sequential(grace: Option<u32>) -> AccessControlConfig {
        AccessControlConfig::Sequential(SequentialConfig {
            grace_period: grace,
        })
    }

    #[tokio::test]
    async fn test_no_rules_means_access() {
        let h = harness().await;
        let result = h.engine.check_access("u1", ResourceType::Lesson, "l1").await;
        assert!(result.has_access);
        assert_eq!(result.reason.as_deref(), Some(REASON_NO_RESTRICTIONS));
    }

    #[tokio::test]
    async fn test_always_rule_grants() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l1", AccessControlConfig::Always))
            .await;
        let result = h.engine.check_access("u1", ResourceType::Lesson, "l1").await;
        assert!(result.has_access);
        assert_eq!(result.state(), AccessState::Unlocked);
    }

    #[tokio::test]
    async fn test_time_based_unlocks_on_schedule() {
        let h = harness().await;
        let opens = start() + chrono::Duration::hours(6);
        h.store
            .put_rule(rule(
                "r1",
                ResourceType::Lesson,
                "l2",
                AccessControlConfig::TimeBased(TimeBasedConfig {
                    start_date: Some(opens),
                    end_date: None,
                    timezone: "UTC".into(),
                    include_time: true,
                }),
            ))
            .await;

        let locked = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert!(!locked.has_access);
        assert_eq!(locked.unlocks_at, Some(opens));
        assert_eq!(locked.state(), AccessState::Locked);

        // the cached lock is not served past its unlock time
        h.clock.set(opens + chrono::Duration::seconds(1));
        let open = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert!(open.has_access);
    }

    #[tokio::test]
    async fn test_module_sequence_end_to_end() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Module, "m2", sequential(None)))
            .await;
        h.oracle
            .update("u1", "c1", |u| u.enrolled_at = Some(start()))
            .await;

        let before = h.engine.check_access("u1", ResourceType::Module, "m2").await;
        assert!(!before.has_access);
        assert!(before.unlocks_at.is_none());
        assert_eq!(before.state(), AccessState::LockedIndefinite);
        assert_eq!(before.required_actions[0].resource_id.as_deref(), Some("m1"));

        h.oracle
            .update("u1", "c1", |u| {
                u.completion
                    .insert(ResourceKey::module("m1"), ProgressStatus::Completed);
            })
            .await;
        // still the cached lock until the completion is announced
        assert!(!h.engine.check_access("u1", ResourceType::Module, "m2").await.has_access);

        h.engine.apply_event(&GatingEvent::ProgressChanged {
            user_id: "u1".into(),
            course_id: "c1".into(),
            resource_id: "m1".into(),
        });
        let after = h.engine.check_access("u1", ResourceType::Module, "m2").await;
        assert!(after.has_access);
    }

    #[tokio::test]
    async fn test_sequential_grace_period() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l2", sequential(Some(24))))
            .await;
        h.oracle
            .update("u1", "c1", |u| u.enrolled_at = Some(start()))
            .await;

        let locked = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert!(!locked.has_access);
        assert_eq!(locked.unlocks_at, Some(start() + chrono::Duration::hours(24)));

        h.clock.advance(chrono::Duration::hours(24));
        assert!(h.engine.check_access("u1", ResourceType::Lesson, "l2").await.has_access);
    }

    #[tokio::test]
    async fn test_repeated_checks_are_identical_and_cached() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l2", sequential(None)))
            .await;

        let first = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        let reads = h.store.read_count();
        let second = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert_eq!(first, second);
        assert_eq!(h.store.read_count(), reads);
        assert_eq!(h.engine.cached_decisions(), 1);
    }

    #[tokio::test]
    async fn test_malformed_rule_fails_closed() {
        let h = harness().await;
        let mut broken = rule("r1", ResourceType::Lesson, "l1", AccessControlConfig::Always);
        broken.configuration = json!({"type": "TIME_BASED", "startDate": "not a date"});
        let mut mismatched = rule("r2", ResourceType::Lesson, "l2", AccessControlConfig::Always);
        mismatched.rule_type = AccessControlType::UserGroup;
        h.store.put_rule(broken).await;
        h.store.put_rule(mismatched).await;

        for id in ["l1", "l2"] {
            let result = h.engine.check_access("u1", ResourceType::Lesson, id).await;
            assert!(!result.has_access);
            assert_eq!(result.reason.as_deref(), Some(REASON_EVALUATION_ERROR));
            assert!(result.unlocks_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_upstream_failure_lenient_and_strict() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l1", AccessControlConfig::Always))
            .await;
        h.oracle.set_unavailable(true);

        let lenient = h.engine.check_access("u1", ResourceType::Lesson, "l1").await;
        assert_eq!(lenient, AccessCheckResult::evaluation_error());
        assert!(h
            .engine
            .check_access_strict("u1", ResourceType::Lesson, "l1")
            .await
            .unwrap_err()
            .is_upstream());
        // failures are not cached
        assert_eq!(h.engine.cached_decisions(), 0);

        h.oracle.set_unavailable(false);
        assert!(h.engine.check_access("u1", ResourceType::Lesson, "l1").await.has_access);
    }

    #[tokio::test]
    async fn test_slow_oracle_times_out() {
        let h = harness().await;
        let engine = GatingEngine::new(h.store.clone(), h.oracle.clone())
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(20));
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l1", AccessControlConfig::Always))
            .await;
        h.oracle.set_delay(Some(Duration::from_millis(200)));

        let err = engine
            .check_access_strict("u1", ResourceType::Lesson, "l1")
            .await
            .unwrap_err();
        assert!(matches!(err, GatingError::Timeout { source_name: "progress oracle", .. }));
        assert!(!engine.check_access("u1", ResourceType::Lesson, "l1").await.has_access);
    }

    #[tokio::test]
    async fn test_batch_covers_outline() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l2", sequential(None)))
            .await;

        let results = h.engine.check_access_batch("u1", "c1").await.unwrap();
        let keys: Vec<&str> = results.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["LESSON/l1", "LESSON/l2", "MODULE/m1", "MODULE/m2"]);
        assert!(results["LESSON/l1"].has_access);
        assert!(!results["LESSON/l2"].has_access);

        // the batch result agrees with the single check
        let single = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert_eq!(results["LESSON/l2"], single);
    }

    #[tokio::test]
    async fn test_batch_with_oracle_down() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l2", sequential(None)))
            .await;
        h.oracle.set_unavailable(true);

        let results = h.engine.check_access_batch("u1", "c1").await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results["LESSON/l2"], AccessCheckResult::evaluation_error());
        assert_eq!(results["LESSON/l1"], AccessCheckResult::unrestricted());
        assert_eq!(h.engine.cached_decisions(), 0);

        let err = h.engine.check_access_batch_strict("u1", "c1").await.unwrap_err();
        assert!(err.is_upstream());

        // without an outline there is nothing to answer for
        h.store.set_unavailable(true);
        assert!(h.engine.check_access_batch("u1", "c1").await.is_err());
    }

    #[tokio::test]
    async fn test_strict_batch_skips_cache() {
        let h = harness().await;
        h.store
            .put_rule(rule("r1", ResourceType::Lesson, "l2", sequential(None)))
            .await;
        assert!(!h.engine.check_access("u1", ResourceType::Lesson, "l2").await.has_access);

        // unannounced completion: only the strict batch sees it
        h.oracle
            .update("u1", "c1", |u| {
                u.completion
                    .insert(ResourceKey::lesson("l1"), ProgressStatus::Completed);
            })
            .await;
        let lenient = h.engine.check_access_batch("u1", "c1").await.unwrap();
        assert!(!lenient["LESSON/l2"].has_access);
        let strict = h.engine.check_access_batch_strict("u1", "c1").await.unwrap();
        assert!(strict["LESSON/l2"].has_access);
    }

    #[tokio::test]
    async fn test_cached_grant_expires_with_window() {
        let h = harness().await;
        // well inside the five minute cache TTL
        let closes = start() + chrono::Duration::minutes(2);
        h.store
            .put_rule(rule(
                "r1",
                ResourceType::Lesson,
                "l2",
                AccessControlConfig::TimeBased(TimeBasedConfig {
                    start_date: None,
                    end_date: Some(closes),
                    timezone: "UTC".into(),
                    include_time: true,
                }),
            ))
            .await;

        let open = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert!(open.has_access);
        assert_eq!(h.engine.cached_decisions(), 1);

        h.clock.set(closes + chrono::Duration::minutes(1));
        let closed = h.engine.check_access("u1", ResourceType::Lesson, "l2").await;
        assert!(!closed.has_access);
        assert!(closed.reason.unwrap().starts_with("Access closed"));
    }

    #[tokio::test]
    async fn test_audit_reports_stored_inconsistencies() {
        let h = harness().await;
        let requires = |id: &str| {
            AccessControlConfig::Prerequisite(PrerequisiteConfig {
                prerequisites: vec![PrerequisiteEdge {
                    prerequisite_type: PrerequisiteType::Lesson,
                    prerequisite_id: id.into(),
                    required_status: RequiredStatus::Completed,
                }],
                require_all: true,
            })
        };
        // written straight to the store, bypassing write-time validation
        h.store.put_rule(rule("r1", ResourceType::Lesson, "l1", requires("l2"))).await;
        h.store.put_rule(rule("r2", ResourceType::Lesson, "l2", requires("l1"))).await;
        h.store
            .put_rule(rule("r3", ResourceType::Module, "m2", requires("gone")))
            .await;
        h.store
            .put_rule(rule(
                "r4",
                ResourceType::Lesson,
                "ghost",
                AccessControlConfig::Custom(CustomConfig {
                    condition_name: "moon-phase".into(),
                    parameters: json!({}),
                }),
            ))
            .await;

        let report = h.engine.audit_course("c1").await.unwrap();
        assert!(!report.is_clean());
        assert!(report.cycle.is_some());
        assert_eq!(report.orphaned_rules, vec!["r4".to_string()]);
        assert_eq!(report.dangling_prerequisites, vec!["r3: LESSON/gone".to_string()]);
        assert!(report.invalid_rules.contains_key("r4"));

        // cycle members fail closed at evaluation time too
        let result = h.engine.check_access("u1", ResourceType::Lesson, "l1").await;
        assert_eq!(result.reason.as_deref(), Some(REASON_EVALUATION_ERROR));
    }

    #[test]
    fn test_combine_takes_earliest_unlock_and_dedups() {
        let t1 = start();
        let t2 = start() + chrono::Duration::days(1);
        let wait = RequiredAction::new(RequiredActionType::Wait, "wait");
        let partials = vec![
            PartialDecision::satisfied(),
            PartialDecision::locked("first").with_unlock(t2).with_action(wait.clone()),
            PartialDecision::locked("second").with_unlock(t1).with_action(wait),
        ];
        let result = combine(partials);
        assert!(!result.has_access);
        assert_eq!(result.reason.as_deref(), Some("first"));
        assert_eq!(result.unlocks_at, Some(t1));
        assert_eq!(result.required_actions.len(), 1);

        // one rule that waiting cannot resolve makes the whole lock indefinite
        let partials = vec![
            PartialDecision::locked("later").with_unlock(t1),
            PartialDecision::locked("join").with_action(
                RequiredAction::new(RequiredActionType::JoinGroup, "join")
                    .on(TargetType::Group, "g1"),
            ),
        ];
        let result = combine(partials);
        assert!(result.unlocks_at.is_none());
        assert_eq!(result.state(), AccessState::LockedIndefinite);

        // a grant lasts only as long as its shortest-lived rule
        let partials = vec![
            PartialDecision::satisfied().until(t2),
            PartialDecision::satisfied(),
            PartialDecision::satisfied().until(t1),
        ];
        let result = combine(partials);
        assert!(result.has_access);
        assert_eq!(result.valid_until, Some(t1));
    }
}
