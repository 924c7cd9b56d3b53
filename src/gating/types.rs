use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::gating::errors::GatingError;

/// Kind of resource an access rule can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceType {
    Module,
    Lesson,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Module => "MODULE",
            ResourceType::Lesson => "LESSON",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MODULE" => Some(ResourceType::Module),
            "LESSON" => Some(ResourceType::Lesson),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of item in a course outline. Quizzes can be prerequisites but never
/// carry rules themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ItemKind {
    Module,
    Lesson,
    Quiz,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Module => "MODULE",
            ItemKind::Lesson => "LESSON",
            ItemKind::Quiz => "QUIZ",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MODULE" => Some(ItemKind::Module),
            "LESSON" => Some(ItemKind::Lesson),
            "QUIZ" => Some(ItemKind::Quiz),
            _ => None,
        }
    }
}

impl From<ResourceType> for ItemKind {
    fn from(value: ResourceType) -> Self {
        match value {
            ResourceType::Module => ItemKind::Module,
            ResourceType::Lesson => ItemKind::Lesson,
        }
    }
}

/// Reference to an outline item: "KIND/id" e.g. "LESSON/l-42"
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: ItemKind,
    pub id: String,
}

impl ResourceKey {
    pub fn new(kind: ItemKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn module(id: impl Into<String>) -> Self {
        Self::new(ItemKind::Module, id)
    }

    pub fn lesson(id: impl Into<String>) -> Self {
        Self::new(ItemKind::Lesson, id)
    }

    pub fn quiz(id: impl Into<String>) -> Self {
        Self::new(ItemKind::Quiz, id)
    }

    pub fn parse(s: &str) -> Option<Self> {
        let (kind, id) = s.split_once('/')?;
        if id.is_empty() {
            return None;
        }
        Some(Self::new(ItemKind::parse(kind)?, id))
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

// ---------- Rule configuration (persisted wire contract) ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessControlType {
    TimeBased,
    Sequential,
    Prerequisite,
    EnrollmentDuration,
    UserGroup,
    Custom,
    Always,
}

impl AccessControlType {
    pub const ALL: [AccessControlType; 7] = [
        AccessControlType::TimeBased,
        AccessControlType::Sequential,
        AccessControlType::Prerequisite,
        AccessControlType::EnrollmentDuration,
        AccessControlType::UserGroup,
        AccessControlType::Custom,
        AccessControlType::Always,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessControlType::TimeBased => "TIME_BASED",
            AccessControlType::Sequential => "SEQUENTIAL",
            AccessControlType::Prerequisite => "PREREQUISITE",
            AccessControlType::EnrollmentDuration => "ENROLLMENT_DURATION",
            AccessControlType::UserGroup => "USER_GROUP",
            AccessControlType::Custom => "CUSTOM",
            AccessControlType::Always => "ALWAYS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for AccessControlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged union stored as JSON next to each rule. The `type` field must
/// agree with the rule's own `type` column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessControlConfig {
    TimeBased(TimeBasedConfig),
    Sequential(SequentialConfig),
    Prerequisite(PrerequisiteConfig),
    EnrollmentDuration(EnrollmentDurationConfig),
    UserGroup(UserGroupConfig),
    Custom(CustomConfig),
    Always,
}

impl AccessControlConfig {
    pub fn rule_type(&self) -> AccessControlType {
        match self {
            AccessControlConfig::TimeBased(_) => AccessControlType::TimeBased,
            AccessControlConfig::Sequential(_) => AccessControlType::Sequential,
            AccessControlConfig::Prerequisite(_) => AccessControlType::Prerequisite,
            AccessControlConfig::EnrollmentDuration(_) => AccessControlType::EnrollmentDuration,
            AccessControlConfig::UserGroup(_) => AccessControlType::UserGroup,
            AccessControlConfig::Custom(_) => AccessControlType::Custom,
            AccessControlConfig::Always => AccessControlType::Always,
        }
    }

    /// Checks serde cannot express. Run before a rule is written; evaluators
    /// still fail closed on anything that slips through.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AccessControlConfig::TimeBased(c) => {
                if let (Some(start), Some(end)) = (c.start_date, c.end_date) {
                    if start > end {
                        return Err("startDate must not be after endDate".to_string());
                    }
                }
                c.timezone
                    .parse::<chrono_tz::Tz>()
                    .map_err(|_| format!("unknown timezone `{}`", c.timezone))?;
            }
            AccessControlConfig::Prerequisite(c) => {
                if c.prerequisites.iter().any(|e| e.prerequisite_id.trim().is_empty()) {
                    return Err("prerequisiteId must not be empty".to_string());
                }
            }
            AccessControlConfig::EnrollmentDuration(c) => {
                if c.max_days.is_some_and(|max| max < c.min_days) {
                    return Err("maxDays must not be below minDays".to_string());
                }
                if c.min_days.max(c.max_days.unwrap_or(0)) > MAX_ENROLLMENT_DAYS {
                    return Err(format!(
                        "minDays and maxDays must not exceed {MAX_ENROLLMENT_DAYS}"
                    ));
                }
            }
            AccessControlConfig::Sequential(c) => {
                if c.grace_period.is_some_and(|h| h > MAX_GRACE_HOURS) {
                    return Err(format!("gracePeriod must not exceed {MAX_GRACE_HOURS} hours"));
                }
            }
            AccessControlConfig::UserGroup(c) => {
                if c.group_ids.iter().any(|g| g.trim().is_empty()) {
                    return Err("groupIds must not contain empty ids".to_string());
                }
            }
            AccessControlConfig::Custom(c) => {
                if c.condition_name.trim().is_empty() {
                    return Err("conditionName must not be empty".to_string());
                }
            }
            AccessControlConfig::Always => {}
        }
        Ok(())
    }
}

/// Upper bound for ENROLLMENT_DURATION day counts (100 years).
pub const MAX_ENROLLMENT_DAYS: u32 = 36_500;
/// Upper bound for a SEQUENTIAL grace period (10 years).
pub const MAX_GRACE_HOURS: u32 = 87_600;

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_true() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeBasedConfig {
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// IANA zone name used for date-only comparisons
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// When false, only the calendar date (in `timezone`) is compared
    #[serde(default = "default_true")]
    pub include_time: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequentialConfig {
    /// Hours after the predecessor became available before this item opens
    /// even without completion.
    #[serde(default)]
    pub grace_period: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PrerequisiteType {
    Module,
    Lesson,
    Quiz,
    Enrollment,
}

impl PrerequisiteType {
    /// Outline kind of the prerequisite target; `None` for enrollment edges,
    /// which point at a course rather than an outline item.
    pub fn item_kind(&self) -> Option<ItemKind> {
        match self {
            PrerequisiteType::Module => Some(ItemKind::Module),
            PrerequisiteType::Lesson => Some(ItemKind::Lesson),
            PrerequisiteType::Quiz => Some(ItemKind::Quiz),
            PrerequisiteType::Enrollment => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredStatus {
    #[default]
    Completed,
    Started,
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteEdge {
    pub prerequisite_type: PrerequisiteType,
    pub prerequisite_id: String,
    #[serde(default)]
    pub required_status: RequiredStatus,
}

impl PrerequisiteEdge {
    pub fn target(&self) -> Option<ResourceKey> {
        self.prerequisite_type
            .item_kind()
            .map(|kind| ResourceKey::new(kind, self.prerequisite_id.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrerequisiteConfig {
    pub prerequisites: Vec<PrerequisiteEdge>,
    #[serde(default = "default_true")]
    pub require_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentDurationConfig {
    #[serde(default)]
    pub min_days: u32,
    #[serde(default)]
    pub max_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserGroupConfig {
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub require_all: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub condition_name: String,
    #[serde(default = "empty_object")]
    pub parameters: Value,
}

// ---------- Rules ----------

/// One gating rule attached to exactly one module or lesson.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessControl {
    pub id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub course_id: String,
    #[serde(rename = "type")]
    pub rule_type: AccessControlType,
    pub active: bool,
    /// Raw JSON as persisted; decoded lazily so a malformed row locks its
    /// resource instead of disappearing.
    pub configuration: Value,
    pub created_by_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AccessControl {
    pub fn new(
        id: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        course_id: impl Into<String>,
        config: AccessControlConfig,
    ) -> Self {
        let rule_type = config.rule_type();
        Self {
            id: id.into(),
            resource_type,
            resource_id: resource_id.into(),
            course_id: course_id.into(),
            rule_type,
            active: true,
            configuration: serde_json::to_value(&config).unwrap_or(Value::Null),
            created_by_id: "system".to_string(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
        }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type.into(), self.resource_id.clone())
    }

    /// Decode the configuration and check its discriminant against the
    /// declared rule type.
    pub fn config(&self) -> Result<AccessControlConfig, GatingError> {
        let config: AccessControlConfig = serde_json::from_value(self.configuration.clone())
            .map_err(|e| GatingError::InvalidConfiguration {
                rule_id: self.id.clone(),
                message: e.to_string(),
            })?;
        if config.rule_type() != self.rule_type {
            return Err(GatingError::ConfigurationMismatch {
                rule_id: self.id.clone(),
                declared: self.rule_type,
                found: config.rule_type(),
            });
        }
        Ok(config)
    }
}

// ---------- Course outline ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseItem {
    #[serde(rename = "itemType")]
    pub kind: ItemKind,
    pub id: String,
    /// Owning module for lessons and quizzes; `None` at course level
    pub parent_id: Option<String>,
    pub position: i64,
}

impl CourseItem {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind, self.id.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseOutline {
    pub course_id: String,
    pub items: Vec<CourseItem>,
}

impl CourseOutline {
    pub fn new(course_id: impl Into<String>) -> Self {
        Self {
            course_id: course_id.into(),
            items: Vec::new(),
        }
    }

    pub fn find(&self, key: &ResourceKey) -> Option<&CourseItem> {
        self.items
            .iter()
            .find(|item| item.kind == key.kind && item.id == key.id)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.find(key).is_some()
    }

    /// The sibling immediately before `key`: same kind, same parent, ordered
    /// by position then id.
    pub fn predecessor(&self, key: &ResourceKey) -> Option<&CourseItem> {
        let item = self.find(key)?;
        let mut siblings: Vec<&CourseItem> = self
            .items
            .iter()
            .filter(|s| s.kind == item.kind && s.parent_id == item.parent_id)
            .collect();
        siblings.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        let index = siblings.iter().position(|s| s.id == item.id)?;
        index.checked_sub(1).map(|i| siblings[i])
    }

    /// Modules and lessons, the items rules can gate, in outline order.
    pub fn gated_resources(&self) -> Vec<ResourceKey> {
        let mut items: Vec<&CourseItem> = self
            .items
            .iter()
            .filter(|i| i.kind != ItemKind::Quiz)
            .collect();
        items.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| a.position.cmp(&b.position))
                .then_with(|| a.id.cmp(&b.id))
        });
        items.into_iter().map(CourseItem::key).collect()
    }

    pub fn lessons(&self) -> impl Iterator<Item = &CourseItem> {
        self.items.iter().filter(|i| i.kind == ItemKind::Lesson)
    }
}

// ---------- Learner state ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    #[default]
    NotStarted,
    Started,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "NOT_STARTED",
            ProgressStatus::Started => "STARTED",
            ProgressStatus::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NOT_STARTED" => Some(ProgressStatus::NotStarted),
            "STARTED" => Some(ProgressStatus::Started),
            "COMPLETED" => Some(ProgressStatus::Completed),
            _ => None,
        }
    }

    pub fn meets(&self, required: RequiredStatus) -> bool {
        match required {
            RequiredStatus::Completed => *self == ProgressStatus::Completed,
            RequiredStatus::Started => *self != ProgressStatus::NotStarted,
            RequiredStatus::Any => true,
        }
    }
}

/// Everything the evaluators know about one learner within one course.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserContext {
    pub user_id: String,
    pub course_id: String,
    pub enrolled_at: Option<DateTime<Utc>>,
    pub group_ids: BTreeSet<String>,
    pub enrolled_course_ids: BTreeSet<String>,
    pub completion: HashMap<ResourceKey, ProgressStatus>,
    /// quiz id -> best score in percent
    pub quiz_scores: HashMap<String, f64>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, course_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            course_id: course_id.into(),
            ..Default::default()
        }
    }

    pub fn status_of(&self, key: &ResourceKey) -> ProgressStatus {
        self.completion.get(key).copied().unwrap_or_default()
    }
}

// ---------- Decisions ----------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequiredActionType {
    Complete,
    Start,
    Enroll,
    JoinGroup,
    Wait,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TargetType {
    Module,
    Lesson,
    Quiz,
    Course,
    Group,
}

impl From<ItemKind> for TargetType {
    fn from(value: ItemKind) -> Self {
        match value {
            ItemKind::Module => TargetType::Module,
            ItemKind::Lesson => TargetType::Lesson,
            ItemKind::Quiz => TargetType::Quiz,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredAction {
    #[serde(rename = "type")]
    pub action_type: RequiredActionType,
    pub resource_id: Option<String>,
    pub resource_type: Option<TargetType>,
    pub description: String,
}

impl RequiredAction {
    pub fn new(action_type: RequiredActionType, description: impl Into<String>) -> Self {
        Self {
            action_type,
            resource_id: None,
            resource_type: None,
            description: description.into(),
        }
    }

    pub fn on(mut self, resource_type: TargetType, resource_id: impl Into<String>) -> Self {
        self.resource_type = Some(resource_type);
        self.resource_id = Some(resource_id.into());
        self
    }
}

/// Output of a single evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct PartialDecision {
    pub satisfied: bool,
    pub reason: Option<String>,
    /// Set only when waiting alone resolves the lock
    pub unlocks_at: Option<DateTime<Utc>>,
    /// First instant at which this outcome no longer holds without any
    /// event, e.g. the close of a time window
    pub valid_until: Option<DateTime<Utc>>,
    pub required_actions: Vec<RequiredAction>,
}

impl PartialDecision {
    pub fn satisfied() -> Self {
        Self {
            satisfied: true,
            reason: None,
            unlocks_at: None,
            valid_until: None,
            required_actions: Vec::new(),
        }
    }

    pub fn locked(reason: impl Into<String>) -> Self {
        Self {
            satisfied: false,
            reason: Some(reason.into()),
            unlocks_at: None,
            valid_until: None,
            required_actions: Vec::new(),
        }
    }

    pub fn until(mut self, at: DateTime<Utc>) -> Self {
        self.valid_until = Some(at);
        self
    }

    pub fn with_unlock(mut self, at: DateTime<Utc>) -> Self {
        self.unlocks_at = Some(at);
        self
    }

    pub fn with_action(mut self, action: RequiredAction) -> Self {
        self.required_actions.push(action);
        self
    }
}

pub const REASON_NO_RESTRICTIONS: &str = "no restrictions";
pub const REASON_EVALUATION_ERROR: &str = "evaluation error";

/// The engine's answer for one (user, resource) pair. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessCheckResult {
    pub has_access: bool,
    pub reason: Option<String>,
    pub unlocks_at: Option<DateTime<Utc>>,
    pub required_actions: Vec<RequiredAction>,
    /// Instant at which a time boundary invalidates this decision. Used by
    /// the cache only; not part of the response.
    #[serde(skip)]
    pub valid_until: Option<DateTime<Utc>>,
}

impl AccessCheckResult {
    pub fn granted() -> Self {
        Self {
            has_access: true,
            reason: None,
            unlocks_at: None,
            required_actions: Vec::new(),
            valid_until: None,
        }
    }

    pub fn unrestricted() -> Self {
        Self {
            reason: Some(REASON_NO_RESTRICTIONS.to_string()),
            ..Self::granted()
        }
    }

    pub fn evaluation_error() -> Self {
        Self {
            has_access: false,
            reason: Some(REASON_EVALUATION_ERROR.to_string()),
            unlocks_at: None,
            required_actions: vec![evaluation_error_action()],
            valid_until: None,
        }
    }

    pub fn state(&self) -> AccessState {
        match (self.has_access, self.unlocks_at) {
            (true, _) => AccessState::Unlocked,
            (false, Some(_)) => AccessState::Locked,
            (false, None) => AccessState::LockedIndefinite,
        }
    }
}

pub(crate) fn evaluation_error_action() -> RequiredAction {
    RequiredAction::new(
        RequiredActionType::Other,
        "Access to this content could not be evaluated; contact your instructor",
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessState {
    Locked,
    LockedIndefinite,
    Unlocked,
}

/// Lenient callers always get a decision; strict callers (audits) get
/// upstream failures back as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluationMode {
    #[default]
    Lenient,
    Strict,
}

// ---------- API request/response types ----------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    #[serde(flatten)]
    pub result: AccessCheckResult,
    pub state: AccessState,
}

impl From<AccessCheckResult> for CheckResponse {
    fn from(result: AccessCheckResult) -> Self {
        let state = result.state();
        Self { result, state }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub user_id: String,
    pub course_id: String,
    pub resources: BTreeMap<String, AccessCheckResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRuleRequest {
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub course_id: String,
    pub created_by_id: String,
    pub configuration: AccessControlConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRuleRequest {
    pub configuration: AccessControlConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub valid: bool,
    pub cycle: Option<Vec<String>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_key_parse() {
        let k = ResourceKey::parse("LESSON/l-1").unwrap();
        assert_eq!(k, ResourceKey::lesson("l-1"));
        assert_eq!(k.to_string(), "LESSON/l-1");

        assert!(ResourceKey::parse("lesson/l-1").is_none());
        assert!(ResourceKey::parse("LESSON/").is_none());
        assert!(ResourceKey::parse("noslash").is_none());
    }

    #[test]
    fn test_config_wire_format() {
        let raw = json!({
            "type": "PREREQUISITE",
            "prerequisites": [
                {
                    "prerequisiteType": "MODULE",
                    "prerequisiteId": "m1",
                    "requiredStatus": "STARTED"
                },
                { "prerequisiteType": "QUIZ", "prerequisiteId": "q1" }
            ]
        });
        let config: AccessControlConfig = serde_json::from_value(raw).unwrap();
        let AccessControlConfig::Prerequisite(p) = config else {
            panic!("expected prerequisite config");
        };
        assert!(p.require_all);
        assert_eq!(p.prerequisites[0].required_status, RequiredStatus::Started);
        assert_eq!(p.prerequisites[1].required_status, RequiredStatus::Completed);
        assert_eq!(p.prerequisites[1].target(), Some(ResourceKey::quiz("q1")));
    }

    #[test]
    fn test_config_defaults() {
        let config: AccessControlConfig = serde_json::from_value(json!({
            "type": "TIME_BASED",
            "startDate": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        let AccessControlConfig::TimeBased(t) = config else {
            panic!("expected time based config");
        };
        assert_eq!(t.timezone, "UTC");
        assert!(t.include_time);
        assert!(t.end_date.is_none());

        let always: AccessControlConfig =
            serde_json::from_value(json!({ "type": "ALWAYS" })).unwrap();
        assert_eq!(always, AccessControlConfig::Always);
        assert_eq!(serde_json::to_value(&always).unwrap(), json!({ "type": "ALWAYS" }));
    }

    #[test]
    fn test_config_discriminant_mismatch() {
        let mut rule = AccessControl::new(
            "r1",
            ResourceType::Lesson,
            "l1",
            "c1",
            AccessControlConfig::Sequential(SequentialConfig::default()),
        );
        assert!(rule.config().is_ok());

        rule.rule_type = AccessControlType::TimeBased;
        let err = rule.config().unwrap_err();
        assert!(matches!(err, GatingError::ConfigurationMismatch { .. }));

        rule.configuration = json!({ "type": "USER_GROUP" });
        rule.rule_type = AccessControlType::UserGroup;
        let err = rule.config().unwrap_err();
        assert!(matches!(err, GatingError::InvalidConfiguration { .. }));
    }

    #[test]
    fn test_config_validate() {
        let bad_zone: AccessControlConfig =
            serde_json::from_value(json!({"type": "TIME_BASED", "timezone": "Mars/Olympus"}))
                .unwrap();
        assert!(bad_zone.validate().unwrap_err().contains("Mars/Olympus"));

        let inverted: AccessControlConfig = serde_json::from_value(json!({
            "type": "TIME_BASED",
            "startDate": "2026-06-01T00:00:00Z",
            "endDate": "2026-05-01T00:00:00Z"
        }))
        .unwrap();
        assert!(inverted.validate().is_err());

        let window: AccessControlConfig = serde_json::from_value(json!({
            "type": "ENROLLMENT_DURATION",
            "minDays": 7,
            "maxDays": 3
        }))
        .unwrap();
        assert!(window.validate().is_err());

        assert!(AccessControlConfig::Always.validate().is_ok());
    }

    #[test]
    fn test_config_validate_bounds() {
        let huge_min = AccessControlConfig::EnrollmentDuration(EnrollmentDurationConfig {
            min_days: u32::MAX,
            max_days: None,
        });
        assert!(huge_min.validate().unwrap_err().contains("minDays"));

        let huge_max = AccessControlConfig::EnrollmentDuration(EnrollmentDurationConfig {
            min_days: 0,
            max_days: Some(MAX_ENROLLMENT_DAYS + 1),
        });
        assert!(huge_max.validate().is_err());

        let at_limit = AccessControlConfig::EnrollmentDuration(EnrollmentDurationConfig {
            min_days: MAX_ENROLLMENT_DAYS,
            max_days: Some(MAX_ENROLLMENT_DAYS),
        });
        assert!(at_limit.validate().is_ok());

        let long_grace = AccessControlConfig::Sequential(SequentialConfig {
            grace_period: Some(u32::MAX),
        });
        assert!(long_grace.validate().unwrap_err().contains("gracePeriod"));
        let grace = AccessControlConfig::Sequential(SequentialConfig {
            grace_period: Some(24),
        });
        assert!(grace.validate().is_ok());
    }

    #[test]
    fn test_progress_meets_required_status() {
        use ProgressStatus::*;
        assert!(Completed.meets(RequiredStatus::Completed));
        assert!(!Started.meets(RequiredStatus::Completed));
        assert!(Started.meets(RequiredStatus::Started));
        assert!(Completed.meets(RequiredStatus::Started));
        assert!(!NotStarted.meets(RequiredStatus::Started));
        assert!(NotStarted.meets(RequiredStatus::Any));
    }

    #[test]
    fn test_outline_predecessor() {
        let mut outline = CourseOutline::new("c1");
        for (kind, id, parent, pos) in [
            (ItemKind::Module, "m2", None, 2),
            (ItemKind::Module, "m1", None, 1),
            (ItemKind::Lesson, "l1", Some("m1"), 1),
            (ItemKind::Lesson, "l2", Some("m1"), 2),
            (ItemKind::Lesson, "l3", Some("m2"), 1),
        ] {
            outline.items.push(CourseItem {
                kind,
                id: id.into(),
                parent_id: parent.map(String::from),
                position: pos,
            });
        }

        assert_eq!(outline.predecessor(&ResourceKey::module("m2")).unwrap().id, "m1");
        assert!(outline.predecessor(&ResourceKey::module("m1")).is_none());
        assert_eq!(outline.predecessor(&ResourceKey::lesson("l2")).unwrap().id, "l1");
        // first lesson of the second module starts its own sequence
        assert!(outline.predecessor(&ResourceKey::lesson("l3")).is_none());
        assert!(outline.predecessor(&ResourceKey::lesson("missing")).is_none());

        let gated: Vec<String> = outline
            .gated_resources()
            .iter()
            .map(|k| k.to_string())
            .collect();
        assert_eq!(gated, vec!["MODULE/m1", "MODULE/m2", "LESSON/l1", "LESSON/l3", "LESSON/l2"]);
    }

    #[test]
    fn test_result_state() {
        assert_eq!(AccessCheckResult::unrestricted().state(), AccessState::Unlocked);
        assert_eq!(
            AccessCheckResult::evaluation_error().state(),
            AccessState::LockedIndefinite
        );
        let locked = AccessCheckResult {
            has_access: false,
            reason: Some("not yet".into()),
            unlocks_at: Some(Utc::now()),
            required_actions: vec![],
            valid_until: None,
        };
        assert_eq!(locked.state(), AccessState::Locked);
    }
}
