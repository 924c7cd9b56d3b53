use coursegate::gating::{
    AccessControl, AccessControlConfig, CourseItem, CourseOutline, ItemKind, NewRuleRequest,
    PrerequisiteConfig, PrerequisiteEdge, PrerequisiteType, RequiredStatus, ResourceType,
    SequentialConfig,
};
use coursegate::storage;
use sea_orm::DatabaseConnection;

/// Builder for creating test access rules
pub struct RuleBuilder {
    resource_type: ResourceType,
    resource_id: String,
    course_id: String,
    created_by_id: String,
    configuration: AccessControlConfig,
}

impl RuleBuilder {
    pub fn new(resource_type: ResourceType, resource_id: &str) -> Self {
        Self {
            resource_type,
            resource_id: resource_id.to_string(),
            course_id: "course-1".to_string(),
            created_by_id: "instructor-1".to_string(),
            configuration: AccessControlConfig::Always,
        }
    }

    pub fn lesson(resource_id: &str) -> Self {
        Self::new(ResourceType::Lesson, resource_id)
    }

    pub fn module(resource_id: &str) -> Self {
        Self::new(ResourceType::Module, resource_id)
    }

    pub fn in_course(mut self, course_id: &str) -> Self {
        self.course_id = course_id.to_string();
        self
    }

    pub fn config(mut self, configuration: AccessControlConfig) -> Self {
        self.configuration = configuration;
        self
    }

    pub fn sequential(self, grace_hours: Option<u32>) -> Self {
        self.config(AccessControlConfig::Sequential(SequentialConfig {
            grace_period: grace_hours,
        }))
    }

    /// Requires the given lesson to be completed
    pub fn after_lesson(self, lesson_id: &str) -> Self {
        self.config(AccessControlConfig::Prerequisite(PrerequisiteConfig {
            prerequisites: vec![PrerequisiteEdge {
                prerequisite_type: PrerequisiteType::Lesson,
                prerequisite_id: lesson_id.to_string(),
                required_status: RequiredStatus::Completed,
            }],
            require_all: true,
        }))
    }

    pub fn request(self) -> NewRuleRequest {
        NewRuleRequest {
            resource_type: self.resource_type,
            resource_id: self.resource_id,
            course_id: self.course_id,
            created_by_id: self.created_by_id,
            configuration: self.configuration,
        }
    }

    pub async fn create(self, db: &DatabaseConnection) -> AccessControl {
        storage::create_rule(db, self.request())
            .await
            .expect("Failed to create test rule")
    }
}

/// Builder for creating test course outlines
pub struct OutlineBuilder {
    outline: CourseOutline,
}

impl OutlineBuilder {
    pub fn new(course_id: &str) -> Self {
        Self {
            outline: CourseOutline::new(course_id),
        }
    }

    fn item(mut self, kind: ItemKind, id: &str, parent: Option<&str>, position: i64) -> Self {
        self.outline.items.push(CourseItem {
            kind,
            id: id.to_string(),
            parent_id: parent.map(String::from),
            position,
        });
        self
    }

    pub fn module(self, id: &str, position: i64) -> Self {
        self.item(ItemKind::Module, id, None, position)
    }

    pub fn lesson(self, id: &str, module_id: &str, position: i64) -> Self {
        self.item(ItemKind::Lesson, id, Some(module_id), position)
    }

    pub fn quiz(self, id: &str, module_id: &str, position: i64) -> Self {
        self.item(ItemKind::Quiz, id, Some(module_id), position)
    }

    pub fn build(self) -> CourseOutline {
        self.outline
    }

    pub async fn create(self, db: &DatabaseConnection) -> CourseOutline {
        let outline = self.build();
        storage::replace_course_outline(db, &outline)
            .await
            .expect("Failed to store test outline");
        outline
    }
}

/// Two modules of two lessons each, plus a quiz closing the first module.
pub fn two_module_course(course_id: &str) -> OutlineBuilder {
    OutlineBuilder::new(course_id)
        .module("m1", 1)
        .lesson("l1", "m1", 1)
        .lesson("l2", "m1", 2)
        .quiz("q1", "m1", 3)
        .module("m2", 2)
        .lesson("l3", "m2", 1)
        .lesson("l4", "m2", 2)
}
