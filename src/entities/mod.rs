pub mod access_control;
pub mod course_item;
pub mod enrollment;
pub mod group_membership;
pub mod job_execution;
pub mod progress;

pub use access_control::Entity as AccessControl;
pub use course_item::Entity as CourseItem;
pub use enrollment::Entity as Enrollment;
pub use group_membership::Entity as GroupMembership;
pub use job_execution::Entity as JobExecution;
pub use progress::Entity as Progress;
