pub mod builders;
pub mod db;

pub use builders::{OutlineBuilder, RuleBuilder};
pub use db::TestDb;
