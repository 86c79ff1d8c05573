pub mod config;
pub mod pagination;
pub mod types;

pub use config::Config;
pub use pagination::{ListParams, Page, QueryPlan, SortOrder};
pub use types::*;
