//! Entity store: descriptor-driven persistence on PostgreSQL.
//!
//! Entities are declared once (tables, keys, columns, relationships, permissions) and
//! served through uniform services: CRUD with upsert, nested inserts in one unit of
//! work, flat filter queries compiled to joins, and group-based access control.

pub mod config;
pub mod error;
pub mod migration;
pub mod permission;
pub mod query;
pub mod service;
pub mod session;
pub mod sql;
pub mod state;
pub mod store;

#[cfg(test)]
mod fixtures;

pub use config::{from_json_str, load_from_file, resolve, ModelConfig, ResolvedModel, Settings};
pub use error::{AppError, ConfigError, ErrorKind};
pub use migration::create_all;
pub use permission::Caller;
pub use query::{FilterQuery, QueryParams};
pub use service::{CompositeEntityService, DatabaseService, InsertPlan, UnaryEntityService};
pub use session::{run as with_unit_of_work, Scope, UnitOfWork};
pub use state::{AppState, ServiceRegistry};
pub use store::{create_list_group, ensure_database_exists, ensure_sys_tables, list_group_members};
