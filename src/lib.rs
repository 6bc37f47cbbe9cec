pub mod engine;
mod error;
pub mod fixups;
pub mod logging;
pub mod migration;

pub use error::{AppError, AppResult};
pub use migration::{
    migrate_accounts, migrate_accounts_if_needed, MigrationOptions, MigrationReport,
};
