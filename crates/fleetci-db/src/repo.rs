//! PostgreSQL repositories.

pub mod credential;
pub mod cron;
pub mod settings;

pub use credential::PgCredentialRepo;
pub use cron::PgCronRepo;
pub use settings::PgSettingsRepo;
