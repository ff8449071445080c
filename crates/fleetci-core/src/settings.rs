//! System settings read by the core.

use async_trait::async_trait;

use crate::Result;

/// Settings key holding the IANA timezone used for cron schedules.
pub const TIMEZONE_SETTING: &str = "timezone";

/// Timezone used when none is configured.
pub const DEFAULT_TIMEZONE: &str = "UTC";

#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<()>;
}
