use async_trait::async_trait;

use crate::error::Result;

/// Read-only view of the observed page's scripting context.
#[async_trait]
pub trait PageProbe: Send + Sync + 'static {
    /// Serialized DOM of the whole document.
    async fn outer_html(&self) -> Result<String>;

    /// Raw session-storage entry, None when absent.
    async fn session_storage(&self, key: &str) -> Result<Option<String>>;
}
