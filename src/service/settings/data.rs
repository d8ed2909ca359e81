use async_trait::async_trait;

use super::GlobalConfig;
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    async fn global_config(&self) -> Result<Option<GlobalConfig>>;

    async fn put_global_config(&self, config: &GlobalConfig) -> Result<()>;
}
