use async_trait::async_trait;

use super::{from_document, to_document};
use crate::{
    database::Database,
    service::settings::{Data, GlobalConfig},
    Result,
};

const GLOBAL_CONFIG: &str = "global_config";
/// The singleton row id.
const DEFAULT_ID: &str = "default";

#[async_trait]
impl Data for Database {
    async fn global_config(&self) -> Result<Option<GlobalConfig>> {
        self.engine
            .get(GLOBAL_CONFIG, DEFAULT_ID)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn put_global_config(&self, config: &GlobalConfig) -> Result<()> {
        self.engine
            .put(GLOBAL_CONFIG, DEFAULT_ID, to_document(config)?)
            .await
    }
}
