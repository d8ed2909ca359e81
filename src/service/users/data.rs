use async_trait::async_trait;

use super::{ApiKey, User};
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    async fn create_user(&self, user: &User) -> Result<()>;

    async fn user(&self, user_id: &str) -> Result<Option<User>>;

    async fn replace_user(&self, user: &User) -> Result<()>;

    async fn insert_api_key(&self, key: &ApiKey) -> Result<()>;

    async fn api_keys(&self) -> Result<Vec<ApiKey>>;

    async fn delete_api_key(&self, key_id: &str) -> Result<bool>;
}
