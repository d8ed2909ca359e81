use async_trait::async_trait;
use mongodb::bson::doc;

use super::{from_document, to_document};
use crate::{
    database::Database,
    service::users::{ApiKey, Data, User},
    Result,
};

const USERS: &str = "users";
const API_KEYS: &str = "api_keys";

#[async_trait]
impl Data for Database {
    async fn create_user(&self, user: &User) -> Result<()> {
        self.engine
            .insert(USERS, &user.user_id, to_document(user)?)
            .await
    }

    async fn user(&self, user_id: &str) -> Result<Option<User>> {
        self.engine
            .get(USERS, user_id)
            .await?
            .map(from_document)
            .transpose()
    }

    async fn replace_user(&self, user: &User) -> Result<()> {
        self.engine
            .put(USERS, &user.user_id, to_document(user)?)
            .await
    }

    async fn insert_api_key(&self, key: &ApiKey) -> Result<()> {
        self.engine
            .insert(API_KEYS, &key.key_id, to_document(key)?)
            .await
    }

    async fn api_keys(&self) -> Result<Vec<ApiKey>> {
        self.engine
            .find_all(API_KEYS, doc! {})
            .await?
            .into_iter()
            .map(from_document)
            .collect()
    }

    async fn delete_api_key(&self, key_id: &str) -> Result<bool> {
        self.engine.delete(API_KEYS, key_id).await
    }
}
