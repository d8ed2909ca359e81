use async_trait::async_trait;
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    Client,
};

use super::{Page, PageRequest, SortOrder, StorageEngine};
use crate::{database::cursor::Cursor, Error, Result};

const SCHEMA_VERSIONS: &str = "schema_versions";

/// Preferred backend: one MongoDB collection per entity collection, `_id`
/// carrying the entity id.
pub struct Engine {
    db: mongodb::Database,
}

impl Engine {
    pub async fn open(url: &str, database: &str) -> Result<Self> {
        let client = Client::with_uri_str(url).await?;
        Ok(Self {
            db: client.database(database),
        })
    }

    fn coll(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection(name)
    }
}

fn with_id(mut doc: Document, id: &str) -> Document {
    doc.insert("_id", id);
    doc
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        &*e.kind,
        mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(write_error))
            if write_error.code == 11000
    )
}

#[async_trait]
impl StorageEngine for Engine {
    async fn ping(&self) -> Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    async fn insert(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        match self.coll(collection).insert_one(with_id(doc, id)).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => {
                Err(Error::Conflict("Document with this id already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        Ok(self.coll(collection).find_one(doc! { "_id": id }).await?)
    }

    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.coll(collection)
            .replace_one(doc! { "_id": id }, with_id(doc, id))
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn replace_if(
        &self,
        collection: &str,
        id: &str,
        guard: Document,
        doc: Document,
    ) -> Result<bool> {
        let filter = with_id(guard, id);
        let result = self
            .coll(collection)
            .replace_one(filter, with_id(doc, id))
            .await?;
        Ok(result.modified_count > 0)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let result = self
            .coll(collection)
            .delete_one(doc! { "_id": id })
            .await?;
        Ok(result.deleted_count > 0)
    }

    async fn find_all(&self, collection: &str, filter: Document) -> Result<Vec<Document>> {
        let mut cursor = self.coll(collection).find(filter).await?;
        let mut items = Vec::new();
        while let Some(doc) = cursor.try_next().await? {
            items.push(doc);
        }
        Ok(items)
    }

    async fn find_page(
        &self,
        collection: &str,
        filter: Document,
        page: PageRequest,
    ) -> Result<Page> {
        let direction = match page.order {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        let range_op = match page.order {
            SortOrder::Ascending => "$gt",
            SortOrder::Descending => "$lt",
        };

        let query = if let Some(cursor) = &page.cursor {
            let value = mongodb::bson::to_bson(&cursor.value)
                .map_err(|_| Error::BadRequest(crate::ErrorKind::Validation, "Malformed cursor token"))?;

            let mut past_value = Document::new();
            past_value.insert(
                page.sort_field.clone(),
                doc! { range_op: value.clone() },
            );

            let mut at_value = Document::new();
            at_value.insert(page.sort_field.clone(), value);
            at_value.insert("_id", doc! { range_op: cursor.id.clone() });

            doc! { "$and": [ filter, { "$or": [ past_value, at_value ] } ] }
        } else {
            filter
        };

        let mut sort = Document::new();
        sort.insert(page.sort_field.clone(), direction);
        sort.insert("_id", direction);

        let mut stream = self
            .coll(collection)
            .find(query)
            .sort(sort)
            .limit((page.limit + 1) as i64)
            .await?;

        let mut items = Vec::new();
        while let Some(doc) = stream.try_next().await? {
            items.push(doc);
        }

        let has_more = items.len() > page.limit;
        items.truncate(page.limit);

        let next_cursor = if has_more {
            items.last().map(|doc| {
                let value = doc.get(&page.sort_field).cloned().unwrap_or(Bson::Null);
                Cursor {
                    value: serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                    id: doc.get_str("_id").unwrap_or_default().to_owned(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(Page { items, next_cursor })
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self.coll(collection).count_documents(filter).await?)
    }

    async fn schema_version(&self, collection: &str) -> Result<u32> {
        let doc = self
            .coll(SCHEMA_VERSIONS)
            .find_one(doc! { "_id": collection })
            .await?;
        Ok(doc
            .and_then(|d| d.get("version").and_then(Bson::as_i64))
            .unwrap_or(0) as u32)
    }

    async fn set_schema_version(&self, collection: &str, version: u32) -> Result<()> {
        self.coll(SCHEMA_VERSIONS)
            .replace_one(
                doc! { "_id": collection },
                doc! { "_id": collection, "version": version as i64 },
            )
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        Ok(self
            .db
            .list_collection_names()
            .await?
            .into_iter()
            .filter(|name| name != SCHEMA_VERSIONS)
            .collect())
    }
}
