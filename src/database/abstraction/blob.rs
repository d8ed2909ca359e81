use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use http::StatusCode;
use mongodb::bson::Document;
use rusty_s3::{Bucket, Credentials, S3Action, UrlStyle};
use tracing::error;

use super::{matches_filter, paginate_in_memory, Page, PageRequest, StorageEngine};
use crate::{config::BlobConfig, Error, Result};

const SIGN_DURATION: Duration = Duration::from_secs(10 * 60);

/// Legacy backend: every document is a JSON object under
/// `{collection}/{id}.json`, with a per-collection index object listing the
/// ids. Writers are serialized by the control plane's locks, so the
/// read-modify-write on the index is safe in practice.
pub struct Engine {
    bucket: Bucket,
    credentials: Credentials,
    client: reqwest::Client,
}

impl Engine {
    pub fn open(config: &BlobConfig, client: reqwest::Client) -> Result<Self> {
        let bucket = Bucket::new(
            config.endpoint.clone(),
            UrlStyle::Path,
            config.bucket.clone(),
            config.region.clone(),
        )
        .map_err(|_| Error::bad_config("Invalid blob storage endpoint"))?;

        Ok(Self {
            bucket,
            credentials: Credentials::new(config.access_key.clone(), config.secret_key.clone()),
            client,
        })
    }

    fn object_name(collection: &str, id: &str) -> String {
        format!("{collection}/{id}.json")
    }

    fn index_name(collection: &str) -> String {
        format!("{collection}/_index.json")
    }

    async fn fetch(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), name)
            .sign(SIGN_DURATION);
        let resp = self.client.get(url).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            error!("Failed to get {name} from blob storage: {}", resp.status());
            return Err(Error::BadS3Response(
                "Failed to get object from blob storage",
            ));
        }

        Ok(Some(resp.bytes().await?.to_vec()))
    }

    async fn store(&self, name: &str, body: Vec<u8>) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), name)
            .sign(SIGN_DURATION);
        let resp = self.client.put(url).body(body).send().await?;

        if !resp.status().is_success() {
            error!("Failed to put {name} into blob storage: {}", resp.status());
            return Err(Error::BadS3Response(
                "Failed to store object in blob storage",
            ));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let url = self
            .bucket
            .delete_object(Some(&self.credentials), name)
            .sign(SIGN_DURATION);
        let resp = self.client.delete(url).send().await?;

        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            error!("Failed to delete {name} from blob storage: {}", resp.status());
            return Err(Error::BadS3Response(
                "Failed to delete object from blob storage",
            ));
        }
        Ok(())
    }

    async fn index(&self, collection: &str) -> Result<BTreeSet<String>> {
        match self.fetch(&Self::index_name(collection)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Corrupt collection index in blob storage")),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn write_index(&self, collection: &str, index: &BTreeSet<String>) -> Result<()> {
        let body = serde_json::to_vec(index).expect("index serializes");
        self.store(&Self::index_name(collection), body).await
    }

    async fn read_doc(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        match self.fetch(&Self::object_name(collection, id)).await? {
            Some(bytes) => {
                let value: serde_json::Value = serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Corrupt document in blob storage"))?;
                let doc = mongodb::bson::to_document(&value)
                    .map_err(|_| Error::bad_database("Corrupt document in blob storage"))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    async fn write_doc(&self, collection: &str, id: &str, doc: &Document) -> Result<()> {
        let mut doc = doc.clone();
        doc.insert("_id", id);
        let value = serde_json::to_value(&doc)
            .map_err(|_| Error::bad_database("Document does not serialize to JSON"))?;
        self.store(
            &Self::object_name(collection, id),
            serde_json::to_vec(&value).expect("json value serializes"),
        )
        .await?;

        let mut index = self.index(collection).await?;
        if index.insert(id.to_owned()) {
            self.write_index(collection, &index).await?;
        }
        Ok(())
    }

    /// Collection names are tracked in a root index so `collections()` does
    /// not depend on bucket listing.
    async fn root_index(&self) -> Result<BTreeSet<String>> {
        match self.fetch("_collections.json").await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Corrupt root index in blob storage")),
            None => Ok(BTreeSet::new()),
        }
    }

    async fn track_collection(&self, collection: &str) -> Result<()> {
        let mut root = self.root_index().await?;
        if root.insert(collection.to_owned()) {
            self.store(
                "_collections.json",
                serde_json::to_vec(&root).expect("index serializes"),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl StorageEngine for Engine {
    async fn ping(&self) -> Result<()> {
        // Reading the root index exercises auth and connectivity
        self.root_index().await.map(|_| ())
    }

    async fn insert(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        if self.read_doc(collection, id).await?.is_some() {
            return Err(Error::Conflict("Document with this id already exists"));
        }
        self.write_doc(collection, id, &doc).await?;
        self.track_collection(collection).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.read_doc(collection, id).await
    }

    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        self.write_doc(collection, id, &doc).await?;
        self.track_collection(collection).await
    }

    async fn replace_if(
        &self,
        collection: &str,
        id: &str,
        guard: Document,
        doc: Document,
    ) -> Result<bool> {
        match self.read_doc(collection, id).await? {
            Some(existing) if matches_filter(&existing, &guard) => {
                self.write_doc(collection, id, &doc).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut index = self.index(collection).await?;
        if !index.remove(id) {
            return Ok(false);
        }
        self.remove(&Self::object_name(collection, id)).await?;
        self.write_index(collection, &index).await?;
        Ok(true)
    }

    async fn find_all(&self, collection: &str, filter: Document) -> Result<Vec<Document>> {
        let mut items = Vec::new();
        for id in self.index(collection).await? {
            if let Some(doc) = self.read_doc(collection, &id).await? {
                if matches_filter(&doc, &filter) {
                    items.push(doc);
                }
            }
        }
        Ok(items)
    }

    async fn find_page(
        &self,
        collection: &str,
        filter: Document,
        page: PageRequest,
    ) -> Result<Page> {
        let mut items = Vec::new();
        for id in self.index(collection).await? {
            if let Some(doc) = self.read_doc(collection, &id).await? {
                if matches_filter(&doc, &filter) {
                    items.push((id, doc));
                }
            }
        }
        Ok(paginate_in_memory(items, &page))
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self.find_all(collection, filter).await?.len() as u64)
    }

    async fn schema_version(&self, collection: &str) -> Result<u32> {
        match self.fetch(&format!("_schema/{collection}.json")).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|_| Error::bad_database("Corrupt schema version in blob storage")),
            None => Ok(0),
        }
    }

    async fn set_schema_version(&self, collection: &str, version: u32) -> Result<()> {
        self.store(
            &format!("_schema/{collection}.json"),
            serde_json::to_vec(&version).expect("version serializes"),
        )
        .await
    }

    async fn collections(&self) -> Result<Vec<String>> {
        Ok(self.root_index().await?.into_iter().collect())
    }
}
