use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use async_trait::async_trait;
use mongodb::bson::Document;

use super::{matches_filter, paginate_in_memory, Page, PageRequest, StorageEngine};
use crate::{Error, Result};

/// Volatile engine for tests and single-node development.
#[derive(Default)]
pub struct Engine {
    collections: Mutex<HashMap<String, BTreeMap<String, Document>>>,
    versions: Mutex<HashMap<String, u32>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }
}

fn with_id(mut doc: Document, id: &str) -> Document {
    doc.insert("_id", id);
    doc
}

#[async_trait]
impl StorageEngine for Engine {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        let entries = collections.entry(collection.to_owned()).or_default();
        if entries.contains_key(id) {
            return Err(Error::Conflict("Document with this id already exists"));
        }
        entries.insert(id.to_owned(), with_id(doc, id));
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .and_then(|entries| entries.get(id).cloned()))
    }

    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<()> {
        let mut collections = self.collections.lock().unwrap();
        collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), with_id(doc, id));
        Ok(())
    }

    async fn replace_if(
        &self,
        collection: &str,
        id: &str,
        guard: Document,
        doc: Document,
    ) -> Result<bool> {
        let mut collections = self.collections.lock().unwrap();
        let entries = collections.entry(collection.to_owned()).or_default();
        match entries.get(id) {
            Some(existing) if matches_filter(existing, &guard) => {
                entries.insert(id.to_owned(), with_id(doc, id));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let mut collections = self.collections.lock().unwrap();
        Ok(collections
            .get_mut(collection)
            .is_some_and(|entries| entries.remove(id).is_some()))
    }

    async fn find_all(&self, collection: &str, filter: Document) -> Result<Vec<Document>> {
        let collections = self.collections.lock().unwrap();
        Ok(collections
            .get(collection)
            .map(|entries| {
                entries
                    .values()
                    .filter(|doc| matches_filter(doc, &filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_page(
        &self,
        collection: &str,
        filter: Document,
        page: PageRequest,
    ) -> Result<Page> {
        let items: Vec<(String, Document)> = {
            let collections = self.collections.lock().unwrap();
            collections
                .get(collection)
                .map(|entries| {
                    entries
                        .iter()
                        .filter(|(_, doc)| matches_filter(doc, &filter))
                        .map(|(id, doc)| (id.clone(), doc.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        Ok(paginate_in_memory(items, &page))
    }

    async fn count(&self, collection: &str, filter: Document) -> Result<u64> {
        Ok(self.find_all(collection, filter).await?.len() as u64)
    }

    async fn schema_version(&self, collection: &str) -> Result<u32> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(collection)
            .copied()
            .unwrap_or(0))
    }

    async fn set_schema_version(&self, collection: &str, version: u32) -> Result<()> {
        self.versions
            .lock()
            .unwrap()
            .insert(collection.to_owned(), version);
        Ok(())
    }

    async fn collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.lock().unwrap().keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::doc;

    use super::*;
    use crate::database::{abstraction::SortOrder, cursor::Cursor};

    #[tokio::test]
    async fn insert_refuses_duplicates() {
        let engine = Engine::new();
        engine
            .insert("rooms", "a", doc! { "roomId": "a" })
            .await
            .unwrap();
        assert!(engine
            .insert("rooms", "a", doc! { "roomId": "a" })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn replace_if_enforces_guard() {
        let engine = Engine::new();
        engine
            .insert("rooms", "a", doc! { "status": "open" })
            .await
            .unwrap();

        assert!(!engine
            .replace_if(
                "rooms",
                "a",
                doc! { "status": "closed" },
                doc! { "status": "active_meeting" },
            )
            .await
            .unwrap());

        assert!(engine
            .replace_if(
                "rooms",
                "a",
                doc! { "status": "open" },
                doc! { "status": "active_meeting" },
            )
            .await
            .unwrap());

        let stored = engine.get("rooms", "a").await.unwrap().unwrap();
        assert_eq!(stored.get_str("status").unwrap(), "active_meeting");
    }

    #[tokio::test]
    async fn range_filters_match() {
        let engine = Engine::new();
        for (id, ts) in [("a", 10_i64), ("b", 20), ("c", 30)] {
            engine
                .put("rooms", id, doc! { "autoDeletionDate": ts })
                .await
                .unwrap();
        }

        let expired = engine
            .find_all("rooms", doc! { "autoDeletionDate": { "$lte": 20_i64 } })
            .await
            .unwrap();
        assert_eq!(expired.len(), 2);
    }

    #[tokio::test]
    async fn pagination_covers_everything_exactly_once() {
        let engine = Engine::new();
        // Duplicate sort values force the id tie-break
        for i in 0..25 {
            let id = format!("id-{i:02}");
            engine
                .put("rooms", &id, doc! { "creationDate": (i / 5) as i64, "roomId": id.clone() })
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        let mut cursor: Option<Cursor> = None;
        loop {
            let page = engine
                .find_page(
                    "rooms",
                    doc! {},
                    PageRequest {
                        sort_field: "creationDate".to_owned(),
                        order: SortOrder::Ascending,
                        cursor: cursor.clone(),
                        limit: 4,
                    },
                )
                .await
                .unwrap();
            for item in &page.items {
                seen.push(item.get_str("roomId").unwrap().to_owned());
            }
            match page.next_cursor {
                Some(token) => cursor = Some(Cursor::decode(&token).unwrap()),
                None => break,
            }
        }

        let expected: Vec<String> = (0..25).map(|i| format!("id-{i:02}")).collect();
        assert_eq!(seen, expected);
    }
}
