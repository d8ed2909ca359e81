pub mod blob;
pub mod memory;
pub mod mongo;

use std::cmp::Ordering;

use async_trait::async_trait;
use mongodb::bson::{Bson, Document};

use crate::{database::cursor::Cursor, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Clone, Debug)]
pub struct PageRequest {
    pub sort_field: String,
    pub order: SortOrder,
    pub cursor: Option<Cursor>,
    pub limit: usize,
}

#[derive(Debug, Default)]
pub struct Page {
    pub items: Vec<Document>,
    pub next_cursor: Option<String>,
}

/// One persisted collection store. The document backend maps this directly
/// onto MongoDB; the legacy blob backend serializes each document as a JSON
/// object; the memory backend backs tests and single-node development.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    async fn ping(&self) -> Result<()>;

    async fn insert(&self, collection: &str, id: &str, doc: Document) -> Result<()>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;
    /// Unconditional upsert.
    async fn put(&self, collection: &str, id: &str, doc: Document) -> Result<()>;
    /// Replaces the stored document only while it still matches `guard`
    /// (exact field equality). Returns false when the guard failed.
    async fn replace_if(
        &self,
        collection: &str,
        id: &str,
        guard: Document,
        doc: Document,
    ) -> Result<bool>;
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    async fn find_all(&self, collection: &str, filter: Document) -> Result<Vec<Document>>;
    async fn find_page(
        &self,
        collection: &str,
        filter: Document,
        page: PageRequest,
    ) -> Result<Page>;
    async fn count(&self, collection: &str, filter: Document) -> Result<u64>;

    async fn schema_version(&self, collection: &str) -> Result<u32>;
    async fn set_schema_version(&self, collection: &str, version: u32) -> Result<()>;

    /// Collections this engine currently holds data for; drives the legacy
    /// storage migration.
    async fn collections(&self) -> Result<Vec<String>>;
}

/// Matches the filter dialect shared by the memory and blob backends: plain
/// values compare for equality, documents may carry `$lt`/`$lte`/`$gt`/
/// `$gte`/`$ne`/`$exists`. The document backend hands the same filters to
/// MongoDB untouched.
pub(crate) fn matches_filter(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(field, condition)| {
        let value = doc.get(field.as_str());
        match condition {
            Bson::Document(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                ops.iter().all(|(op, operand)| match op.as_str() {
                    "$exists" => {
                        let wanted = operand.as_bool().unwrap_or(true);
                        (value.is_some() && value != Some(&Bson::Null)) == wanted
                    }
                    "$ne" => value != Some(operand),
                    "$lt" => value.is_some_and(|v| compare_bson(v, operand) == Ordering::Less),
                    "$lte" => value.is_some_and(|v| compare_bson(v, operand) != Ordering::Greater),
                    "$gt" => value.is_some_and(|v| compare_bson(v, operand) == Ordering::Greater),
                    "$gte" => value.is_some_and(|v| compare_bson(v, operand) != Ordering::Less),
                    "$in" => operand
                        .as_array()
                        .is_some_and(|list| value.is_some_and(|v| list.contains(v))),
                    "$nin" => operand
                        .as_array()
                        .is_some_and(|list| !value.is_some_and(|v| list.contains(v))),
                    _ => false,
                })
            }
            wanted => value == Some(wanted),
        }
    })
}

/// Total order over the Bson values our sort fields use (numbers and
/// strings); everything else compares by its type tag only.
pub(crate) fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    fn as_f64(v: &Bson) -> Option<f64> {
        match v {
            Bson::Int32(n) => Some(*n as f64),
            Bson::Int64(n) => Some(*n as f64),
            Bson::Double(n) => Some(*n),
            _ => None,
        }
    }

    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => match (a, b) {
            (Bson::String(x), Bson::String(y)) => x.cmp(y),
            (Bson::Boolean(x), Bson::Boolean(y)) => x.cmp(y),
            _ => format!("{:?}", a.element_type()).cmp(&format!("{:?}", b.element_type())),
        },
    }
}

/// Shared pagination for the backends that sort in process. Items must
/// already match the filter.
pub(crate) fn paginate_in_memory(
    mut items: Vec<(String, Document)>,
    page: &PageRequest,
) -> Page {
    items.sort_by(|(a_id, a), (b_id, b)| {
        let a_value = a.get(&page.sort_field).unwrap_or(&Bson::Null);
        let b_value = b.get(&page.sort_field).unwrap_or(&Bson::Null);
        let by_field = compare_bson(a_value, b_value).then_with(|| a_id.cmp(b_id));
        match page.order {
            SortOrder::Ascending => by_field,
            SortOrder::Descending => by_field.reverse(),
        }
    });

    if let Some(cursor) = &page.cursor {
        let cursor_bson = mongodb::bson::to_bson(&cursor.value).unwrap_or(Bson::Null);
        items.retain(|(id, doc)| {
            let value = doc.get(&page.sort_field).unwrap_or(&Bson::Null);
            let by_field = compare_bson(value, &cursor_bson).then_with(|| id.cmp(&cursor.id));
            match page.order {
                SortOrder::Ascending => by_field == Ordering::Greater,
                SortOrder::Descending => by_field == Ordering::Less,
            }
        });
    }

    let has_more = items.len() > page.limit;
    items.truncate(page.limit);

    let next_cursor = if has_more {
        items.last().map(|(id, doc)| {
            let value = doc.get(&page.sort_field).cloned().unwrap_or(Bson::Null);
            Cursor {
                value: serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                id: id.clone(),
            }
            .encode()
        })
    } else {
        None
    };

    Page {
        items: items.into_iter().map(|(_, doc)| doc).collect(),
        next_cursor,
    }
}
