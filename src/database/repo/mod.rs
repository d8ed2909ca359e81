mod recordings;
mod rooms;
mod settings;
mod users;

use mongodb::bson::Document;
use serde::{de::DeserializeOwned, Serialize};

use crate::{Error, Result};

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Document> {
    mongodb::bson::to_document(value)
        .map_err(|_| Error::bad_database("Entity does not serialize to a document"))
}

pub(crate) fn from_document<T: DeserializeOwned>(doc: Document) -> Result<T> {
    mongodb::bson::from_document(doc).map_err(|_| Error::bad_database("Corrupt row in database"))
}
