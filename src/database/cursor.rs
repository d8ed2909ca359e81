use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind, Result};

/// Opaque pagination cursor: the sort-field value of the last item on the
/// previous page plus its id for stable tie-breaking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    #[serde(rename = "v")]
    pub value: serde_json::Value,
    #[serde(rename = "id")]
    pub id: String,
}

impl Cursor {
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("cursor serializes");
        general_purpose::URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(token: &str) -> Result<Self> {
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| Error::BadRequest(ErrorKind::Validation, "Malformed cursor token"))?;
        serde_json::from_slice(&bytes)
            .map_err(|_| Error::BadRequest(ErrorKind::Validation, "Malformed cursor token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let cursor = Cursor {
            value: serde_json::json!(1700000000000_i64),
            id: "room-abc".to_owned(),
        };
        let token = cursor.encode();
        assert_eq!(Cursor::decode(&token).unwrap(), cursor);
    }

    #[test]
    fn garbage_is_a_validation_error() {
        let error = Cursor::decode("!!!not-base64!!!").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);
    }
}
