//! Raw records as they come out of the web client's object stores.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::media_keys::is_media_type;
use crate::protobuf::DecodedRecord;

pub const CHAT_KIND: &str = "chat";

/// Encrypted row payload: ciphertext plus its IV. Stored as base64 in JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpaqueData {
    #[serde(with = "base64_bytes")]
    pub iv: Vec<u8>,
    #[serde(rename = "_data", with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// One message record. Only the fields the dump touches are typed; the rest
/// is carried through untouched, including keys whose value is not of the
/// expected shape (an explicit `null` stays `null`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>")]
pub struct EncodedRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,

    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    #[serde(rename = "msgRowOpaqueData", skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueData>,

    #[serde(rename = "mediaKey", skip_serializing_if = "Option::is_none")]
    pub media_key: Option<String>,

    #[serde(rename = "directPath", skip_serializing_if = "Option::is_none")]
    pub direct_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub filehash: Option<String>,

    /// Decrypted row bytes, base64.
    #[serde(rename = "msgRowData", skip_serializing_if = "Option::is_none")]
    pub row_data: Option<String>,

    #[serde(rename = "msgRow", skip_serializing_if = "Option::is_none")]
    pub row: Option<DecodedRecord>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for EncodedRecord {
    type Error = serde_json::Error;

    fn try_from(mut rest: Map<String, Value>) -> Result<Self, Self::Error> {
        let opaque = match rest.get(OPAQUE_KEY) {
            Some(Value::Object(_)) => rest
                .remove(OPAQUE_KEY)
                .map(serde_json::from_value)
                .transpose()?,
            _ => None,
        };
        Ok(EncodedRecord {
            id: rest.remove("id"),
            kind: take_string(&mut rest, "type"),
            opaque,
            media_key: take_string(&mut rest, "mediaKey"),
            direct_path: take_string(&mut rest, "directPath"),
            filehash: take_string(&mut rest, "filehash"),
            row_data: take_string(&mut rest, "msgRowData"),
            row: None,
            rest,
        })
    }
}

const OPAQUE_KEY: &str = "msgRowOpaqueData";

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.get(key) {
        Some(Value::String(_)) => match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

impl EncodedRecord {
    /// Identifier used in logs and stats.
    pub fn id_string(&self) -> String {
        match &self.id {
            None => "undefined".to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(id @ Value::Object(obj)) => obj
                .get("_serialized")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| id.to_string()),
            Some(other) => other.to_string(),
        }
    }

    /// Stores the decoded row, replacing any `msgRow` the input carried.
    pub fn set_row(&mut self, row: DecodedRecord) {
        self.rest.remove("msgRow");
        self.row = Some(row);
    }

    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or("")
    }

    pub fn is_chat(&self) -> bool {
        self.kind() == CHAT_KIND
    }

    pub fn is_media(&self) -> bool {
        is_media_type(self.kind())
    }

    /// Timestamp in seconds, if the record has one.
    pub fn timestamp(&self) -> Option<f64> {
        self.rest.get("t").and_then(Value::as_f64)
    }
}

pub mod base64_bytes {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
