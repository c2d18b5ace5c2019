use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::value::RawValue;
use tracing::debug;

use crate::{
    collection::Collection,
    error::Result,
    skiplist::SkipList,
};

/// Creation and modification audit fields, rendered inside `meta`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub created_at: i64,
    pub created_by: String,
    pub last_modified_at: i64,
    pub last_modified_by: String,
}

#[derive(Serialize)]
struct DocumentJson<'a> {
    path: &'a str,
    doc: &'a RawValue,
    meta: &'a Metadata,
}

/// A named leaf holding one validated JSON payload and an ordered index of
/// sub-collections. Documents are immutable snapshots: every mutation builds
/// a replacement that shares the sub-collection index, so readers holding an
/// older snapshot observe a consistent payload/metadata pair.
#[derive(Clone)]
pub struct Document {
    name: String,
    data: Box<RawValue>,
    metadata: Metadata,
    subcollections: Arc<SkipList<Arc<Collection>>>,
}

impl Document {
    pub fn new(name: impl Into<String>, data: Box<RawValue>, creator: &str) -> Self {
        let name = name.into();
        let now = Utc::now().timestamp_millis();
        Self {
            subcollections: Arc::new(SkipList::new(format!("{name}.collections"))),
            name,
            data,
            metadata: Metadata {
                created_at: now,
                created_by: creator.to_string(),
                last_modified_at: now,
                last_modified_by: creator.to_string(),
            },
        }
    }

    /// Replacement snapshot carrying new payload bytes. Creation metadata is
    /// preserved; the sub-collection index is shared with the predecessor.
    pub fn with_data(&self, data: Box<RawValue>, modifier: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        debug!("document {} edited by {modifier} at {now}", self.name);
        Self {
            name: self.name.clone(),
            data,
            metadata: Metadata {
                created_at: self.metadata.created_at,
                created_by: self.metadata.created_by.clone(),
                last_modified_at: now,
                last_modified_by: modifier.to_string(),
            },
            subcollections: Arc::clone(&self.subcollections),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &RawValue {
        &self.data
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Canonical JSON representation `{path, doc, meta}`; `doc` carries the
    /// stored payload bytes verbatim.
    pub fn render(&self, full_path: &str) -> Result<String> {
        let rendered = serde_json::to_string(&DocumentJson {
            path: full_path,
            doc: &self.data,
            meta: &self.metadata,
        })?;
        Ok(rendered)
    }

    pub fn find_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.subcollections.get(name)
    }

    pub fn put_collection<E, F>(&self, name: &str, check: F) -> std::result::Result<Arc<Collection>, E>
    where
        F: FnMut(&str, Option<&Arc<Collection>>, bool) -> std::result::Result<Arc<Collection>, E>,
    {
        self.subcollections.upsert(name, check)
    }

    pub fn delete_collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.subcollections.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).expect("valid json")
    }

    #[test]
    fn render_preserves_payload_bytes_and_field_order() {
        let doc = Document::new("order", raw(r#"{"b":1,"a":[true,null]}"#), "alice");
        let rendered = doc.render("/order").expect("render succeeds");
        assert!(rendered.starts_with(r#"{"path":"/order","doc":{"b":1,"a":[true,null]},"meta":{"#));
        assert!(rendered.contains(r#""createdBy":"alice""#));
        assert!(rendered.contains(r#""lastModifiedBy":"alice""#));
    }

    #[test]
    fn overwrite_preserves_creation_metadata() {
        let doc = Document::new("note", raw("{}"), "alice");
        let created_at = doc.metadata().created_at;
        let updated = doc.with_data(raw(r#"{"v":2}"#), "bob");
        assert_eq!(updated.metadata().created_at, created_at);
        assert_eq!(updated.metadata().created_by, "alice");
        assert_eq!(updated.metadata().last_modified_by, "bob");
        assert_eq!(updated.data().get(), r#"{"v":2}"#);
    }

    #[test]
    fn replacement_shares_subcollections() {
        let doc = Document::new("parent", raw("{}"), "alice");
        doc.put_collection::<std::convert::Infallible, _>("inner", |_, _, _| {
            Ok(Arc::new(Collection::new("inner")))
        })
        .expect("create succeeds");

        let updated = doc.with_data(raw(r#"{"v":2}"#), "bob");
        assert!(updated.find_collection("inner").is_some());
    }
}
