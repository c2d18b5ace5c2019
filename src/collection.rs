use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Instant,
};

use parking_lot::RwLock;
use serde_json::value::RawValue;
use tokio::sync::mpsc::Sender;

use crate::{
    document::Document,
    error::Result,
    skiplist::SkipList,
    subscribe::SubMessage,
};

/// A named ordered container of documents plus the set of live subscribers
/// receiving change notifications for those documents. A database is simply
/// a top-level collection.
pub struct Collection {
    name: String,
    documents: SkipList<Arc<Document>>,
    subscribers: RwLock<HashMap<u64, Sender<SubMessage>>>,
    next_subscriber: AtomicU64,
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            documents: SkipList::new(name.clone()),
            name,
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn find_document(&self, name: &str) -> Option<Arc<Document>> {
        self.documents.get(name)
    }

    pub fn put_document<E, F>(&self, name: &str, check: F) -> std::result::Result<Arc<Document>, E>
    where
        F: FnMut(&str, Option<&Arc<Document>>, bool) -> std::result::Result<Arc<Document>, E>,
    {
        self.documents.upsert(name, check)
    }

    pub fn delete_document(&self, name: &str) -> Option<Arc<Document>> {
        self.documents.remove(name)
    }

    /// Snapshot of the documents with names in `[low, high]`, in key order.
    /// Documents are immutable values, so sharing the snapshot is safe.
    pub fn query(
        &self,
        deadline: Option<Instant>,
        low: &str,
        high: &str,
    ) -> Result<Vec<Arc<Document>>> {
        let (_, documents) = self
            .documents
            .query(deadline, low, high, |doc| Some(Arc::clone(doc)))?;
        Ok(documents)
    }

    /// JSON array of the rendered documents in `[low, high]`. `full_path` is
    /// the collection path after the database name, ending in a slash.
    pub fn render(
        &self,
        deadline: Option<Instant>,
        low: &str,
        high: &str,
        full_path: &str,
    ) -> Result<String> {
        let documents = self.query(deadline, low, high)?;
        let mut rendered: Vec<Box<RawValue>> = Vec::with_capacity(documents.len());
        for document in &documents {
            let body = document.render(&format!("{full_path}{}", document.name()))?;
            rendered.push(RawValue::from_string(body)?);
        }
        Ok(serde_json::to_string(&rendered)?)
    }

    /// Registration takes the write lock; fan-out reads a snapshot.
    pub fn add_subscriber(&self, sender: Sender<SubMessage>) -> u64 {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(id, sender);
        id
    }

    pub fn remove_subscriber(&self, id: u64) {
        self.subscribers.write().remove(&id);
    }

    pub fn snapshot_subscribers(&self) -> Vec<Sender<SubMessage>> {
        self.subscribers.read().values().cloned().collect()
    }
}
