//! In-process [`PropertyStore`] for dry runs and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use crate::error::AppError;
use crate::models::{Property, PropertyFactors};
use crate::traits::{FactorStore, PropertyStore};

#[derive(Debug, Default)]
struct MemoryInner {
    rows: Vec<Property>,
    by_key: HashMap<(String, String), usize>,
    next_id: i64,
    factors: HashMap<i64, PropertyFactors>,
}

/// Keeps upserted listings in memory with the same natural-key semantics as
/// the database repository.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.read().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().rows.is_empty()
    }

    /// Every stored listing, in insertion order.
    pub fn all(&self) -> Vec<Property> {
        self.read().rows.clone()
    }

    pub fn find_by_key(&self, source: &str, external_id: &str) -> Option<Property> {
        let inner = self.read();
        inner
            .by_key
            .get(&(source.to_string(), external_id.to_string()))
            .map(|&idx| inner.rows[idx].clone())
    }
}

impl PropertyStore for MemoryStore {
    async fn upsert_batch(&self, batch: &[Property]) -> Result<Vec<Property>, AppError> {
        let now = Utc::now();
        let mut inner = self.write();
        let mut stored = Vec::with_capacity(batch.len());

        for incoming in batch {
            let key = (incoming.source.clone(), incoming.external_id.clone());
            let mut record = incoming.clone();
            record.updated_at = Some(now);

            match inner.by_key.get(&key).copied() {
                Some(idx) => {
                    let existing = &inner.rows[idx];
                    record.id = existing.id;
                    record.created_at = existing.created_at;
                    inner.rows[idx] = record.clone();
                }
                None => {
                    inner.next_id += 1;
                    record.id = Some(inner.next_id);
                    record.created_at = Some(now);
                    let idx = inner.rows.len();
                    inner.rows.push(record.clone());
                    inner.by_key.insert(key, idx);
                }
            }
            stored.push(record);
        }

        Ok(stored)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Property>, AppError> {
        Ok(self.read().rows.iter().find(|p| p.id == Some(id)).cloned())
    }
}

impl FactorStore for MemoryStore {
    async fn save_factors(&self, factors: &PropertyFactors) -> Result<(), AppError> {
        let mut inner = self.write();
        if !inner.rows.iter().any(|p| p.id == Some(factors.property_id)) {
            return Err(AppError::DatabaseError(format!(
                "no listing with id {}",
                factors.property_id
            )));
        }
        inner.factors.insert(factors.property_id, factors.clone());
        Ok(())
    }

    async fn find_factors(&self, property_id: i64) -> Result<Option<PropertyFactors>, AppError> {
        Ok(self.read().factors.get(&property_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(source: &str, id: &str, price: f64) -> Property {
        let mut p = Property::new(source, id);
        p.price = price;
        p
    }

    #[tokio::test]
    async fn test_upsert_assigns_identity() {
        let store = MemoryStore::new();
        let saved = store
            .upsert_batch(&[listing("a", "1", 10.0), listing("a", "2", 20.0)])
            .await
            .unwrap();

        assert_eq!(saved.len(), 2);
        assert!(saved.iter().all(|p| p.id.is_some() && p.created_at.is_some()));

        let found = store.find_by_id(saved[1].id.unwrap()).await.unwrap().unwrap();
        assert_eq!(found.external_id, "2");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_updates_in_place() {
        let store = MemoryStore::new();
        let batch = vec![listing("a", "1", 10.0), listing("b", "1", 20.0)];

        let first = store.upsert_batch(&batch).await.unwrap();
        let second = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].created_at, second[0].created_at);

        store.upsert_batch(&[listing("a", "1", 99.0)]).await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.find_by_key("a", "1").unwrap().price, 99.0);
    }

    #[tokio::test]
    async fn test_factors_replace_previous_and_need_a_listing() {
        let store = MemoryStore::new();
        let saved = store.upsert_batch(&[listing("a", "1", 10.0)]).await.unwrap();
        let id = saved[0].id.unwrap();

        for overall in [40.0, 75.0] {
            store
                .save_factors(&PropertyFactors {
                    property_id: id,
                    overall_score: overall,
                    ..Default::default()
                })
                .await
                .unwrap();
        }
        assert_eq!(store.find_factors(id).await.unwrap().unwrap().overall_score, 75.0);

        let orphan = PropertyFactors {
            property_id: id + 100,
            ..Default::default()
        };
        assert!(matches!(
            store.save_factors(&orphan).await,
            Err(AppError::DatabaseError(_))
        ));
        assert!(store.find_factors(id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_missing_id() {
        assert!(MemoryStore::new().find_by_id(7).await.unwrap().is_none());
    }
}
