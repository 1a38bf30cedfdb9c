use super::{EntityCache, LOG_SOURCE};
use crate::core::{LogLevel, Result};
use crate::entity::{Entity, EntityRecord, Item};
use std::sync::Arc;

impl<T: Item> EntityCache<T> {
    /// Every entity of the collection.
    pub async fn scan(&self) -> Result<Vec<Arc<Entity<T>>>> {
        self.scan_filtered(|_| true).await
    }

    /// Entities whose item satisfies `predicate`.
    ///
    /// Ids that already have a live cached instance yield that instance and
    /// are matched against its current item; everything else is decoded,
    /// matched and inserted. Records that fail to decode are logged at
    /// EMERGENCY and skipped.
    pub async fn scan_filtered<F>(&self, predicate: F) -> Result<Vec<Arc<Entity<T>>>>
    where
        F: Fn(&T) -> bool,
    {
        let shared = &self.shared;
        let name = shared.collection.name.as_str();
        let records = match shared.adapter().scan(name).await {
            Ok(records) => records,
            Err(err) => {
                shared.logger().log(
                    LogLevel::Emergency,
                    LOG_SOURCE,
                    "scan",
                    "backing store scan failed",
                    &[
                        ("collection", shared.collection.qualified()),
                        ("error", err.to_string()),
                    ],
                );
                return Err(err.into());
            }
        };

        let mut entities = Vec::with_capacity(records.len());
        for data in records {
            let record = match EntityRecord::<T>::decode(&data) {
                Ok(record) => record,
                Err(err) => {
                    shared.logger().log(
                        LogLevel::Emergency,
                        LOG_SOURCE,
                        "scan",
                        "stored record failed to decode",
                        &[
                            ("collection", shared.collection.qualified()),
                            ("error", err.to_string()),
                        ],
                    );
                    continue;
                }
            };

            if let Some(cached) = shared.live(&record.id) {
                if cached.read(|item| predicate(item)).await {
                    entities.push(cached);
                }
                continue;
            }

            if !predicate(&record.item) {
                continue;
            }
            let candidate = Entity::from_record(record, shared);
            let (entity, inserted) = shared.insert_or_existing(candidate);
            // Lost a race against a concurrent insert: match the winner instead.
            if inserted || entity.read(|item| predicate(item)).await {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Blocking form of [`EntityCache::scan_filtered`]. Must not be called
    /// from async code.
    pub fn scan_sync<F>(&self, predicate: F) -> Result<Vec<Arc<Entity<T>>>>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let cache = self.clone();
        self.shared
            .database
            .runtime()
            .block_on(async move { cache.scan_filtered(predicate).await })?
    }

    /// Callback form of [`EntityCache::scan_filtered`]; returns immediately.
    pub fn scan_with<F, C>(&self, predicate: F, completion: C)
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
        C: FnOnce(Result<Vec<Arc<Entity<T>>>>) + Send + 'static,
    {
        let cache = self.clone();
        self.shared
            .database
            .runtime()
            .spawn(async move { completion(cache.scan_filtered(predicate).await) });
    }
}
