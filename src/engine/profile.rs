//! Profile storage.
//!
//! # Responsibilities
//! - Answer which profile is active and which proxies were selected for it
//! - Forget selections the engine no longer accepts
//!
//! # Design Decisions
//! - `ConfigProfileStore` is seeded from the service configuration and lives
//!   in memory only; removals are never written back to disk
//! - The profile book is swapped atomically on config reload (`ArcSwap`);
//!   selections are a concurrent map keyed by profile id

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::{ProfileConfig, ServiceConfig};

/// The profile the engine should be running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveProfile {
    pub id: String,
    pub file: PathBuf,
    pub name: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("profile store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Source of profiles and their remembered proxy selections.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn query_active_profile(&self) -> StoreResult<Option<ActiveProfile>>;

    /// Proxy group → proxy name remembered for `profile_id`.
    async fn query_selections(&self, profile_id: &str) -> StoreResult<BTreeMap<String, String>>;

    async fn remove_selections(&self, profile_id: &str, groups: &[String]) -> StoreResult<()>;
}

#[derive(Debug, Default)]
struct ProfileBook {
    active: Option<String>,
    profiles: Vec<ProfileConfig>,
}

impl ProfileBook {
    fn active_profile(&self) -> Option<ActiveProfile> {
        let id = self.active.as_deref()?;
        self.profiles.iter().find(|p| p.id == id).map(|p| ActiveProfile {
            id: p.id.clone(),
            file: PathBuf::from(&p.file),
            name: p.name.clone(),
        })
    }
}

/// In-memory profile store built from `[[profiles]]`.
#[derive(Debug)]
pub struct ConfigProfileStore {
    book: ArcSwap<ProfileBook>,
    selections: DashMap<String, BTreeMap<String, String>>,
}

impl ConfigProfileStore {
    pub fn from_config(config: &ServiceConfig) -> Self {
        let store = Self {
            book: ArcSwap::from_pointee(ProfileBook::default()),
            selections: DashMap::new(),
        };
        store.replace(config);
        store
    }

    /// Replace every profile and selection with the contents of `config`.
    pub fn replace(&self, config: &ServiceConfig) {
        self.book.store(Arc::new(ProfileBook {
            active: config.active_profile.clone(),
            profiles: config.profiles.clone(),
        }));

        self.selections.clear();
        for profile in &config.profiles {
            self.selections.insert(profile.id.clone(), profile.selections.clone());
        }

        tracing::info!(
            profiles = config.profiles.len(),
            active = ?config.active_profile,
            "Profile book loaded"
        );
    }

    /// Switch the active profile.
    pub fn set_active(&self, id: Option<&str>) -> StoreResult<()> {
        if let Some(id) = id {
            if !self.book.load().profiles.iter().any(|p| p.id == id) {
                return Err(StoreError::NotFound(id.to_string()));
            }
        }

        let active = id.map(str::to_string);
        self.book.rcu(|book| ProfileBook {
            active: active.clone(),
            profiles: book.profiles.clone(),
        });
        Ok(())
    }

    pub fn active_profile(&self) -> Option<ActiveProfile> {
        self.book.load().active_profile()
    }
}

#[async_trait]
impl ProfileStore for ConfigProfileStore {
    async fn query_active_profile(&self) -> StoreResult<Option<ActiveProfile>> {
        Ok(self.active_profile())
    }

    async fn query_selections(&self, profile_id: &str) -> StoreResult<BTreeMap<String, String>> {
        Ok(self
            .selections
            .get(profile_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn remove_selections(&self, profile_id: &str, groups: &[String]) -> StoreResult<()> {
        let mut entry = self
            .selections
            .get_mut(profile_id)
            .ok_or_else(|| StoreError::NotFound(profile_id.to_string()))?;

        for group in groups {
            if entry.remove(group).is_some() {
                tracing::info!(profile = %profile_id, group = %group, "Removed stale proxy selection");
            }
        }
        Ok(())
    }
}
