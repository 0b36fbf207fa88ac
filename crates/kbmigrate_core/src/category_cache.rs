use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::record::{CATEGORY_TABLE, Lookup, Record};
use crate::store::{RecordQuery, RecordStore, query_all};

pub const CATEGORY_FIELDS: &[&str] = &["sys_id", "label", "parent_id", "active"];
pub const MAX_HIERARCHY_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryRecord {
    pub sys_id: String,
    pub label: String,
    pub parent_id: Option<String>,
}

impl CategoryRecord {
    pub fn from_record(record: &Record) -> Self {
        Self {
            sys_id: record.value("sys_id").trim().to_string(),
            label: record.display("label").trim().to_string(),
            parent_id: record.reference_id("parent_id").map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryCacheStats {
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub prefetched: bool,
    pub prefetch_size: usize,
    pub invalid_categories: usize,
    pub invalid_category_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct CacheState {
    found: HashMap<String, CategoryRecord>,
    invalid: BTreeSet<String>,
    prefetched: Option<HashMap<String, CategoryRecord>>,
}

/// Category lookups for one migration run. Shared by reference between
/// workers; a missing category is remembered so it is never requested twice.
#[derive(Debug)]
pub struct CategoryCache {
    enabled: bool,
    state: Mutex<CacheState>,
}

impl Default for CategoryCache {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CategoryCache {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            state: Mutex::new(CacheState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get_category<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        sys_id: &str,
    ) -> Result<Lookup<CategoryRecord>> {
        {
            let state = self.state();
            if state.invalid.contains(sys_id) {
                debug!(sys_id, "skipping known invalid category");
                return Ok(Lookup::NotFound);
            }
            if self.enabled
                && let Some(category) = state.found.get(sys_id)
            {
                return Ok(Lookup::Found(category.clone()));
            }
            if let Some(category) = state
                .prefetched
                .as_ref()
                .and_then(|prefetched| prefetched.get(sys_id))
            {
                return Ok(Lookup::Found(category.clone()));
            }
        }

        debug!(sys_id, "fetching category");
        match store.get_record(CATEGORY_TABLE, sys_id, CATEGORY_FIELDS)? {
            Lookup::Found(record) => {
                let category = CategoryRecord::from_record(&record);
                if self.enabled {
                    self.state()
                        .found
                        .insert(sys_id.to_string(), category.clone());
                }
                Ok(Lookup::Found(category))
            }
            Lookup::NotFound => {
                warn!(sys_id, "category not found, caching as invalid");
                self.state().invalid.insert(sys_id.to_string());
                Ok(Lookup::NotFound)
            }
        }
    }

    /// Ancestry of a category, root first. Stops at a missing category, a
    /// cycle, or `MAX_HIERARCHY_DEPTH` levels.
    pub fn hierarchy<S: RecordStore + ?Sized>(
        &self,
        store: &S,
        sys_id: &str,
    ) -> Result<Vec<CategoryRecord>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(sys_id.to_string());

        while let Some(id) = current.take() {
            if chain.len() >= MAX_HIERARCHY_DEPTH {
                break;
            }
            if !seen.insert(id.clone()) {
                warn!(sys_id = %id, "category cycle detected");
                break;
            }
            let Lookup::Found(category) = self.get_category(store, &id)? else {
                warn!(sys_id = %id, "category missing, stopping hierarchy traversal");
                break;
            };
            current = category.parent_id.clone();
            chain.push(category);
        }

        chain.reverse();
        Ok(chain)
    }

    /// Load the whole category table so hierarchy walks need no requests.
    pub fn prefetch_all<S: RecordStore + ?Sized>(&self, store: &S, page_size: usize) -> Result<usize> {
        let query = RecordQuery::new(CATEGORY_TABLE, "").fields(CATEGORY_FIELDS);
        let records = query_all(store, &query, page_size)?;
        let mut prefetched = HashMap::with_capacity(records.len());
        for record in &records {
            let category = CategoryRecord::from_record(record);
            if !category.sys_id.is_empty() {
                prefetched.insert(category.sys_id.clone(), category);
            }
        }
        info!(count = prefetched.len(), "prefetched categories");
        let count = prefetched.len();
        self.state().prefetched = Some(prefetched);
        Ok(count)
    }

    pub fn stats(&self) -> CategoryCacheStats {
        let state = self.state();
        CategoryCacheStats {
            cache_enabled: self.enabled,
            cache_size: state.found.len(),
            prefetched: state.prefetched.is_some(),
            prefetch_size: state.prefetched.as_ref().map_or(0, HashMap::len),
            invalid_categories: state.invalid.len(),
            invalid_category_ids: state.invalid.iter().cloned().collect(),
        }
    }

    pub fn clear(&self) {
        self.state().found.clear();
        info!("category cache cleared");
    }

    pub fn clear_prefetch(&self) {
        self.state().prefetched = None;
    }
}

/// Labels of a resolved hierarchy joined with `separator`.
pub fn hierarchy_path(chain: &[CategoryRecord], separator: &str) -> String {
    chain
        .iter()
        .map(|category| category.label.as_str())
        .collect::<Vec<_>>()
        .join(separator)
}
