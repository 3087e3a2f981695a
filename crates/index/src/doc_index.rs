use std::collections::{BTreeMap, HashMap};

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub fn index_name(tenant_id: &str) -> String {
    format!("kb_{tenant_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct IndexRecord {
    pub id: String,
    pub doc_id: String,
    pub kb_id: String,
    pub docnm: String,
    pub content: String,
    #[serde(default)]
    pub token_count: usize,
    #[serde(default)]
    pub img_id: Option<String>,
    #[serde(default)]
    pub knowledge_graph_kwd: Option<String>,
    pub vector: Vec<f32>,
    pub create_time: String,
    #[serde(default)]
    pub meta: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct IndexFilter {
    pub ids: Vec<String>,
    pub doc_id: Option<String>,
    pub knowledge_graph_kwd: Option<String>,
}

impl IndexFilter {
    pub fn by_doc(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: Some(doc_id.into()),
            ..Self::default()
        }
    }

    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &IndexRecord) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&record.id) {
            return false;
        }
        if let Some(doc_id) = &self.doc_id {
            if &record.doc_id != doc_id {
                return false;
            }
        }
        if let Some(kind) = &self.knowledge_graph_kwd {
            if record.knowledge_graph_kwd.as_ref() != Some(kind) {
                return false;
            }
        }
        true
    }
}

/// Search-index contract. Upserts are keyed by record id, so replaying the
/// same records is idempotent.
pub trait DocumentIndex: Send + Sync {
    fn index_exists(&self, index_name: &str, container: &str) -> Result<bool>;
    fn create_index(&self, index_name: &str, container: &str, vector_dim: usize) -> Result<()>;
    fn upsert(&self, records: &[IndexRecord], index_name: &str, container: &str) -> Result<usize>;
    fn delete(&self, filter: &IndexFilter, index_name: &str, container: &str) -> Result<usize>;
    fn update(
        &self,
        filter: &IndexFilter,
        patch: &Map<String, Value>,
        index_name: &str,
        container: &str,
    ) -> Result<usize>;
}

struct IndexTable {
    vector_dim: usize,
    records: BTreeMap<String, IndexRecord>,
}

#[derive(Default)]
pub struct MemoryIndex {
    tables: RwLock<HashMap<(String, String), IndexTable>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, index_name: &str, container: &str) -> Vec<IndexRecord> {
        self.tables
            .read()
            .get(&key(index_name, container))
            .map(|table| table.records.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn vector_dim(&self, index_name: &str, container: &str) -> Option<usize> {
        self.tables
            .read()
            .get(&key(index_name, container))
            .map(|table| table.vector_dim)
    }
}

fn key(index_name: &str, container: &str) -> (String, String) {
    (index_name.to_string(), container.to_string())
}

impl DocumentIndex for MemoryIndex {
    fn index_exists(&self, index_name: &str, container: &str) -> Result<bool> {
        Ok(self.tables.read().contains_key(&key(index_name, container)))
    }

    fn create_index(&self, index_name: &str, container: &str, vector_dim: usize) -> Result<()> {
        if vector_dim == 0 {
            return Err(anyhow!("vector dimension must be positive"));
        }
        let mut tables = self.tables.write();
        let table = tables
            .entry(key(index_name, container))
            .or_insert_with(|| IndexTable {
                vector_dim,
                records: BTreeMap::new(),
            });
        if table.vector_dim != vector_dim {
            return Err(anyhow!(
                "index {index_name}/{container} exists with dimension {}, requested {vector_dim}",
                table.vector_dim
            ));
        }
        Ok(())
    }

    fn upsert(&self, records: &[IndexRecord], index_name: &str, container: &str) -> Result<usize> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(&key(index_name, container))
            .ok_or_else(|| anyhow!("index {index_name}/{container} does not exist"))?;
        if let Some(bad) = records.iter().find(|r| r.vector.len() != table.vector_dim) {
            return Err(anyhow!(
                "record {} has dimension {}, index expects {}",
                bad.id,
                bad.vector.len(),
                table.vector_dim
            ));
        }
        for record in records {
            table.records.insert(record.id.clone(), record.clone());
        }
        Ok(records.len())
    }

    fn delete(&self, filter: &IndexFilter, index_name: &str, container: &str) -> Result<usize> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&key(index_name, container)) else {
            return Ok(0);
        };
        let before = table.records.len();
        table.records.retain(|_, record| !filter.matches(record));
        Ok(before - table.records.len())
    }

    fn update(
        &self,
        filter: &IndexFilter,
        patch: &Map<String, Value>,
        index_name: &str,
        container: &str,
    ) -> Result<usize> {
        let mut tables = self.tables.write();
        let Some(table) = tables.get_mut(&key(index_name, container)) else {
            return Ok(0);
        };
        let mut touched = 0usize;
        for record in table.records.values_mut().filter(|r| filter.matches(r)) {
            for (field, value) in patch {
                record.meta.insert(field.clone(), value.clone());
            }
            touched += 1;
        }
        Ok(touched)
    }
}
