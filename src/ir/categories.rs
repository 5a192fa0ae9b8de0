//! Category table: the ordered name <-> id mapping shared by a conversion
//! session.
//!
//! Id assignment is deterministic and monotonic (max existing id + 1, or 0
//! for an empty table) so that category ids round-trip stably across
//! export/import cycles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::LabelpivotError;

/// A single category (class label).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub id: usize,
}

impl Category {
    pub fn new(name: impl Into<String>, id: usize) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

/// Ordered, mutable collection of categories with name and id lookup.
#[derive(Clone, Debug, Default)]
pub struct CategoryTable {
    categories: Vec<Category>,
    id_lookup: BTreeMap<usize, usize>,
    name_lookup: BTreeMap<String, usize>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from `(id, name)` pairs, preserving the given ids.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (usize, String)>) -> Self {
        let mut table = Self::new();
        for (id, name) in pairs {
            table.add(name, Some(id));
        }
        table
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.name_lookup.contains_key(name)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Category> {
        self.name_lookup
            .get(name)
            .map(|&index| &self.categories[index])
    }

    pub fn get_by_id(&self, id: usize) -> Option<&Category> {
        self.id_lookup.get(&id).map(|&index| &self.categories[index])
    }

    /// Lookup by name, failing with [`LabelpivotError::UnknownCategory`].
    pub fn require_by_name(&self, name: &str) -> Result<&Category, LabelpivotError> {
        self.get_by_name(name)
            .ok_or_else(|| LabelpivotError::UnknownCategory {
                query: name.to_string(),
            })
    }

    /// Lookup by id, failing with [`LabelpivotError::UnknownCategory`].
    pub fn require_by_id(&self, id: usize) -> Result<&Category, LabelpivotError> {
        self.get_by_id(id)
            .ok_or_else(|| LabelpivotError::UnknownCategory {
                query: id.to_string(),
            })
    }

    /// Appends a category. When `id` is not supplied, assigns
    /// `max(existing ids) + 1`, or 0 for an empty table.
    pub fn add(&mut self, name: impl Into<String>, id: Option<usize>) -> Category {
        let id = id.unwrap_or_else(|| {
            self.id_lookup
                .keys()
                .next_back()
                .map(|max| max + 1)
                .unwrap_or(0)
        });
        let category = Category::new(name, id);

        let index = self.categories.len();
        self.id_lookup.insert(category.id, index);
        self.name_lookup.insert(category.name.clone(), index);
        self.categories.push(category.clone());
        category
    }

    /// Returns the category with this name, creating it with an
    /// auto-assigned id when unseen.
    pub fn get_or_create(&mut self, name: &str) -> Category {
        if let Some(existing) = self.get_by_name(name) {
            return existing.clone();
        }
        self.add(name, None)
    }
}
