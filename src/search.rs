//! Search/match sessions — snapshot queries with a swipe cursor.
//!
//! A session captures the matching item ids at execution time and never
//! refreshes them; items created or deleted afterwards do not change the
//! candidate sequence. Callers re-resolve each id through the store when
//! presenting or matching, so a since-deleted candidate degrades to a
//! not-found at that point rather than shifting positions.

use crate::model::Item;

/// What a search keyword is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// Any of name, category, description, or wanted.
    Common,
    /// Item name only.
    ByName,
    /// Wanted description only.
    ByWanted,
}

impl QueryKind {
    /// Parse a search-kind button tag.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "common" => Some(Self::Common),
            "name" => Some(Self::ByName),
            "wanted" => Some(Self::ByWanted),
            _ => None,
        }
    }

    /// Button label for the kind-selection keyboard.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Common => "Everything",
            Self::ByName => "Item Name",
            Self::ByWanted => "Wanted Item",
        }
    }

    /// Button tag for the kind-selection keyboard.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Common => "common",
            Self::ByName => "name",
            Self::ByWanted => "wanted",
        }
    }
}

/// An ephemeral per-user swipe cursor over a fixed candidate sequence.
#[derive(Debug, Clone)]
pub struct SearchSession {
    pub kind: QueryKind,
    pub keyword: String,
    result_ids: Vec<i64>,
    cursor: usize,
}

impl SearchSession {
    /// Run a case-insensitive substring query over a point-in-time item
    /// snapshot. Result order preserves the snapshot (repository) order.
    pub fn execute(kind: QueryKind, keyword: &str, items: &[Item]) -> Self {
        let needle = keyword.to_lowercase();
        let result_ids = items
            .iter()
            .filter(|item| matches(kind, &needle, item))
            .map(|item| item.id)
            .collect();

        Self {
            kind,
            keyword: keyword.to_string(),
            result_ids,
            cursor: 0,
        }
    }

    /// The candidate id at the cursor, or `None` once past the end.
    pub fn current(&self) -> Option<i64> {
        self.result_ids.get(self.cursor).copied()
    }

    /// Advance the cursor one candidate (saturating at one past the end).
    pub fn advance(&mut self) {
        if self.cursor < self.result_ids.len() {
            self.cursor += 1;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.result_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.result_ids.len()
    }
}

fn matches(kind: QueryKind, needle: &str, item: &Item) -> bool {
    let hit = |field: &str| field.to_lowercase().contains(needle);
    match kind {
        QueryKind::Common => {
            hit(&item.name) || hit(&item.category) || hit(&item.description) || hit(&item.wanted)
        }
        QueryKind::ByName => hit(&item.name),
        QueryKind::ByWanted => hit(&item.wanted),
    }
}
