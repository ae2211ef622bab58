//! Change logs and incomplete references
//!
//! External documents reference catalog entries by textual item id and numeric
//! color id. Identifiers get retired over time; the change log maps an old
//! `(type, id)` pair or color id to its current equivalent. The log is only
//! consulted after direct lookup fails, and a reference that cannot be
//! resolved either way is kept as an [`Incomplete`] record with its original
//! identifiers for diagnostic display, never silently dropped.

use crate::catalog::Catalog;
use crate::types::{Color, Item};
use std::cmp::Ordering;
use tracing::{debug, warn};

/// One item rename or retype: old `(type, id)` to new `(type, id)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemChange {
    pub from_type_id: char,
    pub from_id: String,
    pub to_type_id: char,
    pub to_id: String,
}

/// One color id rename
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorChange {
    pub from_id: u32,
    pub to_id: u32,
}

/// How a stale reference got resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution<T> {
    /// direct catalog lookup succeeded
    Direct(T),
    /// found via the change log, re-resolved against the current catalog
    ChangeLog(T),
    /// neither direct nor change-log lookup succeeded
    Fail,
}

impl<T> Resolution<T> {
    pub fn ok(self) -> Option<T> {
        match self {
            Resolution::Direct(v) | Resolution::ChangeLog(v) => Some(v),
            Resolution::Fail => None,
        }
    }
}

/// A reference that failed catalog lookup, kept with the identifiers it
/// arrived with. This is data for the caller to display, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Incomplete {
    pub item_id: String,
    pub item_name: String,
    pub item_type_id: Option<char>,
    pub item_type_name: String,
    pub category_id: Option<u32>,
    pub category_name: String,
    pub color_id: Option<u32>,
    pub color_name: String,
}

/// The two sorted rename tables
#[derive(Debug, Default)]
pub struct ChangeLog {
    item_changes: Vec<ItemChange>,
    color_changes: Vec<ColorChange>,
}

impl ChangeLog {
    pub fn new() -> Self {
        ChangeLog::default()
    }

    /// Replace both tables wholesale; they are re-sorted by old key.
    pub fn replace(&mut self, mut items: Vec<ItemChange>, mut colors: Vec<ColorChange>) {
        items.sort_by(|a, b| cmp_item_change(a, b.from_type_id, &b.from_id));
        colors.sort_by_key(|c| c.from_id);
        self.item_changes = items;
        self.color_changes = colors;
    }

    pub fn item_changes(&self) -> &[ItemChange] {
        &self.item_changes
    }

    pub fn color_changes(&self) -> &[ColorChange] {
        &self.color_changes
    }

    pub fn item_change(&self, type_id: char, id: &str) -> Option<&ItemChange> {
        self.item_changes
            .binary_search_by(|c| cmp_item_change(c, type_id, id))
            .ok()
            .map(|i| &self.item_changes[i])
    }

    pub fn color_change(&self, id: u32) -> Option<u32> {
        self.color_changes
            .binary_search_by_key(&id, |c| c.from_id)
            .ok()
            .map(|i| self.color_changes[i].to_id)
    }

    /// Resolve an item reference: direct lookup over the candidate type ids
    /// first, then one change-log hop re-checked against the current catalog.
    pub fn resolve_item<'a>(
        &self,
        catalog: &'a Catalog,
        type_ids: &[char],
        id: &str,
    ) -> Resolution<&'a Item> {
        if let Some(item) = catalog.item_any(type_ids, id) {
            return Resolution::Direct(item);
        }
        for &type_id in type_ids {
            if let Some(change) = self.item_change(type_id, id) {
                if let Some(item) = catalog.item(change.to_type_id, &change.to_id) {
                    debug!(
                        from = %format_args!("{}/{}", type_id, id),
                        to = %format_args!("{}/{}", change.to_type_id, change.to_id),
                        "item resolved via change log"
                    );
                    return Resolution::ChangeLog(item);
                }
            }
        }
        warn!(?type_ids, id, "item reference did not resolve");
        Resolution::Fail
    }

    pub fn resolve_color<'a>(&self, catalog: &'a Catalog, id: u32) -> Resolution<&'a Color> {
        if let Some(color) = catalog.color(id) {
            return Resolution::Direct(color);
        }
        if let Some(to_id) = self.color_change(id) {
            if let Some(color) = catalog.color(to_id) {
                debug!(from = id, to = to_id, "color resolved via change log");
                return Resolution::ChangeLog(color);
            }
        }
        warn!(id, "color reference did not resolve");
        Resolution::Fail
    }
}

fn cmp_item_change(change: &ItemChange, type_id: char, id: &str) -> Ordering {
    change
        .from_type_id
        .cmp(&type_id)
        .then_with(|| change.from_id.as_str().cmp(id))
}
