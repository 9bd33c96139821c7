//! Tag reconciliation: make sure every candidate tag exists and learn its id.
//!
//! Callers run these functions inside one transaction while holding the
//! repository's write guard, so no other writer can interleave between the
//! insert and the lookup.

use std::collections::{HashMap, HashSet};

use rusqlite::{params_from_iter, Connection, ToSql};
use thiserror::Error;

use crate::models::{NewTag, Tag, TagCandidate};

use super::query::{repeat_group, TAG_COLUMNS};

/// Rows per generated statement. Two bound values per row keeps each
/// statement well under SQLite's parameter limit.
pub(crate) const MAX_BATCH_ROWS: usize = 400;

#[derive(Debug, Error)]
#[error("expected {expected} tags after insert, found {found}")]
pub struct ReconcileMismatch {
    pub expected: usize,
    pub found: usize,
}

/// Distinct natural keys of the unresolved candidates, in first-seen order.
pub(crate) fn pending_keys(candidates: &[TagCandidate]) -> Vec<NewTag> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .filter_map(|candidate| match candidate {
            TagCandidate::Unresolved(tag) if seen.insert(tag.clone()) => Some(tag.clone()),
            _ => None,
        })
        .collect()
}

/// Returns the tags unchanged when every candidate already carries an id.
pub(crate) fn all_resolved(candidates: &[TagCandidate]) -> Option<Vec<Tag>> {
    candidates
        .iter()
        .map(|candidate| match candidate {
            TagCandidate::Resolved(tag) => Some(tag.clone()),
            TagCandidate::Unresolved(_) => None,
        })
        .collect()
}

/// `INSERT OR IGNORE` every tag; existing (name, type) pairs are skipped.
pub(crate) fn insert_tags(conn: &Connection, tags: &[NewTag]) -> rusqlite::Result<usize> {
    let mut inserted = 0;
    for chunk in tags.chunks(MAX_BATCH_ROWS) {
        let sql = format!(
            "INSERT OR IGNORE INTO tag (name, type) VALUES {}",
            repeat_group("(?,?)", chunk.len())
        );
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 2);
        for tag in chunk {
            params.push(&tag.name);
            params.push(&tag.kind);
        }
        inserted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(inserted)
}

pub(crate) fn lookup_tags(conn: &Connection, keys: &[NewTag]) -> rusqlite::Result<Vec<Tag>> {
    let mut found = Vec::with_capacity(keys.len());
    for chunk in keys.chunks(MAX_BATCH_ROWS) {
        let sql = format!(
            "SELECT {TAG_COLUMNS} FROM tag WHERE (tag.name, tag.type) IN (VALUES {})",
            repeat_group("(?,?)", chunk.len())
        );
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() * 2);
        for tag in chunk {
            params.push(&tag.name);
            params.push(&tag.kind);
        }
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), tag_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        found.extend(rows);
    }
    Ok(found)
}

/// Inserts missing tags, looks their ids up and returns one tag per
/// candidate in input order.
pub(crate) fn reconcile(
    conn: &Connection,
    candidates: Vec<TagCandidate>,
) -> tokio_rusqlite::Result<Vec<Tag>> {
    let pending = pending_keys(&candidates);
    if pending.is_empty() {
        return Ok(all_resolved(&candidates).unwrap_or_default());
    }

    insert_tags(conn, &pending)?;
    let found = lookup_tags(conn, &pending)?;

    if found.len() != pending.len() {
        return Err(mismatch(pending.len(), found.len()));
    }

    let by_key: HashMap<NewTag, Tag> = found
        .into_iter()
        .map(|tag| (NewTag::from(tag.clone()), tag))
        .collect();

    candidates
        .into_iter()
        .map(|candidate| match candidate {
            TagCandidate::Resolved(tag) => Ok(tag),
            TagCandidate::Unresolved(key) => by_key
                .get(&key)
                .cloned()
                .ok_or_else(|| mismatch(pending.len(), by_key.len())),
        })
        .collect()
}

fn mismatch(expected: usize, found: usize) -> tokio_rusqlite::Error {
    tracing::error!(expected, found, "tag reconciliation mismatch");
    tokio_rusqlite::Error::Other(Box::new(ReconcileMismatch { expected, found }))
}

pub(crate) fn tag_from_row(row: &rusqlite::Row) -> rusqlite::Result<Tag> {
    Ok(Tag {
        id: row.get(0)?,
        name: row.get(1)?,
        kind: row.get(2)?,
    })
}
