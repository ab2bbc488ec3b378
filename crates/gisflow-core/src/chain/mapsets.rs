// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! `@mapset` suffix extraction.

use std::collections::BTreeSet;

fn is_mapset_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Collect every mapset named by an `@mapset` suffix in `value`.
///
/// A suffix ends at the first character that cannot appear in a mapset
/// name, so operators and punctuation of map-algebra expressions are never
/// part of the result.
pub fn extract_mapsets(value: &str) -> BTreeSet<String> {
    let mut mapsets = BTreeSet::new();
    let mut rest = value;
    while let Some(pos) = rest.find('@') {
        let tail = &rest[pos + 1..];
        let end = tail.find(|c: char| !is_mapset_char(c)).unwrap_or(tail.len());
        let name = tail[..end].trim_end_matches('.');
        if !name.is_empty() {
            mapsets.insert(name.to_string());
        }
        rest = &tail[end..];
    }
    mapsets
}

/// Whether `value` carries any `@mapset` suffix.
pub fn has_mapset_suffix(value: &str) -> bool {
    !extract_mapsets(value).is_empty()
}
