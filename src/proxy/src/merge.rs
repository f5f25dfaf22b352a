// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Merging of per-shard read results.
//!
//! Both merges are pure functions of their inputs: the same partial results
//! always merge to the same output, whatever order shards answered in.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use itertools::Itertools;
use vdb_ore::cast::CastFrom;
use vdb_timestamp_oracle::Timestamp;

use crate::error::MergeError;
use crate::types::{FieldColumn, MetricType, PrimaryKey, RetrieveResults, SearchResultData};

/// Field columns with no rows, shaped like those of the first partial that
/// has any.
fn empty_fields<'a>(mut columns: impl Iterator<Item = &'a [FieldColumn]>) -> Vec<FieldColumn> {
    columns
        .find(|fields| !fields.is_empty())
        .unwrap_or_default()
        .iter()
        .map(|f| FieldColumn {
            field_name: f.field_name.clone(),
            data: f.data.empty_like(),
        })
        .collect()
}

/// Appends row `row` of `source` to each column of `out`.
fn push_row(
    out: &mut [FieldColumn],
    source: &[FieldColumn],
    row: usize,
) -> Result<(), MergeError> {
    for column in out {
        let from = source
            .iter()
            .find(|f| f.field_name == column.field_name)
            .ok_or_else(|| {
                MergeError::Malformed(format!("missing output field {}", column.field_name))
            })?;
        if !column.data.push_from(&from.data, row) {
            return Err(MergeError::Malformed(format!(
                "type of field {} differs between shards",
                column.field_name
            )));
        }
    }
    Ok(())
}

fn check_columns(fields: &[FieldColumn], rows: usize) -> Result<(), MergeError> {
    match fields.iter().find(|f| f.data.num_rows() != rows) {
        Some(f) => Err(MergeError::Malformed(format!(
            "field {} has {} rows, expected {rows}",
            f.field_name,
            f.data.num_rows()
        ))),
        None => Ok(()),
    }
}

fn check_search_partial(partial: &SearchResultData, nq: u32) -> Result<(), MergeError> {
    if partial.nq != nq {
        return Err(MergeError::NqMismatch {
            expected: nq,
            got: partial.nq,
        });
    }
    let hits: u64 = partial.topks.iter().copied().map(u64::from).sum();
    if partial.topks.len() != usize::cast_from(nq)
        || u64::cast_from(partial.ids.len()) != hits
        || partial.scores.len() != partial.ids.len()
    {
        return Err(MergeError::Malformed(format!(
            "{} topks, {} hits, {} ids and {} scores for nq {nq}",
            partial.topks.len(),
            hits,
            partial.ids.len(),
            partial.scores.len()
        )));
    }
    check_columns(&partial.fields, partial.ids.len())
}

/// A candidate hit: where it lives, and what it is ranked by.
struct Hit<'a> {
    partial: usize,
    row: usize,
    id: &'a PrimaryKey,
    score: f32,
}

/// Merges the search results of several shards into the global top hits.
///
/// Per query, hits are ranked best first by `metric`'s direction, with ties
/// broken by the lower primary key. A key found on several shards keeps
/// only its best hit. The first `offset` hits are skipped and at most
/// `topk` kept.
pub fn reduce_search_results(
    partials: &[SearchResultData],
    nq: u32,
    topk: u32,
    offset: u32,
    metric: MetricType,
) -> Result<SearchResultData, MergeError> {
    for partial in partials {
        check_search_partial(partial, nq)?;
    }

    let rank = |a: &Hit, b: &Hit| -> Ordering {
        let by_score = if metric.larger_is_closer() {
            b.score.total_cmp(&a.score)
        } else {
            a.score.total_cmp(&b.score)
        };
        by_score
            .then_with(|| a.id.cmp(b.id))
            .then_with(|| (a.partial, a.row).cmp(&(b.partial, b.row)))
    };

    // Offsets of each query's first hit within each partial.
    let starts: Vec<Vec<usize>> = partials
        .iter()
        .map(|p| {
            p.topks
                .iter()
                .scan(0, |start, k| {
                    let this = *start;
                    *start += usize::cast_from(*k);
                    Some(this)
                })
                .collect()
        })
        .collect();

    let mut merged = SearchResultData::empty(nq, topk);
    merged.fields = empty_fields(partials.iter().map(|p| p.fields.as_slice()));
    for q in 0..usize::cast_from(nq) {
        let candidates = partials.iter().enumerate().flat_map(|(i, p)| {
            let start = starts[i][q];
            (start..start + usize::cast_from(p.topks[q])).map(move |row| Hit {
                partial: i,
                row,
                id: &p.ids[row],
                score: p.scores[row],
            })
        });
        let selected = candidates
            .sorted_by(|a, b| rank(a, b))
            .unique_by(|hit| hit.id)
            .skip(usize::cast_from(offset))
            .take(usize::cast_from(topk));
        let mut kept = 0;
        for hit in selected {
            merged.ids.push(hit.id.clone());
            merged.scores.push(hit.score);
            push_row(&mut merged.fields, &partials[hit.partial].fields, hit.row)?;
            kept += 1;
        }
        merged.topks[q] = kept;
    }
    Ok(merged)
}

/// Unions the rows retrieved from several shards.
///
/// A key returned by more than one shard keeps the row with the latest
/// timestamp. Rows are ordered by key; at most `limit` are kept.
pub fn merge_retrieve_results(
    partials: &[RetrieveResults],
    limit: Option<u32>,
) -> Result<RetrieveResults, MergeError> {
    for partial in partials {
        if partial.timestamps.len() != partial.ids.len() {
            return Err(MergeError::Malformed(format!(
                "{} ids but {} timestamps",
                partial.ids.len(),
                partial.timestamps.len()
            )));
        }
        check_columns(&partial.fields, partial.ids.len())?;
    }

    let mut latest: BTreeMap<&PrimaryKey, (Timestamp, usize, usize)> = BTreeMap::new();
    for (i, partial) in partials.iter().enumerate() {
        for (row, (id, ts)) in partial.ids.iter().zip(&partial.timestamps).enumerate() {
            let candidate = (*ts, i, row);
            latest
                .entry(id)
                .and_modify(|current| {
                    if candidate.0 > current.0 {
                        *current = candidate;
                    }
                })
                .or_insert(candidate);
        }
    }

    let limit = limit.map_or(usize::MAX, usize::cast_from);
    let mut merged = RetrieveResults {
        fields: empty_fields(partials.iter().map(|p| p.fields.as_slice())),
        ..Default::default()
    };
    for (id, (ts, partial, row)) in latest.into_iter().take(limit) {
        merged.ids.push(id.clone());
        merged.timestamps.push(ts);
        push_row(&mut merged.fields, &partials[partial].fields, row)?;
    }
    Ok(merged)
}
