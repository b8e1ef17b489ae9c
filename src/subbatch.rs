//! Cost-bounded sub-batching.
//!
//! Groups items so that each group's total cost stays within a budget, runs a
//! function per group and puts the per-item results back in input order.

use rayon::prelude::*;

use crate::Error;

/// One group of items with their positions in the original input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subbatch<'a, T> {
    pub ids: Vec<usize>,
    pub items: Vec<&'a T>,
}

impl<'a, T> Subbatch<'a, T> {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Totals of the whole batch, carried into every sub-batch so losses are
/// normalized by the original batch rather than the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubbatchMeta {
    pub batch_size: usize,
    pub batch_num_tokens: usize,
}

impl SubbatchMeta {
    pub fn new(batch_size: usize, batch_num_tokens: usize) -> Self {
        Self {
            batch_size,
            batch_num_tokens,
        }
    }
}

/// Every item needs exactly one cost.
fn check_costs<T>(items: &[T], costs: &[usize]) -> crate::Result<()> {
    if items.len() != costs.len() {
        return Err(Error::SubbatchMismatch {
            expected: items.len(),
            got: costs.len(),
        });
    }
    Ok(())
}

fn group<'a, T>(items: &'a [T], ids: Vec<usize>) -> Subbatch<'a, T> {
    let items = ids.iter().map(|&i| &items[i]).collect();
    Subbatch { ids, items }
}

/// Greedily groups items in input order.
///
/// A group is closed as soon as the next item would push its total over
/// `max_cost`. An item that alone exceeds the budget ends up by itself.
pub fn split<'a, T>(items: &'a [T], costs: &[usize], max_cost: usize) -> crate::Result<Vec<Subbatch<'a, T>>> {
    check_costs(items, costs)?;
    let mut groups = Vec::new();
    let mut ids = Vec::new();
    let mut total = 0;
    for (i, &cost) in costs.iter().enumerate() {
        if !ids.is_empty() && total + cost > max_cost {
            groups.push(group(items, std::mem::take(&mut ids)));
            total = 0;
        }
        ids.push(i);
        total += cost;
    }
    if !ids.is_empty() {
        groups.push(group(items, ids));
    }
    Ok(groups)
}

/// Groups items sorted by cost, charging each group `len × max member cost`,
/// i.e. the size of the padded batch it becomes.
pub fn split_sorted<'a, T>(items: &'a [T], costs: &[usize], max_cost: usize) -> crate::Result<Vec<Subbatch<'a, T>>> {
    check_costs(items, costs)?;
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| costs[i]);
    let mut groups = Vec::new();
    let mut rest = &order[..];
    while !rest.is_empty() {
        let mut size = 1;
        while size < rest.len() && (size + 1) * costs[rest[size]] <= max_cost {
            size += 1;
        }
        groups.push(group(items, rest[..size].to_vec()));
        rest = &rest[size..];
    }
    Ok(groups)
}

fn scatter<R, E: From<Error>>(n: usize, outputs: Vec<(Vec<usize>, Vec<R>)>) -> Result<Vec<R>, E> {
    let mut slots: Vec<Option<R>> = (0..n).map(|_| None).collect();
    for (ids, results) in outputs {
        if ids.len() != results.len() {
            return Err(Error::SubbatchMismatch {
                expected: ids.len(),
                got: results.len(),
            }
            .into());
        }
        for (i, r) in ids.into_iter().zip(results) {
            slots[i] = Some(r);
        }
    }
    slots
        .into_iter()
        .map(|r| r.ok_or_else(|| Error::SubbatchMismatch { expected: n, got: 0 }.into()))
        .collect()
}

/// Runs `f` once per group and returns one result per item, in input order.
///
/// The first failing group aborts the call.
pub fn map<T, R, E, F>(mut f: F, items: &[T], costs: &[usize], max_cost: usize) -> Result<Vec<R>, E>
where
    E: From<Error>,
    F: FnMut(&[&T]) -> Result<Vec<R>, E>,
{
    let groups = split(items, costs, max_cost)?;
    log::debug!("{} items in {} sub-batches (max cost {max_cost})", items.len(), groups.len());
    let mut outputs = Vec::with_capacity(groups.len());
    for g in groups {
        let results = f(&g.items)?;
        outputs.push((g.ids, results));
    }
    scatter(items.len(), outputs)
}

/// Like [`map`], with the groups dispatched on the rayon pool.
pub fn par_map<T, R, E, F>(f: F, items: &[T], costs: &[usize], max_cost: usize) -> Result<Vec<R>, E>
where
    T: Sync,
    R: Send,
    E: From<Error> + Send,
    F: Fn(&[&T]) -> Result<Vec<R>, E> + Sync,
{
    let groups = split(items, costs, max_cost)?;
    log::debug!("{} items in {} parallel sub-batches (max cost {max_cost})", items.len(), groups.len());
    let outputs = groups
        .into_par_iter()
        .map(|g| f(&g.items).map(|results| (g.ids, results)))
        .collect::<Result<Vec<_>, E>>()?;
    scatter(items.len(), outputs)
}
