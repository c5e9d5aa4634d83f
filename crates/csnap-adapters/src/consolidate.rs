use std::collections::HashMap;

use csnap_core::Model;

/// Collapses per-variant model rows sharing a slug into one canonical record.
///
/// The base is the row with the shortest display name (first on ties). Its
/// `variants` lists the base's own variant first, then the others in input
/// order, without duplicates. Output follows first appearance of each slug.
pub fn consolidate_variants(models: Vec<Model>) -> Vec<Model> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Model>> = HashMap::new();
    for model in models {
        let group = groups.entry(model.slug.clone()).or_default();
        if group.is_empty() {
            order.push(model.slug.clone());
        }
        group.push(model);
    }

    order
        .into_iter()
        .filter_map(|slug| groups.remove(&slug))
        .filter_map(merge_group)
        .collect()
}

fn merge_group(group: Vec<Model>) -> Option<Model> {
    let base_idx = group
        .iter()
        .enumerate()
        .min_by_key(|(idx, model)| (model.name.chars().count(), *idx))
        .map(|(idx, _)| idx)?;

    let mut variants: Vec<String> = Vec::new();
    let base_variant = group[base_idx].variant.clone();
    let others = group
        .iter()
        .enumerate()
        .filter(|(idx, _)| *idx != base_idx)
        .filter_map(|(_, model)| model.variant.clone());
    for variant in base_variant.into_iter().chain(others) {
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }

    let mut base = group.into_iter().nth(base_idx)?;
    base.variants = variants;
    Some(base)
}
