//! Autocatalog placement.
//!
//! Catalogs that grow past `max_weight` entries are split by introducing
//! nested-catalog mountpoints at directories whose subtree weight fits the
//! `[min_weight, max_weight]` band; catalogs that shrink below `min_weight`
//! are dissolved back into their parent. The balancer runs at commit time,
//! before snapshotting.

use tracing::{debug, info};

use crate::errors::CatalogError;
use crate::manager::{CatalogTree, Route};
use crate::path::CatalogPath;

#[derive(Clone, Copy, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BalancerConfig {
    /// A catalog heavier than this is split.
    pub max_weight: u64,
    /// A nested catalog lighter than this is merged back, and no new
    /// mountpoint is placed on a subtree lighter than this if avoidable.
    pub min_weight: u64,
}

/// One directory entry of the catalog being balanced. Weight is the
/// residual subtree weight: 1 + Σ children, minus subtrees already marked
/// as new mountpoints.
struct VirtualNode {
    path: CatalogPath,
    weight: u64,
    depth: usize,
    parent: Option<usize>,
    is_directory: bool,
    /// An existing nested mountpoint; the balancer does not descend into
    /// other catalogs.
    is_catalog: bool,
    marked: bool,
}

pub(crate) fn balance_tree(
    tree: &mut CatalogTree,
    config: &BalancerConfig,
) -> Result<(), CatalogError> {
    // Split pass.
    let overweight: Vec<usize> = tree
        .live_nodes()
        .filter(|idx| tree.node(*idx).store.counters().entry_count > config.max_weight)
        .collect();
    for idx in overweight {
        if tree.nodes[idx].is_none() {
            continue;
        }
        let mut virtual_nodes = build_virtual_tree(tree, idx)?;
        let mountpoints = optimal_partition(&mut virtual_nodes, config);
        for mountpoint in mountpoints {
            match tree.route(&mountpoint)? {
                Route::Loaded(at) => tree.create_nested_catalog_at(at, &mountpoint)?,
                Route::NeedsLoad { .. } => {
                    return Err(CatalogError::Fatal(format!(
                        "balancer routed {mountpoint} into an unloaded catalog"
                    )))
                }
            }
            info!(mountpoint = %mountpoint, "balancer introduced nested catalog");
        }
    }

    // Merge pass: keep dissolving until nothing qualifies, since a merge
    // changes the parent's weight.
    loop {
        let mut merged = false;
        for idx in tree.live_nodes().collect::<Vec<_>>() {
            if tree.nodes[idx].is_none() {
                continue;
            }
            let (mountpoint, weight, parent) = {
                let node = tree.node(idx);
                let Some(parent) = node.parent else { continue };
                (
                    node.mountpoint.clone(),
                    node.store.counters().entry_count,
                    parent,
                )
            };
            if weight >= config.min_weight {
                continue;
            }
            // The child's root copy dissolves into the parent's existing
            // mountpoint copy.
            let parent_weight = tree.node(parent).store.counters().entry_count;
            if parent_weight + weight - 1 > config.max_weight {
                continue;
            }
            debug!(mountpoint = %mountpoint, weight, "balancer dissolving underweight catalog");
            tree.remove_nested_catalog_at(idx, &mountpoint)?;
            merged = true;
        }
        if !merged {
            break;
        }
    }
    Ok(())
}

/// Materialize the catalog's own directory structure, not descending into
/// nested children, and compute subtree weights.
fn build_virtual_tree(
    tree: &mut CatalogTree,
    idx: usize,
) -> Result<Vec<VirtualNode>, CatalogError> {
    let mountpoint = tree.node(idx).mountpoint.clone();
    let mut nodes = vec![VirtualNode {
        path: mountpoint,
        weight: 1,
        depth: 0,
        parent: None,
        is_directory: true,
        is_catalog: false,
        marked: false,
    }];

    let mut stack = vec![0usize];
    while let Some(current) = stack.pop() {
        let current_path = nodes[current].path.clone();
        let current_depth = nodes[current].depth;
        for (path, entry) in tree.node_mut(idx).store.list_children(&current_path)? {
            let is_directory = entry.is_directory();
            let is_catalog = entry.nested_mountpoint;
            let child = nodes.len();
            nodes.push(VirtualNode {
                path,
                weight: 1,
                depth: current_depth + 1,
                parent: Some(current),
                is_directory,
                is_catalog,
                marked: false,
            });
            if is_directory && !is_catalog {
                stack.push(child);
            }
        }
    }

    // Children always follow their parent, so one reverse sweep settles
    // all subtree weights.
    for current in (1..nodes.len()).rev() {
        let weight = nodes[current].weight;
        let parent = nodes[current].parent.expect("non-root virtual node");
        nodes[parent].weight += weight;
    }
    Ok(nodes)
}

/// Pick new mountpoints until the catalog's residual weight fits, preferring
/// the heaviest directory within the `[min, max]` band; ties break towards
/// the lexicographically smaller path. Without an in-band candidate, the
/// deepest directory still under `max_weight` is taken.
fn optimal_partition(nodes: &mut [VirtualNode], config: &BalancerConfig) -> Vec<CatalogPath> {
    let mut mountpoints = Vec::new();
    // Each round marks one subtree, so this is a hard iteration bound.
    for _ in 0..nodes.len() {
        if nodes[0].weight <= config.max_weight {
            break;
        }
        let Some(chosen) = best_candidate(nodes, config) else {
            break;
        };

        let weight = nodes[chosen].weight;
        nodes[chosen].marked = true;
        mountpoints.push(nodes[chosen].path.clone());

        let mut cursor = nodes[chosen].parent;
        while let Some(parent) = cursor {
            nodes[parent].weight -= weight;
            cursor = nodes[parent].parent;
        }
    }
    mountpoints.sort();
    mountpoints
}

fn eligible(nodes: &[VirtualNode], idx: usize) -> bool {
    if idx == 0 || !nodes[idx].is_directory || nodes[idx].is_catalog || nodes[idx].marked {
        return false;
    }
    // Subtrees already split off are out of play.
    let mut cursor = nodes[idx].parent;
    while let Some(parent) = cursor {
        if nodes[parent].marked {
            return false;
        }
        cursor = nodes[parent].parent;
    }
    true
}

fn best_candidate(nodes: &[VirtualNode], config: &BalancerConfig) -> Option<usize> {
    // Preferred: heaviest directory inside the band, ties towards the
    // lexicographically smaller path.
    let in_band = (1..nodes.len())
        .filter(|idx| eligible(nodes, *idx))
        .filter(|idx| {
            nodes[*idx].weight >= config.min_weight && nodes[*idx].weight <= config.max_weight
        })
        .min_by(|a, b| {
            nodes[*b]
                .weight
                .cmp(&nodes[*a].weight)
                .then_with(|| nodes[*a].path.cmp(&nodes[*b].path))
        });
    if in_band.is_some() {
        return in_band;
    }

    // Fallback: the deepest directory still under the maximum. Subtrees of
    // weight 1 are just the directory itself and cannot reduce anything.
    (1..nodes.len())
        .filter(|idx| eligible(nodes, *idx))
        .filter(|idx| nodes[*idx].weight > 1 && nodes[*idx].weight < config.max_weight)
        .min_by(|a, b| {
            nodes[*b]
                .depth
                .cmp(&nodes[*a].depth)
                .then_with(|| nodes[*b].weight.cmp(&nodes[*a].weight))
                .then_with(|| nodes[*a].path.cmp(&nodes[*b].path))
        })
}
