//! Phase graph & path algebra: the builder primitives used to assemble a
//! plan's phase tree, and `resolve`, which rewrites every `requires` entry
//! into absolute form and performs the one-time cycle check.
//!
//! Structured as an arena of phases with an adjacency-list index,
//! generalized from a flat `Vec<Phase>` keyed by phase *number* to a
//! hierarchical, slash-path keyed tree. The arena view here for cycle
//! detection and traversal trades reference juggling for integer ids
//! resolved at finalize time.

use std::collections::{HashMap, HashSet, VecDeque};

use clusterup_common::{ClusterupError, Phase, PhasePath};

/// Index into the flattened arena built by [`flatten`].
pub type PhaseIndex = usize;

/// A flattened, read-only view over a phase tree's dependency structure,
/// built once after the tree is fully assembled. Used for cycle
/// detection and for the engine's "is every transitive prerequisite
/// complete" check — the tree itself (`Vec<Phase>` with owned children)
/// remains the source of truth for state.
pub struct PhaseArena {
    ids: Vec<PhasePath>,
    index_of: HashMap<PhasePath, PhaseIndex>,
    requires: Vec<Vec<PhaseIndex>>,
}

impl PhaseArena {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn index_of(&self, id: &PhasePath) -> Option<PhaseIndex> {
        self.index_of.get(id).copied()
    }

    pub fn id_at(&self, index: PhaseIndex) -> &PhasePath {
        &self.ids[index]
    }

    pub fn requires(&self, index: PhaseIndex) -> &[PhaseIndex] {
        &self.requires[index]
    }
}

/// Walk a phase tree and collect every node (not just leaves) into a flat
/// arena, indexed by discovery order.
pub fn flatten(roots: &[Phase]) -> Result<PhaseArena, ClusterupError> {
    let mut ids = Vec::new();
    let mut index_of = HashMap::new();

    fn walk(phase: &Phase, ids: &mut Vec<PhasePath>, index_of: &mut HashMap<PhasePath, PhaseIndex>) {
        index_of.insert(phase.id.clone(), ids.len());
        ids.push(phase.id.clone());
        for child in &phase.phases {
            walk(child, ids, index_of);
        }
    }
    for root in roots {
        walk(root, &mut ids, &mut index_of);
    }

    // Path uniqueness (invariant 1).
    if index_of.len() != ids.len() {
        let mut seen = HashSet::new();
        for id in &ids {
            if !seen.insert(id.clone()) {
                return Err(ClusterupError::validation(format!("duplicate phase id {id}")));
            }
        }
    }

    let mut requires = vec![Vec::new(); ids.len()];
    fn collect_requires(
        phase: &Phase,
        index_of: &HashMap<PhasePath, PhaseIndex>,
        requires: &mut Vec<Vec<PhaseIndex>>,
    ) -> Result<(), ClusterupError> {
        let this_idx = index_of[&phase.id];
        for req in &phase.requires {
            let req_idx = index_of.get(req).ok_or_else(|| {
                ClusterupError::validation(format!(
                    "phase {} requires unknown phase {}",
                    phase.id, req
                ))
            })?;
            requires[this_idx].push(*req_idx);
        }
        for child in &phase.phases {
            collect_requires(child, index_of, requires)?;
        }
        Ok(())
    }
    for root in roots {
        collect_requires(root, &index_of, &mut requires)?;
    }

    Ok(PhaseArena { ids, index_of, requires })
}

/// Rewrite every `requires` entry from the short (parent-relative) form
/// into absolute form, then run the one-time cycle check. Called once,
/// immediately after the Plan Builder finishes assembling a tree;
/// failing the cycle check here is a programming error in the builder,
/// not a runtime fault.
pub fn resolve(roots: &mut [Phase]) -> Result<(), ClusterupError> {
    fn absolutize(phase: &mut Phase, parent: &PhasePath) -> Result<(), ClusterupError> {
        let mut resolved = std::collections::BTreeSet::new();
        for req in &phase.requires {
            if req.as_str().starts_with('/') {
                resolved.insert(req.clone());
            } else {
                resolved.insert(parent.join(req.as_str())?);
            }
        }
        phase.requires = resolved;
        for child in &mut phase.phases {
            absolutize(child, &phase.id)?;
        }
        Ok(())
    }
    for root in roots.iter_mut() {
        let parent = root.id.clone();
        absolutize(root, &parent)?;
    }

    let arena = flatten(roots)?;
    validate_no_cycles(&arena)?;
    validate_no_self_or_descendant_dependency(roots)?;
    Ok(())
}

/// Kahn's algorithm over the `requires` adjacency: a phase depends on its
/// prerequisites, so we process phases whose prerequisites are all
/// resolved first. Leftover unprocessed nodes are the cycle.
fn validate_no_cycles(arena: &PhaseArena) -> Result<(), ClusterupError> {
    let n = arena.len();
    let mut dependents: Vec<Vec<PhaseIndex>> = vec![Vec::new(); n];
    let mut remaining_deps = vec![0usize; n];
    for idx in 0..n {
        remaining_deps[idx] = arena.requires(idx).len();
        for &dep in arena.requires(idx) {
            dependents[dep].push(idx);
        }
    }

    let mut queue: VecDeque<PhaseIndex> =
        (0..n).filter(|&i| remaining_deps[i] == 0).collect();
    let mut processed = 0usize;
    while let Some(idx) = queue.pop_front() {
        processed += 1;
        for &dependent in &dependents[idx] {
            remaining_deps[dependent] -= 1;
            if remaining_deps[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }

    if processed != n {
        let cyclic: Vec<String> = (0..n)
            .filter(|&i| remaining_deps[i] > 0)
            .map(|i| arena.id_at(i).to_string())
            .collect();
        return Err(ClusterupError::validation(format!(
            "cycle detected among phases: {}",
            cyclic.join(", ")
        )));
    }
    Ok(())
}

/// A phase cannot depend on itself or any of its own descendants.
fn validate_no_self_or_descendant_dependency(roots: &[Phase]) -> Result<(), ClusterupError> {
    fn walk(phase: &Phase) -> Result<(), ClusterupError> {
        for req in &phase.requires {
            if phase.id.is_ancestor_of_or_equal(req) {
                return Err(ClusterupError::validation(format!(
                    "phase {} cannot require its own descendant {}",
                    phase.id, req
                )));
            }
        }
        for child in &phase.phases {
            walk(child)?;
        }
        Ok(())
    }
    for root in roots {
        walk(root)?;
    }
    Ok(())
}

/// `addSequential`: each child's `requires` gains the preceding sibling's
/// absolute id, forming a chain. Children are otherwise independent of
/// phases outside the chain unless explicitly `require`d.
pub fn add_sequential(children: &mut [Phase]) {
    for i in 1..children.len() {
        let prev_id = children[i - 1].id.clone();
        children[i].requires.insert(prev_id);
    }
}

/// `addParallel`: children keep whatever `requires` they already carry
/// (typically only the parent's own predecessors); no edges are added
/// between siblings.
pub fn add_parallel(_children: &mut [Phase]) {}

/// `require`: add explicit cross-subtree edges from every phase in
/// `dependents` onto every phase in `dependencies`.
pub fn require(dependents: &mut [Phase], dependencies: &[PhasePath]) {
    for phase in dependents.iter_mut() {
        phase.requires.extend(dependencies.iter().cloned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterup_common::{ExecutorTag, PhaseData};

    fn leaf(id: &str) -> Phase {
        Phase::leaf(PhasePath::parse(id).unwrap(), id, ExecutorTag::Health, PhaseData::None)
    }

    #[test]
    fn resolve_rewrites_relative_requires_to_absolute() {
        let mut a = leaf("/root/a");
        let mut b = leaf("/root/b");
        b.requires.insert(PhasePath::parse("a").unwrap());
        a.requires.clear();
        let root = Phase::grouping(PhasePath::parse("/root").unwrap(), "root", vec![a, b]);
        let mut roots = vec![root];
        resolve(&mut roots).unwrap();
        assert!(roots[0].phases[1].requires.contains(&PhasePath::parse("/root/a").unwrap()));
    }

    #[test]
    fn resolve_detects_cycles() {
        let mut a = leaf("/root/a");
        let mut b = leaf("/root/b");
        a.requires.insert(PhasePath::parse("/root/b").unwrap());
        b.requires.insert(PhasePath::parse("/root/a").unwrap());
        let root = Phase::grouping(PhasePath::parse("/root").unwrap(), "root", vec![a, b]);
        let mut roots = vec![root];
        assert!(resolve(&mut roots).is_err());
    }

    #[test]
    fn resolve_rejects_dependency_on_own_descendant() {
        let child = leaf("/root/a/child");
        let mut a = Phase::grouping(PhasePath::parse("/root/a").unwrap(), "a", vec![child]);
        a.requires.insert(PhasePath::parse("/root/a/child").unwrap());
        let root = Phase::grouping(PhasePath::parse("/root").unwrap(), "root", vec![a]);
        let mut roots = vec![root];
        assert!(resolve(&mut roots).is_err());
    }

    #[test]
    fn add_sequential_chains_siblings() {
        let mut children = vec![leaf("/x"), leaf("/y"), leaf("/z")];
        add_sequential(&mut children);
        assert!(children[1].requires.contains(&PhasePath::parse("/x").unwrap()));
        assert!(children[2].requires.contains(&PhasePath::parse("/y").unwrap()));
        assert!(children[0].requires.is_empty());
    }

    #[test]
    fn duplicate_phase_ids_are_rejected() {
        let a1 = leaf("/root/a");
        let a2 = leaf("/root/a");
        let root = Phase::grouping(PhasePath::parse("/root").unwrap(), "root", vec![a1, a2]);
        assert!(flatten(std::slice::from_ref(&root)).is_err());
    }
}
