//! Dependency resolution.
//!
//! Builds the transitive closure of a target descriptor's non-optional
//! dependency edges and returns a topologically ordered build list:
//! every dependency precedes its dependents, ties among independent nodes
//! broken by name. Pure function of its inputs; resolution failures
//! (cycle, unresolved edge) are fatal and produce no partial result.

use std::collections::HashSet;

use kiln_schema::{DescriptorSet, PackageName};

use crate::error::OrchestrateError;

/// Resolve the build order for a target package.
///
/// Optional dependency edges are followed only when `include_optional` is
/// set; build, runtime, and test edges are always followed.
///
/// # Errors
///
/// Returns [`OrchestrateError::Cycle`] naming every node of the first
/// cycle encountered, or [`OrchestrateError::UnresolvedDependency`] naming
/// the missing target and its dependent.
pub fn resolve(
    target: &PackageName,
    set: &DescriptorSet,
    include_optional: bool,
) -> Result<Vec<PackageName>, OrchestrateError> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut path = Vec::new();

    // The requested package itself must exist; report it as its own
    // dependent so the message stays actionable.
    if set.find(target).is_none() {
        return Err(OrchestrateError::UnresolvedDependency {
            dependent: target.clone(),
            missing: target.clone(),
        });
    }

    visit(target, set, include_optional, &mut order, &mut visited, &mut path)?;
    Ok(order)
}

fn visit(
    name: &PackageName,
    set: &DescriptorSet,
    include_optional: bool,
    order: &mut Vec<PackageName>,
    visited: &mut HashSet<PackageName>,
    path: &mut Vec<PackageName>,
) -> Result<(), OrchestrateError> {
    if visited.contains(name) {
        return Ok(());
    }

    if let Some(pos) = path.iter().position(|p| p == name) {
        // Close the loop so the report reads a -> b -> a.
        let mut members = path[pos..].to_vec();
        members.push(name.clone());
        return Err(OrchestrateError::Cycle { members });
    }

    path.push(name.clone());

    let desc = set
        .find(name)
        .ok_or_else(|| OrchestrateError::UnresolvedDependency {
            dependent: path[path.len().saturating_sub(2)].clone(),
            missing: name.clone(),
        })?;

    // Sort edges by target name so independent siblings resolve in a
    // deterministic order.
    let mut targets: Vec<&PackageName> = desc.edges(include_optional).map(|e| &e.on).collect();
    targets.sort();
    targets.dedup();

    for dep in targets {
        visit(dep, set, include_optional, order, visited, path)?;
    }

    path.pop();
    visited.insert(name.clone());
    order.push(name.clone());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_schema::{DepKind, DependencyEdge, Descriptor, SourceRef, Sha256Digest};

    fn descriptor(name: &str, deps: Vec<(&str, DepKind)>) -> Descriptor {
        Descriptor {
            name: PackageName::new(name),
            version: "1.0.0".into(),
            license: None,
            source: SourceRef {
                url: format!("https://example.com/{name}.tar.gz"),
                sha256: Sha256Digest::new("a".repeat(64)).unwrap(),
            },
            head: None,
            depends: deps
                .into_iter()
                .map(|(on, kind)| DependencyEdge {
                    on: PackageName::new(on),
                    kind,
                })
                .collect(),
            resources: vec![],
            stages: vec![],
            bootstrap: None,
            test: None,
            state: None,
            caveats: None,
        }
    }

    fn set_of(descs: Vec<Descriptor>) -> DescriptorSet {
        descs.into_iter().collect()
    }

    #[test]
    fn simple_resolution() {
        let set = set_of(vec![
            descriptor("a", vec![("b", DepKind::Runtime)]),
            descriptor("b", vec![]),
        ]);

        let order = resolve(&PackageName::new("a"), &set, false).unwrap();
        assert_eq!(order, vec![PackageName::new("b"), PackageName::new("a")]);
    }

    #[test]
    fn diamond_keeps_topological_invariant() {
        let set = set_of(vec![
            descriptor("a", vec![("b", DepKind::Runtime), ("c", DepKind::Runtime)]),
            descriptor("b", vec![("d", DepKind::Runtime)]),
            descriptor("c", vec![("d", DepKind::Runtime)]),
            descriptor("d", vec![]),
        ]);

        let order = resolve(&PackageName::new("a"), &set, false).unwrap();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("d") < pos("b"));
        assert!(pos("d") < pos("c"));
        assert!(pos("b") < pos("a"));
        assert!(pos("c") < pos("a"));
    }

    #[test]
    fn mixed_kinds_tie_broken_by_name() {
        // A depends on B (runtime) and C (build-only); both leafless.
        let set = set_of(vec![
            descriptor("a", vec![("c", DepKind::Build), ("b", DepKind::Runtime)]),
            descriptor("b", vec![]),
            descriptor("c", vec![]),
        ]);

        let order = resolve(&PackageName::new("a"), &set, false).unwrap();
        assert_eq!(
            order,
            vec![
                PackageName::new("b"),
                PackageName::new("c"),
                PackageName::new("a")
            ]
        );
    }

    #[test]
    fn cycle_names_every_member() {
        let set = set_of(vec![
            descriptor("a", vec![("b", DepKind::Runtime)]),
            descriptor("b", vec![("c", DepKind::Runtime)]),
            descriptor("c", vec![("a", DepKind::Runtime)]),
        ]);

        let err = resolve(&PackageName::new("a"), &set, false).unwrap_err();
        match err {
            OrchestrateError::Cycle { members } => {
                assert_eq!(
                    members,
                    vec![
                        PackageName::new("a"),
                        PackageName::new("b"),
                        PackageName::new("c"),
                        PackageName::new("a"),
                    ]
                );
            }
            other => panic!("expected Cycle, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let set = set_of(vec![descriptor("a", vec![("a", DepKind::Runtime)])]);

        let err = resolve(&PackageName::new("a"), &set, false).unwrap_err();
        assert!(matches!(err, OrchestrateError::Cycle { .. }));
    }

    #[test]
    fn unresolved_edge_names_dependent_and_missing() {
        let set = set_of(vec![descriptor("a", vec![("ghost", DepKind::Runtime)])]);

        let err = resolve(&PackageName::new("a"), &set, false).unwrap_err();
        match err {
            OrchestrateError::UnresolvedDependency { dependent, missing } => {
                assert_eq!(dependent, "a");
                assert_eq!(missing, "ghost");
            }
            other => panic!("expected UnresolvedDependency, got {other}"),
        }
    }

    #[test]
    fn unknown_target_is_unresolved() {
        let set = set_of(vec![]);
        let err = resolve(&PackageName::new("nope"), &set, false).unwrap_err();
        assert!(matches!(err, OrchestrateError::UnresolvedDependency { .. }));
    }

    #[test]
    fn optional_edges_gated_on_request() {
        let set = set_of(vec![
            descriptor("a", vec![("extra", DepKind::Optional)]),
            descriptor("extra", vec![]),
        ]);

        let without = resolve(&PackageName::new("a"), &set, false).unwrap();
        assert_eq!(without, vec![PackageName::new("a")]);

        let with = resolve(&PackageName::new("a"), &set, true).unwrap();
        assert_eq!(with, vec![PackageName::new("extra"), PackageName::new("a")]);
    }

    #[test]
    fn test_edges_are_followed() {
        let set = set_of(vec![
            descriptor("a", vec![("pytest", DepKind::Test)]),
            descriptor("pytest", vec![]),
        ]);

        let order = resolve(&PackageName::new("a"), &set, false).unwrap();
        assert_eq!(order, vec![PackageName::new("pytest"), PackageName::new("a")]);
    }
}
