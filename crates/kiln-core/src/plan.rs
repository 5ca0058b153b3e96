//! Platform plan building.
//!
//! Binds a descriptor's conditional stages to one concrete platform,
//! producing the flattened, immutable [`ResolvedPlan`] the stage executor
//! consumes. Stage predicates are evaluated in declaration order; OS-branch
//! groups select exactly one arm (or their default). Substitution tokens
//! are expanded here, after every referenced dependency has been built, so
//! a resolved path is guaranteed to exist by the time a tool sees it.
//!
//! Supported tokens: `${prefix}`, `${prefix:NAME}`, `${bootstrap}`,
//! `${resource:NAME}`, `${version}`, `${jobs}`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use kiln_schema::{
    Action, Descriptor, PackageName, Platform, StageDef, Version,
};

use crate::error::OrchestrateError;

/// Everything substitution and predicate evaluation can see.
#[derive(Debug)]
pub struct PlanContext<'a> {
    /// The platform the plan is bound to.
    pub platform: Platform,
    /// Names of every package in the resolved dependency closure.
    pub resolved: &'a BTreeSet<PackageName>,
    /// Install prefixes of already-built dependencies.
    pub prefixes: &'a BTreeMap<PackageName, PathBuf>,
    /// This package's own install prefix.
    pub own_prefix: &'a Path,
    /// The version being built.
    pub version: &'a Version,
    /// Parallelism exposed to build tools as `${jobs}`.
    pub jobs: usize,
    /// Staged bootstrap toolchain root, when the descriptor declares one.
    pub bootstrap_root: Option<&'a Path>,
    /// Staged resource roots by resource name.
    pub resource_roots: &'a BTreeMap<String, PathBuf>,
}

/// A fully substituted, platform-bound action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedAction {
    /// Invoke an external build tool.
    Invoke {
        /// Program to run.
        program: String,
        /// Fully substituted arguments.
        args: Vec<String>,
        /// Per-action environment overrides, applied on top of the
        /// controlled build environment.
        env: Vec<(String, String)>,
    },
    /// Replace a string in a file under the install prefix.
    Patch {
        /// Absolute path of the file to mutate.
        file: PathBuf,
        /// Exact string that must be present.
        find: String,
        /// Replacement.
        replace: String,
    },
}

/// The flattened, platform-bound stage sequence for one descriptor.
///
/// Immutable once built; owned by the stage executor for a single run.
#[derive(Debug, Clone, Default)]
pub struct ResolvedPlan {
    /// Ordered actions to execute.
    pub steps: Vec<ResolvedAction>,
}

impl ResolvedPlan {
    /// Number of steps in the plan.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Check that every OS-branch group in a descriptor has an applicable arm
/// on the given platform, without performing substitution.
///
/// Run at resolution time so an unbuildable descriptor is reported before
/// any fetch or build work starts.
///
/// # Errors
///
/// Returns [`OrchestrateError::NoApplicablePlatform`] when a `Select`
/// stage has no matching arm and no default.
pub fn preflight(
    desc: &Descriptor,
    platform: &Platform,
    resolved: &BTreeSet<PackageName>,
) -> Result<(), OrchestrateError> {
    for stage in &desc.stages {
        selected_actions(&desc.name, stage, platform, resolved)?;
    }
    if let Some(test) = &desc.test {
        for stage in &test.stages {
            selected_actions(&desc.name, stage, platform, resolved)?;
        }
    }
    Ok(())
}

/// Build the resolved plan for a descriptor's build stages.
///
/// # Errors
///
/// Returns [`OrchestrateError::NoApplicablePlatform`] for an unsatisfiable
/// branch group, or a substitution error (unresolved dependency prefix,
/// missing bootstrap, unknown token) for malformed references.
pub fn build_plan(desc: &Descriptor, ctx: &PlanContext<'_>) -> Result<ResolvedPlan, OrchestrateError> {
    let steps = resolve_stages(&desc.name, &desc.stages, ctx)?;
    Ok(ResolvedPlan { steps })
}

/// Resolve an arbitrary stage list (build stages or test stages) against a
/// context.
///
/// # Errors
///
/// Same failure modes as [`build_plan`].
pub fn resolve_stages(
    package: &PackageName,
    stages: &[StageDef],
    ctx: &PlanContext<'_>,
) -> Result<Vec<ResolvedAction>, OrchestrateError> {
    let mut steps = Vec::new();

    for stage in stages {
        if let Some(actions) = selected_actions(package, stage, &ctx.platform, ctx.resolved)? {
            for action in actions {
                steps.push(resolve_action(package, action, ctx)?);
            }
        }
    }

    Ok(steps)
}

/// Evaluate one stage's predicates: which actions, if any, does it emit on
/// this platform?
///
/// `Run` stages yield their action or nothing. `Select` stages yield the
/// first matching arm, the default, or fail.
fn selected_actions<'a>(
    package: &PackageName,
    stage: &'a StageDef,
    platform: &Platform,
    resolved: &BTreeSet<PackageName>,
) -> Result<Option<Vec<&'a Action>>, OrchestrateError> {
    match stage {
        StageDef::Run { when, run } => {
            let applies = when.as_ref().is_none_or(|p| p.matches(platform, resolved));
            Ok(applies.then(|| vec![run]))
        }
        StageDef::Select { select, default } => {
            for arm in select {
                if arm.when.matches(platform, resolved) {
                    return Ok(Some(arm.actions.iter().collect()));
                }
            }
            if let Some(actions) = default {
                return Ok(Some(actions.iter().collect()));
            }
            Err(OrchestrateError::NoApplicablePlatform {
                package: package.clone(),
                platform: *platform,
            })
        }
    }
}

fn resolve_action(
    package: &PackageName,
    action: &Action,
    ctx: &PlanContext<'_>,
) -> Result<ResolvedAction, OrchestrateError> {
    match action {
        Action::Invoke { program, args, env } => Ok(ResolvedAction::Invoke {
            program: substitute(package, program, ctx)?,
            args: args
                .iter()
                .map(|a| substitute(package, a, ctx))
                .collect::<Result<_, _>>()?,
            env: env
                .iter()
                .map(|(k, v)| Ok((k.clone(), substitute(package, v, ctx)?)))
                .collect::<Result<_, OrchestrateError>>()?,
        }),
        Action::Patch {
            file,
            find,
            replace,
        } => Ok(ResolvedAction::Patch {
            file: ctx.own_prefix.join(substitute(package, file, ctx)?),
            find: substitute(package, find, ctx)?,
            replace: substitute(package, replace, ctx)?,
        }),
    }
}

/// Expand every `${...}` token in `input`.
fn substitute(
    package: &PackageName,
    input: &str,
    ctx: &PlanContext<'_>,
) -> Result<String, OrchestrateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            return Err(OrchestrateError::InvalidDescriptor {
                package: package.clone(),
                message: format!("unterminated substitution in '{input}'"),
            });
        };
        out.push_str(&expand_token(package, &after[..end], ctx)?);
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn expand_token(
    package: &PackageName,
    token: &str,
    ctx: &PlanContext<'_>,
) -> Result<String, OrchestrateError> {
    match token {
        "prefix" => Ok(ctx.own_prefix.display().to_string()),
        "version" => Ok(ctx.version.to_string()),
        "jobs" => Ok(ctx.jobs.to_string()),
        "bootstrap" => ctx
            .bootstrap_root
            .map(|p| p.display().to_string())
            .ok_or_else(|| OrchestrateError::BootstrapMismatch {
                package: package.clone(),
                platform: ctx.platform,
            }),
        _ => {
            if let Some(name) = token.strip_prefix("prefix:") {
                let dep = PackageName::new(name);
                return ctx
                    .prefixes
                    .get(&dep)
                    .map(|p| p.display().to_string())
                    .ok_or_else(|| OrchestrateError::UnresolvedDependency {
                        dependent: package.clone(),
                        missing: dep,
                    });
            }
            if let Some(name) = token.strip_prefix("resource:") {
                return ctx
                    .resource_roots
                    .get(name)
                    .map(|p| p.display().to_string())
                    .ok_or_else(|| OrchestrateError::InvalidDescriptor {
                        package: package.clone(),
                        message: format!("undeclared resource '{name}'"),
                    });
            }
            Err(OrchestrateError::InvalidDescriptor {
                package: package.clone(),
                message: format!("unknown substitution token '${{{token}}}'"),
            })
        }
    }
}
