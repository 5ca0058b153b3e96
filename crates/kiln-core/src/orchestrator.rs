//! The orchestration driver.
//!
//! Ties the engine together: resolves the dependency order (failing fast on
//! resolution errors), then builds each descriptor — fetch, stage, plan,
//! execute, migrate, receipt — with independent subtrees running in
//! parallel worker tasks bounded by a concurrency limit.
//!
//! Builds are deduplicated through per-(name, version) cells: the second
//! requester of an in-flight build awaits the first's outcome and reuses
//! it, success or failure, rather than rebuilding. A completed install is
//! detected by its receipt and skipped, which makes re-invocation after a
//! partial failure safe.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{OnceCell, Semaphore};
use tokio_util::sync::CancellationToken;

use kiln_schema::{Descriptor, DescriptorSet, PackageName, Platform, Version};

use crate::bootstrap;
use crate::error::OrchestrateError;
use crate::executor::{self, StageExecutor};
use crate::fetch::Fetcher;
use crate::invoke::Invoker;
use crate::migrate::MigrationDetector;
use crate::plan::{self, PlanContext};
use crate::reporter::Reporter;
use crate::resolver;
use crate::store::{Receipt, Store};
use crate::workdir::Workdir;

/// Run-level configuration for an orchestrator instance.
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Platform every plan is bound to.
    pub platform: Platform,
    /// Parallelism exposed to build tools as `${jobs}`.
    pub jobs: usize,
    /// Maximum number of packages building concurrently.
    pub concurrency: usize,
    /// Wall-clock bound per external tool invocation and per fetch.
    pub timeout: Option<Duration>,
    /// Follow optional dependency edges.
    pub include_optional: bool,
    /// Retain the build working directory of a failed build.
    pub keep_failed: bool,
    /// Build the requested target from its head source.
    pub head: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            platform: Platform::current(),
            jobs: num_cpus::get(),
            concurrency: 4,
            timeout: None,
            include_optional: false,
            keep_failed: false,
            head: false,
        }
    }
}

/// Shared result of one (name, version) build.
#[derive(Debug, Clone)]
enum BuildOutcome {
    /// Install prefix of the completed build.
    Success(PathBuf),
    /// The failure, shared between every requester of this build.
    Failed(Arc<OrchestrateError>),
}

type BuildKey = (PackageName, Version);

/// Drives dependency-ordered builds over a descriptor set.
pub struct Orchestrator {
    set: Arc<DescriptorSet>,
    store: Store,
    fetcher: Arc<Fetcher>,
    invoker: Arc<dyn Invoker>,
    reporter: Arc<dyn Reporter>,
    opts: OrchestratorOptions,
    semaphore: Arc<Semaphore>,
    cells: tokio::sync::Mutex<HashMap<BuildKey, Arc<OnceCell<BuildOutcome>>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Create an orchestrator over a descriptor set and a store.
    pub fn new(
        set: DescriptorSet,
        store: Store,
        fetcher: Arc<Fetcher>,
        invoker: Arc<dyn Invoker>,
        reporter: Arc<dyn Reporter>,
        opts: OrchestratorOptions,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        Self {
            set: Arc::new(set),
            store,
            fetcher,
            invoker,
            reporter,
            opts,
            semaphore,
            cells: tokio::sync::Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Token that cancels this run when triggered. No new stages launch
    /// after cancellation; in-flight tool invocations are killed.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the run.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Install a package and everything it depends on.
    ///
    /// Resolution-time errors (cycle, unresolved dependency, inapplicable
    /// platform, bootstrap mismatch) are reported before any fetch or
    /// build work starts. With `run_test` set, the target's smoke test
    /// runs after a successful install; a test failure is reported
    /// distinctly and does not roll the install back.
    ///
    /// Returns the target's install prefix.
    ///
    /// # Errors
    ///
    /// Any [`OrchestrateError`]; see the taxonomy for which failures abort
    /// what.
    pub async fn install(
        &self,
        target: &PackageName,
        run_test: bool,
    ) -> Result<PathBuf, OrchestrateError> {
        // Fail fast: the whole closure must resolve and be buildable on
        // this platform before anything is fetched.
        let order = resolver::resolve(target, &self.set, self.opts.include_optional)?;
        let resolved: BTreeSet<PackageName> = order.iter().cloned().collect();
        for name in &order {
            let desc = self.descriptor(name)?;
            plan::preflight(desc, &self.opts.platform, &resolved)?;
            bootstrap::select(desc, &self.opts.platform)?;
        }

        tracing::info!(target = %target, packages = order.len(), "resolution complete");

        let prefix = match self.ensure_built(target, self.opts.head).await {
            BuildOutcome::Success(prefix) => prefix,
            BuildOutcome::Failed(err) => return Err(OrchestrateError::Shared(err)),
        };

        if run_test {
            self.run_smoke_test(target).await?;
        }

        Ok(prefix)
    }

    fn descriptor(&self, name: &PackageName) -> Result<&Descriptor, OrchestrateError> {
        self.set
            .find(name)
            .ok_or_else(|| OrchestrateError::UnresolvedDependency {
                dependent: name.clone(),
                missing: name.clone(),
            })
    }

    /// Get-or-start the build of one package; every caller of the same
    /// (name, version) shares a single execution and its outcome.
    fn ensure_built<'a>(
        &'a self,
        name: &PackageName,
        use_head: bool,
    ) -> BoxFuture<'a, BuildOutcome> {
        let name = name.clone();

        Box::pin(async move {
            let version = match self.descriptor(&name) {
                Ok(desc) => desc.version.clone(),
                Err(err) => return BuildOutcome::Failed(Arc::new(err)),
            };

            let cell = {
                let mut map = self.cells.lock().await;
                map.entry((name.clone(), version))
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            cell.get_or_init(|| self.build_package(name.clone(), use_head))
                .await
                .clone()
        })
    }

    /// Build one package: dependencies first (concurrently), then the
    /// package itself under a concurrency permit.
    async fn build_package(&self, name: PackageName, use_head: bool) -> BuildOutcome {
        let desc = match self.descriptor(&name) {
            Ok(d) => d.clone(),
            Err(err) => return BuildOutcome::Failed(Arc::new(err)),
        };

        // Direct dependencies build concurrently; recursion covers the
        // rest of the subtree. Actual build work runs on the blocking
        // pool, so independent subtrees genuinely overlap, bounded by the
        // semaphore.
        let mut deps: Vec<PackageName> = desc
            .edges(self.opts.include_optional)
            .map(|e| e.on.clone())
            .collect();
        deps.sort();
        deps.dedup();

        let dep_builds = deps.into_iter().map(|dep| async move {
            let outcome = self.ensure_built(&dep, false).await;
            (dep, outcome)
        });
        for (dep, outcome) in futures::future::join_all(dep_builds).await {
            if let BuildOutcome::Failed(_) = outcome {
                // The dependency's own error was already reported;
                // dependents abort transitively.
                return BuildOutcome::Failed(Arc::new(OrchestrateError::DependencyAborted {
                    package: name,
                    failed: dep,
                }));
            }
        }

        if self.cancel.is_cancelled() {
            return BuildOutcome::Failed(Arc::new(OrchestrateError::Cancelled));
        }

        // Completed installs are detected and skipped; re-running after a
        // partial failure is idempotent.
        if self.store.read_receipt(&name, &desc.version).is_some() {
            self.reporter
                .done(&name, &desc.version, "already installed");
            return BuildOutcome::Success(self.store.prefix_dir(&name, &desc.version));
        }

        let Ok(_permit) = self.semaphore.acquire().await else {
            return BuildOutcome::Failed(Arc::new(OrchestrateError::Cancelled));
        };

        match self.run_build(&desc, use_head).await {
            Ok(prefix) => {
                self.reporter.done(&name, &desc.version, "installed");
                BuildOutcome::Success(prefix)
            }
            Err(err) => {
                self.reporter.failed(&name, &desc.version, &err.to_string());
                BuildOutcome::Failed(Arc::new(err))
            }
        }
    }

    /// Fetch, stage, plan, and execute one descriptor's build.
    async fn run_build(
        &self,
        desc: &Descriptor,
        use_head: bool,
    ) -> Result<PathBuf, OrchestrateError> {
        let name = &desc.name;
        let version = &desc.version;
        let fetch_err = |source| OrchestrateError::Fetch {
            package: name.clone(),
            source,
        };

        let workdir = Workdir::create(&self.store.tmp_dir(), self.opts.keep_failed)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let result = async {
            // Source artifact. Head sources have no pin, so verification
            // is skipped for that artifact only.
            let source_path = match &desc.head {
                Some(head) if use_head => {
                    self.reporter.fetching(name, version, &head.url);
                    self.fetcher
                        .fetch_unverified(&head.url, &format!("head-{name}"))
                        .await
                        .map_err(fetch_err)?
                }
                _ => {
                    self.reporter.fetching(name, version, &desc.source.url);
                    self.fetcher
                        .fetch(&desc.source.url, &desc.source.sha256)
                        .await
                        .map_err(fetch_err)?
                }
            };
            workdir
                .stage_file(
                    &source_path,
                    &PathBuf::from("src").join(filename_from_url(&desc.source.url)),
                )
                .map_err(|e| std::io::Error::other(e.to_string()))?;

            // Resource bundles, staged eagerly.
            let mut resource_roots = BTreeMap::new();
            for resource in &desc.resources {
                self.reporter.fetching(name, version, &resource.url);
                let cached = self
                    .fetcher
                    .fetch(&resource.url, &resource.sha256)
                    .await
                    .map_err(fetch_err)?;
                workdir
                    .stage_file(
                        &cached,
                        &PathBuf::from("resources")
                            .join(&resource.name)
                            .join(filename_from_url(&resource.url)),
                    )
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                resource_roots.insert(resource.name.clone(), workdir.resource_dir(&resource.name));
            }

            // Bootstrap toolchain, when declared. Pre-flighted, so select
            // cannot fail here on a listed platform.
            let bootstrap_root = match bootstrap::select(desc, &self.opts.platform)? {
                Some(entry) => {
                    Some(bootstrap::stage(name, entry, &self.fetcher, &workdir).await?)
                }
                None => None,
            };

            // Bind the plan. Every referenced dependency is already built,
            // so substituted prefixes exist.
            let sub_order = resolver::resolve(name, &self.set, self.opts.include_optional)?;
            let resolved: BTreeSet<PackageName> = sub_order.iter().cloned().collect();
            let mut prefixes = BTreeMap::new();
            for dep in &sub_order {
                if dep != name {
                    let dep_desc = self.descriptor(dep)?;
                    prefixes.insert(dep.clone(), self.store.prefix_dir(dep, &dep_desc.version));
                }
            }

            let own_prefix = self.store.prefix_dir(name, version);
            std::fs::create_dir_all(&own_prefix)?;

            let ctx = PlanContext {
                platform: self.opts.platform,
                resolved: &resolved,
                prefixes: &prefixes,
                own_prefix: &own_prefix,
                version,
                jobs: self.opts.jobs,
                bootstrap_root: bootstrap_root.as_deref(),
                resource_roots: &resource_roots,
            };
            let resolved_plan = plan::build_plan(desc, &ctx)?;
            let env = executor::build_env(
                workdir.path(),
                &own_prefix,
                &prefixes,
                &self.opts.platform,
                self.opts.jobs,
            );

            for tool in executor::missing_tools(&resolved_plan, &env) {
                self.reporter
                    .warning(&format!("'{tool}' not found in the build PATH"));
            }

            self.reporter.building(name, version);
            self.execute_blocking(
                name.clone(),
                version.clone(),
                resolved_plan,
                workdir.src_dir(),
                env,
                self.store.build_log_path(name, version),
            )
            .await?;

            // Persistent state detection: inform, never act.
            if let Some(state) = &desc.state {
                let state_dir = self.store.state_dir();
                std::fs::create_dir_all(&state_dir)?;
                let detector = MigrationDetector::new(&state_dir);
                let disposition = detector.detect(state, version)?;
                if let Some(suggestion) = disposition.migration_suggestion() {
                    self.reporter.caveat(name, &suggestion);
                }
                detector.commit(version, &disposition)?;
            }

            self.store.write_receipt(&Receipt {
                name: name.clone(),
                version: version.clone(),
                source_digest: desc.source.sha256.to_string(),
                verified: None,
            })?;

            if let Some(caveats) = &desc.caveats {
                self.reporter.caveat(name, caveats);
            }

            Ok(own_prefix)
        }
        .await;

        workdir.release(result.is_ok());
        result
    }

    /// Run the target's smoke test in an isolated scratch directory.
    ///
    /// The install is left in place on failure; the receipt records the
    /// package as unverified.
    async fn run_smoke_test(&self, target: &PackageName) -> Result<(), OrchestrateError> {
        let desc = self.descriptor(target)?.clone();
        let Some(test) = &desc.test else {
            return Ok(());
        };
        let version = &desc.version;

        let workdir = Workdir::create(&self.store.tmp_dir(), self.opts.keep_failed)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        std::fs::create_dir_all(workdir.test_dir())?;

        let sub_order = resolver::resolve(target, &self.set, self.opts.include_optional)?;
        let resolved: BTreeSet<PackageName> = sub_order.iter().cloned().collect();
        let mut prefixes = BTreeMap::new();
        for dep in &sub_order {
            if dep != target {
                let dep_desc = self.descriptor(dep)?;
                prefixes.insert(dep.clone(), self.store.prefix_dir(dep, &dep_desc.version));
            }
        }
        let own_prefix = self.store.prefix_dir(target, version);

        let resource_roots = BTreeMap::new();
        let ctx = PlanContext {
            platform: self.opts.platform,
            resolved: &resolved,
            prefixes: &prefixes,
            own_prefix: &own_prefix,
            version,
            jobs: self.opts.jobs,
            bootstrap_root: None,
            resource_roots: &resource_roots,
        };
        let steps = plan::resolve_stages(target, &test.stages, &ctx)?;
        let env = executor::build_env(
            workdir.path(),
            &own_prefix,
            &prefixes,
            &self.opts.platform,
            self.opts.jobs,
        );
        let log = self
            .store
            .log_dir()
            .join(format!("test-{target}-{version}.log"));

        let result = self
            .execute_blocking(
                target.clone(),
                version.clone(),
                crate::plan::ResolvedPlan { steps },
                workdir.test_dir(),
                env,
                log,
            )
            .await;

        workdir.release(result.is_ok());

        let verified = result.is_ok();
        self.store.write_receipt(&Receipt {
            name: target.clone(),
            version: version.clone(),
            source_digest: desc.source.sha256.to_string(),
            verified: Some(verified),
        })?;

        match result {
            Ok(()) => {
                self.reporter.done(target, version, "test passed");
                Ok(())
            }
            Err(OrchestrateError::StageFailed { output, .. }) => {
                self.reporter
                    .warning(&format!("'{target}' installed but failed its smoke test"));
                Err(OrchestrateError::TestFailed {
                    package: target.clone(),
                    version: version.clone(),
                    output,
                })
            }
            Err(other) => Err(other),
        }
    }

    /// Run a resolved plan on the blocking pool; stage execution spawns
    /// real processes and must not stall the async runtime.
    async fn execute_blocking(
        &self,
        name: PackageName,
        version: Version,
        resolved_plan: crate::plan::ResolvedPlan,
        cwd: PathBuf,
        env: Vec<(String, String)>,
        log: PathBuf,
    ) -> Result<(), OrchestrateError> {
        let invoker = Arc::clone(&self.invoker);
        let cancel = self.cancel.clone();
        let timeout = self.opts.timeout;
        let platform = self.opts.platform;

        tokio::task::spawn_blocking(move || {
            let executor = StageExecutor {
                invoker: invoker.as_ref(),
                cancel: &cancel,
                timeout,
            };
            executor.execute(&name, &version, &platform, &resolved_plan, &cwd, &env, &log)
        })
        .await
        .map_err(|e| OrchestrateError::Io(std::io::Error::other(e.to_string())))?
    }
}

/// Extract the filename from a URL.
fn filename_from_url(url: &str) -> &str {
    let name = url.split('/').next_back().unwrap_or("artifact");
    if name.is_empty() { "artifact" } else { name }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::{ArtifactSource, FetchError};
    use crate::invoke::{ToolRequest, ToolStatus};
    use async_trait::async_trait;
    use kiln_schema::{
        CompatPolicy, DepKind, DependencyEdge, Descriptor, Sha256Digest, SourceRef, StageDef,
        StateSpec, TestSpec,
    };
    use sha2::{Digest, Sha256};
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves per-URL fixed bodies from memory.
    #[derive(Default)]
    struct MapSource {
        bodies: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl ArtifactSource for MapSource {
        async fn get(&self, url: &str, dest: &Path) -> Result<(), FetchError> {
            let body = self.bodies.get(url).cloned().unwrap_or_default();
            std::fs::write(dest, body)?;
            Ok(())
        }
    }

    /// Records every invoked program; optionally fails a named program.
    struct RecordingInvoker {
        invoked: Mutex<Vec<String>>,
        runs: AtomicUsize,
        fail_program: Option<String>,
    }

    impl RecordingInvoker {
        fn new() -> Self {
            Self {
                invoked: Mutex::new(Vec::new()),
                runs: AtomicUsize::new(0),
                fail_program: None,
            }
        }

        fn failing_on(program: &str) -> Self {
            Self {
                fail_program: Some(program.to_string()),
                ..Self::new()
            }
        }

        fn invoked(&self) -> Vec<String> {
            self.invoked.lock().unwrap().clone()
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl Invoker for RecordingInvoker {
        fn run(&self, req: &ToolRequest<'_>) -> std::io::Result<ToolStatus> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            self.invoked.lock().unwrap().push(req.program.to_string());
            std::fs::write(req.log, format!("ran {}\n", req.program))?;
            Ok(match &self.fail_program {
                Some(p) if p == req.program => ToolStatus::Exited(1),
                _ => ToolStatus::Exited(0),
            })
        }
    }

    /// Captures caveats for assertions; ignores everything else.
    #[derive(Default)]
    struct CapturingReporter {
        caveats: Mutex<Vec<String>>,
    }

    impl Reporter for CapturingReporter {
        fn fetching(&self, _: &PackageName, _: &Version, _: &str) {}
        fn building(&self, _: &PackageName, _: &Version) {}
        fn done(&self, _: &PackageName, _: &Version, _: &str) {}
        fn failed(&self, _: &PackageName, _: &Version, _: &str) {}
        fn caveat(&self, _: &PackageName, text: &str) {
            self.caveats.lock().unwrap().push(text.to_string());
        }
        fn info(&self, _: &str) {}
        fn warning(&self, _: &str) {}
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        source: MapSource,
        descriptors: Vec<Descriptor>,
        store_root: PathBuf,
    }

    impl Harness {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let store_root = tmp.path().join("store");
            Self {
                _tmp: tmp,
                source: MapSource::default(),
                descriptors: Vec::new(),
                store_root,
            }
        }

        /// Add a descriptor whose single build stage invokes a program
        /// named `build-<name>`, with a served source artifact.
        fn package(&mut self, name: &str, deps: Vec<(&str, DepKind)>) -> &mut Descriptor {
            let url = format!("https://example.com/{name}.tar.gz");
            let body = format!("source of {name}").into_bytes();
            let digest = Sha256Digest::new(hex::encode(Sha256::digest(&body))).unwrap();
            self.source.bodies.insert(url.clone(), body);

            self.descriptors.push(Descriptor {
                name: PackageName::new(name),
                version: Version::new("1.0.0"),
                license: None,
                source: SourceRef {
                    url,
                    sha256: digest,
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
                stages: vec![StageDef::Run {
                    when: None,
                    run: kiln_schema::Action::Invoke {
                        program: format!("build-{name}"),
                        args: vec!["--prefix=${prefix}".to_string()],
                        env: BTreeMap::new(),
                    },
                }],
                bootstrap: None,
                test: None,
                state: None,
                caveats: None,
            });
            self.descriptors.last_mut().unwrap()
        }

        /// Build an orchestrator over the harness's store; the harness must
        /// outlive it (it owns the temp directory). Callable repeatedly to
        /// simulate separate runs over the same store.
        fn orchestrator(
            &self,
            invoker: Arc<dyn Invoker>,
            reporter: Arc<dyn Reporter>,
        ) -> Arc<Orchestrator> {
            let store = Store::open(&self.store_root).unwrap();
            let source = MapSource {
                bodies: self.source.bodies.clone(),
            };
            let fetcher = Arc::new(Fetcher::new(Arc::new(source), store.cache_dir(), None));
            Arc::new(Orchestrator::new(
                self.descriptors.iter().cloned().collect(),
                store,
                fetcher,
                invoker,
                reporter,
                OrchestratorOptions {
                    concurrency: 4,
                    jobs: 2,
                    ..OrchestratorOptions::default()
                },
            ))
        }
    }

    #[tokio::test]
    async fn end_to_end_builds_dependencies_first() {
        let mut harness = Harness::new();
        harness.package("a", vec![("b", DepKind::Runtime), ("c", DepKind::Build)]);
        harness.package("b", vec![]);
        harness.package("c", vec![]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        let prefix = orch.install(&PackageName::new("a"), false).await.unwrap();
        assert!(prefix.ends_with("prefix/a/1.0.0"));

        let invoked = invoker.invoked();
        let pos = |p: &str| invoked.iter().position(|x| x == p).unwrap();
        assert!(pos("build-b") < pos("build-a"));
        assert!(pos("build-c") < pos("build-a"));
        assert_eq!(invoked.len(), 3);
    }

    #[tokio::test]
    async fn resolution_errors_fail_before_any_build() {
        let mut harness = Harness::new();
        harness.package("a", vec![("ghost", DepKind::Runtime)]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        let err = orch
            .install(&PackageName::new("a"), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestrateError::UnresolvedDependency { .. }
        ));
        assert_eq!(invoker.runs(), 0);
    }

    #[tokio::test]
    async fn cycle_fails_before_any_build() {
        let mut harness = Harness::new();
        harness.package("a", vec![("b", DepKind::Runtime)]);
        harness.package("b", vec![("a", DepKind::Runtime)]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        let err = orch
            .install(&PackageName::new("a"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::Cycle { .. }));
        assert_eq!(invoker.runs(), 0);
    }

    #[tokio::test]
    async fn failed_dependency_aborts_dependents_transitively() {
        let mut harness = Harness::new();
        harness.package("app", vec![("lib", DepKind::Runtime)]);
        harness.package("lib", vec![("base", DepKind::Runtime)]);
        harness.package("base", vec![]);

        let invoker = Arc::new(RecordingInvoker::failing_on("build-base"));
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        let err = orch
            .install(&PackageName::new("app"), false)
            .await
            .unwrap_err();

        match err.unshared() {
            OrchestrateError::DependencyAborted { package, failed } => {
                assert_eq!(package, "app");
                assert_eq!(failed, "lib");
            }
            other => panic!("expected DependencyAborted, got {other}"),
        }
        // Only base was attempted; lib and app never ran a stage.
        assert_eq!(invoker.invoked(), vec!["build-base"]);
    }

    #[tokio::test]
    async fn concurrent_installs_of_same_target_build_once() {
        let mut harness = Harness::new();
        harness.package("tool", vec![]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        let mut joins = Vec::new();
        for _ in 0..6 {
            let orch = Arc::clone(&orch);
            joins.push(tokio::spawn(async move {
                orch.install(&PackageName::new("tool"), false).await
            }));
        }
        for j in joins {
            j.await.unwrap().unwrap();
        }

        assert_eq!(invoker.runs(), 1);
    }

    #[tokio::test]
    async fn second_run_skips_installed_package() {
        let mut harness = Harness::new();
        harness.package("tool", vec![]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));

        orch.install(&PackageName::new("tool"), false).await.unwrap();
        assert_eq!(invoker.runs(), 1);

        // A fresh orchestrator over the same store sees the receipt and
        // skips the build entirely.
        let second = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));
        second
            .install(&PackageName::new("tool"), false)
            .await
            .unwrap();
        assert_eq!(invoker.runs(), 1);
    }

    #[tokio::test]
    async fn cancellation_prevents_new_builds() {
        let mut harness = Harness::new();
        harness.package("tool", vec![]);

        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker.clone(), Arc::new(crate::NullReporter));
        orch.cancel();

        let err = orch
            .install(&PackageName::new("tool"), false)
            .await
            .unwrap_err();
        assert!(matches!(err.unshared(), OrchestrateError::Cancelled));
        assert_eq!(invoker.runs(), 0);
    }

    #[tokio::test]
    async fn migration_suggestion_is_emitted_not_performed() {
        let mut harness = Harness::new();
        {
            let desc = harness.package("postgresql", vec![]);
            desc.version = Version::new("14.5");
            desc.state = Some(StateSpec {
                family: "postgresql".into(),
                compat: CompatPolicy::SameMajor,
            });
        }
        // Legacy record with a compatible stamp.
        let legacy = harness.store_root.join("state/postgresql");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("version"), "14").unwrap();
        std::fs::write(legacy.join("base.dat"), b"precious").unwrap();

        let reporter = Arc::new(CapturingReporter::default());
        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker, reporter.clone());

        orch.install(&PackageName::new("postgresql"), false)
            .await
            .unwrap();

        let caveats = reporter.caveats.lock().unwrap().clone();
        assert_eq!(caveats.len(), 1);
        assert!(caveats[0].contains("mv -v"));
        // Data untouched.
        assert_eq!(std::fs::read(legacy.join("base.dat")).unwrap(), b"precious");
    }

    #[tokio::test]
    async fn test_failure_leaves_install_in_place() {
        let mut harness = Harness::new();
        {
            let desc = harness.package("tool", vec![]);
            desc.test = Some(TestSpec {
                stages: vec![StageDef::Run {
                    when: None,
                    run: kiln_schema::Action::Invoke {
                        program: "smoke-test".into(),
                        args: vec![],
                        env: BTreeMap::new(),
                    },
                }],
            });
        }
        let store_root = harness.store_root.clone();

        let invoker = Arc::new(RecordingInvoker::failing_on("smoke-test"));
        let orch = harness.orchestrator(invoker, Arc::new(crate::NullReporter));

        let err = orch
            .install(&PackageName::new("tool"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrateError::TestFailed { .. }));
        assert_eq!(err.exit_code(), 4);

        // The install stands, flagged unverified.
        let store = Store::open(&store_root).unwrap();
        let receipt = store
            .read_receipt(&PackageName::new("tool"), &Version::new("1.0.0"))
            .unwrap();
        assert_eq!(receipt.verified, Some(false));
    }

    #[tokio::test]
    async fn caveats_are_reported_after_install() {
        let mut harness = Harness::new();
        harness.package("tool", vec![]).caveats = Some("Remember to rehash.".into());

        let reporter = Arc::new(CapturingReporter::default());
        let invoker = Arc::new(RecordingInvoker::new());
        let orch = harness.orchestrator(invoker, reporter.clone());

        orch.install(&PackageName::new("tool"), false).await.unwrap();

        let caveats = reporter.caveats.lock().unwrap().clone();
        assert_eq!(caveats, vec!["Remember to rehash.".to_string()]);
    }
}
