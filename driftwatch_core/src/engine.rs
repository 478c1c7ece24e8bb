//! Run orchestrator: sequences Fetch -> Convert -> Persist -> Reap per
//! resource type, with durable run records, transient-only retries and
//! explicit cross-type dependency ordering.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::fetch::Heartbeat;
use crate::models::{CanonicalRecord, ConversionPolicy, ScopeConfig, SyncRun, SyncRunStatus};
use crate::retry::RetryPolicy;
use crate::schedule::UnitSchedule;
use crate::store::SnapshotStore;
use crate::{Error, Result};

/// Everything a unit may touch while fetching: the source scope, the
/// snapshot store (child types read parent identities from it, not
/// from the remote API) and the host liveness signal.
pub struct FetchContext<'a> {
    pub scope: &'a ScopeConfig,
    pub store: &'a dyn SnapshotStore,
    pub heartbeat: Option<&'a dyn Heartbeat>,
}

/// One syncable resource type: how to fetch its collection and how to
/// convert a raw external record into canonical form.
///
/// `convert` must be pure: no I/O, no side effects, and the derived
/// `resource_id` must come from stable identifying fields only.
#[async_trait]
pub trait SyncUnit: Send + Sync {
    /// Stable resource type identifier; also the registry key.
    fn resource_type(&self) -> &str;

    /// Resource types whose full sync cycle must commit before this
    /// unit's fetch begins.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    /// Retrieve the complete raw collection for the scope.
    async fn fetch(&self, ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>>;

    fn convert(
        &self,
        raw: &serde_json::Value,
        scope: &ScopeConfig,
        collected_at: DateTime<Utc>,
    ) -> Result<CanonicalRecord>;
}

/// Per-unit execution configuration.
#[derive(Debug, Clone)]
pub struct UnitConfig {
    pub scope: ScopeConfig,
    pub conversion_policy: ConversionPolicy,
    pub retry: RetryPolicy,
    pub schedule: Option<UnitSchedule>,
}

impl UnitConfig {
    pub fn new(scope: ScopeConfig) -> Self {
        Self {
            scope,
            conversion_policy: ConversionPolicy::default(),
            retry: RetryPolicy::default(),
            schedule: None,
        }
    }
}

struct UnitEntry {
    unit: Arc<dyn SyncUnit>,
    config: UnitConfig,
}

/// Outcome of a dependency-ordered `run_all`.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub completed: Vec<SyncRun>,
    /// (resource_type, error message) for units that ran and failed.
    pub failed: Vec<(String, String)>,
    /// Units skipped because a dependency failed or was skipped.
    pub skipped: Vec<String>,
}

/// Named-operation registry and orchestrator. Units register under
/// their resource type; the hosting scheduler addresses them by that
/// name.
pub struct SyncEngine {
    store: Arc<dyn SnapshotStore>,
    units: RwLock<HashMap<String, UnitEntry>>,
    heartbeat: Option<Arc<dyn Heartbeat>>,
}

impl SyncEngine {
    pub fn new(store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            store,
            units: RwLock::new(HashMap::new()),
            heartbeat: None,
        }
    }

    /// Attach the host liveness signal, forwarded to fetches.
    pub fn with_heartbeat(mut self, heartbeat: Arc<dyn Heartbeat>) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn store(&self) -> Arc<dyn SnapshotStore> {
        self.store.clone()
    }

    /// Register (or replace) a unit under its resource type.
    #[tracing::instrument(level = "debug", skip(self, unit, config))]
    pub async fn register_unit(&self, unit: Arc<dyn SyncUnit>, config: UnitConfig) -> Result<()> {
        let name = unit.resource_type().to_string();
        if name.trim().is_empty() {
            return Err(Error::InvalidInput("unit resource_type is empty".to_string()));
        }
        if unit.depends_on().iter().any(|d| d == &name) {
            return Err(Error::InvalidInput(format!(
                "unit '{name}' cannot depend on itself"
            )));
        }
        let mut units = self.units.write().await;
        units.insert(name, UnitEntry { unit, config });
        Ok(())
    }

    /// Registered unit names with their schedules, for the scheduler.
    pub async fn schedules(&self) -> Vec<(String, UnitSchedule)> {
        let units = self.units.read().await;
        units
            .iter()
            .filter_map(|(name, entry)| {
                entry.config.schedule.clone().map(|s| (name.clone(), s))
            })
            .collect()
    }

    pub async fn set_next_run(&self, name: &str, at: DateTime<Utc>) -> Result<()> {
        let mut units = self.units.write().await;
        let entry = units
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("unit '{name}' not registered")))?;
        match &mut entry.config.schedule {
            Some(schedule) => {
                schedule.next_run_at = at;
                Ok(())
            }
            None => Err(Error::Conflict(format!("unit '{name}' has no schedule"))),
        }
    }

    /// Execute one sync cycle for a unit, single attempt.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_unit(&self, name: &str) -> Result<SyncRun> {
        self.run_unit_once(name, 1).await
    }

    /// Execute a unit under its retry policy: transient failures are
    /// retried with bounded exponential backoff, everything else fails
    /// immediately.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn execute_unit(&self, name: &str) -> Result<SyncRun> {
        let policy = {
            let units = self.units.read().await;
            let entry = units
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("unit '{name}' not registered")))?;
            entry.config.retry
        };

        let mut attempt = 1u32;
        loop {
            match self.run_unit_once(name, attempt).await {
                Ok(run) => return Ok(run),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::warn!(
                        unit = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run every registered unit in dependency order. A failed unit
    /// skips its transitive dependents (they would read incomplete
    /// parent data); independent units still run.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_all(&self) -> Result<SyncReport> {
        let graph: Vec<(String, Vec<String>)> = {
            let units = self.units.read().await;
            units
                .iter()
                .map(|(name, entry)| (name.clone(), entry.unit.depends_on()))
                .collect()
        };
        let order = topo_order(&graph)?;

        let mut report = SyncReport::default();
        let mut unusable: HashSet<String> = HashSet::new();

        for name in order {
            let deps = graph
                .iter()
                .find(|(n, _)| n == &name)
                .map(|(_, deps)| deps.clone())
                .unwrap_or_default();
            if deps.iter().any(|d| unusable.contains(d)) {
                tracing::warn!(unit = %name, "skipped: dependency did not complete");
                unusable.insert(name.clone());
                report.skipped.push(name);
                continue;
            }

            match self.execute_unit(&name).await {
                Ok(run) => report.completed.push(run),
                Err(e) => {
                    tracing::warn!(unit = %name, error = %e, "unit failed");
                    unusable.insert(name.clone());
                    report.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    async fn run_unit_once(&self, name: &str, attempt: u32) -> Result<SyncRun> {
        let (unit, config) = {
            let units = self.units.read().await;
            let entry = units
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("unit '{name}' not registered")))?;
            (entry.unit.clone(), entry.config.clone())
        };

        // Durable run entry first, so a crashed run stays visible.
        let started_at = Utc::now();
        let mut run =
            SyncRun::new_running(unit.resource_type(), &config.scope.scope, attempt, started_at)?;
        self.store.record_run(&run).await?;

        match self.run_phases(&unit, &config, &mut run).await {
            Ok(()) => {
                run.status = SyncRunStatus::Succeeded;
                run.finished_at = Some(Utc::now());
                self.store.record_run(&run).await?;
                Ok(run)
            }
            Err(e) => {
                run.status = SyncRunStatus::Failed;
                run.finished_at = Some(Utc::now());
                run.error_message = Some(e.to_string());
                // Best effort: the original error is what surfaces.
                if let Err(record_err) = self.store.record_run(&run).await {
                    tracing::warn!(unit = name, error = %record_err, "failed to finalize run record");
                }
                Err(e)
            }
        }
    }

    async fn run_phases(
        &self,
        unit: &Arc<dyn SyncUnit>,
        config: &UnitConfig,
        run: &mut SyncRun,
    ) -> Result<()> {
        let resource_type = unit.resource_type().to_string();
        let ctx = FetchContext {
            scope: &config.scope,
            store: self.store.as_ref(),
            heartbeat: self.heartbeat.as_deref(),
        };

        let raw = unit.fetch(&ctx).await?;
        run.records_fetched = raw.len() as u64;

        // Every record is stamped with the run's start; the reaper
        // later treats anything strictly older as unobserved.
        let mut records: Vec<CanonicalRecord> = Vec::with_capacity(raw.len());
        for item in &raw {
            match unit.convert(item, &config.scope, run.started_at) {
                Ok(rec) => {
                    if rec.resource_type != resource_type {
                        return Err(Error::InvalidInput(format!(
                            "unit '{resource_type}' converted a record of type '{}'",
                            rec.resource_type
                        )));
                    }
                    records.push(rec);
                }
                Err(e) => match config.conversion_policy {
                    ConversionPolicy::SkipAndLog => {
                        tracing::warn!(
                            resource_type = %resource_type,
                            error = %e,
                            "skipping unconvertible record"
                        );
                        run.records_skipped += 1;
                    }
                    ConversionPolicy::FailRun => return Err(e),
                },
            }
        }

        let stats = self.store.apply_batch(&resource_type, &records).await?;
        run.new_count = stats.new;
        run.changed_count = stats.changed;
        run.unchanged_count = stats.unchanged;

        // Best-effort cleanup: a reap failure is logged, never fatal.
        match self
            .store
            .reap_stale(&resource_type, run.started_at, Utc::now())
            .await
        {
            Ok(reap) => run.reaped_count = reap.reaped,
            Err(e) => {
                tracing::warn!(resource_type = %resource_type, error = %e, "stale reap failed");
            }
        }
        Ok(())
    }
}

/// Kahn's algorithm over the unit dependency graph. Unknown
/// dependencies and cycles are configuration errors.
fn topo_order(graph: &[(String, Vec<String>)]) -> Result<Vec<String>> {
    let names: HashSet<&String> = graph.iter().map(|(n, _)| n).collect();
    for (name, deps) in graph {
        for dep in deps {
            if !names.contains(dep) {
                return Err(Error::InvalidInput(format!(
                    "unit '{name}' depends on unregistered unit '{dep}'"
                )));
            }
        }
    }

    let mut in_degree: HashMap<&String, usize> = HashMap::new();
    let mut dependents: HashMap<&String, Vec<&String>> = HashMap::new();
    for (name, deps) in graph {
        in_degree.entry(name).or_insert(0);
        for dep in deps {
            *in_degree.entry(name).or_insert(0) += 1;
            dependents.entry(dep).or_default().push(name);
        }
    }

    let mut ready: VecDeque<&String> = {
        let mut roots: Vec<&String> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        // Deterministic order among independent units.
        roots.sort();
        roots.into()
    };

    let mut order = Vec::with_capacity(graph.len());
    while let Some(name) = ready.pop_front() {
        order.push(name.clone());
        if let Some(children) = dependents.get(name) {
            let mut unlocked: Vec<&String> = Vec::new();
            for child in children {
                if let Some(degree) = in_degree.get_mut(child) {
                    *degree -= 1;
                    if *degree == 0 {
                        unlocked.push(child);
                    }
                }
            }
            unlocked.sort();
            ready.extend(unlocked);
        }
    }

    if order.len() != graph.len() {
        return Err(Error::InvalidInput(
            "unit dependency graph contains a cycle".to_string(),
        ));
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FieldValue, SyncRunQuery};
    use crate::store::MemorySnapshotStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Serves a scripted dataset per run; payloads are `{id, name}`.
    struct ScriptedUnit {
        resource_type: &'static str,
        deps: Vec<String>,
        runs: Mutex<VecDeque<Vec<serde_json::Value>>>,
    }

    impl ScriptedUnit {
        fn new(resource_type: &'static str, runs: Vec<Vec<serde_json::Value>>) -> Self {
            Self {
                resource_type,
                deps: Vec::new(),
                runs: Mutex::new(runs.into()),
            }
        }

        fn with_deps(mut self, deps: &[&str]) -> Self {
            self.deps = deps.iter().map(|d| d.to_string()).collect();
            self
        }
    }

    #[async_trait]
    impl SyncUnit for ScriptedUnit {
        fn resource_type(&self) -> &str {
            self.resource_type
        }

        fn depends_on(&self) -> Vec<String> {
            self.deps.clone()
        }

        async fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>> {
            let mut runs = self.runs.lock().await;
            Ok(runs.pop_front().unwrap_or_default())
        }

        fn convert(
            &self,
            raw: &serde_json::Value,
            _scope: &ScopeConfig,
            collected_at: DateTime<Utc>,
        ) -> Result<CanonicalRecord> {
            let id = raw["id"].as_str().ok_or_else(|| {
                Error::conversion(self.resource_type, "?", "missing id")
            })?;
            let name = raw["name"].as_str().ok_or_else(|| {
                Error::conversion(self.resource_type, id, "missing name")
            })?;
            let mut fields = BTreeMap::new();
            fields.insert("name".to_string(), FieldValue::Text(name.to_string()));
            CanonicalRecord::new(self.resource_type, id, fields, collected_at)
        }
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(Arc::new(MemorySnapshotStore::new()))
    }

    fn config() -> UnitConfig {
        UnitConfig::new(ScopeConfig::new("proj-1", 100, serde_json::json!({})).unwrap())
    }

    fn item(id: &str, name: &str) -> serde_json::Value {
        serde_json::json!({"id": id, "name": name})
    }

    #[tokio::test]
    async fn three_run_lifecycle_new_changed_absent() {
        let engine = engine();
        let unit = ScriptedUnit::new(
            "server",
            vec![
                vec![item("abc", "x")],
                vec![item("abc", "y")],
                vec![],
            ],
        );
        engine.register_unit(Arc::new(unit), config()).await.unwrap();
        let store = engine.store();

        // Run 1: one snapshot, one open history row.
        let run1 = engine.run_unit("server").await.unwrap();
        assert_eq!(run1.new_count, 1);
        let snap = store.get_snapshot("server", "abc").await.unwrap().unwrap();
        assert_eq!(snap.fields.get("name"), Some(&FieldValue::Text("x".into())));
        let first_collected = snap.first_collected_at;
        assert_eq!(store.list_history("server", "abc").await.unwrap().len(), 1);

        // Run 2: name changes; old interval closed at run-2 time, new
        // open row keeps the original first_collected_at.
        let run2 = engine.run_unit("server").await.unwrap();
        assert_eq!(run2.changed_count, 1);
        let snap = store.get_snapshot("server", "abc").await.unwrap().unwrap();
        assert_eq!(snap.fields.get("name"), Some(&FieldValue::Text("y".into())));
        let history = store.list_history("server", "abc").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].valid_to, Some(run2.started_at));
        assert!(history[1].valid_to.is_none());
        assert_eq!(history[1].first_collected_at, first_collected);

        // Run 3: record absent upstream; snapshot reaped, history
        // closed with no successor.
        let run3 = engine.run_unit("server").await.unwrap();
        assert_eq!(run3.reaped_count, 1);
        assert!(store.get_snapshot("server", "abc").await.unwrap().is_none());
        let history = store.list_history("server", "abc").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|h| h.valid_to.is_some()));
    }

    #[tokio::test]
    async fn rerun_with_unchanged_data_is_idempotent() {
        let engine = engine();
        let data = vec![item("a", "1"), item("b", "2")];
        let unit = ScriptedUnit::new("server", vec![data.clone(), data]);
        engine.register_unit(Arc::new(unit), config()).await.unwrap();
        let store = engine.store();

        engine.run_unit("server").await.unwrap();
        let collected_before = store
            .get_snapshot("server", "a")
            .await
            .unwrap()
            .unwrap()
            .collected_at;

        let run2 = engine.run_unit("server").await.unwrap();
        assert_eq!(run2.unchanged_count, 2);
        assert_eq!(run2.new_count + run2.changed_count, 0);
        assert_eq!(store.list_history("server", "a").await.unwrap().len(), 1);

        let collected_after = store
            .get_snapshot("server", "a")
            .await
            .unwrap()
            .unwrap()
            .collected_at;
        assert!(collected_after > collected_before);
    }

    #[tokio::test]
    async fn skip_and_log_policy_drops_only_the_bad_record() {
        let engine = engine();
        let unit = ScriptedUnit::new(
            "server",
            vec![vec![item("a", "1"), serde_json::json!({"id": "b"}), item("c", "3")]],
        );
        engine.register_unit(Arc::new(unit), config()).await.unwrap();

        let run = engine.run_unit("server").await.unwrap();
        assert_eq!(run.records_fetched, 3);
        assert_eq!(run.records_skipped, 1);
        assert_eq!(run.new_count, 2);
    }

    #[tokio::test]
    async fn fail_run_policy_aborts_on_first_bad_record() {
        let engine = engine();
        let unit = ScriptedUnit::new(
            "server",
            vec![vec![item("a", "1"), serde_json::json!({"id": "b"})]],
        );
        let mut cfg = config();
        cfg.conversion_policy = ConversionPolicy::FailRun;
        engine.register_unit(Arc::new(unit), cfg).await.unwrap();

        let err = engine.run_unit("server").await;
        assert!(matches!(err, Err(Error::Conversion { .. })));
        // Nothing persisted: the persist phase never ran.
        assert!(engine
            .store()
            .get_snapshot("server", "a")
            .await
            .unwrap()
            .is_none());
        // The failed run is still durably recorded.
        let runs = engine
            .store()
            .list_runs(SyncRunQuery::default())
            .await
            .unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, SyncRunStatus::Failed);
        assert!(runs[0].error_message.is_some());
    }

    /// Fails transiently for the first `failures` fetches, then serves
    /// one record.
    struct FlakyUnit {
        failures: u32,
        transient: bool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SyncUnit for FlakyUnit {
        fn resource_type(&self) -> &str {
            "server"
        }

        async fn fetch(&self, _ctx: &FetchContext<'_>) -> Result<Vec<serde_json::Value>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout");
                return Err(if self.transient {
                    Error::transient("fetch", source)
                } else {
                    Error::backend("fetch", source)
                });
            }
            Ok(vec![item("a", "1")])
        }

        fn convert(
            &self,
            raw: &serde_json::Value,
            _scope: &ScopeConfig,
            collected_at: DateTime<Utc>,
        ) -> Result<CanonicalRecord> {
            let mut fields = BTreeMap::new();
            fields.insert(
                "name".to_string(),
                FieldValue::Text(raw["name"].as_str().unwrap_or_default().to_string()),
            );
            CanonicalRecord::new("server", raw["id"].as_str().unwrap_or("a"), fields, collected_at)
        }
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::from_millis(1), Duration::from_millis(2)).unwrap()
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let engine = engine();
        let unit = FlakyUnit {
            failures: 2,
            transient: true,
            calls: AtomicU32::new(0),
        };
        let mut cfg = config();
        cfg.retry = fast_retry(5);
        engine.register_unit(Arc::new(unit), cfg).await.unwrap();

        let run = engine.execute_unit("server").await.unwrap();
        assert_eq!(run.attempt, 3);
        assert_eq!(run.new_count, 1);
    }

    #[tokio::test]
    async fn non_transient_failures_are_not_retried() {
        let engine = engine();
        let unit = Arc::new(FlakyUnit {
            failures: 10,
            transient: false,
            calls: AtomicU32::new(0),
        });
        let mut cfg = config();
        cfg.retry = fast_retry(5);
        engine.register_unit(unit.clone(), cfg).await.unwrap();

        let err = engine.execute_unit("server").await;
        assert!(err.is_err());
        assert_eq!(unit.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_exhaust_bounded_attempts() {
        let engine = engine();
        let unit = Arc::new(FlakyUnit {
            failures: 10,
            transient: true,
            calls: AtomicU32::new(0),
        });
        let mut cfg = config();
        cfg.retry = fast_retry(3);
        engine.register_unit(unit.clone(), cfg).await.unwrap();

        let err = engine.execute_unit("server").await;
        assert!(err.is_err());
        assert_eq!(unit.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_all_respects_dependency_order() {
        let engine = engine();
        engine
            .register_unit(
                Arc::new(
                    ScriptedUnit::new("volume", vec![vec![item("v1", "vol")]])
                        .with_deps(&["server"]),
                ),
                config(),
            )
            .await
            .unwrap();
        engine
            .register_unit(
                Arc::new(ScriptedUnit::new("server", vec![vec![item("s1", "srv")]])),
                config(),
            )
            .await
            .unwrap();

        let report = engine.run_all().await.unwrap();
        assert!(report.failed.is_empty());
        assert!(report.skipped.is_empty());
        let order: Vec<&str> = report
            .completed
            .iter()
            .map(|r| r.resource_type.as_str())
            .collect();
        assert_eq!(order, vec!["server", "volume"]);
    }

    #[tokio::test]
    async fn run_all_skips_dependents_of_a_failed_unit() {
        let engine = engine();
        // "server" has no scripted data for the fetch to fail on, so
        // use a flaky unit that always fails.
        engine
            .register_unit(
                Arc::new(FlakyUnit {
                    failures: u32::MAX,
                    transient: false,
                    calls: AtomicU32::new(0),
                }),
                config(),
            )
            .await
            .unwrap();
        engine
            .register_unit(
                Arc::new(
                    ScriptedUnit::new("volume", vec![vec![item("v1", "vol")]])
                        .with_deps(&["server"]),
                ),
                config(),
            )
            .await
            .unwrap();
        engine
            .register_unit(
                Arc::new(ScriptedUnit::new("zone", vec![vec![item("z1", "dns")]])),
                config(),
            )
            .await
            .unwrap();

        let report = engine.run_all().await.unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "server");
        assert_eq!(report.skipped, vec!["volume".to_string()]);
        // Independent unit still ran.
        assert!(report
            .completed
            .iter()
            .any(|r| r.resource_type == "zone"));
    }

    #[tokio::test]
    async fn unknown_dependency_is_a_configuration_error() {
        let engine = engine();
        engine
            .register_unit(
                Arc::new(ScriptedUnit::new("volume", vec![]).with_deps(&["server"])),
                config(),
            )
            .await
            .unwrap();
        let err = engine.run_all().await;
        assert!(matches!(err, Err(Error::InvalidInput(_))));
    }
}
