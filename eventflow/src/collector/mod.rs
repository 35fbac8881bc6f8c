//! Fan-out/fan-in over named sub-steps.
//!
//! A [`CollectorSpec`] declares sub-steps and the siblings each one may await.
//! At invocation every sub-step runs concurrently against its own copy of
//! the input; a sub-step awaiting a sibling suspends until that sibling's
//! result is ready. Each sub-step runs at most once per invocation, however
//! many siblings await it.

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::Instrument;

use crate::context::EventContext;
use crate::errors::{
    CycleDetectedError, EngineError, EngineResult, UndeclaredDependencyError,
};
use crate::payload::Payload;
use crate::steps::{into_step_error, Step, StepArgs};

type CollectorFuture = BoxFuture<'static, anyhow::Result<Option<Payload>>>;
type CollectorFn = Arc<dyn Fn(Collector, EventContext) -> CollectorFuture + Send + Sync>;
type CellValue = Result<Option<Payload>, Arc<EngineError>>;

#[derive(Clone)]
struct SubStep {
    depends_on: Vec<String>,
    func: CollectorFn,
}

/// Declaration of a collector's sub-steps.
#[derive(Clone, Default)]
pub struct CollectorSpec {
    steps: IndexMap<String, SubStep>,
}

impl fmt::Debug for CollectorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let deps: IndexMap<&str, &[String]> = self
            .steps
            .iter()
            .map(|(name, s)| (name.as_str(), s.depends_on.as_slice()))
            .collect();
        f.debug_struct("CollectorSpec").field("steps", &deps).finish()
    }
}

impl CollectorSpec {
    /// Creates an empty spec.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sub-step that may await the listed siblings.
    #[must_use]
    pub fn step<F, Fut>(mut self, name: impl Into<String>, depends_on: &[&str], func: F) -> Self
    where
        F: Fn(Collector, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send + 'static,
    {
        let func: CollectorFn = Arc::new(move |collector, ctx| func(collector, ctx).boxed());
        self.steps.insert(
            name.into(),
            SubStep {
                depends_on: depends_on.iter().map(|d| (*d).to_string()).collect(),
                func,
            },
        );
        self
    }

    /// Sub-step names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// Checks that every dependency exists and that there are no cycles.
    pub fn validate(&self) -> EngineResult<()> {
        for (name, step) in &self.steps {
            if let Some(missing) = step.depends_on.iter().find(|d| !self.steps.contains_key(*d)) {
                return Err(EngineError::configuration(format!(
                    "collector step '{name}' depends on unknown step '{missing}'"
                )));
            }
        }
        self.detect_cycles()?;
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for name in self.steps.keys() {
            if !visited.contains(name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(step) = self.steps.get(node) {
            for dep in &step.depends_on {
                if !visited.contains(dep.as_str()) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(dep.as_str()) {
                    let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|n| (*n).to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(node);
        None
    }
}

struct CollectorInner {
    spec: CollectorSpec,
    input: Option<Payload>,
    context: EventContext,
    cells: HashMap<String, OnceCell<CellValue>>,
}

/// One invocation of a [`CollectorSpec`], bound to an input payload.
///
/// Handles passed to sub-steps are scoped: they may only await the
/// siblings their step declared.
#[derive(Clone)]
pub struct Collector {
    inner: Arc<CollectorInner>,
    caller: Option<String>,
    input: Option<Payload>,
}

impl fmt::Debug for Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collector")
            .field("caller", &self.caller)
            .field("spec", &self.inner.spec)
            .finish_non_exhaustive()
    }
}

impl Collector {
    /// Binds `spec` to an input, failing fast on unknown dependencies or cycles.
    pub fn new(spec: CollectorSpec, input: Option<Payload>, context: EventContext) -> EngineResult<Self> {
        spec.validate()?;
        let cells = spec
            .names()
            .map(|name| (name.to_string(), OnceCell::new()))
            .collect();
        Ok(Self {
            input: input.clone(),
            inner: Arc::new(CollectorInner {
                spec,
                input,
                context,
                cells,
            }),
            caller: None,
        })
    }

    /// The input payload as seen by this handle.
    #[must_use]
    pub fn input(&self) -> Option<&Payload> {
        self.input.as_ref()
    }

    /// The step this handle belongs to, `None` for the root handle.
    #[must_use]
    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    /// Awaits the result of sub-step `name`, running it if nobody has yet.
    pub async fn get(&self, name: &str) -> EngineResult<Option<Payload>> {
        let Some(cell) = self.inner.cells.get(name) else {
            return Err(EngineError::configuration(format!(
                "collector has no step named '{name}'"
            )));
        };
        if let Some(caller) = &self.caller {
            let declared = self
                .inner
                .spec
                .steps
                .get(caller)
                .is_some_and(|s| s.depends_on.iter().any(|d| d == name));
            if !declared {
                return Err(UndeclaredDependencyError::new(caller.clone(), name).into());
            }
        }

        let value = cell.get_or_init(|| self.run_step(name.to_string())).await;
        value.clone().map_err(|source| EngineError::Collector {
            step: name.to_string(),
            source,
        })
    }

    fn run_step(&self, name: String) -> BoxFuture<'static, CellValue> {
        let inner = Arc::clone(&self.inner);
        async move {
            let Some(step) = inner.spec.steps.get(&name) else {
                return Err(Arc::new(EngineError::configuration(format!(
                    "collector has no step named '{name}'"
                ))));
            };
            let func = Arc::clone(&step.func);
            let handle = Self {
                input: inner.input.as_ref().map(Payload::copy_for_handoff),
                caller: Some(name.clone()),
                inner: Arc::clone(&inner),
            };
            let span = tracing::debug_span!("collector_step", step = %name);
            func(handle, inner.context.clone())
                .instrument(span)
                .await
                .map_err(|e| Arc::new(into_step_error(&name, e)))
        }
        .boxed()
    }

    /// Runs every sub-step concurrently and waits for all of them.
    pub async fn run(&self) -> EngineResult<()> {
        let root = Self {
            inner: Arc::clone(&self.inner),
            caller: None,
            input: self.inner.input.clone(),
        };
        let results = join_all(root.inner.spec.names().map(|name| root.get(name))).await;
        results.into_iter().try_for_each(|r| r.map(|_| ()))
    }
}

type FinishFn = Arc<dyn Fn(Collector, EventContext) -> CollectorFuture + Send + Sync>;

/// A step that runs a collector and then a final function over its results.
pub struct CollectStep {
    name: String,
    spec: CollectorSpec,
    finish: FinishFn,
}

impl CollectStep {
    /// Creates a collector step. `finish` receives the root handle after every sub-step completed.
    pub fn new<F, Fut>(name: impl Into<String>, spec: CollectorSpec, finish: F) -> EngineResult<Self>
    where
        F: Fn(Collector, EventContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Payload>>> + Send + 'static,
    {
        spec.validate()?;
        Ok(Self {
            name: name.into(),
            spec,
            finish: Arc::new(move |collector, ctx| finish(collector, ctx).boxed()),
        })
    }
}

impl fmt::Debug for CollectStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectStep")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Step for CollectStep {
    async fn invoke(
        &self,
        payload: Option<Payload>,
        context: &EventContext,
        _args: &StepArgs,
    ) -> EngineResult<Option<Payload>> {
        let collector = Collector::new(self.spec.clone(), payload, context.clone())?;
        collector.run().await?;
        (self.finish)(collector, context.clone())
            .await
            .map_err(|e| into_step_error(&self.name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::DataObject;
    use pretty_assertions::assert_eq;
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct ItemsInfo {
        item1_id: String,
        item2_id: String,
    }

    impl DataObject for ItemsInfo {
        const DATATYPE: &'static str = "ItemsInfo";
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    enum Lookup {
        Found(String),
        Missing(String),
    }

    impl DataObject for Lookup {
        const DATATYPE: &'static str = "Lookup";
    }

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Combined {
        found: Vec<Lookup>,
    }

    impl DataObject for Combined {
        const DATATYPE: &'static str = "Combined";
    }

    fn lookup(id: &str) -> Lookup {
        if id == "a" {
            Lookup::Found(id.to_string())
        } else {
            Lookup::Missing(id.to_string())
        }
    }

    fn ctx() -> EventContext {
        EventContext::new("app.1", "collect")
    }

    fn items_spec(runs: Arc<AtomicUsize>) -> CollectorSpec {
        CollectorSpec::new()
            .step("load_first", &[], move |c, _ctx| {
                let runs = Arc::clone(&runs);
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    let info = c.input().unwrap().to_data::<ItemsInfo>()?;
                    Ok(Some(Payload::from_data(&lookup(&info.item1_id))?))
                }
            })
            .step("load_second", &[], |c, _ctx| async move {
                let info = c.input().unwrap().to_data::<ItemsInfo>()?;
                Ok(Some(Payload::from_data(&lookup(&info.item2_id))?))
            })
            .step("combine", &["load_first", "load_second"], |c, _ctx| async move {
                let mut found = Vec::new();
                for name in ["load_first", "load_second"] {
                    if let Some(p) = c.get(name).await? {
                        let item = p.to_data::<Lookup>()?;
                        if matches!(item, Lookup::Found(_)) {
                            found.push(item);
                        }
                    }
                }
                Ok(Some(Payload::from_data(&Combined { found })?))
            })
    }

    #[tokio::test]
    async fn test_collect_step_combines_siblings() {
        let runs = Arc::new(AtomicUsize::new(0));
        let step = CollectStep::new("collect", items_spec(Arc::clone(&runs)), |c, _ctx| async move {
            Ok(c.get("combine").await?)
        })
        .unwrap();

        let input = Payload::from_data(&ItemsInfo {
            item1_id: "a".to_string(),
            item2_id: "b".to_string(),
        })
        .unwrap();
        let out = step
            .invoke(Some(input), &ctx(), &StepArgs::new())
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            out.to_data::<Combined>().unwrap(),
            Combined {
                found: vec![Lookup::Found("a".to_string())]
            }
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cycle_is_rejected_at_construction() {
        let spec = CollectorSpec::new()
            .step("a", &["b"], |_c, _ctx| async { Ok(None) })
            .step("b", &["c"], |_c, _ctx| async { Ok(None) })
            .step("c", &["a"], |_c, _ctx| async { Ok(None) });

        let err = Collector::new(spec, None, ctx()).unwrap_err();
        let EngineError::CycleDetected(cycle) = err else {
            panic!("expected cycle error, got {err:?}");
        };
        assert_eq!(cycle.cycle_path, vec!["a", "b", "c", "a"]);
    }

    #[test]
    fn test_unknown_dependency_is_rejected() {
        let spec = CollectorSpec::new().step("a", &["ghost"], |_c, _ctx| async { Ok(None) });
        assert!(Collector::new(spec, None, ctx()).unwrap_err().is_configuration());
    }

    #[tokio::test]
    async fn test_undeclared_dependency_fails() {
        let spec = CollectorSpec::new()
            .step("a", &[], |_c, _ctx| async { Ok(Some(Payload::new("N", json!(1)))) })
            .step("b", &[], |c, _ctx| async move { Ok(c.get("a").await?) });

        let collector = Collector::new(spec, None, ctx()).unwrap();
        let err = collector.run().await.unwrap_err();
        let EngineError::Collector { step, source } = err else {
            panic!("expected collector error");
        };
        assert_eq!(step, "b");
        assert!(matches!(*source, EngineError::UndeclaredDependency(_)));
    }

    #[tokio::test]
    async fn test_sibling_failure_is_shared() {
        let spec = CollectorSpec::new()
            .step("fail", &[], |_c, _ctx| async { Err(anyhow::anyhow!("nope")) })
            .step("after", &["fail"], |c, _ctx| async move { Ok(c.get("fail").await?) });

        let collector = Collector::new(spec, None, ctx()).unwrap();
        assert!(collector.run().await.is_err());
        let err = collector.get("fail").await.unwrap_err();
        assert!(err.to_string().contains("fail"));
    }

    #[tokio::test]
    async fn test_branches_get_copies_of_mutable_input() {
        let spec = CollectorSpec::new().step("mutate", &[], |c, _ctx| async move {
            let mut own = c.input().cloned().unwrap();
            own.value_mut()?["touched"] = json!(true);
            Ok(Some(own))
        });
        let input = Payload::new("Doc", json!({"touched": false}));
        let collector = Collector::new(spec, Some(input.clone()), ctx()).unwrap();
        collector.run().await.unwrap();

        let out = collector.get("mutate").await.unwrap().unwrap();
        assert_eq!(out.value()["touched"], json!(true));
        assert_eq!(collector.input().unwrap().value()["touched"], json!(false));
        assert_eq!(input.value()["touched"], json!(false));
    }
}
