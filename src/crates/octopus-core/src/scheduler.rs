//! Drives the graph: runs event-driven sources once at start, runs
//! cron-scheduled sources on their own clock, and wires each run's output
//! down through filters and sinks.
//!
//! A "run" starts at exactly one source and builds its own downstream
//! pipeline on the fly: the source's plugin is invoked, its output is teed to
//! each child, filters merge whatever branches reach them and hand their
//! output further down, and sinks apply their throttle/batch policy before
//! consuming to completion. Two triggers of the same cron-scheduled source
//! overlapping in time each get their own independent run (nothing coalesces
//! or queues them), so a slow run never blocks the next tick.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use cron::Schedule;
use futures::future::try_join_all;
use futures::StreamExt;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::dag::{Dag, NodeSpec};
use crate::error::{OctopusError, Result};
use crate::plugin::{Callable, PluginRegistry, Role};
use crate::sink::{count_events, BatchAccumulator, ThrottleGate};
use crate::stream::{merge, tee, Stream};

/// Parse a standard five-field cron expression (`minute hour day-of-month
/// month day-of-week`), the format every scheduled source's `schedule` key
/// is documented to carry.
///
/// The `cron` crate itself only parses six- or seven-field expressions with
/// a leading seconds field, so a well-formed five-field expression is
/// translated by prepending a fixed `"0"` seconds field (fire on the minute,
/// never mid-minute) before being handed to it. Anything that isn't exactly
/// five whitespace-separated fields is rejected up front rather than passed
/// through, so a six-field expression someone copies in by habit doesn't
/// silently get reinterpreted as a seconds-first schedule.
fn parse_cron(expr: &str) -> std::result::Result<Schedule, String> {
    let field_count = expr.split_whitespace().count();
    if field_count != 5 {
        return Err(format!(
            "expected a five-field cron expression, got {field_count} field(s) in `{expr}`"
        ));
    }
    Schedule::from_str(&format!("0 {}", expr.trim())).map_err(|err| err.to_string())
}

/// Drives a built [`Dag`] against a [`PluginRegistry`] until cancelled.
pub struct Scheduler {
    dag: Arc<Dag>,
    registry: Arc<PluginRegistry>,
    throttle_gates: Arc<HashMap<String, Arc<ThrottleGate>>>,
    batch_accumulators: Arc<HashMap<String, Arc<BatchAccumulator>>>,
    schedules: Arc<HashMap<String, Schedule>>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Scheduler {
    /// Build a scheduler for `dag`, pre-spawning a persistent batch worker
    /// for every batching sink and validating every scheduled source's cron
    /// expression up front.
    pub fn new(dag: Dag, registry: PluginRegistry) -> Result<Self> {
        let registry = Arc::new(registry);
        let mut throttle_gates = HashMap::new();
        let mut batch_accumulators = HashMap::new();
        let mut schedules = HashMap::new();

        for node in dag.nodes.values() {
            if node.role == Role::Sink {
                // Throttle and batch are orthogonal: every sink
                // gets a gate regardless of whether it also batches, so a
                // throttled+batched sink still skips enqueueing on a run that
                // comes in too soon after the last event-bearing one.
                throttle_gates.insert(node.name.clone(), Arc::new(ThrottleGate::new(node.throttle)));

                if let Some(batch) = &node.batch {
                    let entry = registry.resolve(&node.plugin)?;
                    let plugin = match &entry.callable {
                        Callable::Sink(plugin) => plugin.clone(),
                        _ => {
                            return Err(OctopusError::invalid_configuration(format!(
                                "plugin `{}` is not a sink",
                                node.plugin
                            )))
                        }
                    };
                    let params = node.params_value();
                    batch_accumulators.insert(
                        node.name.clone(),
                        Arc::new(BatchAccumulator::spawn(plugin, params, batch.timeout)),
                    );
                }
            }
        }

        for root in &dag.roots {
            let node = &dag.nodes[root];
            if let Some(expr) = &node.schedule {
                let schedule = parse_cron(expr).map_err(|err| {
                    OctopusError::invalid_configuration(format!("bad cron expression for `{root}`: {err}"))
                })?;
                schedules.insert(root.clone(), schedule);
            }
        }

        Ok(Self {
            dag: Arc::new(dag),
            registry,
            throttle_gates: Arc::new(throttle_gates),
            batch_accumulators: Arc::new(batch_accumulators),
            schedules: Arc::new(schedules),
            cancelled: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        })
    }

    /// Signal cancellation and abort every in-flight run.
    ///
    /// Batch worker tasks are left running (they hold their own queues and
    /// flush whatever they have buffered when their accumulator handle is
    /// dropped); what's cancelled here is the set of currently executing
    /// source/filter/sink pipelines.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
        self.tasks.lock().await.abort_all();
    }

    /// Run every event-driven source once, then drive cron-scheduled sources
    /// forever, until [`Scheduler::cancel`] is called.
    pub async fn run(&self) -> Result<()> {
        let event_driven: Vec<String> = self
            .dag
            .roots
            .iter()
            .filter(|name| !self.schedules.contains_key(*name))
            .cloned()
            .collect();
        for name in event_driven {
            self.spawn_supervised(name).await;
        }

        let mut next_fire: HashMap<String, chrono::DateTime<Local>> = HashMap::new();
        for (name, schedule) in self.schedules.iter() {
            if let Some(fire) = schedule.upcoming(Local).next() {
                next_fire.insert(name.clone(), fire);
            }
        }

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Ok(());
            }

            let Some((name, fire)) = next_fire.iter().min_by_key(|(_, t)| **t).map(|(n, t)| (n.clone(), *t)) else {
                self.wake.notified().await;
                continue;
            };

            let delay = (fire - Local::now()).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.spawn_supervised(name.clone()).await;
                    if let Some(schedule) = self.schedules.get(&name) {
                        match schedule.upcoming(Local).next() {
                            Some(next) => { next_fire.insert(name.clone(), next); }
                            None => { next_fire.remove(&name); }
                        }
                    }
                }
                _ = self.wake.notified() => {}
            }
        }
    }

    async fn spawn_supervised(&self, name: String) {
        let dag = self.dag.clone();
        let registry = self.registry.clone();
        let throttle_gates = self.throttle_gates.clone();
        let batch_accumulators = self.batch_accumulators.clone();
        self.tasks.lock().await.spawn(async move {
            debug!(node = %name, "run started");
            if let Err(err) = run_trigger(&name, &dag, &registry, &throttle_gates, &batch_accumulators).await {
                error!(node = %name, error = %err, "run failed");
            }
        });
    }
}

fn topological_order(reachable: &HashSet<String>, dag: &Dag) -> Result<Vec<String>> {
    let mut in_degree: HashMap<String, usize> = HashMap::new();
    for name in reachable {
        let count = dag.nodes[name].parents.iter().filter(|p| reachable.contains(*p)).count();
        in_degree.insert(name.clone(), count);
    }

    let mut ready: Vec<String> = in_degree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| name.clone())
        .collect();
    ready.sort();
    let mut queue: VecDeque<String> = ready.into();

    let mut order = Vec::with_capacity(reachable.len());
    while let Some(name) = queue.pop_front() {
        order.push(name.clone());
        let mut newly_ready = Vec::new();
        for child in &dag.nodes[&name].children {
            if !reachable.contains(child) {
                continue;
            }
            let entry = in_degree.get_mut(child).expect("child counted above");
            *entry -= 1;
            if *entry == 0 {
                newly_ready.push(child.clone());
            }
        }
        newly_ready.sort();
        queue.extend(newly_ready);
    }

    if order.len() != reachable.len() {
        return Err(OctopusError::invalid_configuration(
            "cycle detected while ordering a run",
        ));
    }
    Ok(order)
}

fn reachable_from(start: &str, dag: &Dag) -> HashSet<String> {
    let mut seen = HashSet::new();
    seen.insert(start.to_string());
    let mut queue = VecDeque::from([start.to_string()]);
    while let Some(name) = queue.pop_front() {
        for child in &dag.nodes[&name].children {
            if seen.insert(child.clone()) {
                queue.push_back(child.clone());
            }
        }
    }
    seen
}

async fn run_trigger(
    start: &str,
    dag: &Dag,
    registry: &PluginRegistry,
    throttle_gates: &HashMap<String, Arc<ThrottleGate>>,
    batch_accumulators: &HashMap<String, Arc<BatchAccumulator>>,
) -> Result<()> {
    let reachable = reachable_from(start, dag);
    let order = topological_order(&reachable, dag)?;

    let mut edges: HashMap<(String, String), Stream> = HashMap::new();
    let mut sink_tasks = Vec::new();

    for name in order {
        let node = &dag.nodes[&name];
        let params = node.params_value();

        match node.role {
            Role::Source => {
                let entry = registry.resolve(&node.plugin)?;
                let plugin = match &entry.callable {
                    Callable::Source(plugin) => plugin.clone(),
                    _ => return Err(not_a(&node.plugin, "source")),
                };
                let output = plugin.run(&params).await?;
                distribute(&mut edges, node, output);
            }
            Role::Filter => {
                let merged = gather_inputs(&mut edges, node);
                let entry = registry.resolve(&node.plugin)?;
                let plugin = match &entry.callable {
                    Callable::Filter(plugin) => plugin.clone(),
                    _ => return Err(not_a(&node.plugin, "filter")),
                };
                let output = plugin.run(merged, &params).await?;
                distribute(&mut edges, node, output);
            }
            Role::Sink => {
                let merged = gather_inputs(&mut edges, node);
                sink_tasks.push(run_sink(node, merged, params, registry, throttle_gates, batch_accumulators));
            }
        }
    }

    try_join_all(sink_tasks).await?;
    Ok(())
}

fn not_a(plugin: &str, role: &str) -> OctopusError {
    OctopusError::invalid_configuration(format!("plugin `{plugin}` is not registered as a {role}"))
}

/// Wrap `stream` so every event it yields is logged at DEBUG before being
/// handed to whatever reads it next (a per-edge `tracing` span stands in for
/// a dedicated event trace channel).
fn trace_edge(stream: Stream, source: String, target: String) -> Stream {
    Box::pin(stream.inspect(move |item| {
        if let Ok(event) = item {
            debug!(source = %source, target = %target, event = %event.name, "event crossed edge");
        }
    }))
}

fn distribute(edges: &mut HashMap<(String, String), Stream>, node: &NodeSpec, output: Stream) {
    if node.children.is_empty() {
        return;
    }
    let branches = tee(output, node.children.len());
    for (child, branch) in node.children.iter().zip(branches) {
        let traced = trace_edge(branch, node.name.clone(), child.clone());
        edges.insert((node.name.clone(), child.clone()), traced);
    }
}

fn gather_inputs(edges: &mut HashMap<(String, String), Stream>, node: &NodeSpec) -> Stream {
    let mut inputs: Vec<Stream> = node
        .parents
        .iter()
        .filter_map(|parent| edges.remove(&(parent.clone(), node.name.clone())))
        .collect();
    if inputs.len() == 1 {
        inputs.pop().expect("length checked above")
    } else {
        merge(inputs)
    }
}

async fn run_sink(
    node: &NodeSpec,
    upstream: Stream,
    params: serde_json::Value,
    registry: &PluginRegistry,
    throttle_gates: &HashMap<String, Arc<ThrottleGate>>,
    batch_accumulators: &HashMap<String, Arc<BatchAccumulator>>,
) -> Result<()> {
    let gate = throttle_gates
        .get(&node.name)
        .cloned()
        .unwrap_or_else(|| Arc::new(ThrottleGate::new(node.throttle)));

    // Throttle and batch co-apply: the gate decides, on every run, whether
    // this run's events are even forwarded to the queue (a throttled run's
    // upstream is simply dropped unconsumed; a boxed `Stream`'s own `Drop`
    // releases whatever resources it held).
    if let Some(accumulator) = batch_accumulators.get(&node.name) {
        let accumulator = accumulator.clone();
        let node_name = node.name.clone();
        return gate
            .guarded(move || async move {
                count_events(upstream, move |event| {
                    if let Err(err) = accumulator.push(event) {
                        error!(node = %node_name, error = %err, "failed to enqueue batched event");
                    }
                })
                .await
            })
            .await;
    }

    let entry = registry.resolve(&node.plugin)?;
    let plugin = match &entry.callable {
        Callable::Sink(plugin) => plugin.clone(),
        _ => return Err(not_a(&node.plugin, "sink")),
    };

    let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counted = counter.clone();
    let counted_stream: Stream = Box::pin(upstream.inspect(move |_| {
        counted.fetch_add(1, Ordering::Relaxed);
    }));

    gate.guarded(move || async move {
        plugin.run(counted_stream, &params).await?;
        Ok(counter.load(Ordering::Relaxed))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::dag::build_dag;
    use crate::event::Event;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{advance, pause};

    #[test]
    fn parse_cron_accepts_standard_five_field_expressions() {
        assert!(parse_cron("* * * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("0 9 * * mon-fri").is_ok());
    }

    #[test]
    fn parse_cron_rejects_a_leading_seconds_field() {
        let err = parse_cron("0 * * * * *").unwrap_err();
        assert!(err.contains("five-field"));
    }

    #[test]
    fn parse_cron_rejects_too_few_fields() {
        let err = parse_cron("* * *").unwrap_err();
        assert!(err.contains("five-field"));
    }

    struct CountingSource {
        events: Vec<&'static str>,
    }

    #[async_trait]
    impl crate::plugin::SourceCallable for CountingSource {
        async fn run(&self, _params: &serde_json::Value) -> Result<Stream> {
            let events: Vec<Result<Event>> = self
                .events
                .iter()
                .map(|name| Ok(Event::new(Utc::now(), *name, json!(null))))
                .collect();
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    struct PassThroughFilter;

    #[async_trait]
    impl crate::plugin::FilterCallable for PassThroughFilter {
        async fn run(&self, upstream: Stream, _params: &serde_json::Value) -> Result<Stream> {
            Ok(upstream)
        }
    }

    struct CollectingSink {
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl crate::plugin::SinkCallable for CollectingSink {
        async fn run(&self, mut upstream: Stream, _params: &serde_json::Value) -> Result<()> {
            let mut count = 0;
            while let Some(event) = upstream.next().await {
                event?;
                count += 1;
            }
            self.seen.fetch_add(count, Ordering::SeqCst);
            Ok(())
        }
    }

    fn diamond_config() -> PipelineConfig {
        PipelineConfig::from_str(
            r#"
src:
  plugin: counting.source
  flow: "-> f1, f2"
f1:
  plugin: pass.through
  flow: "src -> snk"
f2:
  plugin: pass.through
  flow: "src -> snk"
snk:
  plugin: collecting.sink
  flow: "f1, f2 ->"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn diamond_merges_both_branches_into_the_sink() {
        let config = diamond_config();

        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry.register(
            "counting.source",
            Callable::Source(Arc::new(CountingSource {
                events: vec!["a", "b"],
            })),
            crate::plugin::ConfigSchema::empty(),
        );
        registry.register(
            "pass.through",
            Callable::Filter(Arc::new(PassThroughFilter)),
            crate::plugin::ConfigSchema::empty(),
        );
        registry.register(
            "collecting.sink",
            Callable::Sink(Arc::new(CollectingSink { seen: seen.clone() })),
            crate::plugin::ConfigSchema::empty(),
        );

        let dag = build_dag(&config, &registry).unwrap();

        run_trigger("src", &dag, &registry, &HashMap::new(), &HashMap::new())
            .await
            .unwrap();

        // Each of the two events is teed to both f1 and f2, so the sink
        // (fed by the merge of both filters) observes 2 events x 2 branches.
        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn event_driven_source_runs_once_at_start() {
        pause();
        let config = PipelineConfig::from_str(
            r#"
src:
  plugin: counting.source
  flow: "-> snk"
snk:
  plugin: collecting.sink
  flow: "src ->"
"#,
        )
        .unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry.register(
            "counting.source",
            Callable::Source(Arc::new(CountingSource { events: vec!["a"] })),
            crate::plugin::ConfigSchema::empty(),
        );
        registry.register(
            "collecting.sink",
            Callable::Sink(Arc::new(CollectingSink { seen: seen.clone() })),
            crate::plugin::ConfigSchema::empty(),
        );

        let dag = build_dag(&config, &registry).unwrap();
        let scheduler = Scheduler::new(dag, registry).unwrap();
        let run = tokio::spawn(async move { scheduler.run().await });
        tokio::task::yield_now().await;
        advance(std::time::Duration::from_millis(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        run.abort();
    }

    struct BatchCountingSink {
        batches: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl crate::plugin::SinkCallable for BatchCountingSink {
        async fn run(&self, mut upstream: Stream, _params: &serde_json::Value) -> Result<()> {
            let mut count = 0;
            while let Some(event) = upstream.next().await {
                event?;
                count += 1;
            }
            self.batches.lock().unwrap().push(count);
            Ok(())
        }
    }

    #[tokio::test]
    async fn throttled_batch_sink_drops_a_run_inside_the_cooldown() {
        pause();
        use crate::config::Flow;
        use std::time::Duration;

        let batches = Arc::new(std::sync::Mutex::new(Vec::new()));
        let plugin: Arc<dyn crate::plugin::SinkCallable> =
            Arc::new(BatchCountingSink { batches: batches.clone() });
        let accumulator = Arc::new(BatchAccumulator::spawn(plugin, json!(null), Duration::from_secs(5)));
        let mut batch_accumulators = HashMap::new();
        batch_accumulators.insert("snk".to_string(), accumulator);

        let mut throttle_gates = HashMap::new();
        throttle_gates.insert(
            "snk".to_string(),
            Arc::new(ThrottleGate::new(Some(Duration::from_secs(60)))),
        );

        let node = NodeSpec {
            name: "snk".to_string(),
            plugin: "whatever".to_string(),
            role: Role::Sink,
            flow: Flow::parse("src ->").unwrap(),
            schedule: None,
            throttle: Some(Duration::from_secs(60)),
            batch: Some(crate::dag::BatchSpec {
                timeout: Duration::from_secs(5),
            }),
            params: HashMap::new(),
            children: Vec::new(),
            parents: vec!["src".to_string()],
        };
        let registry = PluginRegistry::new();

        // First run: gate is open, events are forwarded to the batch queue.
        let first: Stream = Box::pin(futures::stream::iter(vec![Ok(Event::new(
            Utc::now(),
            "a",
            json!(null),
        ))]));
        run_sink(&node, first, json!(null), &registry, &throttle_gates, &batch_accumulators)
            .await
            .unwrap();

        // Second run lands well inside the 60s cooldown: its event must never
        // reach the accumulator, even though the sink also batches.
        let second: Stream = Box::pin(futures::stream::iter(vec![Ok(Event::new(
            Utc::now(),
            "b",
            json!(null),
        ))]));
        run_sink(&node, second, json!(null), &registry, &throttle_gates, &batch_accumulators)
            .await
            .unwrap();

        tokio::task::yield_now().await;
        advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(*batches.lock().unwrap(), vec![1]);
    }
}
