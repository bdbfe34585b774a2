//! Scheduler
//!
//! Owns the state tree and every unit instance, and advances simulation time.
//!
//! # Tick
//!
//! Each tick at `current_time`:
//! 1. **Steps** run in topological order, repeatedly, until a pass fires
//!    nothing. A step fires when the fingerprint of its inputs differs from
//!    the one it last saw. Its delta is applied immediately.
//! 2. **Processes** due at or before `current_time` fire with the interval
//!    since they last fired. All of them read the same pre-fire state; their
//!    deltas are applied in `(due time, path)` order.
//! 3. **Emit** captures the configured paths.
//! 4. Time advances to the earliest due process, capped at the end time.
//!
//! # Faults
//!
//! An adapter error, or a delta the tree rejects, makes the offending unit
//! inert: it never fires again and the state it last wrote stays frozen.
//! Everything else keeps running and the fault is reported in
//! [`RunReport::faults`].

mod queue;

pub use queue::{DueEntry, DueQueue};

use std::collections::HashMap;

use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, instrument, trace, warn};

use crate::composite::CompositeDefinition;
use crate::config::SchedulerConfig;
use crate::dag::{StepGraph, StepNode};
use crate::delta::{Applied, Delta};
use crate::emitter::Emitter;
use crate::error::{AdapterError, Error, Result};
use crate::path::Path;
use crate::registry::TypeRegistry;
use crate::stable_hash::fingerprint_ports;
use crate::tree::StateTree;
use crate::types::{Time, UnitKind, Value};
use crate::unit::{State, UnitImpl, UnitRegistry, Update};
use crate::wiring::{Binding, DEFAULT_INTERVAL, ResolvedPort, UnitDeclaration, Wiring};

/// A live process or step.
#[derive(Debug)]
struct UnitInstance {
    path: Path,
    address: String,
    implementation: UnitImpl,
    wiring: Wiring,
    interval: Time,
    last_fire_time: Time,
    next_due_time: Time,
    last_input_fingerprint: Option<u64>,
    generation: u64,
    inert: bool,
}

impl UnitInstance {
    fn kind(&self) -> UnitKind {
        self.implementation.kind()
    }
}

/// A unit that failed and was frozen.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitFault {
    pub path: Path,
    pub time: Time,
    pub message: String,
}

/// Summary of one call to [`Scheduler::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub start_time: Time,
    pub end_time: Time,
    /// Ticks executed by this run.
    pub ticks: u64,
    /// Faults recorded during this run.
    pub faults: Vec<UnitFault>,
}

struct ProcessJob<'a> {
    order: usize,
    instance: &'a mut UnitInstance,
    state: State,
    interval: Time,
}

struct ProcessResult {
    order: usize,
    path: Path,
    generation: u64,
    result: std::result::Result<Update, AdapterError>,
}

fn run_process(job: ProcessJob<'_>) -> ProcessResult {
    let ProcessJob {
        order,
        instance,
        state,
        interval,
    } = job;
    let result = match &mut instance.implementation {
        UnitImpl::Process(process) => process.update(&state, interval),
        UnitImpl::Step(_) => Err(AdapterError::new("a step cannot be scheduled as a process")),
    };
    ProcessResult {
        order,
        path: instance.path.clone(),
        generation: instance.generation,
        result,
    }
}

/// The composition and scheduling engine.
pub struct Scheduler {
    tree: StateTree,
    types: TypeRegistry,
    units: UnitRegistry,
    config: SchedulerConfig,
    instances: IndexMap<Path, UnitInstance>,
    step_order: Vec<Path>,
    steps_dirty: bool,
    due: DueQueue,
    current_time: Time,
    tick: u64,
    next_generation: u64,
    emitter: Emitter,
    faults: Vec<UnitFault>,
}

impl Scheduler {
    /// Build a composite: parse the tree, instantiate and wire every declared
    /// unit, seed missing state and order the steps.
    ///
    /// Any error aborts construction.
    #[instrument(skip_all)]
    pub fn build(definition: CompositeDefinition, types: TypeRegistry, units: UnitRegistry) -> Result<Self> {
        let CompositeDefinition { state, config } = definition;
        let tree = StateTree::from_value(&state, &types)?;
        let emitter = Emitter::new(config.emit.clone());

        let mut scheduler = Self {
            tree,
            types,
            units,
            config,
            instances: IndexMap::new(),
            step_order: Vec::new(),
            steps_dirty: true,
            due: DueQueue::new(),
            current_time: 0.0,
            tick: 0,
            next_generation: 0,
            emitter,
            faults: Vec::new(),
        };

        for (path, decl) in scheduler.tree.units() {
            scheduler.instantiate(&path, &decl)?;
        }
        scheduler.refresh_step_order()?;

        info!(
            units = scheduler.instances.len(),
            steps = scheduler.step_order.len(),
            "composite built"
        );
        Ok(scheduler)
    }

    pub fn tree(&self) -> &StateTree {
        &self.tree
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn current_time(&self) -> Time {
        self.current_time
    }

    /// Ticks executed so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Copy of the value at `path`.
    pub fn get(&self, path: &Path) -> Result<Value> {
        self.tree.get(path)
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn emitter_mut(&mut self) -> &mut Emitter {
        &mut self.emitter
    }

    /// Time series of `path` from the emit log.
    pub fn query(&self, path: &Path) -> Vec<(Time, Value)> {
        self.emitter.query(path)
    }

    /// Every fault recorded since construction.
    pub fn faults(&self) -> &[UnitFault] {
        &self.faults
    }

    /// Paths of all live unit instances, in instantiation order.
    pub fn unit_paths(&self) -> Vec<Path> {
        self.instances.keys().cloned().collect()
    }

    /// Steps in execution order.
    pub fn step_order(&self) -> &[Path] {
        &self.step_order
    }

    pub fn is_inert(&self, unit: &Path) -> bool {
        self.instances.get(unit).is_some_and(|i| i.inert)
    }

    /// Run until `end_time`. Ticks execute at times in
    /// `[current_time, end_time)`.
    #[instrument(skip(self), fields(start = self.current_time))]
    pub fn run(&mut self, end_time: Time) -> Result<RunReport> {
        let start_time = self.current_time;
        let start_tick = self.tick;
        let first_fault = self.faults.len();

        if end_time.is_nan() || end_time <= self.current_time {
            debug!(end_time, "nothing to run");
            return Ok(self.report(start_time, start_tick, first_fault));
        }

        info!(start_time, end_time, units = self.instances.len(), "starting run");

        loop {
            self.settle_steps()?;
            self.fire_due_processes()?;
            self.emitter.capture(self.tick, self.current_time, &self.tree)?;
            self.tick += 1;

            let instances = &self.instances;
            let next = self
                .due
                .next_time(|entry| is_live(instances, entry))
                .map_or(end_time, |t| t.min(end_time));
            trace!(tick = self.tick, from = self.current_time, to = next, "advance");
            self.current_time = next;
            if self.current_time >= end_time {
                break;
            }
        }

        self.emitter.flush()?;
        let report = self.report(start_time, start_tick, first_fault);
        info!(
            ticks = report.ticks,
            faults = report.faults.len(),
            end_time = report.end_time,
            "run complete"
        );
        Ok(report)
    }

    /// Run for `duration` past the current time.
    pub fn run_for(&mut self, duration: Time) -> Result<RunReport> {
        self.run(self.current_time + duration)
    }

    /// Flush and close emit sinks.
    pub fn close(&mut self) -> Result<()> {
        self.emitter.close()?;
        Ok(())
    }

    fn report(&self, start_time: Time, start_tick: u64, first_fault: usize) -> RunReport {
        RunReport {
            start_time,
            end_time: self.current_time,
            ticks: self.tick - start_tick,
            faults: self.faults[first_fault..].to_vec(),
        }
    }

    // === Instances ===

    fn instantiate(&mut self, path: &Path, decl: &UnitDeclaration) -> Result<()> {
        let mut implementation = self
            .units
            .construct(path, decl.kind, &decl.address, &decl.config)?;
        let inputs = implementation.inputs();
        let outputs = implementation.outputs();
        let wiring = Wiring::resolve(path, decl, &inputs, &outputs, &self.types)?;
        let initial = implementation.initial_state().map_err(|source| Error::Adapter {
            unit: path.clone(),
            source,
        })?;

        for (name, port) in wiring.inputs.iter().chain(wiring.outputs.iter()) {
            self.declare_port(port, initial.get(name))?;
        }

        let kind = implementation.kind();
        let interval = decl.interval.unwrap_or(DEFAULT_INTERVAL);
        let generation = self.next_generation;
        self.next_generation += 1;
        let next_due_time = self.current_time + interval;

        if kind == UnitKind::Process {
            self.due.push(DueEntry {
                time: next_due_time,
                path: path.clone(),
                generation,
            });
        } else {
            self.steps_dirty = true;
        }

        debug!(unit = %path, address = %decl.address, %kind, "instantiated unit");
        let previous = self.instances.insert(
            path.clone(),
            UnitInstance {
                path: path.clone(),
                address: decl.address.clone(),
                implementation,
                wiring,
                interval,
                last_fire_time: self.current_time,
                next_due_time,
                last_input_fingerprint: None,
                generation,
                inert: false,
            },
        );
        if previous.is_some_and(|p| p.kind() == UnitKind::Step) {
            self.steps_dirty = true;
        }
        Ok(())
    }

    fn declare_port(&mut self, port: &ResolvedPort, initial: Option<&Value>) -> Result<()> {
        match &port.binding {
            Binding::Path(path) => {
                let created = self.tree.declare(path, &port.schema, &self.types)?;
                if created && let Some(value) = initial {
                    self.tree.set(path, value.clone(), &self.types)?;
                }
            }
            Binding::Fields(fields) => {
                for (field, sub) in fields {
                    self.declare_port(sub, initial.and_then(|v| v.get(field)))?;
                }
            }
        }
        Ok(())
    }

    fn drop_units_under(&mut self, prefix: &Path) {
        let doomed: Vec<Path> = self
            .instances
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        for path in doomed {
            if let Some(instance) = self.instances.shift_remove(&path) {
                if instance.kind() == UnitKind::Step {
                    self.steps_dirty = true;
                }
                debug!(unit = %path, address = %instance.address, "dropped unit");
            }
        }
    }

    /// Keep instances in step with a structural change to the tree.
    fn reconcile_instances(&mut self, applied: &Applied) {
        for removed in &applied.removed {
            self.drop_units_under(removed);
        }
        for added in &applied.added {
            self.drop_units_under(added);
            for (path, decl) in self.tree.units_under(added) {
                if let Err(err) = self.instantiate(&path, &decl) {
                    self.record_fault(&path, err.to_string());
                }
            }
        }
    }

    fn record_fault(&mut self, unit: &Path, message: String) {
        warn!(unit = %unit, time = self.current_time, error = %message, "unit fault, freezing unit");
        if let Some(instance) = self.instances.get_mut(unit) {
            instance.inert = true;
            if instance.kind() == UnitKind::Step {
                self.steps_dirty = true;
            }
        }
        self.faults.push(UnitFault {
            path: unit.clone(),
            time: self.current_time,
            message,
        });
    }

    fn refresh_step_order(&mut self) -> Result<()> {
        if !self.steps_dirty {
            return Ok(());
        }
        let nodes: Vec<StepNode> = self
            .instances
            .values()
            .filter(|i| i.kind() == UnitKind::Step && !i.inert)
            .map(|i| StepNode {
                id: i.path.clone(),
                reads: i.wiring.read_paths(),
                writes: i.wiring.write_paths(),
            })
            .collect();
        let graph = StepGraph::build(&nodes)?;
        self.step_order = graph.order();
        self.steps_dirty = false;
        debug!(steps = self.step_order.len(), levels = graph.levels.len(), "step order rebuilt");
        Ok(())
    }

    // === Updates ===

    /// Apply a unit's update and follow any structural change. A rejected
    /// delta faults the unit.
    fn commit(&mut self, unit: &Path, update: &Update) {
        let mut applied = Applied::default();
        let outcome = self.apply_update(unit, update, &mut applied);
        // ports applied before a rejection stay applied
        if !applied.removed.is_empty() || !applied.added.is_empty() {
            debug!(
                unit = %unit,
                removed = applied.removed.len(),
                added = applied.added.len(),
                "structural change"
            );
            self.reconcile_instances(&applied);
        }
        if let Err(err) = outcome {
            self.record_fault(unit, err.to_string());
        }
    }

    fn apply_update(&mut self, unit: &Path, update: &Update, applied: &mut Applied) -> Result<()> {
        let Some(instance) = self.instances.get(unit) else {
            return Ok(());
        };
        for (port_name, delta) in update {
            let port = instance
                .wiring
                .outputs
                .get(port_name)
                .ok_or_else(|| Error::InvalidDeclaration {
                    path: unit.clone(),
                    message: format!("update names undeclared output port `{port_name}`"),
                })?;
            applied.absorb(apply_port(&mut self.tree, &self.types, unit, port, delta)?);
        }
        Ok(())
    }

    // === Steps ===

    /// Run steps until a pass fires nothing.
    #[instrument(skip(self), fields(tick = self.tick))]
    fn settle_steps(&mut self) -> Result<()> {
        let max_passes = self.config.max_step_passes.max(1);
        let mut last_fired = Vec::new();
        for pass in 0..max_passes {
            self.refresh_step_order()?;
            let mut fired = Vec::new();
            for path in self.step_order.clone() {
                if self.fire_step(&path) {
                    fired.push(path);
                }
            }
            if fired.is_empty() {
                trace!(passes = pass + 1, "steps settled");
                return Ok(());
            }
            trace!(pass, fired = fired.len(), "step pass");
            last_fired = fired;
        }
        Err(Error::StepConvergence {
            passes: max_passes,
            unstable: last_fired,
        })
    }

    /// Fire one step if its inputs changed. Returns whether it fired.
    fn fire_step(&mut self, path: &Path) -> bool {
        let Some(instance) = self.instances.get(path) else {
            return false;
        };
        if instance.inert {
            return false;
        }
        let state = match read_inputs(&self.tree, &instance.wiring) {
            Ok(state) => state,
            Err(err) => {
                self.record_fault(path, err.to_string());
                return false;
            }
        };
        let fingerprint = fingerprint_ports(&state);
        if instance.last_input_fingerprint == Some(fingerprint) {
            return false;
        }

        let Some(instance) = self.instances.get_mut(path) else {
            return false;
        };
        instance.last_input_fingerprint = Some(fingerprint);
        let result = match &mut instance.implementation {
            UnitImpl::Step(step) => step.update(&state),
            UnitImpl::Process(_) => return false,
        };
        debug!(unit = %path, "step fired");

        match result {
            Ok(update) => self.commit(path, &update),
            Err(err) => self.record_fault(path, err.message),
        }
        true
    }

    // === Processes ===

    #[instrument(skip(self), fields(tick = self.tick, time = self.current_time))]
    fn fire_due_processes(&mut self) -> Result<()> {
        let now = self.current_time;
        let instances = &self.instances;
        let due = self.due.pop_due(now, |entry| is_live(instances, entry));
        if due.is_empty() {
            return Ok(());
        }

        // every due process reads the same pre-fire state
        let mut inputs: HashMap<Path, (usize, State, Time)> = HashMap::with_capacity(due.len());
        let mut unreadable = Vec::new();
        for (order, entry) in due.iter().enumerate() {
            let Some(instance) = self.instances.get(&entry.path) else {
                continue;
            };
            match read_inputs(&self.tree, &instance.wiring) {
                Ok(state) => {
                    inputs.insert(entry.path.clone(), (order, state, now - instance.last_fire_time));
                }
                Err(err) => unreadable.push((entry.path.clone(), err.to_string())),
            }
        }
        for (path, message) in unreadable {
            self.record_fault(&path, message);
        }

        let mut jobs: Vec<ProcessJob<'_>> = self
            .instances
            .values_mut()
            .filter_map(|instance| {
                let (order, state, interval) = inputs.remove(&instance.path)?;
                Some(ProcessJob {
                    order,
                    instance,
                    state,
                    interval,
                })
            })
            .collect();
        jobs.sort_by_key(|job| job.order);

        let mut results: Vec<ProcessResult> = if self.config.parallel_processes {
            jobs.into_par_iter().map(run_process).collect()
        } else {
            jobs.into_iter().map(run_process).collect()
        };
        results.sort_by_key(|r| r.order);

        for ProcessResult {
            path,
            generation,
            result,
            ..
        } in results
        {
            match self.instances.get_mut(&path) {
                Some(instance) if instance.generation == generation => {
                    instance.last_fire_time = now;
                    instance.next_due_time += instance.interval;
                    self.due.push(DueEntry {
                        time: instance.next_due_time,
                        path: path.clone(),
                        generation,
                    });
                }
                _ => {
                    debug!(unit = %path, "process removed earlier this tick, discarding update");
                    continue;
                }
            }
            debug!(unit = %path, "process fired");
            match result {
                Ok(update) => self.commit(&path, &update),
                Err(err) => self.record_fault(&path, err.message),
            }
        }
        Ok(())
    }
}

fn is_live(instances: &IndexMap<Path, UnitInstance>, entry: &DueEntry) -> bool {
    instances.get(&entry.path).is_some_and(|i| {
        i.generation == entry.generation && !i.inert && i.kind() == UnitKind::Process
    })
}

fn read_inputs(tree: &StateTree, wiring: &Wiring) -> Result<State> {
    wiring
        .inputs
        .iter()
        .map(|(name, port)| Ok((name.clone(), read_port(tree, port)?)))
        .collect()
}

fn read_port(tree: &StateTree, port: &ResolvedPort) -> Result<Value> {
    match &port.binding {
        Binding::Path(path) => tree.get(path),
        Binding::Fields(fields) => {
            let mut map = IndexMap::with_capacity(fields.len());
            for (field, sub) in fields {
                map.insert(field.clone(), read_port(tree, sub)?);
            }
            Ok(Value::Map(map))
        }
    }
}

fn apply_port(
    tree: &mut StateTree,
    types: &TypeRegistry,
    unit: &Path,
    port: &ResolvedPort,
    delta: &Delta,
) -> Result<Applied> {
    let fields = match &port.binding {
        Binding::Path(path) => return tree.apply(path, delta, types),
        Binding::Fields(fields) => fields,
    };
    let children: IndexMap<String, Delta> = match delta {
        Delta::Merge(Value::Null) => return Ok(Applied::default()),
        Delta::Merge(Value::Map(entries)) => entries
            .iter()
            .map(|(k, v)| (k.clone(), Delta::Merge(v.clone())))
            .collect(),
        Delta::Branch(branch) if branch.structural.is_empty() => branch.children.clone(),
        _ => return Err(Error::mismatch(unit, &port.schema, "structural delta on a tree of wires")),
    };
    let mut applied = Applied::default();
    for (field, sub_delta) in &children {
        let sub = fields
            .get(field)
            .ok_or_else(|| Error::mismatch(unit, &port.schema, format!("unknown field `{field}`")))?;
        applied.absorb(apply_port(tree, types, unit, sub, sub_delta)?);
    }
    Ok(applied)
}
