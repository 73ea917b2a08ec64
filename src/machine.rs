//! A machine instance: document + configuration + event queue + slot
//! table, with the microstep transition engine and the frame/pump-driven
//! event loop.

use crate::configuration::{Activation, Configuration};
use crate::document::{Document, NodeId, NodeKind};
use crate::error::EngineError;
use crate::pool::ScopedPool;
use crate::slots::{ActionFn, HandlerSet, SlotContext, SlotTable};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Machine lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unstarted,
    Running,
    /// A top-level final state was entered; every further call is a no-op.
    Terminated,
}

struct TimedEvent {
    deadline: f64,
    event: String,
}

/// Everything a single transition will do, computed before any handler
/// fires so independent parallel-region transitions can be checked for
/// overlap first.
struct TransitionPlan {
    source: NodeId,
    target: NodeId,
    exits: Vec<NodeId>,
    actions: Vec<String>,
    entries: Vec<NodeId>,
}

/// One named statechart instance.
///
/// Single-threaded, cooperative: no call suspends, every call runs to
/// completion before returning. Stepping or pumping a machine that is not
/// running is a no-op, never an error; only a second `start_engine` is
/// reported as misuse.
pub struct Machine {
    name: String,
    doc: Arc<Document>,
    config: Configuration,
    queue: VecDeque<String>,
    slots: SlotTable,
    lifecycle: Lifecycle,
    exit_on_destroy: bool,
    clock: f64,
    timers: Vec<TimedEvent>,
    pool: ScopedPool,
}

impl Machine {
    pub(crate) fn new(name: impl Into<String>, doc: Arc<Document>) -> Self {
        Self {
            name: name.into(),
            doc,
            config: Configuration::new(),
            queue: VecDeque::new(),
            slots: SlotTable::default(),
            lifecycle: Lifecycle::Unstarted,
            exit_on_destroy: false,
            clock: 0.0,
            timers: Vec::new(),
            pool: ScopedPool::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.doc
    }

    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    pub fn is_terminated(&self) -> bool {
        self.lifecycle == Lifecycle::Terminated
    }

    /// Simulated time accumulated through [`Machine::frame_move`].
    pub fn clock(&self) -> f64 {
        self.clock
    }

    pub fn queued_events(&self) -> usize {
        self.queue.len()
    }

    /// Active state uids in document order.
    pub fn active_states(&self) -> Vec<String> {
        self.config.active_uids(&self.doc)
    }

    /// Whether the state addressed by `id` is currently active. Bare
    /// non-unique ids must be qualified by parent path.
    pub fn in_state(&self, id: &str) -> Result<bool, EngineError> {
        let node = self.doc.resolve(id)?;
        Ok(self.config.is_active(node))
    }

    /// When set, destroying a running machine performs the full exit sweep
    /// over its active configuration.
    pub fn set_exit_state_on_destroy(&mut self, yes: bool) {
        self.exit_on_destroy = yes;
    }

    // =========================================================================
    // Handler binding
    // =========================================================================

    /// Binds a declarative batch of convention-named slots; see
    /// [`HandlerSet`]. Rebinding is legal at any time, including after
    /// start.
    pub fn register_handler(&mut self, set: HandlerSet) {
        self.slots.absorb(set);
    }

    /// Binds entry/exit slots for one state explicitly, overriding any
    /// earlier binding for that state.
    pub fn register_state_slot(
        &mut self,
        id: &str,
        onentry: Option<ActionFn>,
        onexit: Option<ActionFn>,
    ) -> Result<(), EngineError> {
        let node = self.doc.resolve(id)?;
        let uid = self.doc.node(node).uid.clone();
        if let Some(slot) = onentry {
            self.slots.bind_entry(uid.clone(), slot);
        }
        if let Some(slot) = onexit {
            self.slots.bind_exit(uid, slot);
        }
        Ok(())
    }

    /// Binds a named action slot, fired by transitions declaring it in
    /// `ontransit`.
    pub fn set_action_slot(
        &mut self,
        name: impl Into<String>,
        slot: impl FnMut(&mut SlotContext<'_>) + 'static,
    ) {
        self.slots.bind_action(name.into(), Box::new(slot));
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Activates the root and its default descendants, firing entry
    /// handlers top-down. Legal only once.
    pub fn start_engine(&mut self) -> Result<(), EngineError> {
        if self.lifecycle != Lifecycle::Unstarted {
            return Err(EngineError::AlreadyStarted {
                name: self.name.clone(),
            });
        }
        let doc = Arc::clone(&self.doc);
        self.lifecycle = Lifecycle::Running;
        self.config.activate(doc.root(), Activation::Exitable);

        let mut entries = Vec::new();
        push_defaults(&doc, doc.root(), &mut entries);
        self.fire_entries(&doc, &entries);

        if self.config.top_level_final_active(&doc) {
            self.terminate();
        }
        debug_assert_eq!(self.config.validate(&doc), Ok(()));
        tracing::info!(machine = %self.name, "engine started");
        Ok(())
    }

    /// Stops the engine, optionally sweeping exit handlers over the active
    /// configuration (deepest first; final states are never exited). The
    /// machine returns to unstarted and can be started again.
    pub fn shutdown_engine(&mut self, do_exit_state: bool) {
        if self.lifecycle == Lifecycle::Unstarted {
            return;
        }
        let doc = Arc::clone(&self.doc);
        if do_exit_state {
            let exits = self.config.exit_set(&doc, doc.root());
            self.fire_exits(&doc, &exits);
        }
        self.config.clear();
        self.queue.clear();
        self.timers.clear();
        self.lifecycle = Lifecycle::Unstarted;
        tracing::debug!(machine = %self.name, "engine shut down");
    }

    /// Shuts down with a full exit sweep, then starts again from the
    /// initial configuration.
    pub fn restart_engine(&mut self) -> Result<(), EngineError> {
        self.shutdown_engine(true);
        self.start_engine()
    }

    // =========================================================================
    // Event intake and draining
    // =========================================================================

    /// Appends an event to the queue. Legal in any lifecycle stage; before
    /// start the event just waits, after termination it is dropped.
    pub fn enqueue_event(&mut self, event: impl Into<String>) {
        if self.lifecycle == Lifecycle::Terminated {
            tracing::trace!(machine = %self.name, "machine terminated, event dropped");
            return;
        }
        self.queue.push_back(event.into());
    }

    /// Schedules `event` to be enqueued once the frame clock has advanced
    /// by `after` seconds.
    pub fn register_timed_event(&mut self, after: f64, event: impl Into<String>) {
        if self.lifecycle == Lifecycle::Terminated {
            return;
        }
        let timer = TimedEvent {
            deadline: self.clock + after,
            event: event.into(),
        };
        let at = self.timers.partition_point(|t| t.deadline <= timer.deadline);
        self.timers.insert(at, timer);
    }

    pub fn clear_timed_events(&mut self) {
        self.timers.clear();
    }

    /// Advances the simulated clock by `dt`, enqueues timed events that
    /// came due, and applies **at most one** pending event regardless of
    /// the magnitude of `dt`. No-op unless running.
    pub fn frame_move(&mut self, dt: f64) -> Result<(), EngineError> {
        if self.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        self.clock += dt;
        self.release_due_timers();
        if let Some(event) = self.queue.pop_front() {
            self.microstep(&event)?;
        }
        Ok(())
    }

    /// Drains the queue to empty, one microstep per event, including
    /// events enqueued by handlers while draining. No-op unless running.
    pub fn pump_events(&mut self) -> Result<(), EngineError> {
        if self.lifecycle != Lifecycle::Running {
            return Ok(());
        }
        while let Some(event) = self.queue.pop_front() {
            self.microstep(&event)?;
            if self.lifecycle == Lifecycle::Terminated {
                break;
            }
        }
        Ok(())
    }

    /// Releases transient objects parked by handlers via
    /// [`SlotContext::retain`].
    pub fn pump_pools(&mut self) {
        self.pool.pump_pools();
    }

    pub fn pending_pool_handles(&self) -> usize {
        self.pool.pending()
    }

    fn release_due_timers(&mut self) {
        while self
            .timers
            .first()
            .map_or(false, |t| t.deadline <= self.clock)
        {
            let timer = self.timers.remove(0);
            tracing::trace!(machine = %self.name, event = %timer.event, "timed event due");
            self.queue.push_back(timer.event);
        }
    }

    // =========================================================================
    // Microstep engine
    // =========================================================================

    fn microstep(&mut self, event: &str) -> Result<(), EngineError> {
        let doc = Arc::clone(&self.doc);

        let enabled = self.enabled_transitions(&doc, event);
        if enabled.is_empty() {
            tracing::trace!(machine = %self.name, event, "no enabled transition, event discarded");
            return Ok(());
        }

        let plans: Vec<TransitionPlan> = enabled
            .iter()
            .map(|&(source, ti)| self.plan_transition(&doc, source, ti))
            .collect();
        self.check_conflicts(&doc, event, &plans)?;

        for plan in &plans {
            if self.lifecycle == Lifecycle::Terminated {
                break;
            }
            tracing::debug!(
                machine = %self.name,
                event,
                source = %doc.node(plan.source).uid,
                target = %doc.node(plan.target).uid,
                "transition"
            );
            self.fire_exits(&doc, &plan.exits);
            self.fire_actions(&plan.actions);
            self.fire_entries(&doc, &plan.entries);
            if self.config.top_level_final_active(&doc) {
                self.terminate();
            }
        }

        debug_assert_eq!(self.config.validate(&doc), Ok(()));
        Ok(())
    }

    /// Collects the enabled transitions for `event`: per active leaf, the
    /// deepest declaration on the path to the root wins; identical hits
    /// reached from sibling parallel regions are deduplicated. The region
    /// containing an active final state no longer evaluates transitions.
    fn enabled_transitions(&self, doc: &Document, event: &str) -> Vec<(NodeId, usize)> {
        let mut found: Vec<(NodeId, usize)> = Vec::new();
        for leaf in self.config.active_leaves(doc) {
            let start = match doc.node(leaf).kind {
                NodeKind::Final => {
                    match doc.node(leaf).parent.and_then(|p| doc.node(p).parent) {
                        Some(grandparent) => grandparent,
                        None => continue,
                    }
                }
                _ => leaf,
            };
            let mut cur = Some(start);
            while let Some(n) = cur {
                if let Some(ti) = doc
                    .node(n)
                    .transitions
                    .iter()
                    .position(|t| t.event == event)
                {
                    if !found.contains(&(n, ti)) {
                        found.push((n, ti));
                    }
                    break;
                }
                cur = doc.node(n).parent;
            }
        }
        found.sort();
        found
    }

    fn plan_transition(&self, doc: &Document, source: NodeId, ti: usize) -> TransitionPlan {
        let tran = &doc.node(source).transitions[ti];
        let target = tran.target;

        // The subtree actually left is the active branch containing the
        // source under the LCA with the target; for self- and
        // ancestor-targets the target subtree is re-entered.
        let lca = doc.lca(source, target);
        let exit_top = if lca == target {
            target
        } else if lca == source {
            source
        } else {
            doc.child_toward(lca, source)
        };
        let exits = self.config.exit_set(doc, exit_top);
        let exiting: HashSet<NodeId> = exits.iter().copied().collect();

        // Entry chain: from below the nearest ancestor of the target that
        // survives the exits, down to the target, shallowest first.
        let mut chain = vec![target];
        let mut cur = doc.node(target).parent;
        while let Some(a) = cur {
            if self.config.is_active(a) && !exiting.contains(&a) {
                break;
            }
            chain.push(a);
            cur = doc.node(a).parent;
        }
        chain.reverse();

        let mut entries = Vec::new();
        push_entry_chain(doc, &chain, &mut entries);

        TransitionPlan {
            source,
            target,
            exits,
            actions: tran.actions.clone(),
            entries,
        }
    }

    fn check_conflicts(
        &self,
        doc: &Document,
        event: &str,
        plans: &[TransitionPlan],
    ) -> Result<(), EngineError> {
        for i in 0..plans.len() {
            for j in i + 1..plans.len() {
                let a = &plans[i];
                let b = &plans[j];
                let touched: HashSet<NodeId> =
                    a.exits.iter().chain(a.entries.iter()).copied().collect();
                if b.exits
                    .iter()
                    .chain(b.entries.iter())
                    .any(|n| touched.contains(n))
                {
                    return Err(EngineError::ConflictingTransition {
                        event: event.to_string(),
                        first: doc.node(a.source).uid.clone(),
                        second: doc.node(b.source).uid.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Removes `exits` from the configuration deepest-first, firing exit
    /// slots. Terminal entries are removed without any handler call; this
    /// match is the only exit dispatch in the engine, so an exit handler
    /// on a final state cannot be reached from any code path.
    fn fire_exits(&mut self, doc: &Document, exits: &[NodeId]) {
        let Machine {
            config,
            slots,
            queue,
            pool,
            clock,
            ..
        } = self;
        let mut ctx = SlotContext {
            queue,
            pool,
            clock: *clock,
        };
        for &n in exits {
            match config.deactivate(n) {
                Some(Activation::Exitable) => slots.fire_exit(&doc.node(n).uid, &mut ctx),
                Some(Activation::Terminal) | None => {}
            }
        }
    }

    fn fire_actions(&mut self, actions: &[String]) {
        let Machine {
            slots,
            queue,
            pool,
            clock,
            ..
        } = self;
        let mut ctx = SlotContext {
            queue,
            pool,
            clock: *clock,
        };
        for name in actions {
            slots.fire_action(name, &mut ctx);
        }
    }

    /// Adds `entries` to the configuration shallowest-first, firing entry
    /// slots top-down.
    fn fire_entries(&mut self, doc: &Document, entries: &[NodeId]) {
        let Machine {
            config,
            slots,
            queue,
            pool,
            clock,
            ..
        } = self;
        let mut ctx = SlotContext {
            queue,
            pool,
            clock: *clock,
        };
        for &n in entries {
            let node = doc.node(n);
            let activation = if node.kind == NodeKind::Final {
                Activation::Terminal
            } else {
                Activation::Exitable
            };
            config.activate(n, activation);
            slots.fire_entry(&node.uid, &mut ctx);
        }
    }

    fn terminate(&mut self) {
        self.lifecycle = Lifecycle::Terminated;
        self.queue.clear();
        self.timers.clear();
        tracing::info!(machine = %self.name, "top-level final state reached, machine terminated");
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.exit_on_destroy && self.lifecycle == Lifecycle::Running {
            self.shutdown_engine(true);
        }
    }
}

// Bound slot callbacks have no useful representation; show the runtime
// state around them.
impl fmt::Debug for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("lifecycle", &self.lifecycle)
            .field("active", &self.config.len())
            .field("queued", &self.queue.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Enters `chain` (shallowest node first, the transition target last) plus
/// the defaults hanging off it, pre-order in document order. At a parallel
/// chain node the chain picks one region; sibling regions enter their
/// default states at their document-order position, not after the chain.
fn push_entry_chain(doc: &Document, chain: &[NodeId], out: &mut Vec<NodeId>) {
    let node = chain[0];
    out.push(node);
    match chain.get(1) {
        None => push_defaults(doc, node, out),
        Some(&next) => match doc.node(node).kind {
            NodeKind::Parallel => {
                for &region in &doc.node(node).children {
                    if region == next {
                        push_entry_chain(doc, &chain[1..], out);
                    } else {
                        out.push(region);
                        push_defaults(doc, region, out);
                    }
                }
            }
            _ => push_entry_chain(doc, &chain[1..], out),
        },
    }
}

/// Default descendants of `node` per the activation rule: first declared
/// child for a compound state, every child for a parallel state.
fn push_defaults(doc: &Document, node: NodeId, out: &mut Vec<NodeId>) {
    match doc.node(node).kind {
        NodeKind::Compound => {
            let child = doc.node(node).children[0];
            out.push(child);
            push_defaults(doc, child, out);
        }
        NodeKind::Parallel => {
            for &child in &doc.node(node).children {
                out.push(child);
                push_defaults(doc, child, out);
            }
        }
        NodeKind::Atomic | NodeKind::Final => {}
    }
}
