//! Handler binding layer: entry/exit slots per state and named action
//! slots, independent of the document's lifetime.
//!
//! Two binding mechanisms compose. [`HandlerSet`] is the convention form: a
//! declarative batch of `(name, callback)` pairs scanned once, where names
//! shaped `onentry_<path>` / `onexit_<path>` bind to that state's slots and
//! everything else is ignored. [`crate::Machine::register_state_slot`] and
//! [`crate::Machine::set_action_slot`] bind individually. The latest
//! binding for a target always wins; firing an unbound slot is a silent
//! no-op.

use crate::pool::ScopedPool;
use std::collections::{HashMap, VecDeque};

const ONENTRY_PREFIX: &str = "onentry_";
const ONEXIT_PREFIX: &str = "onexit_";

/// Context handed to every slot invocation. Lets a handler enqueue
/// follow-up events on its own machine and park transient objects in the
/// machine's release pool.
pub struct SlotContext<'a> {
    pub(crate) queue: &'a mut VecDeque<String>,
    pub(crate) pool: &'a mut ScopedPool,
    pub(crate) clock: f64,
}

impl SlotContext<'_> {
    /// Appends an event to the owning machine's queue. It is consumed by a
    /// later microstep, never within the current one.
    pub fn enqueue_event(&mut self, event: impl Into<String>) {
        self.queue.push_back(event.into());
    }

    /// Parks a transient object in the machine's release pool until the
    /// next pool pump.
    pub fn retain<T: std::any::Any>(&mut self, value: T) {
        self.pool.retain(value);
    }

    /// Simulated time accumulated through `frame_move`.
    pub fn clock(&self) -> f64 {
        self.clock
    }
}

/// Boxed slot callback.
pub type ActionFn = Box<dyn FnMut(&mut SlotContext<'_>)>;

/// A declarative batch of convention-named slots for
/// [`crate::Machine::register_handler`].
#[derive(Default)]
pub struct HandlerSet {
    slots: Vec<(String, ActionFn)>,
}

impl HandlerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named slot. Names shaped `onentry_<path>` / `onexit_<path>`
    /// bind to the corresponding state; other names are ignored by the
    /// scan.
    pub fn on(
        mut self,
        name: impl Into<String>,
        callback: impl FnMut(&mut SlotContext<'_>) + 'static,
    ) -> Self {
        self.slots.push((name.into(), Box::new(callback)));
        self
    }
}

/// Slot storage for one machine.
#[derive(Default)]
pub(crate) struct SlotTable {
    entry: HashMap<String, ActionFn>,
    exit: HashMap<String, ActionFn>,
    actions: HashMap<String, ActionFn>,
}

impl SlotTable {
    pub(crate) fn bind_entry(&mut self, uid: impl Into<String>, slot: ActionFn) {
        self.entry.insert(uid.into(), slot);
    }

    pub(crate) fn bind_exit(&mut self, uid: impl Into<String>, slot: ActionFn) {
        self.exit.insert(uid.into(), slot);
    }

    pub(crate) fn bind_action(&mut self, name: impl Into<String>, slot: ActionFn) {
        self.actions.insert(name.into(), slot);
    }

    /// One-time scan over a declarative slot list: the convention-binding
    /// mechanism. Non-matching names are skipped.
    pub(crate) fn absorb(&mut self, set: HandlerSet) {
        for (name, slot) in set.slots {
            if let Some(uid) = name.strip_prefix(ONENTRY_PREFIX) {
                self.entry.insert(uid.to_string(), slot);
            } else if let Some(uid) = name.strip_prefix(ONEXIT_PREFIX) {
                self.exit.insert(uid.to_string(), slot);
            } else {
                tracing::debug!(name, "handler name matches no binding convention, ignored");
            }
        }
    }

    pub(crate) fn fire_entry(&mut self, uid: &str, ctx: &mut SlotContext<'_>) {
        match self.entry.get_mut(uid) {
            Some(slot) => slot(ctx),
            None => tracing::trace!(state = uid, "no onentry slot bound"),
        }
    }

    pub(crate) fn fire_exit(&mut self, uid: &str, ctx: &mut SlotContext<'_>) {
        match self.exit.get_mut(uid) {
            Some(slot) => slot(ctx),
            None => tracing::trace!(state = uid, "no onexit slot bound"),
        }
    }

    pub(crate) fn fire_action(&mut self, name: &str, ctx: &mut SlotContext<'_>) {
        match self.actions.get_mut(name) {
            Some(slot) => slot(ctx),
            None => tracing::trace!(action = name, "no action slot bound"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn fire_all(table: &mut SlotTable, uid: &str) {
        let mut queue = VecDeque::new();
        let mut pool = ScopedPool::new();
        let mut ctx = SlotContext {
            queue: &mut queue,
            pool: &mut pool,
            clock: 0.0,
        };
        table.fire_entry(uid, &mut ctx);
        table.fire_exit(uid, &mut ctx);
    }

    #[test]
    fn test_convention_scan_binds_prefixed_names_only() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());

        let set = HandlerSet::new()
            .on("onentry_move.on", move |_| l1.borrow_mut().push("entry"))
            .on("onexit_move.on", move |_| l2.borrow_mut().push("exit"))
            .on("helper_method", |_| panic!("must never bind"));

        let mut table = SlotTable::default();
        table.absorb(set);
        fire_all(&mut table, "move.on");

        assert_eq!(*log.borrow(), vec!["entry", "exit"]);
    }

    #[test]
    fn test_unbound_slot_is_silent_noop() {
        let mut table = SlotTable::default();
        fire_all(&mut table, "nowhere");
    }

    #[test]
    fn test_latest_binding_wins() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let (l1, l2) = (log.clone(), log.clone());

        let mut table = SlotTable::default();
        table.absorb(HandlerSet::new().on("onentry_a", move |_| l1.borrow_mut().push("old")));
        table.bind_entry("a", Box::new(move |_| l2.borrow_mut().push("new")));

        fire_all(&mut table, "a");
        assert_eq!(*log.borrow(), vec!["new"]);
    }

    #[test]
    fn test_context_enqueue_and_retain() {
        let mut queue = VecDeque::new();
        let mut pool = ScopedPool::new();
        {
            let mut ctx = SlotContext {
                queue: &mut queue,
                pool: &mut pool,
                clock: 1.5,
            };
            ctx.enqueue_event("ping");
            ctx.retain(String::from("transient"));
            assert_eq!(ctx.clock(), 1.5);
        }
        assert_eq!(queue.pop_front().as_deref(), Some("ping"));
        assert_eq!(pool.pending(), 1);
    }
}
