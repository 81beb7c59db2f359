//! Listener registration and dispatch.
//!
//! Dispatch runs capture listeners from the root down to the target, then
//! bubble listeners from the target up. The document is never borrowed while a
//! listener runs, so listeners may mutate the tree or trigger further events.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use serde_json::{json, Value};
use tracing::debug;

use super::{Dom, NodeId, Selector};

pub type EventCallback = Rc<dyn Fn(&Event)>;

#[derive(Clone)]
pub enum ListenerAction {
    Callback(EventCallback),
    /// Re-dispatch as a custom event carrying `{type, detail}` of the original.
    Delegate(String),
    ToggleClass { selector: Option<Selector>, class: String },
    ToggleAttribute { selector: Option<Selector>, attribute: String },
}

impl fmt::Debug for ListenerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerAction::Callback(_) => f.write_str("Callback"),
            ListenerAction::Delegate(name) => f.debug_tuple("Delegate").field(name).finish(),
            ListenerAction::ToggleClass { selector, class } => f
                .debug_struct("ToggleClass")
                .field("selector", selector)
                .field("class", class)
                .finish(),
            ListenerAction::ToggleAttribute { selector, attribute } => f
                .debug_struct("ToggleAttribute")
                .field("selector", selector)
                .field("attribute", attribute)
                .finish(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerOptions {
    pub capture: bool,
    pub passive: bool,
    pub once: bool,
}

#[derive(Debug, Clone)]
pub struct Listener {
    pub event: String,
    pub action: ListenerAction,
    pub options: ListenerOptions,
}

impl Listener {
    pub fn new(event: impl Into<String>, action: ListenerAction) -> Self {
        Self {
            event: event.into(),
            action,
            options: ListenerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ListenerOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug)]
pub struct Event {
    pub name: String,
    pub target: NodeId,
    pub detail: Value,
    pub cancelable: bool,
    current: Cell<NodeId>,
    passive: Cell<bool>,
    default_prevented: Cell<bool>,
    propagation_stopped: Cell<bool>,
}

impl Event {
    pub fn current_target(&self) -> NodeId {
        self.current.get()
    }

    /// Ignored for passive listeners and non-cancelable events.
    pub fn prevent_default(&self) {
        if self.cancelable && !self.passive.get() {
            self.default_prevented.set(true);
        }
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented.get()
    }

    pub fn stop_propagation(&self) {
        self.propagation_stopped.set(true);
    }
}

impl Dom {
    /// Dispatch `name` at `target`. Returns false if a listener prevented the default.
    pub fn trigger(&self, target: NodeId, name: &str, detail: Value, cancelable: bool) -> bool {
        let path: Vec<NodeId> = {
            let doc = self.borrow();
            let mut path: Vec<NodeId> = doc.ancestors(target).collect();
            path.reverse();
            path
        };
        let event = Event {
            name: name.to_string(),
            target,
            detail,
            cancelable,
            current: Cell::new(target),
            passive: Cell::new(false),
            default_prevented: Cell::new(false),
            propagation_stopped: Cell::new(false),
        };
        debug!(event = name, target = ?target, "dispatching event");

        let capture = path.iter().map(|n| (*n, true)).chain([(target, true), (target, false)]);
        let bubble = path.iter().rev().map(|n| (*n, false));
        for (node, capture_phase) in capture.chain(bubble) {
            if event.propagation_stopped.get() {
                break;
            }
            self.invoke(node, capture_phase, &event);
        }

        !event.default_prevented()
    }

    fn invoke(&self, node: NodeId, capture: bool, event: &Event) {
        let listeners = self.borrow().listeners_for(node, &event.name, capture);
        event.current.set(node);
        for (key, listener) in listeners {
            if listener.options.once {
                self.borrow_mut().remove_listener(node, key);
            }
            event.passive.set(listener.options.passive);
            self.run_action(&listener.action, event);
        }
        event.passive.set(false);
    }

    fn run_action(&self, action: &ListenerAction, event: &Event) {
        let current = event.current_target();
        match action {
            ListenerAction::Callback(callback) => callback(event),
            ListenerAction::Delegate(name) if *name == event.name => {
                debug!(event = %name, "delegate to the same event ignored");
            }
            ListenerAction::Delegate(name) => {
                let detail = json!({ "type": event.name, "detail": event.detail });
                self.trigger(current, name, detail, true);
            }
            ListenerAction::ToggleClass { selector, class } => {
                let mut doc = self.borrow_mut();
                let node = match selector {
                    Some(selector) => doc.closest(current, selector),
                    None => Some(current),
                };
                if let Some(node) = node {
                    doc.toggle_class(node, class);
                }
            }
            ListenerAction::ToggleAttribute { selector, attribute } => {
                let mut doc = self.borrow_mut();
                let node = match selector {
                    Some(selector) => doc.closest(current, selector),
                    None => Some(current),
                };
                if let Some(node) = node {
                    doc.toggle_attr(node, attribute);
                }
            }
        }
    }
}
