//! Render contexts
//!
//! A [`RenderContext`] is the state of one subtree render. Contexts are owned
//! by the future rendering them; the renderer's [`ContextTree`] keeps the
//! parent/child links, completion signals and finish queues, indexed by
//! [`ContextKey`], so a parent is referenced without being owned.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::rc::Rc;
use std::str::FromStr;

use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::directive::PREFIX;
use crate::dom::{Dom, NodeId};
use crate::error::RenderError;
use crate::renderer::{FinishHandler, FinishedEvent, Renderer};
use crate::scope::Resolver;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsertMode {
    #[default]
    Replace,
    Append,
    Prepend,
}

impl FromStr for InsertMode {
    type Err = RenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(InsertMode::Replace),
            "append" => Ok(InsertMode::Append),
            "prepend" => Ok(InsertMode::Prepend),
            other => Err(RenderError::UnknownMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextKey(usize);

/// Single-assignment completion signal carrying the completion sequence.
#[derive(Debug, Clone)]
pub struct Completion(Rc<watch::Sender<Option<u64>>>);

impl Completion {
    fn new() -> Self {
        Self(Rc::new(watch::Sender::new(None)))
    }

    fn complete(&self, sequence: u64) {
        self.0.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(sequence);
            true
        });
    }

    pub fn is_ready(&self) -> bool {
        self.0.borrow().is_some()
    }

    pub fn sequence(&self) -> Option<u64> {
        *self.0.borrow()
    }

    pub async fn wait(&self) -> u64 {
        let mut receiver = self.0.subscribe();
        let sequence = match receiver.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or_default(),
            // The sender lives in `self`, so the channel cannot close here.
            Err(_) => 0,
        };
        sequence
    }
}

/// A finish callback queued on the root context.
pub(crate) struct FinishJob {
    pub handler: FinishHandler,
    pub event: FinishedEvent,
    pub asynchronous: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    pub id: String,
    pub parent: Option<String>,
    pub depth: usize,
    pub sequence: u64,
}

struct Slot {
    id: String,
    parent: Option<ContextKey>,
    depth: usize,
    children: BTreeSet<ContextKey>,
    completion: Completion,
    finish_queue: Vec<FinishJob>,
}

/// Live contexts only: a slot is released once its context is ready, except
/// a root, which is released when its finish queue is taken. Keys are never
/// reused, and a key without a slot reads as ready.
pub struct ContextTree {
    slots: HashMap<ContextKey, Slot>,
    next: usize,
    sequence: u64,
    journal: VecDeque<JournalEntry>,
    journal_limit: usize,
}

impl Default for ContextTree {
    fn default() -> Self {
        Self::with_journal_limit(256)
    }
}

impl ContextTree {
    pub fn with_journal_limit(journal_limit: usize) -> Self {
        Self {
            slots: HashMap::new(),
            next: 0,
            sequence: 0,
            journal: VecDeque::new(),
            journal_limit,
        }
    }

    pub(crate) fn insert(&mut self, parent: Option<ContextKey>, id: String) -> ContextKey {
        let key = ContextKey(self.next);
        self.next += 1;
        let parent_slot = parent.and_then(|p| self.slots.get_mut(&p));
        let depth = parent_slot.as_ref().map_or(0, |slot| slot.depth + 1);
        if let Some(slot) = parent_slot {
            slot.children.insert(key);
        }
        self.slots.insert(
            key,
            Slot {
                id,
                parent,
                depth,
                children: BTreeSet::new(),
                completion: Completion::new(),
                finish_queue: Vec::new(),
            },
        );
        key
    }

    pub fn is_ready(&self, key: ContextKey) -> bool {
        self.slots.get(&key).map_or(true, |slot| slot.completion.is_ready())
    }

    /// Number of contexts not yet released.
    pub fn live(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn pending_children(&self, key: ContextKey) -> Vec<Completion> {
        let Some(slot) = self.slots.get(&key) else { return Vec::new() };
        slot.children
            .iter()
            .filter_map(|child| self.slots.get(child))
            .map(|child| child.completion.clone())
            .collect()
    }

    /// Complete `key` and detach it from its parent.
    pub(crate) fn mark_ready(&mut self, key: ContextKey) -> u64 {
        self.sequence += 1;
        let sequence = self.sequence;
        let Some(slot) = self.slots.get(&key) else { return sequence };
        slot.completion.complete(sequence);
        let is_root = slot.parent.is_none();
        let entry = JournalEntry {
            id: slot.id.clone(),
            parent: slot.parent.and_then(|p| self.slots.get(&p)).map(|p| p.id.clone()),
            depth: slot.depth,
            sequence,
        };
        debug!(context = %entry.id, sequence, "context ready");
        self.record(entry);

        self.detach(key);
        if !is_root {
            self.slots.remove(&key);
        }
        sequence
    }

    /// Release a context that failed before becoming ready. Anything waiting
    /// on it is woken so the failure cannot stall its parent.
    pub(crate) fn abandon(&mut self, key: ContextKey) {
        self.sequence += 1;
        if let Some(slot) = self.slots.get(&key) {
            slot.completion.complete(self.sequence);
            debug!(context = %slot.id, "context abandoned");
        }
        self.detach(key);
        self.slots.remove(&key);
    }

    fn detach(&mut self, key: ContextKey) {
        let Some(parent) = self.slots.get(&key).and_then(|slot| slot.parent) else { return };
        let detached = self
            .slots
            .get_mut(&parent)
            .is_some_and(|parent| parent.children.remove(&key));
        if !detached {
            debug!(context = ?key, "parent no longer tracks context");
        }
    }

    fn record(&mut self, entry: JournalEntry) {
        if self.journal_limit == 0 {
            return;
        }
        while self.journal.len() >= self.journal_limit {
            self.journal.pop_front();
        }
        self.journal.push_back(entry);
    }

    pub(crate) fn push_finish(&mut self, root: ContextKey, job: FinishJob) {
        if let Some(slot) = self.slots.get_mut(&root) {
            slot.finish_queue.push(job);
        }
    }

    /// Take the root's finish queue and release the root.
    pub(crate) fn take_finish(&mut self, root: ContextKey) -> Vec<FinishJob> {
        self.slots.remove(&root).map(|slot| slot.finish_queue).unwrap_or_default()
    }

    /// The most recent completions, oldest first.
    pub fn journal(&self) -> impl Iterator<Item = &JournalEntry> {
        self.journal.iter()
    }
}

/// State of one subtree render.
pub struct RenderContext {
    key: ContextKey,
    root_key: ContextKey,
    id: String,
    depth: usize,
    renderer: Renderer,
    spawned: usize,
    ignored: HashSet<String>,
    deferred: bool,

    /// Outermost container of the render this context belongs to.
    pub root: NodeId,
    pub template: Vec<NodeId>,
    /// Template children still to render; directives may drop entries.
    pub template_children: Vec<NodeId>,
    pub container: Option<NodeId>,
    pub target: Option<NodeId>,
    pub mode: InsertMode,
    pub resolver: Resolver,
    pub content: Vec<NodeId>,
    /// No further directives run.
    pub stop: bool,
    /// Template children are not rendered.
    pub ignore: bool,
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("id", &self.id)
            .field("template", &self.template)
            .field("content", &self.content)
            .field("mode", &self.mode)
            .field("stop", &self.stop)
            .field("ignore", &self.ignore)
            .finish()
    }
}

impl RenderContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_root(
        renderer: Renderer,
        id: impl Into<String>,
        template: Vec<NodeId>,
        resolver: Resolver,
        root: NodeId,
        container: Option<NodeId>,
        target: Option<NodeId>,
        mode: InsertMode,
    ) -> Self {
        let id = id.into();
        let key = renderer.tree_mut().insert(None, id.clone());
        let template_children = children_of(&renderer.dom(), &template);
        Self {
            key,
            root_key: key,
            id,
            depth: 0,
            renderer,
            spawned: 0,
            ignored: HashSet::new(),
            deferred: false,
            root,
            template,
            template_children,
            container,
            target,
            mode,
            resolver,
            content: Vec::new(),
            stop: false,
            ignore: false,
        }
    }

    /// Register a child context rendering `template` under `resolver`.
    /// It appends into no container until one is assigned.
    pub fn child(&mut self, template: Vec<NodeId>, resolver: Resolver) -> RenderContext {
        let id = format!("{}:{}", self.id, self.spawned);
        self.spawned += 1;
        let key = self.renderer.tree_mut().insert(Some(self.key), id.clone());
        let template_children = children_of(&self.renderer.dom(), &template);
        RenderContext {
            key,
            root_key: self.root_key,
            id,
            depth: self.depth + 1,
            renderer: self.renderer.clone(),
            spawned: 0,
            ignored: HashSet::new(),
            deferred: false,
            root: self.root,
            template,
            template_children,
            container: None,
            target: None,
            mode: InsertMode::Append,
            resolver,
            content: Vec::new(),
            stop: false,
            ignore: false,
        }
    }

    pub fn key(&self) -> ContextKey {
        self.key
    }

    pub fn root_key(&self) -> ContextKey {
        self.root_key
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_root(&self) -> bool {
        self.key == self.root_key
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn dom(&self) -> Dom {
        self.renderer.dom()
    }

    pub fn is_deferred(&self) -> bool {
        self.deferred
    }

    pub(crate) fn set_deferred(&mut self) {
        self.deferred = true;
    }

    /// The single template node, if this context renders one.
    pub fn template_node(&self) -> Option<NodeId> {
        match self.template.as_slice() {
            [node] => Some(*node),
            _ => None,
        }
    }

    /// The output element built for the template node.
    pub fn element(&self) -> Option<NodeId> {
        let dom = self.dom();
        let doc = dom.borrow();
        self.content.iter().copied().find(|id| doc.is_element(*id))
    }

    /// Attribute of the template node.
    pub fn attribute(&self, name: &str) -> Option<String> {
        let node = self.template_node()?;
        self.dom().borrow().attr(node, name).map(str::to_string)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.template_node()
            .is_some_and(|node| self.dom().borrow().has_attr(node, name))
    }

    /// `jstl-<name>` attribute of the template node.
    pub fn directive_attribute(&self, name: &str) -> Option<String> {
        self.attribute(&format!("{PREFIX}{name}"))
    }

    /// Stop the pipeline and skip the template children.
    pub fn terminate(&mut self) {
        self.stop = true;
        self.ignore = true;
    }

    pub fn ignore_directive(&mut self, name: &str) {
        self.ignored.insert(name.to_string());
    }

    pub fn is_directive_ignored(&self, name: &str) -> bool {
        self.ignored.contains(name)
    }

    pub fn is_ready(&self) -> bool {
        self.renderer.tree().is_ready(self.key)
    }
}

fn children_of(dom: &Dom, template: &[NodeId]) -> Vec<NodeId> {
    match template {
        [node] => dom.borrow().children(*node).to_vec(),
        _ => Vec::new(),
    }
}
