//! Content tree
//!
//! An arena document: nodes are addressed by [`NodeId`] and never freed, a
//! removed node is only detached. [`Dom`] is the shared single-threaded handle
//! the renderer and event dispatch work through.

mod events;
mod selector;

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

pub use events::{Event, EventCallback, Listener, ListenerAction, ListenerOptions};
pub use selector::Selector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element { tag: String, attrs: Vec<(String, String)> },
    Text(String),
    Comment(String),
    /// Inserting a fragment moves its children instead.
    Fragment,
}

#[derive(Debug, Clone)]
struct Node {
    kind: NodeKind,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "track", "wbr",
];

#[derive(Default)]
pub struct Document {
    nodes: Vec<Node>,
    listeners: HashMap<NodeId, Vec<(u64, Listener)>>,
    next_listener: u64,
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document")
            .field("nodes", &self.nodes.len())
            .field("listeners", &self.listeners.values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(Node { kind, parent: None, children: Vec::new() });
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_element(&mut self, tag: &str) -> NodeId {
        self.push(NodeKind::Element { tag: tag.to_ascii_lowercase(), attrs: Vec::new() })
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeKind::Text(text.into()))
    }

    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeKind::Comment(text.into()))
    }

    pub fn create_fragment(&mut self) -> NodeId {
        self.push(NodeKind::Fragment)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.0 < self.nodes.len()
    }

    pub fn kind(&self, id: NodeId) -> &NodeKind {
        &self.nodes[id.0].kind
    }

    pub fn tag(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id.0].kind {
            NodeKind::Element { tag, .. } => Some(tag),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.tag(id).is_some()
    }

    /// Character data of a text or comment node.
    pub fn text(&self, id: NodeId) -> Option<&str> {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) | NodeKind::Comment(text) => Some(text),
            _ => None,
        }
    }

    pub fn set_text(&mut self, id: NodeId, value: impl Into<String>) {
        match &mut self.nodes[id.0].kind {
            NodeKind::Text(text) | NodeKind::Comment(text) => *text = value.into(),
            _ => {
                self.empty(id);
                let text = self.create_text(value);
                self.append(id, text);
            }
        }
    }

    pub fn text_content(&self, id: NodeId) -> String {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) => text.clone(),
            NodeKind::Comment(_) => String::new(),
            _ => self.nodes[id.0].children.iter().map(|c| self.text_content(*c)).collect(),
        }
    }

    // --- Attributes ---

    pub fn attrs(&self, id: NodeId) -> &[(String, String)] {
        match &self.nodes[id.0].kind {
            NodeKind::Element { attrs, .. } => attrs,
            _ => &[],
        }
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.attrs(id)
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attr(&self, id: NodeId, name: &str) -> bool {
        self.attr(id, name).is_some()
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id.0].kind {
            let value = value.into();
            match attrs.iter_mut().find(|(key, _)| key == name) {
                Some(slot) => slot.1 = value,
                None => attrs.push((name.to_string(), value)),
            }
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> bool {
        if let NodeKind::Element { attrs, .. } = &mut self.nodes[id.0].kind {
            let before = attrs.len();
            attrs.retain(|(key, _)| key != name);
            return attrs.len() != before;
        }
        false
    }

    pub fn has_class(&self, id: NodeId, class: &str) -> bool {
        self.attr(id, "class")
            .is_some_and(|classes| classes.split_whitespace().any(|c| c == class))
    }

    /// Toggle a class, returning whether it is now present.
    pub fn toggle_class(&mut self, id: NodeId, class: &str) -> bool {
        let current = self.attr(id, "class").unwrap_or_default().to_string();
        let mut classes: Vec<&str> = current.split_whitespace().collect();
        let present = if classes.contains(&class) {
            classes.retain(|c| *c != class);
            false
        } else {
            classes.push(class);
            true
        };
        if classes.is_empty() {
            self.remove_attr(id, "class");
        } else {
            self.set_attr(id, "class", classes.join(" "));
        }
        present
    }

    /// Toggle a boolean attribute, returning whether it is now present.
    pub fn toggle_attr(&mut self, id: NodeId, name: &str) -> bool {
        if self.remove_attr(id, name) {
            false
        } else {
            self.set_attr(id, name, "");
            true
        }
    }

    // --- Structure ---

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn ancestors(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(self.parent(id), move |n| self.parent(*n))
    }

    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|c| *c != id);
        }
    }

    /// Nodes that inserting `id` actually places: a fragment yields its children.
    fn expand(&mut self, id: NodeId) -> Vec<NodeId> {
        if self.nodes[id.0].kind == NodeKind::Fragment {
            let children = std::mem::take(&mut self.nodes[id.0].children);
            for child in &children {
                self.nodes[child.0].parent = None;
            }
            children
        } else {
            self.detach(id);
            vec![id]
        }
    }

    fn insert_at(&mut self, parent: NodeId, index: usize, id: NodeId) -> usize {
        let nodes = self.expand(id);
        let count = nodes.len();
        let index = index.min(self.nodes[parent.0].children.len());
        for (offset, node) in nodes.into_iter().enumerate() {
            self.nodes[node.0].parent = Some(parent);
            self.nodes[parent.0].children.insert(index + offset, node);
        }
        count
    }

    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        let end = self.nodes[parent.0].children.len();
        self.insert_at(parent, end, child);
    }

    pub fn prepend(&mut self, parent: NodeId, child: NodeId) {
        self.insert_at(parent, 0, child);
    }

    fn position(&self, id: NodeId) -> Option<(NodeId, usize)> {
        let parent = self.parent(id)?;
        let index = self.nodes[parent.0].children.iter().position(|c| *c == id)?;
        Some((parent, index))
    }

    /// Insert before `anchor`; a detached anchor leaves `node` untouched.
    pub fn insert_before(&mut self, anchor: NodeId, node: NodeId) -> bool {
        if anchor == node {
            return false;
        }
        self.detach(node);
        let Some((parent, index)) = self.position(anchor) else { return false };
        self.insert_at(parent, index, node);
        true
    }

    pub fn insert_after(&mut self, anchor: NodeId, node: NodeId) -> bool {
        if anchor == node {
            return false;
        }
        self.detach(node);
        let Some((parent, index)) = self.position(anchor) else { return false };
        self.insert_at(parent, index + 1, node);
        true
    }

    /// Substitute `old` with `replacements`, in order.
    pub fn replace(&mut self, old: NodeId, replacements: &[NodeId]) -> bool {
        let Some((parent, mut index)) = self.position(old) else { return false };
        self.detach(old);
        for node in replacements {
            if *node == old {
                continue;
            }
            self.detach(*node);
            index += self.insert_at(parent, index, *node);
        }
        true
    }

    pub fn empty(&mut self, id: NodeId) {
        let children = std::mem::take(&mut self.nodes[id.0].children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
    }

    /// Copy of `id` without children.
    pub fn shallow_clone(&mut self, id: NodeId) -> NodeId {
        let kind = self.nodes[id.0].kind.clone();
        self.push(kind)
    }

    pub fn deep_clone(&mut self, id: NodeId) -> NodeId {
        let copy = self.shallow_clone(id);
        let children = self.nodes[id.0].children.clone();
        for child in children {
            let child_copy = self.deep_clone(child);
            self.nodes[child_copy.0].parent = Some(copy);
            self.nodes[copy.0].children.push(child_copy);
        }
        copy
    }

    /// Deep copy of a node living in another document.
    pub fn import(&mut self, other: &Document, id: NodeId) -> NodeId {
        let copy = self.push(other.kind(id).clone());
        for child in other.children(id) {
            let child_copy = self.import(other, *child);
            self.nodes[child_copy.0].parent = Some(copy);
            self.nodes[copy.0].children.push(child_copy);
        }
        copy
    }

    // --- Query ---

    fn descendants(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(root).iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        out
    }

    pub fn query(&self, root: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(root).into_iter().find(|id| selector.matches(self, *id))
    }

    pub fn query_all(&self, root: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(root)
            .into_iter()
            .filter(|id| selector.matches(self, *id))
            .collect()
    }

    /// Nearest of `id` and its ancestors matching `selector`.
    pub fn closest(&self, id: NodeId, selector: &Selector) -> Option<NodeId> {
        std::iter::once(id)
            .chain(self.ancestors(id))
            .find(|n| selector.matches(self, *n))
    }

    // --- Listeners ---

    pub fn on(&mut self, id: NodeId, listener: Listener) -> u64 {
        self.next_listener += 1;
        let key = self.next_listener;
        self.listeners.entry(id).or_default().push((key, listener));
        key
    }

    pub fn listener_count(&self, id: NodeId) -> usize {
        self.listeners.get(&id).map_or(0, Vec::len)
    }

    fn listeners_for(&self, id: NodeId, event: &str, capture: bool) -> Vec<(u64, Listener)> {
        self.listeners
            .get(&id)
            .map(|all| {
                all.iter()
                    .filter(|(_, l)| l.event == event && l.options.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_listener(&mut self, id: NodeId, key: u64) {
        if let Some(all) = self.listeners.get_mut(&id) {
            all.retain(|(k, _)| *k != key);
        }
    }

    // --- Serialization ---

    pub fn outer_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_html(id, &mut out);
        out
    }

    pub fn inner_html(&self, id: NodeId) -> String {
        let mut out = String::new();
        for child in self.children(id) {
            self.write_html(*child, &mut out);
        }
        out
    }

    fn write_html(&self, id: NodeId, out: &mut String) {
        match &self.nodes[id.0].kind {
            NodeKind::Text(text) => out.push_str(&escape(text, false)),
            NodeKind::Comment(text) => {
                out.push_str("<!--");
                out.push_str(text);
                out.push_str("-->");
            }
            NodeKind::Fragment => {
                for child in self.children(id) {
                    self.write_html(*child, out);
                }
            }
            NodeKind::Element { tag, attrs } => {
                out.push('<');
                out.push_str(tag);
                for (name, value) in attrs {
                    out.push(' ');
                    out.push_str(name);
                    out.push_str("=\"");
                    out.push_str(&escape(value, true));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&tag.as_str()) {
                    return;
                }
                for child in self.children(id) {
                    self.write_html(*child, out);
                }
                out.push_str("</");
                out.push_str(tag);
                out.push('>');
            }
        }
    }
}

fn escape(text: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}

/// Shared handle to a [`Document`].
#[derive(Clone, Default)]
pub struct Dom(Rc<RefCell<Document>>);

impl fmt::Debug for Dom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dom").field(&self.0.borrow()).finish()
    }
}

impl Dom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn borrow(&self) -> Ref<'_, Document> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, Document> {
        self.0.borrow_mut()
    }

    pub fn on(&self, id: NodeId, listener: Listener) -> u64 {
        self.0.borrow_mut().on(id, listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn list(doc: &mut Document) -> (NodeId, NodeId, NodeId) {
        let ul = doc.create_element("ul");
        let a = doc.create_element("li");
        let b = doc.create_element("li");
        doc.append(ul, a);
        doc.append(ul, b);
        (ul, a, b)
    }

    #[test]
    fn test_mutation_order() {
        let mut doc = Document::new();
        let (ul, a, b) = list(&mut doc);
        let c = doc.create_element("li");
        doc.insert_before(b, c);
        assert_eq!(doc.children(ul), &[a, c, b]);
        let d = doc.create_element("li");
        doc.prepend(ul, d);
        assert_eq!(doc.children(ul), &[d, a, c, b]);
        doc.detach(c);
        assert_eq!(doc.parent(c), None);
        assert_eq!(doc.children(ul), &[d, a, b]);
    }

    #[test]
    fn test_fragment_insertion_moves_children() {
        let mut doc = Document::new();
        let (ul, a, _) = list(&mut doc);
        let fragment = doc.create_fragment();
        let x = doc.create_text("x");
        let y = doc.create_text("y");
        doc.append(fragment, x);
        doc.append(fragment, y);
        doc.insert_after(a, fragment);
        assert_eq!(doc.children(fragment), &[] as &[NodeId]);
        assert_eq!(doc.text_content(ul), "xy");
        assert_eq!(doc.parent(x), Some(ul));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut doc = Document::new();
        let (ul, a, b) = list(&mut doc);
        let x = doc.create_text("x");
        let y = doc.create_text("y");
        assert!(doc.replace(a, &[x, y]));
        assert_eq!(doc.children(ul), &[x, y, b]);
    }

    #[test]
    fn test_serialization_escapes() {
        let mut doc = Document::new();
        let div = doc.create_element("DIV");
        doc.set_attr(div, "title", "a \"quoted\" & <b>");
        let text = doc.create_text("1 < 2 & 3");
        doc.append(div, text);
        let br = doc.create_element("br");
        doc.append(div, br);
        assert_eq!(
            doc.outer_html(div),
            r#"<div title="a &quot;quoted&quot; &amp; <b>">1 &lt; 2 &amp; 3<br></div>"#
        );
    }

    #[test]
    fn test_classes() {
        let mut doc = Document::new();
        let div = doc.create_element("div");
        doc.set_attr(div, "class", "a b");
        assert!(!doc.toggle_class(div, "a"));
        assert_eq!(doc.attr(div, "class"), Some("b"));
        assert!(doc.toggle_class(div, "c"));
        assert!(doc.has_class(div, "c"));
    }

    #[test]
    fn test_deep_clone_is_independent() {
        let mut doc = Document::new();
        let (ul, a, _) = list(&mut doc);
        doc.set_attr(a, "id", "first");
        let copy = doc.deep_clone(ul);
        let copied_first = doc.children(copy)[0];
        doc.set_attr(copied_first, "id", "changed");
        assert_eq!(doc.attr(a, "id"), Some("first"));
        assert_eq!(doc.parent(copy), None);
    }

    #[test]
    fn test_query_and_closest() {
        let mut doc = Document::new();
        let (ul, a, b) = list(&mut doc);
        doc.set_attr(ul, "class", "menu");
        doc.set_attr(b, "data-x", "1");
        let selector = Selector::parse("li[data-x]").unwrap();
        assert_eq!(doc.query(ul, &selector), Some(b));
        assert_eq!(doc.query_all(ul, &Selector::parse("li").unwrap()), vec![a, b]);
        assert_eq!(doc.closest(a, &Selector::parse(".menu").unwrap()), Some(ul));
        assert_eq!(doc.closest(a, &Selector::parse("li").unwrap()), Some(a));
    }
}
