//! Template loading
//!
//! A [`TemplateSource`] owns a private parsed fragment; every [`TemplateSource::draw`]
//! imports an independent deep copy into the caller's document, so one cached
//! source can back any number of renders.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use scraper::{Html, Node};
use serde_json::Value;
use tracing::debug;

use crate::dom::{Document, Dom, NodeId};
use crate::error::RenderError;
use crate::hashing::markup_cache_key;

#[derive(Debug)]
pub struct TemplateSource {
    key: Option<String>,
    document: Document,
    roots: Vec<NodeId>,
}

impl TemplateSource {
    /// Parse an HTML fragment. Whitespace text between elements is kept.
    ///
    /// The markup is parsed as template contents, where any element is
    /// accepted in place, table parts included. Nested `<template>` contents
    /// become the element's children.
    pub fn parse(markup: &str) -> Self {
        let html = Html::parse_fragment(&format!("<template>{markup}</template>"));
        let mut document = Document::new();
        let mut roots = Vec::new();
        let contents = html
            .root_element()
            .children()
            .find(|node| node.value().as_element().is_some_and(|e| e.name() == "template"))
            .and_then(|wrapper| wrapper.first_child());
        let Some(contents) = contents else {
            return Self { key: None, document, roots };
        };
        let mut copied = HashMap::new();

        // Pre-order, so every parent is copied before its children.
        for node in contents.descendants().skip(1) {
            let parent = node.parent().map(|parent| parent.id());
            let attach = parent.and_then(|parent| copied.get(&parent).copied());
            let id = match node.value() {
                Node::Text(text) => document.create_text(&**text),
                Node::Comment(comment) => document.create_comment(&**comment),
                Node::Element(element) => {
                    let id = document.create_element(element.name());
                    for (name, value) in element.attrs() {
                        document.set_attr(id, name, value);
                    }
                    id
                }
                Node::Fragment => {
                    // Contents of a nested template element.
                    if let Some(element) = attach {
                        copied.insert(node.id(), element);
                    }
                    continue;
                }
                _ => continue,
            };
            match attach {
                Some(parent) => {
                    document.append(parent, id);
                }
                None if parent == Some(contents.id()) => roots.push(id),
                None => continue,
            }
            copied.insert(node.id(), id);
        }

        Self { key: None, document, roots }
    }

    pub fn from_nodes(doc: &Document, nodes: &[NodeId]) -> Self {
        let mut document = Document::new();
        let roots = nodes.iter().map(|id| document.import(doc, *id)).collect();
        Self { key: None, document, roots }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Import a fresh copy of every root into `target`.
    pub fn draw(&self, target: &mut Document) -> Vec<NodeId> {
        self.roots.iter().map(|id| target.import(&self.document, *id)).collect()
    }
}

/// Where a template comes from.
#[derive(Debug, Clone)]
pub enum TemplateDesignator {
    Markup(String),
    Url(String),
    /// Nodes already living in the renderer's document.
    Nodes(Vec<NodeId>),
    Source(Rc<TemplateSource>),
}

impl From<&str> for TemplateDesignator {
    fn from(value: &str) -> Self {
        if value.trim_start().starts_with('<') {
            TemplateDesignator::Markup(value.to_string())
        } else {
            TemplateDesignator::Url(value.trim().to_string())
        }
    }
}

impl From<Rc<TemplateSource>> for TemplateDesignator {
    fn from(source: Rc<TemplateSource>) -> Self {
        TemplateDesignator::Source(source)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self { url: url.into(), headers: Vec::new() }
    }
}

pub trait Fetch {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> LocalBoxFuture<'a, Result<String, RenderError>>;
}

/// `http(s)://` through reqwest; `file://` and bare paths from disk.
#[derive(Debug, Clone, Default)]
pub struct HttpFetch {
    client: reqwest::Client,
}

impl HttpFetch {
    pub fn new() -> Self {
        Self::default()
    }

    async fn get(&self, request: &FetchRequest) -> Result<String, RenderError> {
        let url = request.url.as_str();
        if url.starts_with("http://") || url.starts_with("https://") {
            let mut builder = self.client.get(url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            let response = builder.send().await.map_err(|e| RenderError::fetch(url, e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(RenderError::fetch(url, format!("status {status}")));
            }
            return response.text().await.map_err(|e| RenderError::fetch(url, e));
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        tokio::fs::read_to_string(Path::new(path))
            .await
            .map_err(|e| RenderError::fetch(url, e))
    }
}

impl Fetch for HttpFetch {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> LocalBoxFuture<'a, Result<String, RenderError>> {
        self.get(request).boxed_local()
    }
}

/// Serves registered bodies; unknown URLs fail like a refused connection.
#[derive(Debug, Default)]
pub struct MemoryFetch {
    entries: RefCell<HashMap<String, String>>,
    hits: Cell<usize>,
}

impl MemoryFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.insert(url, body);
        self
    }

    pub fn insert(&self, url: impl Into<String>, body: impl Into<String>) {
        self.entries.borrow_mut().insert(url.into(), body.into());
    }

    /// Number of fetches served so far.
    pub fn hits(&self) -> usize {
        self.hits.get()
    }
}

impl Fetch for MemoryFetch {
    fn fetch<'a>(&'a self, request: &'a FetchRequest) -> LocalBoxFuture<'a, Result<String, RenderError>> {
        let result = match self.entries.borrow().get(&request.url) {
            Some(body) => {
                self.hits.set(self.hits.get() + 1);
                Ok(body.clone())
            }
            None => Err(RenderError::fetch(&request.url, "not found")),
        };
        futures_util::future::ready(result).boxed_local()
    }
}

pub struct TemplateLoader {
    fetch: Rc<dyn Fetch>,
    cache: RefCell<HashMap<String, Rc<TemplateSource>>>,
    caching: bool,
}

impl std::fmt::Debug for TemplateLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemplateLoader")
            .field("cached", &self.cache.borrow().len())
            .field("caching", &self.caching)
            .finish()
    }
}

impl TemplateLoader {
    pub fn new(fetch: Rc<dyn Fetch>, caching: bool) -> Self {
        Self {
            fetch,
            cache: RefCell::new(HashMap::new()),
            caching,
        }
    }

    pub fn cached(&self, key: &str) -> Option<Rc<TemplateSource>> {
        self.cache.borrow().get(key).cloned()
    }

    fn store(&self, key: String, source: TemplateSource, cache: bool) -> Rc<TemplateSource> {
        let source = Rc::new(source.with_key(key.clone()));
        if cache && self.caching {
            self.cache.borrow_mut().insert(key, source.clone());
        }
        source
    }

    /// Resolve a designator to a source, consulting the cache under `alias`,
    /// the URL, or a digest of the markup.
    pub async fn load(
        &self,
        designator: TemplateDesignator,
        dom: &Dom,
        cache: bool,
        alias: Option<&str>,
    ) -> Result<Rc<TemplateSource>, RenderError> {
        match designator {
            TemplateDesignator::Source(source) => Ok(source),
            TemplateDesignator::Nodes(nodes) => {
                let doc = dom.borrow();
                if nodes.is_empty() || nodes.iter().any(|id| !doc.contains(*id)) {
                    return Err(RenderError::UnsupportedTemplateSource("empty or foreign node list".into()));
                }
                let source = TemplateSource::from_nodes(&doc, &nodes);
                Ok(match alias {
                    Some(alias) => self.store(alias.to_string(), source, cache),
                    None => Rc::new(source),
                })
            }
            TemplateDesignator::Markup(markup) => {
                let key = alias.map_or_else(|| markup_cache_key(&markup), str::to_string);
                if let Some(hit) = self.cached(&key) {
                    debug!(key = %key, "template cache hit");
                    return Ok(hit);
                }
                Ok(self.store(key, TemplateSource::parse(&markup), cache))
            }
            TemplateDesignator::Url(url) => {
                if url.is_empty() {
                    return Err(RenderError::UnsupportedTemplateSource("empty url".into()));
                }
                let key = alias.map_or_else(|| url.clone(), str::to_string);
                if let Some(hit) = self.cached(&key) {
                    debug!(key = %key, "template cache hit");
                    return Ok(hit);
                }
                let markup = self.fetch(&url).await?;
                debug!(url = %url, bytes = markup.len(), "template fetched");
                Ok(self.store(key, TemplateSource::parse(&markup), cache))
            }
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<String, RenderError> {
        self.fetch.fetch(&FetchRequest::get(url)).await
    }

    pub async fn fetch_json(&self, request: &FetchRequest) -> Result<Value, RenderError> {
        let body = self.fetch.fetch(request).await?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_parse_keeps_structure() {
        let source = TemplateSource::parse(r#"<ul class="x"><li jstl-foreach="${items}">${item}</li></ul> <!-- note -->"#);
        let mut doc = Document::new();
        let roots = source.draw(&mut doc);
        assert_eq!(roots.len(), 3);
        assert_eq!(
            doc.outer_html(roots[0]),
            r#"<ul class="x"><li jstl-foreach="${items}">${item}</li></ul>"#
        );
        assert_eq!(doc.text(roots[2]), Some(" note "));
    }

    #[test]
    fn test_parse_accepts_table_parts() {
        let source = TemplateSource::parse(r#"<tr jstl-foreach="${rows}"><td>${item}</td></tr>"#);
        let mut doc = Document::new();
        let roots = source.draw(&mut doc);
        assert_eq!(roots.len(), 1);
        assert_eq!(doc.outer_html(roots[0]), r#"<tr jstl-foreach="${rows}"><td>${item}</td></tr>"#);
    }

    #[test]
    fn test_parse_copies_nested_template_contents() {
        let source = TemplateSource::parse(r#"<template id="t"><i>${n}</i></template>"#);
        let mut doc = Document::new();
        let roots = source.draw(&mut doc);
        assert_eq!(doc.outer_html(roots[0]), r#"<template id="t"><i>${n}</i></template>"#);
        assert_eq!(doc.children(roots[0]).len(), 1);
    }

    #[test]
    fn test_draw_is_independent() {
        let source = TemplateSource::parse("<p>a</p>");
        let mut doc = Document::new();
        let first = source.draw(&mut doc)[0];
        let second = source.draw(&mut doc)[0];
        doc.set_attr(first, "id", "changed");
        assert_eq!(doc.outer_html(second), "<p>a</p>");
    }

    #[test]
    fn test_designator_from_str() {
        assert!(matches!(TemplateDesignator::from("  <p></p>"), TemplateDesignator::Markup(_)));
        assert!(matches!(TemplateDesignator::from("/t/row.html"), TemplateDesignator::Url(_)));
    }

    #[test]
    fn test_url_loads_are_cached() {
        let fetch = Rc::new(MemoryFetch::new().with("/row.html", "<tr></tr>"));
        let loader = TemplateLoader::new(fetch.clone(), true);
        let dom = Dom::new();
        block_on(async {
            let first = loader.load("/row.html".into(), &dom, true, None).await.unwrap();
            let second = loader.load("/row.html".into(), &dom, true, None).await.unwrap();
            assert!(Rc::ptr_eq(&first, &second));
            assert_eq!(first.key(), Some("/row.html"));
        });
        assert_eq!(fetch.hits(), 1);
    }

    #[test]
    fn test_markup_alias_and_missing_url() {
        let loader = TemplateLoader::new(Rc::new(MemoryFetch::new()), true);
        let dom = Dom::new();
        block_on(async {
            let source = loader.load("<b>x</b>".into(), &dom, true, Some("bold")).await.unwrap();
            assert!(Rc::ptr_eq(&source, &loader.cached("bold").unwrap()));
            let missing = loader.load("/nope.html".into(), &dom, true, None).await;
            assert!(matches!(missing, Err(RenderError::Fetch { .. })));
            let empty = loader.load(TemplateDesignator::Nodes(Vec::new()), &dom, true, None).await;
            assert!(matches!(empty, Err(RenderError::UnsupportedTemplateSource(_))));
        });
    }

    #[test]
    fn test_file_urls_read_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.html");
        std::fs::write(&path, "<div>card</div>").unwrap();
        let loader = TemplateLoader::new(Rc::new(HttpFetch::new()), false);
        let markup = block_on(loader.fetch(&format!("file://{}", path.display()))).unwrap();
        assert_eq!(markup, "<div>card</div>");
    }
}
