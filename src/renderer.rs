//! Renderer - drives the directive pipeline over a context tree
//!
//! Flow per context:
//! 1. Directives run in registry order until one sets `stop`
//! 2. Unless `ignore` is set, template children render as a nested context
//! 3. Output is spliced into the container according to the insertion mode
//! 4. The context waits for its children, becomes ready, and the root runs
//!    the queued finish callbacks

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::RendererConfig;
use crate::context::{ContextKey, ContextTree, FinishJob, InsertMode, JournalEntry, RenderContext};
use crate::directive::DirectiveRegistry;
use crate::dom::{Dom, Event, EventCallback, NodeId};
use crate::error::RenderError;
use crate::expr::Evaluator;
use crate::loader::{Fetch, HttpFetch, TemplateDesignator, TemplateLoader};
use crate::scheduler::{Scheduler, TimerPurpose};
use crate::scope::Resolver;

pub type FinishHandler = Rc<dyn Fn(FinishedEvent) -> LocalBoxFuture<'static, ()>>;

/// Passed to finish handlers once the whole render is ready.
#[derive(Debug, Clone)]
pub struct FinishedEvent {
    pub element: Option<NodeId>,
    pub root: NodeId,
    pub template: Option<NodeId>,
    pub dom: Dom,
}

#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub template: Option<TemplateDesignator>,
    pub data: Option<Value>,
    pub container: Option<NodeId>,
    /// `replace`, `append` or `prepend`; replace when absent.
    pub mode: Option<String>,
    /// Anchor node inside the container.
    pub target: Option<NodeId>,
    pub root: Option<NodeId>,
}

impl RenderRequest {
    pub fn new(container: NodeId) -> Self {
        Self {
            container: Some(container),
            ..Default::default()
        }
    }

    pub fn template(mut self, template: impl Into<TemplateDesignator>) -> Self {
        self.template = Some(template.into());
        self
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn target(mut self, target: NodeId) -> Self {
        self.target = Some(target);
        self
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub id: String,
    pub content: Vec<NodeId>,
    pub container: NodeId,
}

struct RendererInner {
    id: Uuid,
    registry: Rc<DirectiveRegistry>,
    loader: TemplateLoader,
    dom: Dom,
    base: Resolver,
    config: RendererConfig,
    tree: RefCell<ContextTree>,
    scheduler: Scheduler,
    handlers: RefCell<HashMap<String, EventCallback>>,
    finish_handlers: RefCell<HashMap<String, FinishHandler>>,
    template: Option<TemplateDesignator>,
    data: Option<Value>,
}

#[derive(Clone)]
pub struct Renderer(Rc<RendererInner>);

impl fmt::Debug for Renderer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Renderer")
            .field("id", &self.0.id)
            .field("directives", &self.0.registry)
            .field("loader", &self.0.loader)
            .finish()
    }
}

#[derive(Default)]
pub struct RendererBuilder {
    dom: Option<Dom>,
    registry: Option<DirectiveRegistry>,
    fetch: Option<Rc<dyn Fetch>>,
    evaluator: Option<Evaluator>,
    config: RendererConfig,
    template: Option<TemplateDesignator>,
    data: Option<Value>,
}

impl RendererBuilder {
    pub fn dom(mut self, dom: Dom) -> Self {
        self.dom = Some(dom);
        self
    }

    pub fn registry(mut self, registry: DirectiveRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn fetch(mut self, fetch: Rc<dyn Fetch>) -> Self {
        self.fetch = Some(fetch);
        self
    }

    pub fn evaluator(mut self, evaluator: Evaluator) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn config(mut self, config: RendererConfig) -> Self {
        self.config = config;
        self
    }

    /// Template used by requests that carry none.
    pub fn template(mut self, template: impl Into<TemplateDesignator>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Data used by requests that carry none.
    pub fn data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn build(self) -> Renderer {
        let evaluator = Rc::new(self.evaluator.unwrap_or_default());
        let base = Resolver::root("renderer", Value::Object(Map::new()), evaluator, self.config.eval_warn());
        let fetch = self.fetch.unwrap_or_else(|| Rc::new(HttpFetch::new()));
        Renderer(Rc::new(RendererInner {
            id: Uuid::new_v4(),
            registry: Rc::new(self.registry.unwrap_or_else(DirectiveRegistry::with_defaults)),
            loader: TemplateLoader::new(fetch, self.config.cache_templates),
            dom: self.dom.unwrap_or_default(),
            base,
            tree: RefCell::new(ContextTree::with_journal_limit(self.config.journal_limit)),
            config: self.config,
            scheduler: Scheduler::new(),
            handlers: RefCell::new(HashMap::new()),
            finish_handlers: RefCell::new(HashMap::new()),
            template: self.template,
            data: self.data,
        }))
    }
}

impl Renderer {
    pub fn builder() -> RendererBuilder {
        RendererBuilder::default()
    }

    /// Renderer over `dom` with the built-in directives and HTTP fetching.
    pub fn new(dom: Dom) -> Self {
        Self::builder().dom(dom).build()
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn dom(&self) -> Dom {
        self.0.dom.clone()
    }

    pub fn config(&self) -> &RendererConfig {
        &self.0.config
    }

    pub fn registry(&self) -> &DirectiveRegistry {
        &self.0.registry
    }

    pub fn loader(&self) -> &TemplateLoader {
        &self.0.loader
    }

    /// Base scope every render layers its data under.
    pub fn resolver(&self) -> &Resolver {
        &self.0.base
    }

    pub fn tree(&self) -> Ref<'_, ContextTree> {
        self.0.tree.borrow()
    }

    pub(crate) fn tree_mut(&self) -> RefMut<'_, ContextTree> {
        self.0.tree.borrow_mut()
    }

    /// Recently completed contexts in completion order, bounded by
    /// `journal_limit`.
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.tree().journal().cloned().collect()
    }

    // --- Handlers ---

    pub fn register_handler(&self, name: impl Into<String>, handler: impl Fn(&Event) + 'static) {
        self.0.handlers.borrow_mut().insert(name.into(), Rc::new(handler));
    }

    pub fn handler(&self, name: &str) -> Option<EventCallback> {
        self.0.handlers.borrow().get(name).cloned()
    }

    pub fn register_finish_handler(
        &self,
        name: impl Into<String>,
        handler: impl Fn(FinishedEvent) -> LocalBoxFuture<'static, ()> + 'static,
    ) {
        self.0.finish_handlers.borrow_mut().insert(name.into(), Rc::new(handler));
    }

    pub fn finish_handler(&self, name: &str) -> Option<FinishHandler> {
        self.0.finish_handlers.borrow().get(name).cloned()
    }

    pub(crate) fn queue_finish(&self, root: ContextKey, job: FinishJob) {
        self.tree_mut().push_finish(root, job);
    }

    // --- Rendering ---

    /// Render a request. Scheduled work left by earlier renders makes
    /// progress while this one runs.
    pub async fn render(&self, request: RenderRequest) -> Result<RenderOutcome, RenderError> {
        self.0.scheduler.drive(self.render_request(request)).await
    }

    async fn render_request(&self, request: RenderRequest) -> Result<RenderOutcome, RenderError> {
        let started = Instant::now();
        let container = request.container.ok_or(RenderError::MissingParameter("container"))?;
        let mode = match request.mode.as_deref() {
            Some(mode) => mode.parse::<InsertMode>()?,
            None => InsertMode::default(),
        };
        let designator = request
            .template
            .or_else(|| self.0.template.clone())
            .ok_or(RenderError::MissingParameter("template"))?;

        let source = self
            .0
            .loader
            .load(designator, &self.0.dom, self.0.config.cache_templates, None)
            .await?;
        let nodes = source.draw(&mut self.0.dom.borrow_mut());
        let data = request
            .data
            .or_else(|| self.0.data.clone())
            .unwrap_or_else(|| Value::Object(Map::new()));
        let resolver = self.0.base.child("render", data);

        let mut ctx = RenderContext::new_root(
            self.clone(),
            "root",
            nodes,
            resolver,
            request.root.unwrap_or(container),
            Some(container),
            request.target,
            mode,
        );
        self.render_context(&mut ctx).await?;

        info!(
            renderer = %self.0.id,
            context = ctx.id(),
            nodes = ctx.content.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "render complete"
        );
        Ok(RenderOutcome {
            id: ctx.id().to_string(),
            content: ctx.content,
            container,
        })
    }

    /// Render one context to completion. A ready context is never rendered again.
    pub fn render_context<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        async move {
            if ctx.is_ready() {
                return Err(RenderError::AlreadyRendered(ctx.id().to_string()));
            }
            debug!(context = ctx.id(), depth = ctx.depth(), nodes = ctx.template.len(), "rendering context");

            if let Err(error) = self.render_template(ctx).await {
                self.tree_mut().abandon(ctx.key());
                return Err(error);
            }
            self.splice(ctx);
            self.finish(ctx).await;
            Ok(())
        }
        .boxed_local()
    }

    async fn render_template(&self, ctx: &mut RenderContext) -> Result<(), RenderError> {
        if ctx.template_node().is_some() {
            return self.run_pipeline(ctx).await;
        }
        for node in ctx.template.clone() {
            let resolver = ctx.resolver.child("node", Value::Object(Map::new()));
            let mut child = ctx.child(vec![node], resolver);
            self.render_context(&mut child).await?;
            ctx.content.extend(child.content);
        }
        Ok(())
    }

    async fn run_pipeline(&self, ctx: &mut RenderContext) -> Result<(), RenderError> {
        let registry = self.0.registry.clone();
        for directive in registry.iter() {
            if ctx.stop {
                break;
            }
            if ctx.is_directive_ignored(directive.name()) {
                continue;
            }
            if let Err(error) = directive.execute(ctx).await {
                if error.is_configuration() {
                    return Err(error);
                }
                warn!(directive = directive.name(), context = ctx.id(), error = %error, "directive failed");
            }
        }
        if !ctx.ignore {
            self.render_children(ctx).await?;
        }
        Ok(())
    }

    /// Render the remaining template children into the context's element.
    pub async fn render_children(&self, ctx: &mut RenderContext) -> Result<(), RenderError> {
        let Some(element) = ctx.element() else { return Ok(()) };
        if ctx.template_children.is_empty() {
            return Ok(());
        }
        let template = ctx.template_children.clone();
        let resolver = ctx.resolver.child("container", Value::Object(Map::new()));
        let mut child = ctx.child(template, resolver);
        child.container = Some(element);
        child.mode = InsertMode::Append;
        self.render_context(&mut child).await
    }

    fn splice(&self, ctx: &RenderContext) {
        let Some(container) = ctx.container else { return };
        let mut doc = self.0.dom.borrow_mut();
        let target = ctx.target.filter(|t| doc.parent(*t) == Some(container));
        match (ctx.mode, target) {
            (InsertMode::Replace, Some(target)) => {
                doc.replace(target, &ctx.content);
            }
            (InsertMode::Replace, None) => {
                doc.empty(container);
                for node in &ctx.content {
                    doc.append(container, *node);
                }
            }
            (InsertMode::Append, Some(target)) => {
                let mut anchor = target;
                for node in &ctx.content {
                    doc.insert_after(anchor, *node);
                    anchor = *node;
                }
            }
            (InsertMode::Append, None) => {
                for node in &ctx.content {
                    doc.append(container, *node);
                }
            }
            (InsertMode::Prepend, anchor) => {
                let anchor = anchor.or_else(|| doc.children(container).first().copied());
                for node in &ctx.content {
                    match anchor {
                        Some(anchor) => doc.insert_before(anchor, *node),
                        None => {
                            doc.append(container, *node);
                            true
                        }
                    };
                }
            }
        }
    }

    async fn finish(&self, ctx: &RenderContext) {
        let children = self.tree().pending_children(ctx.key());
        for child in children {
            child.wait().await;
        }
        self.tree_mut().mark_ready(ctx.key());
        if ctx.is_root() {
            self.run_finish_queue(ctx.root_key()).await;
        }
    }

    async fn run_finish_queue(&self, root: ContextKey) {
        let jobs = self.tree_mut().take_finish(root);
        for job in jobs {
            let future = (job.handler)(job.event);
            if job.asynchronous {
                self.0.scheduler.spawn(future);
            } else {
                future.await;
            }
        }
    }

    /// Render `template` in place of `placeholder` after `delay`.
    pub(crate) fn render_deferred(
        &self,
        template: NodeId,
        resolver: Resolver,
        placeholder: NodeId,
        root: NodeId,
        delay: Duration,
    ) {
        let renderer = self.clone();
        let key = format!("async:{placeholder:?}");
        let id = key.clone();
        self.0.scheduler.arm(&key, TimerPurpose::AsyncRender, delay, async move {
            let container = renderer.dom().borrow().parent(placeholder);
            let Some(container) = container else {
                debug!(context = %id, "async placeholder detached, render dropped");
                return;
            };
            let mut ctx = RenderContext::new_root(
                renderer.clone(),
                id,
                vec![template],
                resolver,
                root,
                Some(container),
                Some(placeholder),
                InsertMode::Replace,
            );
            ctx.set_deferred();
            if let Err(error) = renderer.render_context(&mut ctx).await {
                warn!(context = ctx.id(), error = %error, "async render failed");
            }
        });
    }

    /// Debounced render: re-scheduling `key` before `delay` elapses replaces
    /// the pending request.
    pub fn schedule_render(&self, key: &str, request: RenderRequest, delay: Duration) {
        let renderer = self.clone();
        let key_owned = key.to_string();
        self.0.scheduler.arm(key, TimerPurpose::Debounce, delay, async move {
            if let Err(error) = renderer.render(request).await {
                warn!(key = %key_owned, error = %error, "scheduled render failed");
            }
        });
    }

    pub fn cancel_render(&self, key: &str) -> bool {
        self.0.scheduler.cancel(key, TimerPurpose::Debounce)
    }

    /// Wait for every scheduled and deferred render.
    pub async fn settle(&self) {
        self.0.scheduler.settle().await;
    }
}
