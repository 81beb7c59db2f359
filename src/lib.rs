//! jstl Core - Template Rendering
//!
//! A template fragment and a data context go in; ordered directives
//! interpret the `jstl-*` markers against a chain of data scopes, and the
//! rendered content is spliced into a container.
//!
//! Everything is single-threaded. Each renderer owns a tokio `LocalSet` for
//! its timers and deferred work, so any current-thread runtime can drive it.

pub mod config;
pub mod context;
pub mod directive;
pub mod directives;
pub mod dom;
pub mod error;
pub mod expr;
pub mod hashing;
pub mod loader;
pub mod renderer;
pub mod scheduler;
pub mod scope;

pub use config::RendererConfig;
pub use context::{InsertMode, JournalEntry, RenderContext};
pub use directive::{Directive, DirectiveRegistry, Phase, MAX_RANK, MIN_RANK};
pub use dom::{Document, Dom, NodeId};
pub use error::RenderError;
pub use expr::Evaluator;
pub use loader::{Fetch, HttpFetch, MemoryFetch, TemplateDesignator, TemplateSource};
pub use renderer::{FinishedEvent, RenderOutcome, RenderRequest, Renderer};
pub use scope::{DefaultValue, Resolver};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
