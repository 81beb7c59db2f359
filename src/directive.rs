//! Directive System - Ordered Template Logic
//!
//! A directive is a stateless unit of template logic tagged with a phase and a
//! rank. The registry keeps directives sorted by `(phase, rank)`; directives
//! with equal keys run in the order they were defined.

use std::fmt;
use std::rc::Rc;

use futures_util::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::context::RenderContext;
use crate::error::RenderError;

pub const MIN_RANK: u32 = 0;
pub const MAX_RANK: u32 = 100_000;

/// Reserved attribute prefix. Attributes carrying it never reach the output.
pub const PREFIX: &str = "jstl-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Init,
    Data,
    Template,
    Content,
    Finish,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "init",
            Phase::Data => "data",
            Phase::Template => "template",
            Phase::Content => "content",
            Phase::Finish => "finish",
        };
        f.write_str(name)
    }
}

/// Directive trait - one step of the render pipeline
pub trait Directive {
    fn name(&self) -> &'static str;
    fn rank(&self) -> u32;
    fn phase(&self) -> Phase;

    /// Errors for which [`RenderError::is_configuration`] holds abort the
    /// render; any other error is logged and the pipeline moves on.
    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>>;
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectiveInfo {
    pub name: &'static str,
    pub phase: Phase,
    pub rank: u32,
}

#[derive(Default)]
pub struct DirectiveRegistry {
    directives: Vec<Rc<dyn Directive>>,
}

impl fmt::Debug for DirectiveRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl DirectiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in directive.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for directive in crate::directives::defaults() {
            // Built-in ranks are constants inside the bounds.
            let _ = registry.define(directive);
        }
        registry
    }

    pub fn define(&mut self, directive: Rc<dyn Directive>) -> Result<(), RenderError> {
        let rank = directive.rank();
        if !(MIN_RANK..=MAX_RANK).contains(&rank) {
            return Err(RenderError::RankOutOfBounds {
                name: directive.name().to_string(),
                rank,
                min: MIN_RANK,
                max: MAX_RANK,
            });
        }
        self.directives.push(directive);
        // Stable, so equal keys keep definition order.
        self.directives.sort_by_key(|d| (d.phase(), d.rank()));
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rc<dyn Directive>> {
        self.directives.iter()
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.directives.iter().map(|d| d.name()).collect()
    }

    pub fn describe(&self) -> Vec<DirectiveInfo> {
        self.directives
            .iter()
            .map(|d| DirectiveInfo {
                name: d.name(),
                phase: d.phase(),
                rank: d.rank(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    struct Stub(&'static str, Phase, u32);

    impl Directive for Stub {
        fn name(&self) -> &'static str { self.0 }
        fn rank(&self) -> u32 { self.2 }
        fn phase(&self) -> Phase { self.1 }

        fn execute<'a>(&'a self, _ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
            futures_util::future::ready(Ok(())).boxed_local()
        }
    }

    #[test]
    fn test_sorted_by_phase_then_rank() {
        let mut registry = DirectiveRegistry::new();
        registry.define(Rc::new(Stub("content", Phase::Content, 0))).unwrap();
        registry.define(Rc::new(Stub("late-init", Phase::Init, 50))).unwrap();
        registry.define(Rc::new(Stub("data", Phase::Data, 1))).unwrap();
        registry.define(Rc::new(Stub("early-init", Phase::Init, 5))).unwrap();
        assert_eq!(registry.names(), vec!["early-init", "late-init", "data", "content"]);
    }

    #[test]
    fn test_equal_keys_keep_definition_order() {
        let mut registry = DirectiveRegistry::new();
        registry.define(Rc::new(Stub("first", Phase::Data, 10))).unwrap();
        registry.define(Rc::new(Stub("second", Phase::Data, 10))).unwrap();
        registry.define(Rc::new(Stub("third", Phase::Data, 10))).unwrap();
        assert_eq!(registry.names(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_rank_out_of_bounds_is_rejected() {
        let mut registry = DirectiveRegistry::new();
        let err = registry.define(Rc::new(Stub("huge", Phase::Data, MAX_RANK + 1))).unwrap_err();
        assert!(matches!(err, RenderError::RankOutOfBounds { rank, .. } if rank == MAX_RANK + 1));
        assert!(err.is_configuration());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_defaults_follow_phase_order() {
        let registry = DirectiveRegistry::with_defaults();
        let phases: Vec<Phase> = registry.iter().map(|d| d.phase()).collect();
        let mut sorted = phases.clone();
        sorted.sort();
        assert_eq!(phases, sorted);
        assert_eq!(registry.names().first(), Some(&"initial"));
        assert_eq!(registry.names().last(), Some(&"on-finished"));
    }
}
