use futures_util::future::LocalBoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::debug;

use super::{resolve, resolve_text};
use crate::context::RenderContext;
use crate::directive::{Directive, Phase};
use crate::error::RenderError;
use crate::expr;
use crate::loader::FetchRequest;

/// `jstl-data`: loads or computes a value and binds it into the scope chain.
///
/// Modes (`jstl-data-mode`):
/// - `remote`: fetch the URL and parse the body as JSON; `jstl-data-option`
///   may carry `{ headers: {...} }`
/// - `set` (default): resolve the attribute as an expression
/// - `direct`: resolve the attribute as text
///
/// The result goes to `jstl-data-var` when given, is merged into the scope
/// named by `jstl-data-scope` otherwise, and else becomes a new `data` scope.
pub struct Data;

impl Directive for Data {
    fn name(&self) -> &'static str { "data" }
    fn rank(&self) -> u32 { 1000 }
    fn phase(&self) -> Phase { Phase::Data }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        bind(ctx).boxed_local()
    }
}

async fn bind(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(source) = ctx.directive_attribute("data") else { return Ok(()) };
    let mode = ctx.directive_attribute("data-mode").unwrap_or_else(|| "set".to_string());

    let value = match mode.trim() {
        "remote" => {
            let url = resolve_text(ctx, &source);
            let mut request = FetchRequest::get(url.trim());
            if let Some(option) = ctx.directive_attribute("data-option") {
                if let Some(Value::Object(headers)) = resolve(ctx, &option).and_then(|o| o.get("headers").cloned()) {
                    request.headers = headers
                        .into_iter()
                        .map(|(name, value)| (name, expr::display(&Some(value))))
                        .collect();
                }
            }
            let renderer = ctx.renderer().clone();
            renderer.loader().fetch_json(&request).await?
        }
        "set" => resolve(ctx, &source).unwrap_or(Value::Null),
        "direct" => Value::String(resolve_text(ctx, &source)),
        other => return Err(RenderError::UnknownDataMode(other.to_string())),
    };

    let var = ctx.directive_attribute("data-var");
    let scope = ctx.directive_attribute("data-scope");
    match (var, scope) {
        (Some(var), scope) => {
            debug!(context = ctx.id(), var = %var, "binding data variable");
            ctx.resolver.update_data(var.trim(), value, scope.as_deref().map(str::trim))?;
        }
        (None, Some(scope)) => {
            ctx.resolver.merge_context(wrap(value), Some(scope.trim()))?;
        }
        (None, None) => {
            ctx.resolver = ctx.resolver.child("data", wrap(value));
        }
    }
    Ok(())
}

/// Scopes hold mappings; anything else is exposed as `data`.
fn wrap(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "data": value })
    }
}
