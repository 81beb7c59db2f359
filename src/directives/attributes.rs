use futures_util::future::LocalBoxFuture;
use serde_json::Value;
use tracing::warn;

use super::{ready, resolve, resolve_text};
use crate::context::RenderContext;
use crate::directive::{Directive, Phase, PREFIX};
use crate::dom::{Listener, ListenerAction, ListenerOptions, NodeId, Selector};
use crate::error::RenderError;
use crate::expr::{display, is_truthy};
use crate::scope::{has_placeholder, is_single_placeholder};

/// Copies the template node's attributes onto the output element.
///
/// - `name="..."`: placeholders resolved; a lone placeholder resolving to
///   undefined, null or false drops the attribute
/// - `?name="${guard}"`: `name` is set only when the guard holds; without a
///   `name` attribute the guard sets an empty boolean attribute
/// - `@event="handle"`: a registered handler name binds that handler, any
///   other string re-dispatches as that custom event, and an object gives
///   `{capture, passive, once, delegate, handler}`
/// - `@event:delegate`, `@event:toggle-class`, `@event:toggle-attribute`;
///   toggles take `[selector] name`, the selector matched with `closest`
/// - `?@event...="${guard}"` guards an event binding
pub struct Attributes;

impl Directive for Attributes {
    fn name(&self) -> &'static str { "attributes" }
    fn rank(&self) -> u32 { 1000 }
    fn phase(&self) -> Phase { Phase::Content }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        ready(bind_all(ctx))
    }
}

fn bind_all(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let (Some(node), Some(element)) = (ctx.template_node(), ctx.element()) else { return Ok(()) };
    let attrs = ctx.dom().borrow().attrs(node).to_vec();

    for (name, value) in &attrs {
        if name.starts_with(PREFIX) {
            continue;
        }
        let result = if let Some(guarded) = name.strip_prefix('?') {
            if guarded.starts_with('@') || attrs.iter().any(|(other, _)| other == guarded) {
                continue;
            }
            bind_boolean(ctx, element, guarded, value);
            Ok(())
        } else if !guard_holds(ctx, &attrs, name) {
            continue;
        } else if let Some(event) = name.strip_prefix('@') {
            bind_event(ctx, element, event, value)
        } else {
            bind_plain(ctx, element, name, value);
            Ok(())
        };
        if let Err(error) = result {
            warn!(attribute = %name, context = ctx.id(), error = %error, "attribute binding failed");
        }
    }
    Ok(())
}

fn guard_holds(ctx: &RenderContext, attrs: &[(String, String)], name: &str) -> bool {
    let guard_name = format!("?{name}");
    match attrs.iter().find(|(other, _)| *other == guard_name) {
        Some((_, guard)) => is_truthy(&resolve(ctx, guard)),
        None => true,
    }
}

fn bind_boolean(ctx: &RenderContext, element: NodeId, name: &str, guard: &str) {
    if is_truthy(&resolve(ctx, guard)) {
        ctx.dom().borrow_mut().set_attr(element, name, "");
    }
}

fn bind_plain(ctx: &RenderContext, element: NodeId, name: &str, value: &str) {
    let value = if is_single_placeholder(value) {
        match resolve(ctx, value) {
            None | Some(Value::Null) | Some(Value::Bool(false)) => return,
            resolved => display(&resolved),
        }
    } else if has_placeholder(value) {
        resolve_text(ctx, value)
    } else {
        value.to_string()
    };
    ctx.dom().borrow_mut().set_attr(element, name, value);
}

fn bind_event(ctx: &RenderContext, element: NodeId, binding: &str, value: &str) -> Result<(), RenderError> {
    let (event, modifier) = match binding.split_once(':') {
        Some((event, modifier)) => (event, Some(modifier)),
        None => (binding, None),
    };
    if event.is_empty() {
        return Err(RenderError::InvalidHandler(format!("@{binding} names no event")));
    }
    let text = || {
        if has_placeholder(value) {
            resolve_text(ctx, value).trim().to_string()
        } else {
            value.trim().to_string()
        }
    };

    let listener = match modifier {
        None => handle(ctx, event, value)?,
        Some("delegate") => Listener::new(event, ListenerAction::Delegate(nonempty(text(), binding)?)),
        Some("toggle-class") => {
            let (selector, class) = toggle_target(&text(), binding)?;
            Listener::new(event, ListenerAction::ToggleClass { selector, class })
        }
        Some("toggle-attribute") => {
            let (selector, attribute) = toggle_target(&text(), binding)?;
            Listener::new(event, ListenerAction::ToggleAttribute { selector, attribute })
        }
        Some(other) => {
            return Err(RenderError::InvalidHandler(format!("unknown event modifier `{other}` on @{event}")));
        }
    };
    ctx.dom().on(element, listener);
    Ok(())
}

fn handle(ctx: &RenderContext, event: &str, value: &str) -> Result<Listener, RenderError> {
    let resolved = if has_placeholder(value) {
        resolve(ctx, value)
    } else {
        Some(Value::String(value.trim().to_string()))
    };

    match resolved {
        Some(Value::String(name)) => {
            let name = nonempty(name, event)?;
            let action = match ctx.renderer().handler(&name) {
                Some(callback) => ListenerAction::Callback(callback),
                None => ListenerAction::Delegate(name),
            };
            Ok(Listener::new(event, action))
        }
        Some(Value::Object(options)) => {
            let flag = |key: &str| options.get(key).and_then(Value::as_bool).unwrap_or(false);
            let listener_options = ListenerOptions {
                capture: flag("capture"),
                passive: flag("passive"),
                once: flag("once"),
            };
            let delegate = options.get("delegate").and_then(Value::as_str);
            let handler = options.get("handler").and_then(Value::as_str);
            let action = match (delegate, handler) {
                (Some(delegate), _) => ListenerAction::Delegate(delegate.to_string()),
                (None, Some(handler)) => match ctx.renderer().handler(handler) {
                    Some(callback) => ListenerAction::Callback(callback),
                    None => return Err(RenderError::InvalidHandler(format!("no handler named `{handler}`"))),
                },
                (None, None) => {
                    return Err(RenderError::InvalidHandler(format!("@{event} options name no delegate or handler")));
                }
            };
            Ok(Listener::new(event, action).with_options(listener_options))
        }
        other => Err(RenderError::InvalidHandler(format!("@{event} resolved to {}", display(&other)))),
    }
}

fn nonempty(name: String, binding: &str) -> Result<String, RenderError> {
    if name.is_empty() {
        return Err(RenderError::InvalidHandler(format!("empty handle for @{binding}")));
    }
    Ok(name)
}

/// `"name"` targets the element itself, `"selector name"` its closest match.
fn toggle_target(text: &str, binding: &str) -> Result<(Option<Selector>, String), RenderError> {
    match text.rsplit_once(char::is_whitespace) {
        Some((selector, name)) => Ok((Some(Selector::parse(selector.trim())?), name.to_string())),
        None => Ok((None, nonempty(text.to_string(), binding)?)),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use crate::directives::testing::{render, render_with, renderer};
    use crate::dom::Selector;
    use crate::loader::MemoryFetch;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_plain_and_dropped_attributes() {
        let markup = r#"<a href="/u/${id}" title="${missing}" data-off="${off}" data-n="${n}">x</a>"#;
        let html = render(markup, json!({ "id": 3, "off": false, "n": 0 })).await;
        assert!(html.contains(r#"href="/u/3""#), "{html}");
        assert!(html.contains(r#"data-n="0""#), "{html}");
        assert!(!html.contains("title") && !html.contains("data-off"), "{html}");
    }

    #[tokio::test]
    async fn test_conditional_attribute() {
        let markup = r#"<button ?disabled="${locked}" disabled>go</button>"#;
        assert_eq!(render(markup, json!({ "locked": true })).await, r#"<button disabled="">go</button>"#);
        assert_eq!(render(markup, json!({ "locked": false })).await, "<button>go</button>");
    }

    #[tokio::test]
    async fn test_guard_without_partner_sets_boolean() {
        let markup = r#"<input ?checked="${on}">"#;
        assert_eq!(render(markup, json!({ "on": 1 })).await, r#"<input checked="">"#);
        assert_eq!(render(markup, json!({ "on": 0 })).await, "<input>");
    }

    #[tokio::test]
    async fn test_registered_handler_is_bound() {
        let renderer = renderer(MemoryFetch::new());
        let clicks = Rc::new(Cell::new(0));
        let counter = clicks.clone();
        renderer.register_handler("save", move |_| counter.set(counter.get() + 1));

        let container = render_with(&renderer, r#"<button @click="save" ?@dblclick="${false}" @dblclick="save">s</button>"#, json!({})).await;
        let dom = renderer.dom();
        let button = dom.borrow().query(container, &Selector::parse("button").unwrap()).unwrap();
        dom.trigger(button, "click", Value::Null, true);
        dom.trigger(button, "dblclick", Value::Null, true);
        assert_eq!(clicks.get(), 1);
    }

    #[tokio::test]
    async fn test_delegate_and_toggles() {
        let renderer = renderer(MemoryFetch::new());
        let markup = r#"<div class="panel"><button @click="saved" @click:toggle-class=".panel open" @click:toggle-attribute="aria-pressed">s</button></div>"#;
        let container = render_with(&renderer, markup, json!({})).await;
        let dom = renderer.dom();
        let (panel, button) = {
            let doc = dom.borrow();
            (
                doc.query(container, &Selector::parse(".panel").unwrap()).unwrap(),
                doc.query(container, &Selector::parse("button").unwrap()).unwrap(),
            )
        };
        let saved = Rc::new(Cell::new(false));
        let flag = saved.clone();
        dom.on(panel, crate::dom::Listener::new("saved", crate::dom::ListenerAction::Callback(Rc::new(move |_| flag.set(true)))));

        dom.trigger(button, "click", Value::Null, true);
        assert!(saved.get());
        assert!(dom.borrow().has_class(panel, "open"));
        assert!(dom.borrow().has_attr(button, "aria-pressed"));
    }
}
