use futures_util::future::LocalBoxFuture;

use super::{ready, resolve_text};
use crate::config::RendererConfig;
use crate::context::RenderContext;
use crate::directive::{Directive, Phase, PREFIX};
use crate::dom::{Document, NodeId, NodeKind};
use crate::error::RenderError;
use crate::loader::TemplateSource;
use crate::scope::has_placeholder;

/// Resolves placeholders in text nodes.
///
/// Controlled from the parent element: `jstl-text-content` (`text` or
/// `html`), `jstl-text-length` (truncate `text` output), `jstl-text-unsecure`
/// (keep denylisted tags in `html` output), `jstl-text-ignore`.
pub struct Text;

impl Directive for Text {
    fn name(&self) -> &'static str { "text" }
    fn rank(&self) -> u32 { 2000 }
    fn phase(&self) -> Phase { Phase::Content }

    fn execute<'a>(&'a self, ctx: &'a mut RenderContext) -> LocalBoxFuture<'a, Result<(), RenderError>> {
        ready(text(ctx))
    }
}

fn text(ctx: &mut RenderContext) -> Result<(), RenderError> {
    let Some(node) = ctx.template_node() else { return Ok(()) };
    let Some(&output) = ctx.content.first() else { return Ok(()) };
    let dom = ctx.dom();
    let (raw, parent) = {
        let doc = dom.borrow();
        match doc.kind(node) {
            NodeKind::Text(raw) => (raw.clone(), doc.parent(node)),
            _ => return Ok(()),
        }
    };
    let option = |name: &str| {
        parent.and_then(|parent| dom.borrow().attr(parent, &format!("{PREFIX}text-{name}")).map(str::to_string))
    };

    if raw.trim().is_empty() || option("ignore").is_some() {
        return Ok(());
    }
    let resolved = if has_placeholder(&raw) { resolve_text(ctx, &raw) } else { raw };
    let mode = option("content").unwrap_or_else(|| "text".to_string());

    match mode.trim() {
        "text" => {
            let limit = option("length").and_then(|length| length.trim().parse::<usize>().ok());
            let value = truncate(resolved, limit, &ctx.renderer().config().ellipsis);
            dom.borrow_mut().set_text(output, value);
        }
        "html" => {
            let unsecure = option("unsecure").is_some();
            let mut nodes = TemplateSource::parse(&resolved).draw(&mut dom.borrow_mut());
            if !unsecure {
                nodes = strip_denied(&mut dom.borrow_mut(), nodes, ctx.renderer().config());
            }
            ctx.content = nodes;
        }
        other => return Err(RenderError::UnsupportedTextMode(other.to_string())),
    }
    Ok(())
}

fn truncate(value: String, limit: Option<usize>, ellipsis: &str) -> String {
    match limit {
        Some(limit) if value.chars().count() > limit => {
            let mut truncated: String = value.chars().take(limit).collect();
            truncated.push_str(ellipsis);
            truncated
        }
        _ => value,
    }
}

/// Drop denylisted elements from `nodes` and everything below them.
fn strip_denied(doc: &mut Document, nodes: Vec<NodeId>, config: &RendererConfig) -> Vec<NodeId> {
    let mut kept = Vec::with_capacity(nodes.len());
    for node in nodes {
        if doc.tag(node).is_some_and(|tag| config.is_denied(tag)) {
            continue;
        }
        strip_below(doc, node, config);
        kept.push(node);
    }
    kept
}

fn strip_below(doc: &mut Document, node: NodeId, config: &RendererConfig) {
    for child in doc.children(node).to_vec() {
        if doc.tag(child).is_some_and(|tag| config.is_denied(tag)) {
            doc.detach(child);
        } else {
            strip_below(doc, child, config);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::testing::{render, render_with, renderer};
    use crate::loader::MemoryFetch;
    use crate::renderer::RenderRequest;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(truncate("héllo world".into(), Some(5), "…"), "héllo…");
        assert_eq!(truncate("short".into(), Some(5), "…"), "short");
        assert_eq!(truncate("short".into(), None, "…"), "short");
    }

    #[tokio::test]
    async fn test_text_is_escaped_and_resolved() {
        let html = render("<p>${a} &amp; ${b}</p>", json!({ "a": "<x>", "b": null })).await;
        assert_eq!(html, "<p>&lt;x&gt; &amp; null</p>");
    }

    #[tokio::test]
    async fn test_length_truncates() {
        let html = render(r#"<p jstl-text-length="4">${word}</p>"#, json!({ "word": "abcdefgh" })).await;
        assert_eq!(html, "<p>abcd\u{2026}</p>");
    }

    #[tokio::test]
    async fn test_ignore_keeps_placeholders() {
        let html = render(r#"<p jstl-text-ignore>${word}</p>"#, json!({ "word": "w" })).await;
        assert_eq!(html, "<p>${word}</p>");
    }

    #[tokio::test]
    async fn test_html_mode_strips_denylist() {
        let data = json!({ "body": "<b>bold</b><script>x()</script><i>it<style>s</style></i>" });
        let html = render(r#"<div jstl-text-content="html">${body}</div>"#, data.clone()).await;
        assert_eq!(html, "<div><b>bold</b><i>it</i></div>");

        let html = render(r#"<div jstl-text-content="html" jstl-text-unsecure>${body}</div>"#, data).await;
        assert!(html.contains("<script>"), "{html}");
    }

    #[tokio::test]
    async fn test_unknown_text_mode_aborts_render() {
        let renderer = renderer(MemoryFetch::new());
        let container = render_with(&renderer, "<i></i>", json!({})).await;
        let request = RenderRequest::new(container).template(r#"<p jstl-text-content="markdown">${x}</p>"#);
        let err = renderer.render(request).await.unwrap_err();
        assert!(matches!(err, RenderError::UnsupportedTextMode(ref mode) if mode == "markdown"));
    }
}
