//! jstl CLI - render templates from the command line
//!
//! Commands: render, resolve, directives
//! Outputs JSON to stdout, logs to stderr (`RUST_LOG`)
//! Returns non-zero on configuration errors

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use jstl_core::{
    hashing::sha256_hex, DefaultValue, DirectiveRegistry, RenderRequest, Renderer,
    RendererConfig, Resolver, TemplateDesignator, TemplateSource, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "jstl-cli")]
#[command(about = "jstl CLI - Template Rendering", version = ENGINE_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Renderer configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template into an empty container
    Render {
        /// Markup, URL or file path
        #[arg(short, long)]
        template: String,

        /// JSON data context
        #[arg(short, long, default_value = "{}")]
        data: String,

        /// Insertion mode: replace, append or prepend
        #[arg(short, long)]
        mode: Option<String>,
    },

    /// Resolve placeholders in a text
    Resolve {
        #[arg(short, long)]
        text: String,

        /// JSON data context
        #[arg(short, long, default_value = "{}")]
        data: String,
    },

    /// List registered directives in execution order
    Directives,
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{text}"),
        Err(e) => println!(r#"{{"success": false, "error": "{e}"}}"#),
    }
}

fn failure(error: impl std::fmt::Display) -> ExitCode {
    print_json(&json!({ "success": false, "error": error.to_string() }));
    ExitCode::FAILURE
}

fn parse_data(data: &str) -> Result<Value, ExitCode> {
    serde_json::from_str(data).map_err(|e| failure(format!("Invalid data: {e}")))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match RendererConfig::load(path) {
            Ok(config) => config,
            Err(e) => return failure(format!("Failed to load config: {e}")),
        },
        None => RendererConfig::default(),
    };

    match cli.command {
        Commands::Render { template, data, mode } => {
            let data = match parse_data(&data) {
                Ok(data) => data,
                Err(code) => return code,
            };
            let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(runtime) => runtime,
                Err(e) => return failure(e),
            };
            runtime.block_on(render(config, template, data, mode))
        }

        Commands::Resolve { text, data } => {
            let data = match parse_data(&data) {
                Ok(data) => data,
                Err(code) => return code,
            };
            let resolver = Resolver::new("cli", data);
            print_json(&json!({
                "success": true,
                "text": resolver.resolve_text(&text, DefaultValue::none()),
            }));
            ExitCode::SUCCESS
        }

        Commands::Directives => {
            let registry = DirectiveRegistry::with_defaults();
            print_json(&json!(registry.describe()));
            ExitCode::SUCCESS
        }
    }
}

async fn render(config: RendererConfig, template: String, data: Value, mode: Option<String>) -> ExitCode {
    let renderer = Renderer::builder().config(config).build();
    let container = renderer.dom().borrow_mut().create_element("body");

    // Bare paths that exist locally are read from disk.
    let designator = match std::fs::read_to_string(&template) {
        Ok(markup) => TemplateDesignator::Source(std::rc::Rc::new(TemplateSource::parse(&markup))),
        Err(_) => TemplateDesignator::from(template.as_str()),
    };
    let mut request = RenderRequest::new(container).template(designator).data(data);
    request.mode = mode;

    match renderer.render(request).await {
        Ok(_) => {
            renderer.settle().await;
            let html = renderer.dom().borrow().inner_html(container);
            print_json(&json!({
                "success": true,
                "html": html,
                "digest": sha256_hex(html.as_bytes()),
                "renderedAt": chrono::Utc::now().to_rfc3339(),
                "contexts": renderer.journal(),
            }));
            ExitCode::SUCCESS
        }
        Err(e) => {
            let code = if e.is_configuration() { ExitCode::from(2) } else { ExitCode::FAILURE };
            print_json(&json!({ "success": false, "error": e.to_string() }));
            code
        }
    }
}
