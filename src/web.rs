//! HTTP surface: one prompt page driving the full pipeline, plus the dataset
//! preview, example questions, the rendered graphic and a health probe.

use std::sync::Arc;

use axum::{
    extract::{Form, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::dataset::Dataset;
use crate::errors::AppError;
use crate::executor::{CodeRunner, RunRequest};
use crate::extract::extract_code;
use crate::llm::{build_prompt, ChatClient, ChatMessage};

pub struct AppState {
    pub config: AppConfig,
    pub runner: CodeRunner,
    /// The graphic path is one fixed file shared by all requests, so the
    /// pipeline runs one at a time.
    run_lock: tokio::sync::Mutex<()>,
}

impl AppState {
    pub fn new(config: AppConfig, runner: CodeRunner) -> Self {
        Self {
            config,
            runner,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_get).post(index_post))
        .route("/graphic.png", get(graphic))
        .route("/data", get(data_page))
        .route("/questions", get(questions_page))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct PromptForm {
    #[serde(default)]
    prompt: String,
}

/// Everything the index template needs for one render.
#[derive(Debug, Default)]
struct PageView {
    prompt: String,
    gpt_response: String,
    code_to_execute: String,
    execution_result: String,
    show_graphic: bool,
}

async fn index_get() -> Html<String> {
    Html(render_index(&PageView::default()))
}

async fn index_post(
    State(state): State<Arc<AppState>>,
    Form(form): Form<PromptForm>,
) -> Html<String> {
    let _guard = state.run_lock.lock().await;
    let view = run_pipeline(&state, form.prompt).await;
    Html(render_index(&view))
}

/// The full per-request pipeline: describe the dataset, call the model,
/// extract the code, execute it, collect everything for the template.
///
/// Every fault ends up as text on the page; nothing here can abort the
/// response.
async fn run_pipeline(state: &AppState, prompt: String) -> PageView {
    let mut view = PageView {
        prompt,
        ..PageView::default()
    };

    // A leftover figure from a previous request must never be shown again.
    if state.config.graphic_path.exists() {
        let _ = std::fs::remove_file(&state.config.graphic_path);
    }

    let description = match Dataset::from_csv(&state.config.csv_path) {
        Ok(dataset) => dataset.describe(5),
        Err(e) => {
            error!(error = %e, "dataset unavailable");
            view.gpt_response = e.to_string();
            return view;
        }
    };

    let reply = match chat(state, &description, &view.prompt).await {
        Ok(reply) => reply,
        Err(e) => {
            // Credential and service errors surface as the reply text; the
            // pipeline halts before extraction and execution.
            info!(error = %e, "chat call failed");
            view.gpt_response = e.to_string();
            return view;
        }
    };

    view.code_to_execute = extract_code(&reply);
    view.gpt_response = reply;

    let request = RunRequest::new(view.code_to_execute.clone(), state.config.csv_path.clone())
        .with_save_plot_path(state.config.graphic_path.clone());

    match state.runner.run(&request).await {
        Ok(outcome) => {
            view.show_graphic = outcome.produced_graphic();
            view.execution_result = outcome.display_text().to_string();
        }
        Err(e) => {
            let e = AppError::from(e);
            error!(error = %e, "execution subprocess failed");
            view.execution_result = format!("Execution failed: {e}");
        }
    }

    view
}

async fn chat(state: &AppState, description: &str, prompt: &str) -> Result<String, AppError> {
    let csv_name = state
        .config
        .csv_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| state.config.csv_path.display().to_string());

    let client = ChatClient::from_config(&state.config)?;
    let full_prompt = build_prompt(&csv_name, description, prompt);
    client.complete(&[ChatMessage::user(full_prompt)]).await
}

async fn graphic(State(state): State<Arc<AppState>>) -> Response {
    match tokio::fs::read(&state.config.graphic_path).await {
        Ok(bytes) => (
            [
                (header::CONTENT_TYPE, "image/png"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no graphic has been produced").into_response(),
    }
}

async fn data_page(State(state): State<Arc<AppState>>) -> Html<String> {
    match Dataset::from_csv(&state.config.csv_path) {
        Ok(dataset) => Html(render_data(&dataset)),
        Err(e) => Html(page(
            "Dataset",
            &format!("<p class=\"error\">{}</p>", escape_html(&e.to_string())),
        )),
    }
}

async fn questions_page() -> Html<String> {
    Html(render_questions())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ---------------------------------------------------------------------------
// Rendering

const STYLE: &str = r#"
:root { --bg: #121212; --card: #1e1e1e; --accent: #2d2d2d; --text: #e6e6e6;
        --muted: #9a9a9a; --highlight: #4ea1ff; --error: #f87171; }
* { box-sizing: border-box; }
body { font-family: 'Segoe UI', sans-serif; background: var(--bg);
       color: var(--text); max-width: 960px; margin: 0 auto; padding: 24px; }
h1 { color: var(--highlight); }
nav a { color: var(--muted); margin-right: 16px; text-decoration: none; }
nav a:hover { color: var(--highlight); }
form { background: var(--card); padding: 16px; border-radius: 8px; }
input[type=text] { width: 100%; padding: 10px; background: var(--bg);
       color: var(--text); border: 1px solid var(--accent); border-radius: 6px; }
button { margin-top: 10px; background: var(--highlight); color: #081018;
       border: none; padding: 10px 24px; border-radius: 6px; cursor: pointer; }
section { background: var(--card); margin-top: 16px; padding: 16px;
       border-radius: 8px; }
section h2 { font-size: 0.9rem; text-transform: uppercase;
       letter-spacing: 1px; color: var(--muted); margin-top: 0; }
pre { background: var(--bg); padding: 12px; border-radius: 6px;
       overflow-x: auto; white-space: pre-wrap; word-break: break-word; }
table { border-collapse: collapse; width: 100%; }
th, td { border: 1px solid var(--accent); padding: 6px 10px; text-align: left; }
th { color: var(--highlight); }
img { max-width: 100%; border-radius: 6px; margin-top: 8px; }
.error { color: var(--error); }
"#;

fn page(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<style>{STYLE}</style>
</head>
<body>
<h1>{title}</h1>
<nav><a href="/">Ask</a><a href="/data">Data</a><a href="/questions">Questions</a></nav>
{body}
</body>
</html>"#
    )
}

fn render_index(view: &PageView) -> String {
    let mut body = format!(
        r#"<form method="post" action="/">
<label for="prompt">What would you like to know about the data?</label>
<input type="text" id="prompt" name="prompt" value="{}" autofocus>
<button type="submit">Ask</button>
</form>"#,
        escape_html(&view.prompt)
    );

    if !view.gpt_response.is_empty() {
        body.push_str(&format!(
            "<section><h2>Model reply</h2><pre>{}</pre></section>",
            escape_html(&view.gpt_response)
        ));
    }
    if !view.code_to_execute.is_empty() {
        body.push_str(&format!(
            "<section><h2>Extracted code</h2><pre>{}</pre></section>",
            escape_html(&view.code_to_execute)
        ));
    }
    if !view.execution_result.is_empty() {
        let class = if view.execution_result.starts_with("Error executing code:")
            || view.execution_result.starts_with("Execution failed:")
        {
            " class=\"error\""
        } else {
            ""
        };
        body.push_str(&format!(
            "<section><h2>Result</h2><pre{class}>{}</pre></section>",
            escape_html(&view.execution_result)
        ));
    }
    if view.show_graphic {
        body.push_str(
            "<section><h2>Graphic</h2><img src=\"/graphic.png\" alt=\"generated plot\"></section>",
        );
    }

    page("Augmented Analytics", &body)
}

fn render_data(dataset: &Dataset) -> String {
    let mut body = format!(
        "<section><h2>Shape</h2><p>{} rows × {} columns</p></section>",
        dataset.row_count(),
        dataset.column_count()
    );

    let dtypes = dataset
        .headers()
        .iter()
        .enumerate()
        .map(|(i, h)| {
            format!(
                "<tr><td>{}</td><td>{}</td></tr>",
                escape_html(h),
                dataset.column_type(i)
            )
        })
        .collect::<String>();
    body.push_str(&format!(
        "<section><h2>Columns</h2><table><tr><th>Column</th><th>Type</th></tr>{dtypes}</table></section>"
    ));

    let header_cells = dataset
        .headers()
        .iter()
        .map(|h| format!("<th>{}</th>", escape_html(h)))
        .collect::<String>();
    let rows = dataset
        .head(10)
        .iter()
        .map(|row| {
            let cells = row
                .iter()
                .map(|c| format!("<td>{}</td>", escape_html(c)))
                .collect::<String>();
            format!("<tr>{cells}</tr>")
        })
        .collect::<String>();
    body.push_str(&format!(
        "<section><h2>First rows</h2><table><tr>{header_cells}</tr>{rows}</table></section>"
    ));

    page("Dataset", &body)
}

fn render_questions() -> String {
    const QUESTIONS: &[&str] = &[
        "What is the average price per make?",
        "Plot a histogram of the mileage column.",
        "Which make has the highest median price?",
        "Show the price distribution for cars first registered after 2015.",
        "Plot average price against horsepower.",
        "How many offers are there per fuel type?",
    ];
    let items = QUESTIONS
        .iter()
        .map(|q| format!("<li>{}</li>", escape_html(q)))
        .collect::<String>();
    page(
        "Example questions",
        &format!("<section><h2>Try one of these</h2><ul>{items}</ul></section>"),
    )
}

/// Minimal HTML escaping for user- and model-controlled text.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
