use axum::{
    extract::State,
    response::{Html, IntoResponse},
};
use std::collections::HashMap;
use std::sync::Arc;

use crate::web::state::AppState;
use crate::web::templates::render_template;

// Main UI entry point
pub async fn index_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut context = HashMap::new();
    context.insert(
        "version",
        minijinja::value::Value::from(env!("CARGO_PKG_VERSION")),
    );
    context.insert(
        "model",
        minijinja::value::Value::from(state.config.llm.model.clone()),
    );

    Html(render_template(&state.template_env, "index.html", context))
}
