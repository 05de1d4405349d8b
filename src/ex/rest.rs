use axum::extract::rejection::JsonRejection;
use axum::extract::{Path as AxumPath, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::ex::asyncutil::tasks;
use crate::ex::build_info;
use crate::ex::config::Configuration;
use crate::ex::logging::{ex_event, Level};
use crate::ex::process::{build_process, Manager};
use crate::ex::store::AppStore;

#[derive(Clone)]
pub struct RestState {
    pub store: Arc<AppStore>,
    pub manager: Arc<Manager>,
    pub config: Arc<Configuration>,
}

pub fn build_router(state: RestState) -> Router {
    Router::new()
        .route(
            "/applications/",
            get(list_applications).post(create_application),
        )
        .route(
            "/applications/:name",
            get(get_application)
                .put(update_application)
                .delete(delete_application),
        )
        .route("/actions/start/", get(start_all))
        .route("/actions/stop/", get(stop_all))
        .route("/actions/restart/", get(restart_all))
        .route("/actions/start/:name", get(start_application))
        .route("/actions/stop/:name", get(stop_application))
        .route("/actions/restart/:name", get(restart_application))
        .route("/status/", get(status_all))
        .route("/status/:name", get(status_one))
        .route("/version/", get(get_version))
        .with_state(state)
}

/// Bind the listen socket and serve until the shutdown flag flips. The bind happens before
/// this returns so the caller can treat a listen failure as fatal.
pub async fn start(
    state: RestState,
    cfg: &Configuration,
    shutting_down: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    ex_event(
        Level::Info,
        "rest",
        None,
        format!("listening addr={addr}"),
    );

    let app = build_router(state);
    tasks().spawn(async move {
        let shutdown = async move {
            while !shutting_down.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        };
        match axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(()) => ex_event(Level::Info, "rest", None, "stopped"),
            Err(e) => ex_event(Level::Error, "rest", None, format!("serve error err={e}")),
        }
    });
    Ok(())
}

fn http_error(status: StatusCode, text: impl Into<String>) -> Response {
    (status, Json(json!({"error": text.into()}))).into_response()
}

fn http_success(name: &str) -> Response {
    (StatusCode::OK, Json(json!({"success": name}))).into_response()
}

async fn list_applications(State(st): State<RestState>) -> Response {
    let applications = st.store.list();
    if applications.is_empty() {
        return http_error(StatusCode::NOT_FOUND, "no applications found");
    }
    Json(applications).into_response()
}

async fn get_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    match st.store.get(&name) {
        Some(app) => Json(app).into_response(),
        None => http_error(StatusCode::NOT_FOUND, "application not found"),
    }
}

async fn create_application(
    State(st): State<RestState>,
    body: Result<Json<crate::ex::app::Application>, JsonRejection>,
) -> Response {
    let Json(app) = match body {
        Ok(app) => app,
        Err(e) => return http_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if app.name.trim().is_empty() {
        return http_error(StatusCode::BAD_REQUEST, "application name required");
    }
    if let Err(e) = st.store.add(app.clone()) {
        return http_error(StatusCode::BAD_REQUEST, e.to_string());
    }
    match build_process(&app, &st.config) {
        Ok(proc) => {
            st.manager.append(proc);
            http_success(&app.name)
        }
        Err(e) => http_error(StatusCode::BAD_REQUEST, e.to_string()),
    }
}

async fn update_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
    body: Result<Json<crate::ex::app::Application>, JsonRejection>,
) -> Response {
    let Json(app) = match body {
        Ok(app) => app,
        Err(e) => return http_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if app.name.trim().is_empty() {
        return http_error(StatusCode::BAD_REQUEST, "application name required");
    }
    if let Err(e) = st.store.update(&name, app.clone()) {
        return http_error(StatusCode::NOT_FOUND, e.to_string());
    }
    // Capture the old process state before the replacement evicts it.
    let prior = st.manager.status(&name);
    let proc = match build_process(&app, &st.config) {
        Ok(proc) => proc,
        Err(e) => return http_error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    st.manager.delete(&name);
    st.manager.append(Arc::clone(&proc));
    if prior.map(|p| p.state == "Started").unwrap_or(false) {
        proc.start();
    }
    http_success(&app.name)
}

async fn delete_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    if let Err(e) = st.store.delete(&name) {
        return http_error(StatusCode::NOT_FOUND, e.to_string());
    }
    st.manager.delete(&name);
    http_success(&name)
}

async fn start_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(app) = st.store.get(&name) else {
        return http_error(StatusCode::NOT_FOUND, "application not found");
    };
    st.manager.start(&app.name);
    http_success(&app.name)
}

async fn stop_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(app) = st.store.get(&name) else {
        return http_error(StatusCode::NOT_FOUND, "application not found");
    };
    st.manager.stop(&app.name);
    http_success(&app.name)
}

async fn restart_application(
    State(st): State<RestState>,
    AxumPath(name): AxumPath<String>,
) -> Response {
    let Some(app) = st.store.get(&name) else {
        return http_error(StatusCode::NOT_FOUND, "application not found");
    };
    st.manager.restart(&app.name);
    http_success(&app.name)
}

async fn start_all(State(st): State<RestState>) -> Response {
    if st.store.list().is_empty() {
        return http_error(StatusCode::NOT_FOUND, "no applications found");
    }
    st.manager.start_all();
    http_success("all")
}

async fn stop_all(State(st): State<RestState>) -> Response {
    if st.store.list().is_empty() {
        return http_error(StatusCode::NOT_FOUND, "no applications found");
    }
    st.manager.stop_all();
    http_success("all")
}

async fn restart_all(State(st): State<RestState>) -> Response {
    if st.store.list().is_empty() {
        return http_error(StatusCode::NOT_FOUND, "no applications found");
    }
    st.manager.restart_all();
    http_success("all")
}

async fn status_all(State(st): State<RestState>) -> Response {
    let all = st.manager.status_all();
    if all.is_empty() {
        return http_error(StatusCode::NOT_FOUND, "status: no applications found");
    }
    Json(all).into_response()
}

async fn status_one(State(st): State<RestState>, AxumPath(name): AxumPath<String>) -> Response {
    let Some(app) = st.store.get(&name) else {
        return http_error(StatusCode::NOT_FOUND, "application not found");
    };
    match st.manager.status(&app.name) {
        Some(status) => Json(status).into_response(),
        None => http_error(StatusCode::NOT_FOUND, "application not found"),
    }
}

async fn get_version() -> Response {
    Json(json!({"version": build_info::version()})).into_response()
}
