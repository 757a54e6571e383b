//! HTTP facade exposing liveness and health of the worker.
use std::{collections::BTreeMap, convert::Infallible, future::Future, net::TcpListener, sync::Arc};

use chrono::Utc;
use hyper::{
    Body, Method, Request, Response, Server, StatusCode,
    header::{CONTENT_TYPE, HeaderValue},
    service::{make_service_fn, service_fn},
};
use serde_json::{Map, Value, json};
use tokio::task;
use tracing::{debug, error, info};

use crate::{
    constants::{ROOT_MESSAGE, SERVICE_RUNNING, SERVICE_STOPPED},
    probe::ServiceHealth,
    store::ObjectStore,
    supervisor::ServiceSupervisor,
};

/// Everything a request handler needs, shared across connections.
pub struct ServerState {
    /// Supervisor owning the dependent services.
    pub supervisor: Arc<ServiceSupervisor>,
    /// Object store checked by `/health`.
    pub store: Arc<dyn ObjectStore>,
    /// Port reported by `/`.
    pub port: u16,
}

/// Reference-counted handler state.
pub type SharedState = Arc<ServerState>;

/// Serves the facade on `listener` until `shutdown` resolves.
pub async fn serve<F>(
    listener: TcpListener,
    state: SharedState,
    shutdown: F,
) -> Result<(), hyper::Error>
where
    F: Future<Output = ()>,
{
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle_request(req, state.clone())))
        }
    });

    let server = Server::from_tcp(listener)?.serve(make_svc);
    info!("HTTP facade listening on http://{}", server.local_addr());

    server.with_graceful_shutdown(shutdown).await
}

/// Routes a single request.
pub async fn handle_request(
    req: Request<Body>,
    state: SharedState,
) -> Result<Response<Body>, Infallible> {
    debug!("{} {}", req.method(), req.uri().path());

    if req.method() != Method::GET {
        return Ok(json_error(
            StatusCode::METHOD_NOT_ALLOWED,
            &format!("method {} not allowed", req.method()),
        ));
    }

    let response = match req.uri().path() {
        "/" => json_response(StatusCode::OK, &root_report(&state)),
        "/health" => {
            let (status, body) = health_report(state).await;
            json_response(status, &body)
        }
        path => json_error(StatusCode::NOT_FOUND, &format!("no route for {path}")),
    };
    Ok(response)
}

/// Body of `GET /`: liveness and URL of every dependent. Never probes.
pub fn root_report(state: &ServerState) -> Value {
    let mut body = Map::new();
    body.insert("message".into(), json!(ROOT_MESSAGE));
    body.insert("port".into(), json!(state.port));

    for service in state.supervisor.services() {
        let name = &service.spec.name;
        let status = if service.running {
            SERVICE_RUNNING
        } else {
            SERVICE_STOPPED
        };
        body.insert(format!("{name}Service"), json!(status));
        body.insert(format!("{name}ServiceUrl"), json!(service.spec.url));
    }

    Value::Object(body)
}

/// Status and body of `GET /health`. 200 only when everything is healthy.
pub async fn health_report(state: SharedState) -> (StatusCode, Value) {
    let services = {
        let state = state.clone();
        task::spawn_blocking(move || state.supervisor.check_health())
    };
    let store = {
        let state = state.clone();
        task::spawn_blocking(move || state.store.ping())
    };

    let (services, store) = tokio::join!(services, store);
    let services: BTreeMap<String, ServiceHealth> = match services {
        Ok(Ok(services)) => services,
        Ok(Err(err)) => return internal_error(&state, &err.to_string()),
        Err(err) => return internal_error(&state, &err.to_string()),
    };
    let store_reachable = match store {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!("Object store is unreachable: {err}");
            false
        }
        Err(err) => return internal_error(&state, &err.to_string()),
    };

    let healthy = store_reachable && services.values().all(|health| health.healthy);
    let mut body = Map::new();
    body.insert(
        "status".into(),
        json!(if healthy { "healthy" } else { "unhealthy" }),
    );
    body.insert("nodeService".into(), json!(true));
    for (name, health) in &services {
        body.insert(format!("{name}Service"), json!(health.healthy));
    }
    body.insert("objectStoreReachable".into(), json!(store_reachable));
    body.insert("projectId".into(), json!(state.store.project_id()));
    body.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Value::Object(body))
}

fn internal_error(state: &ServerState, message: &str) -> (StatusCode, Value) {
    error!("Health check failed: {message}");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        json!({
            "status": "unhealthy",
            "nodeService": true,
            "projectId": state.store.project_id(),
            "timestamp": Utc::now().to_rfc3339(),
            "error": message,
        }),
    )
}

fn json_response(status: StatusCode, body: &Value) -> Response<Body> {
    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    json_response(status, &json!({ "error": message }))
}
