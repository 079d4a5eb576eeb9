//! JSON-over-HTTP surface of the network core.
//!
//! Authentication happens upstream; the authenticated user id arrives in
//! the `x-user-id` header and its roles are loaded from the store on every
//! request. Nothing is cached between requests.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::NetworkError;
use crate::graph::tree::TreeNode;
use crate::network::{LeaderGroup, NetworkService};
use crate::types::{Actor, EdgeRole, Guest, GuestId, Role, UserId};

/// Header carrying the upstream-authenticated user id.
pub const ACTOR_HEADER: &str = "x-user-id";

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub struct AppState {
    pub service: Mutex<NetworkService>,
}

impl AppState {
    pub fn new(service: NetworkService) -> Arc<Self> {
        Arc::new(Self {
            service: Mutex::new(service),
        })
    }
}

// ---------------------------------------------------------------------------
// JSON types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignRequest {
    pub user_id: UserId,
    pub leader_id: UserId,
}

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MessageJson {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct DescendantsJson {
    pub root: UserId,
    pub ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
struct ErrorJson {
    error: String,
    code: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct RoleQuery {
    pub role: Option<String>,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A [`NetworkError`] (or missing identity) rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn unauthenticated(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "unauthenticated",
            message: message.into(),
        }
    }
}

impl From<NetworkError> for ApiError {
    fn from(err: NetworkError) -> Self {
        let status = match &err {
            NetworkError::NotFound { .. } => StatusCode::NOT_FOUND,
            NetworkError::CycleRejected { .. } | NetworkError::InvalidInput(_) => {
                StatusCode::BAD_REQUEST
            }
            NetworkError::OutOfScope { .. } => StatusCode::FORBIDDEN,
            NetworkError::Config(_)
            | NetworkError::Database(_)
            | NetworkError::Io(_)
            | NetworkError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %err, "request failed");
        }
        let message = if status.is_server_error() {
            "internal server error".to_string()
        } else {
            err.to_string()
        };
        Self {
            status,
            code: err.code(),
            message,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorJson {
            error: self.message,
            code: self.code,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn current_actor(service: &NetworkService, headers: &HeaderMap) -> Result<Actor, ApiError> {
    let raw = headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthenticated(format!("missing {ACTOR_HEADER} header")))?;
    let id: UserId = raw
        .trim()
        .parse()
        .map_err(|_| ApiError::unauthenticated(format!("malformed {ACTOR_HEADER} header")))?;
    service.actor(id).map_err(|err| match err {
        NetworkError::NotFound { .. } => ApiError::unauthenticated("unknown actor"),
        other => other.into(),
    })
}

fn parse_edge_role(raw: Option<&str>) -> Result<Option<EdgeRole>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => EdgeRole::from_str_loose(s)
            .map(Some)
            .ok_or_else(|| NetworkError::InvalidInput(format!("unknown edge role '{s}'")).into()),
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> Json<MessageJson> {
    Json(MessageJson {
        message: "ok".into(),
    })
}

async fn get_tree(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
) -> ApiResult<TreeNode> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    Ok(Json(service.tree(&actor, user_id)?))
}

async fn get_descendants(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
    Query(query): Query<RoleQuery>,
) -> ApiResult<DescendantsJson> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    let role = parse_edge_role(query.role.as_deref())?;
    let ids = service.descendants(&actor, user_id, role)?;
    Ok(Json(DescendantsJson {
        root: user_id,
        ids: ids.into_iter().collect(),
    }))
}

async fn assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AssignRequest>,
) -> ApiResult<MessageJson> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    service.assign(&actor, req.user_id, req.leader_id)?;
    Ok(Json(MessageJson {
        message: format!("user {} assigned to leader {}", req.user_id, req.leader_id),
    }))
}

async fn remove(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(user_id): Path<UserId>,
) -> ApiResult<MessageJson> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    let message = if service.remove(&actor, user_id)? {
        format!("user {user_id} removed from its leader")
    } else {
        format!("user {user_id} had no leader assigned")
    };
    Ok(Json(MessageJson { message }))
}

async fn list_guests(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<Vec<Guest>> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    Ok(Json(service.guests(&actor)?))
}

async fn get_guest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(guest_id): Path<GuestId>,
) -> ApiResult<Guest> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    Ok(Json(service.guest(&actor, guest_id)?))
}

async fn guests_by_leader(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<RoleQuery>,
) -> ApiResult<Vec<LeaderGroup>> {
    let service = state.service.lock().await;
    let actor = current_actor(&service, &headers)?;
    let role = match query.role.as_deref() {
        None => Role::LeaderOfTwelve,
        Some(s) => Role::from_str_loose(s)
            .ok_or_else(|| NetworkError::InvalidInput(format!("unknown role '{s}'")))?,
    };
    Ok(Json(service.guests_by_leader(&actor, role)?))
}

// ---------------------------------------------------------------------------
// Server entry point
// ---------------------------------------------------------------------------

/// Build the API router (extracted for testability).
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/network/assign", post(assign))
        .route("/network/remove/{user_id}", delete(remove))
        .route("/network/{user_id}", get(get_tree))
        .route("/network/{user_id}/descendants", get(get_descendants))
        .route("/guests", get(list_guests))
        .route("/guests/{guest_id}", get(get_guest))
        .route("/reports/guests-by-leader", get(guests_by_leader))
        .with_state(state)
}

/// Serve the API until ctrl-c.
pub async fn run_http_server(
    service: NetworkService,
    addr: SocketAddr,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(AppState::new(service));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("church-network API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down HTTP server");
        })
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::NetworkConfig;
    use crate::db::schema::initialize_database;
    use crate::graph::store::HierarchyStore;
    use crate::types::NewGuest;
    use crate::types::NewUser;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    struct Fixture {
        state: Arc<AppState>,
        pastor: UserId,
        a: UserId,
        b: UserId,
        c: UserId,
        outsider: UserId,
        admin: UserId,
        foreign_guest: GuestId,
    }

    fn fixture() -> Fixture {
        let store = HierarchyStore::from_connection(initialize_database(":memory:").unwrap());
        let add = |name: &str, roles: &[Role]| {
            store
                .insert_user(&NewUser::new(name, format!("{name}@iglesia.org"), roles))
                .unwrap()
                .id
        };
        let pastor = add("pastor", &[Role::Pastor]);
        let a = add("a", &[Role::LeaderOfTwelve]);
        let b = add("b", &[Role::CellLeader]);
        let c = add("c", &[Role::Disciple]);
        let outsider = add("outsider", &[Role::CellLeader]);
        let admin = add("admin", &[Role::Admin]);
        store.set_parent(a, pastor, EdgeRole::LeaderOfTwelve).unwrap();
        store.set_parent(b, a, EdgeRole::Disciple).unwrap();
        store.set_parent(c, b, EdgeRole::Disciple).unwrap();
        let foreign_guest = store
            .insert_guest(&NewGuest {
                name: "foreign".into(),
                phone: None,
                assigned_to_id: Some(outsider),
                invited_by_id: None,
            })
            .unwrap()
            .id;

        let service = NetworkService::new(store, &NetworkConfig::default());
        Fixture {
            state: AppState::new(service),
            pastor,
            a,
            b,
            c,
            outsider,
            admin,
            foreign_guest,
        }
    }

    fn as_user(id: UserId) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACTOR_HEADER, id.to_string().parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn tree_endpoint_returns_nested_disciples() {
        let f = fixture();
        let Json(tree) = get_tree(State(f.state.clone()), as_user(f.a), Path(f.a))
            .await
            .unwrap();
        assert_eq!(tree.id, f.a);
        assert_eq!(tree.disciples.len(), 1);
        assert_eq!(tree.disciples[0].id, f.b);
        assert_eq!(tree.disciples[0].disciples[0].id, f.c);
    }

    #[tokio::test]
    async fn missing_or_unknown_actor_is_unauthorized() {
        let f = fixture();
        let err = get_tree(State(f.state.clone()), HeaderMap::new(), Path(f.a))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        let err = get_tree(State(f.state.clone()), as_user(4242), Path(f.a))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn descendants_endpoint_filters_by_role() {
        let f = fixture();
        let query = RoleQuery {
            role: Some("leader_of_twelve".into()),
        };
        let Json(body) = get_descendants(
            State(f.state.clone()),
            as_user(f.pastor),
            Path(f.pastor),
            Query(query),
        )
        .await
        .unwrap();
        assert_eq!(body.ids, vec![f.a]);

        let bad = RoleQuery {
            role: Some("bishop".into()),
        };
        let err = get_descendants(State(f.state.clone()), as_user(f.pastor), Path(f.pastor), Query(bad))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn assign_cycle_is_bad_request() {
        let f = fixture();
        let req = AssignRequest {
            user_id: f.a,
            leader_id: f.c,
        };
        let err = assign(State(f.state.clone()), as_user(f.a), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "cycle_rejected");
    }

    #[tokio::test]
    async fn assign_to_leader_outside_scope_is_bad_request() {
        let f = fixture();
        let req = AssignRequest {
            user_id: f.c,
            leader_id: f.outsider,
        };
        let err = assign(State(f.state.clone()), as_user(f.a), Json(req))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn assign_then_remove() {
        let f = fixture();
        let req = AssignRequest {
            user_id: f.c,
            leader_id: f.a,
        };
        let Json(msg) = assign(State(f.state.clone()), as_user(f.pastor), Json(req))
            .await
            .unwrap();
        assert!(msg.message.contains("assigned"));

        let Json(msg) = remove(State(f.state.clone()), as_user(f.pastor), Path(f.c))
            .await
            .unwrap();
        assert!(msg.message.contains("removed"));

        // Detached, c has left the pastor's network.
        let err = remove(State(f.state.clone()), as_user(f.pastor), Path(f.c))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let Json(msg) = remove(State(f.state.clone()), as_user(f.admin), Path(f.c))
            .await
            .unwrap();
        assert!(msg.message.contains("no leader"));
    }

    #[tokio::test]
    async fn foreign_guest_is_forbidden_not_missing() {
        let f = fixture();
        let err = get_guest(State(f.state.clone()), as_user(f.b), Path(f.foreign_guest))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);

        let err = get_guest(State(f.state.clone()), as_user(f.b), Path(9_999))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(visible) = list_guests(State(f.state.clone()), as_user(f.b)).await.unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn report_defaults_to_leader_of_twelve() {
        let f = fixture();
        let Json(groups) = guests_by_leader(
            State(f.state.clone()),
            as_user(f.outsider),
            Query(RoleQuery { role: None }),
        )
        .await
        .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].guests.len(), 1);
    }

    #[tokio::test]
    async fn error_response_has_json_body() {
        let response = ApiError::from(NetworkError::OutOfScope {
            entity: "guest",
            id: 1,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let internal = ApiError::from(NetworkError::Other("boom".into()));
        assert_eq!(internal.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(internal.message, "internal server error");
    }

    #[tokio::test]
    async fn health_is_ok() {
        let Json(msg) = health().await;
        assert_eq!(msg.message, "ok");
    }

    async fn send(router: Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
    }

    #[tokio::test]
    async fn router_dispatches_path_and_method() {
        let f = fixture();
        let router = build_router(f.state.clone());

        let get_tree = Request::get(format!("/network/{}", f.a))
            .header(ACTOR_HEADER, f.a.to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), get_tree).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], f.a);
        assert_eq!(body["disciples"][0]["id"], f.b);

        let descendants = Request::get(format!("/network/{}/descendants?role=disciple", f.a))
            .header(ACTOR_HEADER, f.a.to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), descendants).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ids"], serde_json::json!([f.b, f.c]));

        let assign = Request::post("/network/assign")
            .header(ACTOR_HEADER, f.pastor.to_string())
            .header("content-type", "application/json")
            .body(Body::from(format!(r#"{{"userId":{},"leaderId":{}}}"#, f.c, f.a)))
            .unwrap();
        let (status, body) = send(router.clone(), assign).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("assigned"));

        let anonymous = Request::get(format!("/network/{}", f.a))
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(router.clone(), anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthenticated");

        let unknown = Request::get("/nowhere").body(Body::empty()).unwrap();
        let (status, _) = send(router, unknown).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
