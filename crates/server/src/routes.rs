//! Route configuration.

use crate::auth::{acl_middleware, auth_middleware};
use crate::handlers;
use crate::state::AppState;
use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    // Registry protocol. Reads are open; the ACL gates every other method
    // on token subject == <username>.
    let registry_routes = Router::new()
        .route("/", get(handlers::common::api_version))
        .route("/_catalog", get(handlers::catalog::catalog))
        .route("/_search", get(handlers::catalog::search_namespaces))
        .route(
            "/{username}/{imagename}/tags/list",
            get(handlers::catalog::list_tags),
        )
        .route(
            "/{username}/{imagename}/manifests/{reference}",
            get(handlers::manifests::get_manifest)
                .head(handlers::manifests::head_manifest)
                .put(handlers::manifests::put_manifest)
                .delete(handlers::manifests::delete_manifest),
        )
        .route(
            "/{username}/{imagename}/blobs/{digest}",
            get(handlers::blobs::get_blob)
                .head(handlers::blobs::head_blob)
                .delete(handlers::blobs::delete_blob),
        )
        .route(
            "/{username}/{imagename}/blobs/uploads/",
            post(handlers::uploads::start_upload),
        )
        .route(
            "/{username}/{imagename}/blobs/uploads/{uuid}",
            patch(handlers::uploads::patch_upload)
                .get(handlers::uploads::get_upload_progress)
                .put(handlers::uploads::put_upload)
                .delete(handlers::uploads::cancel_upload),
        )
        .route_layer(middleware::from_fn(acl_middleware));

    let auth_routes = Router::new()
        .route("/signup", post(handlers::auth::signup))
        .route("/signin", post(handlers::auth::signin))
        .route("/signout", post(handlers::auth::signout))
        .route("/reset-password", post(handlers::auth::reset_password))
        .route("/user", delete(handlers::auth::delete_user));

    Router::new()
        .nest("/v2", registry_routes)
        .nest("/auth", auth_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
