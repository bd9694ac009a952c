pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod services;
pub mod utils;

use axum::{
    extract::State,
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::{from_fn, from_fn_with_state},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::IdentityConfig;
use crate::middleware::{ip_rate_limit_middleware, ScopedRateLimit, API_KEY_HEADER};
use crate::repository::{CounterStore, Repositories, RevocationStore, StoreHealth};
use crate::services::{
    ApiKeyService, AuditSink, AuthService, AuthorizationCodeService, JwtService, OAuthService,
    RateLimitScope, RateLimiter, RbacService, RevocationService, RotationService,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::auth::register,
        handlers::auth::login,
        handlers::auth::me,
        handlers::oauth::authorize,
        handlers::oauth::token,
        handlers::oauth::revoke,
        handlers::sessions::revoke_user_sessions,
        handlers::sessions::revoke_org_sessions,
        handlers::sessions::revoke_member_sessions,
        handlers::organizations::create_organization,
        handlers::organizations::add_member,
        handlers::organizations::remove_member,
        handlers::organizations::list_roles,
        handlers::organizations::create_role,
        handlers::organizations::assign_permissions,
        handlers::organizations::create_permission,
        handlers::organizations::effective_permissions,
        handlers::api_keys::create_api_key,
        handlers::api_keys::revoke_api_key,
        handlers::clients::create_client,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::RegisterResponse,
            dtos::auth::LoginRequest,
            dtos::auth::MeResponse,
            dtos::auth::PrincipalKind,
            dtos::oauth::TokenRequest,
            dtos::oauth::RevokeTokenRequest,
            dtos::oauth::CreateClientRequest,
            dtos::oauth::CreateClientResponse,
            dtos::rbac::CreateOrganizationRequest,
            dtos::rbac::AddMemberRequest,
            dtos::rbac::CreatePermissionRequest,
            dtos::rbac::CreateRoleRequest,
            dtos::rbac::AssignPermissionsRequest,
            dtos::rbac::EffectivePermissionsResponse,
            dtos::rbac::CreateApiKeyRequest,
            dtos::rbac::CreateApiKeyResponse,
            dtos::rbac::SessionsRevokedResponse,
            services::TokenResponse,
            models::Organization,
            models::OrganizationStatus,
            models::Membership,
            models::MembershipStatus,
            models::Role,
            models::Permission,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Authentication", description = "Registration, password login and the current principal"),
        (name = "OAuth", description = "Authorization code + PKCE, token and revocation endpoints"),
        (name = "Sessions", description = "Bulk session revocation"),
        (name = "Organizations", description = "Organizations and memberships"),
        (name = "RBAC", description = "Roles, permissions and their resolution"),
        (name = "API Keys", description = "Organization API keys"),
        (name = "Admin", description = "Administrative operations"),
        (name = "Observability", description = "Service health"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(API_KEY_HEADER))),
            );
        }
    }
}

/// Storage backends the services are built on.
#[derive(Clone)]
pub struct Backends {
    pub repos: Repositories,
    pub revocation: Arc<dyn RevocationStore>,
    pub counters: Arc<dyn CounterStore>,
    /// Health of the store behind `revocation` and `counters`
    pub cache_health: Arc<dyn StoreHealth>,
}

#[derive(Clone)]
pub struct AppState {
    pub config: IdentityConfig,
    pub health: Vec<(&'static str, Arc<dyn StoreHealth>)>,
    pub rbac: RbacService,
    pub oauth: OAuthService,
    pub auth: AuthService,
    pub revocation: RevocationService,
    pub api_keys: ApiKeyService,
    pub rate_limiter: RateLimiter,
}

impl AppState {
    /// Wire every service onto the given backends.
    pub fn new(
        config: IdentityConfig,
        backends: Backends,
        jwt: JwtService,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let timeout = config.store.timeout();
        let repos = backends.repos;

        let rbac = RbacService::new(repos.clone(), audit.clone(), timeout);
        let rotation = RotationService::new(
            repos.refresh_tokens.clone(),
            rbac.clone(),
            jwt,
            audit.clone(),
            chrono::Duration::days(config.jwt.refresh_token_expiry_days),
            timeout,
        );
        let codes = AuthorizationCodeService::new(
            repos.codes.clone(),
            repos.refresh_tokens.clone(),
            audit.clone(),
            chrono::Duration::seconds(config.oauth.authorization_code_ttl_seconds),
            timeout,
        );
        let oauth = OAuthService::new(
            repos.clients.clone(),
            codes,
            rotation.clone(),
            rbac.clone(),
            timeout,
        );
        let auth = AuthService::new(
            repos.users.clone(),
            oauth.clone(),
            rotation.clone(),
            audit.clone(),
            timeout,
        );
        let revocation = RevocationService::new(backends.revocation, rotation, audit.clone(), timeout);
        let api_keys = ApiKeyService::new(repos.api_keys.clone(), audit.clone(), timeout);
        let rate_limiter = RateLimiter::new(backends.counters, config.rate_limit.clone(), audit, timeout);

        Self {
            health: vec![("database", repos.health.clone()), ("cache", backends.cache_health)],
            config,
            rbac,
            oauth,
            auth,
            revocation,
            api_keys,
            rate_limiter,
        }
    }
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let trusted_proxies: Arc<[std::net::IpAddr]> = state.config.security.trusted_proxies.clone().into();
    let limited = |scope: RateLimitScope| {
        ScopedRateLimit::new(state.rate_limiter.clone(), scope, trusted_proxies.clone())
    };

    // Unauthenticated routes, each limited per caller IP in its own scope
    let register_route = Router::new()
        .route("/auth/register", post(handlers::register))
        .layer(from_fn_with_state(
            limited(RateLimitScope::Registration),
            ip_rate_limit_middleware,
        ));

    let login_route = Router::new()
        .route("/auth/login", post(handlers::login))
        .layer(from_fn_with_state(
            limited(RateLimitScope::Login),
            ip_rate_limit_middleware,
        ));

    let token_route = Router::new()
        .route("/oauth/token", post(handlers::token))
        .layer(from_fn_with_state(
            limited(RateLimitScope::OAuthToken),
            ip_rate_limit_middleware,
        ));

    let authenticated_routes = Router::new()
        .route("/auth/me", get(handlers::me))
        .route("/oauth/authorize", get(handlers::authorize))
        .route("/oauth/revoke", post(handlers::revoke))
        .route(
            "/users/:user_id/sessions/revoke",
            post(handlers::revoke_user_sessions),
        )
        .route("/orgs", post(handlers::create_organization))
        .route("/orgs/:org_id/members", post(handlers::add_member))
        .route("/orgs/:org_id/members/:user_id", delete(handlers::remove_member))
        .route(
            "/orgs/:org_id/members/:user_id/permissions",
            get(handlers::effective_permissions),
        )
        .route(
            "/orgs/:org_id/members/:user_id/sessions/revoke",
            post(handlers::revoke_member_sessions),
        )
        .route(
            "/orgs/:org_id/roles",
            get(handlers::list_roles).post(handlers::create_role),
        )
        .route(
            "/orgs/:org_id/roles/:role_id/permissions",
            post(handlers::assign_permissions),
        )
        .route("/orgs/:org_id/permissions", post(handlers::create_permission))
        .route("/orgs/:org_id/sessions/revoke", post(handlers::revoke_org_sessions))
        .route("/orgs/:org_id/api-keys", post(handlers::create_api_key))
        .route(
            "/orgs/:org_id/api-keys/:key_id",
            delete(handlers::revoke_api_key),
        )
        .route("/admin/clients", post(handlers::create_client))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ));

    let allowed_origins = state
        .config
        .security
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<HeaderValue>>();

    let app = Router::new()
        .route("/health", get(health_check))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(register_route)
        .merge(login_route)
        .merge(token_route)
        .merge(authenticated_routes)
        .with_state(state)
        // Add tracing layer
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri().path(),
                    version = ?request.version(),
                )
            },
        ))
        // Add tracing middleware for request_id
        .layer(from_fn(request_id_middleware))
        .layer(
            CorsLayer::new()
                .allow_origin(allowed_origins)
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    header::AUTHORIZATION,
                    header::CONTENT_TYPE,
                    HeaderName::from_static(API_KEY_HEADER),
                    HeaderName::from_static(handlers::DEVICE_ID_HEADER),
                ]),
        );

    Ok(app)
}

/// Service health check
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A backing store is unreachable")
    ),
    tag = "Observability"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = serde_json::Map::new();
    let mut healthy = true;

    for (name, store) in &state.health {
        let status = match store.health_check().await {
            Ok(()) => "up",
            Err(e) => {
                tracing::error!(store = %name, error = %e, "Health check failed");
                healthy = false;
                "down"
            }
        };
        checks.insert(name.to_string(), serde_json::Value::from(status));
    }

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(serde_json::json!({
            "status": if healthy { "healthy" } else { "unhealthy" },
            "service": state.config.service_name,
            "version": state.config.service_version,
            "environment": format!("{:?}", state.config.environment),
            "checks": checks,
        })),
    )
}
