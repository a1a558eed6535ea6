//! Unit tests for authentication middleware
//!
//! Tests cover:
//! - Bearer header and cookie token extraction
//! - Missing, invalid and expired tokens
//! - Optional authentication on public endpoints

#[cfg(test)]
mod tests {
    use super::super::jwt::JwtManager;
    use super::super::middleware::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        middleware,
        routing::get,
        Extension, Router,
    };
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const SECRET: &str = "test-jwt-secret-key-for-testing-only";

    fn auth_state() -> AuthState {
        AuthState {
            jwt_manager: JwtManager::new(SECRET, 24),
        }
    }

    fn app() -> Router {
        let state = auth_state();
        let protected = Router::new()
            .route(
                "/private",
                get(|Extension(user): Extension<AuthUser>| async move { user.email }),
            )
            .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));
        let public = Router::new()
            .route(
                "/public",
                get(|MaybeAuthUser(user): MaybeAuthUser| async move {
                    user.map(|u| u.email)
                        .unwrap_or_else(|| "anonymous".to_string())
                }),
            )
            .route_layer(middleware::from_fn_with_state(state, optional_auth));
        protected.merge(public)
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn token(email: &str) -> String {
        JwtManager::new(SECRET, 24).issue("user-1", email).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let response = app()
            .oneshot(Request::get("/private").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_bearer_token_authenticates() {
        let response = app()
            .oneshot(
                Request::get("/private")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token("A@B.com")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "a@b.com");
    }

    #[tokio::test]
    async fn test_cookie_token_authenticates() {
        let response = app()
            .oneshot(
                Request::get("/private")
                    .header(
                        header::COOKIE,
                        format!("theme=dark; {}={}", AUTH_COOKIE, token("c@d.com")),
                    )
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "c@d.com");
    }

    #[tokio::test]
    async fn test_foreign_and_expired_tokens_rejected() {
        let foreign = JwtManager::new("other-secret", 24).issue("u", "a@b.com").unwrap();
        let expired = JwtManager::new(SECRET, -2).issue("u", "a@b.com").unwrap();

        for token in [foreign, expired, "invalid.token.here".to_string()] {
            let response = app()
                .oneshot(
                    Request::get("/private")
                        .header(header::AUTHORIZATION, format!("Bearer {}", token))
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn test_optional_auth_passes_anonymous_and_bad_tokens() {
        let response = app()
            .oneshot(Request::get("/public").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "anonymous");

        let response = app()
            .oneshot(
                Request::get("/public")
                    .header(header::AUTHORIZATION, "Bearer nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "anonymous");

        let response = app()
            .oneshot(
                Request::get("/public")
                    .header(header::AUTHORIZATION, format!("Bearer {}", token("e@f.com")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(body_text(response).await, "e@f.com");
    }
}
