use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use validator::Validate;

/// JSON body that passed its `validator` rules.
///
/// Rejections use the `AppError` envelope: malformed bodies are 400,
/// rule violations are 422 with the failing fields under `details`.
pub struct ValidatedJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(malformed_body)?;

        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

fn malformed_body(rejection: JsonRejection) -> AppError {
    tracing::debug!(status = %rejection.status(), error = %rejection.body_text(), "Rejected request body");
    AppError::BadRequest(anyhow::anyhow!("Malformed request body: {}", rejection.body_text()))
}
