use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    Json,
};
use serde::de::DeserializeOwned;
use service_core::error::AppError;
use validator::Validate;

/// JSON body extractor that runs `validator` rules before the handler.
///
/// Unreadable bodies are a 400 and rule violations a 422, both in the
/// `AppError` envelope the handlers use. Bodies carry passwords and refresh
/// tokens, so parser output is logged and never echoed to the client.
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
            .map_err(body_rejection)?;
        value.validate()?;
        Ok(ValidatedJson(value))
    }
}

fn body_rejection(rejection: JsonRejection) -> AppError {
    tracing::debug!(error = %rejection, "Rejected request body");
    let reason = match rejection {
        JsonRejection::MissingJsonContentType(_) => "Expected an application/json body",
        JsonRejection::JsonSyntaxError(_) => "Request body is not valid JSON",
        JsonRejection::JsonDataError(_) => "Request body is missing or has mistyped fields",
        _ => "Could not read request body",
    };
    AppError::BadRequest(anyhow::anyhow!(reason))
}
