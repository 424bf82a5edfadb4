use crate::error::ApiError;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::future;
use std::str::FromStr;
use sundial_core::UserId;

/// Caller identity from `x-user-id`. An upstream gateway is trusted to set it.
#[derive(Debug, Copy, Clone)]
pub struct UserIdHeader(pub UserId);

impl<S> FromRequestParts<S> for UserIdHeader
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    #[tracing::instrument(level = "debug", name = "extract.user_id", skip_all)]
    fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> impl std::future::Future<Output = Result<Self, Self::Rejection>> + Send {
        let res = (|| {
            let raw = parts
                .headers
                .get("x-user-id")
                .ok_or(ApiError::MissingUserId)?
                .to_str()
                .map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
            let user_id =
                UserId::from_str(raw.trim()).map_err(|e| ApiError::InvalidUserId(e.to_string()))?;
            Ok(Self(user_id))
        })();
        future::ready(res)
    }
}
