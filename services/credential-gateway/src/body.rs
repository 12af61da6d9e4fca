//! Request bodies accepted as JSON or form-encoded

use axum::extract::{Form, FromRequest, Json, Request};
use axum::http::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;

use crate::error::GatewayError;

/// Deserializes `application/json` bodies as JSON and everything else as
/// `application/x-www-form-urlencoded`.
pub struct JsonOrForm<T>(pub T);

impl<T, S> FromRequest<S> for JsonOrForm<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = GatewayError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"));

        if is_json {
            let Json(value) = Json::<T>::from_request(req, state)
                .await
                .map_err(|e| GatewayError::BadRequest(e.body_text()))?;
            Ok(JsonOrForm(value))
        } else {
            let Form(value) = Form::<T>::from_request(req, state)
                .await
                .map_err(|e| GatewayError::BadRequest(e.body_text()))?;
            Ok(JsonOrForm(value))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Payload {
        refresh_token: String,
    }

    async fn extract(content_type: &str, body: &'static str) -> Result<Payload, GatewayError> {
        let req = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap();
        JsonOrForm::<Payload>::from_request(req, &())
            .await
            .map(|JsonOrForm(p)| p)
    }

    #[tokio::test]
    async fn accepts_json() {
        let payload = extract("application/json", r#"{"refresh_token":"rt"}"#)
            .await
            .unwrap();
        assert_eq!(payload.refresh_token, "rt");
    }

    #[tokio::test]
    async fn accepts_form() {
        let payload = extract("application/x-www-form-urlencoded", "refresh_token=rt%2B1")
            .await
            .unwrap();
        assert_eq!(payload.refresh_token, "rt+1");
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let err = extract("application/json", "{not json").await.unwrap_err();
        assert!(matches!(err, GatewayError::BadRequest(_)));
    }
}
