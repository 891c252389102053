//! Pulls a credential out of an inbound request's `Authorization` header,
//! supporting both Bearer and Basic schemes.
//!
//! Grounded on the teacher's `http/apikey.rs` and `http/basicauth.rs`
//! extractor pattern: a `TypedHeader<Authorization<_>>` pulled via
//! `RequestExt::extract_parts`, kept fallible and side-effect free.

use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::Authorization;
use axum_extra::headers::authorization::{Basic, Bearer};
use secrecy::SecretString;

use crate::error::{ErrorCode, ProxyError};
use crate::identity::classify::{TokenShape, classify};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Bearer,
    Basic,
}

#[derive(Debug)]
pub struct ExtractedCredential {
    pub scheme: Scheme,
    pub credential: SecretString,
    pub shape: TokenShape,
}

/// Extracts a credential from `parts`, preferring Bearer when both an
/// Authorization header of each precise form could coexist in principle
/// (only one can appear per the HTTP spec, so this is really "parse whatever
/// scheme is present"). For Basic auth, the password field is tried first
/// and the username field second, since both `docker login` and Maven/npm
/// clients variously stash the PAT in either slot.
pub async fn extract_credential(parts: &mut Parts) -> Result<ExtractedCredential, ProxyError> {
    if let Ok(TypedHeader(Authorization(bearer))) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, &()).await
    {
        let credential = SecretString::from(bearer.token().to_string());
        let shape = classify(&credential);
        return Ok(ExtractedCredential { scheme: Scheme::Bearer, credential, shape });
    }

    if let Ok(TypedHeader(Authorization(basic))) =
        TypedHeader::<Authorization<Basic>>::from_request_parts(parts, &()).await
    {
        let password = SecretString::from(basic.password().to_string());
        let password_shape = classify(&password);
        let (credential, shape) = if password_shape != TokenShape::Unknown {
            (password, password_shape)
        } else {
            let username = SecretString::from(basic.username().to_string());
            let username_shape = classify(&username);
            (username, username_shape)
        };
        return Ok(ExtractedCredential { scheme: Scheme::Basic, credential, shape });
    }

    if parts.headers.contains_key(axum::http::header::AUTHORIZATION) {
        return Err(ProxyError::new(
            ErrorCode::AuthHeaderUnsupported,
            "unsupported Authorization scheme",
        ));
    }

    Err(ProxyError::new(ErrorCode::AuthHeaderMissing, "Authorization header is required"))
}

// axum_extra's TypedHeader implements `FromRequestParts`; bring the trait
// into scope locally rather than at module level to keep the import list
// honest about what each function actually needs.
use axum::extract::FromRequestParts;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    async fn parts_with_auth(value: &str) -> Parts {
        let req = Request::builder()
            .header(axum::http::header::AUTHORIZATION, value)
            .body(())
            .unwrap();
        req.into_parts().0
    }

    #[tokio::test]
    async fn extracts_bearer_and_classifies() {
        let token = format!("ghp_{}", "a".repeat(36));
        let mut parts = parts_with_auth(&format!("Bearer {token}")).await;
        let extracted = extract_credential(&mut parts).await.unwrap();
        assert_eq!(extracted.scheme, Scheme::Bearer);
        assert_eq!(extracted.shape, TokenShape::Pat);
    }

    #[tokio::test]
    async fn basic_prefers_password_field() {
        let token = format!("ghp_{}", "a".repeat(36));
        let basic_value = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("x-access-token:{token}"),
        );
        let mut parts = parts_with_auth(&format!("Basic {basic_value}")).await;
        let extracted = extract_credential(&mut parts).await.unwrap();
        assert_eq!(extracted.scheme, Scheme::Basic);
        assert_eq!(extracted.shape, TokenShape::Pat);
    }

    #[tokio::test]
    async fn missing_header_is_rejected() {
        let req = Request::builder().body(()).unwrap();
        let mut parts = req.into_parts().0;
        let err = extract_credential(&mut parts).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AuthHeaderMissing);
    }
}
