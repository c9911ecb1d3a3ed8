//! Caller identity from the `x-user` / `x-role` headers set by the auth proxy.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::error::AppError;
use crate::model::{Identity, Role};

pub const USER_HEADER: &str = "x-user";
pub const ROLE_HEADER: &str = "x-role";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn identity(parts: &Parts) -> Result<Option<Identity>, AppError> {
    let Some(user) = header(parts, USER_HEADER) else {
        return Ok(None);
    };
    let role = match header(parts, ROLE_HEADER) {
        Some(raw) => {
            Role::parse(raw).ok_or_else(|| AppError::Unauthorized(format!("unknown role {raw:?}")))?
        }
        None => Role::Viewer,
    };
    Ok(Some(Identity::new(user, role)))
}

/// Required identity; rejects with 401 when absent.
pub struct Caller(pub Identity);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity(parts)?
            .map(Caller)
            .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_HEADER} header")))
    }
}

/// Identity when present; anonymous callers are allowed.
pub struct MaybeCaller(pub Option<Identity>);

impl<S: Send + Sync> FromRequestParts<S> for MaybeCaller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity(parts).map(MaybeCaller)
    }
}
