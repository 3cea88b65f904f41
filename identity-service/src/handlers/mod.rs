//! HTTP handlers for identity-service.

pub mod auth;
pub mod member;
pub mod oidc;
pub mod permission;
pub mod role;

use axum::{extract::ConnectInfo, http::HeaderMap};
use std::net::SocketAddr;

use crate::models::ClientMeta;

/// User agent and client address recorded with issued credentials.
pub(crate) fn client_meta(
    headers: &HeaderMap,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> ClientMeta {
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.chars().take(512).collect());

    let ip_address = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.ip().to_string()));

    ClientMeta::new(user_agent, ip_address)
}
