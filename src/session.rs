//! Session identity carried in a cookie.
//!
//! The session id only correlates requests from one browser with one sandbox.
//! It is not authenticated and is not a security boundary.

use axum_extra::extract::cookie::{Cookie, CookieJar};
use tracing::debug;

pub const SESSION_COOKIE: &str = "session-id";

/// Returns the request's session id, minting one if the cookie is missing,
/// and a jar that (re)sets the cookie on the response.
pub fn resolve(jar: CookieJar) -> (CookieJar, String) {
    let session = match jar.get(SESSION_COOKIE).map(Cookie::value) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            let minted = mint();
            debug!(session = %minted, "Minted session");
            minted
        }
    };
    let cookie = Cookie::build((SESSION_COOKIE, session.clone()))
        .path("/")
        .http_only(true)
        .permanent();
    (jar.add(cookie), session)
}

fn mint() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
