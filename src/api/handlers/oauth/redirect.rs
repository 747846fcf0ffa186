//! Redirect responses that close a federation flow.

use axum::{
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use url::Url;

use super::{
    errors::ApiError,
    state::OAuthState,
    state_token::{SourceType, StateClaims},
    utils::{CLIENT_COOKIE_NAME, CSRF_COOKIE_NAME, build_cookie, generate_token},
};
use crate::store::models::{Client, Session};

/// `status` redirect to `location`. An unencodable location becomes an
/// internal error rather than a broken header.
pub fn redirect(status: StatusCode, location: &str, cookies: Vec<HeaderValue>) -> Response {
    let Ok(location) = HeaderValue::from_str(location) else {
        warn!("refusing to redirect to unencodable location");
        return ApiError::Unexpected(anyhow::anyhow!("invalid redirect location")).into_response();
    };
    let mut headers = HeaderMap::new();
    headers.insert(LOCATION, location);
    for cookie in cookies {
        headers.append(SET_COOKIE, cookie);
    }
    (status, headers).into_response()
}

pub fn see_other(location: &str) -> Response {
    redirect(StatusCode::SEE_OTHER, location, Vec::new())
}

/// Where connect/reauthorize flows and completed replays go.
#[must_use]
pub fn completion_target(claims: &StateClaims) -> &str {
    claims
        .action_complete_redirect_url
        .as_deref()
        .unwrap_or(&claims.redirect_url)
}

/// Redirect for outcomes that did not produce a session.
#[must_use]
pub fn outcome_redirect(claims: &StateClaims) -> Response {
    match claims.source_type {
        SourceType::Connect | SourceType::Reauthorize => see_other(completion_target(claims)),
        SourceType::SignIn | SourceType::SignUp => see_other(&claims.redirect_url),
    }
}

/// Build the redirect that hands a new session to the client.
///
/// Native clients get a single-use nonce instead of a cookie; the nonce is
/// only appended when the target URL is trusted by the instance.
///
/// # Errors
/// `RedirectUrlMismatch` for an untrusted native target, store failures
/// while saving the client nonce.
pub async fn session_redirect(
    state: &OAuthState,
    claims: &StateClaims,
    mut client: Client,
    session: &Session,
    now: DateTime<Utc>,
) -> Result<Response, ApiError> {
    let instance = state.instance();
    let target = completion_target(claims);
    let mut url = Url::parse(target)
        .map_err(|_| ApiError::RedirectUrlMismatch(target.to_string()))?;
    url.query_pairs_mut()
        .append_pair("created_session_id", &session.id.to_string());

    let max_age = instance.session_lifetime().num_seconds();
    let csrf = build_cookie(instance, CSRF_COOKIE_NAME, &generate_token()?, max_age, false)
        .map_err(|err| ApiError::Unexpected(err.into()))?;

    if claims.is_native() {
        if !instance.is_redirect_url_trusted(target) {
            return Err(ApiError::RedirectUrlMismatch(target.to_string()));
        }
        let nonce = generate_token()?;
        client.rotating_token_nonce = Some(nonce.clone());
        client.updated_at = now;
        let mut tx = state.store().begin().await?;
        tx.save_client(&client).await?;
        tx.commit().await?;

        url.query_pairs_mut().append_pair("rotating_token_nonce", &nonce);
        debug!(client_id = %client.id, "native session redirect with handshake nonce");
        return Ok(redirect(
            StatusCode::TEMPORARY_REDIRECT,
            url.as_str(),
            vec![csrf],
        ));
    }

    if let (false, Some(hop)) = (
        instance.environment().is_production(),
        instance.dev_cookie_hop_url(),
    ) {
        let mut hop = Url::parse(hop).map_err(|err| ApiError::Unexpected(err.into()))?;
        hop.query_pairs_mut()
            .append_pair("redirect_url", url.as_str())
            .append_pair("client_token", &client.rotating_token);
        return Ok(redirect(
            StatusCode::TEMPORARY_REDIRECT,
            hop.as_str(),
            vec![csrf],
        ));
    }

    let client_cookie = build_cookie(
        instance,
        CLIENT_COOKIE_NAME,
        &client.rotating_token,
        max_age,
        true,
    )
    .map_err(|err| ApiError::Unexpected(err.into()))?;
    Ok(redirect(
        StatusCode::TEMPORARY_REDIRECT,
        url.as_str(),
        vec![client_cookie, csrf],
    ))
}
