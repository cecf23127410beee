//! Authentication hook for the relay.
//!
//! The relay consults an [`Authenticator`] before completing the
//! WebSocket upgrade. The crate ships HTTP Basic authentication with a
//! pluggable credential verifier; real verifiers (LDAP self-bind and the
//! like) live outside this crate and implement [`BasicVerifier`].

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::prelude::*;

/// Pre-upgrade authentication hook.
pub trait Authenticator: Send + Sync {
	/// `None` lets the handshake proceed; `Some` aborts it with the
	/// returned response.
	fn authenticate(&self, path: &str, headers: &HeaderMap) -> Option<Response>;
}

/// Credential check behind [`BasicAuth`].
pub trait BasicVerifier: Send + Sync {
	fn verify(&self, username: &str, password: &str) -> bool;
}

/// HTTP Basic authentication over any [`BasicVerifier`].
pub struct BasicAuth<V> {
	realm: String,
	verifier: V,
}

impl<V: BasicVerifier> BasicAuth<V> {
	pub fn new(realm: impl Into<String>, verifier: V) -> Self {
		Self { realm: realm.into(), verifier }
	}

	fn abort(&self, reason: &str) -> Response {
		debug!(realm = %self.realm, "{}", reason);
		let mut response = (StatusCode::UNAUTHORIZED, reason.to_string()).into_response();
		if let Ok(value) = HeaderValue::from_str(&format!("Basic realm={}", self.realm)) {
			response.headers_mut().insert(header::WWW_AUTHENTICATE, value);
		}
		response
	}
}

impl<V: BasicVerifier> Authenticator for BasicAuth<V> {
	fn authenticate(&self, _path: &str, headers: &HeaderMap) -> Option<Response> {
		let Some(value) = headers.get(header::AUTHORIZATION) else {
			return Some(self.abort("missing Authorization header"));
		};
		let Ok(value) = value.to_str() else {
			return Some(self.abort("malformed Authorization header"));
		};
		let Some((scheme, credentials)) = value.split_once(' ') else {
			return Some(self.abort("malformed Authorization header"));
		};
		if !scheme.eq_ignore_ascii_case("basic") {
			return Some(self.abort("unsupported Authorization scheme"));
		}
		let Some((username, password)) = decode_basic_credentials(credentials) else {
			return Some(self.abort("malformed Basic credentials"));
		};
		if self.verifier.verify(&username, &password) {
			None
		} else {
			Some(self.abort("invalid credentials"))
		}
	}
}

/// Decode the base64 `user:password` part of a Basic Authorization header.
pub fn decode_basic_credentials(credentials: &str) -> Option<(String, String)> {
	let decoded = BASE64.decode(credentials.trim()).ok()?;
	let text = String::from_utf8(decoded).ok()?;
	let (username, password) = text.split_once(':')?;
	Some((username.to_string(), password.to_string()))
}

/// Verifier accepting any username that equals its password.
/// For development setups only.
pub struct DummyVerifier;

impl BasicVerifier for DummyVerifier {
	fn verify(&self, username: &str, password: &str) -> bool {
		username == password
	}
}

pub type DummyAuth = BasicAuth<DummyVerifier>;

impl DummyAuth {
	pub fn dummy(realm: impl Into<String>) -> Self {
		Self::new(realm, DummyVerifier)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use base64::engine::general_purpose::STANDARD as BASE64;
	use base64::Engine;

	fn headers_with_basic(user: &str, password: &str) -> HeaderMap {
		let credentials = BASE64.encode(format!("{}:{}", user, password));
		let mut headers = HeaderMap::new();
		headers.insert(
			header::AUTHORIZATION,
			HeaderValue::from_str(&format!("Basic {}", credentials)).unwrap(),
		);
		headers
	}

	#[test]
	fn missing_header_is_rejected_with_challenge() {
		let auth = DummyAuth::dummy("concord");
		let response = auth.authenticate("/doc1", &HeaderMap::new()).unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
		assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
	}

	#[test]
	fn matching_credentials_pass() {
		let auth = DummyAuth::dummy("concord");
		assert!(auth.authenticate("/doc1", &headers_with_basic("alice", "alice")).is_none());
	}

	#[test]
	fn wrong_credentials_are_rejected() {
		let auth = DummyAuth::dummy("concord");
		let response = auth
			.authenticate("/doc1", &headers_with_basic("alice", "hunter2"))
			.unwrap();
		assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
	}

	#[test]
	fn unsupported_scheme_is_rejected() {
		let auth = DummyAuth::dummy("concord");
		let mut headers = HeaderMap::new();
		headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
		assert!(auth.authenticate("/doc1", &headers).is_some());
	}

	#[test]
	fn credential_decoding_round_trip() {
		let credentials = BASE64.encode("user:pass:with:colons");
		let (username, password) = decode_basic_credentials(&credentials).unwrap();
		assert_eq!(username, "user");
		assert_eq!(password, "pass:with:colons");
	}
}

// vim: ts=4
