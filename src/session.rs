//! Session authentication (spec §4.8): HMAC-signed session cookies pinned to
//! a TLS client-cert fingerprint, layered on top of mTLS.
//!
//! The token format is entirely ours to pick — spec §3 only fixes the wire
//! shape (`base64url(fingerprint | issuedAt | expiresAt | base64url(hmac))`)
//! and the field count, not a serialization library — so this is built the
//! same way `nclav-driver::aws` hand-assembles its signed string rather than
//! reaching for a token crate: the format is small, fully specified, and the
//! four fields are pipe-joined exactly as spec'd.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::errors::SessionError;
use crate::secret::Secret;

type HmacSha256 = Hmac<Sha256>;

/// Hard cap on the wire-encoded token size (spec §4.8): rejected before any
/// decoding is attempted, so an oversized token can't be used to force
/// wasted base64/HMAC work.
const MAX_TOKEN_BYTES: usize = 512;

/// Hex-encoded SHA-256 of a client certificate's raw DER bytes (spec §3
/// glossary "Fingerprint"). Stable per certificate.
pub fn fingerprint_der(der: &[u8]) -> String {
    let digest = Sha256::digest(der);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn sign(secret: &Secret<String>, payload: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
        .expect("HMAC accepts a key of any length");
    mac.update(payload.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Builds a signed session cookie value for `fingerprint`, valid for
/// `duration` from `now`. Panics if `fingerprint` contains the reserved `|`
/// delimiter (spec §4.8) — a fingerprint is always a hex string and can
/// never legitimately contain it, so this is a programmer-error guard, not a
/// recoverable condition.
pub fn create_token(
    secret: &Secret<String>,
    fingerprint: &str,
    now: DateTime<Utc>,
    duration: chrono::Duration,
) -> String {
    assert!(
        !fingerprint.contains('|'),
        "certificate fingerprint must not contain the reserved delimiter"
    );

    let issued_at = now.timestamp();
    let expires_at = (now + duration).timestamp();
    let payload = format!("{fingerprint}|{issued_at}|{expires_at}");
    let mac = sign(secret, &payload);
    let mac_b64 = URL_SAFE_NO_PAD.encode(mac);

    let full = format!("{payload}|{mac_b64}");
    URL_SAFE_NO_PAD.encode(full)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSession {
    pub fingerprint: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Verifies a wire-format token against `secret`. Order matters (spec
/// §4.8): size cap, then field-count/shape, then constant-time HMAC
/// comparison, and only *then* the expiry check — a tampered-but-expired
/// token must still report `Tampered`, not `Expired`.
pub fn verify_token(
    secret: &Secret<String>,
    token: &str,
    now: DateTime<Utc>,
) -> Result<VerifiedSession, SessionError> {
    if token.len() > MAX_TOKEN_BYTES {
        return Err(SessionError::Oversized);
    }

    let decoded = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| SessionError::Malformed)?;
    let full = String::from_utf8(decoded).map_err(|_| SessionError::Malformed)?;

    let parts: Vec<&str> = full.split('|').collect();
    let [fingerprint, issued_raw, expires_raw, mac_b64] = parts[..] else {
        return Err(SessionError::Malformed);
    };

    let issued_ts: i64 = issued_raw.parse().map_err(|_| SessionError::Malformed)?;
    let expires_ts: i64 = expires_raw.parse().map_err(|_| SessionError::Malformed)?;

    let payload = format!("{fingerprint}|{issued_raw}|{expires_raw}");
    let expected_mac = sign(secret, &payload);
    let given_mac = URL_SAFE_NO_PAD
        .decode(mac_b64)
        .map_err(|_| SessionError::Malformed)?;

    if expected_mac.ct_eq(&given_mac).unwrap_u8() != 1 {
        return Err(SessionError::Tampered);
    }

    let issued_at = DateTime::from_timestamp(issued_ts, 0).ok_or(SessionError::Malformed)?;
    let expires_at = DateTime::from_timestamp(expires_ts, 0).ok_or(SessionError::Malformed)?;

    if now > expires_at {
        return Err(SessionError::Expired);
    }

    Ok(VerifiedSession {
        fingerprint: fingerprint.to_string(),
        issued_at,
        expires_at,
    })
}

/// What the TLS layer hands the session middleware for an inbound request:
/// the client certificate's fingerprint, if one was presented. Decouples
/// `session`'s logic from `axum-server`'s rustls internals (SPEC_FULL's
/// "not re-derived here" note) so it's unit-testable without a live TLS
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificate {
    pub fingerprint: String,
}

/// Outcome of evaluating session state for one inbound request (spec §4.8's
/// decision order), before any HTTP-layer concerns (cookie encoding, status
/// codes) are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// Forward the request; no new cookie needs to be minted.
    Accept { fingerprint: String },
    /// Forward the request and mint a fresh cookie for this fingerprint —
    /// this was a first-time mTLS connection with no prior cookie.
    AcceptAndMint { fingerprint: String },
    /// Reject with 401.
    Reject(SessionError),
}

/// Implements spec §4.8 steps 2-4 (step 1, `/api/logout`, is handled
/// separately in `routes.rs` since it needs to *clear* rather than just
/// evaluate the cookie). Pure function of its inputs so it's testable
/// without an HTTP server.
pub fn decide(
    secret: &Secret<String>,
    cookie: Option<&str>,
    peer_cert: Option<&PeerCertificate>,
    now: DateTime<Utc>,
) -> SessionDecision {
    if let Some(token) = cookie {
        match verify_token(secret, token, now) {
            Ok(session) => {
                if let Some(cert) = peer_cert
                    && cert.fingerprint != session.fingerprint
                {
                    return SessionDecision::Reject(SessionError::FingerprintMismatch);
                }
                return SessionDecision::Accept {
                    fingerprint: session.fingerprint,
                };
            }
            Err(_) => {
                // Fall through: an invalid cookie doesn't block a fresh mTLS
                // mint below, but a verified cookie + valid cert/mismatch
                // already returned above.
            }
        }
    }

    if let Some(cert) = peer_cert {
        return SessionDecision::AcceptAndMint {
            fingerprint: cert.fingerprint.clone(),
        };
    }

    SessionDecision::Reject(SessionError::Missing)
}
