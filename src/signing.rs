use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Prefix on every signature header value.
pub const SIGNATURE_PREFIX: &str = "sha256=";

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Duplicate of `X-Signature` for client libraries that expect this name.
pub const SIGNATURE_256_HEADER: &str = "X-Signature-256";

/// Sign a payload: `"sha256=" + hex(HMAC_SHA256(secret, payload))`.
///
/// Whether an empty secret means "unsigned" is the caller's decision;
/// this function signs with whatever key it is given.
pub fn sign(secret: &[u8], payload: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(mac_bytes(secret, payload)))
}

/// Verify a `sha256=<hex>` signature in constant time.
pub fn verify(secret: &[u8], signature: &str, payload: &[u8]) -> bool {
    let Some(hex_part) = signature.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_part) else {
        return false;
    };
    let expected = mac_bytes(secret, payload);
    expected.as_slice().ct_eq(provided.as_slice()).into()
}

fn mac_bytes(secret: &[u8], payload: &[u8]) -> Vec<u8> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
        .expect("HMAC can take key of any size");
    mac.update(payload);
    mac.finalize().into_bytes().to_vec()
}

/// Signature headers for an outgoing request, empty in unsigned mode.
pub fn signature_headers(secret: &str, body: &[u8]) -> Vec<(&'static str, String)> {
    if secret.is_empty() {
        return Vec::new();
    }
    let signature = sign(secret.as_bytes(), body);
    vec![
        (SIGNATURE_HEADER, signature.clone()),
        (SIGNATURE_256_HEADER, signature),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request in one call.
///
/// Intended for receivers (and tests): looks for `X-Signature-256`, then
/// `X-Signature`, case-insensitively.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    payload: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut primary = None;
    let mut fallback = None;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case(SIGNATURE_256_HEADER) {
            primary = Some(value);
        } else if name.eq_ignore_ascii_case(SIGNATURE_HEADER) {
            fallback = Some(value);
        }
    }

    let signature = primary
        .or(fallback)
        .ok_or(VerificationError::MissingSignature)?;

    if verify(secret, signature, payload) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"whsec_0123456789abcdef";

    #[test]
    fn sign_then_verify() {
        let payload = br#"{"event":{"type":"gist.created"}}"#;
        let signature = sign(SECRET, payload);
        assert!(signature.starts_with("sha256="));
        assert_eq!(signature.len(), "sha256=".len() + 64);
        assert!(verify(SECRET, &signature, payload));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let signature = sign(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            signature,
            "sha256=5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn altered_inputs_fail() {
        let payload = b"payload";
        let signature = sign(SECRET, payload);

        assert!(!verify(b"another-secret-0123", &signature, payload));
        assert!(!verify(SECRET, &signature, b"payloaD"));

        let mut tampered = signature.clone();
        tampered.pop();
        tampered.push('0');
        if tampered == signature {
            tampered.pop();
            tampered.push('1');
        }
        assert!(!verify(SECRET, &tampered, payload));
    }

    #[test]
    fn malformed_signatures_fail() {
        assert!(!verify(SECRET, "", b"x"));
        assert!(!verify(SECRET, "sha1=abcd", b"x"));
        assert!(!verify(SECRET, "sha256=not-hex", b"x"));
        assert!(!verify(SECRET, "sha256=abcd", b"x"));
    }

    #[test]
    fn unsigned_mode_has_no_headers() {
        assert!(signature_headers("", b"body").is_empty());

        let headers = signature_headers("whsec_0123456789abcdef", b"body");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, headers[1].1);
    }

    #[test]
    fn verify_request_prefers_signature_256() {
        let payload = b"{}";
        let good = sign(SECRET, payload);
        let headers = [("x-signature", "sha256=00"), ("X-SIGNATURE-256", good.as_str())];
        assert_eq!(verify_webhook_request(headers, payload, SECRET), Ok(()));

        assert_eq!(
            verify_webhook_request([("Content-Type", "application/json")], payload, SECRET),
            Err(VerificationError::MissingSignature)
        );
        assert_eq!(
            verify_webhook_request([("X-Signature", "sha256=00")], payload, SECRET),
            Err(VerificationError::InvalidSignature)
        );
    }
}
