use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical signing string for a request.
///
/// Format: `METHOD|PATH|TIMESTAMP|NONCE[|BODY]|DEVICE_SECRET`
///
/// The body segment is omitted entirely, including its separator, when the
/// request carries no body. Both client and server must produce this exact
/// byte sequence for signatures to match.
pub fn canonical_string(
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: Option<&str>,
    device_secret: &str,
) -> String {
    match body {
        Some(body) => format!(
            "{}|{}|{}|{}|{}|{}",
            method, path, timestamp, nonce, body, device_secret
        ),
        None => format!(
            "{}|{}|{}|{}|{}",
            method, path, timestamp, nonce, device_secret
        ),
    }
}

/// Generate the HMAC-SHA256 signature over the canonical string, keyed by
/// the device secret, rendered as lowercase hex.
pub fn generate_signature(
    device_secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: Option<&str>,
) -> Result<String, anyhow::Error> {
    let mut mac = HmacSha256::new_from_slice(device_secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid key length: {}", e))?;

    let payload = canonical_string(method, path, timestamp, nonce, body, device_secret);
    mac.update(payload.as_bytes());
    let result = mac.finalize();

    Ok(hex::encode(result.into_bytes()))
}

/// Verify an HMAC-SHA256 signature using constant-time comparison.
pub fn verify_signature(
    device_secret: &str,
    method: &str,
    path: &str,
    timestamp: i64,
    nonce: &str,
    body: Option<&str>,
    signature: &str,
) -> Result<bool, anyhow::Error> {
    let expected_signature =
        generate_signature(device_secret, method, path, timestamp, nonce, body)?;

    let expected_bytes = expected_signature.as_bytes();
    let signature_bytes = signature.as_bytes();

    if expected_bytes.len() != signature_bytes.len() {
        return Ok(false);
    }

    Ok(expected_bytes.ct_eq(signature_bytes).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn signature_round_trip() {
        let body = r#"{"device_id":"dev-abc1234567"}"#;
        let signature =
            generate_signature(SECRET, "POST", "/tokens/generate", 1678886400, "a1b2c3", Some(body))
                .unwrap();
        assert_eq!(signature.len(), 64);
        assert_eq!(signature, signature.to_lowercase());

        let is_valid = verify_signature(
            SECRET,
            "POST",
            "/tokens/generate",
            1678886400,
            "a1b2c3",
            Some(body),
            &signature,
        )
        .unwrap();
        assert!(is_valid);
    }

    #[test]
    fn body_segment_omitted_with_separator_when_absent() {
        let with_none = canonical_string("GET", "/devices", 1678886400, "n1", None, SECRET);
        let with_empty = canonical_string("GET", "/devices", 1678886400, "n1", Some(""), SECRET);

        assert_eq!(with_none, format!("GET|/devices|1678886400|n1|{}", SECRET));
        // An empty body still contributes its separator; they must not collide
        assert_ne!(with_none, with_empty);
    }

    #[test]
    fn every_field_is_signature_relevant() {
        let signature =
            generate_signature(SECRET, "POST", "/tokens/generate", 1678886400, "n1", Some("{}"))
                .unwrap();

        let cases: [(&str, &str, i64, &str, Option<&str>); 5] = [
            ("GET", "/tokens/generate", 1678886400, "n1", Some("{}")),
            ("POST", "/tokens/refresh", 1678886400, "n1", Some("{}")),
            ("POST", "/tokens/generate", 1678886401, "n1", Some("{}")),
            ("POST", "/tokens/generate", 1678886400, "n2", Some("{}")),
            ("POST", "/tokens/generate", 1678886400, "n1", Some("{ }")),
        ];

        for (method, path, ts, nonce, body) in cases {
            let is_valid =
                verify_signature(SECRET, method, path, ts, nonce, body, &signature).unwrap();
            assert!(!is_valid, "perturbed request must not verify: {} {}", method, path);
        }
    }

    #[test]
    fn tampered_signature_rejected() {
        let signature =
            generate_signature(SECRET, "POST", "/tokens/generate", 1678886400, "n1", None).unwrap();
        let tampered = format!("a{}", &signature[1..]);
        let truncated = &signature[..signature.len() - 1];

        assert!(!verify_signature(
            SECRET, "POST", "/tokens/generate", 1678886400, "n1", None, &tampered
        )
        .unwrap());
        assert!(!verify_signature(
            SECRET, "POST", "/tokens/generate", 1678886400, "n1", None, truncated
        )
        .unwrap());
    }

    #[test]
    fn different_secrets_produce_different_signatures() {
        let a = generate_signature(SECRET, "GET", "/devices", 1678886400, "n1", None).unwrap();
        let b = generate_signature("another-secret", "GET", "/devices", 1678886400, "n1", None)
            .unwrap();
        assert_ne!(a, b);
    }
}
