// src/server/auth.rs
//
// Bearer token authentication for the ingest service.
//
// Device tokens arrive as a "token:device_id,token:device_id" credential
// string (DEVICE_TOKENS). Verification compares the presented token
// against every stored token with a constant-time byte comparison so a
// probe cannot learn token prefixes from response timing.

use std::collections::HashMap;

/// Parse the DEVICE_TOKENS credential string into token -> device_id.
///
/// Entries without a colon separator are skipped with a warning;
/// whitespace is trimmed; entries with an empty token or device_id are
/// skipped.
pub fn parse_device_tokens(raw: &str) -> HashMap<String, String> {
    let mut token_map = HashMap::new();
    if raw.trim().is_empty() {
        return token_map;
    }

    for (idx, entry) in raw.split(',').enumerate() {
        let entry = entry.trim();
        match entry.split_once(':') {
            None => {
                tlog!(
                    "[auth] Skipping malformed DEVICE_TOKENS entry at position {} (no colon separator)",
                    idx
                );
            }
            Some((token, device_id)) => {
                let token = token.trim();
                let device_id = device_id.trim();
                if !token.is_empty() && !device_id.is_empty() {
                    token_map.insert(token.to_string(), device_id.to_string());
                }
            }
        }
    }
    token_map
}

/// Constant-time byte comparison: every byte is visited, the verdict is
/// accumulated, and a length mismatch folds into the accumulator instead
/// of returning early.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len() {
        // Index b modulo its length so unequal-length inputs still walk
        // all of a; diff is already non-zero in that case
        let b_byte = if b.is_empty() { 0 } else { b[i % b.len()] };
        diff |= (a[i] ^ b_byte) as usize;
    }
    diff == 0
}

/// Token verifier. Holds no mutable state after construction.
pub struct BearerAuth {
    token_map: HashMap<String, String>,
}

impl BearerAuth {
    pub fn new(token_map: HashMap<String, String>) -> Self {
        Self { token_map }
    }

    pub fn is_empty(&self) -> bool {
        self.token_map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.token_map.len()
    }

    /// Validate a bare token, returning the mapped device_id.
    pub fn verify_token(&self, presented: &str) -> Option<&str> {
        if presented.is_empty() {
            return None;
        }
        let mut matched: Option<&str> = None;
        for (registered, device_id) in &self.token_map {
            if constant_time_eq(presented.as_bytes(), registered.as_bytes()) {
                matched = Some(device_id);
            }
        }
        matched
    }

    /// Validate an Authorization header value. Missing header or a
    /// non-Bearer scheme yields None.
    pub fn verify_header(&self, authorization: Option<&str>) -> Option<&str> {
        let header = authorization?;
        let (scheme, token) = header.trim().split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("Bearer") {
            return None;
        }
        self.verify_token(token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Credential Parsing Tests
    // ========================================================================

    #[test]
    fn test_parse_single_entry() {
        let map = parse_device_tokens("tok-A:dev-1");
        assert_eq!(map.len(), 1);
        assert_eq!(map["tok-A"], "dev-1");
    }

    #[test]
    fn test_parse_multiple_entries_with_whitespace() {
        let map = parse_device_tokens(" tok-A : dev-1 , tok-B:dev-2 ");
        assert_eq!(map.len(), 2);
        assert_eq!(map["tok-A"], "dev-1");
        assert_eq!(map["tok-B"], "dev-2");
    }

    #[test]
    fn test_parse_skips_entries_without_separator() {
        let map = parse_device_tokens("garbage,tok-A:dev-1,more-garbage");
        assert_eq!(map.len(), 1);
        assert_eq!(map["tok-A"], "dev-1");
    }

    #[test]
    fn test_parse_skips_empty_token_or_device() {
        let map = parse_device_tokens(":dev-1,tok-B:,tok-C:dev-3");
        assert_eq!(map.len(), 1);
        assert_eq!(map["tok-C"], "dev-3");
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(parse_device_tokens("").is_empty());
        assert!(parse_device_tokens("   ").is_empty());
    }

    #[test]
    fn test_parse_device_id_may_contain_colon() {
        // Only the first colon separates token from device_id
        let map = parse_device_tokens("tok-A:dev:with:colons");
        assert_eq!(map["tok-A"], "dev:with:colons");
    }

    // ========================================================================
    // Verification Tests
    // ========================================================================

    fn auth() -> BearerAuth {
        BearerAuth::new(parse_device_tokens("tok-A:dev-1,tok-B:dev-2"))
    }

    #[test]
    fn test_verify_token_match() {
        let auth = auth();
        assert_eq!(auth.verify_token("tok-A"), Some("dev-1"));
        assert_eq!(auth.verify_token("tok-B"), Some("dev-2"));
    }

    #[test]
    fn test_verify_token_mismatch() {
        let auth = auth();
        assert_eq!(auth.verify_token("tok-C"), None);
        assert_eq!(auth.verify_token(""), None);
        // Prefix of a valid token must not match
        assert_eq!(auth.verify_token("tok-"), None);
        assert_eq!(auth.verify_token("tok-AA"), None);
    }

    #[test]
    fn test_verify_header() {
        let auth = auth();
        assert_eq!(auth.verify_header(Some("Bearer tok-A")), Some("dev-1"));
        // Scheme is case-insensitive per RFC 7235
        assert_eq!(auth.verify_header(Some("bearer tok-A")), Some("dev-1"));
        assert_eq!(auth.verify_header(Some("Basic tok-A")), None);
        assert_eq!(auth.verify_header(Some("tok-A")), None);
        assert_eq!(auth.verify_header(None), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(!constant_time_eq(b"", b"a"));
        assert!(constant_time_eq(b"", b""));
    }
}
