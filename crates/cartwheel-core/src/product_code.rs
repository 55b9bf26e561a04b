//! Reversible product codes.
//!
//! A `product_id` is an opaque, URL-safe encoding of the product's canonical
//! URL. Encoding is deterministic (same URL, same code) and reversible, so a
//! detail fetch recovers the URL without any lookup table. Codes are produced
//! with a process-wide key: a sha256-derived keystream XOR over the URL bytes,
//! wrapped in unpadded URL-safe base64 with a version byte and a short
//! integrity tag.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{CartwheelError, Result};

const CODE_VERSION: u8 = 1;
const TAG_LEN: usize = 2;

/// Encoder/decoder bound to one process-wide key.
#[derive(Clone)]
pub struct ProductCodec {
    key: [u8; 32],
}

impl std::fmt::Debug for ProductCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProductCodec").finish_non_exhaustive()
    }
}

impl ProductCodec {
    pub fn new(key: &str) -> Self {
        let mut h = Sha256::new();
        h.update(b"cartwheel.product_code.v1");
        h.update(key.as_bytes());
        Self {
            key: h.finalize().into(),
        }
    }

    /// Canonicalize a product URL before encoding: parse, drop the fragment,
    /// normalize scheme/host spelling. Two spellings of the same page encode
    /// to the same code.
    pub fn canonicalize(url: &str) -> Result<String> {
        let mut parsed = Url::parse(url.trim())
            .map_err(|e| CartwheelError::Validation(format!("invalid product url: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(CartwheelError::Validation(format!(
                "unsupported url scheme '{}'",
                parsed.scheme()
            )));
        }
        parsed.set_fragment(None);
        Ok(parsed.to_string())
    }

    pub fn encode(&self, url: &str) -> Result<String> {
        let canonical = Self::canonicalize(url)?;
        let plain = canonical.as_bytes();

        let tag = Sha256::digest(plain);
        let mut body = Vec::with_capacity(1 + TAG_LEN + plain.len());
        body.push(CODE_VERSION);
        body.extend_from_slice(&tag[..TAG_LEN]);

        let stream = self.keystream(plain.len());
        body.extend(plain.iter().zip(stream.iter()).map(|(p, k)| p ^ k));

        Ok(URL_SAFE_NO_PAD.encode(body))
    }

    pub fn decode(&self, code: &str) -> Result<String> {
        let body = URL_SAFE_NO_PAD
            .decode(code.trim())
            .map_err(|_| CartwheelError::Validation("malformed product code".into()))?;
        if body.len() < 1 + TAG_LEN + 1 {
            return Err(CartwheelError::Validation("product code too short".into()));
        }
        if body[0] != CODE_VERSION {
            return Err(CartwheelError::Validation(format!(
                "unknown product code version {}",
                body[0]
            )));
        }
        let (tag, cipher) = body[1..].split_at(TAG_LEN);

        let stream = self.keystream(cipher.len());
        let plain: Vec<u8> = cipher.iter().zip(stream.iter()).map(|(c, k)| c ^ k).collect();

        let expect = Sha256::digest(&plain);
        if tag != &expect[..TAG_LEN] {
            return Err(CartwheelError::Validation("product code integrity check failed".into()));
        }
        String::from_utf8(plain)
            .map_err(|_| CartwheelError::Validation("product code is not valid utf-8".into()))
    }

    fn keystream(&self, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len.next_multiple_of(32));
        let mut counter: u32 = 0;
        while out.len() < len {
            let mut h = Sha256::new();
            h.update(self.key);
            h.update(counter.to_be_bytes());
            out.extend_from_slice(&h.finalize());
            counter += 1;
        }
        out.truncate(len);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ProductCodec {
        ProductCodec::new("test-key")
    }

    #[test]
    fn round_trips_canonical_urls() {
        let urls = [
            "https://www.jumia.com.ng/lenovo-ideapad-3-156-fhd-129304.html",
            "https://shop.example/p/42?variant=blue&ref=search",
            "http://example.com/",
            "https://example.com/path/with/%20escapes?q=caf%C3%A9",
        ];
        let c = codec();
        for url in urls {
            let code = c.encode(url).unwrap();
            assert_eq!(c.decode(&code).unwrap(), ProductCodec::canonicalize(url).unwrap());
        }
    }

    #[test]
    fn encoding_is_deterministic() {
        let c = codec();
        let a = c.encode("https://shop.example/p/42").unwrap();
        let b = c.encode("https://shop.example/p/42").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fragment_does_not_change_the_code() {
        let c = codec();
        let a = c.encode("https://shop.example/p/42#reviews").unwrap();
        let b = c.encode("https://shop.example/p/42").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn codes_are_url_safe() {
        let c = codec();
        let code = c
            .encode("https://shop.example/p/42?a=1&b=2&c=futté")
            .unwrap();
        assert!(
            code.chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
        );
    }

    #[test]
    fn tampered_code_rejected() {
        let c = codec();
        let mut code = c.encode("https://shop.example/p/42").unwrap();
        let flipped = if code.ends_with('A') { 'B' } else { 'A' };
        code.pop();
        code.push(flipped);
        assert!(c.decode(&code).is_err());
    }

    #[test]
    fn wrong_key_rejected() {
        let code = codec().encode("https://shop.example/p/42").unwrap();
        let other = ProductCodec::new("another-key");
        assert!(other.decode(&code).is_err());
    }

    #[test]
    fn non_http_scheme_rejected() {
        assert!(codec().encode("ftp://shop.example/p/42").is_err());
        assert!(codec().encode("not a url").is_err());
    }
}
