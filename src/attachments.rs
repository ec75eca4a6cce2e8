//! Attachment resolution.
//!
//! Turns inbound attachment references (inline data URIs or remote URLs)
//! into raw bytes for the generation stage. Resolution is fail-fast: a
//! single unresolvable attachment aborts the whole step, since generation
//! quality depends on having every referenced asset. Output order matches
//! input order.

use base64::Engine;
use std::time::Duration;

use crate::api::types::AttachmentRef;
use crate::error::DeployError;

/// Default timeout for fetching a remote attachment.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Default size cap for a remote attachment (8 MiB).
const MAX_FETCH_BYTES: usize = 8 * 1024 * 1024;

/// An attachment with its payload materialized.
#[derive(Debug, Clone)]
pub struct ResolvedAttachment {
    /// File name the brief refers to the attachment by
    pub name: String,

    /// Original source (data URI or remote URL), kept for data-URI passthrough
    pub url: String,

    /// Resolved payload; lives only for the duration of the request
    pub bytes: Vec<u8>,

    /// MIME type, from the data URI header or guessed from the name
    pub content_type: String,
}

impl ResolvedAttachment {
    /// Render this attachment as a data URI for embedding in the generated
    /// site. Inline sources round-trip unchanged; fetched sources are
    /// re-encoded from the resolved bytes.
    pub fn as_data_uri(&self) -> String {
        if is_data_uri(&self.url) {
            return self.url.clone();
        }
        format!(
            "data:{};base64,{}",
            self.content_type,
            base64::engine::general_purpose::STANDARD.encode(&self.bytes)
        )
    }
}

/// Resolver for attachment references.
pub struct AttachmentResolver {
    client: reqwest::Client,
    fetch_timeout: Duration,
    max_bytes: usize,
}

impl Default for AttachmentResolver {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl AttachmentResolver {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            fetch_timeout: FETCH_TIMEOUT,
            max_bytes: MAX_FETCH_BYTES,
        }
    }

    /// Resolve every reference, in order. Fails on the first attachment that
    /// cannot be materialized.
    pub async fn resolve(
        &self,
        refs: &[AttachmentRef],
    ) -> Result<Vec<ResolvedAttachment>, DeployError> {
        let mut resolved = Vec::with_capacity(refs.len());
        for r in refs {
            resolved.push(self.resolve_one(r).await?);
        }
        Ok(resolved)
    }

    async fn resolve_one(&self, r: &AttachmentRef) -> Result<ResolvedAttachment, DeployError> {
        if is_data_uri(&r.url) {
            let (content_type, bytes) =
                decode_data_uri(&r.url).map_err(|reason| DeployError::MalformedAttachment {
                    name: r.name.clone(),
                    reason,
                })?;
            let content_type = if content_type.is_empty() {
                guess_content_type(&r.name).to_string()
            } else {
                content_type
            };
            return Ok(ResolvedAttachment {
                name: r.name.clone(),
                url: r.url.clone(),
                bytes,
                content_type,
            });
        }

        let bytes = self.fetch(&r.name, &r.url).await?;
        Ok(ResolvedAttachment {
            name: r.name.clone(),
            url: r.url.clone(),
            bytes,
            content_type: guess_content_type(&r.name).to_string(),
        })
    }

    /// Fetch a remote attachment with bounded timeout and size.
    async fn fetch(&self, name: &str, url: &str) -> Result<Vec<u8>, DeployError> {
        let err = |reason: String| DeployError::AttachmentFetch {
            name: name.to_string(),
            reason,
        };

        let mut response = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    err(format!("timed out after {:?}", self.fetch_timeout))
                } else {
                    err(format!("request failed: {}", e))
                }
            })?;

        if !response.status().is_success() {
            return Err(err(format!("HTTP {}", response.status().as_u16())));
        }

        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(err(format!(
                    "declared size {} exceeds limit {}",
                    len, self.max_bytes
                )));
            }
        }

        // Stream chunks so a lying Content-Length cannot blow the cap.
        let mut bytes = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| err(format!("read failed: {}", e)))?
        {
            if bytes.len() + chunk.len() > self.max_bytes {
                return Err(err(format!("body exceeds limit {}", self.max_bytes)));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }
}

/// Whether a source string is an inline data URI.
pub fn is_data_uri(url: &str) -> bool {
    url.starts_with("data:")
}

/// Decode a data URI into (content type, bytes).
///
/// Accepts the common `data:<mime>;base64,<payload>` form. The content type
/// may be empty when the URI omits it.
pub fn decode_data_uri(uri: &str) -> Result<(String, Vec<u8>), String> {
    let rest = uri
        .strip_prefix("data:")
        .ok_or_else(|| "missing data: scheme".to_string())?;

    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| "missing comma separator".to_string())?;

    if !header.ends_with(";base64") && !header.is_empty() {
        // Percent-encoded textual data URIs are not used by the evaluator;
        // reject anything that is not base64 rather than guess.
        if !header.contains("base64") {
            return Err(format!("unsupported data URI encoding: {:?}", header));
        }
    }

    let content_type = header
        .split(';')
        .next()
        .unwrap_or("")
        .to_string();

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64 payload: {}", e))?;

    Ok((content_type, bytes))
}

/// Guess a MIME type from a file name extension.
fn guess_content_type(name: &str) -> &'static str {
    match name.rsplit('.').next().map(|e| e.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "svg" => "image/svg+xml",
            "webp" => "image/webp",
            "csv" => "text/csv",
            "json" => "application/json",
            "txt" | "md" => "text/plain",
            "html" => "text/html",
            "pdf" => "application/pdf",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_uri_round_trip() {
        let original = b"name,score\nada,10\n";
        let encoded = base64::engine::general_purpose::STANDARD.encode(original);
        let uri = format!("data:text/csv;base64,{}", encoded);

        let (content_type, bytes) = decode_data_uri(&uri).unwrap();
        assert_eq!(content_type, "text/csv");
        assert_eq!(bytes, original);

        // Re-encoding the resolved bytes yields the original encoded string
        let reencoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
        assert_eq!(reencoded, encoded);
    }

    #[test]
    fn test_data_uri_without_content_type() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(b"hello");
        let uri = format!("data:;base64,{}", encoded);
        let (content_type, bytes) = decode_data_uri(&uri).unwrap();
        assert_eq!(content_type, "");
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn test_malformed_data_uri_rejected() {
        assert!(decode_data_uri("data:text/plain;base64").is_err());
        assert!(decode_data_uri("data:text/plain;base64,!!!not-base64!!!").is_err());
        assert!(decode_data_uri("http://example.com/x.png").is_err());
    }

    #[tokio::test]
    async fn test_resolve_preserves_order_and_fails_fast() {
        let resolver = AttachmentResolver::default();
        let good = |name: &str, data: &[u8]| AttachmentRef {
            name: name.to_string(),
            url: format!(
                "data:text/plain;base64,{}",
                base64::engine::general_purpose::STANDARD.encode(data)
            ),
        };

        let refs = vec![good("a.txt", b"aaa"), good("b.txt", b"bbb")];
        let resolved = resolver.resolve(&refs).await.unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].name, "a.txt");
        assert_eq!(resolved[1].name, "b.txt");
        assert_eq!(resolved[0].bytes, b"aaa");

        let refs = vec![
            good("a.txt", b"aaa"),
            AttachmentRef {
                name: "broken.bin".into(),
                url: "data:application/octet-stream;base64,@@@".into(),
            },
        ];
        let err = resolver.resolve(&refs).await.unwrap_err();
        assert!(matches!(
            err,
            DeployError::MalformedAttachment { ref name, .. } if name == "broken.bin"
        ));
    }

    #[test]
    fn test_fetched_attachment_renders_as_data_uri() {
        let att = ResolvedAttachment {
            name: "chart.png".into(),
            url: "https://example.com/chart.png".into(),
            bytes: vec![1, 2, 3],
            content_type: "image/png".into(),
        };
        let uri = att.as_data_uri();
        assert!(uri.starts_with("data:image/png;base64,"));
        let (_, bytes) = decode_data_uri(&uri).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
