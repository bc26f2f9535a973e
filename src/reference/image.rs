//! Image reference grammar and normalization
//!
//! `alpine` normalizes to `docker.io/library/alpine:latest`,
//! `localhost:5000/app@sha256:...` keeps its registry and digest, and the
//! `docker://`, `oci-archive://` and `ipfs://` prefixes are stripped and
//! remembered as the pull source.

use crate::error::{CtlError, Result};
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

pub const DEFAULT_DOMAIN: &str = "docker.io";
pub const LEGACY_DEFAULT_DOMAIN: &str = "index.docker.io";
pub const OFFICIAL_REPO_PREFIX: &str = "library/";
pub const DEFAULT_TAG: &str = "latest";

/// Where an image reference is pulled from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    #[default]
    Registry,
    OciArchive,
    Ipfs,
}

/// A parsed, normalized image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    domain: String,
    path: String,
    tag: Option<String>,
    digest: Option<String>,
    source: ImageSource,
}

fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

/// An uncompilable pattern matches nothing
fn matches(re: Option<&Regex>, value: &str) -> bool {
    re.is_some_and(|re| re.is_match(value))
}

fn path_component_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&RE, r"^[a-z0-9]+(?:(?:[._]|__|[-]+)[a-z0-9]+)*$")
}

fn tag_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&RE, r"^[\w][\w.-]{0,127}$")
}

fn digest_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(&RE, r"^[a-z0-9]+(?:[.+_-][a-z0-9]+)*:[a-zA-Z0-9=_-]{32,}$")
}

fn domain_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    pattern(
        &RE,
        r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]*[a-zA-Z0-9])?\.?)+(?::[0-9]+)?$|^\[[0-9a-fA-F:]+\](?::[0-9]+)?$",
    )
}

impl ImageRef {
    /// Parse and normalize a user-supplied reference
    pub fn parse(input: &str) -> Result<Self> {
        let invalid = || CtlError::InvalidReference(input.to_string());

        let (source, rest) = if let Some(rest) = input.strip_prefix("oci-archive://") {
            (ImageSource::OciArchive, rest)
        } else if let Some(rest) = input.strip_prefix("ipfs://") {
            (ImageSource::Ipfs, rest)
        } else if let Some(rest) = input.strip_prefix("docker://") {
            (ImageSource::Registry, rest)
        } else {
            (ImageSource::Registry, input)
        };

        if rest.is_empty() || rest.len() > 4096 {
            return Err(invalid());
        }

        let (name_and_tag, digest) = match rest.split_once('@') {
            Some((name, digest)) => {
                if !matches(digest_re(), digest) {
                    return Err(invalid());
                }
                if let Some(hex) = digest.strip_prefix("sha256:") {
                    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                        return Err(invalid());
                    }
                }
                (name, Some(digest.to_string()))
            }
            None => (rest, None),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to a port.
        let last_slash = name_and_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name_and_tag[last_slash..].rfind(':') {
            Some(pos) => {
                let split = last_slash + pos;
                let tag = &name_and_tag[split + 1..];
                if !matches(tag_re(), tag) {
                    return Err(invalid());
                }
                (&name_and_tag[..split], Some(tag.to_string()))
            }
            None => (name_and_tag, None),
        };

        if name.is_empty() || name.len() > 255 {
            return Err(invalid());
        }

        let (domain, path) = split_domain(name);
        if !matches(domain_re(), &domain) {
            return Err(invalid());
        }
        if path.is_empty() || !path.split('/').all(|c| matches(path_component_re(), c)) {
            return Err(invalid());
        }

        Ok(Self {
            domain,
            path,
            tag,
            digest,
            source,
        })
    }

    /// `docker.io/library/alpine:latest`; a bare name gets the implicit `latest`
    pub fn canonical(&self) -> String {
        let mut out = self.name();
        match (&self.tag, &self.digest) {
            (Some(tag), _) => {
                out.push(':');
                out.push_str(tag);
            }
            (None, None) => {
                out.push(':');
                out.push_str(DEFAULT_TAG);
            }
            (None, Some(_)) => {}
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(digest);
        }
        out
    }

    /// Repository without tag or digest
    pub fn name(&self) -> String {
        format!("{}/{}", self.domain, self.path)
    }

    /// Short form for display: `alpine:latest`, `ghcr.io/org/app:v1`
    pub fn familiar(&self) -> String {
        let canonical = self.canonical();
        let prefix = format!("{}/{}", DEFAULT_DOMAIN, OFFICIAL_REPO_PREFIX);
        if let Some(short) = canonical.strip_prefix(&prefix) {
            return short.to_string();
        }
        canonical
            .strip_prefix(&format!("{}/", DEFAULT_DOMAIN))
            .map(str::to_string)
            .unwrap_or(canonical)
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }

    /// Last path component, used when generating container names
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn split_domain(name: &str) -> (String, String) {
    let (domain, path) = match name.split_once('/') {
        Some((first, rest))
            if first.contains('.')
                || first.contains(':')
                || first == "localhost"
                || first.chars().any(|c| c.is_ascii_uppercase()) =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_DOMAIN.to_string(), name.to_string()),
    };

    let domain = if domain == LEGACY_DEFAULT_DOMAIN {
        DEFAULT_DOMAIN.to_string()
    } else {
        domain
    };
    let path = if domain == DEFAULT_DOMAIN && !path.contains('/') {
        format!("{}{}", OFFICIAL_REPO_PREFIX, path)
    } else {
        path
    };
    (domain, path)
}

/// Whether a query looks like an image ID or digest prefix
pub fn is_digest_query(query: &str) -> bool {
    let hex = query.strip_prefix("sha256:").unwrap_or(query);
    !hex.is_empty() && hex.len() <= 64 && hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization_table() {
        let cases = [
            ("alpine", "docker.io/library/alpine:latest"),
            ("alpine:3.19", "docker.io/library/alpine:3.19"),
            ("library/alpine", "docker.io/library/alpine:latest"),
            ("bitnami/redis:7", "docker.io/bitnami/redis:7"),
            ("index.docker.io/library/nginx", "docker.io/library/nginx:latest"),
            ("ghcr.io/org/app:v1", "ghcr.io/org/app:v1"),
            ("localhost:5000/app", "localhost:5000/app:latest"),
            ("localhost/app:dev", "localhost/app:dev"),
            ("docker://alpine", "docker.io/library/alpine:latest"),
        ];
        for (input, expected) in cases {
            assert_eq!(ImageRef::parse(input).unwrap().canonical(), expected, "{}", input);
        }
    }

    #[test]
    fn test_digest_references() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let r = ImageRef::parse(&format!("alpine@{}", digest)).unwrap();
        assert_eq!(r.canonical(), format!("docker.io/library/alpine@{}", digest));
        assert_eq!(r.tag(), None);

        let r = ImageRef::parse(&format!("alpine:3@{}", digest)).unwrap();
        assert_eq!(r.canonical(), format!("docker.io/library/alpine:3@{}", digest));

        assert!(ImageRef::parse("alpine@sha256:abc").is_err());
    }

    #[test]
    fn test_scheme_prefixes() {
        let r = ImageRef::parse("ipfs://bafkreiabc123").unwrap();
        assert_eq!(r.source(), ImageSource::Ipfs);
        assert_eq!(r.canonical(), "docker.io/library/bafkreiabc123:latest");

        let r = ImageRef::parse("oci-archive://registry.local/app:v2").unwrap();
        assert_eq!(r.source(), ImageSource::OciArchive);
        assert_eq!(r.domain(), "registry.local");
    }

    #[test]
    fn test_invalid_references() {
        for bad in ["", "Alpine", "alpine:", "a//b", ":tag", "alpine:bad tag", "UPPER/x"] {
            let result = ImageRef::parse(bad);
            if bad == "UPPER/x" {
                // An uppercase first component is read as a registry host.
                assert!(result.is_ok());
                continue;
            }
            assert!(result.is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_familiar_and_basename() {
        let r = ImageRef::parse("alpine").unwrap();
        assert_eq!(r.familiar(), "alpine:latest");
        assert_eq!(r.basename(), "alpine");

        let r = ImageRef::parse("bitnami/redis").unwrap();
        assert_eq!(r.familiar(), "bitnami/redis:latest");

        let r = ImageRef::parse("ghcr.io/org/app").unwrap();
        assert_eq!(r.familiar(), "ghcr.io/org/app:latest");
        assert_eq!(r.basename(), "app");
    }

    #[test]
    fn test_digest_query() {
        assert!(is_digest_query("3f57d9401f8d"));
        assert!(is_digest_query("sha256:3f57"));
        assert!(!is_digest_query("alpine"));
        assert!(!is_digest_query(""));
    }
}
