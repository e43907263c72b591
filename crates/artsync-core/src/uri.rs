//! Minimal reference-URI splitting.
//!
//! Object keys are kept verbatim: no percent decoding and no case folding,
//! so `s3://bucket/a b/c` yields the key `a b/c`.

/// A URI split into `scheme://netloc/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri<'a> {
    pub scheme: &'a str,
    pub netloc: &'a str,
    pub path: &'a str,
}

impl<'a> ParsedUri<'a> {
    pub fn parse(uri: &'a str) -> Self {
        let (scheme, rest) = match uri.split_once(':') {
            Some((scheme, rest)) if is_scheme(scheme) => (scheme, rest),
            _ => ("", uri),
        };

        let (netloc, path) = match rest.strip_prefix("//") {
            Some(after) => match after.find('/') {
                Some(idx) => (&after[..idx], &after[idx..]),
                None => (after, ""),
            },
            None => ("", rest),
        };

        Self {
            scheme,
            netloc,
            path,
        }
    }

    /// Path without its leading slash, i.e. the object key for bucket URIs.
    pub fn key(&self) -> &'a str {
        self.path.strip_prefix('/').unwrap_or(self.path)
    }

    pub fn has_scheme(&self) -> bool {
        !self.scheme.is_empty()
    }
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

/// Joins URI/logical path segments with a single forward slash.
pub fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        return rel.to_string();
    }
    if rel.is_empty() {
        return base.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), rel.trim_start_matches('/'))
}

/// Last path segment.
pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bucket_uri() {
        let parsed = ParsedUri::parse("s3://my-bucket/path/to/key.json");
        assert_eq!(parsed.scheme, "s3");
        assert_eq!(parsed.netloc, "my-bucket");
        assert_eq!(parsed.path, "/path/to/key.json");
        assert_eq!(parsed.key(), "path/to/key.json");
    }

    #[test]
    fn test_parse_file_uri() {
        let parsed = ParsedUri::parse("file:///tmp/data dir/x.txt");
        assert_eq!(parsed.scheme, "file");
        assert_eq!(parsed.netloc, "");
        assert_eq!(parsed.path, "/tmp/data dir/x.txt");
    }

    #[test]
    fn test_parse_without_scheme() {
        let parsed = ParsedUri::parse("relative/path.txt");
        assert!(!parsed.has_scheme());
        assert_eq!(parsed.path, "relative/path.txt");

        // Windows-ish drive letters and bare colons are not schemes
        assert!(!ParsedUri::parse("1abc:foo").has_scheme());
    }

    #[test]
    fn test_join_and_basename() {
        assert_eq!(join("s3://b/prefix/", "a/b.txt"), "s3://b/prefix/a/b.txt");
        assert_eq!(join("", "x"), "x");
        assert_eq!(basename("dir/sub/file.bin"), "file.bin");
        assert_eq!(basename("file.bin"), "file.bin");
    }
}
