//! `s3://bucket/prefix` locations and public object URLs

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

/// Bytes escaped in the path part of a public URL; `/` separates segments
const KEY_PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

const DEFAULT_REGION: &str = "us-east-1";

/// Parse an S3 URL into (bucket, key)
pub fn parse_s3_url(url: &str) -> Option<(String, String)> {
    let path = url.strip_prefix("s3://")?;
    let mut parts = path.splitn(2, '/');
    let bucket = parts.next().filter(|b| !b.is_empty())?.to_string();
    let key = parts.next().unwrap_or("").to_string();

    Some((bucket, key))
}

/// Check if path is an S3 URL
pub fn is_s3_url(path: &str) -> bool {
    path.starts_with("s3://")
}

/// Normalize a sync prefix so that it names a "directory": empty or ending in `/`
pub fn dir_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, KEY_PATH_SET).to_string()
}

/// Path-style HTTPS URL of an object, e.g. `https://s3-eu-west-1.amazonaws.com/bucket/key`
///
/// `us-east-1` and an unknown region use the global `s3.amazonaws.com` host.
pub fn public_url(bucket: &str, key: &str, region: Option<&str>) -> String {
    let host = match region.filter(|r| !r.is_empty() && *r != DEFAULT_REGION) {
        Some(region) => format!("s3-{}.amazonaws.com", region),
        None => "s3.amazonaws.com".to_string(),
    };
    format!("https://{}/{}/{}", host, bucket, encode_key(key))
}

/// Virtual-hosted HTTP URL of an object, e.g. `http://bucket.s3.amazonaws.com/key`
pub fn public_url_http(bucket: &str, key: &str) -> String {
    format!("http://{}.s3.amazonaws.com/{}", bucket, encode_key(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_url() {
        assert_eq!(
            parse_s3_url("s3://my-bucket/path/to/file"),
            Some(("my-bucket".to_string(), "path/to/file".to_string()))
        );

        assert_eq!(
            parse_s3_url("s3://bucket"),
            Some(("bucket".to_string(), "".to_string()))
        );

        assert_eq!(parse_s3_url("s3:///key"), None);
        assert_eq!(parse_s3_url("/local/path"), None);
    }

    #[test]
    fn test_is_s3_url() {
        assert!(is_s3_url("s3://bucket/key"));
        assert!(!is_s3_url("/local/path"));
        assert!(!is_s3_url("https://bucket.s3.amazonaws.com/key"));
    }

    #[test]
    fn test_dir_prefix() {
        assert_eq!(dir_prefix(""), "");
        assert_eq!(dir_prefix("photos"), "photos/");
        assert_eq!(dir_prefix("photos/"), "photos/");
    }

    #[test]
    fn test_public_url_regions() {
        assert_eq!(
            public_url("bucket", "dir/file.txt", None),
            "https://s3.amazonaws.com/bucket/dir/file.txt"
        );
        assert_eq!(
            public_url("bucket", "file.txt", Some("us-east-1")),
            "https://s3.amazonaws.com/bucket/file.txt"
        );
        assert_eq!(
            public_url("bucket", "file.txt", Some("eu-west-1")),
            "https://s3-eu-west-1.amazonaws.com/bucket/file.txt"
        );
    }

    #[test]
    fn test_public_url_escapes_key_segments() {
        assert_eq!(
            public_url("b", "my docs/it's (1)!*.txt", None),
            "https://s3.amazonaws.com/b/my%20docs/it%27s%20%281%29%21%2A.txt"
        );
        assert_eq!(
            public_url_http("b", "a+b/c?d#e/caf\u{e9}"),
            "http://b.s3.amazonaws.com/a%2Bb/c%3Fd%23e/caf%C3%A9"
        );
    }
}
