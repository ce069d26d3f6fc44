//! Candidate parser: turns raw input lines into unique candidate hosts

use crate::error::InputError;
use crate::proxy::models::{CandidateHost, Scheme};
use crate::Result;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::{debug, info};
use url::Url;

/// Candidates produced from one input pass, with line statistics
#[derive(Debug, Clone, Default)]
pub struct NormalizedCandidates {
    /// Unique candidates, first line wins for a given key
    pub candidates: Vec<CandidateHost>,
    /// Every line seen, blank lines included
    pub total_lines: usize,
    /// Lines that parsed as an http(s) URL with a host
    pub valid_lines: usize,
}

impl NormalizedCandidates {
    pub fn unique_count(&self) -> usize {
        self.candidates.len()
    }

    pub fn rejected_lines(&self) -> usize {
        self.total_lines - self.valid_lines
    }
}

/// Parser for the candidate URL list
pub struct CandidateParser;

impl CandidateParser {
    /// Parse a single line as an absolute `http`/`https` URL
    ///
    /// Returns `None` for blank lines, unparseable URLs, other schemes and
    /// URLs without a host. Path, query and credentials are discarded.
    pub fn parse_line(line: &str) -> Option<CandidateHost> {
        let line = line.trim_start_matches('\u{feff}').trim();
        if line.is_empty() {
            return None;
        }

        let url = Url::parse(line).ok()?;
        let scheme = Scheme::from_name(url.scheme())?;
        let host = url.host_str().filter(|h| !h.is_empty())?;
        let port = url.port().unwrap_or_else(|| scheme.default_port());

        Some(CandidateHost::new(scheme, host, port))
    }

    /// Normalize and deduplicate a sequence of lines
    pub fn normalize<I, S>(lines: I) -> NormalizedCandidates
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut result = NormalizedCandidates::default();

        for line in lines {
            result.total_lines += 1;
            let Some(candidate) = Self::parse_line(line.as_ref()) else {
                continue;
            };
            result.valid_lines += 1;
            if seen.insert(candidate.key()) {
                debug!(host = %candidate, "accepted candidate");
                result.candidates.push(candidate);
            }
        }

        info!(
            total_lines = result.total_lines,
            valid_lines = result.valid_lines,
            unique = result.unique_count(),
            "normalized candidate list"
        );
        result
    }

    /// Read the raw lines of the input file
    ///
    /// A missing or empty file is the one error that aborts a run. Bytes that
    /// are not valid UTF-8 are replaced, so such a line is still counted and
    /// left to the normalizer to accept or reject.
    pub fn read_lines<P: AsRef<Path>>(path: P) -> std::result::Result<Vec<String>, InputError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| InputError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        if bytes.is_empty() {
            return Err(InputError::Empty(path.to_path_buf()));
        }

        let body = bytes.strip_suffix(b"\n").unwrap_or(&bytes[..]);
        let lines: Vec<String> = body
            .split(|&b| b == b'\n')
            .map(|line| {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                String::from_utf8_lossy(line).into_owned()
            })
            .collect();
        Ok(lines)
    }

    /// Save lines to a file, one per line
    pub fn save_to_file<P: AsRef<Path>>(lines: &[String], path: P) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_default_port() {
        let host = CandidateParser::parse_line("http://A.Example/some/path?q=1").unwrap();
        assert_eq!(host.scheme, Scheme::Http);
        assert_eq!(host.host, "a.example");
        assert_eq!(host.port, 80);
    }

    #[test]
    fn test_parse_explicit_default_port() {
        let host = CandidateParser::parse_line("https://a.example:443").unwrap();
        assert_eq!(host.port, 443);
        assert_eq!(host.key(), "https://a.example");
    }

    #[test]
    fn test_parse_custom_port() {
        let host = CandidateParser::parse_line("  http://10.0.0.1:8080/  ").unwrap();
        assert_eq!(host.port, 8080);
        assert_eq!(host.key(), "http://10.0.0.1:8080");
    }

    #[test]
    fn test_parse_rejects_invalid_lines() {
        assert!(CandidateParser::parse_line("").is_none());
        assert!(CandidateParser::parse_line("   ").is_none());
        assert!(CandidateParser::parse_line("not-a-url").is_none());
        assert!(CandidateParser::parse_line("a.example:8080").is_none());
        assert!(CandidateParser::parse_line("ftp://a.example").is_none());
        assert!(CandidateParser::parse_line("socks5://a.example:1080").is_none());
        assert!(CandidateParser::parse_line("http://").is_none());
    }

    #[test]
    fn test_normalize_scheme_is_significant() {
        let lines = [
            "http://a.example",
            "https://a.example:443",
            "https://a.example",
            "not-a-url",
            "",
        ];
        let result = CandidateParser::normalize(lines);
        assert_eq!(result.total_lines, 5);
        assert_eq!(result.valid_lines, 3);
        assert_eq!(result.rejected_lines(), 2);

        let mut keys: Vec<String> = result.candidates.iter().map(|c| c.key()).collect();
        keys.sort();
        assert_eq!(keys, vec!["http://a.example", "https://a.example"]);
    }

    #[test]
    fn test_normalize_unique_keys() {
        let lines = [
            "http://b.example:8080/a",
            "http://B.example:8080/b",
            "http://b.example:8081",
            "http://b.example:80",
            "http://b.example",
        ];
        let result = CandidateParser::normalize(lines);
        let keys: HashSet<String> = result.candidates.iter().map(|c| c.key()).collect();
        assert_eq!(keys.len(), result.candidates.len());
        assert_eq!(result.unique_count(), 3);
    }

    #[test]
    fn test_normalize_first_line_wins() {
        let result = CandidateParser::normalize(["https://c.example/first", "https://c.example/second"]);
        assert_eq!(result.candidates.len(), 1);
        assert_eq!(result.valid_lines, 2);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let lines = vec![
            "https://x.example",
            "http://y.example:81",
            "garbage",
            "https://x.example:443/",
        ];
        let first: HashSet<CandidateHost> =
            CandidateParser::normalize(&lines).candidates.into_iter().collect();
        let second: HashSet<CandidateHost> =
            CandidateParser::normalize(&lines).candidates.into_iter().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parse_strips_byte_order_mark() {
        let result = CandidateParser::normalize(["\u{feff}http://a.example", "http://b.example"]);
        assert_eq!(result.valid_lines, 2);
        assert_eq!(result.candidates[0].key(), "http://a.example");
    }

    #[test]
    fn test_read_lines_tolerates_invalid_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("domains.txt");
        fs::write(&path, b"http://a.example\nhttp://caf\xe9.example\r\nhttps://b.example\n").unwrap();

        let lines = CandidateParser::read_lines(&path).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "http://a.example");
        assert_eq!(lines[2], "https://b.example");

        let result = CandidateParser::normalize(&lines);
        assert_eq!(result.total_lines, 3);
        let keys: HashSet<String> = result.candidates.iter().map(|c| c.key()).collect();
        assert!(keys.contains("http://a.example"));
        assert!(keys.contains("https://b.example"));
    }

    #[test]
    fn test_read_lines_missing_or_empty() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.txt");
        assert!(matches!(
            CandidateParser::read_lines(&missing),
            Err(InputError::Unreadable { .. })
        ));

        let empty = dir.path().join("empty.txt");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(CandidateParser::read_lines(&empty), Err(InputError::Empty(_))));
    }
}
