//! Host list parsing and deduplication.
//!
//! File format: one address per line. Blank lines and lines starting with
//! `#` or `//` are ignored; when a line has several fields (space, tab or
//! comma separated) only the first is the address.

use std::collections::HashSet;

/// Parse a line-oriented host list, keeping first-seen order.
pub fn parse_host_list(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut hosts = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        let address = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or("")
            .trim();
        if address.is_empty() {
            continue;
        }
        if seen.insert(address.to_string()) {
            hosts.push(address.to_string());
        }
    }

    hosts
}

/// Trim, drop empties and remove duplicates, keeping first-seen order.
pub fn dedup_hosts(hosts: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    hosts
        .iter()
        .map(|h| h.trim())
        .filter(|h| !h.is_empty())
        .filter(|h| seen.insert(h.to_string()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_comments_blanks_and_duplicates() {
        let input = "10.0.0.1\n# comment\n\n10.0.0.2, note\n10.0.0.1";
        assert_eq!(parse_host_list(input), vec!["10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn test_parse_handles_slash_comments_and_whitespace_fields() {
        let input = "  // decommissioned below\n10.0.0.3\tweb-03\n  10.0.0.4   db  \r\n";
        assert_eq!(parse_host_list(input), vec!["10.0.0.3", "10.0.0.4"]);
    }

    #[test]
    fn test_parse_leading_comma_line_is_skipped() {
        assert!(parse_host_list(",10.0.0.9\n   \n#only comments").is_empty());
    }

    #[test]
    fn test_dedup_hosts() {
        let hosts = vec![
            " 10.0.0.1".to_string(),
            "".to_string(),
            "10.0.0.2".to_string(),
            "10.0.0.1 ".to_string(),
        ];
        assert_eq!(dedup_hosts(&hosts), vec!["10.0.0.1", "10.0.0.2"]);
    }
}
