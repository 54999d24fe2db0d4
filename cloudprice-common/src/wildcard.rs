/// Allow-list pattern helpers shared across the pricing crates.
///
/// Patterns support `*` (any substring, including empty) and `?` (exactly one
/// character). This is a flat-string matcher, not a path matcher: there is no
/// segment handling and no character classes.

/// Parse a comma-separated pattern list.
///
/// - Trims whitespace
/// - Drops empty entries
pub fn split_patterns(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Return true if `candidate` matches the glob `pattern`.
pub fn matches(pattern: &str, candidate: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let cand: Vec<char> = candidate.chars().collect();
    matches_at(&pat, &cand)
}

/// Return true if `candidate` matches at least one of `patterns`.
pub fn matches_any(patterns: &[String], candidate: &str) -> bool {
    patterns.iter().any(|p| matches(p, candidate))
}

fn matches_at(pat: &[char], cand: &[char]) -> bool {
    // Iterative matcher with single-star backtracking. `*` records a resume
    // point; on mismatch we re-expand the most recent star by one character.
    let mut p = 0usize;
    let mut c = 0usize;
    let mut star: Option<usize> = None;
    let mut star_cand = 0usize;

    while c < cand.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == cand[c]) {
            p += 1;
            c += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_cand = c;
            p += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            star_cand += 1;
            c = star_cand;
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_require_exact_match() {
        assert!(matches("m5.xlarge", "m5.xlarge"));
        assert!(!matches("m5.xlarge", "m5.2xlarge"));
    }

    #[test]
    fn star_matches_any_substring() {
        assert!(matches("m5.*", "m5.xlarge"));
        assert!(matches("m5.*", "m5."));
        assert!(!matches("m5.*", "m4.xlarge"));
        assert!(matches("*large", "m5.xlarge"));
        assert!(matches("n1-*-8", "n1-standard-8"));
        assert!(matches("*", "anything"));
        assert!(matches("*", ""));
    }

    #[test]
    fn question_mark_matches_exactly_one_char() {
        assert!(matches("m?.xlarge", "m5.xlarge"));
        assert!(!matches("m?.xlarge", "m50.xlarge"));
        assert!(!matches("m?.xlarge", "m.xlarge"));
    }

    #[test]
    fn star_backtracking_handles_repeated_fragments() {
        assert!(matches("*ab*ab", "xabyabab"));
        assert!(!matches("*ab*ac", "xabyabab"));
    }

    #[test]
    fn split_drops_blanks() {
        assert_eq!(
            split_patterns(" m5.* , ,c5.large,"),
            vec!["m5.*".to_string(), "c5.large".to_string()]
        );
        assert!(split_patterns("  ").is_empty());
    }

    #[test]
    fn matches_any_over_pattern_list() {
        let patterns = vec!["m5.*".to_string(), "c5.large".to_string()];
        assert!(matches_any(&patterns, "m5.xlarge"));
        assert!(matches_any(&patterns, "c5.large"));
        assert!(!matches_any(&patterns, "t3.micro"));
    }
}
