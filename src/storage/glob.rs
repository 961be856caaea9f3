//! Glob matching for `KEYS`.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[^abc]`, `[a-z]`) and
//! `\` escapes. Matching is byte-wise, so binary keys work.

/// A compiled glob pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    pattern: Vec<u8>,
}

impl GlobPattern {
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
        }
    }

    /// True when the pattern matches every key.
    pub fn is_match_all(&self) -> bool {
        !self.pattern.is_empty() && self.pattern.iter().all(|&b| b == b'*')
    }

    pub fn matches(&self, text: &[u8]) -> bool {
        match_from(&self.pattern, text)
    }
}

fn match_from(pattern: &[u8], text: &[u8]) -> bool {
    let Some(&first) = pattern.first() else {
        return text.is_empty();
    };

    match first {
        b'*' => {
            // Collapse runs of stars before branching.
            let rest = &pattern[1..];
            if rest.first() == Some(&b'*') {
                return match_from(rest, text);
            }
            (0..=text.len()).any(|i| match_from(rest, &text[i..]))
        }
        b'?' => !text.is_empty() && match_from(&pattern[1..], &text[1..]),
        b'[' => {
            let Some(&c) = text.first() else {
                return false;
            };
            match match_class(&pattern[1..], c) {
                Some((matched, consumed)) => matched && match_from(&pattern[1 + consumed..], &text[1..]),
                None => false,
            }
        }
        b'\\' if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && match_from(&pattern[2..], &text[1..])
        }
        literal => text.first() == Some(&literal) && match_from(&pattern[1..], &text[1..]),
    }
}

/// Matches `c` against a class body (the bytes after `[`). Returns whether it
/// matched and how many pattern bytes the class used, including `]`.
fn match_class(class: &[u8], c: u8) -> Option<(bool, usize)> {
    let mut i = 0;
    let negate = class.first() == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < class.len() && class[i] != b']' {
        if class[i] == b'\\' && i + 1 < class.len() {
            if class[i + 1] == c {
                matched = true;
            }
            i += 2;
            continue;
        }
        if i + 2 < class.len() && class[i + 1] == b'-' && class[i + 2] != b']' {
            let (lo, hi) = if class[i] <= class[i + 2] {
                (class[i], class[i + 2])
            } else {
                (class[i + 2], class[i])
            };
            if (lo..=hi).contains(&c) {
                matched = true;
            }
            i += 3;
            continue;
        }
        if class[i] == c {
            matched = true;
        }
        i += 1;
    }

    if i >= class.len() {
        // Unterminated class.
        return None;
    }
    Some((matched != negate, i + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(p: &str, t: &str) -> bool {
        GlobPattern::new(p.as_bytes()).matches(t.as_bytes())
    }

    #[test]
    fn test_wildcards() {
        assert!(glob("*", "anything"));
        assert!(glob("*", ""));
        assert!(glob("user:*", "user:42"));
        assert!(!glob("user:*", "session:42"));
        assert!(glob("h?llo", "hello"));
        assert!(!glob("h?llo", "hllo"));
        assert!(glob("a**b", "axxb"));
    }

    #[test]
    fn test_classes() {
        assert!(glob("h[ae]llo", "hallo"));
        assert!(!glob("h[ae]llo", "hillo"));
        assert!(glob("h[^e]llo", "hallo"));
        assert!(!glob("h[^e]llo", "hello"));
        assert!(glob("key[0-9]", "key7"));
        assert!(!glob("key[0-9]", "keyx"));
        assert!(!glob("key[0-9", "key7"));
    }

    #[test]
    fn test_escape() {
        assert!(glob("a\\*b", "a*b"));
        assert!(!glob("a\\*b", "axb"));
    }

    #[test]
    fn test_match_all() {
        assert!(GlobPattern::new(b"*").is_match_all());
        assert!(!GlobPattern::new(b"a*").is_match_all());
    }
}
