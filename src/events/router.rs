//! MQTT-style topic pattern matching.
//!
//! `*` matches exactly one dot-separated segment; a trailing `#` matches the
//! remaining suffix at any depth, including none. `/` separators are
//! normalised to `.` before matching so both spellings address the same
//! topic space.

use regex::Regex;

/// Compile a topic pattern into an anchored regex.
pub fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let normalized = pattern.replace('/', ".");

    // "a.b.#" matches "a.b" and anything below it.
    if let Some(prefix) = normalized.strip_suffix(".#") {
        let body = format!("^{}(\\..+)?$", segment_regex(prefix));
        return Regex::new(&body);
    }
    if normalized == "#" {
        return Regex::new("^.+$");
    }

    Regex::new(&format!("^{}$", segment_regex(&normalized)))
}

fn segment_regex(pattern: &str) -> String {
    pattern
        .split('.')
        .map(|segment| match segment {
            "*" => "[^.]+".to_string(),
            "#" => ".+".to_string(),
            literal => regex::escape(literal),
        })
        .collect::<Vec<_>>()
        .join("\\.")
}

/// Return true when `topic` matches `pattern`.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let normalized_topic = topic.replace('/', ".");
    if !pattern.contains('*') && !pattern.contains('#') {
        return pattern.replace('/', ".") == normalized_topic;
    }
    compile_pattern(pattern)
        .map(|re| re.is_match(&normalized_topic))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match() {
        assert!(topic_matches("iml.plans", "iml.plans"));
        assert!(!topic_matches("iml.plans", "iml.actions"));
    }

    #[test]
    fn star_matches_one_segment() {
        assert!(topic_matches("iml.triggers.*", "iml.triggers.fired"));
        assert!(!topic_matches("iml.triggers.*", "iml.triggers.a.b"));
        assert!(!topic_matches("iml.triggers.*", "iml.triggers"));
    }

    #[test]
    fn trailing_hash_matches_zero_or_more() {
        assert!(topic_matches("iml.triggers.#", "iml.triggers"));
        assert!(topic_matches("iml.triggers.#", "iml.triggers.fired"));
        assert!(topic_matches("iml.triggers.#", "iml.triggers.a.b.c"));
        assert!(!topic_matches("iml.triggers.#", "iml.plans"));
    }

    #[test]
    fn bare_hash_matches_everything() {
        assert!(topic_matches("#", "any.topic.at.all"));
    }

    #[test]
    fn slash_normalisation() {
        assert!(topic_matches("iml/triggers/*", "iml.triggers.fired"));
        assert!(topic_matches("iml.triggers.*", "iml/triggers/fired"));
    }

    #[test]
    fn star_in_the_middle() {
        assert!(topic_matches("iml.*.fired", "iml.triggers.fired"));
        assert!(!topic_matches("iml.*.fired", "iml.triggers.sub.fired"));
    }
}
