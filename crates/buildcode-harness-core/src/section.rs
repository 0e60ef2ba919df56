//! Section label detection for chunks whose page carries no label.
//!
//! Patterns are tried in priority order (section numbers before chapters
//! before articles); the first pattern that matches anywhere in the text
//! supplies the label.

use std::sync::OnceLock;

use regex::Regex;

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)\bSection\s+(\d+(?:\.\d+)*)",
            r"(?i)\bChapter\s+(\d+)",
            r"(?i)\bArticle\s+(\d+)",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Return the first section, chapter, or article number found in `text`.
pub fn detect_section(text: &str) -> Option<String> {
    patterns()
        .iter()
        .find_map(|re| re.captures(text))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dotted_section_number() {
        assert_eq!(
            detect_section("See SECTION 1004.5.1 for occupant load.").as_deref(),
            Some("1004.5.1")
        );
    }

    #[test]
    fn test_section_beats_chapter() {
        let text = "Chapter 10 covers egress. Section 1005 sets widths.";
        assert_eq!(detect_section(text).as_deref(), Some("1005"));
    }

    #[test]
    fn test_chapter_and_article() {
        assert_eq!(detect_section("chapter 7 fire").as_deref(), Some("7"));
        assert_eq!(detect_section("Article 250 grounding").as_deref(), Some("250"));
    }

    #[test]
    fn test_no_label() {
        assert_eq!(detect_section("Guards shall be 42 inches high."), None);
        assert_eq!(detect_section("Subsection without digits"), None);
    }
}
