//! Post-processing: deterministic normalisation of backend Markdown.
//!
//! Pandoc, Marker and Docling each have their own output habits: CRLF line
//! endings from Windows-authored DOCX, a BOM carried over from HTML, long runs
//! of blank lines where page breaks used to be, and image references pointing
//! at files the backend wrote into a scratch directory we delete afterwards.
//!
//! ## Rule Order
//!
//! Fences are stripped before line endings are normalised so the fence regex
//! sees the raw reply; image links are rewritten before blank-line collapsing
//! because removing a standalone image line can leave extra blank lines.

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all normalisation rules to raw backend output.
///
/// Rules (applied in order):
/// 1. Strip an outer ```` ```markdown ```` fence
/// 2. Normalise line endings (CRLF → LF)
/// 3. Trim trailing whitespace per line
/// 4. Replace local image references with their alt text
/// 5. Collapse 3+ consecutive blank lines down to 2
/// 6. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens, etc.)
/// 7. Ensure the text ends with exactly one newline
pub fn clean_markdown(input: &str) -> String {
    let s = strip_markdown_fences(input);
    let s = normalise_line_endings(&s);
    let s = trim_trailing_whitespace(&s);
    let s = remove_local_images(&s);
    let s = collapse_blank_lines(&s);
    let s = remove_invisible_chars(&s);
    ensure_final_newline(&s)
}

/// True when the text has no content besides whitespace.
pub fn is_blank(markdown: &str) -> bool {
    markdown.trim().is_empty()
}

// ── Rule 1: Strip outer markdown fences ──────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```(?:markdown|md)?\r?\n(.*)\r?\n```\s*$").unwrap());

fn strip_markdown_fences(input: &str) -> String {
    if let Some(caps) = RE_OUTER_FENCES.captures(input.trim()) {
        caps[1].to_string()
    } else {
        input.to_string()
    }
}

// ── Rule 2: Normalise line endings ───────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 3: Trim trailing whitespace per line ────────────────────────────────

fn trim_trailing_whitespace(input: &str) -> String {
    input
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Rule 4: Local image references ───────────────────────────────────────────
//
// Marker and Docling write extracted figures next to their Markdown and link
// them relatively (`![](_page_0_Picture_1.jpeg)`). The scratch directory is
// gone by the time the sibling `.md` is written, so the links would dangle.
// Absolute http(s) links are kept.

static RE_IMAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\(([^)]*)\)").unwrap());

fn is_remote_url(url: &str) -> bool {
    let u = url.trim();
    u.starts_with("http://") || u.starts_with("https://") || u.starts_with("data:")
}

fn remove_local_images(input: &str) -> String {
    RE_IMAGE
        .replace_all(input, |caps: &regex::Captures<'_>| {
            let alt = caps[1].trim();
            if is_remote_url(&caps[2]) {
                caps[0].to_string()
            } else if alt.is_empty() {
                String::new()
            } else {
                format!("*{}*", alt)
            }
        })
        .to_string()
}

// ── Rule 5: Collapse excessive blank lines ───────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").unwrap());

fn collapse_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "\n\n\n").to_string()
}

// ── Rule 6: Remove invisible Unicode characters ─────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
}

// ── Rule 7: Ensure file ends with single newline ─────────────────────────────

fn ensure_final_newline(input: &str) -> String {
    let trimmed = input.trim_end();
    if trimmed.is_empty() {
        String::from("\n")
    } else {
        format!("{}\n", trimmed)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        let input = "```markdown\n# Hello\nWorld\n```";
        assert_eq!(strip_markdown_fences(input), "# Hello\nWorld");
    }

    #[test]
    fn test_no_fences_passthrough() {
        let input = "# Hello\nWorld";
        assert_eq!(strip_markdown_fences(input), "# Hello\nWorld");
    }

    #[test]
    fn test_normalise_line_endings() {
        assert_eq!(normalise_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn test_collapse_blank_lines() {
        let input = "a\n\n\n\n\n\nb";
        assert_eq!(collapse_blank_lines(input), "a\n\n\nb");
    }

    #[test]
    fn test_ensure_final_newline() {
        assert_eq!(ensure_final_newline("hello"), "hello\n");
        assert_eq!(ensure_final_newline("hello\n\n\n"), "hello\n");
        assert_eq!(ensure_final_newline(""), "\n");
    }

    #[test]
    fn test_local_image_becomes_caption() {
        let input = "Intro\n![Budget overview](_page_3_Figure_1.jpeg)\nEnd";
        let result = remove_local_images(input);
        assert_eq!(result, "Intro\n*Budget overview*\nEnd");
    }

    #[test]
    fn test_local_image_without_alt_is_dropped() {
        assert_eq!(remove_local_images("![](_page_0_Picture_2.png)"), "");
    }

    #[test]
    fn test_remote_image_kept() {
        let input = "![Logo](https://example.org/logo.png)";
        assert_eq!(remove_local_images(input), input);
    }

    #[test]
    fn test_remove_invisible() {
        let input = "\u{FEFF}hello\u{200B}world\u{00AD}";
        assert_eq!(remove_invisible_chars(input), "helloworld");
    }

    #[test]
    fn test_clean_markdown_full_pipeline() {
        let input = "\u{FEFF}# Title\r\n\r\nSome text   \r\n\r\n\r\n\r\n\r\n![](img.png)\r\n## Section\r\n";
        let result = clean_markdown(input);
        assert!(result.starts_with("# Title\n"));
        assert!(result.ends_with("## Section\n"));
        assert!(!result.contains("\n\n\n\n"));
        assert!(!result.contains('\r'));
    }

    #[test]
    fn test_whitespace_only_output_is_blank() {
        assert!(is_blank(&clean_markdown(" \r\n\u{200B}\n")));
        assert!(!is_blank(&clean_markdown("x")));
    }
}
