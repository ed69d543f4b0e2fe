//! Body text utilities shared by the fetcher and the delivery layer.

/// Maximum length of the derived `content_summary`.
pub const SUMMARY_MAX_CHARS: usize = 200;

/// ASCII case-insensitive substring search. Safe to use byte offsets as
/// char boundaries: the needles are pure ASCII and UTF-8 continuation
/// bytes never match ASCII.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Crude tag-stripping HTML to text conversion: drops script/style
/// blocks, replaces tags with whitespace, decodes the handful of
/// entities that matter, and collapses blank lines.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(i) = rest.find(['<', '&']) {
        let (plain, tail) = rest.split_at(i);
        text.push_str(plain);

        if tail.starts_with('<') {
            // Skip the contents of script/style elements entirely.
            let mut consumed = None;
            for tag in ["script", "style"] {
                if tail.len() > tag.len()
                    && tail.as_bytes()[1..1 + tag.len()].eq_ignore_ascii_case(tag.as_bytes())
                {
                    let close = format!("</{}", tag);
                    if let Some(close_at) = find_ascii_ci(tail, &close) {
                        if let Some(gt) = tail[close_at..].find('>') {
                            text.push('\n');
                            consumed = Some(close_at + gt + 1);
                        }
                    }
                }
            }
            if let Some(end) = consumed {
                rest = &tail[end..];
                continue;
            }

            // Ordinary tag: consume to '>' and emit a line break for
            // block-ish tags so words don't run together.
            let end = tail.find('>').map(|p| p + 1).unwrap_or(tail.len());
            let tag_name: String = tail[1..end]
                .trim_start_matches('/')
                .chars()
                .take_while(|ch| ch.is_ascii_alphanumeric())
                .collect::<String>()
                .to_ascii_lowercase();
            match tag_name.as_str() {
                "br" | "p" | "div" | "tr" | "li" | "h1" | "h2" | "h3" | "h4" | "table" => {
                    text.push('\n')
                }
                _ => text.push(' '),
            }
            rest = &tail[end..];
            continue;
        }

        // '&': decode the entity or emit it verbatim.
        let entities = [
            ("&amp;", '&'),
            ("&lt;", '<'),
            ("&gt;", '>'),
            ("&quot;", '"'),
            ("&#39;", '\''),
            ("&apos;", '\''),
            ("&nbsp;", ' '),
        ];
        match entities.iter().find(|(entity, _)| tail.starts_with(entity)) {
            Some((entity, replacement)) => {
                text.push(*replacement);
                rest = &tail[entity.len()..];
            }
            None => {
                text.push('&');
                rest = &tail[1..];
            }
        }
    }
    text.push_str(rest);

    // Collapse whitespace per line, drop empty lines.
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Derive the stored summary: carriage returns stripped, trimmed, capped
/// at `SUMMARY_MAX_CHARS` characters.
pub fn summarize(source: &str) -> String {
    let cleaned = source.replace('\r', "");
    truncate_chars(cleaned.trim(), SUMMARY_MAX_CHARS)
}

/// Truncate on a char boundary, appending an ellipsis when shortened.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_tags_and_collapses_lines() {
        let html = "<html><body><p>Hello <b>world</b></p>\n\n<div>second   line</div></body></html>";
        assert_eq!(html_to_text(html), "Hello world\nsecond line");
    }

    #[test]
    fn drops_script_and_style_contents() {
        let html = "<style>.a{color:red}</style><p>visible</p><script>alert(1)</script>";
        assert_eq!(html_to_text(html), "visible");
    }

    #[test]
    fn decodes_common_entities() {
        assert_eq!(html_to_text("a &amp; b &lt;c&gt;"), "a & b <c>");
    }

    #[test]
    fn summary_is_bounded_and_clean() {
        let body = format!("  first\r\n{}", "x".repeat(500));
        let summary = summarize(&body);
        assert!(summary.chars().count() <= SUMMARY_MAX_CHARS);
        assert!(summary.starts_with("first"));
        assert!(!summary.contains('\r'));
    }

    #[test]
    fn truncate_respects_multibyte_boundaries() {
        let s = "ééééé";
        assert_eq!(truncate_chars(s, 3), "éé…");
        assert_eq!(truncate_chars("abc", 3), "abc");
    }
}
