//! Byte-preserving HTML helpers.
//!
//! Article bodies are edited in place with span replacement so that content
//! the pipeline does not touch comes out byte-identical. `scraper` is only
//! used where a real parse is needed (visible text).

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;

// Tag bodies skip over quoted values so a `>` inside an attribute does not end the tag.
static IFRAME_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<iframe\b(?:"[^"]*"|'[^']*'|[^'">])*>"#).expect("valid regex")
});

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<([a-z][a-z0-9]*)\b(?:"[^"]*"|'[^']*'|[^'">])*>"#).expect("valid regex")
});

static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)(?:^|\s)([a-z_:][-a-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#,
    )
    .expect("valid regex")
});

/// Visible text shorter than this marks a body as embed-only.
pub const EMBED_ONLY_TEXT_THRESHOLD: usize = 10;

/// One `<iframe>` element located in a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IframeSpan {
    /// Byte range of the whole element, closing tag included when present.
    pub span: Range<usize>,
    pub src: Option<String>,
}

pub fn find_iframes(html: &str) -> Vec<IframeSpan> {
    let lower = html.to_ascii_lowercase();
    let opens = IFRAME_OPEN_RE.find_iter(html).collect::<Vec<_>>();
    let mut spans = Vec::with_capacity(opens.len());

    for (index, open) in opens.iter().enumerate() {
        let search_end = opens
            .get(index + 1)
            .map_or(html.len(), |next| next.start());
        let end = lower[open.end()..search_end]
            .find("</iframe")
            .and_then(|offset| {
                let close_start = open.end() + offset;
                lower[close_start..search_end]
                    .find('>')
                    .map(|close| close_start + close + 1)
            })
            .unwrap_or(open.end());

        let src = attribute(open.as_str(), "src").filter(|value| !value.trim().is_empty());
        spans.push(IframeSpan {
            span: open.start()..end,
            src: src.map(|value| value.trim().to_string()),
        });
    }
    spans
}

/// Replace byte ranges, which must be sorted and non-overlapping.
pub fn splice(html: &str, replacements: &[(Range<usize>, String)]) -> String {
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;
    for (range, replacement) in replacements {
        out.push_str(&html[cursor..range.start]);
        out.push_str(replacement);
        cursor = range.end;
    }
    out.push_str(&html[cursor..]);
    out
}

/// Decoded value of an attribute in a single start tag.
pub fn attribute(tag: &str, name: &str) -> Option<String> {
    tag_attributes(tag)
        .into_iter()
        .find(|attribute| attribute.name.eq_ignore_ascii_case(name))
        .map(|attribute| attribute.value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TagAttribute {
    name: String,
    value: String,
    /// Range of the whole `name=value` text inside the tag.
    range: Range<usize>,
}

fn tag_attributes(tag: &str) -> Vec<TagAttribute> {
    // Skip `<name` so the tag name is never read as an attribute.
    let body_start = tag
        .char_indices()
        .skip(1)
        .find(|(_, ch)| ch.is_whitespace() || *ch == '>' || *ch == '/')
        .map_or(tag.len(), |(index, _)| index);

    ATTRIBUTE_RE
        .captures_iter(&tag[body_start..])
        .filter_map(|captures| {
            let name = captures.get(1)?;
            let raw = captures
                .get(2)
                .or_else(|| captures.get(3))
                .or_else(|| captures.get(4))?;
            let whole = captures.get(0)?;
            Some(TagAttribute {
                name: name.as_str().to_ascii_lowercase(),
                value: decode_entities(raw.as_str()),
                range: body_start + name.start()..body_start + whole.end(),
            })
        })
        .collect()
}

/// Rewrite attribute values on selected elements. `rewrite` gets the tag
/// name, attribute name and decoded value; `Some` replaces the value.
pub fn rewrite_attributes<F>(html: &str, tags: &[&str], attributes: &[&str], mut rewrite: F) -> String
where
    F: FnMut(&str, &str, &str) -> Option<String>,
{
    let mut replacements = Vec::new();
    for captures in TAG_RE.captures_iter(html) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let tag_name = name.as_str().to_ascii_lowercase();
        if !tags.contains(&tag_name.as_str()) {
            continue;
        }
        for attribute in tag_attributes(whole.as_str()) {
            if !attributes.contains(&attribute.name.as_str()) {
                continue;
            }
            if let Some(value) = rewrite(&tag_name, &attribute.name, &attribute.value) {
                let start = whole.start() + attribute.range.start;
                let end = whole.start() + attribute.range.end;
                replacements.push((
                    start..end,
                    format!("{}=\"{}\"", attribute.name, escape_attribute(&value)),
                ));
            }
        }
    }
    splice(html, &replacements)
}

/// Every value of the given attributes on the given elements, in document order.
pub fn collect_attributes(html: &str, tags: &[&str], attributes: &[&str]) -> Vec<(String, String)> {
    let mut found = Vec::new();
    rewrite_attributes(html, tags, attributes, |tag, _, value| {
        found.push((tag.to_string(), value.to_string()));
        None
    });
    found
}

/// Number of visible text characters outside iframes, scripts and styles.
pub fn visible_text_len(html: &str) -> usize {
    let fragment = Html::parse_fragment(html);
    fragment
        .tree
        .root()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|element| matches!(element.name(), "iframe" | "script" | "style"))
            });
            (!hidden).then(|| text.trim().chars().count())
        })
        .sum()
}

pub fn is_embed_only(html: &str) -> bool {
    !find_iframes(html).is_empty() && visible_text_len(html) <= EMBED_ONLY_TEXT_THRESHOLD
}

pub fn escape_attribute(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn escape_text(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn decode_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_iframes_with_and_without_closing_tags() {
        let html = r#"<p>a</p><IFRAME src="https://x/1"></iframe><iframe src='https://x/2'><iframe data-x="1">"#;
        let spans = find_iframes(html);
        assert_eq!(spans.len(), 3);
        assert_eq!(&html[spans[0].span.clone()], r#"<IFRAME src="https://x/1"></iframe>"#);
        assert_eq!(spans[1].src.as_deref(), Some("https://x/2"));
        assert_eq!(&html[spans[1].span.clone()], "<iframe src='https://x/2'>");
        assert_eq!(spans[2].src, None);
    }

    #[test]
    fn data_src_is_not_mistaken_for_src() {
        let spans = find_iframes(r#"<iframe data-src="a" src="b"></iframe>"#);
        assert_eq!(spans[0].src.as_deref(), Some("b"));
    }

    #[test]
    fn rewrite_only_touches_selected_values() {
        let html = r#"<div class="k"><img alt="x" src="a.png?x=1&amp;y=2"><a href='b'>b</a></div>"#;
        let rewritten = rewrite_attributes(html, &["img"], &["src"], |_, _, value| {
            assert_eq!(value, "a.png?x=1&y=2");
            Some("local/a.png".to_string())
        });
        assert_eq!(
            rewritten,
            r#"<div class="k"><img alt="x" src="local/a.png"><a href='b'>b</a></div>"#
        );
    }

    #[test]
    fn quoted_angle_brackets_stay_inside_the_tag() {
        let html = r#"<img alt="a>b" title='c>d' src="x.png"><p>after</p>"#;
        let rewritten = rewrite_attributes(html, &["img"], &["src"], |_, _, value| {
            assert_eq!(value, "x.png");
            Some("local/x.png".to_string())
        });
        assert_eq!(
            rewritten,
            r#"<img alt="a>b" title='c>d' src="local/x.png"><p>after</p>"#
        );

        let spans = find_iframes(r#"<iframe title="1 > 0" src="https://x/3"></iframe>"#);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].src.as_deref(), Some("https://x/3"));
    }

    #[test]
    fn visible_text_ignores_embeds_and_scripts() {
        let html = "<p> Hi </p><iframe src=\"x\">fallback text here</iframe><script>var a = 1;</script>";
        assert_eq!(visible_text_len(html), 2);
        assert!(is_embed_only(html));
        assert!(!is_embed_only("<p>Plenty of real article text</p><iframe src=\"x\"></iframe>"));
        assert!(!is_embed_only("<p>short</p>"));
    }
}
