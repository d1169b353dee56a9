//! Inline executable elements embedded in assistant text.
//!
//! The scanner is permissive and multi-line aware: it recognizes
//! `<websearch …>query</websearch>`, `<bash …>cmd</bash>` and
//! `<ask …>prompt</ask>` anywhere in the stream and leaves everything
//! else untouched.

use std::collections::HashMap;

pub const EXECUTABLE_ELEMENTS: &[&str] = &["websearch", "bash", "ask"];

#[derive(Debug, Clone, PartialEq)]
pub struct ElementMatch {
    pub element_type: String,
    pub attributes: HashMap<String, String>,
    pub content: String,
    /// Byte offset of `<` in the source text.
    pub index: usize,
    /// Byte length of the whole element including the closing tag.
    pub length: usize,
}

#[derive(Debug, Clone)]
pub struct InjectedResult {
    pub status: ResultStatus,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Success,
    Error,
}

impl ResultStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

/// Scan for executable elements. Unknown or unterminated elements are
/// skipped and remain part of the surrounding text.
pub fn extract_elements(text: &str) -> Vec<ElementMatch> {
    let mut matches = Vec::new();
    let bytes = text.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        let Some(open_rel) = text[pos..].find('<') else {
            break;
        };
        let open = pos + open_rel;
        let rest = &text[open + 1..];

        let Some(name) = EXECUTABLE_ELEMENTS
            .iter()
            .find(|name| {
                rest.starts_with(**name)
                    && matches!(
                        rest.as_bytes().get(name.len()).copied(),
                        Some(b' ') | Some(b'\t') | Some(b'\n') | Some(b'\r') | Some(b'>')
                    )
            })
            .copied()
        else {
            pos = open + 1;
            continue;
        };

        let after_name = open + 1 + name.len();
        let Some(tag_end_rel) = text[after_name..].find('>') else {
            pos = open + 1;
            continue;
        };
        let tag_end = after_name + tag_end_rel;
        let attributes = parse_attributes(&text[after_name..tag_end]);

        let close_tag = format!("</{name}>");
        let Some(close_rel) = text[tag_end + 1..].find(&close_tag) else {
            pos = open + 1;
            continue;
        };
        let content_start = tag_end + 1;
        let content_end = content_start + close_rel;
        let end = content_end + close_tag.len();

        matches.push(ElementMatch {
            element_type: name.to_string(),
            attributes,
            content: text[content_start..content_end].to_string(),
            index: open,
            length: end - open,
        });
        pos = end;
    }

    matches
}

/// Replace each matched element with a `<result>` fragment. Replacement
/// runs right-to-left so earlier indices stay valid.
pub fn inject_results(text: &str, pairs: &[(ElementMatch, InjectedResult)]) -> String {
    let mut ordered: Vec<&(ElementMatch, InjectedResult)> = pairs.iter().collect();
    ordered.sort_by(|a, b| b.0.index.cmp(&a.0.index));

    let mut out = text.to_string();
    for (element, result) in ordered {
        if element.index + element.length > out.len() {
            continue;
        }
        let fragment = format!(
            "<result for=\"{}\" status=\"{}\">{}</result>",
            element.element_type,
            result.status.as_str(),
            escape_text(&result.content),
        );
        out.replace_range(element.index..element.index + element.length, &fragment);
    }
    out
}

pub fn escape_text(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Parse `key="value"`, `key='value'`, bare `key=value`, and valueless
/// `key` pairs.
fn parse_attributes(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let bytes = raw.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }

        let key_start = i;
        while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
            i += 1;
        }
        let key = raw[key_start..i].to_string();
        if key.is_empty() {
            i += 1;
            continue;
        }

        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b'=' {
            attrs.insert(key, String::new());
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let value = if i < bytes.len() && (bytes[i] == b'"' || bytes[i] == b'\'') {
            let quote = bytes[i];
            i += 1;
            let start = i;
            while i < bytes.len() && bytes[i] != quote {
                i += 1;
            }
            let value = raw[start..i].to_string();
            if i < bytes.len() {
                i += 1;
            }
            value
        } else {
            let start = i;
            while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            raw[start..i].to_string()
        };

        attrs.insert(key, value);
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_single_element() {
        let text = "before <websearch limit=\"3\">rust async</websearch> after";
        let matches = extract_elements(text);
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.element_type, "websearch");
        assert_eq!(m.content, "rust async");
        assert_eq!(m.attributes.get("limit").map(String::as_str), Some("3"));
        assert_eq!(&text[m.index..m.index + m.length], "<websearch limit=\"3\">rust async</websearch>");
    }

    #[test]
    fn extracts_multiline_content() {
        let text = "<bash>\nls -la\nwc -l\n</bash>";
        let matches = extract_elements(text);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].content, "\nls -la\nwc -l\n");
    }

    #[test]
    fn unknown_elements_left_in_text() {
        let text = "keep <b>bold</b> and <custom>x</custom>";
        assert!(extract_elements(text).is_empty());
    }

    #[test]
    fn unterminated_element_skipped() {
        let text = "<bash>never closed";
        assert!(extract_elements(text).is_empty());
    }

    #[test]
    fn multiple_elements_in_order() {
        let text = "<bash>a</bash> mid <ask>b</ask>";
        let matches = extract_elements(text);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].element_type, "bash");
        assert_eq!(matches[1].element_type, "ask");
        assert!(matches[0].index < matches[1].index);
    }

    #[test]
    fn attribute_quoting_styles() {
        let text = r#"<ask id='q1' kind=quick required>pick one</ask>"#;
        let matches = extract_elements(text);
        let attrs = &matches[0].attributes;
        assert_eq!(attrs.get("id").map(String::as_str), Some("q1"));
        assert_eq!(attrs.get("kind").map(String::as_str), Some("quick"));
        assert_eq!(attrs.get("required").map(String::as_str), Some(""));
    }

    #[test]
    fn inject_replaces_right_to_left() {
        let text = "run <bash>ls</bash> then <bash>pwd</bash>";
        let matches = extract_elements(text);
        let pairs: Vec<_> = matches
            .into_iter()
            .map(|m| {
                let content = format!("out of {}", m.content);
                (
                    m,
                    InjectedResult {
                        status: ResultStatus::Success,
                        content,
                    },
                )
            })
            .collect();

        let out = inject_results(text, &pairs);
        assert_eq!(
            out,
            "run <result for=\"bash\" status=\"success\">out of ls</result> \
             then <result for=\"bash\" status=\"success\">out of pwd</result>"
        );
    }

    #[test]
    fn inject_escapes_markup() {
        let text = "<bash>ls</bash>";
        let matches = extract_elements(text);
        let pairs = vec![(
            matches[0].clone(),
            InjectedResult {
                status: ResultStatus::Error,
                content: "a < b && c > d".into(),
            },
        )];
        let out = inject_results(text, &pairs);
        assert_eq!(
            out,
            "<result for=\"bash\" status=\"error\">a &lt; b &amp;&amp; c &gt; d</result>"
        );
    }
}
