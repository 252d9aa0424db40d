//! Page scaffold around the rendered block fragments.

use crate::render::{Fragment, FragmentOrigin};
use pulldown_cmark_escape::escape_html;
use std::fmt::Write as _;

const BASE_CSS: &str = "\
body { margin: 0; font-family: system-ui, sans-serif; line-height: 1.55; }
#content { max-width: 52rem; margin: 0 auto; padding: 1.5rem 2rem; }
.adoc-fallback { white-space: pre-wrap; border-left: 3px solid #c0392b; padding: 0.5rem 0.75rem; }
pre { padding: 0.75rem 1rem; overflow-x: auto; }
";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentShell {
    /// Used when the document has no level-0 heading.
    pub default_title: String,
    /// Extra CSS appended after the base rules (theme colours).
    pub stylesheet: String,
}

impl DocumentShell {
    pub fn new(default_title: impl Into<String>, stylesheet: impl Into<String>) -> Self {
        Self {
            default_title: default_title.into(),
            stylesheet: stylesheet.into(),
        }
    }

    pub fn assemble(&self, title: Option<&str>, fragments: &[Fragment]) -> String {
        let body_len: usize = fragments.iter().map(|f| f.html.len() + 96).sum();
        let mut out =
            String::with_capacity(body_len + BASE_CSS.len() + self.stylesheet.len() + 256);

        out.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>");
        push_escaped(&mut out, title.unwrap_or(&self.default_title));
        out.push_str("</title>\n<style>\n");
        out.push_str(BASE_CSS);
        out.push_str(&self.stylesheet);
        out.push_str("</style>\n</head>\n<body>\n<div id=\"content\">\n");

        for fragment in fragments {
            // Cached and rendered fragments must produce the same page.
            let _ = write!(
                out,
                "<div class=\"adoc-block\" data-index=\"{}\" data-hash=\"{}\"",
                fragment.index,
                fragment.hash.short(),
            );
            if fragment.origin == FragmentOrigin::Fallback {
                out.push_str(" data-fallback");
            }
            out.push_str(">\n");
            out.push_str(&fragment.html);
            if !fragment.html.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("</div>\n");
        }

        out.push_str("</div>\n</body>\n</html>\n");
        out
    }
}

/// Plain-text stand-in for a block whose renderer failed.
pub fn fallback_html(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + 48);
    out.push_str("<pre class=\"adoc-fallback\">");
    push_escaped(&mut out, source);
    out.push_str("</pre>\n");
    out
}

pub fn push_escaped(out: &mut String, text: &str) {
    let _ = escape_html(out, text);
}
