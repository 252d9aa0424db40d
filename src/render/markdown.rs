//! Markdown backend: pulldown-cmark HTML with syntect-highlighted code.
//!
//! Highlighted code carries inline theme colours, so fragments from this
//! backend are only valid for the theme they were rendered with.

use super::{BlockRender, RenderError, RendererFactory};
use pulldown_cmark::{CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd, html};
use std::borrow::Cow;
use std::sync::Arc;
use syntect::highlighting::Theme;
use syntect::parsing::{SyntaxReference, SyntaxSet};

#[derive(Clone)]
pub struct MarkdownFactory {
    syntax_set: Arc<SyntaxSet>,
    theme: Arc<Theme>,
}

impl MarkdownFactory {
    pub fn new(syntax_set: Arc<SyntaxSet>, theme: Theme) -> Self {
        Self {
            syntax_set,
            theme: Arc::new(theme),
        }
    }
}

impl RendererFactory for MarkdownFactory {
    fn create(&self) -> Result<Box<dyn BlockRender>, RenderError> {
        Ok(Box::new(MarkdownRenderer {
            syntax_set: Arc::clone(&self.syntax_set),
            theme: Arc::clone(&self.theme),
        }))
    }

    fn name(&self) -> &str {
        "markdown"
    }
}

pub struct MarkdownRenderer {
    syntax_set: Arc<SyntaxSet>,
    theme: Arc<Theme>,
}

struct CodeBlock {
    language: Option<String>,
    text: String,
}

impl BlockRender for MarkdownRenderer {
    fn render(&mut self, source: &str) -> Result<String, RenderError> {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        options.insert(Options::ENABLE_FOOTNOTES);

        let normalized = normalize_line_endings(source);
        let parser = Parser::new_ext(normalized.as_ref(), options);

        let mut events: Vec<Event<'_>> = Vec::new();
        let mut code_block: Option<CodeBlock> = None;
        for event in parser {
            match event {
                Event::Start(Tag::CodeBlock(kind)) => {
                    code_block = Some(CodeBlock {
                        language: match kind {
                            CodeBlockKind::Fenced(info) => {
                                info.split_whitespace().next().map(str::to_string)
                            }
                            CodeBlockKind::Indented => None,
                        },
                        text: String::new(),
                    });
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some(block) = code_block.take() {
                        let highlighted = self.highlight(&block)?;
                        events.push(Event::Html(CowStr::from(highlighted)));
                    }
                }
                Event::Text(text) if code_block.is_some() => {
                    if let Some(block) = code_block.as_mut() {
                        block.text.push_str(&text);
                    }
                }
                other => events.push(other),
            }
        }

        let mut out = String::with_capacity(source.len() * 3 / 2);
        html::push_html(&mut out, events.into_iter());
        Ok(out)
    }
}

impl MarkdownRenderer {
    fn highlight(&self, block: &CodeBlock) -> Result<String, RenderError> {
        let syntax = resolve_code_syntax(&self.syntax_set, block.language.as_deref());
        syntect::html::highlighted_html_for_string(
            &block.text,
            &self.syntax_set,
            syntax,
            &self.theme,
        )
            .map_err(|err| RenderError::Backend(format!("highlighting failed: {err}")))
    }
}

fn normalize_line_endings(input: &str) -> Cow<'_, str> {
    if input.contains('\r') {
        Cow::Owned(input.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(input)
    }
}

fn resolve_code_syntax<'a>(syntax_set: &'a SyntaxSet, lang: Option<&str>) -> &'a SyntaxReference {
    let Some(lang) = lang.map(|l| l.trim()).filter(|l| !l.is_empty()) else {
        return syntax_set.find_syntax_plain_text();
    };
    let token = lang.strip_prefix("language-").unwrap_or(lang);
    for cand in language_candidates(token) {
        if let Some(syntax) = syntax_set.find_syntax_by_token(&cand) {
            return syntax;
        }
        if let Some(syntax) = syntax_set.find_syntax_by_extension(&cand) {
            return syntax;
        }
    }
    syntax_set.find_syntax_plain_text()
}

fn language_candidates(lang: &str) -> Vec<String> {
    let mut out = Vec::new();
    match lang.to_ascii_lowercase().as_str() {
        "elixir" | "ex" | "exs" => {
            out.push("Elixir".to_string());
            out.push("ex".to_string());
        }
        "shell" | "console" | "bash" | "zsh" => out.push("sh".to_string()),
        _ => {}
    }
    out.push(lang.to_string());
    out
}
