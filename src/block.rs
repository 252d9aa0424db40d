//! Splitting document source into independently cacheable blocks.
//!
//! A block starts at a section heading and runs up to, but not including,
//! the next heading that opens a block. Content before the first heading is
//! its own leading block. Headings inside delimited blocks (listings,
//! literals, passthroughs, comments, fences) never split.

use crate::hash::ContentHash;
use std::ops::Range;

/// Markup flavour that decides what a heading line and a delimited block
/// look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    #[default]
    Asciidoc,
    Markdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heading {
    /// Section level: 0 for the document title, 1 for `==`/`##`, and so on.
    pub level: u8,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub index: usize,
    pub byte_range: Range<usize>,
    pub char_range: Range<usize>,
    pub raw_text: String,
    pub content_hash: ContentHash,
    /// Heading that opens this block; `None` for the leading block.
    pub heading: Option<Heading>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splitter {
    pub dialect: Dialect,
    /// Headings deeper than this level stay inside their parent's block.
    pub max_level: u8,
}

impl Default for Splitter {
    fn default() -> Self {
        Self {
            dialect: Dialect::Asciidoc,
            max_level: 2,
        }
    }
}

/// Split with the default AsciiDoc rules.
pub fn split(text: &str) -> Vec<Block> {
    Splitter::default().split(text)
}

impl Splitter {
    pub fn new(dialect: Dialect, max_level: u8) -> Self {
        Self { dialect, max_level }
    }

    pub fn split(&self, text: &str) -> Vec<Block> {
        let mut builder = BlockBuilder::default();
        let mut fence: Option<Fence> = None;
        let mut byte = 0usize;
        let mut chars = 0usize;

        for line in text.split_inclusive('\n') {
            let content = line.trim_end_matches(['\n', '\r']);
            match fence.as_ref() {
                Some(open) => {
                    if open.closes(content) {
                        fence = None;
                    }
                }
                None => {
                    if let Some(opened) = Fence::open(self.dialect, content) {
                        fence = Some(opened);
                    } else if let Some(heading) = parse_heading(self.dialect, content) {
                        if heading.level <= self.max_level && byte > 0 {
                            builder.finish(text, byte, chars);
                        }
                        if heading.level <= self.max_level {
                            builder.heading = Some(heading);
                        }
                    }
                }
            }
            byte += line.len();
            chars += line.chars().count();
        }

        builder.finish(text, byte, chars);
        builder.blocks
    }
}

#[derive(Default)]
struct BlockBuilder {
    blocks: Vec<Block>,
    start_byte: usize,
    start_char: usize,
    heading: Option<Heading>,
}

impl BlockBuilder {
    fn finish(&mut self, text: &str, end_byte: usize, end_char: usize) {
        // Only the empty document produces an empty block.
        if end_byte == self.start_byte && !self.blocks.is_empty() {
            return;
        }
        let raw_text = text[self.start_byte..end_byte].to_string();
        self.blocks.push(Block {
            index: self.blocks.len(),
            byte_range: self.start_byte..end_byte,
            char_range: self.start_char..end_char,
            content_hash: ContentHash::of(&raw_text),
            raw_text,
            heading: self.heading.take(),
        });
        self.start_byte = end_byte;
        self.start_char = end_char;
    }
}

fn parse_heading(dialect: Dialect, line: &str) -> Option<Heading> {
    let marker = match dialect {
        Dialect::Asciidoc => match line.chars().next()? {
            c @ ('=' | '#') => c,
            _ => return None,
        },
        Dialect::Markdown => {
            let trimmed = line.trim_start_matches(' ');
            if line.len() - trimmed.len() > 3 || !trimmed.starts_with('#') {
                return None;
            }
            return parse_marker_run(trimmed, '#', true);
        }
    };
    parse_marker_run(line, marker, false)
}

fn parse_marker_run(line: &str, marker: char, allow_empty: bool) -> Option<Heading> {
    let count = line.chars().take_while(|&c| c == marker).count();
    if !(1..=6).contains(&count) {
        return None;
    }
    let rest = &line[count..];
    if rest.is_empty() {
        return allow_empty.then(|| Heading {
            level: (count - 1) as u8,
            title: String::new(),
        });
    }
    if !rest.starts_with([' ', '\t']) {
        return None;
    }
    let mut title = rest.trim();
    if marker == '#' {
        title = title.trim_end_matches('#').trim_end();
    }
    if title.is_empty() && !allow_empty {
        return None;
    }
    Some(Heading {
        level: (count - 1) as u8,
        title: title.to_string(),
    })
}

/// An open delimited block; headings inside it are content, not structure.
#[derive(Debug)]
struct Fence {
    marker: String,
    exact: bool,
}

impl Fence {
    fn open(dialect: Dialect, line: &str) -> Option<Self> {
        match dialect {
            Dialect::Asciidoc => {
                let line = line.trim_end();
                if matches!(line, "|===" | ",===" | ":===" | "!===") {
                    return Some(Self {
                        marker: line.to_string(),
                        exact: true,
                    });
                }
                if line.starts_with("```") {
                    return Some(Self {
                        marker: "```".to_string(),
                        exact: true,
                    });
                }
                let first = line.chars().next()?;
                let run = line.chars().take_while(|&c| c == first).count();
                if run != line.chars().count() {
                    return None;
                }
                let opens = match first {
                    '-' | '.' | '+' | '/' | '=' | '*' | '_' => run >= 4,
                    _ => false,
                };
                opens.then(|| Self {
                    marker: line.to_string(),
                    exact: true,
                })
            }
            Dialect::Markdown => {
                let trimmed = line.trim_start_matches(' ');
                if line.len() - trimmed.len() > 3 {
                    return None;
                }
                let first = trimmed.chars().next()?;
                if first != '`' && first != '~' {
                    return None;
                }
                let run = trimmed.chars().take_while(|&c| c == first).count();
                if run < 3 {
                    return None;
                }
                if first == '`' && trimmed[run..].contains('`') {
                    return None;
                }
                Some(Self {
                    marker: first.to_string().repeat(run),
                    exact: false,
                })
            }
        }
    }

    fn closes(&self, line: &str) -> bool {
        if self.exact {
            return line.trim_end() == self.marker;
        }
        let trimmed = line.trim();
        let first = self.marker.chars().next().unwrap_or('`');
        trimmed.len() >= self.marker.len() && trimmed.chars().all(|c| c == first)
    }
}
