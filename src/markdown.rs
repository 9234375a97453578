use iced::widget::{column, container, rich_text, span, text::Span};
use iced::{font, Element, Font};
use pulldown_cmark::{CodeBlockKind, Event, HeadingLevel, Options, Parser, Tag};

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Inline {
    pub text: String,
    pub strong: bool,
    pub emphasis: bool,
    pub code: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Block {
    Heading(u8, Vec<Inline>),
    Paragraph(Vec<Inline>),
    Item { marker: String, depth: usize, inlines: Vec<Inline> },
    Code(String),
    Rule,
}

#[derive(Default)]
struct Builder {
    blocks: Vec<Block>,
    current: Vec<Inline>,
    strong: usize,
    emphasis: usize,
    heading: Option<u8>,
    lists: Vec<Option<u64>>,
    item_marker: Option<String>,
    code: Option<String>,
}

impl Builder {
    fn push_text(&mut self, text: &str, code: bool) {
        if let Some(buffer) = self.code.as_mut() {
            buffer.push_str(text);
            return;
        }
        self.current.push(Inline {
            text: text.to_string(),
            strong: self.strong > 0,
            emphasis: self.emphasis > 0,
            code,
        });
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        let inlines = std::mem::take(&mut self.current);
        let block = if let Some(level) = self.heading {
            Block::Heading(level, inlines)
        } else if let Some(marker) = self.item_marker.take() {
            Block::Item {
                marker,
                depth: self.lists.len().saturating_sub(1),
                inlines,
            }
        } else if !self.lists.is_empty() {
            Block::Item {
                marker: String::new(),
                depth: self.lists.len().saturating_sub(1),
                inlines,
            }
        } else {
            Block::Paragraph(inlines)
        };
        self.blocks.push(block);
    }

    fn next_marker(&mut self) -> String {
        match self.lists.last_mut() {
            Some(Some(n)) => {
                let marker = format!("{}.", n);
                *n += 1;
                marker
            }
            _ => "•".to_string(),
        }
    }
}

fn heading_level(level: HeadingLevel) -> u8 {
    match level {
        HeadingLevel::H1 => 1,
        HeadingLevel::H2 => 2,
        HeadingLevel::H3 => 3,
        HeadingLevel::H4 => 4,
        HeadingLevel::H5 => 5,
        HeadingLevel::H6 => 6,
    }
}

/// Flattens model Markdown into displayable blocks.
pub fn parse(markdown: &str) -> Vec<Block> {
    let mut builder = Builder::default();
    let options = Options::ENABLE_STRIKETHROUGH | Options::ENABLE_TASKLISTS;

    for event in Parser::new_ext(markdown, options) {
        match event {
            Event::Start(tag) => match tag {
                Tag::Heading(level, _, _) => {
                    builder.flush();
                    builder.heading = Some(heading_level(level));
                }
                Tag::Paragraph => builder.flush(),
                Tag::List(start) => {
                    builder.flush();
                    builder.lists.push(start);
                }
                Tag::Item => {
                    builder.flush();
                    builder.item_marker = Some(builder.next_marker());
                }
                Tag::CodeBlock(kind) => {
                    builder.flush();
                    if let CodeBlockKind::Fenced(lang) = kind {
                        tracing::trace!("code block ({})", lang);
                    }
                    builder.code = Some(String::new());
                }
                Tag::Strong => builder.strong += 1,
                Tag::Emphasis => builder.emphasis += 1,
                _ => {}
            },
            Event::End(tag) => match tag {
                Tag::Heading(..) => {
                    builder.flush();
                    builder.heading = None;
                }
                Tag::Paragraph | Tag::Item => builder.flush(),
                Tag::List(_) => {
                    builder.flush();
                    builder.lists.pop();
                }
                Tag::CodeBlock(_) => {
                    if let Some(code) = builder.code.take() {
                        builder.blocks.push(Block::Code(code.trim_end().to_string()));
                    }
                }
                Tag::Strong => builder.strong = builder.strong.saturating_sub(1),
                Tag::Emphasis => builder.emphasis = builder.emphasis.saturating_sub(1),
                _ => {}
            },
            Event::Text(text) => builder.push_text(&text, false),
            Event::Code(text) => builder.push_text(&text, true),
            Event::SoftBreak => builder.push_text(" ", false),
            Event::HardBreak => builder.push_text("\n", false),
            Event::Rule => {
                builder.flush();
                builder.blocks.push(Block::Rule);
            }
            Event::TaskListMarker(done) => builder.push_text(if done { "[x] " } else { "[ ] " }, false),
            Event::Html(html) => builder.push_text(&html, false),
            _ => {}
        }
    }

    builder.flush();
    builder.blocks
}

fn spans<'a, Link>(inlines: &[Inline], size: f32, bold: bool) -> Vec<Span<'a, Link, Font>> {
    inlines
        .iter()
        .map(|inline| {
            let mut f = if inline.code { Font::MONOSPACE } else { Font::DEFAULT };
            if inline.strong || bold {
                f.weight = font::Weight::Bold;
            }
            if inline.emphasis {
                f.style = font::Style::Italic;
            }
            span(inline.text.clone()).font(f).size(size)
        })
        .collect()
}

/// Renders Markdown as a column of rich-text blocks.
pub fn view<'a, Message: Clone + 'static>(markdown: &str) -> Element<'a, Message> {
    let mut content = column![].spacing(8);

    for block in parse(markdown) {
        let element: Element<'a, Message> = match block {
            Block::Heading(level, inlines) => {
                let size = match level {
                    1 => 24.0,
                    2 => 20.0,
                    3 => 18.0,
                    _ => 16.0,
                };
                rich_text(spans::<Message>(&inlines, size, true)).into()
            }
            Block::Paragraph(inlines) => rich_text(spans::<Message>(&inlines, 15.0, false)).into(),
            Block::Item { marker, depth, inlines } => {
                let mut line = vec![span(format!("{}{} ", "    ".repeat(depth), marker)).size(15.0)];
                line.extend(spans::<Message>(&inlines, 15.0, false));
                rich_text(line).into()
            }
            Block::Code(code) => container(iced::widget::text(code).font(Font::MONOSPACE).size(14))
                .padding(8)
                .style(container::rounded_box)
                .into(),
            Block::Rule => iced::widget::horizontal_rule(1).into(),
        };
        content = content.push(element);
    }

    content.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(inlines: &[Inline]) -> String {
        inlines.iter().map(|i| i.text.as_str()).collect()
    }

    #[test]
    fn test_heading_and_paragraph() {
        let blocks = parse("## Final Answer\n\nThe result is **42**.");
        assert_eq!(blocks.len(), 2);
        match &blocks[0] {
            Block::Heading(level, inlines) => {
                assert_eq!(*level, 2);
                assert_eq!(plain(inlines), "Final Answer");
            }
            other => panic!("unexpected block: {other:?}"),
        }
        match &blocks[1] {
            Block::Paragraph(inlines) => {
                assert_eq!(plain(inlines), "The result is 42.");
                assert!(inlines.iter().any(|i| i.strong && i.text == "42"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn test_ordered_and_bulleted_lists() {
        let blocks = parse("1. first\n2. second\n\n- apple\n- pear");
        let markers: Vec<&str> = blocks
            .iter()
            .filter_map(|b| match b {
                Block::Item { marker, .. } => Some(marker.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(markers, vec!["1.", "2.", "•", "•"]);
    }

    #[test]
    fn test_code_block_kept_verbatim() {
        let blocks = parse("```rust\nlet x = 1;\n```\n");
        assert_eq!(blocks, vec![Block::Code("let x = 1;".to_string())]);
    }

    #[test]
    fn test_inline_code_is_marked() {
        let blocks = parse("Use `x^2` here");
        match &blocks[0] {
            Block::Paragraph(inlines) => assert!(inlines.iter().any(|i| i.code && i.text == "x^2")),
            other => panic!("unexpected block: {other:?}"),
        }
    }
}
