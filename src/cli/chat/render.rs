//! Markdown to terminal text for bot replies.
//!
//! Replies are parsed as GitHub flavored markdown and the resulting mdast is
//! walked block by block. Unknown nodes render as nothing.

use crossterm::style::Stylize;
use markdown::{mdast, to_mdast, ParseOptions};

use super::conversation_state::{Message, Role};

const RULE_WIDTH: usize = 40;

pub struct MarkdownRenderer {
    styled: bool,
}

impl MarkdownRenderer {
    /// `styled` selects ANSI output; without it the layout is kept and only
    /// the markup is removed.
    pub fn new(styled: bool) -> Self {
        Self { styled }
    }

    /// Format one message for the transcript. User text is shown verbatim.
    pub fn message(&self, message: &Message) -> String {
        match message.role {
            Role::User => {
                let line = format!("> {}", message.content);
                if self.styled {
                    line.green().to_string()
                } else {
                    line
                }
            }
            Role::Bot => self.render(&message.content),
        }
    }

    pub fn render(&self, text: &str) -> String {
        let root = match to_mdast(text, &ParseOptions::gfm()) {
            Ok(node) => node,
            Err(e) => {
                tracing::debug!("Showing reply unformatted: {}", e);
                return text.to_string();
            }
        };

        let nodes = match root {
            mdast::Node::Root(root) => root.children,
            other => vec![other],
        };

        self.blocks(&nodes)
    }

    /// Blocks are separated by a blank line, except that a heading sits
    /// directly on top of what follows it.
    fn blocks(&self, nodes: &[mdast::Node]) -> String {
        let mut out = String::new();
        let mut previous: Option<&mdast::Node> = None;

        for node in nodes {
            let lines = self.block(node, 0);
            if lines.is_empty() {
                continue;
            }
            match previous {
                Some(mdast::Node::Heading(_)) => out.push('\n'),
                Some(_) => out.push_str("\n\n"),
                None => {}
            }
            out.push_str(&lines.join("\n"));
            previous = Some(node);
        }

        out
    }

    fn block(&self, node: &mdast::Node, depth: usize) -> Vec<String> {
        match node {
            mdast::Node::Heading(heading) => {
                let text = self.inline(&heading.children);
                let line = if !self.styled {
                    text
                } else {
                    match heading.depth {
                        1 | 2 => text.bold().underlined().to_string(),
                        3 => text.bold().cyan().to_string(),
                        _ => text.bold().to_string(),
                    }
                };
                vec![line]
            }
            mdast::Node::Paragraph(paragraph) => split_lines(&self.inline(&paragraph.children)),
            mdast::Node::List(list) => self.list(list, depth),
            mdast::Node::Code(code) => code
                .value
                .split('\n')
                .map(|line| {
                    let line = format!("    {}", line);
                    if self.styled {
                        line.dim().to_string()
                    } else {
                        line
                    }
                })
                .collect(),
            mdast::Node::Blockquote(quote) => split_lines(&self.blocks(&quote.children))
                .into_iter()
                .map(|line| format!("│ {}", line).trim_end().to_string())
                .collect(),
            mdast::Node::ThematicBreak(_) => vec!["─".repeat(RULE_WIDTH)],
            mdast::Node::Table(table) => self.table(table),
            mdast::Node::Html(html) => split_lines(html.value.trim()),
            other => {
                let text = self.inline(std::slice::from_ref(other));
                if text.is_empty() {
                    Vec::new()
                } else {
                    split_lines(&text)
                }
            }
        }
    }

    fn list(&self, list: &mdast::List, depth: usize) -> Vec<String> {
        let indent = "  ".repeat(depth + 1);
        let start = list.start.unwrap_or(1);
        let mut lines = Vec::new();

        for (i, node) in list.children.iter().enumerate() {
            let mdast::Node::ListItem(item) = node else {
                continue;
            };
            let marker = if list.ordered {
                format!("{}.", start + i as u32)
            } else {
                "•".to_string()
            };

            let mut first = true;
            for child in &item.children {
                if let mdast::Node::List(nested) = child {
                    lines.extend(self.list(nested, depth + 1));
                    continue;
                }
                for line in self.block(child, depth) {
                    if first {
                        lines.push(format!("{}{} {}", indent, marker, line));
                        first = false;
                    } else {
                        lines.push(format!("{}  {}", indent, line));
                    }
                }
            }
            if first {
                lines.push(format!("{}{}", indent, marker));
            }
        }

        lines
    }

    fn table(&self, table: &mdast::Table) -> Vec<String> {
        let rows: Vec<Vec<&[mdast::Node]>> = table
            .children
            .iter()
            .filter_map(|node| match node {
                mdast::Node::TableRow(row) => Some(
                    row.children
                        .iter()
                        .map(|cell| match cell {
                            mdast::Node::TableCell(cell) => cell.children.as_slice(),
                            _ => &[][..],
                        })
                        .collect(),
                ),
                _ => None,
            })
            .collect();

        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut widths = vec![0; columns];
        for row in &rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(plain_text(cell).chars().count());
            }
        }

        rows.iter()
            .enumerate()
            .map(|(index, row)| {
                let cells: Vec<String> = (0..columns)
                    .map(|i| {
                        let cell: &[mdast::Node] = row.get(i).copied().unwrap_or(&[]);
                        let mut text = self.inline(cell);
                        if index == 0 && self.styled {
                            text = text.bold().to_string();
                        }
                        // Pad on the unstyled width so escape codes don't count
                        let pad = widths[i].saturating_sub(plain_text(cell).chars().count());
                        format!("{}{}", text, " ".repeat(pad))
                    })
                    .collect();
                cells.join(" │ ").trim_end().to_string()
            })
            .collect()
    }

    fn inline(&self, nodes: &[mdast::Node]) -> String {
        let mut out = String::new();

        for node in nodes {
            match node {
                mdast::Node::Text(text) => out.push_str(&text.value),
                mdast::Node::Strong(strong) => {
                    let content = self.inline(&strong.children);
                    out.push_str(&self.style(content, |s| s.bold().to_string()));
                }
                mdast::Node::Emphasis(emphasis) => {
                    let content = self.inline(&emphasis.children);
                    out.push_str(&self.style(content, |s| s.italic().to_string()));
                }
                mdast::Node::Delete(delete) => {
                    let content = self.inline(&delete.children);
                    out.push_str(&self.style(content, |s| s.crossed_out().to_string()));
                }
                mdast::Node::InlineCode(code) => {
                    out.push_str(&self.style(code.value.clone(), |s| s.yellow().to_string()));
                }
                mdast::Node::Link(link) => {
                    let label = self.inline(&link.children);
                    let plain = plain_text(&link.children);
                    let href = link.url.strip_prefix("mailto:").unwrap_or(&link.url);
                    out.push_str(&self.style(label, |s| s.underlined().to_string()));
                    if plain != link.url && plain != href {
                        out.push_str(&format!(" ({})", link.url));
                    }
                }
                mdast::Node::Image(image) => {
                    out.push_str(if image.alt.is_empty() { &image.url } else { &image.alt });
                }
                mdast::Node::Break(_) => out.push('\n'),
                mdast::Node::Html(html) => out.push_str(&html.value),
                mdast::Node::Paragraph(paragraph) => out.push_str(&self.inline(&paragraph.children)),
                _ => {}
            }
        }

        out
    }

    fn style(&self, text: String, apply: impl Fn(String) -> String) -> String {
        if self.styled {
            apply(text)
        } else {
            text
        }
    }
}

fn plain_text(nodes: &[mdast::Node]) -> String {
    MarkdownRenderer::new(false).inline(nodes)
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}
