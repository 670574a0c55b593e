//! Markdown repair and terminal rendering for streamed replies.
//!
//! [`normalize`] is applied to every snapshot of a growing reply. It fixes the
//! line-level constructs models tend to emit without the spacing a renderer
//! needs (list markers, task cells, thematic breaks) and turns single newlines
//! into hard breaks. It keeps no state between calls, so a prefix of a reply
//! and the whole reply are normalized independently.

use std::borrow::Cow;
use std::sync::LazyLock;

use pulldown_cmark::{Event as MDEvent, Options, Parser, Tag as MDTag};
use ratatui::prelude::*;
use ratatui::text::{Line, Span};
use regex::Regex;

const FENCE: &str = "```";
const HARD_BREAK: &str = "  ";

static TASK_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-*+])(\s*)\[([ xX]?)\](.*)$").expect("valid task regex"));
static ORDERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(\s*)([.)、])(\s*)(.*)$").expect("valid ordered regex"));
static UNORDERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([-*+])(\s*)(.*)$").expect("valid unordered regex"));

struct OutputLine<'a> {
    text: Cow<'a, str>,
    /// Fence markers and fenced content: emitted byte-for-byte, no hard break.
    verbatim: bool,
}

/// Repairs list, task and thematic-break syntax and converts single newlines
/// into hard line breaks. Fenced code blocks are left untouched.
pub fn normalize(text: &str) -> String {
    if text.trim().is_empty() {
        return text.to_string();
    }

    let mut in_code_block = false;
    let lines: Vec<OutputLine<'_>> = text
        .split('\n')
        .map(|line| {
            if line.trim().starts_with(FENCE) {
                in_code_block = !in_code_block;
                return OutputLine { text: Cow::Borrowed(line), verbatim: true };
            }
            if in_code_block {
                return OutputLine { text: Cow::Borrowed(line), verbatim: true };
            }
            // CRLF input: a stray '\r' before the hard break would end the line twice.
            let line = line.strip_suffix('\r').unwrap_or(line);
            let text = match thematic_break(line) {
                Some(rule) => Cow::Owned(rule),
                None => repair_list_item(line),
            };
            OutputLine { text, verbatim: false }
        })
        .collect();

    join_with_hard_breaks(&lines)
}

/// `- - -`, `*****`, `_ _ _ _` and friends become exactly three characters.
fn thematic_break(line: &str) -> Option<String> {
    let compact: Vec<char> = line.chars().filter(|c| !c.is_whitespace()).collect();
    let first = *compact.first()?;
    if !matches!(first, '-' | '*' | '_') || compact.len() < 3 {
        return None;
    }
    if compact.iter().all(|&c| c == first) {
        Some(first.to_string().repeat(3))
    } else {
        None
    }
}

fn repair_list_item(line: &str) -> Cow<'_, str> {
    let content = line.trim_start();
    if content.is_empty() {
        return Cow::Borrowed(line);
    }
    let indent = &line[..line.len() - content.len()];

    let repaired = repair_task(content)
        .or_else(|| repair_ordered(content))
        .or_else(|| repair_unordered(content));

    match repaired {
        Some(fixed) => Cow::Owned(format!("{indent}{fixed}")),
        None => Cow::Borrowed(line),
    }
}

// Each repair returns None when the line is not that kind of item or is
// already well formed.

fn repair_task(content: &str) -> Option<String> {
    let caps = TASK_ITEM.captures(content)?;
    let (marker, gap, cell, rest) = (&caps[1], &caps[2], &caps[3], &caps[4]);
    if !gap.is_empty() && !cell.is_empty() {
        return None;
    }
    let status = if cell.trim().is_empty() { " " } else { cell };
    let rest = rest.trim_start();
    Some(format!("{marker} [{status}] {rest}"))
}

fn repair_ordered(content: &str) -> Option<String> {
    let caps = ORDERED_ITEM.captures(content)?;
    let (number, before, delimiter, after, rest) =
        (&caps[1], &caps[2], &caps[3], &caps[4], &caps[5]);

    if rest.trim().is_empty() {
        let fixed = format!("{number}{delimiter} ");
        return (fixed != content).then_some(fixed);
    }
    if before.is_empty() && !after.is_empty() {
        return None;
    }
    // 3.14 is a number, not item 3.
    if delimiter == "." && before.is_empty() && rest.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    Some(format!("{number}{delimiter} {rest}"))
}

fn repair_unordered(content: &str) -> Option<String> {
    let caps = UNORDERED_ITEM.captures(content)?;
    let (marker, gap, rest) = (&caps[1], &caps[2], &caps[3]);

    if rest.trim().is_empty() {
        let fixed = format!("{marker} ");
        return (fixed != content).then_some(fixed);
    }
    if !gap.is_empty() {
        return None;
    }
    // **strong**, --flag, *emphasis*
    if rest.starts_with(marker) || (marker == "*" && rest.contains('*')) {
        return None;
    }
    Some(format!("{marker} {rest}"))
}

/// Joins lines back with `\n`, upgrading every newline that does not touch
/// another newline to a hard break. Lines that already end in a hard break
/// are left alone so normalizing twice is a no-op.
fn join_with_hard_breaks(lines: &[OutputLine<'_>]) -> String {
    let extra = lines.len() * HARD_BREAK.len();
    let mut out = String::with_capacity(lines.iter().map(|l| l.text.len() + 1).sum::<usize>() + extra);

    for (i, line) in lines.iter().enumerate() {
        out.push_str(&line.text);
        if i + 1 == lines.len() {
            break;
        }
        let follows_newline = i > 0 && line.text.is_empty();
        let precedes_newline = i + 2 < lines.len() && lines[i + 1].text.is_empty();
        if !line.verbatim
            && !follows_newline
            && !precedes_newline
            && !line.text.ends_with(HARD_BREAK)
        {
            out.push_str(HARD_BREAK);
        }
        out.push('\n');
    }

    out
}

// --- Terminal Renderer ---

/// Renders (already normalized) Markdown into styled terminal lines.
pub fn render_markdown(markdown_input: &str) -> Vec<Line<'static>> {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    let parser = Parser::new_ext(markdown_input, options);

    let base_style = Style::default().fg(Color::Cyan);
    let code_block_style = Style::default().bg(Color::Rgb(40, 40, 40)).fg(Color::White);
    let inline_code_style = Style::default()
        .bg(Color::Rgb(50, 50, 50))
        .fg(Color::Yellow)
        .add_modifier(Modifier::ITALIC);
    let fence_style = Style::default().fg(Color::DarkGray);

    let mut lines: Vec<Line<'static>> = Vec::new();
    let mut current_spans: Vec<Span<'static>> = Vec::new();
    let mut current_style = base_style;
    // One entry per open list; Some(n) holds the next ordered number.
    let mut list_stack: Vec<Option<u64>> = Vec::new();
    let mut in_code_block = false;

    let push_current_line = |lines: &mut Vec<Line<'static>>, spans: &mut Vec<Span<'static>>| {
        if !spans.is_empty() {
            lines.push(Line::from(std::mem::take(spans)));
        }
    };

    for event in parser {
        match event {
            MDEvent::Start(tag) => match tag {
                MDTag::Paragraph => current_style = base_style,
                MDTag::Heading(level, _, _) => {
                    push_current_line(&mut lines, &mut current_spans);
                    current_style = Style::default().fg(Color::Magenta).add_modifier(Modifier::BOLD);
                    let prefix = "#".repeat(level as usize) + " ";
                    current_spans.push(Span::styled(prefix, current_style));
                }
                MDTag::BlockQuote => {
                    push_current_line(&mut lines, &mut current_spans);
                    current_style = Style::default().fg(Color::Yellow).add_modifier(Modifier::ITALIC);
                    current_spans.push(Span::styled("> ", current_style));
                }
                MDTag::CodeBlock(_) => {
                    push_current_line(&mut lines, &mut current_spans);
                    in_code_block = true;
                    current_style = code_block_style;
                    lines.push(Line::styled(FENCE, fence_style));
                }
                MDTag::List(start) => {
                    push_current_line(&mut lines, &mut current_spans);
                    list_stack.push(start);
                }
                MDTag::Item => {
                    push_current_line(&mut lines, &mut current_spans);
                    let indent = "  ".repeat(list_stack.len().saturating_sub(1));
                    let marker = match list_stack.last_mut() {
                        Some(Some(next)) => {
                            let marker = format!("{next}. ");
                            *next += 1;
                            marker
                        }
                        _ => "* ".to_string(),
                    };
                    current_style = base_style;
                    current_spans.push(Span::raw(indent));
                    current_spans.push(Span::styled(marker, Style::default().fg(Color::Green)));
                }
                MDTag::Emphasis => current_style = current_style.add_modifier(Modifier::ITALIC),
                MDTag::Strong => current_style = current_style.add_modifier(Modifier::BOLD),
                MDTag::Strikethrough => {
                    current_style = current_style.add_modifier(Modifier::CROSSED_OUT);
                }
                MDTag::Link(_, _, _) => {
                    current_style = current_style.fg(Color::Blue).add_modifier(Modifier::UNDERLINED);
                }
                MDTag::Image(_, _, _) => {
                    current_spans.push(Span::styled("[Image]", fence_style));
                }
                MDTag::Table(_)
                | MDTag::TableHead
                | MDTag::TableRow
                | MDTag::TableCell
                | MDTag::FootnoteDefinition(_) => {}
            },
            MDEvent::End(tag) => match tag {
                MDTag::Paragraph | MDTag::Heading(_, _, _) | MDTag::Item | MDTag::BlockQuote => {
                    push_current_line(&mut lines, &mut current_spans);
                }
                MDTag::CodeBlock(_) => {
                    push_current_line(&mut lines, &mut current_spans);
                    in_code_block = false;
                    lines.push(Line::styled(FENCE, fence_style));
                    current_style = base_style;
                }
                MDTag::List(_) => {
                    list_stack.pop();
                }
                MDTag::Emphasis => current_style = current_style.remove_modifier(Modifier::ITALIC),
                MDTag::Strong => current_style = current_style.remove_modifier(Modifier::BOLD),
                MDTag::Strikethrough => {
                    current_style = current_style.remove_modifier(Modifier::CROSSED_OUT);
                }
                MDTag::Link(_, _, _) => {
                    current_style = current_style.remove_modifier(Modifier::UNDERLINED);
                    if current_style.fg == Some(Color::Blue) {
                        current_style = current_style.fg(Color::Cyan);
                    }
                }
                MDTag::Image(_, _, _)
                | MDTag::Table(_)
                | MDTag::TableHead
                | MDTag::TableRow
                | MDTag::TableCell
                | MDTag::FootnoteDefinition(_) => {}
            },
            MDEvent::Text(text) => {
                for (i, segment) in text.lines().enumerate() {
                    if i > 0 {
                        push_current_line(&mut lines, &mut current_spans);
                    }
                    current_spans.push(Span::styled(segment.to_string(), current_style));
                }
                if in_code_block && text.ends_with('\n') {
                    push_current_line(&mut lines, &mut current_spans);
                }
            }
            MDEvent::Code(text) => {
                current_spans.push(Span::styled(text.to_string(), inline_code_style));
            }
            MDEvent::SoftBreak => current_spans.push(Span::raw(" ")),
            MDEvent::HardBreak => push_current_line(&mut lines, &mut current_spans),
            MDEvent::Rule => {
                push_current_line(&mut lines, &mut current_spans);
                lines.push(Line::styled("─".repeat(50), fence_style));
            }
            MDEvent::TaskListMarker(checked) => {
                let marker = if checked { "[x] " } else { "[ ] " };
                current_spans.push(Span::styled(marker, Style::default().fg(Color::Yellow)));
            }
            MDEvent::Html(_) | MDEvent::FootnoteReference(_) => {}
        }
    }

    push_current_line(&mut lines, &mut current_spans);

    if lines.is_empty() {
        lines.push(Line::raw(""));
    }

    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordered_marker_gets_a_space() {
        assert_eq!(normalize("1.内容"), "1. 内容");
        assert_eq!(normalize("2)item"), "2) item");
        assert_eq!(normalize("3、内容"), "3、 内容");
        assert_eq!(normalize("1 . spaced"), "1. spaced");
    }

    #[test]
    fn ordered_marker_without_content_keeps_trailing_space() {
        assert_eq!(normalize("1."), "1. ");
        assert_eq!(normalize("12)   "), "12) ");
    }

    #[test]
    fn well_formed_items_are_untouched() {
        assert_eq!(normalize("1. item"), "1. item");
        assert_eq!(normalize("- item"), "- item");
        assert_eq!(normalize("1.   wide"), "1.   wide");
        assert_eq!(normalize("- [x]内容"), "- [x]内容");
        assert_eq!(normalize("* [ ] todo"), "* [ ] todo");
    }

    #[test]
    fn unordered_marker_gets_a_space() {
        assert_eq!(normalize("-内容"), "- 内容");
        assert_eq!(normalize("+plus"), "+ plus");
        assert_eq!(normalize("*star"), "* star");
    }

    #[test]
    fn task_cells_are_canonicalized() {
        assert_eq!(normalize("-[]内容"), "- [ ] 内容");
        assert_eq!(normalize("-[x]done"), "- [x] done");
        assert_eq!(normalize("- []later"), "- [ ] later");
        assert_eq!(normalize("*[ ]"), "* [ ] ");
    }

    #[test]
    fn indentation_is_preserved_for_nested_items() {
        assert_eq!(normalize("- top\n  -nested"), "- top  \n  - nested");
        assert_eq!(normalize("\t1.first"), "\t1. first");
    }

    #[test]
    fn emphasis_and_numbers_are_not_list_items() {
        assert_eq!(normalize("**bold** text"), "**bold** text");
        assert_eq!(normalize("*emphasis* here"), "*emphasis* here");
        assert_eq!(normalize("--flag"), "--flag");
        assert_eq!(normalize("3.14 is pi"), "3.14 is pi");
    }

    #[test]
    fn thematic_breaks_collapse_to_three_characters() {
        assert_eq!(normalize("----------"), "---");
        assert_eq!(normalize("* * * *"), "***");
        assert_eq!(normalize("  _ _    _"), "___");
        assert_eq!(normalize("--"), "--");
        assert_eq!(normalize("-*-"), "- *-");
    }

    #[test]
    fn break_detection_wins_over_list_detection() {
        assert_eq!(normalize("- - -"), "---");
        assert_eq!(normalize("text\n- - - -\nmore"), "text  \n---  \nmore");
    }

    #[test]
    fn single_newlines_become_hard_breaks() {
        assert_eq!(normalize("line one\nline two"), "line one  \nline two");
        assert_eq!(normalize("para one\n\npara two"), "para one\n\npara two");
        assert_eq!(normalize("a\n\n\nb"), "a\n\n\nb");
        assert_eq!(normalize("trailing\n"), "trailing  \n");
    }

    #[test]
    fn crlf_line_endings_become_plain_hard_breaks() {
        assert_eq!(normalize("a\r\nb"), "a  \nb");
        assert_eq!(normalize("one\r\n\r\ntwo"), "one\n\ntwo");
        assert_eq!(normalize("-item\r\nnext"), "- item  \nnext");
    }

    #[test]
    fn fenced_code_is_byte_for_byte() {
        let input = "intro\n```rust\nfn main() {\n-not a list\n1.nor this\n}\n```\nafter";
        let output = normalize(input);
        assert_eq!(
            output,
            "intro  \n```rust\nfn main() {\n-not a list\n1.nor this\n}\n```\nafter"
        );
    }

    #[test]
    fn open_fence_mid_stream_keeps_content_verbatim() {
        let partial = "Here:\n```\n---\n-x\n*****";
        assert_eq!(normalize(partial), "Here:  \n```\n---\n-x\n*****");
    }

    #[test]
    fn blank_input_is_returned_as_is() {
        assert_eq!(normalize(""), "");
        assert_eq!(normalize("  \n "), "  \n ");
    }

    #[test]
    fn normalize_is_idempotent() {
        let samples = [
            "1.内容\n-内容\n-[]内容\n- [x]内容",
            "Heading\n----------\nbody\n\n* * *\nend",
            "1.\n2)\n-\n*[]",
            "a  \nb \nc",
            "\nleading newline",
            "mixed\n```\ncode\n```\n-after fence\n3、next",
            "  -nested\n    1.deeper\n\n\nfar",
        ];
        for sample in samples {
            let once = normalize(sample);
            assert_eq!(normalize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn growing_prefixes_never_panic() {
        let full = "Steps:\n1.open\n2.close\n---\n```sh\nls -la\n```\n-[x]done";
        for (end, _) in full.char_indices() {
            let _ = normalize(&full[..end]);
        }
    }

    #[test]
    fn rendered_hard_breaks_produce_separate_lines() {
        let lines = render_markdown(&normalize("first\nsecond"));
        assert_eq!(lines.len(), 2);
    }

    #[test]
    fn rendered_ordered_list_counts_items() {
        let lines = render_markdown(&normalize("1.one\n2.two"));
        let text: Vec<String> = lines
            .iter()
            .map(|l| l.spans.iter().map(|s| s.content.as_ref()).collect())
            .collect();
        assert_eq!(text, vec!["1. one", "2. two"]);
    }

    #[test]
    fn empty_render_yields_one_line() {
        assert_eq!(render_markdown("").len(), 1);
    }
}
