// parse.rs
// Phase 1: Slice files into spans (indentation-aware code blocks, heading-delimited doc sections)

use crate::error::ParseError;
use crate::model::{ParsedDocument, Span, SpanKind};
use crate::pipeline::ingest::{DiscoveredFile, FileClass};
use pulldown_cmark::{Event, Parser, Tag};
use rayon::prelude::*;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// Columns a tab contributes to indentation depth
const TAB_WIDTH: usize = 4;

/// Longest multi-line declaration header we will follow
const MAX_HEADER_LINES: usize = 20;

/// Configuration for structural parsing
#[derive(Debug, Clone)]
pub struct ParseConfig {
    /// Blocks shorter than this (trimmed, in chars) are dropped
    pub min_block_chars: usize,

    /// How much of the leading docstring is prefixed to each code span
    pub context_chars: usize,
}

impl Default for ParseConfig {
    fn default() -> Self {
        Self {
            min_block_chars: 400,
            context_chars: 300,
        }
    }
}

/// Parse every discovered file. Output order matches input order.
pub fn parse_all_files(files: &[DiscoveredFile], config: &ParseConfig) -> Vec<ParsedDocument> {
    let documents: Vec<ParsedDocument> = files
        .par_iter()
        .map(|file| parse_file(file, config))
        .collect();

    let span_count: usize = documents.iter().map(|d| d.spans.len()).sum();
    let empty = documents.iter().filter(|d| d.spans.is_empty()).count();
    info!(
        files = documents.len(),
        spans = span_count,
        empty_files = empty,
        "parsed repository"
    );
    documents
}

/// Parse one file. Unreadable or undecodable files yield an empty document.
pub fn parse_file(file: &DiscoveredFile, config: &ParseConfig) -> ParsedDocument {
    let text = match read_text(&file.absolute) {
        Ok(text) => text,
        Err(e) => {
            warn!(file = %file.relative, error = %e, "skipping file");
            return ParsedDocument::empty(&file.relative);
        }
    };

    let doc = match file.class {
        FileClass::Source => parse_source(&file.relative, &text, config),
        FileClass::Documentation => parse_markdown(&file.relative, &text),
    };
    debug!(file = %file.relative, spans = doc.spans.len(), "parsed file");
    doc
}

fn read_text(path: &Path) -> Result<String, ParseError> {
    let bytes = fs::read(path).map_err(|source| ParseError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    String::from_utf8(bytes).map_err(|_| ParseError::Decode(path.to_path_buf()))
}

// ============================================================================
// Source code
// ============================================================================

/// Extract function and class blocks from indentation-structured source
pub fn parse_source(path: &str, text: &str, config: &ParseConfig) -> ParsedDocument {
    let lines: Vec<&str> = text.lines().collect();
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let context: Option<String> =
        leading_context(text).map(|c| c.chars().take(config.context_chars).collect());

    let mut spans = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some((kind, name)) = declaration(lines[i]) else {
            i += 1;
            continue;
        };

        let header = header_end(&lines, i);
        let end = block_end(&lines, i, header);
        let block = lines[i..=end].join("\n");

        if block.trim().chars().count() >= config.min_block_chars {
            let content = match &context {
                Some(ctx) => format!("# File: {}\n# Context: {}\n\n{}", file_name, ctx, block),
                None => block,
            };
            let mut span = Span::new(path, kind, content, i + 1, end + 1);
            span.metadata.name = Some(name);
            spans.push(span);
        }

        i = end + 1;
    }

    ParsedDocument::new(path, spans)
}

/// Recognize a named declaration line: `def f(`, `async def f(`, `class C...:`
fn declaration(line: &str) -> Option<(SpanKind, String)> {
    let trimmed = line.trim_start();

    if let Some(rest) = trimmed
        .strip_prefix("async def ")
        .or_else(|| trimmed.strip_prefix("def "))
    {
        let (name, _) = rest.split_once('(')?;
        let name = name.trim();
        return is_identifier(name).then(|| (SpanKind::FunctionDefinition, name.to_string()));
    }

    if let Some(rest) = trimmed.strip_prefix("class ") {
        if !rest.contains(':') {
            return None;
        }
        let name: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        return (!name.is_empty()).then(|| (SpanKind::ClassDefinition, name));
    }

    None
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Last line of a declaration header. A signature with unclosed brackets
/// continues until they balance.
fn header_end(lines: &[&str], start: usize) -> usize {
    let mut depth: i32 = 0;
    for (idx, line) in lines.iter().enumerate().skip(start).take(MAX_HEADER_LINES) {
        for ch in strip_comment(line).chars() {
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
        if depth <= 0 {
            return idx;
        }
    }
    start
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Last line (0-based) of the indented block opened at `start`.
/// Blank lines never extend the block; the first non-blank line at or above
/// the declaration's depth ends it.
fn block_end(lines: &[&str], start: usize, header_end: usize) -> usize {
    let base = indent_width(lines[start]);
    let mut end = header_end;

    for (j, line) in lines.iter().enumerate().skip(header_end + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_width(line) > base {
            end = j;
        } else {
            break;
        }
    }

    end
}

/// Indentation depth in columns; tabs count as four
pub fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width += TAB_WIDTH,
            _ => break,
        }
    }
    width
}

/// Leading module docstring, or the leading comment block if there is none
fn leading_context(text: &str) -> Option<String> {
    // Shebang and encoding pragmas are not documentation
    let body: String = text
        .lines()
        .skip_while(|l| l.starts_with("#!") || l.starts_with("# -*-"))
        .collect::<Vec<_>>()
        .join("\n");
    let stripped = body.trim_start();

    for quote in ["\"\"\"", "'''"] {
        if let Some(rest) = stripped.strip_prefix(quote) {
            let close = rest.find(quote)?;
            let docstring = &stripped[..quote.len() + close + quote.len()];
            return Some(docstring.trim().to_string());
        }
    }

    let comments: Vec<&str> = stripped
        .lines()
        .take_while(|l| l.trim_start().starts_with('#'))
        .map(|l| l.trim_start().trim_start_matches('#').trim())
        .collect();
    let block = comments.join("\n").trim().to_string();
    (!block.is_empty()).then_some(block)
}

// ============================================================================
// Documentation
// ============================================================================

#[derive(Debug)]
struct Heading {
    level: usize,
    title: String,
    /// 0-based first line of the heading (setext headings span two lines)
    first_line: usize,
    last_line: usize,
}

struct OpenSection {
    title: String,
    section_path: Option<String>,
    /// 0-based first content line
    start: usize,
}

/// Segment markdown on headings. Each heading closes the open section; the
/// trailing section runs to end-of-file.
pub fn parse_markdown(path: &str, text: &str) -> ParsedDocument {
    let lines: Vec<&str> = text.lines().collect();
    let headings = collect_headings(text);

    let mut spans = Vec::new();
    let mut stack: Vec<(usize, String)> = Vec::new();
    let mut open = OpenSection {
        title: "Document".to_string(),
        section_path: None,
        start: 0,
    };

    for heading in headings {
        if let Some(span) = close_section(path, &lines, &open, heading.first_line) {
            spans.push(span);
        }

        while stack.last().map_or(false, |(level, _)| *level >= heading.level) {
            stack.pop();
        }
        stack.push((heading.level, heading.title.clone()));

        open = OpenSection {
            title: heading.title,
            section_path: Some(
                stack
                    .iter()
                    .map(|(_, t)| t.as_str())
                    .collect::<Vec<_>>()
                    .join(" > "),
            ),
            start: heading.last_line + 1,
        };
    }

    if let Some(span) = close_section(path, &lines, &open, lines.len()) {
        spans.push(span);
    }

    ParsedDocument::new(path, spans)
}

/// Emit lines `[open.start, end)` as a section, unless the section is blank
fn close_section(path: &str, lines: &[&str], open: &OpenSection, end: usize) -> Option<Span> {
    if open.start >= end {
        return None;
    }
    let content = lines[open.start..end].join("\n").trim().to_string();
    if content.is_empty() {
        return None;
    }

    let mut span = Span::new(path, SpanKind::MarkdownSection, content, open.start + 1, end);
    span.metadata.title = Some(open.title.clone());
    span.metadata.section_path = open.section_path.clone();
    Some(span)
}

fn collect_headings(text: &str) -> Vec<Heading> {
    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(text.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect();
    let line_of = |offset: usize| match line_starts.binary_search(&offset) {
        Ok(line) => line,
        Err(line) => line.saturating_sub(1),
    };

    let mut headings = Vec::new();
    let mut current: Option<(usize, usize, String)> = None;

    for (event, range) in Parser::new(text).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading(level, _, _)) => {
                current = Some((level as usize, line_of(range.start), String::new()));
            }
            Event::Text(t) | Event::Code(t) => {
                if let Some((_, _, title)) = current.as_mut() {
                    title.push_str(&t);
                }
            }
            Event::End(Tag::Heading(..)) => {
                if let Some((level, first_line, title)) = current.take() {
                    // The range end sits just past the heading's final newline
                    let last_line = line_of(range.end.saturating_sub(1)).max(first_line);
                    headings.push(Heading {
                        level,
                        title: title.trim().to_string(),
                        first_line,
                        last_line,
                    });
                }
            }
            _ => {}
        }
    }

    headings
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn long_body(indent: &str, lines: usize) -> String {
        (0..lines)
            .map(|i| format!("{indent}total_{i} = compute_factor_exposure(frame, window={i})\n"))
            .collect()
    }

    #[test]
    fn short_blocks_yield_no_spans() {
        let src = "def tiny(x):\n    return x\n\nclass Small:\n    pass\n";
        let doc = parse_source("pkg/tiny.py", src, &ParseConfig::default());
        assert!(doc.spans.is_empty());
        assert_eq!(doc.path, "pkg/tiny.py");
    }

    #[test]
    fn only_the_long_function_is_kept_with_its_full_block() {
        let mut src = String::from("import os\n\n");
        src.push_str("def short(a):\n    return a + 1\n\n");
        // line 6
        src.push_str("def long_one(frame):\n");
        src.push_str(&long_body("    ", 8));
        src.push('\n');
        src.push_str("    return frame\n");
        // line 17
        src.push_str("\nCONSTANT = 3\n");

        let doc = parse_source("strategy.py", &src, &ParseConfig::default());
        assert_eq!(doc.spans.len(), 1);

        let span = &doc.spans[0];
        assert_eq!(span.kind, SpanKind::FunctionDefinition);
        assert_eq!(span.metadata.name.as_deref(), Some("long_one"));
        assert_eq!(span.line_start, 6);
        assert_eq!(span.line_end, 16);
        assert!(span.content.starts_with("def long_one(frame):"));
        assert!(span.content.trim_end().ends_with("return frame"));
    }

    #[test]
    fn class_block_consumes_its_methods() {
        let mut src = String::from("class Optimizer(Base):\n    def solve(self):\n");
        src.push_str(&long_body("        ", 8));
        src.push_str("\nprint('done')\n");

        let doc = parse_source("opt.py", &src, &ParseConfig::default());
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].kind, SpanKind::ClassDefinition);
        assert_eq!(doc.spans[0].metadata.name.as_deref(), Some("Optimizer"));
        assert_eq!(doc.spans[0].line_start, 1);
        assert_eq!(doc.spans[0].line_end, 10);
    }

    #[test]
    fn multi_line_signature_keeps_the_body() {
        let mut src = String::from("async def fetch(\n    session,\n    url,\n):\n");
        src.push_str(&long_body("    ", 8));

        let doc = parse_source("net.py", &src, &ParseConfig::default());
        assert_eq!(doc.spans.len(), 1);
        assert_eq!(doc.spans[0].metadata.name.as_deref(), Some("fetch"));
        assert_eq!(doc.spans[0].line_end, 12);
    }

    #[test]
    fn tabs_count_as_four_columns() {
        assert_eq!(indent_width("\tx"), 4);
        assert_eq!(indent_width("  \tx"), 6);
        assert_eq!(indent_width("x"), 0);
    }

    #[test]
    fn module_docstring_prefixes_every_span() {
        let mut src = String::from("\"\"\"Country factor momentum.\n\nRanks countries.\n\"\"\"\n\n");
        src.push_str("def rank(frame):\n");
        src.push_str(&long_body("    ", 8));

        let doc = parse_source("src/momentum.py", &src, &ParseConfig::default());
        let span = &doc.spans[0];
        assert!(span
            .content
            .starts_with("# File: momentum.py\n# Context: \"\"\"Country factor momentum."));
        assert!(span.content.contains("\n\ndef rank(frame):"));
        assert_eq!(span.line_start, 6);
    }

    #[test]
    fn context_is_truncated() {
        let doc_text = "x".repeat(1000);
        let mut src = format!("# {doc_text}\n\n");
        src.push_str("def rank(frame):\n");
        src.push_str(&long_body("    ", 8));

        let config = ParseConfig::default();
        let doc = parse_source("m.py", &src, &config);
        let header = doc.spans[0].content.lines().nth(1).unwrap();
        assert_eq!(header, format!("# Context: {}", "x".repeat(300)));
    }

    #[test]
    fn markdown_sections_follow_headings() {
        let md = "# A\nalpha text\n## B\nbeta text\nmore beta\n# C\ngamma text\n";
        let doc = parse_markdown("docs/guide.md", md);

        let titles: Vec<_> = doc
            .spans
            .iter()
            .map(|s| s.metadata.title.as_deref().unwrap())
            .collect();
        assert_eq!(titles, vec!["A", "B", "C"]);

        let b = &doc.spans[1];
        assert_eq!(b.line_start, 4);
        assert_eq!(b.line_end, 5);
        assert_eq!(b.content, "beta text\nmore beta");
        assert_eq!(b.metadata.section_path.as_deref(), Some("A > B"));

        let c = &doc.spans[2];
        assert_eq!(c.line_start, 7);
        assert_eq!(c.metadata.section_path.as_deref(), Some("C"));
    }

    #[test]
    fn trailing_section_is_emitted_without_a_following_heading() {
        let md = "intro line\n\n### Only\nbody\n";
        let doc = parse_markdown("README.md", md);
        assert_eq!(doc.spans.len(), 2);
        assert_eq!(doc.spans[0].metadata.title.as_deref(), Some("Document"));
        assert_eq!(doc.spans[1].metadata.title.as_deref(), Some("Only"));
        assert_eq!(doc.spans[1].line_start, 4);
        assert_eq!(doc.spans[1].line_end, 4);
    }

    #[test]
    fn fenced_hashes_are_not_headings() {
        let md = "# Setup\n```bash\n# install deps\npip install x\n```\n";
        let doc = parse_markdown("INSTALL.md", md);
        assert_eq!(doc.spans.len(), 1);
        assert!(doc.spans[0].content.contains("# install deps"));
    }

    #[test]
    fn setext_headings_and_empty_sections() {
        let md = "Title\n=====\n## Empty\n## Full\ntext\n";
        let doc = parse_markdown("x.md", md);
        let titles: Vec<_> = doc
            .spans
            .iter()
            .map(|s| s.metadata.title.as_deref().unwrap())
            .collect();
        assert_eq!(titles, vec!["Full"]);
        assert_eq!(doc.spans[0].metadata.section_path.as_deref(), Some("Title > Full"));
    }

    #[test]
    fn undecodable_file_yields_empty_document() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.py");
        fs::write(&path, [0xff, 0xfe, 0x00, 0x80]).unwrap();

        let file = DiscoveredFile {
            relative: "bad.py".to_string(),
            absolute: path,
            class: FileClass::Source,
        };
        let doc = parse_file(&file, &ParseConfig::default());
        assert_eq!(doc, ParsedDocument::empty("bad.py"));
    }

    #[test]
    fn one_bad_file_does_not_disturb_the_batch() {
        let dir = tempdir().unwrap();
        let good_src = format!("def rebalance(frame):\n{}", long_body("    ", 12));
        fs::write(dir.path().join("a.py"), &good_src).unwrap();
        fs::write(dir.path().join("bad.py"), [0xff, 0xfe, 0x00, 0x80]).unwrap();
        fs::write(dir.path().join("guide.md"), "# Guide\n\nHow it works.\n").unwrap();

        let file = |name: &str, class| DiscoveredFile {
            relative: name.to_string(),
            absolute: dir.path().join(name),
            class,
        };
        let files = vec![
            file("a.py", FileClass::Source),
            file("bad.py", FileClass::Source),
            file("guide.md", FileClass::Documentation),
            file("missing.py", FileClass::Source),
        ];

        let docs = parse_all_files(&files, &ParseConfig::default());
        let paths: Vec<_> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["a.py", "bad.py", "guide.md", "missing.py"]);

        assert_eq!(docs[0].spans.len(), 1);
        assert_eq!(docs[0].spans[0].metadata.name.as_deref(), Some("rebalance"));
        assert_eq!(docs[1], ParsedDocument::empty("bad.py"));
        assert_eq!(docs[2].spans[0].metadata.title.as_deref(), Some("Guide"));
        assert_eq!(docs[3], ParsedDocument::empty("missing.py"));
    }
}
