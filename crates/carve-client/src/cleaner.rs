use scraper::{Html, Node};

/// Elements whose subtree never helps the model choose selectors.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "canvas", "iframe", "head", "link", "meta",
];

/// Attributes selectors are usually written against. Everything else is
/// dropped to save tokens.
const KEPT_ATTRIBUTES: &[&str] = &["id", "class", "role", "itemprop", "aria-label", "rel"];

const VOID_TAGS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "source", "track", "wbr",
];

const TRUNCATION_MARKER: &str = "<!-- truncated -->";

/// Shrinks raw HTML before it goes into a proposal prompt.
///
/// The output is still HTML, so selectors written against it match the
/// original page: tags and the kept attributes are preserved, scripts,
/// styles and comments are removed, whitespace is collapsed, and the result
/// is cut at `max_chars`.
#[derive(Debug, Clone, Copy)]
pub struct PromptCleaner {
    max_chars: usize,
}

impl Default for PromptCleaner {
    fn default() -> Self {
        Self::new(40_000)
    }
}

enum Step<N> {
    Open(N),
    Close(String),
}

impl PromptCleaner {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }

    pub fn clean(&self, html: &str) -> String {
        let document = Html::parse_document(html);
        let mut out = String::with_capacity(html.len().min(self.max_chars + 64));
        let mut stack = vec![Step::Open(*document.root_element())];

        while let Some(step) = stack.pop() {
            match step {
                Step::Close(name) => {
                    out.push_str("</");
                    out.push_str(&name);
                    out.push('>');
                }
                Step::Open(node) => match node.value() {
                    Node::Text(text) => push_text(&mut out, text),
                    Node::Element(element) => {
                        let name = element.name();
                        if SKIPPED_TAGS.contains(&name) {
                            continue;
                        }
                        out.push('<');
                        out.push_str(name);
                        for (attr, value) in element.attrs() {
                            if KEPT_ATTRIBUTES.contains(&attr) && !value.trim().is_empty() {
                                out.push(' ');
                                out.push_str(attr);
                                out.push_str("=\"");
                                out.push_str(&value.trim().replace('"', "&quot;"));
                                out.push('"');
                            }
                        }
                        out.push('>');
                        if VOID_TAGS.contains(&name) {
                            continue;
                        }
                        stack.push(Step::Close(name.to_string()));
                        for child in node.children().rev() {
                            stack.push(Step::Open(child));
                        }
                    }
                    _ => {}
                },
            }
            if out.len() > self.max_chars {
                break;
            }
        }

        truncate(out, self.max_chars)
    }
}

fn push_text(out: &mut String, text: &str) {
    let mut words = text.split_whitespace().peekable();
    if words.peek().is_none() {
        return;
    }
    if text.starts_with(char::is_whitespace) {
        out.push(' ');
    }
    let mut first = true;
    for word in words {
        if !first {
            out.push(' ');
        }
        first = false;
        for c in word.chars() {
            match c {
                '<' => out.push_str("&lt;"),
                '>' => out.push_str("&gt;"),
                '&' => out.push_str("&amp;"),
                _ => out.push(c),
            }
        }
    }
    if text.ends_with(char::is_whitespace) {
        out.push(' ');
    }
}

fn truncate(mut out: String, max_chars: usize) -> String {
    if out.chars().count() <= max_chars {
        return out;
    }
    let cut = out
        .char_indices()
        .nth(max_chars)
        .map_or(out.len(), |(idx, _)| idx);
    out.truncate(cut);
    out.push_str(TRUNCATION_MARKER);
    out
}
