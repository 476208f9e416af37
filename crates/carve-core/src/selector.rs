//! Selector engine: turns a parsed HTML document plus a selector set into
//! plain text.
//!
//! Evaluation order:
//!
//! 1. `root` selectors pick candidate subtrees (the whole document if empty).
//! 2. `keep` selectors pick the regions inside each candidate, the candidate
//!    included (the candidate itself if empty).
//! 3. `drop` matches, and everything below them, are skipped. Drop beats keep.
//! 4. `unwrap` only flattens structure. Every element boundary stays a word
//!    boundary, so unwrapping never changes the extracted text.
//! 5. Text nodes are joined in document order and whitespace is collapsed.
//!
//! Non-content markup (scripts, styles, hidden elements, ...) is always
//! skipped.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Node, Selector};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{ParserConfig, SelectorSet};

const NON_CONTENT: &str = "script, style, noscript, template, svg, canvas, head, [hidden], [aria-hidden='true']";

static NON_CONTENT_SELECTOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(NON_CONTENT).expect("built-in selector is valid"));

/// A selector set whose strings have been parsed into CSS selectors.
#[derive(Debug, Clone)]
pub struct CompiledSelectors {
    root: Vec<Selector>,
    keep: Vec<Selector>,
    drop: Vec<Selector>,
}

impl CompiledSelectors {
    /// Parse every selector in the set. The first invalid selector aborts
    /// compilation. `unwrap` selectors are validated only.
    pub fn compile(set: &SelectorSet) -> Result<Self, AppError> {
        let compiled = Self {
            root: compile_list(&set.root)?,
            keep: compile_list(&set.keep)?,
            drop: compile_list(&set.drop)?,
        };
        compile_list(&set.unwrap)?;
        Ok(compiled)
    }
}

fn compile_list(selectors: &[String]) -> Result<Vec<Selector>, AppError> {
    selectors
        .iter()
        .map(|raw| {
            Selector::parse(raw).map_err(|e| AppError::InvalidSelector {
                selector: raw.clone(),
                message: format!("{e:?}"),
            })
        })
        .collect()
}

/// A parser config ready to be applied to documents.
#[derive(Debug, Clone)]
pub struct CompiledConfig {
    pub config_id: Uuid,
    pub prefix: String,
    selectors: CompiledSelectors,
}

impl CompiledConfig {
    pub fn compile(config: &ParserConfig) -> Result<Self, AppError> {
        Ok(Self {
            config_id: config.id,
            prefix: config.prefix.clone(),
            selectors: CompiledSelectors::compile(&config.selectors)?,
        })
    }

    pub fn selectors(&self) -> &CompiledSelectors {
        &self.selectors
    }
}

/// Parse raw HTML into a document tree.
///
/// The HTML parser itself never fails, so only content that cannot be a
/// document at all is rejected.
pub fn parse_document(raw: &str) -> Result<Html, AppError> {
    if raw.trim().is_empty() {
        return Err(AppError::ParseError("empty document".into()));
    }
    if raw.contains('\0') {
        return Err(AppError::ParseError("binary content is not HTML".into()));
    }
    Ok(Html::parse_document(raw))
}

/// Parse and extract in one step.
pub fn extract_raw(raw: &str, selectors: &CompiledSelectors) -> Result<String, AppError> {
    let document = parse_document(raw)?;
    Ok(extract(&document, selectors))
}

enum Frame<N> {
    Enter(N),
    Leave { opens_region: bool },
}

/// Apply compiled selectors to a document. Pure and infallible: an empty
/// selection yields an empty string.
pub fn extract(document: &Html, selectors: &CompiledSelectors) -> String {
    let root_element = document.root_element();

    let candidates: Vec<ElementRef<'_>> = if selectors.root.is_empty() {
        vec![root_element]
    } else {
        selectors
            .root
            .iter()
            .flat_map(|sel| document.select(sel))
            .collect()
    };

    let mut starts = HashSet::new();
    if selectors.keep.is_empty() {
        for candidate in &candidates {
            starts.insert(candidate.id());
        }
    } else {
        for candidate in &candidates {
            for sel in &selectors.keep {
                if sel.matches(candidate) {
                    starts.insert(candidate.id());
                }
                for el in candidate.select(sel) {
                    starts.insert(el.id());
                }
            }
        }
    }
    if starts.is_empty() {
        return String::new();
    }

    let mut dropped = HashSet::new();
    for el in document.select(&NON_CONTENT_SELECTOR) {
        dropped.insert(el.id());
    }
    for sel in &selectors.drop {
        for el in document.select(sel) {
            dropped.insert(el.id());
        }
    }

    // Iterative walk: `depth` counts how many selected regions we are in,
    // so nested matches are emitted once.
    let mut text = String::new();
    let mut depth = 0usize;
    let mut stack = vec![Frame::Enter(*root_element)];

    while let Some(frame) = stack.pop() {
        match frame {
            Frame::Leave { opens_region } => {
                if depth > 0 {
                    text.push(' ');
                }
                if opens_region {
                    depth -= 1;
                }
            }
            Frame::Enter(node) => match node.value() {
                Node::Text(t) => {
                    if depth > 0 {
                        text.push_str(t);
                    }
                }
                Node::Element(_) => {
                    let id = node.id();
                    let opens_region = depth == 0 && starts.contains(&id);
                    if (depth > 0 || opens_region) && dropped.contains(&id) {
                        continue;
                    }
                    if opens_region {
                        depth += 1;
                    }
                    if depth > 0 {
                        text.push(' ');
                    }
                    stack.push(Frame::Leave { opens_region });
                    for child in node.children().rev() {
                        stack.push(Frame::Enter(child));
                    }
                }
                _ => {}
            },
        }
    }

    normalize_whitespace(&text)
}

/// Collapse whitespace runs to a single space and trim both ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
