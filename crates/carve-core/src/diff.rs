//! LCS-based text diff used for reflection payloads and result inspection.

use serde::{Deserialize, Serialize};

/// Above this many DP cells the middle section is reported as a plain
/// removal followed by an addition.
const MAX_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Line,
    #[default]
    Word,
    Char,
}

impl std::str::FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "line" | "lines" => Ok(Granularity::Line),
            "word" | "words" => Ok(Granularity::Word),
            "char" | "chars" => Ok(Granularity::Char),
            _ => Err(format!("Unknown diff granularity: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Equal,
    Added,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSegment {
    pub kind: SegmentKind,
    pub value: String,
}

/// Diff `expected` (old) against `actual` (new).
///
/// Adjacent tokens of the same kind are merged into one segment. Joining the
/// `equal` and `removed` values reproduces the tokens of `expected`; joining
/// `equal` and `added` reproduces `actual`.
pub fn diff(expected: &str, actual: &str, granularity: Granularity) -> Vec<DiffSegment> {
    let old = tokenize(expected, granularity);
    let new = tokenize(actual, granularity);

    let prefix = old.iter().zip(&new).take_while(|(a, b)| a == b).count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();

    let mut ops: Vec<(SegmentKind, &str)> = Vec::with_capacity(old.len().max(new.len()));
    ops.extend(old[..prefix].iter().map(|t| (SegmentKind::Equal, *t)));
    lcs_ops(
        &old[prefix..old.len() - suffix],
        &new[prefix..new.len() - suffix],
        &mut ops,
    );
    ops.extend(old[old.len() - suffix..].iter().map(|t| (SegmentKind::Equal, *t)));

    merge(ops, granularity)
}

fn tokenize(text: &str, granularity: Granularity) -> Vec<&str> {
    match granularity {
        Granularity::Line => text.lines().collect(),
        Granularity::Word => text.split_whitespace().collect(),
        Granularity::Char => text.char_indices().map(|(i, c)| &text[i..i + c.len_utf8()]).collect(),
    }
}

fn lcs_ops<'a>(old: &[&'a str], new: &[&'a str], ops: &mut Vec<(SegmentKind, &'a str)>) {
    let (n, m) = (old.len(), new.len());
    if n == 0 || m == 0 || (n + 1) * (m + 1) > MAX_CELLS {
        ops.extend(old.iter().map(|t| (SegmentKind::Removed, *t)));
        ops.extend(new.iter().map(|t| (SegmentKind::Added, *t)));
        return;
    }

    // table[i][j] = LCS length of old[i..] and new[j..]
    let width = m + 1;
    let mut table = vec![0u32; (n + 1) * width];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i * width + j] = if old[i] == new[j] {
                table[(i + 1) * width + j + 1] + 1
            } else {
                table[(i + 1) * width + j].max(table[i * width + j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push((SegmentKind::Equal, old[i]));
            i += 1;
            j += 1;
        } else if table[(i + 1) * width + j] >= table[i * width + j + 1] {
            ops.push((SegmentKind::Removed, old[i]));
            i += 1;
        } else {
            ops.push((SegmentKind::Added, new[j]));
            j += 1;
        }
    }
    ops.extend(old[i..].iter().map(|t| (SegmentKind::Removed, *t)));
    ops.extend(new[j..].iter().map(|t| (SegmentKind::Added, *t)));
}

fn merge(ops: Vec<(SegmentKind, &str)>, granularity: Granularity) -> Vec<DiffSegment> {
    let sep = match granularity {
        Granularity::Line => "\n",
        Granularity::Word => " ",
        Granularity::Char => "",
    };

    let mut out: Vec<DiffSegment> = Vec::new();
    for (kind, token) in ops {
        match out.last_mut() {
            Some(last) if last.kind == kind => {
                last.value.push_str(sep);
                last.value.push_str(token);
            }
            _ => out.push(DiffSegment {
                kind,
                value: token.to_string(),
            }),
        }
    }
    out
}

/// Render a diff compactly for prompts: `[-removed-]` and `{+added+}`.
pub fn render_inline(segments: &[DiffSegment]) -> String {
    segments
        .iter()
        .map(|s| match s.kind {
            SegmentKind::Equal => s.value.clone(),
            SegmentKind::Removed => format!("[-{}-]", s.value),
            SegmentKind::Added => format!("{{+{}+}}", s.value),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
