//! Newick phylogenies and patristic distances.
//!
//! The parser is iterative so deeply nested (caterpillar) trees do not
//! exhaust the stack. Missing branch lengths count as zero.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use crate::error::{EcoaxisError, Result};

#[derive(Debug, Clone, PartialEq)]
struct Node {
    label: Option<String>,
    parent: Option<usize>,
    /// Length of the branch to `parent`.
    length: f64,
    children: Vec<usize>,
}

/// Rooted tree with labelled tips.
#[derive(Debug, Clone, PartialEq)]
pub struct PhyloTree {
    nodes: Vec<Node>,
    tips: HashMap<String, usize>,
}

const DELIMITERS: &[char] = &['(', ')', ',', ':', ';', '[', '\''];

impl PhyloTree {
    pub fn parse(newick: &str) -> Result<Self> {
        let chars: Vec<char> = newick.chars().collect();
        let mut nodes: Vec<Node> = Vec::new();
        let mut open: Vec<usize> = Vec::new();
        // Node that a following label or `:length` applies to.
        let mut current: Option<usize> = None;
        let mut finished = false;
        let mut pos = 0;

        let err = |pos: usize, msg: &str| EcoaxisError::parse(format!("newick offset {pos}"), msg);

        while pos < chars.len() {
            let c = chars[pos];
            if finished {
                if !c.is_whitespace() {
                    return Err(err(pos, "content after ';'"));
                }
                pos += 1;
                continue;
            }
            match c {
                c if c.is_whitespace() => pos += 1,
                '[' => {
                    while pos < chars.len() && chars[pos] != ']' {
                        pos += 1;
                    }
                    if pos == chars.len() {
                        return Err(err(pos, "unterminated comment"));
                    }
                    pos += 1;
                }
                '(' => {
                    if current.is_some() || (!nodes.is_empty() && open.is_empty()) {
                        return Err(err(pos, "unexpected '('"));
                    }
                    let idx = new_node(&mut nodes, open.last().copied());
                    open.push(idx);
                    current = None;
                    pos += 1;
                }
                ',' => {
                    if open.is_empty() {
                        return Err(err(pos, "',' outside parentheses"));
                    }
                    if current.is_none() {
                        // Empty sibling such as "(,A)": an unlabelled tip.
                        new_node(&mut nodes, open.last().copied());
                    }
                    current = None;
                    pos += 1;
                }
                ')' => {
                    let idx = open.pop().ok_or_else(|| err(pos, "unbalanced ')'"))?;
                    if current.is_none() {
                        new_node(&mut nodes, Some(idx));
                    }
                    current = Some(idx);
                    pos += 1;
                }
                ':' => {
                    let target = current.ok_or_else(|| err(pos, "branch length without node"))?;
                    pos += 1;
                    let start = pos;
                    while pos < chars.len() && !DELIMITERS.contains(&chars[pos]) && !chars[pos].is_whitespace() {
                        pos += 1;
                    }
                    let token: String = chars[start..pos].iter().collect();
                    let length: f64 = token
                        .parse()
                        .map_err(|_| err(start, &format!("bad branch length '{token}'")))?;
                    if !length.is_finite() || length < 0.0 {
                        return Err(err(start, &format!("invalid branch length {length}")));
                    }
                    nodes[target].length = length;
                }
                ';' => {
                    if !open.is_empty() {
                        return Err(err(pos, "unclosed '('"));
                    }
                    if nodes.is_empty() {
                        return Err(err(pos, "empty tree"));
                    }
                    finished = true;
                    pos += 1;
                }
                _ => {
                    let (label, next) = if c == '\'' {
                        read_quoted(&chars, pos).ok_or_else(|| err(pos, "unterminated quote"))?
                    } else {
                        let start = pos;
                        let mut end = pos;
                        while end < chars.len() && !DELIMITERS.contains(&chars[end]) && !chars[end].is_whitespace() {
                            end += 1;
                        }
                        (chars[start..end].iter().collect(), end)
                    };
                    pos = next;
                    let idx = match current {
                        // Label of a just-closed clade.
                        Some(idx) if nodes[idx].label.is_none() && !nodes[idx].children.is_empty() => idx,
                        Some(_) => return Err(err(pos, "unexpected label")),
                        None => {
                            if !nodes.is_empty() && open.is_empty() {
                                return Err(err(pos, "label outside tree"));
                            }
                            new_node(&mut nodes, open.last().copied())
                        }
                    };
                    nodes[idx].label = Some(label);
                    current = Some(idx);
                }
            }
        }
        if !finished {
            return Err(err(chars.len(), "missing ';'"));
        }

        let mut tips = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            if !node.children.is_empty() {
                continue;
            }
            if let Some(label) = &node.label {
                if tips.insert(label.clone(), i).is_some() {
                    return Err(EcoaxisError::parse("newick", format!("duplicate tip '{label}'")));
                }
            }
        }
        Ok(Self { nodes, tips })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw).map_err(|e| {
            EcoaxisError::MalformedArtifact(format!("phylogeny {}: {e}", path.display()))
        })
    }

    pub fn tip_count(&self) -> usize {
        self.tips.len()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.tips.contains_key(label)
    }

    /// Tip labels in sorted order.
    pub fn tips(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.tips.keys().map(String::as_str).collect();
        out.sort_unstable();
        out
    }

    /// Patristic distance from `label` to every other labelled tip.
    pub fn distances_from(&self, label: &str) -> Result<BTreeMap<String, f64>> {
        let &start = self
            .tips
            .get(label)
            .ok_or_else(|| EcoaxisError::MissingReference(format!("'{label}' not in phylogeny")))?;

        let mut dist = vec![f64::NAN; self.nodes.len()];
        dist[start] = 0.0;
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            let node = &self.nodes[i];
            if let Some(p) = node.parent.filter(|&p| dist[p].is_nan()) {
                dist[p] = dist[i] + node.length;
                stack.push(p);
            }
            for &c in &node.children {
                if dist[c].is_nan() {
                    dist[c] = dist[i] + self.nodes[c].length;
                    stack.push(c);
                }
            }
        }

        Ok(self
            .tips
            .iter()
            .filter(|&(_, &i)| i != start)
            .map(|(name, &i)| (name.clone(), dist[i]))
            .collect())
    }

    pub fn patristic(&self, a: &str, b: &str) -> Result<f64> {
        if a == b && self.contains(a) {
            return Ok(0.0);
        }
        self.distances_from(a)?
            .get(b)
            .copied()
            .ok_or_else(|| EcoaxisError::MissingReference(format!("'{b}' not in phylogeny")))
    }
}

fn new_node(nodes: &mut Vec<Node>, parent: Option<usize>) -> usize {
    let idx = nodes.len();
    nodes.push(Node {
        label: None,
        parent,
        length: 0.0,
        children: Vec::new(),
    });
    if let Some(p) = parent {
        nodes[p].children.push(idx);
    }
    idx
}

/// Read a single-quoted label starting at `pos`; `''` is an escaped quote.
fn read_quoted(chars: &[char], pos: usize) -> Option<(String, usize)> {
    let mut out = String::new();
    let mut i = pos + 1;
    while i < chars.len() {
        if chars[i] == '\'' {
            if chars.get(i + 1) == Some(&'\'') {
                out.push('\'');
                i += 2;
                continue;
            }
            return Some((out, i + 1));
        }
        out.push(chars[i]);
        i += 1;
    }
    None
}
