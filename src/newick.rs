//! Newick tree parsing and flattening.
//!
//! Both the parser and the flattener walk the tree with explicit stacks, so
//! arbitrarily deep trees (the synthetic tree of life is tens of thousands
//! of levels deep in places) never touch the call stack.

use std::io::Read;

use crate::error::OttError;

#[derive(Debug, Clone, Default)]
struct Node {
    name: Option<String>,
    children: Vec<usize>,
}

/// Arena-backed rooted tree. Node 0 is not necessarily the root.
#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    root: usize,
}

impl Tree {
    pub fn parse(input: &str) -> Result<Self, OttError> {
        Parser::new(input).parse()
    }

    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, OttError> {
        let mut content = String::new();
        reader
            .read_to_string(&mut content)
            .map_err(|err| OttError::Filesystem(format!("read tree: {err}")))?;
        Self::parse(&content)
    }

    /// All nodes, named or not.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn named_count(&self) -> usize {
        self.nodes.iter().filter(|node| node.name.is_some()).count()
    }

    /// Every named node paired with the name of its nearest named ancestor.
    pub fn flatten(&self) -> Flatten<'_> {
        Flatten {
            tree: self,
            stack: vec![(None, self.root)],
        }
    }
}

/// Lazy depth-first stream of `(id, parent)` pairs.
///
/// Unnamed nodes emit nothing; their children inherit the unnamed node's own
/// parent so the chain of named ancestors stays intact. Emission order is
/// stack order, not root-first.
pub struct Flatten<'a> {
    tree: &'a Tree,
    stack: Vec<(Option<&'a str>, usize)>,
}

impl<'a> Iterator for Flatten<'a> {
    type Item = (&'a str, Option<&'a str>);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        while let Some((parent, index)) = self.stack.pop() {
            let node = &tree.nodes[index];
            let name = node.name.as_deref();
            let inherited = name.or(parent);
            self.stack
                .extend(node.children.iter().map(|&child| (inherited, child)));
            if let Some(name) = name {
                return Some((name, parent));
            }
        }
        None
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    nodes: Vec<Node>,
    open: Vec<usize>,
    root: Option<usize>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            nodes: Vec::new(),
            open: Vec::new(),
            root: None,
        }
    }

    fn parse(mut self) -> Result<Tree, OttError> {
        // true right after `(` or `,`, where a subtree must start
        let mut expect_node = true;
        loop {
            self.skip_trivia()?;
            let Some(byte) = self.peek() else {
                return Err(self.error("missing terminating ';'"));
            };
            match byte {
                b'(' => {
                    if !expect_node {
                        return Err(self.error("unexpected '('"));
                    }
                    self.pos += 1;
                    let index = self.attach(Node::default())?;
                    self.open.push(index);
                }
                b',' => {
                    if self.open.is_empty() {
                        return Err(self.error("',' outside of a clade"));
                    }
                    if expect_node {
                        self.attach(Node::default())?;
                    }
                    self.pos += 1;
                    expect_node = true;
                }
                b')' => {
                    if expect_node {
                        self.attach(Node::default())?;
                    }
                    let Some(index) = self.open.pop() else {
                        return Err(self.error("unbalanced ')'"));
                    };
                    self.pos += 1;
                    let name = self.label()?;
                    self.nodes[index].name = name;
                    self.branch_length()?;
                    expect_node = false;
                }
                b';' => {
                    if !self.open.is_empty() {
                        return Err(self.error("unclosed '('"));
                    }
                    if self.root.is_none() {
                        self.attach(Node::default())?;
                    }
                    self.pos += 1;
                    break;
                }
                _ => {
                    if !expect_node {
                        return Err(self.error("unexpected label"));
                    }
                    let name = self.label()?;
                    self.branch_length()?;
                    self.attach(Node {
                        name,
                        children: Vec::new(),
                    })?;
                    expect_node = false;
                }
            }
        }

        self.skip_trivia()?;
        if self.pos < self.input.len() {
            return Err(self.error("trailing data after ';'"));
        }

        let root = self.root.ok_or_else(|| self.error("empty tree"))?;
        Ok(Tree {
            nodes: self.nodes,
            root,
        })
    }

    fn attach(&mut self, node: Node) -> Result<usize, OttError> {
        let index = self.nodes.len();
        match self.open.last() {
            Some(&parent) => self.nodes[parent].children.push(index),
            None if self.root.is_none() => self.root = Some(index),
            None => return Err(self.error("more than one root")),
        }
        self.nodes.push(node);
        Ok(index)
    }

    fn label(&mut self) -> Result<Option<String>, OttError> {
        self.skip_trivia()?;
        match self.peek() {
            // `''` is as unnamed as a missing label
            Some(b'\'') => self
                .quoted_label()
                .map(|label| Some(label).filter(|label| !label.is_empty())),
            Some(_) => {
                let start = self.pos;
                while let Some(byte) = self.peek() {
                    if is_delimiter(byte) {
                        break;
                    }
                    self.pos += 1;
                }
                if start == self.pos {
                    return Ok(None);
                }
                let raw = std::str::from_utf8(&self.input[start..self.pos])
                    .map_err(|_| self.error("label is not valid UTF-8"))?;
                Ok(Some(raw.to_string()))
            }
            None => Ok(None),
        }
    }

    fn quoted_label(&mut self) -> Result<String, OttError> {
        let open = self.pos;
        self.pos += 1;
        let mut bytes = Vec::new();
        loop {
            match self.peek() {
                None => {
                    self.pos = open;
                    return Err(self.error("unterminated quoted label"));
                }
                Some(b'\'') if self.input.get(self.pos + 1) == Some(&b'\'') => {
                    bytes.push(b'\'');
                    self.pos += 2;
                }
                Some(b'\'') => {
                    self.pos += 1;
                    break;
                }
                Some(byte) => {
                    bytes.push(byte);
                    self.pos += 1;
                }
            }
        }
        String::from_utf8(bytes).map_err(|_| self.error("label is not valid UTF-8"))
    }

    fn branch_length(&mut self) -> Result<(), OttError> {
        self.skip_trivia()?;
        if self.peek() != Some(b':') {
            return Ok(());
        }
        self.pos += 1;
        self.skip_trivia()?;
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if is_delimiter(byte) {
                break;
            }
            self.pos += 1;
        }
        let raw = std::str::from_utf8(&self.input[start..self.pos]).unwrap_or_default();
        if raw.parse::<f64>().is_err() {
            self.pos = start;
            return Err(self.error("invalid branch length"));
        }
        Ok(())
    }

    /// Whitespace and `[...]` comments.
    fn skip_trivia(&mut self) -> Result<(), OttError> {
        while let Some(byte) = self.peek() {
            if byte.is_ascii_whitespace() {
                self.pos += 1;
            } else if byte == b'[' {
                let open = self.pos;
                match self.input[self.pos..].iter().position(|&b| b == b']') {
                    Some(end) => self.pos += end + 1,
                    None => {
                        self.pos = open;
                        return Err(self.error("unterminated comment"));
                    }
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn error(&self, message: &str) -> OttError {
        OttError::TreeParse {
            offset: self.pos,
            message: message.to_string(),
        }
    }
}

fn is_delimiter(byte: u8) -> bool {
    matches!(byte, b'(' | b')' | b',' | b':' | b';' | b'[' | b'\'') || byte.is_ascii_whitespace()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_labels_unescape_doubled_quotes() {
        let tree = Tree::parse("('it''s here',b)root;").unwrap();
        let names: Vec<_> = tree.flatten().map(|(id, _)| id).collect();
        assert!(names.contains(&"it's here"));
    }

    #[test]
    fn comments_and_lengths_are_ignored() {
        let tree = Tree::parse("(a:0.1[&&NHX:x=1],b:2e-3)r:0 ;\n").unwrap();
        assert_eq!(tree.named_count(), 3);
    }

    #[test]
    fn empty_leaves_are_unnamed_nodes() {
        let tree = Tree::parse("(,(,));").unwrap();
        assert_eq!(tree.node_count(), 5);
        assert_eq!(tree.named_count(), 0);
        assert_eq!(tree.flatten().count(), 0);
    }
}
