//! Pipeline description language
//!
//! Descriptions are linear graph strings handed to the pipeline engine:
//!
//! ```text
//! videotestsrc pattern=0 ! video/x-raw,width=1280,height=720 ! gdppay ! tcpclientsink port=3000
//! ```
//!
//! Elements carry space separated `key=value` properties and are chained
//! with `!`. Caps strings contain a `/`, and pad references (`name.` or
//! `name.pad`) start a new branch. The harness only checks that a string is
//! well formed; what the elements mean is up to the engine.

use std::fmt;

use super::error::LaunchError;

/// Link token between two nodes
pub const LINK: &str = "!";

/// A single element with its properties, used to build descriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    factory: String,
    properties: Vec<(String, String)>,
}

impl Element {
    /// Create an element for the given factory name
    pub fn new(factory: impl Into<String>) -> Self {
        Self {
            factory: factory.into(),
            properties: Vec::new(),
        }
    }

    /// Add a `key=value` property
    pub fn prop(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.properties.push((key.into(), value.to_string()));
        self
    }

    /// Add a property only when a value is present
    pub fn prop_opt<V: fmt::Display>(self, key: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(v) => self.prop(key, v),
            None => self,
        }
    }

    fn render(&self, out: &mut String) {
        out.push_str(&self.factory);
        for (key, value) in &self.properties {
            out.push(' ');
            out.push_str(key);
            out.push('=');
            if needs_quoting(value) {
                out.push('"');
                out.push_str(&value.replace('"', "\\\""));
                out.push('"');
            } else {
                out.push_str(value);
            }
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c == '!')
}

/// Builder for a textual pipeline description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineDescription {
    text: String,
    open_link: bool,
}

impl PipelineDescription {
    /// Start an empty description
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an already written description
    pub fn raw(text: impl Into<String>) -> Self {
        let text = text.into();
        let open_link = !text.trim().is_empty();
        Self { text, open_link }
    }

    /// Append an element, linking it to the previous node
    pub fn element(mut self, element: Element) -> Self {
        self.link();
        element.render(&mut self.text);
        self.open_link = true;
        self
    }

    /// Append a caps filter, linking it to the previous node
    pub fn caps(mut self, caps: impl AsRef<str>) -> Self {
        self.link();
        self.text.push_str(caps.as_ref());
        self.open_link = true;
        self
    }

    /// Start a new branch from a named element's pad (`name.` or `name.pad`)
    pub fn branch(mut self, pad_ref: impl AsRef<str>) -> Self {
        if !self.text.is_empty() {
            self.text.push(' ');
        }
        self.text.push_str(pad_ref.as_ref());
        self.open_link = true;
        self
    }

    fn link(&mut self) {
        if self.open_link {
            self.text.push(' ');
            self.text.push_str(LINK);
            self.text.push(' ');
        }
    }

    /// Description text
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Consume the builder and return the text
    pub fn into_string(self) -> String {
        self.text
    }

    /// Check the description is well formed and return its element graph
    pub fn parse(&self) -> Result<PipelineGraph, LaunchError> {
        parse(&self.text)
    }
}

impl fmt::Display for PipelineDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl From<PipelineDescription> for String {
    fn from(desc: PipelineDescription) -> Self {
        desc.text
    }
}

/// A parsed element
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementSpec {
    pub factory: String,
    pub properties: Vec<(String, String)>,
}

impl ElementSpec {
    /// Look up a property value
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Name given with `name=…`, if any
    pub fn name(&self) -> Option<&str> {
        self.property("name")
    }
}

/// One node in a chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(ElementSpec),
    Caps(String),
    PadRef { element: String, pad: Option<String> },
}

/// Parsed pipeline: one or more linked chains
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineGraph {
    pub chains: Vec<Vec<Node>>,
}

impl PipelineGraph {
    /// All elements in description order
    pub fn elements(&self) -> impl Iterator<Item = &ElementSpec> {
        self.chains.iter().flatten().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    /// Elements created by the given factory
    pub fn elements_of<'a>(&'a self, factory: &'a str) -> impl Iterator<Item = &'a ElementSpec> {
        self.elements().filter(move |e| e.factory == factory)
    }

    pub fn element_count(&self) -> usize {
        self.elements().count()
    }
}

#[derive(Debug, PartialEq)]
enum Token {
    Link,
    Word(String),
}

fn tokenize(text: &str) -> Result<Vec<(usize, Token)>, LaunchError> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '!' {
            chars.next();
            tokens.push((pos, Token::Link));
            continue;
        }

        let mut word = String::new();
        let mut quote_start = None;
        while let Some(&(p, c)) = chars.peek() {
            match (quote_start, c) {
                (None, '"') => quote_start = Some(p),
                (Some(_), '"') => quote_start = None,
                (Some(_), '\\') => {
                    chars.next();
                    if let Some(&(_, escaped)) = chars.peek() {
                        word.push(escaped);
                    }
                }
                (None, c) if c.is_whitespace() || c == '!' => break,
                (_, c) => word.push(c),
            }
            chars.next();
        }
        if let Some(p) = quote_start {
            return Err(LaunchError::parse(p, "unterminated quote"));
        }
        tokens.push((pos, Token::Word(word)));
    }

    Ok(tokens)
}

fn is_caps(word: &str) -> bool {
    word.split(',')
        .next()
        .is_some_and(|media| media.contains('/') && !media.contains('='))
}

fn is_identifier(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next().is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Parse a description into its element graph
pub fn parse(text: &str) -> Result<PipelineGraph, LaunchError> {
    let tokens = tokenize(text)?;
    if tokens.is_empty() {
        return Err(LaunchError::parse(0, "empty pipeline"));
    }

    let mut graph = PipelineGraph::default();
    let mut chain: Vec<Node> = Vec::new();
    let mut pending_link: Option<usize> = None;

    for (pos, token) in tokens {
        let word = match token {
            Token::Link => {
                if chain.is_empty() {
                    return Err(LaunchError::parse(pos, "link without upstream element"));
                }
                if pending_link.is_some() {
                    return Err(LaunchError::parse(pos, "empty link"));
                }
                pending_link = Some(pos);
                continue;
            }
            Token::Word(word) => word,
        };

        if !is_caps(&word) {
            if let Some((key, value)) = word.split_once('=') {
                if pending_link.is_some() {
                    return Err(LaunchError::parse(pos, format!("property {} after link", key)));
                }
                match chain.last_mut() {
                    Some(Node::Element(element)) if is_identifier(key) => {
                        element.properties.push((key.to_string(), value.to_string()));
                    }
                    Some(Node::Element(_)) => {
                        return Err(LaunchError::parse(pos, format!("bad property name '{}'", key)));
                    }
                    _ => {
                        return Err(LaunchError::parse(
                            pos,
                            format!("property {} without element", key),
                        ));
                    }
                }
                continue;
            }
        }

        let node = parse_node(pos, word)?;
        if pending_link.take().is_none() && !chain.is_empty() {
            graph.chains.push(std::mem::take(&mut chain));
        }
        chain.push(node);
    }

    if let Some(pos) = pending_link {
        return Err(LaunchError::parse(pos, "dangling link"));
    }
    graph.chains.push(chain);
    Ok(graph)
}

fn parse_node(pos: usize, word: String) -> Result<Node, LaunchError> {
    if is_caps(&word) {
        return Ok(Node::Caps(word));
    }
    if let Some((element, pad)) = word.split_once('.') {
        if !is_identifier(element) {
            return Err(LaunchError::parse(pos, format!("bad pad reference '{}'", word)));
        }
        let pad = (!pad.is_empty()).then(|| pad.to_string());
        return Ok(Node::PadRef {
            element: element.to_string(),
            pad,
        });
    }
    if !is_identifier(&word) {
        return Err(LaunchError::parse(pos, format!("bad element name '{}'", word)));
    }
    Ok(Node::Element(ElementSpec {
        factory: word,
        properties: Vec::new(),
    }))
}
