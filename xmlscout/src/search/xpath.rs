/// A small XPath subset evaluated over XML element paths.
///
/// Supported syntax:
///
/// | Form                           | Meaning                                  |
/// |--------------------------------|------------------------------------------|
/// | `/a/b`                         | `b` child of the root element `a`        |
/// | `//b`                          | `b` anywhere                             |
/// | `/a//c`                        | `c` anywhere below root `a`              |
/// | `a/b`                          | relative, same as `//a/b`                |
/// | `*`                            | any element name                         |
/// | `[@id]`, `[@id='v']`           | attribute present / equal                |
/// | `[text()='v']`                 | trimmed direct text equal                |
/// | `[contains(text(),'v')]`       | direct text contains                     |
///
/// Text predicates may only appear on the last step, because an ancestor's
/// text is not complete when a descendant closes. Positional predicates are
/// rejected. Name and text comparisons are exact.
///
/// Two evaluators share one event walker. [`QuerySet::evaluate_document`]
/// parses the whole document into an arena first and then evaluates every
/// element; [`QuerySet::evaluate_stream`] evaluates as elements close and
/// keeps only the open-element stack. Both visit elements in closing order,
/// so they report the same hits for a well-formed document.
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::borrow::{Borrow, Cow};
use std::io::BufRead;
use std::ops::ControlFlow;

use crate::errors::{SearchError, SearchResult};
use crate::results::MatchHit;

const SNIPPET_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum NameTest {
    Any,
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Predicate {
    HasAttribute(String),
    AttributeEquals(String, String),
    TextEquals(String),
    TextContains(String),
}

impl Predicate {
    fn needs_text(&self) -> bool {
        matches!(self, Self::TextEquals(_) | Self::TextContains(_))
    }

    fn test(&self, element: &ElementFrame) -> bool {
        match self {
            Self::HasAttribute(name) => element.attribute(name).is_some(),
            Self::AttributeEquals(name, value) => element.attribute(name) == Some(value.as_str()),
            Self::TextEquals(value) => element.text.trim() == value,
            Self::TextContains(value) => element.text.contains(value.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Step {
    axis: Axis,
    name: NameTest,
    predicates: Vec<Predicate>,
}

impl Step {
    fn test(&self, element: &ElementFrame) -> bool {
        let name_ok = match &self.name {
            NameTest::Any => true,
            NameTest::Name(name) => element.name == *name,
        };
        name_ok && self.predicates.iter().all(|p| p.test(element))
    }
}

/// One element as seen by the evaluators
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementFrame {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    /// Direct text content, entity references resolved
    pub text: String,
    /// Byte offset of the start tag
    pub offset: u64,
}

impl ElementFrame {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn snippet(&self) -> String {
        let text = self.text.trim();
        let mut snippet = format!("<{}>{}", self.name, text);
        if snippet.len() > SNIPPET_LIMIT {
            let mut cut = SNIPPET_LIMIT;
            while !snippet.is_char_boundary(cut) {
                cut -= 1;
            }
            snippet.truncate(cut);
        }
        snippet
    }
}

/// A compiled query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPath {
    source: String,
    steps: Vec<Step>,
}

impl XPath {
    pub fn parse(query: &str) -> SearchResult<Self> {
        let steps = Parser::new(query).parse()?;
        Ok(Self {
            source: query.to_string(),
            steps,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Tests the last element of `chain`, where `chain` runs from the root
    /// element down to the element under test
    pub fn matches<E: Borrow<ElementFrame>>(&self, chain: &[E]) -> bool {
        match chain.len() {
            0 => false,
            n => self.match_step(chain, self.steps.len() - 1, n - 1),
        }
    }

    fn match_step<E: Borrow<ElementFrame>>(&self, chain: &[E], step: usize, at: usize) -> bool {
        let current = &self.steps[step];
        if !current.test(chain[at].borrow()) {
            return false;
        }
        if step == 0 {
            return current.axis == Axis::Descendant || at == 0;
        }
        match current.axis {
            Axis::Child => at > 0 && self.match_step(chain, step - 1, at - 1),
            Axis::Descendant => (0..at).rev().any(|up| self.match_step(chain, step - 1, up)),
        }
    }
}

struct Parser<'q> {
    query: &'q str,
    rest: &'q str,
}

impl<'q> Parser<'q> {
    fn new(query: &'q str) -> Self {
        Self {
            query,
            rest: query.trim(),
        }
    }

    fn error(&self, msg: impl Into<String>) -> SearchError {
        SearchError::invalid_query(self.query, msg)
    }

    fn parse(mut self) -> SearchResult<Vec<Step>> {
        if self.rest.is_empty() {
            return Err(self.error("empty query"));
        }

        let mut steps = Vec::new();
        let mut axis = if self.eat("//") {
            Axis::Descendant
        } else if self.eat("/") {
            Axis::Child
        } else {
            Axis::Descendant
        };

        loop {
            steps.push(self.step(axis)?);
            if self.rest.is_empty() {
                break;
            }
            axis = if self.eat("//") {
                Axis::Descendant
            } else if self.eat("/") {
                Axis::Child
            } else {
                return Err(self.error(format!("unexpected '{}'", self.rest)));
            };
        }

        let last = steps.len() - 1;
        if steps[..last]
            .iter()
            .any(|s| s.predicates.iter().any(Predicate::needs_text))
        {
            return Err(self.error("text() predicates are only allowed on the last step"));
        }
        Ok(steps)
    }

    fn eat(&mut self, token: &str) -> bool {
        match self.rest.strip_prefix(token) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn expect(&mut self, token: &str) -> SearchResult<()> {
        self.skip_ws();
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", token)))
        }
    }

    fn name(&mut self) -> SearchResult<String> {
        let end = self
            .rest
            .find(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | ':')))
            .unwrap_or(self.rest.len());
        if end == 0 {
            return Err(self.error("expected a name"));
        }
        let (name, rest) = self.rest.split_at(end);
        self.rest = rest;
        Ok(name.to_string())
    }

    fn literal(&mut self) -> SearchResult<String> {
        self.skip_ws();
        let quote = match self.rest.chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        let body = &self.rest[1..];
        let end = body
            .find(quote)
            .ok_or_else(|| self.error("unterminated string"))?;
        let value = body[..end].to_string();
        self.rest = &body[end + 1..];
        Ok(value)
    }

    fn step(&mut self, axis: Axis) -> SearchResult<Step> {
        let name = if self.eat("*") {
            NameTest::Any
        } else {
            NameTest::Name(self.name()?)
        };
        let mut predicates = Vec::new();
        while self.eat("[") {
            predicates.push(self.predicate()?);
            self.expect("]")?;
        }
        Ok(Step {
            axis,
            name,
            predicates,
        })
    }

    fn predicate(&mut self) -> SearchResult<Predicate> {
        self.skip_ws();
        if self.eat("@") {
            let name = self.name()?;
            self.skip_ws();
            if self.eat("=") {
                return Ok(Predicate::AttributeEquals(name, self.literal()?));
            }
            return Ok(Predicate::HasAttribute(name));
        }
        if self.eat("text()") {
            self.expect("=")?;
            return Ok(Predicate::TextEquals(self.literal()?));
        }
        if self.eat("contains") {
            self.expect("(")?;
            self.expect("text()")?;
            self.expect(",")?;
            let value = self.literal()?;
            self.expect(")")?;
            return Ok(Predicate::TextContains(value));
        }
        if self.rest.starts_with(|c: char| c.is_ascii_digit()) || self.rest.starts_with("last()") {
            return Err(self.error("positional predicates are not supported"));
        }
        Err(self.error(format!("unsupported predicate near '{}'", self.rest)))
    }
}

/// The compiled queries of one run
#[derive(Debug, Clone)]
pub struct QuerySet {
    queries: Vec<XPath>,
}

impl QuerySet {
    pub fn compile(queries: &[String]) -> SearchResult<Self> {
        Ok(Self {
            queries: queries
                .iter()
                .map(|q| XPath::parse(q))
                .collect::<SearchResult<_>>()?,
        })
    }

    fn collect_hits<E: Borrow<ElementFrame>>(
        &self,
        chain: &[E],
        hits: &mut Vec<MatchHit>,
        stop_on_first: bool,
    ) -> ControlFlow<()> {
        let Some(element) = chain.last() else {
            return ControlFlow::Continue(());
        };
        for (index, query) in self.queries.iter().enumerate() {
            if query.matches(chain) {
                let element: &ElementFrame = element.borrow();
                hits.push(MatchHit {
                    term: query.source().to_string(),
                    term_index: index,
                    offset: element.offset,
                    line: None,
                    snippet: element.snippet(),
                });
                if stop_on_first {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    /// Parses the whole document into a tree, then evaluates every element
    pub fn evaluate_document(
        &self,
        document: &[u8],
        path: &str,
        stop_on_first: bool,
    ) -> SearchResult<Vec<MatchHit>> {
        let mut reader = Reader::from_reader(document);
        let mut tree = DocumentTree::default();
        walk(&mut reader, path, &mut tree)?;

        let mut hits = Vec::new();
        let mut chain: Vec<&ElementFrame> = Vec::new();
        for &node in &tree.close_order {
            chain.clear();
            let mut cursor = Some(node);
            while let Some(index) = cursor {
                chain.push(&tree.nodes[index].frame);
                cursor = tree.nodes[index].parent;
            }
            chain.reverse();
            if self.collect_hits(&chain, &mut hits, stop_on_first).is_break() {
                break;
            }
        }
        Ok(hits)
    }

    /// Evaluates elements as they close, holding only the open-element stack.
    /// With `stop_on_first` the rest of the stream is not read after a hit.
    pub fn evaluate_stream<B: BufRead>(
        &self,
        reader: &mut Reader<B>,
        path: &str,
        stop_on_first: bool,
    ) -> SearchResult<Vec<MatchHit>> {
        let mut visitor = StreamingVisitor {
            queries: self,
            hits: Vec::new(),
            stop_on_first,
        };
        walk(reader, path, &mut visitor)?;
        Ok(visitor.hits)
    }
}

trait ElementVisitor {
    fn open(&mut self, _stack: &[ElementFrame]) {}

    /// Called with the closing element on top of `stack`
    fn close(&mut self, stack: &[ElementFrame]) -> ControlFlow<()>;
}

struct StreamingVisitor<'q> {
    queries: &'q QuerySet,
    hits: Vec<MatchHit>,
    stop_on_first: bool,
}

impl ElementVisitor for StreamingVisitor<'_> {
    fn close(&mut self, stack: &[ElementFrame]) -> ControlFlow<()> {
        self.queries
            .collect_hits(stack, &mut self.hits, self.stop_on_first)
    }
}

struct TreeNode {
    frame: ElementFrame,
    parent: Option<usize>,
}

/// Arena-backed element tree
#[derive(Default)]
struct DocumentTree {
    nodes: Vec<TreeNode>,
    open: Vec<usize>,
    close_order: Vec<usize>,
}

impl ElementVisitor for DocumentTree {
    fn open(&mut self, stack: &[ElementFrame]) {
        if let Some(frame) = stack.last() {
            self.nodes.push(TreeNode {
                frame: frame.clone(),
                parent: self.open.last().copied(),
            });
            self.open.push(self.nodes.len() - 1);
        }
    }

    fn close(&mut self, stack: &[ElementFrame]) -> ControlFlow<()> {
        if let (Some(index), Some(frame)) = (self.open.pop(), stack.last()) {
            self.nodes[index].frame.text.clone_from(&frame.text);
            self.close_order.push(index);
        }
        ControlFlow::Continue(())
    }
}

fn utf8<'b>(bytes: &'b [u8], path: &str) -> SearchResult<&'b str> {
    std::str::from_utf8(bytes).map_err(|e| SearchError::malformed(path, e.to_string()))
}

fn resolve_reference(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix('x').or_else(|| code.strip_prefix('X')) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse().ok()?,
            };
            char::from_u32(value)
        }
    }
}

fn open_frame(start: &BytesStart<'_>, offset: u64, path: &str) -> SearchResult<ElementFrame> {
    let name = utf8(start.name().as_ref(), path)?.to_string();
    let mut attributes = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| SearchError::malformed(path, e.to_string()))?;
        let key = utf8(attr.key.as_ref(), path)?.to_string();
        let raw = utf8(&attr.value, path)?;
        let value = quick_xml::escape::unescape(raw)
            .map_err(|e| SearchError::malformed(path, e.to_string()))?
            .into_owned();
        attributes.push((key, value));
    }
    Ok(ElementFrame {
        name,
        attributes,
        text: String::new(),
        offset,
    })
}

fn append_text(stack: &mut [ElementFrame], text: &str, path: &str) -> SearchResult<()> {
    match stack.last_mut() {
        Some(top) => {
            top.text.push_str(text);
            Ok(())
        }
        None if text.trim().is_empty() => Ok(()),
        None => Err(SearchError::malformed(path, "text outside the root element")),
    }
}

/// Drives a quick-xml reader and reports element opens and closes.
/// Checks well-formedness as far as the walk goes.
fn walk<B: BufRead, V: ElementVisitor>(
    reader: &mut Reader<B>,
    path: &str,
    visitor: &mut V,
) -> SearchResult<()> {
    let mut buf = Vec::new();
    let mut stack: Vec<ElementFrame> = Vec::new();
    let mut seen_root = false;

    loop {
        let offset = reader.buffer_position() as u64;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| SearchError::malformed(path, e.to_string()))?;
        match event {
            Event::Start(start) | Event::Empty(start) if stack.is_empty() && seen_root => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                return Err(SearchError::malformed(
                    path,
                    format!("second root element <{}>", name),
                ));
            }
            Event::Start(start) => {
                seen_root = true;
                stack.push(open_frame(&start, offset, path)?);
                visitor.open(&stack);
            }
            Event::Empty(start) => {
                seen_root = true;
                stack.push(open_frame(&start, offset, path)?);
                visitor.open(&stack);
                let flow = visitor.close(&stack);
                stack.pop();
                if flow.is_break() {
                    return Ok(());
                }
            }
            Event::End(_) => {
                if stack.is_empty() {
                    return Err(SearchError::malformed(path, "unmatched end tag"));
                }
                let flow = visitor.close(&stack);
                stack.pop();
                if flow.is_break() {
                    return Ok(());
                }
            }
            Event::Text(text) => {
                let raw = utf8(&text, path)?;
                let resolved = quick_xml::escape::unescape(raw).unwrap_or(Cow::Borrowed(raw));
                append_text(&mut stack, &resolved, path)?;
            }
            Event::CData(data) => {
                let raw = utf8(&data, path)?;
                append_text(&mut stack, raw, path)?;
            }
            Event::GeneralRef(reference) => {
                let name = utf8(&reference, path)?;
                let ch = resolve_reference(name).ok_or_else(|| {
                    SearchError::malformed(path, format!("unknown entity '&{};'", name))
                })?;
                append_text(&mut stack, ch.encode_utf8(&mut [0; 4]), path)?;
            }
            Event::Eof => {
                if let Some(open) = stack.last() {
                    return Err(SearchError::malformed(
                        path,
                        format!("unexpected end of document inside <{}>", open.name),
                    ));
                }
                if !seen_root {
                    return Err(SearchError::malformed(path, "no root element"));
                }
                return Ok(());
            }
            _ => {}
        }
        buf.clear();
    }
}
