//! Minimal in-memory DOM.
//!
//! Nodes are reference counted and single-threaded. Parents own children;
//! children point back at parents weakly, and a shadow root points back at
//! its host weakly. Only the operations the reconciler needs are provided.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique element identity, stable for the element's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    fn next() -> Self {
        Self(NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElementKind {
    Document,
    ShadowRoot,
    Normal,
}

struct ElementData {
    id: ElementId,
    kind: ElementKind,
    tag: String,
    attrs: RefCell<BTreeMap<String, String>>,
    children: RefCell<Vec<Node>>,
    parent: RefCell<Weak<ElementData>>,
    /// Host of a shadow root.
    host: RefCell<Weak<ElementData>>,
    shadow: RefCell<Option<Element>>,
}

/// Strong handle to an element.
#[derive(Clone)]
pub struct Element(Rc<ElementData>);

/// Weak handle to an element.
#[derive(Clone, Default)]
pub struct WeakElement(Weak<ElementData>);

struct TextData {
    data: RefCell<String>,
    parent: RefCell<Weak<ElementData>>,
}

/// Strong handle to a text node.
#[derive(Clone)]
pub struct Text(Rc<TextData>);

/// A child node.
#[derive(Clone, Debug)]
pub enum Node {
    Element(Element),
    Text(Text),
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Self::Element(element)
    }
}

impl From<Text> for Node {
    fn from(text: Text) -> Self {
        Self::Text(text)
    }
}

impl Node {
    fn set_parent(&self, parent: Weak<ElementData>) {
        match self {
            Self::Element(element) => *element.0.parent.borrow_mut() = parent,
            Self::Text(text) => *text.0.parent.borrow_mut() = parent,
        }
    }
}

impl Text {
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self(Rc::new(TextData {
            data: RefCell::new(data.into()),
            parent: RefCell::new(Weak::new()),
        }))
    }

    #[must_use]
    pub fn data(&self) -> String {
        self.0.data.borrow().clone()
    }

    pub fn set_data(&self, data: impl Into<String>) {
        *self.0.data.borrow_mut() = data.into();
    }

    #[must_use]
    pub fn parent(&self) -> Option<Element> {
        self.0.parent.borrow().upgrade().map(Element)
    }
}

impl PartialEq for Text {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Text {}

impl fmt::Debug for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Text").field(&*self.0.data.borrow()).finish()
    }
}

impl Element {
    fn with_kind(kind: ElementKind, tag: &str) -> Self {
        Self(Rc::new(ElementData {
            id: ElementId::next(),
            kind,
            tag: tag.to_ascii_lowercase(),
            attrs: RefCell::new(BTreeMap::new()),
            children: RefCell::new(Vec::new()),
            parent: RefCell::new(Weak::new()),
            host: RefCell::new(Weak::new()),
            shadow: RefCell::new(None),
        }))
    }

    #[must_use]
    pub fn new(tag: &str) -> Self {
        Self::with_kind(ElementKind::Normal, tag)
    }

    /// Builder: set the `id` attribute.
    #[must_use]
    pub fn with_id(self, id: &str) -> Self {
        self.set_attr("id", id);
        self
    }

    /// Builder: add a class.
    #[must_use]
    pub fn with_class(self, class: &str) -> Self {
        let mut classes = self.attr("class").unwrap_or_default();
        if !classes.is_empty() {
            classes.push(' ');
        }
        classes.push_str(class);
        self.set_attr("class", &classes);
        self
    }

    /// Builder: set an attribute.
    #[must_use]
    pub fn with_attr(self, name: &str, value: &str) -> Self {
        self.set_attr(name, value);
        self
    }

    /// Builder: append a text node.
    #[must_use]
    pub fn with_text(self, text: &str) -> Self {
        self.append_child(Text::new(text));
        self
    }

    /// Builder: append a child element.
    #[must_use]
    pub fn with_child(self, child: Element) -> Self {
        self.append_child(child);
        self
    }

    #[must_use]
    pub fn element_id(&self) -> ElementId {
        self.0.id
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        &self.0.tag
    }

    #[must_use]
    pub fn attr(&self, name: &str) -> Option<String> {
        self.0.attrs.borrow().get(name).cloned()
    }

    pub fn set_attr(&self, name: &str, value: &str) {
        self.0
            .attrs
            .borrow_mut()
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.attr("id")
    }

    #[must_use]
    pub fn has_class(&self, class: &str) -> bool {
        self.0
            .attrs
            .borrow()
            .get("class")
            .is_some_and(|classes| classes.split_ascii_whitespace().any(|c| c == class))
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakElement {
        WeakElement(Rc::downgrade(&self.0))
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.0.parent.borrow().upgrade().map(Self)
    }

    #[must_use]
    pub fn children(&self) -> Vec<Node> {
        self.0.children.borrow().clone()
    }

    #[must_use]
    pub fn child_elements(&self) -> Vec<Self> {
        self.0
            .children
            .borrow()
            .iter()
            .filter_map(|node| match node {
                Node::Element(element) => Some(element.clone()),
                Node::Text(_) => None,
            })
            .collect()
    }

    /// Append a node, detaching it from any previous parent first.
    pub fn append_child(&self, node: impl Into<Node>) {
        let node = node.into();
        match &node {
            Node::Element(element) => element.remove(),
            Node::Text(text) => {
                if let Some(parent) = text.parent() {
                    parent.remove_text(text);
                }
            }
        }
        node.set_parent(Rc::downgrade(&self.0));
        self.0.children.borrow_mut().push(node);
    }

    /// Remove a direct child element. Returns whether it was a child.
    pub fn remove_child(&self, child: &Self) -> bool {
        let mut children = self.0.children.borrow_mut();
        let Some(index) = children
            .iter()
            .position(|node| matches!(node, Node::Element(e) if e == child))
        else {
            return false;
        };
        let removed = children.remove(index);
        drop(children);
        removed.set_parent(Weak::new());
        true
    }

    fn remove_text(&self, text: &Text) {
        let mut children = self.0.children.borrow_mut();
        if let Some(index) = children
            .iter()
            .position(|node| matches!(node, Node::Text(t) if t == text))
        {
            let removed = children.remove(index);
            drop(children);
            removed.set_parent(Weak::new());
        }
    }

    /// Detach from the current parent, if any.
    pub fn remove(&self) {
        if let Some(parent) = self.parent() {
            parent.remove_child(self);
        }
    }

    /// Concatenated text of all descendant text nodes, excluding shadow trees.
    #[must_use]
    pub fn text_content(&self) -> String {
        self.text_nodes().iter().map(Text::data).collect()
    }

    /// Replace every child with a single text node.
    pub fn set_text_content(&self, text: &str) {
        let old = std::mem::take(&mut *self.0.children.borrow_mut());
        for node in &old {
            node.set_parent(Weak::new());
        }
        if !text.is_empty() {
            self.append_child(Text::new(text));
        }
    }

    /// Descendant text nodes in document order.
    #[must_use]
    pub fn text_nodes(&self) -> Vec<Text> {
        let mut out = Vec::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut Vec<Text>) {
        for node in self.0.children.borrow().iter() {
            match node {
                Node::Text(text) => out.push(text.clone()),
                Node::Element(element) => element.collect_text(out),
            }
        }
    }

    /// Attach a fresh shadow root, replacing any existing one.
    pub fn attach_shadow(&self) -> Self {
        let root = Self::with_kind(ElementKind::ShadowRoot, "#shadow-root");
        *root.0.host.borrow_mut() = Rc::downgrade(&self.0);
        *self.0.shadow.borrow_mut() = Some(root.clone());
        root
    }

    #[must_use]
    pub fn shadow_root(&self) -> Option<Self> {
        self.0.shadow.borrow().clone()
    }

    /// Host element of a shadow root.
    #[must_use]
    pub fn host(&self) -> Option<Self> {
        self.0.host.borrow().upgrade().map(Self)
    }

    /// Whether the element is reachable from a document root, crossing
    /// shadow boundaries through their hosts.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let mut current = self.clone();
        loop {
            match current.0.kind {
                ElementKind::Document => return true,
                ElementKind::ShadowRoot => {
                    let attached = current.host().filter(|host| {
                        host.shadow_root().is_some_and(|root| root == current)
                    });
                    match attached {
                        Some(host) => current = host,
                        None => return false,
                    }
                }
                ElementKind::Normal => match current.parent() {
                    Some(parent) => current = parent,
                    None => return false,
                },
            }
        }
    }

    /// Descendant elements matching `selector`, in document order. Does not
    /// enter shadow trees.
    #[must_use]
    pub fn query_all(&self, selector: &Selector) -> Vec<Self> {
        let mut out = Vec::new();
        self.collect_matches(selector, &mut out, false);
        out
    }

    /// First descendant element matching `selector`.
    #[must_use]
    pub fn query_first(&self, selector: &Selector) -> Option<Self> {
        let mut out = Vec::new();
        self.collect_matches(selector, &mut out, true);
        out.into_iter().next()
    }

    fn collect_matches(&self, selector: &Selector, out: &mut Vec<Self>, first_only: bool) {
        for child in self.child_elements() {
            if first_only && !out.is_empty() {
                return;
            }
            if selector.matches(&child) {
                out.push(child.clone());
            }
            child.collect_matches(selector, out, first_only);
        }
    }
}

impl PartialEq for Element {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Element {}

impl fmt::Debug for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Element");
        debug.field("id", &self.0.id).field("tag", &self.0.tag);
        if let Some(html_id) = self.id() {
            debug.field("html_id", &html_id);
        }
        debug.finish_non_exhaustive()
    }
}

impl WeakElement {
    #[must_use]
    pub fn upgrade(&self) -> Option<Element> {
        self.0.upgrade().map(Element)
    }
}

impl fmt::Debug for WeakElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(element) => write!(f, "WeakElement({})", element.element_id()),
            None => f.write_str("WeakElement(<dropped>)"),
        }
    }
}

/// A document: the root every connected element leads back to.
#[derive(Debug, Clone)]
pub struct Document {
    root: Element,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    #[must_use]
    pub fn new() -> Self {
        Self {
            root: Element::with_kind(ElementKind::Document, "#document"),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Element {
        &self.root
    }

    pub fn append_child(&self, node: impl Into<Node>) {
        self.root.append_child(node);
    }

    #[must_use]
    pub fn query_all(&self, selector: &Selector) -> Vec<Element> {
        self.root.query_all(selector)
    }

    #[must_use]
    pub fn query_first(&self, selector: &Selector) -> Option<Element> {
        self.root.query_first(selector)
    }
}

/// One compound selector: optional tag, optional id, any classes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
}

impl Compound {
    fn parse(raw: &str) -> Option<Self> {
        let mut compound = Self::default();
        let mut rest = raw;

        let tag_len = rest.find(['#', '.']).unwrap_or(rest.len());
        if tag_len > 0 {
            let tag = &rest[..tag_len];
            if !is_ident(tag) {
                return None;
            }
            compound.tag = Some(tag.to_ascii_lowercase());
        }
        rest = &rest[tag_len..];

        while let Some(marker) = rest.chars().next() {
            let body = &rest[1..];
            let len = body.find(['#', '.']).unwrap_or(body.len());
            let name = &body[..len];
            if !is_ident(name) {
                return None;
            }
            match marker {
                '#' if compound.id.is_none() => compound.id = Some(name.to_string()),
                '.' => compound.classes.push(name.to_string()),
                _ => return None,
            }
            rest = &body[len..];
        }

        if compound == Self::default() {
            return None;
        }
        Some(compound)
    }

    fn matches(&self, element: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if element.tag() != tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if element.id().as_deref() != Some(id.as_str()) {
                return false;
            }
        }
        self.classes.iter().all(|class| element.has_class(class))
    }
}

fn is_ident(raw: &str) -> bool {
    !raw.is_empty()
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Selector subset: `tag`, `#id`, `.class` compounds and comma lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    alternatives: Vec<Compound>,
}

impl Selector {
    /// Parse a selector list. Returns `None` for anything outside the subset,
    /// including combinators.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let alternatives = raw
            .split(',')
            .map(|part| Compound::parse(part.trim()))
            .collect::<Option<Vec<_>>>()?;
        if alternatives.is_empty() {
            return None;
        }
        Some(Self { alternatives })
    }

    #[must_use]
    pub fn matches(&self, element: &Element) -> bool {
        element.0.kind == ElementKind::Normal
            && self.alternatives.iter().any(|alt| alt.matches(element))
    }
}

impl std::str::FromStr for Selector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unsupported selector: {s}"))
    }
}
