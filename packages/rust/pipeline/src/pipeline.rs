//! Immutable pipeline trees and the builder that produces them.

use std::fmt::Write as _;
use std::sync::Arc;

use crate::node::Node;
use crate::sink::Sink;

/// One element of a pipeline sequence.
#[derive(Clone)]
pub enum Element {
    /// A transform; its output feeds the next element.
    Node(Arc<dyn Node>),
    /// A sub-pipeline fed a copy of the current record; output is discarded.
    Branch(Pipeline),
    /// Absorbs a copy of the current record, which then continues unchanged.
    Sink(Arc<Sink>),
}

impl std::fmt::Debug for Element {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node(n) => write!(f, "Node({})", n.name()),
            Self::Branch(p) => f.debug_tuple("Branch").field(p).finish(),
            Self::Sink(s) => write!(f, "Sink({})", s.name()),
        }
    }
}

/// An ordered, immutable sequence of [`Element`]s.
///
/// Cloning is cheap: the elements are shared.
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    name: Option<String>,
    elements: Arc<[Element]>,
}

impl Pipeline {
    /// Start building a pipeline.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Optional name used for the run's tracing span.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The top-level elements.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Every node in the tree, depth-first. A node shared by several
    /// branches is listed once.
    pub fn nodes(&self) -> Vec<Arc<dyn Node>> {
        let mut out = Vec::new();
        collect_nodes(&self.elements, &mut out);
        out
    }

    /// Render the tree, one element per line, branches indented.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        describe_into(&self.elements, 0, &mut out);
        out
    }
}

fn collect_nodes(elements: &[Element], out: &mut Vec<Arc<dyn Node>>) {
    for element in elements {
        match element {
            Element::Node(node) => {
                let seen = out
                    .iter()
                    .any(|n| std::ptr::addr_eq(Arc::as_ptr(n), Arc::as_ptr(node)));
                if !seen {
                    out.push(Arc::clone(node));
                }
            }
            Element::Branch(branch) => collect_nodes(&branch.elements, out),
            Element::Sink(_) => {}
        }
    }
}

fn describe_into(elements: &[Element], depth: usize, out: &mut String) {
    let pad = "  ".repeat(depth);
    for element in elements {
        match element {
            Element::Node(node) => {
                let _ = writeln!(out, "{pad}{}", node.name());
            }
            Element::Sink(sink) => {
                let _ = writeln!(out, "{pad}sink({})", sink.name());
            }
            Element::Branch(branch) => {
                let _ = writeln!(out, "{pad}[branch]");
                describe_into(&branch.elements, depth + 1, out);
            }
        }
    }
}

/// Builder for [`Pipeline`].
#[derive(Default)]
pub struct PipelineBuilder {
    name: Option<String>,
    elements: Vec<Element>,
}

impl PipelineBuilder {
    /// Name the pipeline.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Append a node owned by this pipeline.
    pub fn node<N: Node + 'static>(self, node: N) -> Self {
        self.node_arc(Arc::new(node))
    }

    /// Append a node that is shared with other places (e.g. an annex used by
    /// several branches).
    pub fn node_arc(mut self, node: Arc<dyn Node>) -> Self {
        self.elements.push(Element::Node(node));
        self
    }

    /// Append a sub-pipeline branch.
    pub fn branch(mut self, branch: Pipeline) -> Self {
        self.elements.push(Element::Branch(branch));
        self
    }

    /// Append a sink.
    pub fn sink(mut self, sink: &Arc<Sink>) -> Self {
        self.elements.push(Element::Sink(Arc::clone(sink)));
        self
    }

    /// Append an already constructed element.
    pub fn element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            name: self.name,
            elements: self.elements.into(),
        }
    }
}
