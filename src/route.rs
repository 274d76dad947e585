use crate::street_graph::EdgeId;

/// Matched path of one track.
///
/// `edges` follows the order of the samples. `fillers` bridge gaps between
/// them but carry no position in that order: treat them as a set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Route {
    pub edges: Vec<EdgeId>,
    pub fillers: Vec<EdgeId>,
}

impl Route {
    pub fn new(edges: Vec<EdgeId>, fillers: Vec<EdgeId>) -> Self {
        Self { edges, fillers }
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Matched edges followed by filler edges.
    pub fn all_edges(&self) -> impl Iterator<Item = &EdgeId> {
        self.edges.iter().chain(&self.fillers)
    }
}
