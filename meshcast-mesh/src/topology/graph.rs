use indexmap::{IndexMap, IndexSet};
use meshcast_core::PeerId;

/// Directed overlay: upstream -> ordered set of downstreams
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverlayGraph {
    adjacency: IndexMap<PeerId, IndexSet<PeerId>>,
}

impl OverlayGraph {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure_node(&mut self, id: &PeerId) {
        if !self.adjacency.contains_key(id) {
            self.adjacency.insert(id.clone(), IndexSet::new());
        }
    }

    /// Returns `false` when the edge already existed
    pub fn add_edge(&mut self, upstream: &PeerId, downstream: &PeerId) -> bool {
        self.ensure_node(downstream);
        self.adjacency
            .entry(upstream.clone())
            .or_default()
            .insert(downstream.clone())
    }

    pub fn remove_edge(&mut self, upstream: &PeerId, downstream: &PeerId) -> bool {
        self.adjacency
            .get_mut(upstream)
            .is_some_and(|downstreams| downstreams.shift_remove(downstream))
    }

    /// Drop a peer as key and as value, returning its former downstreams
    pub fn remove_node(&mut self, id: &PeerId) -> Vec<PeerId> {
        let former = self
            .adjacency
            .shift_remove(id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for downstreams in self.adjacency.values_mut() {
            downstreams.shift_remove(id);
        }
        former
    }

    #[must_use]
    pub fn has_edge(&self, upstream: &PeerId, downstream: &PeerId) -> bool {
        self.adjacency
            .get(upstream)
            .is_some_and(|downstreams| downstreams.contains(downstream))
    }

    /// Whether `id` appears anywhere, as key or as value
    #[must_use]
    pub fn mentions(&self, id: &PeerId) -> bool {
        self.adjacency.contains_key(id) || self.adjacency.values().any(|set| set.contains(id))
    }

    #[must_use]
    pub fn downstreams(&self, id: &PeerId) -> Vec<PeerId> {
        self.adjacency
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn upstreams(&self, id: &PeerId) -> Vec<PeerId> {
        self.adjacency
            .iter()
            .filter(|(_, downstreams)| downstreams.contains(id))
            .map(|(upstream, _)| upstream.clone())
            .collect()
    }

    /// Whether adding `upstream -> downstream` would close a cycle
    #[must_use]
    pub fn would_create_cycle(&self, upstream: &PeerId, downstream: &PeerId) -> bool {
        if upstream == downstream {
            return true;
        }
        let mut visited = IndexSet::new();
        let mut stack = vec![downstream];
        while let Some(current) = stack.pop() {
            if current == upstream {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(next) = self.adjacency.get(current) {
                stack.extend(next.iter());
            }
        }
        false
    }

    pub fn edges(&self) -> impl Iterator<Item = (&PeerId, &PeerId)> {
        self.adjacency
            .iter()
            .flat_map(|(up, downs)| downs.iter().map(move |down| (up, down)))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PeerId> {
        self.adjacency.keys()
    }
}
