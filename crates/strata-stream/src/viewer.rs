//! External observers of the volume and their registry.

use glam::Vec3;
use rustc_hash::FxHashMap;

/// Opaque identifier for an observer. Stable for the observer's lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(u64);

#[cfg(test)]
impl ViewerId {
    /// Construct an arbitrary id for tests that bypass the registry.
    pub(crate) fn mock(raw: u64) -> Self {
        Self(raw)
    }
}

/// An observer of the volume: a camera, a player, or a server-side entity
/// that needs collisions around itself.
#[derive(Clone, Copy, Debug)]
pub struct Viewer {
    pub world_position: Vec3,
    /// Requested view distance in world units, before the volume cap.
    pub view_distance: f32,
    pub requires_visuals: bool,
    pub requires_collisions: bool,
}

/// Tracks live viewers. External code adds and removes them; the streaming
/// planner pairs them lazily on its next tick.
#[derive(Debug, Default)]
pub struct ViewerRegistry {
    next_id: u64,
    viewers: FxHashMap<ViewerId, Viewer>,
    /// Insertion order, so ticks see viewers in a stable order.
    order: Vec<ViewerId>,
}

impl ViewerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, viewer: Viewer) -> ViewerId {
        let id = ViewerId(self.next_id);
        self.next_id += 1;
        self.viewers.insert(id, viewer);
        self.order.push(id);
        id
    }

    /// Remove a viewer. Returns `false` if the id was unknown.
    pub fn remove(&mut self, id: ViewerId) -> bool {
        if self.viewers.remove(&id).is_some() {
            self.order.retain(|v| *v != id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, id: ViewerId) -> Option<&Viewer> {
        self.viewers.get(&id)
    }

    pub fn get_mut(&mut self, id: ViewerId) -> Option<&mut Viewer> {
        self.viewers.get_mut(&id)
    }

    pub fn contains(&self, id: ViewerId) -> bool {
        self.viewers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Viewers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (ViewerId, &Viewer)> {
        self.order.iter().filter_map(|id| self.viewers.get(id).map(|v| (*id, v)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viewer_at(x: f32) -> Viewer {
        Viewer {
            world_position: Vec3::new(x, 0.0, 0.0),
            view_distance: 128.0,
            requires_visuals: true,
            requires_collisions: false,
        }
    }

    #[test]
    fn test_add_assigns_unique_ids() {
        let mut reg = ViewerRegistry::new();
        let a = reg.add(viewer_at(0.0));
        let b = reg.add(viewer_at(1.0));
        assert_ne!(a, b);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let mut reg = ViewerRegistry::new();
        let a = reg.add(viewer_at(0.0));
        assert!(reg.remove(a));
        assert!(!reg.remove(a));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_iter_preserves_insertion_order() {
        let mut reg = ViewerRegistry::new();
        let a = reg.add(viewer_at(0.0));
        let b = reg.add(viewer_at(1.0));
        let c = reg.add(viewer_at(2.0));
        reg.remove(b);
        let ids: Vec<ViewerId> = reg.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);
    }

    #[test]
    fn test_ids_are_not_reused_after_removal() {
        let mut reg = ViewerRegistry::new();
        let a = reg.add(viewer_at(0.0));
        reg.remove(a);
        let b = reg.add(viewer_at(1.0));
        assert_ne!(a, b);
    }
}
