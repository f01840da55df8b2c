//! Shadow root discovery.
//!
//! Closed shadow roots are invisible to tree queries, so roots are captured
//! at attach time. The registry only holds weak references.

use std::cell::RefCell;

use crate::dom::{Element, WeakElement};

/// Source of shadow roots the reconciler should scan.
pub trait ShadowRootSource {
    /// Every live shadow root known to the source.
    fn all_roots(&self) -> Vec<Element>;

    /// The shadow root attached to `host`, if known.
    fn shadow_root(&self, host: &Element) -> Option<Element>;
}

/// Records every shadow root attached through it.
#[derive(Debug, Default)]
pub struct ShadowRegistry {
    roots: RefCell<Vec<WeakElement>>,
}

impl ShadowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a shadow root to `host` and remember it.
    pub fn attach(&self, host: &Element) -> Element {
        let root = host.attach_shadow();
        self.roots.borrow_mut().push(root.downgrade());
        root
    }

    /// Forget roots that have been dropped.
    pub fn prune(&self) -> usize {
        let mut roots = self.roots.borrow_mut();
        let before = roots.len();
        roots.retain(|root| root.upgrade().is_some());
        before - roots.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.borrow().is_empty()
    }
}

impl ShadowRootSource for ShadowRegistry {
    fn all_roots(&self) -> Vec<Element> {
        self.prune();
        self.roots
            .borrow()
            .iter()
            .filter_map(WeakElement::upgrade)
            .collect()
    }

    fn shadow_root(&self, host: &Element) -> Option<Element> {
        self.all_roots()
            .into_iter()
            .find(|root| root.host().as_ref() == Some(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_attached_roots() {
        let registry = ShadowRegistry::new();
        let host = Element::new("ytd-comment-renderer");
        let root = registry.attach(&host);

        assert_eq!(registry.all_roots(), vec![root.clone()]);
        assert_eq!(registry.shadow_root(&host), Some(root));
        assert!(registry.shadow_root(&Element::new("div")).is_none());
    }

    #[test]
    fn dropped_roots_are_pruned() {
        let registry = ShadowRegistry::new();
        let host = Element::new("div");
        let _ = registry.attach(&host);
        assert_eq!(registry.len(), 1);

        drop(host);
        assert!(registry.all_roots().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn reattaching_replaces_old_root() {
        let registry = ShadowRegistry::new();
        let host = Element::new("div");
        let first = registry.attach(&host);
        let second = registry.attach(&host);
        drop(first);

        assert_eq!(registry.shadow_root(&host), Some(second));
    }
}
