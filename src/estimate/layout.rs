use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Field, FieldKind, Shape};

/// Shell size and reference members of one [`Shape`], parents included.
#[derive(Debug)]
pub struct ClassLayout {
    /// Unaligned bytes occupied by the object itself.
    pub base_size: u64,
    /// Reference members in declaration order, parent members first.
    pub reference_fields: Vec<&'static Field>,
}

/// Memoized [`ClassLayout`]s keyed by shape identity.
///
/// Shapes are `static`, so entries never go stale; dropping the cache only
/// costs recomputation.
#[derive(Debug)]
pub struct LayoutCache {
    root_size: u64,
    pointer_size: u64,
    layouts: RwLock<FxHashMap<usize, Arc<ClassLayout>>>,
}

fn shape_key(shape: &'static Shape) -> usize {
    shape as *const Shape as usize
}

impl LayoutCache {
    /// Creates an empty cache; `root_size` is the shell of a parentless shape.
    pub fn new(root_size: u64, pointer_size: u64) -> Self {
        Self {
            root_size,
            pointer_size,
            layouts: RwLock::new(FxHashMap::default()),
        }
    }

    /// Returns the layout of `shape`, computing and caching it on first use.
    pub fn layout(&self, shape: &'static Shape) -> Arc<ClassLayout> {
        if let Some(found) = self.layouts.read().get(&shape_key(shape)) {
            return Arc::clone(found);
        }
        let computed = Arc::new(self.compute(shape));
        let mut layouts = self.layouts.write();
        Arc::clone(layouts.entry(shape_key(shape)).or_insert(computed))
    }

    /// Number of shapes currently cached.
    pub fn len(&self) -> usize {
        self.layouts.read().len()
    }

    /// Whether no layout has been computed yet.
    pub fn is_empty(&self) -> bool {
        self.layouts.read().is_empty()
    }

    /// Drops every cached layout.
    pub fn clear(&self) {
        self.layouts.write().clear();
    }

    fn compute(&self, shape: &'static Shape) -> ClassLayout {
        let (mut base_size, mut reference_fields) = match shape.parent {
            Some(parent) => {
                let parent = self.layout(parent);
                (parent.base_size, parent.reference_fields.clone())
            }
            None => (self.root_size, Vec::new()),
        };
        for field in shape.fields {
            match field.kind {
                FieldKind::Primitive(kind) => base_size += kind.width(),
                FieldKind::Reference => {
                    base_size += self.pointer_size;
                    reference_fields.push(field);
                }
            }
        }
        ClassLayout {
            base_size,
            reference_fields,
        }
    }
}
