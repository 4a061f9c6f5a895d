//! Context-menu entries registered by extensions.

use soundtime_ext_core::{ContextMenuItem, ContextMenuType};

/// All registered menu trees, in registration order.
#[derive(Debug, Default)]
pub struct ContextMenuStore {
    items: Vec<ContextMenuItem>,
}

impl ContextMenuStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a batch of menu trees for `package_name`.
    ///
    /// Every entry and descendant gets a fresh process-unique id and is
    /// tagged with the owner; whatever the extension supplied for those
    /// fields is overwritten. Returns the ids of the top-level entries.
    pub fn register(&mut self, package_name: &str, items: Vec<ContextMenuItem>) -> Vec<String> {
        let mut ids = Vec::with_capacity(items.len());
        for mut item in items {
            assign(&mut item, package_name);
            ids.push(item.id.clone());
            self.items.push(item);
        }
        ids
    }

    /// Remove one top-level entry. Returns whether it existed.
    pub fn remove(&mut self, package_name: &str, id: &str) -> bool {
        let before = self.items.len();
        self.items
            .retain(|item| !(item.package_name == package_name && item.id == id));
        self.items.len() != before
    }

    /// Remove everything an extension registered.
    pub fn remove_all(&mut self, package_name: &str) {
        self.items.retain(|item| item.package_name != package_name);
    }

    /// Entries of one menu type across all extensions accepted by
    /// `owner_ok`, flattened in pre-order.
    ///
    /// Every depth is matched on its own, so a matching child of a
    /// non-matching parent is returned. Returned entries carry no children.
    pub fn query<F>(&self, menu_type: ContextMenuType, owner_ok: F) -> Vec<ContextMenuItem>
    where
        F: Fn(&str) -> bool,
    {
        let mut out = Vec::new();
        for item in self.items.iter().filter(|item| owner_ok(&item.package_name)) {
            flatten(item, menu_type, &mut out);
        }
        out
    }

    /// Whether `(id, package_name)` names a registered entry at any depth.
    pub fn contains(&self, id: &str, package_name: &str) -> bool {
        self.items
            .iter()
            .filter(|item| item.package_name == package_name)
            .any(|item| find(item, id))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn assign(item: &mut ContextMenuItem, package_name: &str) {
    item.id = uuid::Uuid::new_v4().to_string();
    item.package_name = package_name.to_string();
    for child in &mut item.children {
        assign(child, package_name);
    }
}

fn flatten(item: &ContextMenuItem, menu_type: ContextMenuType, out: &mut Vec<ContextMenuItem>) {
    if item.menu_type == menu_type {
        out.push(ContextMenuItem {
            children: Vec::new(),
            ..item.clone()
        });
    }
    for child in &item.children {
        flatten(child, menu_type, out);
    }
}

fn find(item: &ContextMenuItem, id: &str) -> bool {
    item.id == id || item.children.iter().any(|child| find(child, id))
}
