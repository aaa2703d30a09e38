//! The component tree of one deployment.
//!
//! A [`Stack`] owns every component in an arena indexed by construction
//! order. Parents hold typed `Arc`s to the children they add; the arena only
//! records paths, so there are no back pointers to keep alive.

use std::sync::Arc;

use tracing::debug;

use crate::component::{Component, ComponentPath, Node};
use crate::config::KilnConfig;
use crate::error::{KilnError, KilnResult};
use crate::state::{JsonFileBackend, StateStore};

struct Slot {
    path: ComponentPath,
    parent: Option<usize>,
    component: Option<Arc<dyn Component>>,
}

/// A tree of components sharing one state store.
pub struct Stack {
    name: String,
    store: StateStore,
    slots: Vec<Slot>,
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("name", &self.name)
            .field("components", &self.paths())
            .finish()
    }
}

impl Stack {
    pub fn new(name: impl Into<String>, store: StateStore) -> Self {
        Self {
            name: name.into(),
            store,
            slots: Vec::new(),
        }
    }

    /// A stack backed by the state file named in `config`.
    pub fn from_config(name: impl Into<String>, config: &KilnConfig) -> KilnResult<Self> {
        let store = StateStore::open(JsonFileBackend::new(&config.state_file))?;
        Ok(Self::new(name, store))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Construct a top-level component.
    ///
    /// `make` receives the component's [`Node`] and returns the component;
    /// its [`Component::build`] runs right after, before `add` returns.
    pub fn add<C, F>(&mut self, name: &str, make: F) -> KilnResult<Arc<C>>
    where
        C: Component,
        F: FnOnce(Node) -> KilnResult<C>,
    {
        self.attach(None, name, make)
    }

    fn attach<C, F>(&mut self, parent: Option<usize>, name: &str, make: F) -> KilnResult<Arc<C>>
    where
        C: Component,
        F: FnOnce(Node) -> KilnResult<C>,
    {
        let parent_path = match parent {
            Some(index) => self.slots[index].path.clone(),
            None => ComponentPath::root(),
        };

        if name.is_empty() || name.contains('/') {
            return Err(KilnError::configuration(format!(
                "invalid component name `{}` under `{}`",
                name, parent_path
            )));
        }

        let path = parent_path.child(name);
        if self.slots.iter().any(|slot| slot.path == path) {
            return Err(KilnError::configuration(format!(
                "duplicate component name `{}`",
                path
            )));
        }

        // The slot is reserved before the component is built so its children
        // come after it in construction order.
        let seq = self.slots.len();
        self.slots.push(Slot {
            path: path.clone(),
            parent,
            component: None,
        });

        match self.construct(seq, path.clone(), make) {
            Ok(component) => {
                debug!("Added component {} (#{})", path, seq);
                self.slots[seq].component = Some(component.clone() as Arc<dyn Component>);
                Ok(component)
            }
            Err(err) => {
                self.slots.truncate(seq);
                Err(err)
            }
        }
    }

    fn construct<C, F>(&mut self, seq: usize, path: ComponentPath, make: F) -> KilnResult<Arc<C>>
    where
        C: Component,
        F: FnOnce(Node) -> KilnResult<C>,
    {
        let node = Node::new(path.clone(), seq, self.store.scoped(path));
        let mut component = make(node)?;
        let mut ctx = BuildContext { stack: self, seq };
        component.build(&mut ctx)?;
        Ok(Arc::new(component))
    }

    /// Every component of the stack.
    pub fn root(&self) -> Subtree<'_> {
        Subtree {
            stack: self,
            path: ComponentPath::root(),
        }
    }

    /// The component at `path` and everything below it.
    pub fn subtree(&self, path: &ComponentPath) -> KilnResult<Subtree<'_>> {
        if !path.is_root() && !self.slots.iter().any(|slot| &slot.path == path) {
            return Err(KilnError::configuration(format!(
                "no component at `{}` in stack `{}`",
                path, self.name
            )));
        }
        Ok(Subtree {
            stack: self,
            path: path.clone(),
        })
    }

    pub fn get(&self, path: &ComponentPath) -> Option<Arc<dyn Component>> {
        self.slots
            .iter()
            .find(|slot| &slot.path == path)
            .and_then(|slot| slot.component.clone())
    }

    /// Path of the parent that added the component at `path`.
    pub fn parent_of(&self, path: &ComponentPath) -> Option<&ComponentPath> {
        let slot = self.slots.iter().find(|slot| &slot.path == path)?;
        slot.parent.map(|index| &self.slots[index].path)
    }

    /// Component paths in construction order.
    pub fn paths(&self) -> Vec<&ComponentPath> {
        self.slots.iter().map(|slot| &slot.path).collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Handle a component receives while it wires itself up.
pub struct BuildContext<'a> {
    stack: &'a mut Stack,
    seq: usize,
}

impl BuildContext<'_> {
    /// Path of the component being built.
    pub fn path(&self) -> &ComponentPath {
        &self.stack.slots[self.seq].path
    }

    /// Construct a child component.
    pub fn add<C, F>(&mut self, name: &str, make: F) -> KilnResult<Arc<C>>
    where
        C: Component,
        F: FnOnce(Node) -> KilnResult<C>,
    {
        self.stack.attach(Some(self.seq), name, make)
    }
}

/// A component and its descendants.
pub struct Subtree<'a> {
    stack: &'a Stack,
    path: ComponentPath,
}

impl<'a> Subtree<'a> {
    pub fn path(&self) -> &ComponentPath {
        &self.path
    }

    pub fn stack(&self) -> &'a Stack {
        self.stack
    }

    pub fn store(&self) -> &'a StateStore {
        &self.stack.store
    }

    /// Components in construction order.
    pub fn components(&self) -> Vec<Arc<dyn Component>> {
        self.stack
            .slots
            .iter()
            .filter(|slot| slot.path.starts_with(&self.path))
            .filter_map(|slot| slot.component.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props::{PropSchema, Props};

    #[derive(Debug)]
    struct Leaf {
        node: Node,
    }

    impl Component for Leaf {
        fn node(&self) -> &Node {
            &self.node
        }
    }

    struct Group {
        node: Node,
        children: Vec<Arc<Leaf>>,
    }

    impl Component for Group {
        fn node(&self) -> &Node {
            &self.node
        }

        fn build(&mut self, ctx: &mut BuildContext<'_>) -> KilnResult<()> {
            for name in ["first", "second"] {
                self.children.push(ctx.add(name, |node| Ok(Leaf { node }))?);
            }
            Ok(())
        }
    }

    fn group(node: Node) -> KilnResult<Group> {
        Ok(Group {
            node,
            children: Vec::new(),
        })
    }

    fn names(stack: &Stack) -> Vec<String> {
        stack.paths().iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_construction_order_is_pre_order() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        stack.add("a", |node| Ok(Leaf { node })).unwrap();
        let g = stack.add("g", group).unwrap();
        stack.add("z", |node| Ok(Leaf { node })).unwrap();

        assert_eq!(names(&stack), vec!["a", "g", "g/first", "g/second", "z"]);
        assert_eq!(g.children[1].node().seq(), 3);
        assert_eq!(g.node().seq(), 1);
        assert_eq!(
            stack.parent_of(&ComponentPath::parse("g/first")),
            Some(&ComponentPath::parse("g"))
        );
    }

    #[test]
    fn test_kind_is_short_type_name() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        let leaf = stack.add("a", |node| Ok(Leaf { node })).unwrap();
        assert_eq!(leaf.kind(), "Leaf");
    }

    #[test]
    fn test_duplicate_and_invalid_names() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        stack.add("a", |node| Ok(Leaf { node })).unwrap();

        for bad in ["a", "", "x/y"] {
            let err = stack.add(bad, |node| Ok(Leaf { node })).unwrap_err();
            assert!(matches!(err, KilnError::Configuration(_)), "{bad}");
        }
        assert_eq!(stack.len(), 1);
    }

    #[test]
    fn test_failed_construction_leaves_no_slots() {
        #[derive(Debug)]
        struct Broken {
            node: Node,
        }

        impl Component for Broken {
            fn node(&self) -> &Node {
                &self.node
            }

            fn build(&mut self, ctx: &mut BuildContext<'_>) -> KilnResult<()> {
                ctx.add("ok", |node| Ok(Leaf { node }))?;
                Err(KilnError::configuration("broken wiring"))
            }
        }

        let mut stack = Stack::new("test", StateStore::in_memory());
        assert!(stack.add("broken", |node| Ok(Broken { node })).is_err());
        assert!(stack.is_empty());

        stack.add("broken", |node| Ok(Broken { node })).unwrap_err();
        stack.add("after", |node| Ok(Leaf { node })).unwrap();
        assert_eq!(names(&stack), vec!["after"]);
    }

    #[test]
    fn test_subtree_selection() {
        let mut stack = Stack::new("test", StateStore::in_memory());
        stack.add("a", |node| Ok(Leaf { node })).unwrap();
        stack.add("g", group).unwrap();

        let sub = stack.subtree(&ComponentPath::parse("g")).unwrap();
        let paths: Vec<String> = sub
            .components()
            .iter()
            .map(|c| c.node().path().to_string())
            .collect();
        assert_eq!(paths, vec!["g", "g/first", "g/second"]);

        assert_eq!(stack.root().components().len(), 4);
        assert!(stack.subtree(&ComponentPath::parse("missing")).is_err());
    }

    #[test]
    fn test_bind_rejects_props_error_with_path() {
        struct Empty;

        impl Props for Empty {
            fn schema() -> PropSchema {
                PropSchema::new("Empty")
            }

            fn validate(&self) -> KilnResult<()> {
                Err(KilnError::configuration("nothing to bind"))
            }
        }

        let mut stack = Stack::new("test", StateStore::in_memory());
        let err = stack
            .add("leaf", |node| {
                node.bind(Empty)?;
                Ok(Leaf { node })
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: leaf: nothing to bind");
    }
}
