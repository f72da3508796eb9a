//! Arena holding every node of a run, addressed by index

use crate::core::config::ExecutionMode;
use crate::core::errors::{EngineError, Result};
use crate::extension::{RegisteredExtension, TemplateInvocationContext};
use crate::lock::ExclusiveResource;
use crate::tree::node::{
    ExtensionTypeRegistration, LateInitDeclaration, NodeBehavior, NodeSpec, NodeType, NoopBehavior,
};
use crate::tree::orderer::ChildOrderer;
use crate::tree::unique_id::{rewrite, UniqueId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Declared children of a template, waiting to be expanded
#[derive(Debug, Clone, Default)]
pub struct TemplateState {
    prototypes: Vec<NodeId>,
    prototypes_by_index: BTreeMap<usize, Vec<NodeId>>,
    allowed_indices: Option<BTreeSet<usize>>,
}

impl TemplateState {
    /// Un-expanded prototypes or cached subtrees remain
    pub fn may_register_tests(&self) -> bool {
        !self.prototypes.is_empty() || !self.prototypes_by_index.is_empty()
    }

    pub fn is_index_allowed(&self, index: usize) -> bool {
        self.allowed_indices
            .as_ref()
            .map_or(true, |allowed| allowed.contains(&index))
    }

    pub fn prototypes(&self) -> &[NodeId] {
        &self.prototypes
    }

    pub fn cached_indices(&self) -> Vec<usize> {
        self.prototypes_by_index.keys().copied().collect()
    }
}

/// Payload of an invocation node
#[derive(Clone)]
pub struct InvocationState {
    pub index: usize,
    pub context: Option<Arc<dyn TemplateInvocationContext>>,
}

impl fmt::Debug for InvocationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationState")
            .field("index", &self.index)
            .field("has_context", &self.context.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Engine,
    Class,
    NestedClass,
    Test,
    Template(TemplateState),
    Invocation(InvocationState),
}

impl NodeKind {
    fn for_type(node_type: NodeType, index: Option<usize>) -> Self {
        match node_type {
            NodeType::Engine => Self::Engine,
            NodeType::Class => Self::Class,
            NodeType::NestedClass => Self::NestedClass,
            NodeType::Test => Self::Test,
            NodeType::Template => Self::Template(TemplateState::default()),
            NodeType::Invocation => Self::Invocation(InvocationState {
                index: index.unwrap_or_default(),
                context: None,
            }),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self {
            Self::Engine => NodeType::Engine,
            Self::Class => NodeType::Class,
            Self::NestedClass => NodeType::NestedClass,
            Self::Test => NodeType::Test,
            Self::Template(_) => NodeType::Template,
            Self::Invocation(_) => NodeType::Invocation,
        }
    }
}

/// One node of the plan
#[derive(Clone)]
pub struct NodeEntry {
    unique_id: UniqueId,
    display_name: String,
    kind: NodeKind,
    behavior: Arc<dyn NodeBehavior>,
    resources: Vec<ExclusiveResource>,
    execution_mode: Option<ExecutionMode>,
    orderer: Option<ChildOrderer>,
    extensions: Vec<RegisteredExtension>,
    extension_types: Vec<ExtensionTypeRegistration>,
    late_init: Vec<LateInitDeclaration>,
    tags: BTreeSet<String>,
    order: Option<i32>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    pruned: bool,
}

impl NodeEntry {
    pub fn unique_id(&self) -> &UniqueId {
        &self.unique_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn node_type(&self) -> NodeType {
        self.kind.node_type()
    }

    pub fn behavior(&self) -> &Arc<dyn NodeBehavior> {
        &self.behavior
    }

    /// Resources declared by this node alone
    pub fn resources(&self) -> &[ExclusiveResource] {
        &self.resources
    }

    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.execution_mode
    }

    pub fn orderer(&self) -> Option<ChildOrderer> {
        self.orderer
    }

    pub fn extensions(&self) -> &[RegisteredExtension] {
        &self.extensions
    }

    pub(crate) fn extension_types(&self) -> &[ExtensionTypeRegistration] {
        &self.extension_types
    }

    pub(crate) fn late_init(&self) -> &[LateInitDeclaration] {
        &self.late_init
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn order(&self) -> Option<i32> {
        self.order
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_pruned(&self) -> bool {
        self.pruned
    }

    pub fn template_state(&self) -> Option<&TemplateState> {
        match &self.kind {
            NodeKind::Template(state) => Some(state),
            _ => None,
        }
    }

    pub fn invocation(&self) -> Option<&InvocationState> {
        match &self.kind {
            NodeKind::Invocation(state) => Some(state),
            _ => None,
        }
    }
}

impl fmt::Debug for NodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeEntry")
            .field("unique_id", &self.unique_id.to_string())
            .field("display_name", &self.display_name)
            .field("kind", &self.kind)
            .field("resources", &self.resources)
            .field("children", &self.children)
            .field("pruned", &self.pruned)
            .finish()
    }
}

/// Filter applied to test-like leaves while the plan is built
pub type NodeFilter<'a> = &'a dyn Fn(&NodeEntry) -> bool;

struct Builder<'a> {
    nodes: &'a mut Vec<NodeEntry>,
    filter: NodeFilter<'a>,
    /// Static discovery prunes empty containers; dynamic registration never does
    prune: bool,
}

impl<'a> Builder<'a> {
    /// Insert `spec` and its subtree; `None` when filtering removed it
    fn insert(&mut self, spec: NodeSpec, unique_id: UniqueId, parent: Option<NodeId>) -> Result<Option<NodeId>> {
        let index = match spec.node_type {
            NodeType::Invocation => Some(parse_invocation_index(&spec.segment_value)?),
            _ => None,
        };
        let NodeSpec {
            node_type,
            display_name,
            behavior,
            resources,
            execution_mode,
            orderer,
            extensions,
            extension_types,
            late_init,
            tags,
            order,
            children,
            ..
        } = spec;

        let id = NodeId(self.nodes.len());
        self.nodes.push(NodeEntry {
            unique_id: unique_id.clone(),
            display_name,
            kind: NodeKind::for_type(node_type, index),
            behavior,
            resources,
            execution_mode,
            orderer,
            extensions,
            extension_types,
            late_init,
            tags,
            order,
            parent,
            children: Vec::new(),
            pruned: false,
        });

        let declared_children = !children.is_empty();
        let mut seen = HashSet::new();
        for child in children {
            if child.node_type == NodeType::Engine {
                return Err(EngineError::configuration(format!(
                    "engine node cannot be nested below {}",
                    unique_id
                )));
            }
            if child.node_type == NodeType::Invocation && node_type != NodeType::Template {
                return Err(EngineError::configuration(format!(
                    "invocation {} must be declared below a template, not below {}",
                    child.segment_value, unique_id
                )));
            }
            let child_id = unique_id.append(child.node_type.segment_type(), child.segment_value.clone());
            if !seen.insert(child_id.clone()) {
                return Err(EngineError::configuration(format!("duplicate unique id {}", child_id)));
            }
            if let Some(inserted) = self.insert(child, child_id, Some(id))? {
                self.attach(id, inserted);
            }
        }

        let keep = match node_type {
            NodeType::Engine => true,
            _ if !self.prune => true,
            NodeType::Test => (self.filter)(&self.nodes[id.0]),
            NodeType::Class | NodeType::NestedClass => !self.nodes[id.0].children.is_empty(),
            NodeType::Template => {
                let may_register = self.nodes[id.0]
                    .template_state()
                    .map_or(false, TemplateState::may_register_tests);
                if declared_children {
                    may_register
                } else {
                    (self.filter)(&self.nodes[id.0])
                }
            }
            NodeType::Invocation => {
                if declared_children {
                    !self.nodes[id.0].children.is_empty()
                } else {
                    (self.filter)(&self.nodes[id.0])
                }
            }
        };

        if let NodeKind::Template(state) = &mut self.nodes[id.0].kind {
            if state.prototypes.is_empty() && !state.prototypes_by_index.is_empty() {
                state.allowed_indices = Some(state.prototypes_by_index.keys().copied().collect());
            }
        }

        if keep {
            Ok(Some(id))
        } else {
            debug!("Pruning {}", unique_id);
            mark_pruned(self.nodes, id);
            Ok(None)
        }
    }

    fn attach(&mut self, parent: NodeId, child: NodeId) {
        let cached_index = self.nodes[child.0].invocation().map(|invocation| invocation.index);
        if cached_index.is_some() {
            // Its children are adopted by the invocation created at execution time
            self.nodes[child.0].pruned = true;
        }
        let cached_children = self.nodes[child.0].children.clone();
        let parent_entry = &mut self.nodes[parent.0];
        match (&mut parent_entry.kind, cached_index) {
            (NodeKind::Template(state), Some(index)) => {
                state.prototypes_by_index.insert(index, cached_children);
            }
            (NodeKind::Template(state), None) => state.prototypes.push(child),
            _ => parent_entry.children.push(child),
        }
    }
}

fn parse_invocation_index(segment_value: &str) -> Result<usize> {
    segment_value
        .strip_prefix('#')
        .and_then(|index| index.parse::<usize>().ok())
        .filter(|index| *index > 0)
        .ok_or_else(|| EngineError::configuration(format!("invalid invocation segment '{}'", segment_value)))
}

fn mark_pruned(nodes: &mut [NodeEntry], id: NodeId) {
    let mut pending = vec![id];
    while let Some(current) = pending.pop() {
        let entry = &mut nodes[current.0];
        entry.pruned = true;
        pending.extend(entry.children.iter().copied());
        if let NodeKind::Template(state) = &entry.kind {
            pending.extend(state.prototypes.iter().copied());
            pending.extend(state.prototypes_by_index.values().flatten().copied());
        }
    }
}

/// Every node of one run.
///
/// Built once by discovery and grown during execution by template expansion
/// and dynamic registration. Nodes are never removed; pruned nodes are flagged.
pub struct TestPlan {
    nodes: RwLock<Vec<NodeEntry>>,
    root: NodeId,
}

impl TestPlan {
    /// Plan running every declared node
    pub fn new(root: NodeSpec) -> Result<Arc<Self>> {
        Self::discover(root, |_| true)
    }

    /// Build the plan from a root spec, keeping only test leaves accepted by `filter`.
    ///
    /// Containers left without tests are pruned unless they may still register tests.
    pub fn discover<F>(root: NodeSpec, filter: F) -> Result<Arc<Self>>
    where
        F: Fn(&NodeEntry) -> bool,
    {
        if root.node_type != NodeType::Engine {
            return Err(EngineError::configuration(format!(
                "plan root must be an engine node, got {}",
                root.node_type
            )));
        }
        let unique_id = UniqueId::for_engine(root.segment_value.clone());
        let mut nodes = Vec::new();
        let root_id = {
            let mut builder = Builder {
                nodes: &mut nodes,
                filter: &filter,
                prune: true,
            };
            builder
                .insert(root, unique_id, None)?
                .ok_or_else(|| EngineError::internal("engine node was pruned"))?
        };
        debug!("Discovered {} node(s)", nodes.iter().filter(|n| !n.pruned).count());
        Ok(Arc::new(Self {
            nodes: RwLock::new(nodes),
            root: root_id,
        }))
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Snapshot of a node
    pub fn entry(&self, id: NodeId) -> Result<NodeEntry> {
        self.nodes
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| EngineError::internal(format!("unknown node {:?}", id)))
    }

    pub fn unique_id(&self, id: NodeId) -> Result<UniqueId> {
        self.nodes
            .read()
            .get(id.0)
            .map(|entry| entry.unique_id.clone())
            .ok_or_else(|| EngineError::internal(format!("unknown node {:?}", id)))
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.nodes
            .read()
            .get(id.0)
            .map(|entry| entry.children.clone())
            .unwrap_or_default()
    }

    /// Live node with the given id
    pub fn find(&self, unique_id: &UniqueId) -> Option<NodeId> {
        self.nodes
            .read()
            .iter()
            .position(|entry| !entry.pruned && &entry.unique_id == unique_id)
            .map(NodeId)
    }

    /// Unique ids of every live node reachable from the root, depth first
    pub fn unique_ids(&self) -> Vec<UniqueId> {
        let nodes = self.nodes.read();
        let mut ids = Vec::new();
        let mut pending = vec![self.root];
        while let Some(current) = pending.pop() {
            let entry = &nodes[current.0];
            ids.push(entry.unique_id.clone());
            pending.extend(entry.children.iter().rev().copied());
        }
        ids
    }

    /// Resources of a node and of everything below it, prototypes included
    pub fn subtree_resources(&self, id: NodeId) -> Vec<ExclusiveResource> {
        let nodes = self.nodes.read();
        let mut resources = Vec::new();
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            let entry = &nodes[current.0];
            resources.extend(entry.resources.iter().cloned());
            pending.extend(entry.children.iter().copied());
            if let NodeKind::Template(state) = &entry.kind {
                pending.extend(state.prototypes.iter().copied());
                pending.extend(state.prototypes_by_index.values().flatten().copied());
            }
        }
        resources
    }

    /// Add a child declared while its parent executes
    pub(crate) fn add_dynamic_child(&self, parent: NodeId, spec: NodeSpec) -> Result<NodeId> {
        if matches!(spec.node_type, NodeType::Engine | NodeType::Invocation) {
            return Err(EngineError::configuration(format!(
                "{} nodes cannot be registered dynamically",
                spec.node_type
            )));
        }
        let mut nodes = self.nodes.write();
        let parent_entry = nodes
            .get(parent.0)
            .ok_or_else(|| EngineError::internal(format!("unknown node {:?}", parent)))?;
        let unique_id = parent_entry
            .unique_id
            .append(spec.node_type.segment_type(), spec.segment_value.clone());
        if parent_entry
            .children
            .iter()
            .any(|child| nodes[child.0].unique_id == unique_id)
        {
            return Err(EngineError::configuration(format!("duplicate unique id {}", unique_id)));
        }

        let accept_all = |_: &NodeEntry| true;
        let mut builder = Builder {
            nodes: &mut nodes,
            filter: &accept_all,
            prune: false,
        };
        let id = builder
            .insert(spec, unique_id, Some(parent))?
            .ok_or_else(|| EngineError::internal("dynamic node was pruned"))?;
        nodes[parent.0].children.push(id);
        Ok(id)
    }

    /// Create the invocation node for `index` below `template`, with its children.
    ///
    /// Uses the cached subtree for that index when discovery left one, otherwise
    /// deep-copies the prototypes with their ids rewritten. The node is not yet
    /// attached to the template.
    pub(crate) fn materialize_invocation(
        &self,
        template: NodeId,
        index: usize,
        display_name: String,
        context: Arc<dyn TemplateInvocationContext>,
    ) -> Result<NodeId> {
        let mut nodes = self.nodes.write();
        let template_entry = nodes
            .get(template.0)
            .ok_or_else(|| EngineError::internal(format!("unknown node {:?}", template)))?;
        let template_uid = template_entry.unique_id.clone();
        let invocation_uid = template_uid.append(NodeType::Invocation.segment_type(), format!("#{}", index));

        let id = NodeId(nodes.len());
        nodes.push(NodeEntry {
            unique_id: invocation_uid.clone(),
            display_name,
            kind: NodeKind::Invocation(InvocationState {
                index,
                context: Some(context),
            }),
            behavior: Arc::new(NoopBehavior),
            resources: Vec::new(),
            execution_mode: None,
            orderer: None,
            extensions: Vec::new(),
            extension_types: Vec::new(),
            late_init: Vec::new(),
            tags: BTreeSet::new(),
            order: None,
            parent: Some(template),
            children: Vec::new(),
            pruned: false,
        });

        let (cached, prototypes) = match &mut nodes[template.0].kind {
            NodeKind::Template(state) => (state.prototypes_by_index.remove(&index), state.prototypes.clone()),
            _ => {
                return Err(EngineError::internal(format!("{} is not a template", template_uid)));
            }
        };

        let children = match cached {
            Some(cached) => {
                for child in &cached {
                    nodes[child.0].parent = Some(id);
                }
                cached
            }
            None => prototypes
                .iter()
                .map(|prototype| copy_subtree(&mut nodes, *prototype, &template_uid, &invocation_uid, id))
                .collect(),
        };
        nodes[id.0].children = children;
        Ok(id)
    }

    pub(crate) fn attach_child(&self, parent: NodeId, child: NodeId) {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.get_mut(parent.0) {
            entry.children.push(child);
        }
    }

    /// Drop a template's prototypes once it has finished
    pub(crate) fn clear_template(&self, template: NodeId) {
        let mut nodes = self.nodes.write();
        if let Some(NodeKind::Template(state)) = nodes.get_mut(template.0).map(|entry| &mut entry.kind) {
            state.prototypes.clear();
            state.prototypes_by_index.clear();
            state.allowed_indices = None;
        }
    }

    /// Number of nodes in the arena, pruned ones included
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

impl fmt::Debug for TestPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestPlan")
            .field("root", &self.root)
            .field("nodes", &self.len())
            .finish()
    }
}

/// Deep copy of `source` and everything below it, with ids moved under the invocation
fn copy_subtree(
    nodes: &mut Vec<NodeEntry>,
    source: NodeId,
    template_prefix: &UniqueId,
    invocation_prefix: &UniqueId,
    new_parent: NodeId,
) -> NodeId {
    let mut copy = nodes[source.0].clone();
    copy.unique_id = rewrite(&copy.unique_id, template_prefix, invocation_prefix);
    copy.parent = Some(new_parent);
    copy.pruned = false;
    let children = std::mem::take(&mut copy.children);
    let nested_template = match &mut copy.kind {
        NodeKind::Template(state) => Some(std::mem::take(state)),
        _ => None,
    };

    let id = NodeId(nodes.len());
    nodes.push(copy);

    let copied_children: Vec<NodeId> = children
        .iter()
        .map(|child| copy_subtree(nodes, *child, template_prefix, invocation_prefix, id))
        .collect();
    nodes[id.0].children = copied_children;

    if let Some(state) = nested_template {
        let prototypes = state
            .prototypes
            .iter()
            .map(|child| copy_subtree(nodes, *child, template_prefix, invocation_prefix, id))
            .collect();
        let prototypes_by_index = state
            .prototypes_by_index
            .iter()
            .map(|(index, cached)| {
                let copies: Vec<NodeId> = cached
                    .iter()
                    .map(|child| copy_subtree(nodes, *child, template_prefix, invocation_prefix, id))
                    .collect();
                (*index, copies)
            })
            .collect();
        nodes[id.0].kind = NodeKind::Template(TemplateState {
            prototypes,
            prototypes_by_index,
            allowed_indices: state.allowed_indices,
        });
    }
    id
}
