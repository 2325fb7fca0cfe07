//! Tag hierarchy with per-node aggregates
//!
//! Tags are registered during parsing as `{name, hash, parent_hash}` and
//! form a tree under an unnamed root. During aggregation every operation
//! lands beneath its tag node (untagged operations on the root); a cache
//! of the previously hit node short-circuits the lookup for runs of
//! equally tagged operations.

use crate::domain::MemoryOperation;

pub const TAG_ROOT: u32 = 0;

#[derive(Debug, Clone)]
pub struct TagNode {
    pub hash: u32,
    pub name: String,
    /// Parent node index; `u32::MAX` for the root.
    pub parent: u32,
    pub children: Vec<u32>,
    pub mem_usage: i64,
    pub mem_usage_peak: i64,
    pub op_count: u32,
}

#[derive(Debug)]
pub struct TagTree {
    nodes: Vec<TagNode>,
}

impl Default for TagTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TagTree {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![TagNode {
                hash: 0,
                name: String::new(),
                parent: u32::MAX,
                children: Vec::new(),
                mem_usage: 0,
                mem_usage_peak: 0,
                op_count: 0,
            }],
        }
    }

    /// Register a tag. Returns false on a duplicate hash. An unknown
    /// parent hash attaches the tag to the root.
    pub fn insert(&mut self, name: &str, hash: u32, parent_hash: u32) -> bool {
        if hash == 0 || self.find(hash).is_some() {
            return false;
        }

        let parent = self.find(parent_hash).unwrap_or(TAG_ROOT);
        let index = self.nodes.len() as u32;
        self.nodes.push(TagNode {
            hash,
            name: name.to_string(),
            parent,
            children: Vec::new(),
            mem_usage: 0,
            mem_usage_peak: 0,
            op_count: 0,
        });
        self.nodes[parent as usize].children.push(index);
        true
    }

    /// Node index registered for a hash. Hash 0 is the root.
    #[must_use]
    pub fn find(&self, hash: u32) -> Option<u32> {
        self.nodes.iter().position(|n| n.hash == hash).map(|i| i as u32)
    }

    #[must_use]
    pub fn node(&self, index: u32) -> &TagNode {
        &self.nodes[index as usize]
    }

    #[must_use]
    pub fn root(&self) -> &TagNode {
        &self.nodes[0]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    /// Same node structure with zeroed aggregates, the starting point for
    /// a filtered rebuild.
    #[must_use]
    pub fn clone_structure(&self) -> TagTree {
        let nodes = self
            .nodes
            .iter()
            .map(|n| TagNode {
                hash: n.hash,
                name: n.name.clone(),
                parent: n.parent,
                children: n.children.clone(),
                mem_usage: 0,
                mem_usage_peak: 0,
                op_count: 0,
            })
            .collect();
        TagTree { nodes }
    }

    /// Account one operation's net size delta beneath its tag node.
    /// `prev_node` caches the last node hit for localized search.
    pub fn add_operation(&mut self, op: &MemoryOperation, delta: i64, prev_node: &mut Option<u32>) {
        let index = match *prev_node {
            Some(cached) if self.nodes[cached as usize].hash == op.tag => cached,
            _ => self.find(op.tag).unwrap_or(TAG_ROOT),
        };
        *prev_node = Some(index);

        let node = &mut self.nodes[index as usize];
        node.mem_usage += delta;
        node.mem_usage_peak = node.mem_usage_peak.max(node.mem_usage);
        node.op_count += 1;
    }
}
