use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::conf::RateBudget;
use crate::context::Context;
use crate::error::Result;
use crate::limiter::Limiter;

/// 节点在 [`LimiterTree`] 中的下标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

struct Node {
    budget: Arc<RateBudget>,
    bucket: Arc<Limiter>,
    parent: Option<NodeId>,
    children: usize,
    /// 句柄已经全部释放，等子节点清空后回收
    released: bool,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Option<Node>>,
    free: Vec<usize>,
}

impl Arena {
    fn insert(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(node);
                NodeId(index)
            }
            None => {
                self.slots.push(Some(node));
                NodeId(self.slots.len() - 1)
            }
        }
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots.get(id.0).and_then(Option::as_ref)
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.slots.get_mut(id.0).and_then(Option::as_mut)
    }

    fn remove(&mut self, id: NodeId) -> Option<Node> {
        let node = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(node)
    }
}

/// 限速器节点的集合，节点通过下标引用父节点。
///
/// 父节点的槽位要等到它自己的句柄释放并且所有子节点都回收之后才会被回收，
/// 所以子节点持有的父节点下标始终有效。
#[derive(Default)]
pub struct LimiterTree {
    arena: RwLock<Arena>,
}

impl LimiterTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 创建一个没有父节点的限速器
    pub fn root(self: &Arc<Self>, budget: Arc<RateBudget>) -> BandwidthLimiter {
        self.insert(None, budget)
    }

    /// 存活的节点数，包括已释放但还有子节点的
    pub fn len(&self) -> usize {
        let arena = self.arena.read();
        arena.slots.len() - arena.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(self: &Arc<Self>, parent: Option<NodeId>, budget: Arc<RateBudget>) -> BandwidthLimiter {
        let bucket = Arc::new(Limiter::from_budget(budget.snapshot()));
        let id = {
            let mut arena = self.arena.write();
            if let Some(parent) = parent {
                if let Some(node) = arena.get_mut(parent) {
                    node.children += 1;
                }
            }
            arena.insert(Node {
                budget,
                bucket,
                parent,
                children: 0,
                released: false,
            })
        };
        BandwidthLimiter {
            handle: Arc::new(Handle {
                tree: Arc::clone(self),
                id,
            }),
        }
    }

    /// 从根到 `id` 的整条链
    fn chain(&self, id: NodeId) -> Vec<(Arc<RateBudget>, Arc<Limiter>)> {
        let arena = self.arena.read();
        let mut chain = Vec::new();
        let mut cursor = Some(id);
        while let Some(node) = cursor.and_then(|c| arena.get(c)) {
            chain.push((Arc::clone(&node.budget), Arc::clone(&node.bucket)));
            cursor = node.parent;
        }
        chain.reverse();
        chain
    }

    fn release(&self, id: NodeId) {
        let mut arena = self.arena.write();
        if let Some(node) = arena.get_mut(id) {
            node.released = true;
        }

        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let reclaim = arena
                .get(current)
                .is_some_and(|node| node.released && node.children == 0);
            if !reclaim {
                break;
            }
            cursor = arena.remove(current).and_then(|node| node.parent);
            if let Some(parent) = cursor {
                if let Some(node) = arena.get_mut(parent) {
                    node.children -= 1;
                }
            }
        }
    }
}

struct Handle {
    tree: Arc<LimiterTree>,
    id: NodeId,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.tree.release(self.id);
    }
}

/// 限速树中一个节点的句柄，克隆共享同一个节点，最后一个克隆释放时节点被回收。
#[derive(Clone)]
pub struct BandwidthLimiter {
    handle: Arc<Handle>,
}

impl BandwidthLimiter {
    /// 在一棵新树上创建根限速器
    pub fn new(budget: Arc<RateBudget>) -> Self {
        LimiterTree::new().root(budget)
    }

    pub fn unlimited() -> Self {
        Self::new(Arc::new(RateBudget::unlimited()))
    }

    /// 子限速器先等父节点，再等自己
    pub fn child(&self, budget: Arc<RateBudget>) -> Self {
        self.handle.tree.insert(Some(self.handle.id), budget)
    }

    pub fn id(&self) -> NodeId {
        self.handle.id
    }

    pub fn tree(&self) -> &Arc<LimiterTree> {
        &self.handle.tree
    }

    /// 等待整条链上都有 `n` 个令牌，父节点优先。
    ///
    /// 每个节点在等待前都会重新读取自己的配置。
    pub async fn wait_n(&self, ctx: &Context, n: i64) -> Result<()> {
        for (budget, bucket) in self.handle.tree.chain(self.handle.id) {
            bucket.configure(budget.snapshot());
            bucket.wait_n(ctx, n).await?;
        }
        Ok(())
    }

    /// 整条链上最小的突发上限，单次读写不能超过它
    pub fn max_io_size(&self) -> i64 {
        self.handle
            .tree
            .chain(self.handle.id)
            .iter()
            .map(|(budget, _)| budget.burst())
            .min()
            .unwrap_or(i64::MAX)
    }
}

impl fmt::Debug for BandwidthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BandwidthLimiter")
            .field("id", &self.handle.id)
            .finish()
    }
}
