//! DJ-graph: dominator-tree edges plus join edges
//!
//! V.C. Sreedhar, G.R. Gao. 1994.
//!     "Computing phi-nodes in Linear Time", POPL'95, 62-73.
//! V.C. Sreedhar, G.R. Gao, Y.F. Lee. 1997.
//!     "Incremental Computation of Dominator Trees"
//!     ACM Transactions on Programming Languages and Systems 19(2), 239-252.
//!
//! D-edges are dominator-tree edges; J-edges are CFG edges `B -> C` where
//! `B` does not strictly dominate `C`. Provides dominance queries via a
//! binary-lifting ancestor table, dominance frontiers, the level-driven
//! "piggybank" iterated dominance frontier, and incremental edge insertion.

use super::domtree::DomTree;
use ami_ir::Cfg;
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct DjGraph {
    root: String,
    level: HashMap<String, usize>,
    d_edges: HashMap<String, BTreeSet<String>>,
    j_edges: HashMap<String, BTreeSet<String>>,
    // underlying CFG edges, needed when an incremental update demotes a
    // D-edge: it survives as a J-edge only if the flow edge really exists
    cfg_edges: HashMap<String, BTreeSet<String>>,
    // up[(b, e)] is the block 2^e levels above b; entries above up_valid[b]
    // are stale after an incremental update
    up: RefCell<HashMap<(String, u32), Option<String>>>,
    up_valid: RefCell<HashMap<String, u32>>,
}

impl DjGraph {
    /// Build the DJ-graph of a CFG from its dominator tree.
    pub fn compute(cfg: &Cfg, domtree: &DomTree) -> DjGraph {
        let root = cfg.entry_label().to_string();
        let mut dj = DjGraph::rooted(&root);

        // D-edges by DFS of the dominator tree
        let mut stack = vec![(root.clone(), 0usize)];
        while let Some((node, level)) = stack.pop() {
            dj.level.insert(node.clone(), level);
            let mut dchildren = BTreeSet::new();
            for child in domtree.children(&node) {
                dchildren.insert(child.clone());
                dj.up
                    .get_mut()
                    .insert((child.clone(), 0), Some(node.clone()));
                dj.up_valid.get_mut().insert(child.clone(), 0);
                stack.push((child.clone(), level + 1));
            }
            dj.d_edges.insert(node, dchildren);
        }

        // J-edges restricted to reachable blocks
        for label in cfg.postorder() {
            let block = cfg.get(&label).expect("postorder stays in the CFG");
            let mut joins = BTreeSet::new();
            let mut flow = BTreeSet::new();
            for child in block.child_set() {
                flow.insert(child.to_string());
                if child == label || !domtree.dominates(&label, child) {
                    joins.insert(child.to_string());
                }
            }
            dj.cfg_edges.insert(label.clone(), flow);
            dj.j_edges.insert(label, joins);
        }
        dj
    }

    /// An empty DJ-graph containing only the root (grown incrementally via
    /// [`DjGraph::insert_edge`], as the predicated GVN does for its
    /// reachability subgraph).
    pub fn rooted(root: &str) -> DjGraph {
        let mut dj = DjGraph {
            root: root.to_string(),
            level: HashMap::new(),
            d_edges: HashMap::new(),
            j_edges: HashMap::new(),
            cfg_edges: HashMap::new(),
            up: RefCell::new(HashMap::new()),
            up_valid: RefCell::new(HashMap::new()),
        };
        dj.level.insert(root.to_string(), 0);
        dj.d_edges.insert(root.to_string(), BTreeSet::new());
        dj.j_edges.insert(root.to_string(), BTreeSet::new());
        dj
    }

    pub fn contains(&self, label: &str) -> bool {
        self.level.contains_key(label)
    }

    pub fn level(&self, label: &str) -> Option<usize> {
        self.level.get(label).copied()
    }

    /// The block `2^e` steps up the dominator tree.
    fn up(&self, block: &str, e: u32) -> Option<String> {
        if block == self.root {
            return None;
        }
        let key = (block.to_string(), e);
        let valid = self.up_valid.borrow().get(block).copied().unwrap_or(0);
        if valid >= e {
            if let Some(hit) = self.up.borrow().get(&key) {
                return hit.clone();
            }
        }
        if e == 0 {
            // not in the dominator tree at all
            return None;
        }
        let half = self.up(block, e - 1)?;
        let result = self.up(&half, e - 1);
        self.up.borrow_mut().insert(key, result.clone());
        let mut valid_map = self.up_valid.borrow_mut();
        let slot = valid_map.entry(block.to_string()).or_insert(0);
        *slot = (*slot).max(e);
        result
    }

    /// Immediate dominator in the DJ-graph.
    pub fn idom(&self, block: &str) -> Option<String> {
        self.up(block, 0)
    }

    /// Children in the dominator tree.
    pub fn d_children(&self, block: &str) -> Vec<String> {
        self.d_edges
            .get(block)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn j_succs(&self, block: &str) -> Vec<String> {
        self.j_edges
            .get(block)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Least common ancestor of `a` and `b` in the dominator tree, by
    /// jumping powers-of-two levels. Both must be in the tree.
    pub fn least_common_dominator(&self, a: &str, b: &str) -> Option<String> {
        let la = self.level(a)?;
        let lb = self.level(b)?;
        if la > lb {
            return self.least_common_dominator(b, a);
        }

        // raise b to a's level
        let mut b = b.to_string();
        let mut diff = lb - la;
        let mut e = 0u32;
        while diff > 0 {
            if diff & 1 == 1 {
                b = self.up(&b, e)?;
            }
            diff >>= 1;
            e += 1;
        }
        if a == b {
            return Some(b);
        }

        // binary-search the meeting point downward from the top
        let mut a = a.to_string();
        let mut count = (usize::BITS - la.leading_zeros()) as i64;
        while count >= 0 {
            let ua = self.up(&a, count as u32);
            let ub = self.up(&b, count as u32);
            if ua == ub {
                count -= 1;
                continue;
            }
            // distinct ancestors at the same level are never above the root
            a = ua?;
            b = ub?;
        }
        self.up(&a, 0)
    }

    /// `a` dominates `b` iff `a` is the least common dominator of the pair.
    pub fn dominates(&self, a: &str, b: &str) -> bool {
        self.least_common_dominator(a, b).as_deref() == Some(a)
    }

    /// Dominance frontier of a set of blocks: join successors of dominated
    /// subtrees that do not sink below the source block's level.
    pub fn dominance_frontier(&self, blocks: &[&str]) -> BTreeSet<String> {
        let mut frontier = BTreeSet::new();
        for &block in blocks {
            let Some(level) = self.level(block) else {
                continue;
            };
            let mut stack = vec![block.to_string()];
            let mut seen = HashSet::new();
            while let Some(node) = stack.pop() {
                if !seen.insert(node.clone()) {
                    continue;
                }
                for join in self.j_succs(&node) {
                    if self.level(&join).is_some_and(|l| l <= level) {
                        frontier.insert(join);
                    }
                }
                for child in self.d_children(&node) {
                    stack.push(child);
                }
            }
        }
        frontier
    }

    /// Iterated dominance frontier via the Sreedhar-Gao piggybank: nodes
    /// are processed from the deepest level upward, visiting dominated
    /// subtrees and harvesting join edges that do not sink deeper than the
    /// current root. `minlevel` restricts the result to nodes at that depth
    /// or deeper (used by the incremental update).
    pub fn iterated_dominance_frontier(
        &self,
        blocks: &[&str],
        minlevel: usize,
    ) -> BTreeSet<String> {
        let mut piggybank: Vec<Vec<String>> = Vec::new();
        let depth = self.level.values().copied().max().unwrap_or(0);
        piggybank.resize(depth + 1, Vec::new());

        let sources: BTreeSet<String> = blocks.iter().map(|b| b.to_string()).collect();
        let mut idf: BTreeSet<String> = BTreeSet::new();
        let mut visited: HashSet<String> = HashSet::new();

        for block in &sources {
            if let Some(level) = self.level(block) {
                piggybank[level].push(block.clone());
            }
        }

        let mut current = depth;
        loop {
            let Some(root) = piggybank[current].pop() else {
                if current == 0 {
                    break;
                }
                current -= 1;
                continue;
            };
            let root_level = self.level(&root).unwrap_or(0);
            let mut stack = vec![root.clone()];
            while let Some(node) = stack.pop() {
                if !visited.insert(node.clone()) {
                    continue;
                }
                for join in self.j_succs(&node) {
                    let Some(join_level) = self.level(&join) else {
                        continue;
                    };
                    if minlevel <= join_level && join_level <= root_level && idf.insert(join.clone())
                    {
                        if !sources.contains(&join) {
                            let level = join_level.min(piggybank.len() - 1);
                            piggybank[level].push(join.clone());
                            if level > current {
                                current = level;
                            }
                        }
                    }
                }
                for child in self.d_children(&node) {
                    if !visited.contains(&child) {
                        stack.push(child);
                    }
                }
            }
        }
        idf
    }

    /// Incrementally account for a new CFG edge `a -> b` (Sreedhar-Gao-Lee).
    /// `a` must already be in the graph; a new `b` is adopted as a
    /// dominator-tree child of `a`.
    pub fn insert_edge(&mut self, a: &str, b: &str) {
        self.cfg_edges
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        if !self.d_edges.contains_key(b) {
            let level = self.level[a] + 1;
            self.d_edges
                .get_mut(a)
                .expect("a is in the graph")
                .insert(b.to_string());
            self.d_edges.insert(b.to_string(), BTreeSet::new());
            self.j_edges.insert(b.to_string(), BTreeSet::new());
            self.level.insert(b.to_string(), level);
            self.up
                .get_mut()
                .insert((b.to_string(), 0), Some(a.to_string()));
            self.up_valid.get_mut().insert(b.to_string(), 0);
        }

        let lcd = self
            .least_common_dominator(a, b)
            .expect("both nodes are in the graph");
        if lcd != a {
            // a does not dominate b: this is a J-edge
            if !self.j_edges.entry(a.to_string()).or_default().insert(b.to_string()) {
                return;
            }
        }

        let lcd_level = self.level[&lcd];
        let mut affected = self.iterated_dominance_frontier(&[b], lcd_level + 1);
        if self.level[b] > lcd_level + 1 {
            affected.insert(b.to_string());
        }

        for block in affected {
            // the entrypoint is never affected thanks to the level bound
            let idom = self.idom(&block).expect("affected nodes have a dominator");
            self.d_edges
                .get_mut(&idom)
                .expect("dominator is in the graph")
                .remove(&block);
            // the old D-edge survives as a J-edge if the flow edge exists
            if self
                .cfg_edges
                .get(&idom)
                .is_some_and(|flow| flow.contains(&block))
            {
                self.j_edges
                    .entry(idom.clone())
                    .or_default()
                    .insert(block.clone());
            }
            self.d_edges
                .get_mut(&lcd)
                .expect("lcd is in the graph")
                .insert(block.clone());
            self.up
                .get_mut()
                .insert((block.clone(), 0), Some(lcd.clone()));
            self.relevel(&block, lcd_level + 1);
        }
    }

    fn relevel(&mut self, node: &str, level: usize) {
        self.level.insert(node.to_string(), level);
        self.up_valid.get_mut().insert(node.to_string(), 0);
        for child in self.d_children(node) {
            self.relevel(&child, level + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn graph(source: &str) -> DjGraph {
        let cfg = CfgBuilder::default().build(source).unwrap();
        let dt = DomTree::compute(&cfg);
        DjGraph::compute(&cfg, &dt)
    }

    const DIAMOND: &str = "@e: branch %c ? @l : @r\n\
                           @l: goto @j\n\
                           @r: goto @j\n\
                           @j: exit\n";

    #[test]
    fn test_diamond_frontier() {
        let dj = graph(DIAMOND);
        assert!(dj.dominance_frontier(&["@e"]).is_empty());
        assert_eq!(
            dj.dominance_frontier(&["@l"]),
            BTreeSet::from(["@j".to_string()])
        );
        assert_eq!(
            dj.dominance_frontier(&["@r"]),
            BTreeSet::from(["@j".to_string()])
        );
        assert!(dj.dominance_frontier(&["@j"]).is_empty());
    }

    #[test]
    fn test_least_common_dominator() {
        let dj = graph(DIAMOND);
        assert_eq!(dj.least_common_dominator("@l", "@r").as_deref(), Some("@e"));
        assert_eq!(dj.least_common_dominator("@l", "@j").as_deref(), Some("@e"));
        assert_eq!(dj.least_common_dominator("@e", "@j").as_deref(), Some("@e"));
        assert!(dj.dominates("@e", "@j"));
        assert!(!dj.dominates("@l", "@j"));
        assert!(dj.dominates("@l", "@l"));
    }

    #[test]
    fn test_loop_frontier_includes_header() {
        let dj = graph(
            "@entry: goto @head\n\
             @head: branch %c ? @body : @out\n\
             @body: goto @head\n\
             @out: exit\n",
        );
        // the back edge makes @head its own frontier member
        assert_eq!(
            dj.dominance_frontier(&["@head"]),
            BTreeSet::from(["@head".to_string()])
        );
        assert_eq!(
            dj.dominance_frontier(&["@body"]),
            BTreeSet::from(["@head".to_string()])
        );
    }

    #[test]
    fn test_iterated_frontier_ladder() {
        let dj = graph(
            "@a: branch %c ? @b : @c\n\
             @b: goto @d\n\
             @c: goto @d\n\
             @d: branch %c ? @e : @f\n\
             @e: goto @g\n\
             @f: goto @g\n\
             @g: exit\n",
        );
        // a def in @b reaches joins @d and, iterating, @g is only in the
        // frontier of {@b, @d}
        assert_eq!(
            dj.iterated_dominance_frontier(&["@b"], 0),
            BTreeSet::from(["@d".to_string(), "@g".to_string()])
        );
    }

    #[test]
    fn test_incremental_insert_matches_batch() {
        // build @e -> @l/@r with @j only connected afterwards
        let before = "@e: branch %c ? @l : @r\n\
                      @l: exit\n\
                      @r: exit\n\
                      @j: exit\n";
        let cfg = CfgBuilder::default().build(before).unwrap();
        let dt = DomTree::compute(&cfg);
        let mut dj = DjGraph::compute(&cfg, &dt);
        dj.insert_edge("@l", "@j");
        assert_eq!(dj.idom("@j").as_deref(), Some("@l"));
        dj.insert_edge("@r", "@j");
        // the second edge hoists @j's dominator to the fork
        assert_eq!(dj.idom("@j").as_deref(), Some("@e"));
        assert_eq!(dj.level("@j"), Some(1));
        assert_eq!(
            dj.dominance_frontier(&["@l"]),
            BTreeSet::from(["@j".to_string()])
        );
    }
}
