//! Dominator tree via Lengauer-Tarjan
//!
//! T. Lengauer, R.E. Tarjan. 1979.
//!     "A Fast Algorithm for Finding Dominators in a Flowgraph"
//!     ACM Transactions on Programming Languages and Systems 1(1), 121-141.
//!
//! The sophisticated version: EVAL/LINK maintain a forest balanced by size,
//! giving O((V+E) alpha(V)) overall.

use ami_ir::Cfg;
use hashbrown::HashMap;

/// Immediate-dominator tree of the blocks reachable from the entrypoint.
#[derive(Debug, Clone, Default)]
pub struct DomTree {
    idom: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
    preorder: Vec<String>,
}

impl DomTree {
    pub fn compute(cfg: &Cfg) -> DomTree {
        Lengauer::run(cfg)
    }

    /// The immediate dominator; absent for the entrypoint and for
    /// unreachable blocks.
    pub fn idom(&self, label: &str) -> Option<&str> {
        self.idom.get(label).map(String::as_str)
    }

    /// Children in the dominator tree, sorted by label.
    pub fn children(&self, label: &str) -> &[String] {
        self.children.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Does `a` dominate `b`? (Reflexive; walks the idom chain.)
    pub fn dominates(&self, a: &str, b: &str) -> bool {
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            match self.idom(cursor) {
                Some(up) => cursor = up,
                None => return false,
            }
        }
    }

    pub fn is_reachable(&self, label: &str) -> bool {
        self.preorder.iter().any(|l| l == label)
    }

    /// Reachable blocks in DFS preorder (the entrypoint first).
    pub fn preorder(&self) -> &[String] {
        &self.preorder
    }
}

/// Working state of the Lengauer-Tarjan run. Vertices are numbered 1..=n in
/// DFS preorder; 0 is the null vertex the paper uses as a sentinel.
struct Lengauer {
    parent: Vec<usize>,
    semi: Vec<usize>,
    vertex: Vec<usize>,
    preds: Vec<Vec<usize>>,
    bucket: Vec<Vec<usize>>,
    dom: Vec<usize>,
    ancestor: Vec<usize>,
    label: Vec<usize>,
    size: Vec<usize>,
    child: Vec<usize>,
}

impl Lengauer {
    fn run(cfg: &Cfg) -> DomTree {
        // Step 1: DFS numbering, recording parents and predecessor lists
        let mut index: HashMap<&str, usize> = HashMap::new();
        let mut names: Vec<&str> = vec![""]; // names[0] unused
        let entry = cfg.entry_label();
        if cfg.get(entry).is_none() {
            return DomTree::default();
        }

        let mut order: Vec<&str> = Vec::new();
        let mut parent_of: HashMap<&str, &str> = HashMap::new();
        let mut stack: Vec<(&str, usize)> = vec![(entry, 0)];
        let mut seen: HashMap<&str, ()> = HashMap::new();
        seen.insert(entry, ());
        order.push(entry);
        while let Some((label, cursor)) = stack.pop() {
            let block = cfg.get(label).expect("DFS stays within the CFG");
            let children = block.children();
            if cursor < children.len() {
                stack.push((label, cursor + 1));
                let child: &str = children[cursor];
                if seen.insert(child, ()).is_none() {
                    parent_of.insert(child, label);
                    order.push(child);
                    stack.push((child, 0));
                }
            }
        }

        let n = order.len();
        for (i, label) in order.iter().enumerate() {
            index.insert(label, i + 1);
            names.push(label);
        }

        let mut state = Lengauer {
            parent: vec![0; n + 1],
            semi: (0..=n).collect(),
            vertex: (0..=n).collect(),
            preds: vec![Vec::new(); n + 1],
            bucket: vec![Vec::new(); n + 1],
            dom: vec![0; n + 1],
            ancestor: vec![0; n + 1],
            label: (0..=n).collect(),
            size: vec![1; n + 1],
            child: vec![0; n + 1],
        };
        state.size[0] = 0;

        for (label, parent) in &parent_of {
            state.parent[index[label]] = index[parent];
        }
        for label in &order {
            let w = index[label];
            for pred in cfg.get(label).expect("reachable block").parents() {
                if let Some(&v) = index.get(pred) {
                    state.preds[w].push(v);
                }
            }
        }

        // Steps 2 and 3: semidominators, implicit immediate dominators
        for w in (2..=n).rev() {
            for i in 0..state.preds[w].len() {
                let v = state.preds[w][i];
                let u = state.eval(v);
                if state.semi[u] < state.semi[w] {
                    state.semi[w] = state.semi[u];
                }
            }
            let anchor = state.vertex[state.semi[w]];
            state.bucket[anchor].push(w);
            let p = state.parent[w];
            state.link(p, w);
            let drained = std::mem::take(&mut state.bucket[p]);
            for v in drained {
                let u = state.eval(v);
                state.dom[v] = if state.semi[u] < state.semi[v] { u } else { p };
            }
        }

        // Step 4: fix-up in forward order
        for w in 2..=n {
            if state.dom[w] != state.vertex[state.semi[w]] {
                state.dom[w] = state.dom[state.dom[w]];
            }
        }

        let mut idom = HashMap::new();
        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for w in 2..=n {
            let name = names[w].to_string();
            let dom = names[state.dom[w]].to_string();
            children.entry(dom.clone()).or_default().push(name.clone());
            idom.insert(name, dom);
        }
        for list in children.values_mut() {
            list.sort();
        }
        DomTree {
            idom,
            children,
            preorder: order.into_iter().map(String::from).collect(),
        }
    }

    fn compress(&mut self, v: usize) {
        // iterative two-pass path compression
        let mut chain = Vec::new();
        let mut cursor = v;
        while self.ancestor[self.ancestor[cursor]] != 0 {
            chain.push(cursor);
            cursor = self.ancestor[cursor];
        }
        for &node in chain.iter().rev() {
            let up = self.ancestor[node];
            if self.semi[self.label[up]] < self.semi[self.label[node]] {
                self.label[node] = self.label[up];
            }
            self.ancestor[node] = self.ancestor[up];
        }
    }

    fn eval(&mut self, v: usize) -> usize {
        if self.ancestor[v] == 0 {
            return self.label[v];
        }
        self.compress(v);
        if self.semi[self.label[self.ancestor[v]]] >= self.semi[self.label[v]] {
            self.label[v]
        } else {
            self.label[self.ancestor[v]]
        }
    }

    fn link(&mut self, v: usize, w: usize) {
        let mut s = w;
        while self.semi[self.label[w]] < self.semi[self.label[self.child[s]]] {
            if self.size[s] + self.size[self.child[self.child[s]]] >= 2 * self.size[self.child[s]] {
                self.ancestor[self.child[s]] = s;
                self.child[s] = self.child[self.child[s]];
            } else {
                self.size[self.child[s]] = self.size[s];
                self.ancestor[s] = self.child[s];
                s = self.child[s];
            }
        }
        self.label[s] = self.label[w];
        self.size[v] += self.size[w];
        if self.size[v] < 2 * self.size[w] {
            std::mem::swap(&mut s, &mut self.child[v]);
        }
        while s != 0 {
            self.ancestor[s] = v;
            s = self.child[s];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn read(source: &str) -> Cfg {
        CfgBuilder::default().build(source).unwrap()
    }

    #[test]
    fn test_diamond() {
        let cfg = read(
            "@e: branch %c ? @l : @r\n\
             @l: goto @j\n\
             @r: goto @j\n\
             @j: exit\n",
        );
        let dt = DomTree::compute(&cfg);
        assert_eq!(dt.idom("@e"), None);
        assert_eq!(dt.idom("@l"), Some("@e"));
        assert_eq!(dt.idom("@r"), Some("@e"));
        assert_eq!(dt.idom("@j"), Some("@e"));
        assert!(dt.dominates("@e", "@j"));
        assert!(!dt.dominates("@l", "@j"));
        assert_eq!(dt.children("@e"), ["@j", "@l", "@r"]);
    }

    #[test]
    fn test_loop() {
        let cfg = read(
            "@entry: goto @head\n\
             @head: branch %c ? @body : @exit\n\
             @body: goto @head\n\
             @exit: exit\n",
        );
        let dt = DomTree::compute(&cfg);
        assert_eq!(dt.idom("@head"), Some("@entry"));
        assert_eq!(dt.idom("@body"), Some("@head"));
        assert_eq!(dt.idom("@exit"), Some("@head"));
        assert!(dt.dominates("@head", "@body"));
        assert!(!dt.dominates("@body", "@exit"));
    }

    #[test]
    fn test_idom_lies_on_every_path() {
        // the classic Lengauer-Tarjan counterexample shape for naive
        // semidominator reasoning: cross edges into a chain
        let cfg = read(
            "@r: branch %a ? @x : @y\n\
             @x: branch %b ? @y : @z\n\
             @y: goto @w\n\
             @z: goto @w\n\
             @w: exit\n",
        );
        let dt = DomTree::compute(&cfg);
        assert_eq!(dt.idom("@w"), Some("@r"));
        assert_eq!(dt.idom("@y"), Some("@r"));
        assert_eq!(dt.idom("@z"), Some("@x"));
    }

    #[test]
    fn test_unreachable_blocks_have_no_idom() {
        let cfg = read("@a: exit\n@dead: exit\n");
        let dt = DomTree::compute(&cfg);
        assert!(!dt.is_reachable("@dead"));
        assert_eq!(dt.idom("@dead"), None);
        assert_eq!(dt.preorder(), ["@a"]);
    }

    #[test]
    fn test_self_loop() {
        let cfg = read("@a: branch %c ? @a : @b\n@b: exit\n");
        let dt = DomTree::compute(&cfg);
        assert_eq!(dt.idom("@a"), None);
        assert_eq!(dt.idom("@b"), Some("@a"));
    }
}
