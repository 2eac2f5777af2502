//! Predicate lattice over canonical expressions
//!
//! [`Comparisons`] stores a conjunction of equality, inequality and
//! unequality assertions. Values live in a DAG whose nodes are equality
//! classes (path-compressing union-find, with the class's order-minimal
//! element as representative) and whose edges record `a <= b`. Each class
//! carries an integer interval; bounds propagate along edges, an interval
//! collapsing to a point merges the class with the constant, and an empty
//! interval marks the whole state inconsistent.
//!
//! [`PredicatedState`] layers structural reasoning on top: registering the
//! facts implied by an expression's shape (`simplify`), and driving the
//! consequences of an expression being zero or nonzero down through its
//! operands (`assert_zero` / `assert_nonzero`).

use crate::expr::{Expr, ExprOp};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct Comparisons {
    eq: HashMap<Expr, Expr>,
    leq: HashMap<Expr, BTreeSet<Expr>>,
    geq: HashMap<Expr, BTreeSet<Expr>>,
    neq: HashMap<Expr, BTreeSet<Expr>>,
    range: HashMap<Expr, (Option<i128>, Option<i128>)>,
    // chain-length approximations steering which side a query traverses
    lheight: HashMap<Expr, u64>,
    rheight: HashMap<Expr, u64>,
    consistent: bool,
}

impl Default for Comparisons {
    fn default() -> Self {
        Self::new()
    }
}

impl Comparisons {
    pub fn new() -> Self {
        Comparisons {
            eq: HashMap::new(),
            leq: HashMap::new(),
            geq: HashMap::new(),
            neq: HashMap::new(),
            range: HashMap::new(),
            lheight: HashMap::new(),
            rheight: HashMap::new(),
            consistent: true,
        }
    }

    pub fn contains(&self, node: &Expr) -> bool {
        self.eq.contains_key(node)
    }

    pub fn is_consistent(&mut self) -> bool {
        if !self.consistent {
            return false;
        }
        let nodes: Vec<Expr> = self.eq.keys().cloned().collect();
        for node in nodes {
            self.eqclass(&node); // force compression and collapses
        }
        self.consistent
    }

    pub fn add(&mut self, node: &Expr) {
        if !self.consistent || self.eq.contains_key(node) {
            return;
        }
        self.eq.insert(node.clone(), node.clone());
        self.leq
            .insert(node.clone(), BTreeSet::from([node.clone()]));
        self.geq
            .insert(node.clone(), BTreeSet::from([node.clone()]));
        self.neq.insert(node.clone(), BTreeSet::new());
        self.lheight.insert(node.clone(), 0);
        self.rheight.insert(node.clone(), 0);
        let range = match node {
            Expr::Const(value) => (Some(*value), Some(*value)),
            Expr::Node(op, _) if op.is_comparison() => (Some(0), Some(1)),
            _ => (None, None),
        };
        self.range.insert(node.clone(), range);
    }

    /// The representative of a node's equality class.
    pub fn eqclass(&mut self, node: &Expr) -> Expr {
        if !self.consistent {
            return node.clone();
        }
        if !self.eq.contains_key(node) {
            self.add(node);
        }
        if matches!(node, Expr::Const(_)) {
            return node.clone();
        }
        let head = self.eq[node].clone();
        let grand = self.eq.get(&head).cloned().unwrap_or_else(|| head.clone());
        if grand != head {
            let top = self.eqclass(&head);
            self.update_eq(&head, &top);
            self.update_eq(node, &top);
            return top;
        }
        head
    }

    pub fn assert_leq(&mut self, a: &Expr, b: &Expr) {
        if !self.consistent {
            return;
        }
        let a = self.eqclass(a);
        let b = self.eqclass(b);
        if self.leq(&b, &a) {
            // a <= b and b <= a: the two classes collapse
            let representative = a.clone().min(b.clone());
            self.merge_down(&a, &b, &representative);
        } else {
            self.update_leq(&a, &b);
        }
    }

    pub fn assert_eq(&mut self, a: &Expr, b: &Expr) {
        if !self.consistent {
            return;
        }
        self.assert_leq(a, b);
        self.assert_leq(b, a);
    }

    pub fn assert_neq(&mut self, a: &Expr, b: &Expr) {
        if !self.consistent {
            return;
        }
        let a = self.eqclass(a);
        let b = self.eqclass(b);
        if a == b {
            self.consistent = false;
            return;
        }
        self.neq.entry(a.clone()).or_default().insert(b.clone());
        self.neq.entry(b.clone()).or_default().insert(a.clone());
        if self.leq(&a, &b) {
            let lo = self.range_of(&a).0;
            let hi = self.range_of(&b).1;
            if let Some(lo) = lo {
                self.update_int_range(&b, Some(lo.saturating_add(1)), None);
            }
            if let Some(hi) = hi {
                self.update_int_range(&a, None, Some(hi.saturating_sub(1)));
            }
        }
        if self.leq(&b, &a) {
            let lo = self.range_of(&b).0;
            let hi = self.range_of(&a).1;
            if let Some(lo) = lo {
                self.update_int_range(&a, Some(lo.saturating_add(1)), None);
            }
            if let Some(hi) = hi {
                self.update_int_range(&b, None, Some(hi.saturating_sub(1)));
            }
        }
    }

    /// Is `a` provably less than or equal to `b`?
    pub fn leq(&mut self, a: &Expr, b: &Expr) -> bool {
        if !self.consistent {
            return false;
        }
        let a = self.eqclass(a);
        let b = self.eqclass(b);
        let mut seen = HashSet::new();
        self.less(&a, &b, &mut seen)
    }

    fn less(&mut self, lhs: &Expr, rhs: &Expr, seen: &mut HashSet<(Expr, Expr)>) -> bool {
        if lhs == rhs {
            return true;
        }
        seen.insert((lhs.clone(), rhs.clone()));
        if self.leq.get(lhs).is_some_and(|s| s.contains(rhs)) {
            // rhs <= lhs is already recorded; a merge would have happened
            // if both directions held
            return false;
        }
        let (llo, lhi) = self.range_of(lhs);
        let (rlo, rhi) = self.range_of(rhs);
        let mut result = false;
        if let (Some(lhi), Some(rlo)) = (lhi, rlo) {
            if lhi <= rlo {
                result = true;
            }
        }
        if !result {
            if let (Some(llo), Some(rhi)) = (llo, rhi) {
                if llo > rhi {
                    self.update_leq(rhs, lhs);
                    return false;
                }
            }
            if self.rheight.get(lhs).copied().unwrap_or(0) > self.lheight.get(rhs).copied().unwrap_or(0)
            {
                // traverse towards smaller elements of rhs
                let below: Vec<Expr> = self.leq.get(rhs).cloned().unwrap_or_default().into_iter().collect();
                for lt in below {
                    let lt = self.eqclass(&lt);
                    if !seen.contains(&(lhs.clone(), lt.clone())) && self.less(lhs, &lt, seen) {
                        result = true;
                        break;
                    }
                }
            } else {
                // traverse towards larger elements of lhs
                let above: Vec<Expr> = self.geq.get(lhs).cloned().unwrap_or_default().into_iter().collect();
                for gt in above {
                    let gt = self.eqclass(&gt);
                    if !seen.contains(&(gt.clone(), rhs.clone())) && self.less(&gt, rhs, seen) {
                        result = true;
                        break;
                    }
                }
            }
        }
        if result {
            self.update_leq(lhs, rhs);
            return true;
        }
        false
    }

    /// Is `a` provably equal to `b`?
    pub fn eq(&mut self, a: &Expr, b: &Expr) -> bool {
        self.eqclass(a) == self.eqclass(b)
    }

    /// Is `a` provably unequal to `b`?
    pub fn neq(&mut self, a: &Expr, b: &Expr) -> bool {
        if !self.consistent {
            return false;
        }
        let a = self.eqclass(a);
        let b = self.eqclass(b);
        if self.neq.get(&b).is_some_and(|s| s.contains(&a)) {
            return true;
        }
        let (alo, ahi) = self.range_of(&a);
        let (blo, bhi) = self.range_of(&b);
        if let (Some(alo), Some(bhi)) = (alo, bhi) {
            if alo > bhi {
                self.update_leq(&b, &a);
                self.assert_neq(&a, &b);
                return true;
            }
        }
        if let (Some(ahi), Some(blo)) = (ahi, blo) {
            if blo > ahi {
                self.update_leq(&a, &b);
                self.assert_neq(&a, &b);
                return true;
            }
        }
        false
    }

    /// The known integer interval of an expression's class.
    pub fn int_range(&mut self, expr: &Expr) -> (Option<i128>, Option<i128>) {
        let expr = self.eqclass(expr);
        self.range_of(&expr)
    }

    fn range_of(&mut self, node: &Expr) -> (Option<i128>, Option<i128>) {
        self.add(node);
        self.range.get(node).copied().unwrap_or((None, None))
    }

    fn update_eq(&mut self, node: &Expr, head: &Expr) {
        if node == head || self.eq.get(node) == Some(head) {
            return;
        }
        if !self.leq.contains_key(node) {
            // already absorbed into another class
            return;
        }
        self.eq.insert(node.clone(), head.clone());
        let (lo, hi) = self.range.remove(node).unwrap_or((None, None));
        self.update_int_range(head, lo, hi);
        let lheight = self.lheight.remove(node).unwrap_or(0);
        let rheight = self.rheight.remove(node).unwrap_or(0);
        let slot = self.lheight.entry(head.clone()).or_insert(0);
        *slot = (*slot).max(lheight);
        let slot = self.rheight.entry(head.clone()).or_insert(0);
        *slot = (*slot).max(rheight);

        let below = self.leq.remove(node).unwrap_or_default();
        for lt in below {
            let lt = self.eqclass(&lt);
            if !self.leq.get(head).is_some_and(|s| s.contains(&lt)) {
                self.update_leq(&lt, head);
            }
        }
        let above = self.geq.remove(node).unwrap_or_default();
        for gt in above {
            let gt = self.eqclass(&gt);
            if !self.geq.get(head).is_some_and(|s| s.contains(&gt)) {
                self.update_leq(head, &gt);
            }
        }
        let unequal = self.neq.remove(node).unwrap_or_default();
        for ne in unequal {
            if let Some(set) = self.neq.get_mut(&ne) {
                set.remove(node);
            }
            self.assert_neq(head, &ne);
        }
    }

    fn update_int_range(&mut self, node: &Expr, newlo: Option<i128>, newhi: Option<i128>) {
        if !self.consistent {
            return;
        }
        let node = self.eqclass(node);
        let old = self.range_of(&node);
        let (mut lo, mut hi) = old;
        if let Some(newlo) = newlo {
            lo = Some(lo.map_or(newlo, |v| v.max(newlo)));
        }
        if let Some(newhi) = newhi {
            hi = Some(hi.map_or(newhi, |v| v.min(newhi)));
        }

        // endpoints known to be unequal tighten by one
        let unequal = self.neq.get(&node).cloned().unwrap_or_default();
        while let Some(v) = lo {
            if unequal.contains(&Expr::Const(v)) {
                lo = Some(v.saturating_add(1));
            } else {
                break;
            }
        }
        while let Some(v) = hi {
            if unequal.contains(&Expr::Const(v)) {
                hi = Some(v.saturating_sub(1));
            } else {
                break;
            }
        }

        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo > hi {
                self.consistent = false;
                return;
            }
        }

        self.range.insert(node.clone(), (lo, hi));
        let below: Vec<Expr> = self.leq.get(&node).cloned().unwrap_or_default().into_iter().collect();
        let above: Vec<Expr> = self.geq.get(&node).cloned().unwrap_or_default().into_iter().collect();

        if lo != old.0 {
            let lo = lo.expect("bound only grows");
            for gt in above {
                let gt = self.eqclass(&gt);
                if gt == node {
                    continue;
                }
                let glo = self.range_of(&gt).0;
                let next = lo.saturating_add(self.neq(&node, &gt) as i128);
                if glo.is_none() || glo < Some(next) {
                    self.update_int_range(&gt, Some(next), None);
                }
            }
        }
        if hi != old.1 {
            let hi = hi.expect("bound only shrinks");
            for lt in below {
                let lt = self.eqclass(&lt);
                if lt == node {
                    continue;
                }
                let lhi = self.range_of(&lt).1;
                let next = hi.saturating_sub(self.neq(&node, &lt) as i128);
                if lhi.is_none() || lhi > Some(next) {
                    self.update_int_range(&lt, None, Some(next));
                }
            }
        }

        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo == hi {
                // a point interval collapses the class onto the constant
                self.add(&Expr::Const(lo));
                self.update_eq(&node, &Expr::Const(lo));
            }
        }
    }

    fn update_leq(&mut self, a: &Expr, b: &Expr) {
        if !self.consistent {
            return;
        }
        self.add(a);
        self.add(b);
        if self.leq.get(b).is_some_and(|s| s.contains(a)) {
            return;
        }
        self.leq.entry(b.clone()).or_default().insert(a.clone());
        self.geq.entry(a.clone()).or_default().insert(b.clone());
        let la = self.lheight.get(a).copied().unwrap_or(0);
        let slot = self.lheight.entry(b.clone()).or_insert(0);
        *slot = (*slot).max(la + 1);
        let rb = self.rheight.get(b).copied().unwrap_or(0);
        let slot = self.rheight.entry(a.clone()).or_insert(0);
        *slot = (*slot).max(rb + 1);

        let lo = self.range_of(a).0;
        let hi = self.range_of(b).1;
        if let Some(lo) = lo {
            let bump = self.neq(a, b) as i128;
            self.update_int_range(b, Some(lo.saturating_add(bump)), None);
        }
        if let Some(hi) = hi {
            let bump = self.neq(a, b) as i128;
            self.update_int_range(a, None, Some(hi.saturating_sub(bump)));
        }
    }

    /// Fold every class between `bot` and `node` (inclusive) into `rep`.
    fn merge_down(&mut self, node: &Expr, bot: &Expr, rep: &Expr) {
        if !self.consistent {
            return;
        }
        let mut seen: HashSet<Expr> = HashSet::new();
        let mut pending: Vec<Expr> = vec![node.clone()];
        let mut class: Vec<Expr> = Vec::new();
        while let Some(n) = pending.pop() {
            if !seen.insert(n.clone()) {
                continue;
            }
            if self.leq(bot, &n) {
                class.push(n.clone());
                for lt in self.leq.get(&n).cloned().unwrap_or_default() {
                    if !seen.contains(&lt) {
                        pending.push(lt);
                    }
                }
            }
        }
        for n in class {
            self.update_eq(&n, rep);
        }
    }
}

/// Predicated expression simplification on top of [`Comparisons`].
#[derive(Debug, Clone, Default)]
pub struct PredicatedState {
    comparisons: Comparisons,
}

impl PredicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comparisons(&mut self) -> &mut Comparisons {
        &mut self.comparisons
    }

    pub fn is_consistent(&mut self) -> bool {
        self.comparisons.is_consistent()
    }

    pub fn mark_inconsistent(&mut self) {
        self.comparisons.consistent = false;
    }

    /// Summarise the relations between the given expressions as one big
    /// conjunction (used to fingerprint the state along a CFG path).
    pub fn summary(&mut self, exprs: &BTreeSet<Expr>) -> Expr {
        if !self.is_consistent() {
            return Expr::Const(0);
        }
        let exprs: Vec<Expr> = exprs
            .iter()
            .filter(|e| e.as_const().is_none())
            .cloned()
            .collect();
        let mut conjunction: Vec<Expr> = Vec::new();
        for lhs in &exprs {
            let (lo, hi) = self.comparisons.int_range(lhs);
            if lo == hi {
                if let Some(lo) = lo {
                    conjunction.push(Expr::node(
                        ExprOp::Eq,
                        vec![Expr::Const(lo), lhs.clone()],
                    ));
                }
            } else {
                if let Some(lo) = lo {
                    conjunction.push(Expr::node(
                        ExprOp::Leq,
                        vec![Expr::Const(lo), lhs.clone()],
                    ));
                }
                if let Some(hi) = hi {
                    conjunction.push(Expr::node(
                        ExprOp::Leq,
                        vec![lhs.clone(), Expr::Const(hi)],
                    ));
                }
            }
            for rhs in &exprs {
                if self.comparisons.eq(lhs, rhs) {
                    conjunction.push(Expr::node(ExprOp::Eq, vec![lhs.clone(), rhs.clone()]));
                } else {
                    if self.comparisons.leq(lhs, rhs) {
                        conjunction.push(Expr::node(ExprOp::Leq, vec![lhs.clone(), rhs.clone()]));
                    }
                    if self.comparisons.neq(lhs, rhs) {
                        conjunction.push(Expr::node(ExprOp::Neq, vec![lhs.clone(), rhs.clone()]));
                    }
                }
            }
        }
        let nontrivial: Vec<Expr> = conjunction
            .into_iter()
            .filter(|e| e.as_const().is_none())
            .collect();
        if nontrivial.is_empty() {
            return Expr::Const(-1);
        }
        Expr::node(ExprOp::And, nontrivial)
    }

    /// Register the structural facts implied by an expression and return
    /// its class representative.
    pub fn simplify(&mut self, expr: &Expr) -> Expr {
        let expr = match expr {
            Expr::Node(op, args) => {
                let args = args.iter().map(|a| self.simplify(a)).collect();
                Expr::node(*op, args)
            }
            leaf => leaf.clone(),
        };
        let expr = self.comparisons.eqclass(&expr);
        let zero = Expr::Const(0);

        match &expr {
            Expr::Node(ExprOp::Add, args) if args.len() == 2 => {
                let left = args[0].clone();
                let right = args[1].clone();
                let nleft = Expr::neg(left.clone());
                if self.comparisons.leq(&right, &nleft) {
                    self.comparisons.assert_leq(&expr, &zero);
                }
                if self.comparisons.leq(&nleft, &right) {
                    self.comparisons.assert_leq(&zero, &expr);
                }
                if self.comparisons.leq(&zero, &left) {
                    self.comparisons.assert_leq(&right, &expr);
                }
                if self.comparisons.leq(&left, &zero) {
                    self.comparisons.assert_leq(&expr, &right);
                }
                if self.comparisons.leq(&zero, &right) {
                    self.comparisons.assert_leq(&left, &expr);
                }
                if self.comparisons.leq(&right, &zero) {
                    self.comparisons.assert_leq(&expr, &left);
                }
            }
            Expr::Node(ExprOp::Mul, args) => {
                let args = args.clone();
                let positives = args
                    .iter()
                    .filter(|a| self.comparisons.leq(&zero, a))
                    .count();
                let negatives = args
                    .iter()
                    .filter(|a| self.comparisons.leq(a, &zero))
                    .count();
                if positives + negatives == args.len() {
                    if negatives % 2 == 0 {
                        self.comparisons.assert_leq(&zero, &expr);
                    } else {
                        self.comparisons.assert_leq(&expr, &zero);
                    }
                }
            }
            Expr::Node(ExprOp::Mod, args) => {
                let left = args[0].clone();
                let right = args[1].clone();
                let nleft = Expr::neg(left.clone());
                if self.comparisons.leq(&zero, &right) {
                    // a % b takes the sign of b
                    self.comparisons.assert_leq(&zero, &expr);
                    if self.comparisons.leq(&zero, &left) {
                        if self.comparisons.leq(&left, &right) {
                            // a % b = a when 0 <= a < b
                            self.comparisons.assert_eq(&expr, &left);
                        }
                    } else if self.comparisons.leq(&zero, &nleft)
                        && self.comparisons.leq(&nleft, &right)
                    {
                        let sum = Expr::node(ExprOp::Add, vec![right.clone(), left.clone()]);
                        self.comparisons.assert_eq(&expr, &sum);
                    }
                } else if self.comparisons.leq(&right, &zero) {
                    self.comparisons.assert_leq(&expr, &zero);
                    if self.comparisons.leq(&left, &zero) {
                        if self.comparisons.leq(&right, &left) {
                            self.comparisons.assert_eq(&expr, &left);
                        }
                    } else if self.comparisons.leq(&nleft, &zero)
                        && self.comparisons.leq(&right, &nleft)
                    {
                        let sum = Expr::node(ExprOp::Add, vec![left.clone(), right.clone()]);
                        self.comparisons.assert_eq(&expr, &sum);
                    }
                }
            }
            Expr::Node(ExprOp::Div, args) => {
                // canonicalisation already handled a == b and zero operands
                let left = args[0].clone();
                let right = args[1].clone();
                let nleft = Expr::neg(left.clone());
                if self.comparisons.eq(&nleft, &right) {
                    self.comparisons.assert_eq(&expr, &Expr::Const(-1));
                }
                if self.comparisons.leq(&zero, &right) {
                    if self.comparisons.leq(&zero, &left) {
                        self.comparisons.assert_leq(&zero, &expr);
                        if self.comparisons.leq(&left, &right) {
                            // 0 <= a < b makes a / b = 0
                            self.comparisons.assert_eq(&zero, &expr);
                        }
                    } else if self.comparisons.leq(&zero, &nleft) {
                        self.comparisons.assert_leq(&expr, &zero);
                        if self.comparisons.leq(&nleft, &right) {
                            self.comparisons.assert_eq(&zero, &expr);
                        }
                    }
                } else if self.comparisons.leq(&right, &zero) {
                    if self.comparisons.leq(&left, &zero) {
                        self.comparisons.assert_leq(&zero, &expr);
                        if self.comparisons.leq(&right, &left) {
                            self.comparisons.assert_eq(&zero, &expr);
                        }
                    } else if self.comparisons.leq(&nleft, &zero) {
                        self.comparisons.assert_leq(&expr, &zero);
                        if self.comparisons.leq(&right, &nleft) {
                            self.comparisons.assert_eq(&zero, &expr);
                        }
                    }
                }
            }
            Expr::Node(ExprOp::And, args) => {
                let args = args.clone();
                if args.iter().any(|a| self.comparisons.leq(&zero, a)) {
                    self.comparisons.assert_leq(&zero, &expr);
                } else if args.iter().all(|a| self.comparisons.leq(a, &zero)) {
                    self.comparisons.assert_leq(&expr, &zero);
                }
            }
            Expr::Node(ExprOp::Or, args) => {
                let args = args.clone();
                if args.iter().any(|a| self.comparisons.leq(a, &zero)) {
                    self.comparisons.assert_leq(&expr, &zero);
                } else if args.iter().all(|a| self.comparisons.leq(&zero, a)) {
                    self.comparisons.assert_leq(&zero, &expr);
                }
            }
            Expr::Node(ExprOp::Xor, args) if args.len() == 2 => {
                let left = args[0].clone();
                let right = args[1].clone();
                if self.comparisons.neq(&left, &right) {
                    self.comparisons.assert_neq(&expr, &zero);
                }
            }
            Expr::Node(ExprOp::Shl, args) | Expr::Node(ExprOp::Shr, args) => {
                let left = args[0].clone();
                if self.comparisons.leq(&zero, &left) {
                    self.comparisons.assert_leq(&zero, &expr);
                } else if self.comparisons.leq(&left, &zero) {
                    self.comparisons.assert_leq(&expr, &zero);
                }
            }
            Expr::Node(op, args) if op.is_comparison() => {
                let op = *op;
                let rhs = args[1].clone();
                self.comparisons.assert_leq(&expr, &Expr::Const(1));
                self.comparisons.assert_leq(&zero, &expr);

                // canonical form is 0 op [B] - [A]
                let (bigger, smaller) = Self::split_subtraction(&rhs);
                match op {
                    ExprOp::Eq => {
                        if self.comparisons.neq(&smaller, &bigger) {
                            self.comparisons.assert_eq(&expr, &zero);
                        }
                    }
                    ExprOp::Neq => {
                        if self.comparisons.neq(&smaller, &bigger) {
                            self.comparisons.assert_eq(&expr, &Expr::Const(1));
                        }
                    }
                    ExprOp::Leq => {
                        if self.comparisons.leq(&smaller, &bigger) {
                            self.comparisons.assert_eq(&expr, &Expr::Const(1));
                        } else if self.comparisons.leq(&bigger, &smaller)
                            && self.comparisons.neq(&bigger, &smaller)
                        {
                            self.comparisons.assert_eq(&expr, &zero);
                        }
                    }
                    ExprOp::Lt => {
                        if self.comparisons.eq(&smaller, &bigger) {
                            self.comparisons.assert_eq(&expr, &zero);
                        } else if self.comparisons.neq(&smaller, &bigger) {
                            if self.comparisons.leq(&smaller, &bigger) {
                                self.comparisons.assert_eq(&expr, &Expr::Const(1));
                            } else if self.comparisons.leq(&bigger, &smaller) {
                                self.comparisons.assert_eq(&expr, &zero);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {
                // constants, atoms and phi nodes have nothing further
            }
        }

        self.comparisons.eqclass(&expr)
    }

    /// Split a canonical sum into `([A], [B])` such that the expression is
    /// `[A] - [B]`.
    pub fn split_subtraction(expr: &Expr) -> (Expr, Expr) {
        let Expr::Node(ExprOp::Add, args) = expr else {
            return (expr.clone(), Expr::Const(0));
        };
        let negated = |e: &Expr| {
            matches!(e, Expr::Node(ExprOp::Mul, margs)
                if matches!(margs.first(), Some(Expr::Const(-1))))
        };
        let negatives: Vec<Expr> = args
            .iter()
            .filter(|e| negated(e))
            .map(|e| e.args().last().cloned().expect("mul has arguments"))
            .collect();
        if negatives.is_empty() {
            let rest: Vec<Expr> = args[1..].to_vec();
            return (
                Expr::node(ExprOp::Add, rest),
                Expr::neg(args[0].clone()),
            );
        }
        let positives: Vec<Expr> = args.iter().filter(|e| !negated(e)).cloned().collect();
        (
            Expr::node(ExprOp::Add, positives),
            Expr::node(ExprOp::Add, negatives),
        )
    }

    /// Drive the consequences of `expr != 0` into the state.
    pub fn assert_nonzero(&mut self, expr: &Expr) {
        let expr = match expr {
            Expr::Node(op, args) => {
                let args = args.iter().map(|a| self.simplify(a)).collect();
                Expr::node(*op, args)
            }
            leaf => leaf.clone(),
        };
        let zero = Expr::Const(0);
        match &expr {
            Expr::Const(value) => {
                if *value == 0 {
                    self.mark_inconsistent();
                }
            }
            Expr::Atom(_) => {
                self.comparisons.assert_neq(&expr, &zero);
            }
            Expr::Node(ExprOp::Add, args) => {
                // a + b != 0 iff a != -b
                if args.len() > 2 {
                    self.comparisons.assert_neq(&expr, &zero);
                } else {
                    let nright = Expr::neg(args[1].clone());
                    let nleft = Expr::neg(args[0].clone());
                    self.comparisons.assert_neq(&args[0].clone(), &nright);
                    self.comparisons.assert_neq(&args[1].clone(), &nleft);
                }
            }
            Expr::Node(ExprOp::Mul, args) | Expr::Node(ExprOp::And, args) => {
                // every factor (or conjunct) must be nonzero
                for arg in args.clone() {
                    self.assert_nonzero(&arg);
                }
            }
            Expr::Node(ExprOp::Div, args) => {
                self.assert_nonzero(&args[0].clone());
                self.assert_nonzero(&args[1].clone());
            }
            Expr::Node(ExprOp::Mod, args) => {
                let eq = Expr::node(ExprOp::Eq, vec![args[0].clone(), args[1].clone()]);
                self.assert_nonzero(&eq);
                self.assert_nonzero(&args[0].clone());
                self.assert_nonzero(&args[1].clone());
                self.comparisons.assert_neq(&expr, &zero);
            }
            Expr::Node(ExprOp::Xor, args) => {
                if args.len() > 2 {
                    self.comparisons.assert_neq(&expr, &zero);
                } else {
                    let ne = Expr::node(ExprOp::Neq, vec![args[0].clone(), args[1].clone()]);
                    self.assert_nonzero(&ne);
                }
            }
            Expr::Node(ExprOp::Eq, args) => {
                // (0 == a) != 0 iff a == 0
                let rhs = args[1].clone();
                self.assert_zero(&rhs);
                self.assert_zero(&Expr::neg(rhs));
            }
            Expr::Node(ExprOp::Neq, args) => {
                let rhs = args[1].clone();
                self.assert_nonzero(&rhs);
                self.assert_nonzero(&Expr::neg(rhs));
            }
            Expr::Node(ExprOp::Leq, args) | Expr::Node(ExprOp::Lt, args) => {
                // (0 <= a - b) != 0 iff b <= a
                let strict = matches!(&expr, Expr::Node(ExprOp::Lt, _));
                let (lhs, rhs) = Self::split_subtraction(&args[1].clone());
                self.comparisons.assert_leq(&rhs, &lhs);
                if strict {
                    self.comparisons.assert_neq(&lhs, &rhs);
                }
                let nlhs = Expr::neg(lhs);
                let nrhs = Expr::neg(rhs);
                self.comparisons.assert_leq(&nlhs, &nrhs);
                if strict {
                    self.comparisons.assert_neq(&nlhs, &nrhs);
                }
            }
            _ => {
                // phi, or, shifts: nothing structural to infer
                self.comparisons.assert_neq(&expr, &zero);
            }
        }
    }

    /// Drive the consequences of `expr == 0` into the state.
    pub fn assert_zero(&mut self, expr: &Expr) {
        let expr = match expr {
            Expr::Node(op, args) => {
                let args = args.iter().map(|a| self.simplify(a)).collect();
                Expr::node(*op, args)
            }
            leaf => leaf.clone(),
        };
        let zero = Expr::Const(0);
        match &expr {
            Expr::Const(value) => {
                if *value != 0 {
                    self.mark_inconsistent();
                }
            }
            Expr::Atom(_) => {
                self.comparisons.assert_eq(&expr, &zero);
            }
            Expr::Node(ExprOp::Add, args) => {
                // a + b == 0 iff a == -b
                if args.len() > 2 {
                    self.comparisons.assert_eq(&expr, &zero);
                } else {
                    let nright = Expr::neg(args[1].clone());
                    let nleft = Expr::neg(args[0].clone());
                    self.comparisons.assert_eq(&args[0].clone(), &nright);
                    self.comparisons.assert_eq(&args[1].clone(), &nleft);
                }
            }
            Expr::Node(ExprOp::Or, args) => {
                for arg in args.clone() {
                    self.assert_zero(&arg);
                }
            }
            Expr::Node(ExprOp::Xor, args) => {
                if args.len() > 2 {
                    self.comparisons.assert_eq(&expr, &zero);
                } else {
                    let eq = Expr::node(ExprOp::Eq, vec![args[0].clone(), args[1].clone()]);
                    self.assert_nonzero(&eq);
                }
            }
            Expr::Node(ExprOp::Eq, args) => {
                // (0 == a) == 0 iff a != 0
                self.assert_nonzero(&args[1].clone());
            }
            Expr::Node(ExprOp::Neq, args) => {
                self.assert_zero(&args[1].clone());
            }
            Expr::Node(ExprOp::Leq, args) | Expr::Node(ExprOp::Lt, args) => {
                // (0 <= a - b) == 0 iff a < b
                let was_leq = matches!(&expr, Expr::Node(ExprOp::Leq, _));
                let (lhs, rhs) = Self::split_subtraction(&args[1].clone());
                self.comparisons.assert_leq(&lhs, &rhs);
                if was_leq {
                    self.comparisons.assert_neq(&lhs, &rhs);
                }
                let nlhs = Expr::neg(lhs);
                let nrhs = Expr::neg(rhs);
                self.comparisons.assert_leq(&nrhs, &nlhs);
                if was_leq {
                    self.comparisons.assert_neq(&nlhs, &nrhs);
                }
            }
            _ => {
                // phi, mul, mod, and, shifts: nothing structural to infer
                self.comparisons.assert_eq(&expr, &zero);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::BinaryOp;

    fn atom(name: &str) -> Expr {
        Expr::Atom(name.to_string())
    }

    #[test]
    fn test_transitive_leq() {
        let mut cmp = Comparisons::new();
        cmp.assert_leq(&atom("%a"), &atom("%b"));
        cmp.assert_leq(&atom("%b"), &atom("%c"));
        assert!(cmp.leq(&atom("%a"), &atom("%c")));
        assert!(!cmp.leq(&atom("%c"), &atom("%a")));
    }

    #[test]
    fn test_cycle_merges_classes() {
        let mut cmp = Comparisons::new();
        cmp.assert_leq(&atom("%a"), &atom("%b"));
        cmp.assert_leq(&atom("%b"), &atom("%c"));
        cmp.assert_leq(&atom("%c"), &atom("%a"));
        assert!(cmp.eq(&atom("%a"), &atom("%c")));
        assert!(cmp.eq(&atom("%b"), &atom("%c")));
        assert!(cmp.is_consistent());
    }

    #[test]
    fn test_equal_and_unequal_conflict() {
        let mut cmp = Comparisons::new();
        cmp.assert_eq(&atom("%a"), &atom("%b"));
        cmp.assert_neq(&atom("%a"), &atom("%b"));
        assert!(!cmp.is_consistent());
    }

    #[test]
    fn test_interval_propagation() {
        let mut cmp = Comparisons::new();
        cmp.assert_leq(&Expr::Const(3), &atom("%a"));
        cmp.assert_leq(&atom("%a"), &atom("%b"));
        assert_eq!(cmp.int_range(&atom("%b")).0, Some(3));
        cmp.assert_leq(&atom("%b"), &Expr::Const(10));
        assert_eq!(cmp.int_range(&atom("%a")), (Some(3), Some(10)));
    }

    #[test]
    fn test_point_interval_collapses_to_constant() {
        let mut cmp = Comparisons::new();
        cmp.assert_leq(&Expr::Const(5), &atom("%a"));
        cmp.assert_leq(&atom("%a"), &Expr::Const(5));
        assert!(cmp.eq(&atom("%a"), &Expr::Const(5)));
    }

    #[test]
    fn test_neq_tightens_bounds() {
        let mut cmp = Comparisons::new();
        cmp.assert_leq(&Expr::Const(0), &atom("%a"));
        cmp.assert_leq(&atom("%a"), &Expr::Const(1));
        cmp.assert_neq(&atom("%a"), &Expr::Const(0));
        assert!(cmp.eq(&atom("%a"), &Expr::Const(1)));
    }

    #[test]
    fn test_constants_order_themselves() {
        let mut cmp = Comparisons::new();
        assert!(cmp.leq(&Expr::Const(2), &Expr::Const(7)));
        assert!(cmp.neq(&Expr::Const(2), &Expr::Const(7)));
        assert!(!cmp.leq(&Expr::Const(7), &Expr::Const(2)));
    }

    #[test]
    fn test_assert_nonzero_product() {
        let mut state = PredicatedState::new();
        let product = Expr::binary(BinaryOp::Mul, atom("%a"), atom("%b"));
        state.assert_nonzero(&product);
        assert!(state.comparisons().neq(&atom("%a"), &Expr::Const(0)));
        assert!(state.comparisons().neq(&atom("%b"), &Expr::Const(0)));
    }

    #[test]
    fn test_assert_nonzero_of_leq_condition() {
        // branching on (a <= b) != 0 teaches a <= b
        let mut state = PredicatedState::new();
        let cond = Expr::binary(BinaryOp::Leq, atom("%a"), atom("%b"));
        state.assert_nonzero(&cond);
        assert!(state.comparisons().leq(&atom("%a"), &atom("%b")));
    }

    #[test]
    fn test_assert_zero_of_leq_condition() {
        // the false arm of (a <= b) teaches b < a
        let mut state = PredicatedState::new();
        let cond = Expr::binary(BinaryOp::Leq, atom("%a"), atom("%b"));
        state.assert_zero(&cond);
        assert!(state.comparisons().leq(&atom("%b"), &atom("%a")));
        assert!(state.comparisons().neq(&atom("%a"), &atom("%b")));
    }

    #[test]
    fn test_simplify_comparison_under_facts() {
        let mut state = PredicatedState::new();
        state.comparisons().assert_leq(&atom("%a"), &atom("%b"));
        let cond = Expr::binary(BinaryOp::Leq, atom("%a"), atom("%b"));
        assert_eq!(state.simplify(&cond), Expr::Const(1));
    }

    #[test]
    fn test_simplify_mod_range() {
        // with b > 0, a % b lands in [0, b)
        let mut state = PredicatedState::new();
        state
            .comparisons()
            .assert_leq(&Expr::Const(1), &atom("%b"));
        let modulo = Expr::binary(BinaryOp::Mod, atom("%a"), atom("%b"));
        let rep = state.simplify(&modulo);
        let (lo, _) = state.comparisons().int_range(&rep);
        assert_eq!(lo, Some(0));
    }

    #[test]
    fn test_contradictory_branch_is_inconsistent() {
        let mut state = PredicatedState::new();
        let cond = Expr::binary(BinaryOp::Lt, atom("%a"), atom("%a"));
        // a < a folds to 0; asserting it nonzero is a contradiction
        state.assert_nonzero(&cond);
        assert!(!state.is_consistent());
    }

    #[test]
    fn test_clone_is_independent() {
        let mut state = PredicatedState::new();
        state.comparisons().assert_leq(&atom("%a"), &atom("%b"));
        let mut copy = state.clone();
        copy.comparisons().assert_neq(&atom("%a"), &atom("%a"));
        assert!(!copy.is_consistent());
        assert!(state.is_consistent());
    }
}
