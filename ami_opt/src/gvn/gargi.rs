//! Predicated global value numbering
//!
//! K. Gargi. 2002.
//!     "A Sparse Algorithm for Predicated Global Value Numbering"
//!     PLDI'02, 45-56.
//!
//! Maintains a reachability subgraph of the CFG and a DJ-graph over it,
//! both grown incrementally as branches are proved reachable. A priority
//! queue keyed by reverse-postorder position replays "touched" work items:
//! touching a block refreshes its predicate from its dominator, touching a
//! branch decides the reachability of each successor by conjoining the
//! predicate with the branch condition, and touching a definition
//! recomputes its value number under the block predicate and re-touches
//! its uses. Blocks never reached are deleted afterwards.

use super::ValueTable;
use crate::analysis::DjGraph;
use crate::expr::{Expr, ExprOp};
use crate::manager::{PassManager, Preserved};
use crate::predicates::PredicatedState;
use ami_common::AmiResult;
use ami_ir::{Cfg, InstructionKind, Operand};
use hashbrown::{HashMap, HashSet};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap};

pub const ID: &str = "gargi-gvn";

pub fn run(cfg: &mut Cfg, mgr: &mut PassManager) -> AmiResult<Preserved> {
    mgr.require_ssa(cfg)?;

    let mut gvn = Gargi::prepare(cfg);
    gvn.solve(cfg)?;

    // eliminate blocks never proved reachable
    let unreachable: Vec<String> = cfg
        .labels()
        .filter(|l| !gvn.reach_parents.contains_key(*l))
        .map(String::from)
        .collect();
    let changed = !unreachable.is_empty();
    for label in unreachable {
        log::debug!("gargi-gvn: {} is unreachable", label);
        cfg.remove_block(&label)?;
    }
    if changed {
        cfg.tidy()?;
    }

    let mut table = ValueTable::default();
    for (register, value) in gvn.vn {
        table.insert(register, value);
    }
    table.annotate(cfg, ID);
    mgr.cache_gvn(ID, super::Numbering::Expr, table);

    if changed {
        Ok(Preserved::only(&["ssa", ID]))
    } else {
        Ok(Preserved::all())
    }
}

/// Work item: instruction index, or the block itself (ordered first).
type Slot = i64;
const BLOCK_SLOT: Slot = -1;

struct Gargi {
    entry: String,
    rpo_num: HashMap<String, usize>,
    rpo: Vec<String>,
    rpo_reg: HashMap<String, usize>,

    // reachability subgraph and its incrementally maintained DJ-graph
    reach_parents: HashMap<String, BTreeSet<String>>,
    reach_children: HashMap<String, BTreeSet<String>>,
    dj: DjGraph,

    touched: BinaryHeap<Reverse<(usize, Slot)>>,
    touchset: HashSet<(usize, Slot)>,

    use_sites: HashMap<String, BTreeSet<(String, usize)>>,
    // (predecessor, block) -> phi instruction index and incoming operand
    phivar: HashMap<(String, String), Vec<(usize, Operand)>>,

    vn: HashMap<String, Expr>,
    block_predicate: HashMap<String, PredicatedState>,
    edge_predicate: HashMap<(String, String), PredicatedState>,
    block_supp: HashMap<String, BTreeSet<Expr>>,
    edge_supp: HashMap<(String, String), BTreeSet<Expr>>,

    // phi argument states per (target, predecessor), and representatives
    // for phi nodes identified by their (value, condition) argument lists
    phi: HashMap<String, HashMap<String, (PredicatedState, Expr)>>,
    phi_rep: HashMap<Vec<(Expr, Expr)>, Expr>,
}

impl Gargi {
    fn prepare(cfg: &Cfg) -> Gargi {
        let entry = cfg.entry_label().to_string();
        let mut gvn = Gargi {
            entry: entry.clone(),
            rpo_num: HashMap::new(),
            rpo: Vec::new(),
            rpo_reg: HashMap::new(),
            reach_parents: HashMap::new(),
            reach_children: HashMap::new(),
            dj: DjGraph::rooted(&entry),
            touched: BinaryHeap::new(),
            touchset: HashSet::new(),
            use_sites: HashMap::new(),
            phivar: HashMap::new(),
            vn: HashMap::new(),
            block_predicate: HashMap::new(),
            edge_predicate: HashMap::new(),
            block_supp: HashMap::new(),
            edge_supp: HashMap::new(),
            phi: HashMap::new(),
            phi_rep: HashMap::new(),
        };
        gvn.reach_parents.insert(entry.clone(), BTreeSet::new());
        gvn.reach_children.insert(entry, BTreeSet::new());

        for label in cfg.reverse_postorder() {
            gvn.rpo_num.insert(label.clone(), gvn.rpo.len());
            gvn.rpo.push(label.clone());
            let block = cfg.get(&label).expect("reverse postorder stays in CFG");
            for (i, instruction) in block.instructions.iter().enumerate() {
                if let Some(dst) = instruction.def() {
                    gvn.rpo_reg.insert(dst.to_string(), gvn.rpo_reg.len());
                }
                if let InstructionKind::Phi { args, .. } = &instruction.kind {
                    for (value, from) in args {
                        gvn.phivar
                            .entry((from.clone(), label.clone()))
                            .or_default()
                            .push((i, value.clone()));
                    }
                }
                for operand in instruction.operands() {
                    if let Some(reg) = operand.as_reg() {
                        gvn.use_sites
                            .entry(reg.to_string())
                            .or_default()
                            .insert((label.clone(), i));
                    }
                }
            }
        }
        gvn
    }

    fn solve(&mut self, cfg: &Cfg) -> AmiResult<()> {
        self.touch(&self.entry.clone(), BLOCK_SLOT);
        let entry_len = cfg.block(&self.entry)?.len();
        for i in 0..entry_len {
            self.touch(&self.entry.clone(), i as Slot);
        }

        while let Some(Reverse((rpo, slot))) = self.touched.pop() {
            self.touchset.remove(&(rpo, slot));
            let label = self.rpo[rpo].clone();
            if !self.reach_parents.contains_key(&label) {
                continue;
            }
            if slot == BLOCK_SLOT {
                self.refresh_block_predicate(cfg, &label)?;
            } else {
                self.wipe_instruction(cfg, &label, slot as usize)?;
            }
        }
        Ok(())
    }

    fn touch(&mut self, label: &str, slot: Slot) {
        let Some(&rpo) = self.rpo_num.get(label) else {
            return;
        };
        if self.touchset.insert((rpo, slot)) {
            log::trace!("gargi-gvn: touching {} at {}", label, slot);
            self.touched.push(Reverse((rpo, slot)));
        }
    }

    fn get_vn(&self, token: &str) -> Expr {
        let leaf = Expr::leaf(token);
        if leaf.as_const().is_some() {
            return leaf;
        }
        self.vn.get(token).cloned().unwrap_or_else(Expr::unknown)
    }

    fn operand_vn(&self, operand: &Operand) -> Expr {
        match operand {
            Operand::Const(value) => Expr::Const(*value),
            Operand::Reg(name) => self.get_vn(name),
        }
    }

    /// The register rewritten as its RPO number, the class-stable spelling
    /// for opaque definitions.
    fn atomic_reg(&self, register: &str) -> Expr {
        Expr::Atom(format!("%{}", self.rpo_reg[register]))
    }

    fn refresh_block_predicate(&mut self, cfg: &Cfg, label: &str) -> AmiResult<()> {
        let parents = self.reach_parents[label].clone();
        if parents.is_empty() || label == self.entry {
            // the entrypoint is reachable unconditionally, back edges into
            // it notwithstanding
            self.block_predicate
                .insert(label.to_string(), PredicatedState::new());
            self.block_supp.insert(label.to_string(), BTreeSet::new());
        } else if parents.len() == 1 {
            let parent = parents.first().expect("length checked").clone();
            log::debug!("gargi-gvn: {} inherits predicate from parent {}", label, parent);
            let key = (parent, label.to_string());
            self.block_predicate.insert(
                label.to_string(),
                self.edge_predicate[&key].clone(),
            );
            self.block_supp
                .insert(label.to_string(), self.edge_supp[&key].clone());
        } else {
            // a join keeps only its dominator's predicate: the true
            // condition is a disjunction we do not track
            let idom = self.dj.idom(label).expect("reachable joins have dominators");
            log::debug!("gargi-gvn: {} inherits predicate from dominator {}", label, idom);
            self.block_predicate.insert(
                label.to_string(),
                self.block_predicate[&idom].clone(),
            );
            self.block_supp
                .insert(label.to_string(), self.block_supp[&idom].clone());
        }

        // the refreshed predicate may change branch reachability
        let last = cfg.block(label)?.len() - 1;
        self.touch(label, last as Slot);
        Ok(())
    }

    fn wipe_instruction(&mut self, cfg: &Cfg, label: &str, index: usize) -> AmiResult<()> {
        let block = cfg.block(label)?;
        let instruction = &block.instructions[index];
        match &instruction.kind {
            InstructionKind::Exit => Ok(()),
            InstructionKind::Goto { target } => {
                let key = (label.to_string(), target.clone());
                self.edge_predicate
                    .insert(key.clone(), self.block_predicate[label].clone());
                self.edge_supp.insert(key, BTreeSet::new());
                self.expand_edges(cfg, label)
            }
            InstructionKind::Branch { cond, if_true, if_false } => {
                let mut predicate = self.block_predicate[label].clone();
                let cond = predicate.simplify(&self.operand_vn(cond));
                self.block_predicate.insert(label.to_string(), predicate);

                let mut if_true_state = self.block_predicate[label].clone();
                if_true_state.assert_nonzero(&cond);
                if if_true_state.is_consistent() {
                    let key = (label.to_string(), if_true.clone());
                    self.edge_predicate.insert(key.clone(), if_true_state);
                    self.edge_supp.insert(key, cond_args(&cond));
                }

                let mut if_false_state = self.block_predicate[label].clone();
                if_false_state.assert_zero(&cond);
                if if_false_state.is_consistent() {
                    let key = (label.to_string(), if_false.clone());
                    self.edge_predicate.insert(key.clone(), if_false_state);
                    self.edge_supp.insert(key, cond_args(&cond));
                }

                self.expand_edges(cfg, label)
            }
            _ => {
                if instruction.is_def() {
                    self.update_value_number(cfg, label, index)?;
                }
                Ok(())
            }
        }
    }

    /// Grow the reachability graph along every edge whose predicate was
    /// just established, and re-evaluate phi arguments flowing over it.
    fn expand_edges(&mut self, cfg: &Cfg, label: &str) -> AmiResult<()> {
        let children: Vec<String> = cfg
            .block(label)?
            .child_set()
            .into_iter()
            .map(String::from)
            .collect();
        for child in children {
            let key = (label.to_string(), child.clone());
            if !self.edge_predicate.contains_key(&key) {
                log::debug!("gargi-gvn: {} unreachable from {}", child, label);
                continue;
            }

            if !self.reach_parents.contains_key(&child) {
                log::debug!("gargi-gvn: discovered block {}", child);
                self.reach_parents.insert(child.clone(), BTreeSet::new());
                self.reach_children.insert(child.clone(), BTreeSet::new());
                self.touch(&child, BLOCK_SLOT);
                for i in 0..cfg.block(&child)?.len() {
                    self.touch(&child, i as Slot);
                }
            }
            if !self.reach_children[label].contains(&child) {
                self.reach_children
                    .get_mut(label)
                    .expect("source is reachable")
                    .insert(child.clone());
                self.reach_parents
                    .get_mut(&child)
                    .expect("inserted above")
                    .insert(label.to_string());
                self.dj.insert_edge(label, &child);
            }

            // phi arguments entering the child along this edge
            let dom = self
                .dj
                .idom(&child)
                .unwrap_or_else(|| self.entry.clone());
            for (index, incoming) in self.phivar.get(&key).cloned().unwrap_or_default() {
                let mut support = self.cond_support(label, &dom);
                support.extend(self.edge_supp[&key].iter().cloned());
                let mut predicate = self.edge_predicate[&key].clone();
                // facts about the incoming value feed the path summary
                predicate.simplify(&self.operand_vn(&incoming));
                let summary = predicate.summary(&support);
                let target = cfg.block(&child)?.instructions[index]
                    .def()
                    .expect("phi defines")
                    .to_string();
                let known = self
                    .phi
                    .get(&target)
                    .and_then(|m| m.get(label))
                    .map(|(_, cond)| cond.clone());
                if known.as_ref() != Some(&summary) {
                    log::debug!(
                        "gargi-gvn: phi argument state for {} via {} updated",
                        target,
                        label
                    );
                    self.phi
                        .entry(target)
                        .or_default()
                        .insert(label.to_string(), (predicate, summary));
                    self.touch(&child, index as Slot);
                }
            }
        }
        Ok(())
    }

    /// Collect the support expressions of the conditions taken between a
    /// dominator and a block.
    fn cond_support(&mut self, from: &str, dominator: &str) -> BTreeSet<Expr> {
        if from == dominator || from == self.entry {
            return BTreeSet::new();
        }
        let parents = self.reach_parents[from].clone();
        if parents.len() == 1 {
            let parent = parents.first().expect("length checked").clone();
            let mut support = self.cond_support(&parent, dominator);
            if let Some(supp) = self.edge_supp.get(&(parent, from.to_string())) {
                support.extend(supp.iter().cloned());
            }
            return support;
        }
        match self.dj.idom(from) {
            Some(idom) => self.cond_support(&idom, dominator),
            None => BTreeSet::new(),
        }
    }

    fn update_value_number(&mut self, cfg: &Cfg, label: &str, index: usize) -> AmiResult<()> {
        let block = cfg.block(label)?;
        let instruction = &block.instructions[index];
        let dst = instruction.def().expect("caller checked").to_string();

        let value = match &instruction.kind {
            InstructionKind::Binary { op, lhs, rhs, .. } => {
                let expr = Expr::binary(*op, self.operand_vn(lhs), self.operand_vn(rhs));
                let mut state = self
                    .block_predicate
                    .get(label)
                    .cloned()
                    .unwrap_or_default();
                let value = state.simplify(&expr);
                self.block_predicate.insert(label.to_string(), state);
                value
            }
            InstructionKind::Mov { src, .. } => self.operand_vn(src),
            InstructionKind::Phi { args, .. } => {
                let mut pairs: Vec<(Expr, Expr)> = Vec::new();
                for (value, from) in args {
                    let Some(states) = self.phi.get_mut(&dst) else {
                        continue;
                    };
                    // predecessors not yet reachable contribute nothing
                    let Some((state, condition)) = states.get_mut(from) else {
                        continue;
                    };
                    let value = match value {
                        Operand::Const(c) => Expr::Const(*c),
                        Operand::Reg(name) => self
                            .vn
                            .get(name)
                            .cloned()
                            .unwrap_or_else(Expr::unknown),
                    };
                    pairs.push((state.simplify(&value), condition.clone()));
                }
                pairs.sort();
                if let Some(rep) = self.phi_rep.get(&pairs) {
                    rep.clone()
                } else {
                    let mut parts = vec![self.atomic_reg(&dst)];
                    for (value, condition) in &pairs {
                        parts.push(value.clone());
                        parts.push(condition.clone());
                    }
                    let expr = Expr::node(ExprOp::Phi, parts);
                    self.phi_rep.insert(pairs, expr.clone());
                    expr
                }
            }
            InstructionKind::Read { .. } => self.atomic_reg(&dst),
            _ => return Ok(()),
        };

        if self.get_vn(&dst) == value {
            return Ok(());
        }
        log::debug!("gargi-gvn: value number of {} updated to {}", dst, value);
        self.vn.insert(dst.clone(), value);
        for (block, index) in self.use_sites.get(&dst).cloned().unwrap_or_default() {
            self.touch(&block, index as Slot);
        }
        Ok(())
    }
}

/// Arguments of a condition, as the predicate system decomposes it.
fn cond_args(cond: &Expr) -> BTreeSet<Expr> {
    match cond {
        Expr::Node(op, args) if op.is_comparison() => cond_args(&args[1]),
        Expr::Node(ExprOp::Phi, _) => BTreeSet::from([cond.clone()]),
        Expr::Node(_, args) => args.iter().cloned().collect(),
        leaf => BTreeSet::from([leaf.clone()]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn run_on(source: &str) -> (Cfg, ValueTable) {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        run(&mut cfg, &mut mgr).unwrap();
        cfg.verify().unwrap();
        let table = mgr.cached_gvn(ID).expect("table cached by the pass");
        (cfg, (*table).clone())
    }

    #[test]
    fn test_constant_branch_prunes_arm() {
        let (cfg, _) = run_on(
            "@e: branch 0 ? @t : @f\n\
             @t: write 1\n\
             exit\n\
             @f: write 2\n\
             exit\n",
        );
        assert!(!cfg.contains("@t"));
        assert!(cfg.contains("@f"));
    }

    #[test]
    fn test_phi_of_identical_constants_collapses() {
        let (_, table) = run_on(
            "@e: read %c\n\
             branch %c ? @a : @b\n\
             @a: %x = 5\n\
             goto @j\n\
             @b: %y = 5\n\
             goto @j\n\
             @j: %z = phi [ %x, @a ], [ %y, @b ]\n\
             write %z\n\
             exit\n",
        );
        assert_eq!(table.get("%z"), Expr::Const(5));
    }

    #[test]
    fn test_branch_condition_refines_values() {
        // inside the true arm of %c = (%a == 0), %a is known to be zero
        let (_, table) = run_on(
            "@e: read %a\n\
             %c = %a == 0\n\
             branch %c ? @zero : @other\n\
             @zero: %b = %a + 1\n\
             write %b\n\
             exit\n\
             @other: write %a\n\
             exit\n",
        );
        assert_eq!(table.get("%b"), Expr::Const(1));
    }

    #[test]
    fn test_contradictory_path_removed() {
        // the second test repeats the first, so its false arm is dead
        let (cfg, _) = run_on(
            "@e: read %a\n\
             %c = 0 < %a\n\
             branch %c ? @pos : @end\n\
             @pos: %d = 0 < %a\n\
             branch %d ? @again : @dead\n\
             @again: write 1\n\
             exit\n\
             @dead: write 2\n\
             exit\n\
             @end: exit\n",
        );
        assert!(!cfg.contains("@dead"));
        assert!(cfg.contains("@again"));
    }

    #[test]
    fn test_keeps_interpreting_identically() {
        let source = "@e: read %n\n\
                      %c = %n == 3\n\
                      branch %c ? @yes : @no\n\
                      @yes: %r = %n * 2\n\
                      write %r\n\
                      exit\n\
                      @no: write %n\n\
                      exit\n";
        let before = CfgBuilder::default().build(source).unwrap();
        let (after, _) = run_on(source);
        for input in [3, 7] {
            assert_eq!(
                ami_interpreter::execute(&before, &[input]).unwrap(),
                ami_interpreter::execute(&after, &[input]).unwrap()
            );
        }
    }
}
