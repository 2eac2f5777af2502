//! Value-driven code motion
//!
//! L.T. Simpson. 1996.
//!     "Value-Driven Redundancy Elimination", section 7.1.
//!     PhD Thesis, Rice University.
//!
//! Lazy code motion over value numbers: lateness flow decides how far each
//! computation can sink, the earliest/later difference yields insertion
//! edges (materialising new blocks on critical edges) and a deletion set,
//! and a dominator-tree walk rewrites every use to the nearest dominating
//! representative of its value class. The result is no longer strict SSA,
//! but every value number keeps a dominated-unique definition.

use crate::analysis::DomTree;
use crate::dataflow::ExprSet;
use crate::expr::{Expr, Recipe};
use crate::gvn::{GvnChoice, ValueTable};
use crate::manager::{PassManager, Preserved};
use ami_common::AmiResult;
use ami_ir::{Cfg, Instruction, InstructionKind, Operand};
use hashbrown::HashMap;
use std::collections::BTreeSet;
use std::rc::Rc;

pub const ID: &str = "vdcm";

pub fn run(cfg: &mut Cfg, mgr: &mut PassManager, gvn: GvnChoice) -> AmiResult<Preserved> {
    let table = mgr.gvn(cfg, gvn)?;
    let avail = mgr.available(cfg, gvn)?;
    let ant = mgr.anticipatable(cfg, gvn)?;

    let order = cfg.reverse_postorder();

    // earliest sets per flow edge
    let mut earliest: HashMap<(String, String), ExprSet> = HashMap::new();
    for label in &order {
        for child in cfg.block(label)?.child_set() {
            let set = ant.earliest(&avail, label, child);
            earliest.insert((label.clone(), child.to_string()), set);
        }
    }

    // block definition and altered sets over value numbers
    let mut defs: HashMap<String, ExprSet> = HashMap::new();
    let mut alts: HashMap<String, ExprSet> = HashMap::new();
    let mut all_exprs: ExprSet = ExprSet::new();
    for label in &order {
        let mut defset = ExprSet::new();
        for instruction in &cfg.block(label)?.instructions {
            if let Some(dst) = instruction.def() {
                let value = table.get(dst);
                all_exprs.insert(value.clone());
                defset.insert(value);
            }
        }
        defs.insert(label.clone(), defset);
        alts.insert(label.clone(), ant.altered(label));
    }

    // lateness flow:
    //   later_in[B] = Intersect(later[P, B] for P preceding B)
    //   later[B, C] = (later_in[B] - alt[B]) + earliest[B, C]
    let mut later_block: HashMap<String, ExprSet> = HashMap::new();
    let mut later_edge: HashMap<(String, String), ExprSet> = HashMap::new();
    let mut flowing = true;
    while flowing {
        log::debug!("vdcm: performing lateness flow analysis");
        flowing = false;
        for label in &order {
            let block = cfg.block(label)?;
            let mut later_in = all_exprs.clone();
            for parent in block.parents() {
                let edge = later_edge
                    .get(&(parent.to_string(), label.clone()))
                    .cloned()
                    .unwrap_or_else(|| all_exprs.clone());
                later_in = later_in.intersection(&edge).cloned().collect();
            }
            if later_block.get(label) != Some(&later_in) {
                flowing = true;
                later_block.insert(label.clone(), later_in.clone());
            }

            let sinkable: ExprSet = defs[label].difference(&alts[label]).cloned().collect();
            for child in block.child_set() {
                let key = (label.clone(), child.to_string());
                let mut out: ExprSet = later_in.difference(&sinkable).cloned().collect();
                out.extend(earliest[&key].iter().cloned());
                if later_edge.get(&key) != Some(&out) {
                    flowing = true;
                    later_edge.insert(key, out);
                }
            }
        }
    }

    // moved expressions are real computations, never constants or phis
    let keep = |expr: &Expr| !expr.is_leaf() && expr.op() != Some(crate::expr::ExprOp::Phi);

    let mut inserts: HashMap<String, ExprSet> = HashMap::new();
    let mut edge_inserts: HashMap<(String, String), ExprSet> = HashMap::new();
    let mut deletes: HashMap<String, ExprSet> = HashMap::new();
    for label in &order {
        let delete: ExprSet = defs[label]
            .difference(&alts[label])
            .filter(|e| !later_block.get(label).is_some_and(|s| s.contains(*e)))
            .filter(|e| keep(e))
            .cloned()
            .collect();
        if !delete.is_empty() {
            log::debug!("vdcm: {} deletes {} expressions", label, delete.len());
        }
        deletes.insert(label.clone(), delete);

        let children: Vec<String> = cfg
            .block(label)?
            .child_set()
            .into_iter()
            .map(String::from)
            .collect();
        if children.is_empty() {
            continue;
        }

        let on_edge = |child: &str| -> ExprSet {
            later_edge
                .get(&(label.clone(), child.to_string()))
                .cloned()
                .unwrap_or_default()
                .difference(&later_block.get(child).cloned().unwrap_or_default())
                .filter(|e| keep(e))
                .cloned()
                .collect()
        };

        let mut shared = on_edge(&children[0]);
        if children.len() > 1 {
            let first: ExprSet = shared
                .intersection(&ant.ant_in(&children[0]))
                .cloned()
                .collect();
            let second: ExprSet = on_edge(&children[1])
                .intersection(&ant.ant_in(&children[1]))
                .cloned()
                .collect();
            shared = first.intersection(&second).cloned().collect();
            edge_inserts.insert(
                (label.clone(), children[0].clone()),
                first.difference(&shared).cloned().collect(),
            );
            edge_inserts.insert(
                (label.clone(), children[1].clone()),
                second.difference(&shared).cloned().collect(),
            );
        }
        let shared: ExprSet = shared
            .intersection(&ant.ant_out(label))
            .cloned()
            .collect();
        inserts.insert(label.clone(), shared);
    }

    // split critical edges that carry insertions
    let mut changed_cfg = false;
    let edge_keys: Vec<(String, String)> = edge_inserts.keys().cloned().collect();
    for key in edge_keys {
        let set = edge_inserts.remove(&key).expect("key from iteration");
        if set.is_empty() {
            continue;
        }
        let fresh = split_edge(cfg, &key.0, &key.1)?;
        log::debug!("vdcm: split {} -> {} through {}", key.0, key.1, fresh);
        inserts.insert(fresh, set);
        changed_cfg = true;
    }

    if changed_cfg {
        mgr.invalidate("domtree");
        mgr.invalidate("djgraph");
    }
    let domtree = mgr.domtree(cfg)?;

    // class representatives, chosen in program order
    let mut state = Motion {
        table: table.clone(),
        rep: HashMap::new(),
        memo: HashMap::new(),
        used: Default::default(),
        fresh: 0,
        changed: false,
    };
    for label in cfg.reverse_postorder() {
        for instruction in &cfg.block(&label)?.instructions {
            if let Some(dst) = instruction.def() {
                state.used.insert(dst.to_string());
                let value = state.table.get(dst);
                if value.as_const().is_none() {
                    state.rep.entry(value).or_insert_with(|| dst.to_string());
                }
            }
        }
    }

    state.rewrite(cfg, &domtree, &inserts, &deletes)?;
    adjust_phis(cfg, &mut state)?;

    match (changed_cfg, state.changed) {
        (true, true) => Ok(Preserved::only(&[ID])),
        (true, false) => Ok(Preserved::only(&[ID, "ssa"])),
        (false, true) => Ok(Preserved::only(&[ID, "domtree", "djgraph"])),
        (false, false) => Ok(Preserved::all()),
    }
}

/// Materialise a block on the edge `parent -> child`.
fn split_edge(cfg: &mut Cfg, parent: &str, child: &str) -> AmiResult<String> {
    let label = cfg.fresh_labels(1, "")[0].clone();
    cfg.create_block(&label)?;

    let terminator = cfg.block(parent)?.terminator().cloned();
    match terminator.map(|t| t.kind) {
        Some(InstructionKind::Branch { cond, if_true, if_false }) if if_true != if_false => {
            let on_true = if_true == child;
            cfg.remove_child(parent, child, false)?;
            cfg.add_child(parent, &label, Some(cond), on_true)?;
        }
        _ => {
            // unconditional, or a conditional with identical arms (which
            // degrades to an unconditional edge)
            cfg.remove_child(parent, child, false)?;
            cfg.add_child(parent, &label, None, false)?;
        }
    }
    cfg.add_child(&label, child, None, false)?;
    cfg.block_mut(child)?.retarget_phi_labels(parent, &label);
    Ok(label)
}

struct Motion {
    table: Rc<ValueTable>,
    rep: HashMap<Expr, String>,
    // block -> value -> dominating definition, if any on this path
    memo: HashMap<String, HashMap<Expr, Option<Operand>>>,
    used: hashbrown::HashSet<String>,
    fresh: usize,
    changed: bool,
}

impl Motion {
    fn rewrite(
        &mut self,
        cfg: &mut Cfg,
        domtree: &DomTree,
        inserts: &HashMap<String, ExprSet>,
        deletes: &HashMap<String, ExprSet>,
    ) -> AmiResult<()> {
        let mut stack = vec![cfg.entry_label().to_string()];
        while let Some(label) = stack.pop() {
            self.rewrite_block(cfg, domtree, &label, inserts, deletes)?;
            for child in domtree.children(&label) {
                stack.push(child.clone());
            }
        }
        Ok(())
    }

    fn rewrite_block(
        &mut self,
        cfg: &mut Cfg,
        domtree: &DomTree,
        label: &str,
        inserts: &HashMap<String, ExprSet>,
        deletes: &HashMap<String, ExprSet>,
    ) -> AmiResult<()> {
        let delete = deletes.get(label).cloned().unwrap_or_default();
        let mut to_delete: Vec<usize> = Vec::new();
        let block_len = cfg.block(label)?.len();
        for index in 0..block_len {
            // substitute operands with dominating class representatives
            let mut substitutions: Vec<(usize, Operand)> = Vec::new();
            {
                let instruction = &cfg.block(label)?.instructions[index];
                if !instruction.is_phi() {
                    for (slot, operand) in instruction.operands().iter().enumerate() {
                        if let Operand::Reg(name) = operand {
                            let value = self.table.get(name);
                            // every definition of a class writes the class
                            // representative, so when no definition
                            // dominates (the value arrives on all paths,
                            // not through the dominator) the representative
                            // still holds it
                            let replacement = self
                                .dominating(&value, label, domtree)
                                .or_else(|| {
                                    self.rep.get(&value).map(|r| Operand::Reg(r.clone()))
                                });
                            if let Some(rep) = replacement {
                                if rep.as_reg() != Some(name.as_str()) {
                                    substitutions.push((slot, rep));
                                }
                            }
                        }
                    }
                }
            }
            if !substitutions.is_empty() {
                self.changed = true;
                let instruction = &mut cfg.block_mut(label)?.instructions[index];
                let mut slot = 0usize;
                instruction.map_operands(|operand| {
                    for (at, with) in &substitutions {
                        if *at == slot {
                            *operand = with.clone();
                        }
                    }
                    slot += 1;
                });
            }

            let Some(dst) = cfg.block(label)?.instructions[index].def().map(String::from) else {
                continue;
            };
            let value = self.table.get(&dst);
            if delete.contains(&value) {
                to_delete.push(index);
                continue;
            }
            match self.dominating(&value, label, domtree) {
                None => {
                    // first definition of this class on the path: it keeps
                    // the class representative's name
                    let rep = self.rep.get(&value).cloned().unwrap_or_else(|| dst.clone());
                    if rep != dst {
                        self.changed = true;
                    }
                    cfg.block_mut(label)?.instructions[index].set_def(rep.clone());
                    self.memo
                        .entry(label.to_string())
                        .or_default()
                        .insert(value, Some(Operand::Reg(rep)));
                }
                Some(_) => {
                    // already computed on every path here
                    to_delete.push(index);
                }
            }
        }

        if !to_delete.is_empty() {
            self.changed = true;
            let block = cfg.block_mut(label)?;
            for index in to_delete.into_iter().rev() {
                block.instructions.remove(index);
            }
        }

        for expr in inserts.get(label).cloned().unwrap_or_default() {
            self.insert_expr(cfg, label, &expr, domtree)?;
        }
        Ok(())
    }

    /// The dominating definition of a value class at a block, memoised
    /// along the dominator tree. Constants dominate everywhere.
    fn dominating(&mut self, value: &Expr, label: &str, domtree: &DomTree) -> Option<Operand> {
        if let Some(c) = value.as_const() {
            return Some(Operand::Const(c));
        }
        if let Some(hit) = self.memo.get(label).and_then(|m| m.get(value)) {
            return hit.clone();
        }
        let result = match domtree.idom(label) {
            None => None,
            Some(idom) => {
                let idom = idom.to_string();
                self.dominating(value, &idom, domtree)
            }
        };
        self.memo
            .entry(label.to_string())
            .or_default()
            .insert(value.clone(), result.clone());
        result
    }

    /// Emit a computation of `expr` at the end of a block, building missing
    /// operands recursively. Returns the operand holding the value.
    fn insert_expr(
        &mut self,
        cfg: &mut Cfg,
        label: &str,
        expr: &Expr,
        domtree: &DomTree,
    ) -> AmiResult<Operand> {
        if let Some(existing) = self.dominating(expr, label, domtree) {
            return Ok(existing);
        }
        self.changed = true;
        match expr.recipe() {
            Recipe::Leaf(operand) => Ok(operand),
            Recipe::Binary(op, lhs, rhs) => {
                let lhs = self.insert_expr(cfg, label, &lhs, domtree)?;
                let rhs = self.insert_expr(cfg, label, &rhs, domtree)?;
                let target = match self.rep.get(expr) {
                    Some(rep) => rep.clone(),
                    None => self.fresh_register(expr),
                };
                log::debug!("vdcm: inserting {} = {} at {}", target, expr, label);
                cfg.block_mut(label)?
                    .insert_before_terminator(Instruction::binary(target.clone(), op, lhs, rhs));
                self.memo
                    .entry(label.to_string())
                    .or_default()
                    .insert(expr.clone(), Some(Operand::Reg(target.clone())));
                Ok(Operand::Reg(target))
            }
        }
    }

    fn fresh_register(&mut self, expr: &Expr) -> String {
        loop {
            let candidate = format!("%.{}", self.fresh);
            self.fresh += 1;
            if self.used.insert(candidate.clone()) {
                self.rep.insert(expr.clone(), candidate.clone());
                return candidate;
            }
        }
    }

    /// A fresh register that does not become its class's representative
    /// (phi-conflict copies live only on one incoming edge).
    fn fresh_copy(&mut self) -> String {
        loop {
            let candidate = format!("%.{}", self.fresh);
            self.fresh += 1;
            if self.used.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

/// Rewrite phi arguments to class representatives, copying through the
/// predecessor when the representative is shadowed by an earlier
/// definition in the phi's own block.
fn adjust_phis(cfg: &mut Cfg, state: &mut Motion) -> AmiResult<()> {
    let labels = cfg.postorder();
    for label in labels {
        let mut assigned: BTreeSet<String> = BTreeSet::new();
        let mut repairs: Vec<(usize, Vec<(Operand, String)>)> = Vec::new();
        let mut copies: Vec<(String, Instruction)> = Vec::new();
        {
            let block = cfg.block(&label)?;
            for (index, instruction) in block.instructions.iter().enumerate() {
                if let InstructionKind::Phi { args, .. } = &instruction.kind {
                    let mut rewritten = Vec::with_capacity(args.len());
                    for (operand, from) in args {
                        let value = state.table.operand(operand);
                        let replacement = match value.as_const() {
                            Some(c) => Operand::Const(c),
                            None => {
                                let rep = state
                                    .rep
                                    .get(&value)
                                    .cloned()
                                    .or_else(|| operand.as_reg().map(String::from))
                                    .expect("phi argument has a representative");
                                if assigned.contains(&rep) {
                                    let fresh = state.fresh_copy();
                                    copies.push((
                                        from.clone(),
                                        Instruction::mov(fresh.clone(), Operand::Reg(rep)),
                                    ));
                                    Operand::Reg(fresh)
                                } else {
                                    Operand::Reg(rep)
                                }
                            }
                        };
                        rewritten.push((replacement, from.clone()));
                    }
                    repairs.push((index, rewritten));
                }
                if let Some(dst) = instruction.def() {
                    assigned.insert(dst.to_string());
                }
            }
        }
        for (index, args) in repairs {
            let block = cfg.block_mut(&label)?;
            if let InstructionKind::Phi { args: slot, .. } = &mut block.instructions[index].kind {
                if *slot != args {
                    state.changed = true;
                    *slot = args;
                }
            }
        }
        for (parent, copy) in copies {
            state.changed = true;
            cfg.block_mut(&parent)?.insert_before_terminator(copy);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::PassSpec;
    use ami_ir::CfgBuilder;

    fn optimise(source: &str) -> Cfg {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        mgr.run(&mut cfg, &"vdcm".parse::<PassSpec>().unwrap()).unwrap();
        cfg.verify().unwrap();
        cfg
    }

    fn count_ops(cfg: &Cfg, pred: impl Fn(&InstructionKind) -> bool) -> usize {
        cfg.blocks()
            .flat_map(|b| b.instructions.iter())
            .filter(|i| pred(&i.kind))
            .count()
    }

    #[test]
    fn test_constant_folding_removes_add() {
        let cfg = optimise("@e: %a = 2 + 3\nwrite %a\nexit\n");
        assert_eq!(
            count_ops(&cfg, |k| matches!(k, InstructionKind::Binary { .. })),
            0
        );
        assert_eq!(ami_interpreter::execute(&cfg, &[]).unwrap(), vec![5]);
    }

    #[test]
    fn test_redundant_computation_collapses() {
        let cfg = optimise(
            "@e: read %x\n\
             read %y\n\
             %a = %x + %y\n\
             %b = %y + %x\n\
             write %a\n\
             write %b\n\
             exit\n",
        );
        assert_eq!(
            count_ops(&cfg, |k| matches!(k, InstructionKind::Binary { .. })),
            1
        );
        assert_eq!(
            ami_interpreter::execute(&cfg, &[4, 9]).unwrap(),
            vec![13, 13]
        );
    }

    #[test]
    fn test_fibonacci_semantics_and_loop_body_size() {
        let source = "@entry: read %n\n\
                      %a = 0\n\
                      %b = 1\n\
                      goto @loop\n\
                      @loop: %cond = %n <= 0\n\
                      branch %cond ? @end : @body\n\
                      @body: %t = %a + %b\n\
                      %a = %b\n\
                      %b = %t\n\
                      %n = %n - 1\n\
                      goto @loop\n\
                      @end: write %a\n\
                      exit\n";
        let before = CfgBuilder::default().build(source).unwrap();
        let after = optimise(source);
        for n in [0, 1, 10] {
            assert_eq!(
                ami_interpreter::execute(&before, &[n]).unwrap(),
                ami_interpreter::execute(&after, &[n]).unwrap()
            );
        }
        // the loop still computes one comparison, one sum and one
        // decrement per iteration
        let count = |cfg: &Cfg| {
            count_ops(cfg, |k| matches!(k, InstructionKind::Binary { .. }))
        };
        assert_eq!(count(&before), count(&after));
    }

    #[test]
    fn test_partial_redundancy_hoisted() {
        // %a + %b is computed on one arm and after the join; motion leaves
        // at most one evaluation per path
        let source = "@e: read %a\n\
                      read %b\n\
                      read %c\n\
                      branch %c ? @t : @f\n\
                      @t: %u = %a + %b\n\
                      write %u\n\
                      goto @j\n\
                      @f: goto @j\n\
                      @j: %v = %a + %b\n\
                      write %v\n\
                      exit\n";
        let before = CfgBuilder::default().build(source).unwrap();
        let after = optimise(source);
        for c in [0, 1] {
            assert_eq!(
                ami_interpreter::execute(&before, &[2, 3, c]).unwrap(),
                ami_interpreter::execute(&after, &[2, 3, c]).unwrap()
            );
        }
    }

    #[test]
    fn test_write_observable_sequence_preserved() {
        let source = "@e: read %n\n\
                      %d = %n * %n\n\
                      write %d\n\
                      %e = %n * %n\n\
                      write %e\n\
                      exit\n";
        let before = CfgBuilder::default().build(source).unwrap();
        let after = optimise(source);
        assert_eq!(
            ami_interpreter::execute(&before, &[7]).unwrap(),
            ami_interpreter::execute(&after, &[7]).unwrap()
        );
    }
}
