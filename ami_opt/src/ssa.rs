//! SSA construction via Cytron-Ferrante
//!
//! R. Cytron, J. Ferrante, B.K. Rosen, M.N. Wegman, F.K. Zadeck. 1991.
//!     "Efficiently computing static single assignment form and the
//!     control dependence graph"
//!     ACM Transactions on Programming Languages and Systems 13(4), 451-490.
//!
//! Phi nodes are placed on the iterated dominance frontier of each
//! multiply-defined register (restricted to blocks where it is live-in),
//! then a DFS of the dominator tree renames redefinitions with fresh
//! suffixed registers and substitutes every use with its innermost
//! dominating definition.

use crate::manager::{PassManager, Preserved};
use ami_common::{AmiError, AmiResult};
use ami_ir::{Cfg, Instruction, InstructionKind, Operand};
use hashbrown::{HashMap, HashSet};
use std::collections::BTreeMap;

pub const ID: &str = "ssa";

pub fn run(cfg: &mut Cfg, mgr: &mut PassManager) -> AmiResult<Preserved> {
    let domtree = mgr.domtree(cfg)?;
    let djgraph = mgr.djgraph(cfg)?;
    let defs = mgr.defs(cfg)?;
    let live = mgr.live(cfg)?;

    // registers needing renaming, and where their phis go
    let mut idf: BTreeMap<String, HashSet<String>> = BTreeMap::new();
    let mut names: HashSet<String> = HashSet::new();
    for register in defs.registers() {
        names.insert(register.to_string());
        if defs.sites(register).len() > 1 {
            let blocks: Vec<&str> = defs.blocks(register);
            let frontier = djgraph.iterated_dominance_frontier(&blocks, 0);
            idf.insert(register.to_string(), frontier.into_iter().collect());
        }
    }

    let mut state = Renamer {
        counters: idf.keys().map(|v| (v.clone(), 0usize)).collect(),
        names,
        memo: HashMap::new(),
        changed: false,
    };

    // DFS the dominator tree: insert phis, rename defs, substitute uses
    let mut stack: Vec<String> = vec![cfg.entry_label().to_string()];
    while let Some(label) = stack.pop() {
        let parents: Vec<String> = cfg.block(&label)?.parents().map(String::from).collect();
        let live_in: HashSet<String> = live.live_in(&label).map(String::from).collect();

        let mut phis: Vec<Instruction> = Vec::new();
        for (register, frontier) in &idf {
            if frontier.contains(&label) && live_in.contains(register) {
                let args: Vec<(Operand, String)> = parents
                    .iter()
                    .map(|p| (Operand::reg(register.clone()), p.clone()))
                    .collect();
                phis.push(Instruction::phi(register.clone(), args));
            }
        }
        if !phis.is_empty() {
            state.changed = true;
            let block = cfg.block_mut(&label)?;
            for phi in phis.into_iter().rev() {
                block.instructions.insert(0, phi);
            }
        }

        let idom = domtree.idom(&label).map(String::from);
        let entry = cfg.entry_label().to_string();
        let block = cfg.block_mut(&label)?;
        for index in 0..block.instructions.len() {
            let instruction = &mut block.instructions[index];
            // phi arguments are repaired afterwards with predecessor-exit
            // names
            let mut failure: Option<AmiError> = None;
            instruction.map_operands(|operand| {
                if let Operand::Reg(name) = operand {
                    match state.dominating(name, &label, idom.as_deref(), &entry, &domtree, index) {
                        Ok(dominating) => *operand = Operand::Reg(dominating),
                        Err(error) => failure = Some(error),
                    }
                }
            });
            if let Some(error) = failure {
                return Err(error);
            }
            if let Some(dst) = instruction.def().map(String::from) {
                let fresh = state.fresh(&dst);
                state
                    .memo
                    .entry(label.clone())
                    .or_default()
                    .insert(dst, fresh.clone());
                instruction.set_def(fresh);
            }
        }

        for child in domtree.children(&label) {
            stack.push(child.clone());
        }
    }

    // repair phi arguments with the dominating name at each predecessor's
    // exit, copying through a mov when that name is shadowed by an earlier
    // definition in this block
    let labels: Vec<String> = cfg.postorder();
    for label in labels {
        let mut assigned: HashSet<String> = HashSet::new();
        let mut repairs: Vec<(usize, Vec<(Operand, String)>)> = Vec::new();
        let mut copies: Vec<(String, Instruction)> = Vec::new();
        let block = cfg.block(&label)?;
        for (index, instruction) in block.instructions.iter().enumerate() {
            if let InstructionKind::Phi { args, .. } = &instruction.kind {
                let mut rewritten = Vec::with_capacity(args.len());
                for (value, from) in args {
                    let value = match value {
                        Operand::Reg(name) => {
                            let entry = cfg.entry_label().to_string();
                            let dominating = state.dominating(
                                name,
                                from,
                                domtree.idom(from).map(String::from).as_deref(),
                                &entry,
                                &domtree,
                                index,
                            )?;
                            if assigned.contains(&dominating) {
                                // shadowed; copy the intended value in the
                                // predecessor
                                let fresh = state.fresh_forced(name);
                                copies.push((
                                    from.clone(),
                                    Instruction::mov(fresh.clone(), Operand::Reg(dominating)),
                                ));
                                Operand::Reg(fresh)
                            } else {
                                Operand::Reg(dominating)
                            }
                        }
                        constant => constant.clone(),
                    };
                    rewritten.push((value, from.clone()));
                }
                repairs.push((index, rewritten));
            }
            if let Some(dst) = instruction.def() {
                assigned.insert(dst.to_string());
            }
        }
        for (index, args) in repairs {
            let block = cfg.block_mut(&label)?;
            if let InstructionKind::Phi { args: slot, .. } = &mut block.instructions[index].kind {
                *slot = args;
            }
        }
        for (parent, copy) in copies {
            state.changed = true;
            cfg.block_mut(&parent)?.insert_before_terminator(copy);
        }
    }

    if state.changed {
        Ok(Preserved::only(&[ID, "domtree", "djgraph"]))
    } else {
        Ok(Preserved::all())
    }
}

struct Renamer {
    counters: HashMap<String, usize>,
    names: HashSet<String>,
    // block -> original register -> dominating name at block exit
    memo: HashMap<String, HashMap<String, String>>,
    changed: bool,
}

impl Renamer {
    /// Fresh name for a redefinition; single-assignment registers keep
    /// their name.
    fn fresh(&mut self, register: &str) -> String {
        if !self.counters.contains_key(register) {
            return register.to_string();
        }
        self.fresh_forced(register)
    }

    fn fresh_forced(&mut self, register: &str) -> String {
        self.changed = true;
        let counter = self.counters.entry(register.to_string()).or_insert(0);
        loop {
            let candidate = format!("{}.{}", register, counter);
            *counter += 1;
            if self.names.insert(candidate.clone()) {
                return candidate;
            }
        }
    }

    /// The dominating name for `register` at `block`, walking up the
    /// dominator tree and memoising on the way down.
    fn dominating(
        &mut self,
        register: &str,
        block: &str,
        idom: Option<&str>,
        entry: &str,
        domtree: &crate::analysis::DomTree,
        index: usize,
    ) -> AmiResult<String> {
        if let Some(hit) = self.memo.get(block).and_then(|m| m.get(register)) {
            return Ok(hit.clone());
        }
        if block == entry {
            return Err(AmiError::opt(
                block,
                index,
                format!("{} has no dominating definition", register),
            ));
        }
        let Some(idom) = idom else {
            return Err(AmiError::opt(
                block,
                index,
                format!("{} used in unreachable block", register),
            ));
        };
        let above = domtree.idom(idom).map(String::from);
        let name = self.dominating(register, idom, above.as_deref(), entry, domtree, index)?;
        self.memo
            .entry(block.to_string())
            .or_default()
            .insert(register.to_string(), name.clone());
        Ok(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn ssa(source: &str) -> Cfg {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        run(&mut cfg, &mut mgr).unwrap();
        cfg.verify().unwrap();
        cfg
    }

    fn count_phis(cfg: &Cfg, label: &str) -> usize {
        cfg.get(label)
            .unwrap()
            .instructions
            .iter()
            .filter(|i| i.is_phi())
            .count()
    }

    fn single_assignment(cfg: &Cfg) -> bool {
        let mut seen = HashSet::new();
        for block in cfg.blocks() {
            for instruction in &block.instructions {
                if let Some(dst) = instruction.def() {
                    if !seen.insert(dst.to_string()) {
                        return false;
                    }
                }
            }
        }
        true
    }

    #[test]
    fn test_fibonacci_gets_three_loop_phis() {
        let cfg = ssa(
            "@entry: read %n\n\
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
             exit\n",
        );
        assert_eq!(count_phis(&cfg, "@loop"), 3);
        assert_eq!(count_phis(&cfg, "@body"), 0);
        assert!(single_assignment(&cfg));
    }

    #[test]
    fn test_diamond_join_phi() {
        let cfg = ssa(
            "@e: read %c\n\
             branch %c ? @t : @f\n\
             @t: %x = 1\n\
             goto @j\n\
             @f: %x = 2\n\
             goto @j\n\
             @j: write %x\n\
             exit\n",
        );
        assert_eq!(count_phis(&cfg, "@j"), 1);
        assert!(single_assignment(&cfg));
    }

    #[test]
    fn test_no_phi_for_dead_variable() {
        // %x is redefined on both arms but never used at the join
        let cfg = ssa(
            "@e: read %c\n\
             branch %c ? @t : @f\n\
             @t: %x = 1\n\
             write %x\n\
             goto @j\n\
             @f: %x = 2\n\
             write %x\n\
             goto @j\n\
             @j: exit\n",
        );
        assert_eq!(count_phis(&cfg, "@j"), 0);
        assert!(single_assignment(&cfg));
    }

    #[test]
    fn test_single_assignment_untouched() {
        let source = "@a: read %x\n\
                      %y = %x + 1\n\
                      write %y\n\
                      exit\n";
        let cfg = ssa(source);
        let original = CfgBuilder::default().build(source).unwrap();
        assert_eq!(cfg, original);
    }

    #[test]
    fn test_execution_is_preserved() {
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
        let after = ssa(source);
        assert_eq!(
            ami_interpreter::execute(&before, &[10]).unwrap(),
            ami_interpreter::execute(&after, &[10]).unwrap()
        );
    }
}
