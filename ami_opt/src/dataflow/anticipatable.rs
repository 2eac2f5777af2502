//! Anticipatable expression analysis
//!
//! L.T. Simpson. 1996.
//!     "Value-Driven Redundancy Elimination", Figs. 6.3 and 7.1.
//!     PhD Thesis, Rice University.
//!
//! Backward flow with intersection over successors. The altered set of a
//! block holds the expressions whose value depends, transitively, on a
//! value first defined there; those cannot be hoisted past the block.

use super::{polish_list, AvailAnalysis, ExprSet};
use crate::expr::Expr;
use crate::gvn::ValueTable;
use ami_common::AmiResult;
use ami_ir::{Cfg, InstructionKind};
use hashbrown::HashMap;

#[derive(Debug, Clone, Default)]
pub struct AntAnalysis {
    block_in: HashMap<String, ExprSet>,
    block_out: HashMap<String, ExprSet>,
    instr_alt: HashMap<(String, usize), ExprSet>,
    block_alt: HashMap<String, ExprSet>,
}

impl AntAnalysis {
    pub fn compute(cfg: &Cfg, table: &ValueTable) -> AmiResult<AntAnalysis> {
        let mut ant = AntAnalysis::default();
        let order = cfg.postorder();

        // dependency sets: which value numbers feed which expression
        let mut deps: HashMap<Expr, ExprSet> = HashMap::new();
        for label in &order {
            let block = cfg.block(label)?;
            for instruction in &block.instructions {
                let Some(dst) = instruction.def() else {
                    continue;
                };
                let value = table.get(dst);
                let entry = deps.entry(value).or_default();
                match &instruction.kind {
                    InstructionKind::Phi { args, .. } => {
                        for (operand, _) in args {
                            entry.insert(table.operand(operand));
                        }
                    }
                    InstructionKind::Binary { lhs, rhs, .. } => {
                        entry.insert(table.operand(lhs));
                        entry.insert(table.operand(rhs));
                    }
                    _ => {}
                }
            }
        }

        // altered sets: transitive dependants of each definition
        for label in &order {
            let block = cfg.block(label)?;
            for (i, instruction) in block.instructions.iter().enumerate() {
                let key = (label.clone(), i);
                let Some(dst) = instruction.def() else {
                    ant.instr_alt.insert(key, ExprSet::new());
                    continue;
                };
                let value = table.get(dst);
                let mut altered = ExprSet::new();
                let mut grew = true;
                while grew {
                    grew = false;
                    for (expr, feeding) in &deps {
                        if altered.contains(expr) {
                            continue;
                        }
                        if feeding.contains(&value)
                            || feeding.intersection(&altered).next().is_some()
                        {
                            altered.insert(expr.clone());
                            grew = true;
                        }
                    }
                }
                ant.instr_alt.insert(key, altered);
            }
            let union: ExprSet = (0..block.len())
                .flat_map(|i| ant.instr_alt[&(label.clone(), i)].iter().cloned())
                .collect();
            ant.block_alt.insert(label.clone(), union);
        }

        // backward flow to the fixpoint
        let mut instr_in: HashMap<(String, usize), ExprSet> = HashMap::new();
        let mut instr_out: HashMap<(String, usize), ExprSet> = HashMap::new();
        let mut flowing = true;
        while flowing {
            log::debug!("anticipatable: running flow analysis");
            flowing = false;
            for label in &order {
                let block = cfg.block(label)?;
                let last = block.len() - 1;

                let children: Vec<&str> = block.child_set().into_iter().collect();
                let mut outgoing: Option<ExprSet> = None;
                for child in &children {
                    let set = ant.block_in.get(*child).cloned().unwrap_or_default();
                    outgoing = Some(match outgoing {
                        None => set,
                        Some(seen) => seen.intersection(&set).cloned().collect(),
                    });
                }
                let mut current = outgoing.unwrap_or_default();

                for i in (0..=last).rev() {
                    let key = (label.clone(), i);
                    if instr_out.get(&key) != Some(&current) {
                        flowing = true;
                        instr_out.insert(key.clone(), current.clone());
                    }
                    if let Some(dst) = block.instructions[i].def() {
                        current.insert(table.get(dst));
                    }
                    current = current
                        .difference(&ant.instr_alt[&key])
                        .cloned()
                        .collect();
                    if instr_in.get(&key) != Some(&current) {
                        flowing = true;
                        instr_in.insert(key, current.clone());
                    }
                }

                ant.block_in.insert(label.clone(), current);
                ant.block_out
                    .insert(label.clone(), instr_out[&(label.clone(), last)].clone());
            }
        }
        Ok(ant)
    }

    pub fn ant_in(&self, block: &str) -> ExprSet {
        self.block_in.get(block).cloned().unwrap_or_default()
    }

    pub fn ant_out(&self, block: &str) -> ExprSet {
        self.block_out.get(block).cloned().unwrap_or_default()
    }

    /// Expressions that cannot move up past this block.
    pub fn altered(&self, block: &str) -> ExprSet {
        self.block_alt.get(block).cloned().unwrap_or_default()
    }

    /// The expressions whose computation on the edge `block -> child`
    /// would be the first on some entry path:
    /// `(ant_in[C] - av_out[B] - ant_out[B]) + ((ant_in[C] - av_out[B]) & alt[B])`.
    pub fn earliest(&self, avail: &AvailAnalysis, block: &str, child: &str) -> ExprSet {
        let mut early = self.ant_in(child);
        for gone in avail.avail_out(block) {
            early.remove(&gone);
        }
        let altered = self.altered(block);
        let ant_out = self.ant_out(block);
        early
            .iter()
            .filter(|e| altered.contains(*e) || !ant_out.contains(*e))
            .cloned()
            .collect()
    }

    /// Mirror the sets into metadata as Polish-encoded lists.
    pub fn annotate(&self, cfg: &mut Cfg) {
        let labels = cfg.postorder();
        for label in labels {
            let block_in = polish_list(&self.ant_in(&label));
            let block_out = polish_list(&self.ant_out(&label));
            let altered = polish_list(&self.altered(&label));
            let block = cfg.get_mut(&label).expect("postorder stays in the CFG");
            block.meta.set("anticipatable/in", block_in);
            block.meta.set("anticipatable/out", block_out);
            block.meta.set("anticipatable/alt", altered);
        }
    }
}
