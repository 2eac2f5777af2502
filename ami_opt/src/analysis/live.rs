//! Liveness analysis
//!
//! Backward flow over blocks and instructions. Phi operands do not count
//! as ordinary uses: the liveness of a phi argument is conditional on
//! entering through its predecessor, so each block/instruction carries a
//! per-predecessor conditional live-in set next to the unconditional one.

use ami_common::{AmiError, AmiResult};
use ami_ir::{Cfg, Instruction, InstructionKind};
use hashbrown::HashMap;
use std::collections::BTreeSet;

type RegSet = BTreeSet<String>;

#[derive(Debug, Clone, Default)]
pub struct LiveAnalysis {
    block_in: HashMap<String, RegSet>,
    block_out: HashMap<String, RegSet>,
    instr_in: HashMap<(String, usize), RegSet>,
    instr_out: HashMap<(String, usize), RegSet>,
    // (block, index) -> predecessor label -> conditionally live registers
    phi_in: HashMap<(String, usize), HashMap<String, RegSet>>,
    phi_in_block: HashMap<String, HashMap<String, RegSet>>,
    max_pressure: usize,
}

impl LiveAnalysis {
    pub fn compute(cfg: &Cfg) -> AmiResult<LiveAnalysis> {
        let mut live = LiveAnalysis::default();
        let order = cfg.postorder();

        // conditional live-in sets need no propagation
        for label in &order {
            let block = cfg.block(label)?;
            let mut pending: HashMap<String, RegSet> = block
                .parents()
                .map(|p| (p.to_string(), RegSet::new()))
                .collect();
            for (i, instruction) in block.instructions.iter().enumerate().rev() {
                if let InstructionKind::Phi { args, .. } = &instruction.kind {
                    for (value, from) in args {
                        if let Some(reg) = value.as_reg() {
                            pending
                                .entry(from.clone())
                                .or_default()
                                .insert(reg.to_string());
                        }
                    }
                }
                live.phi_in.insert((label.clone(), i), pending.clone());
            }
            live.phi_in_block.insert(label.clone(), pending);
        }

        let mut changed = true;
        while changed {
            log::debug!("live: running flow analysis");
            changed = false;
            for label in &order {
                let block = cfg.block(label)?;
                let last = block.len() - 1;

                let mut out = RegSet::new();
                for child in block.child_set() {
                    if let Some(set) = live.block_in.get(child) {
                        out.extend(set.iter().cloned());
                    }
                    if let Some(phis) = live.phi_in_block.get(child) {
                        if let Some(cond) = phis.get(label.as_str()) {
                            out.extend(cond.iter().cloned());
                        }
                    }
                }

                for i in (0..=last).rev() {
                    let out_here = if i == last {
                        out.clone()
                    } else {
                        live.instr_in[&(label.clone(), i + 1)].clone()
                    };
                    let (defs, uses) = def_use(&block.instructions[i]);
                    let mut in_here: RegSet =
                        out_here.difference(&defs).cloned().collect();
                    in_here.extend(uses);

                    let key = (label.clone(), i);
                    if live.instr_out.get(&key) != Some(&out_here) {
                        changed = true;
                        live.instr_out.insert(key.clone(), out_here);
                    }
                    if live.instr_in.get(&key) != Some(&in_here) {
                        changed = true;
                        live.instr_in.insert(key, in_here);
                    }
                }

                live.block_in
                    .insert(label.clone(), live.instr_in[&(label.clone(), 0)].clone());
                live.block_out
                    .insert(label.clone(), live.instr_out[&(label.clone(), last)].clone());
            }
        }

        let entry = cfg.entry_label();
        if let Some(set) = live.block_in.get(entry) {
            if !set.is_empty() {
                let list: Vec<&str> = set.iter().map(String::as_str).collect();
                return Err(AmiError::opt(
                    entry,
                    0,
                    format!("uninitialised registers: {}", list.join(", ")),
                ));
            }
        }

        // the maximum simultaneous register pressure bounds any colouring
        for label in &order {
            let block = cfg.block(label)?;
            for i in 0..block.len() {
                let key = (label.clone(), i);
                let base = live.instr_in[&key].len();
                live.max_pressure = live.max_pressure.max(base);
                for cond in live.phi_in[&key].values() {
                    live.max_pressure = live.max_pressure.max(base + cond.len());
                }
            }
        }
        Ok(live)
    }

    pub fn live_in(&self, block: &str) -> impl Iterator<Item = &str> {
        self.block_in
            .get(block)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn live_out(&self, block: &str) -> impl Iterator<Item = &str> {
        self.block_out
            .get(block)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }

    pub fn live_in_at(&self, block: &str, index: usize) -> Vec<&str> {
        self.instr_in
            .get(&(block.to_string(), index))
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    pub fn live_out_at(&self, block: &str, index: usize) -> Vec<&str> {
        self.instr_out
            .get(&(block.to_string(), index))
            .into_iter()
            .flatten()
            .map(String::as_str)
            .collect()
    }

    /// Conditional live-in sets at an instruction, keyed by predecessor.
    pub fn live_in_phi_at(&self, block: &str, index: usize) -> Vec<(&str, Vec<&str>)> {
        self.phi_in
            .get(&(block.to_string(), index))
            .map(|m| {
                let mut entries: Vec<(&str, Vec<&str>)> = m
                    .iter()
                    .map(|(parent, set)| {
                        (parent.as_str(), set.iter().map(String::as_str).collect())
                    })
                    .collect();
                entries.sort();
                entries
            })
            .unwrap_or_default()
    }

    pub fn is_live_out_at(&self, block: &str, index: usize, register: &str) -> bool {
        self.instr_out
            .get(&(block.to_string(), index))
            .is_some_and(|s| s.contains(register))
    }

    /// Highest number of simultaneously live registers anywhere.
    pub fn max_pressure(&self) -> usize {
        self.max_pressure
    }

    /// Mirror the results into block- and instruction-scope metadata.
    pub fn annotate(&self, cfg: &mut Cfg) {
        let labels: Vec<String> = cfg.postorder();
        for label in labels {
            let parents: Vec<String> = {
                let block = cfg.get(&label).expect("postorder stays in the CFG");
                block.parents().map(String::from).collect()
            };
            let block_in: Vec<String> = self.live_in(&label).map(String::from).collect();
            let block_out: Vec<String> = self.live_out(&label).map(String::from).collect();
            let block = cfg.get_mut(&label).expect("postorder stays in the CFG");
            block.meta.set("live/in", block_in);
            block.meta.set("live/out", block_out);
            for parent in &parents {
                let cond: Vec<String> = self
                    .phi_in_block
                    .get(&label)
                    .and_then(|m| m.get(parent))
                    .map(|s| s.iter().cloned().collect())
                    .unwrap_or_default();
                block.meta.set(format!("live/in/{}", parent), cond);
            }
            for i in 0..block.instructions.len() {
                let key = (label.clone(), i);
                let in_here: Vec<String> = self.instr_in[&key].iter().cloned().collect();
                let out_here: Vec<String> = self.instr_out[&key].iter().cloned().collect();
                let meta = &mut block.instructions[i].meta;
                meta.set("live/in", in_here);
                meta.set("live/out", out_here);
            }
        }
    }
}

fn def_use(instruction: &Instruction) -> (RegSet, RegSet) {
    let mut defs = RegSet::new();
    let mut uses = RegSet::new();
    if let Some(dst) = instruction.def() {
        defs.insert(dst.to_string());
    }
    if !instruction.is_phi() {
        for operand in instruction.operands() {
            if let Some(reg) = operand.as_reg() {
                uses.insert(reg.to_string());
            }
        }
    }
    (defs, uses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn read(source: &str) -> Cfg {
        CfgBuilder::default().build(source).unwrap()
    }

    #[test]
    fn test_straight_line_liveness() {
        let cfg = read(
            "@a: read %x\n\
             %y = %x + 1\n\
             write %y\n\
             exit\n",
        );
        let live = LiveAnalysis::compute(&cfg).unwrap();
        assert_eq!(live.live_in_at("@a", 1), ["%x"]);
        assert_eq!(live.live_in_at("@a", 2), ["%y"]);
        assert!(live.live_out("@a").next().is_none());
    }

    #[test]
    fn test_loop_carries_liveness() {
        let cfg = read(
            "@entry: read %n\n\
             %a = 0\n\
             goto @loop\n\
             @loop: %c = %n <= 0\n\
             branch %c ? @end : @body\n\
             @body: %a = %a + %n\n\
             %n = %n - 1\n\
             goto @loop\n\
             @end: write %a\n\
             exit\n",
        );
        let live = LiveAnalysis::compute(&cfg).unwrap();
        let loop_in: Vec<&str> = live.live_in("@loop").collect();
        assert_eq!(loop_in, ["%a", "%n"]);
        let body_out: Vec<&str> = live.live_out("@body").collect();
        assert_eq!(body_out, ["%a", "%n"]);
    }

    #[test]
    fn test_phi_arguments_are_conditional() {
        let cfg = read(
            "@e: read %c\n\
             %x = 1\n\
             %y = 2\n\
             branch %c ? @t : @f\n\
             @t: goto @j\n\
             @f: goto @j\n\
             @j: %z = phi [ %x, @t ], [ %y, @f ]\n\
             write %z\n\
             exit\n",
        );
        let live = LiveAnalysis::compute(&cfg).unwrap();
        // %x is live into @t only conditionally at the join
        let join_in: Vec<&str> = live.live_in("@j").collect();
        assert!(join_in.is_empty());
        let phis = live.live_in_phi_at("@j", 0);
        let from_t = phis.iter().find(|(p, _)| *p == "@t").unwrap();
        assert_eq!(from_t.1, ["%x"]);
        let t_out: Vec<&str> = live.live_out("@t").collect();
        assert_eq!(t_out, ["%x"]);
    }

    #[test]
    fn test_uninitialised_register_is_an_error() {
        let cfg = read("@a: write %nope\nexit\n");
        assert!(matches!(
            LiveAnalysis::compute(&cfg).unwrap_err(),
            AmiError::Opt { .. }
        ));
    }

    #[test]
    fn test_max_pressure() {
        let cfg = read(
            "@a: read %x\n\
             read %y\n\
             %z = %x + %y\n\
             write %z\n\
             write %x\n\
             exit\n",
        );
        let live = LiveAnalysis::compute(&cfg).unwrap();
        // %y dies feeding the add as %z is born, so the peak live-in set
        // is {%x, %y} (equivalently {%x, %z})
        assert_eq!(live.max_pressure(), 2);
    }
}
