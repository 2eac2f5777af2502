//! Available expression analysis
//!
//! L.T. Simpson. 1996.
//!     "Value-Driven Redundancy Elimination", Fig. 6.3.
//!     PhD Thesis, Rice University.
//!
//! Forward flow with intersection over predecessors: an expression is
//! available at a point if its value has been computed on every path from
//! the entrypoint, where expressions are identified by value number.

use super::{polish_list, ExprSet};
use crate::gvn::ValueTable;
use ami_common::AmiResult;
use ami_ir::Cfg;
use hashbrown::HashMap;

#[derive(Debug, Clone, Default)]
pub struct AvailAnalysis {
    block_in: HashMap<String, ExprSet>,
    block_out: HashMap<String, ExprSet>,
    instr_in: HashMap<(String, usize), ExprSet>,
    instr_out: HashMap<(String, usize), ExprSet>,
}

impl AvailAnalysis {
    pub fn compute(cfg: &Cfg, table: &ValueTable) -> AmiResult<AvailAnalysis> {
        let mut avail = AvailAnalysis::default();
        let order = cfg.reverse_postorder();

        let mut flowing = true;
        while flowing {
            log::debug!("available: running flow analysis");
            flowing = false;
            for label in &order {
                let block = cfg.block(label)?;

                // block entry intersects every predecessor's exit
                let mut incoming: Option<ExprSet> = None;
                for parent in block.parents() {
                    let out = avail.block_out.get(parent).cloned().unwrap_or_default();
                    incoming = Some(match incoming {
                        None => out,
                        Some(seen) => seen.intersection(&out).cloned().collect(),
                    });
                }
                let mut current = incoming.unwrap_or_default();

                for (i, instruction) in block.instructions.iter().enumerate() {
                    let key = (label.clone(), i);
                    if avail.instr_in.get(&key) != Some(&current) {
                        flowing = true;
                        avail.instr_in.insert(key.clone(), current.clone());
                    }
                    if let Some(dst) = instruction.def() {
                        current.insert(table.get(dst));
                    }
                    if avail.instr_out.get(&key) != Some(&current) {
                        flowing = true;
                        avail.instr_out.insert(key, current.clone());
                    }
                }

                avail
                    .block_in
                    .insert(label.clone(), avail.instr_in[&(label.clone(), 0)].clone());
                avail
                    .block_out
                    .insert(label.clone(), current);
            }
        }
        Ok(avail)
    }

    pub fn avail_in(&self, block: &str) -> ExprSet {
        self.block_in.get(block).cloned().unwrap_or_default()
    }

    pub fn avail_out(&self, block: &str) -> ExprSet {
        self.block_out.get(block).cloned().unwrap_or_default()
    }

    pub fn avail_in_at(&self, block: &str, index: usize) -> ExprSet {
        self.instr_in
            .get(&(block.to_string(), index))
            .cloned()
            .unwrap_or_default()
    }

    pub fn avail_out_at(&self, block: &str, index: usize) -> ExprSet {
        self.instr_out
            .get(&(block.to_string(), index))
            .cloned()
            .unwrap_or_default()
    }

    /// Mirror the sets into metadata as Polish-encoded lists.
    pub fn annotate(&self, cfg: &mut Cfg) {
        let labels = cfg.postorder();
        for label in labels {
            let block_in = polish_list(&self.avail_in(&label));
            let block_out = polish_list(&self.avail_out(&label));
            let block = cfg.get_mut(&label).expect("postorder stays in the CFG");
            block.meta.set("available/in", block_in);
            block.meta.set("available/out", block_out);
            for i in 0..block.instructions.len() {
                let key = (label.clone(), i);
                let in_here = polish_list(&self.instr_in[&key]);
                let out_here = polish_list(&self.instr_out[&key]);
                block.instructions[i].meta.set("available/in", in_here);
                block.instructions[i].meta.set("available/out", out_here);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use crate::gvn::{simpson, Numbering};
    use crate::manager::PassManager;
    use ami_ir::CfgBuilder;

    fn analyse(source: &str) -> (Cfg, AvailAnalysis, ValueTable) {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        simpson::run_rpo(&mut cfg, &mut mgr, Numbering::Expr).unwrap();
        let table = mgr.cached_gvn(simpson::RPO_ID).unwrap();
        let avail = AvailAnalysis::compute(&cfg, &table).unwrap();
        (cfg, avail, (*table).clone())
    }

    #[test]
    fn test_straight_line_accumulates() {
        let (_, avail, table) = analyse(
            "@a: read %x\n\
             %y = %x + 1\n\
             write %y\n\
             exit\n",
        );
        assert!(avail.avail_in("@a").is_empty());
        let out = avail.avail_out("@a");
        assert!(out.contains(&table.get("%x")));
        assert!(out.contains(&table.get("%y")));
    }

    #[test]
    fn test_join_intersects_branches() {
        let (_, avail, table) = analyse(
            "@e: read %c\n\
             read %a\n\
             branch %c ? @t : @f\n\
             @t: %u = %a + 1\n\
             %s = %a * 2\n\
             goto @j\n\
             @f: %v = %a + 1\n\
             goto @j\n\
             @j: write %a\n\
             exit\n",
        );
        let at_join = avail.avail_in("@j");
        // %a + 1 was computed on both arms, %a * 2 only on one
        assert!(at_join.contains(&table.get("%u")));
        assert_eq!(table.get("%u"), table.get("%v"));
        assert!(!at_join.contains(&table.get("%s")));
    }

    #[test]
    fn test_loop_keeps_preheader_values() {
        let (_, avail, table) = analyse(
            "@e: read %n\n\
             %k = %n * 2\n\
             goto @loop\n\
             @loop: %c = %n <= 0\n\
             branch %c ? @end : @body\n\
             @body: %n = %n - 1\n\
             goto @loop\n\
             @end: write %k\n\
             exit\n",
        );
        // %k's value is computed before the loop on every path
        assert!(avail.avail_in("@end").contains(&table.get("%k")));
    }

    #[test]
    fn test_constants_are_their_own_numbers() {
        let (_, avail, _) = analyse("@a: %x = 2 + 3\nwrite %x\nexit\n");
        assert!(avail.avail_out("@a").contains(&Expr::Const(5)));
    }
}
