//! Dead code elimination
//!
//! Removes definitions whose target is not live out of the defining
//! instruction. `read` consumes input and stays regardless. More effective
//! after an SSA pass.

use crate::manager::{PassManager, Preserved};
use ami_common::AmiResult;
use ami_ir::{Cfg, InstructionKind};

pub const ID: &str = "dce";

pub fn run(cfg: &mut Cfg, mgr: &mut PassManager) -> AmiResult<Preserved> {
    let live = mgr.live(cfg)?;
    let mut changed = false;
    for label in cfg.postorder() {
        let block = cfg.block_mut(&label)?;
        let mut index = 0usize;
        block.instructions.retain(|instruction| {
            let i = index;
            index += 1;
            let Some(dst) = instruction.def() else {
                return true;
            };
            if matches!(instruction.kind, InstructionKind::Read { .. }) {
                return true;
            }
            if live.is_live_out_at(&label, i, dst) {
                return true;
            }
            log::debug!("dce: instruction {} in {} defines a dead register", i, label);
            changed = true;
            false
        });
    }

    if changed {
        Ok(Preserved::only(&[ID, "ssa", "domtree", "djgraph"]))
    } else {
        Ok(Preserved::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn eliminate(source: &str) -> Cfg {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        run(&mut cfg, &mut mgr).unwrap();
        cfg.verify().unwrap();
        cfg
    }

    #[test]
    fn test_unused_definition_removed() {
        let cfg = eliminate(
            "@a: read %x\n\
             %dead = %x * 2\n\
             write %x\n\
             exit\n",
        );
        assert_eq!(cfg.block("@a").unwrap().len(), 3);
        assert_eq!(ami_interpreter::execute(&cfg, &[4]).unwrap(), vec![4]);
    }

    #[test]
    fn test_reads_survive() {
        let cfg = eliminate(
            "@a: read %unused\n\
             write 1\n\
             exit\n",
        );
        assert_eq!(cfg.block("@a").unwrap().len(), 3);
        // the read still consumes its input
        assert_eq!(ami_interpreter::execute(&cfg, &[9]).unwrap(), vec![1]);
    }

    #[test]
    fn test_live_through_loop_kept() {
        let cfg = eliminate(
            "@entry: read %n\n\
             goto @loop\n\
             @loop: %c = %n <= 0\n\
             branch %c ? @end : @body\n\
             @body: %n = %n - 1\n\
             goto @loop\n\
             @end: write %n\n\
             exit\n",
        );
        assert_eq!(ami_interpreter::execute(&cfg, &[5]).unwrap(), vec![0]);
    }
}
