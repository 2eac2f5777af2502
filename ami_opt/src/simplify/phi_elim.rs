//! Phi elimination
//!
//! Lowers every phi to moves: each predecessor writes the incoming value
//! into a staging register before its terminator, and the phi itself
//! becomes a copy out of that register.

use crate::manager::{PassManager, Preserved};
use ami_common::AmiResult;
use ami_ir::{Cfg, Instruction, InstructionKind, Operand};
use std::collections::BTreeSet;

pub const ID: &str = "phi-elim";

pub fn run(cfg: &mut Cfg, mgr: &mut PassManager) -> AmiResult<Preserved> {
    let defs = mgr.defs(cfg)?;
    let mut taken: BTreeSet<String> = defs.registers().map(String::from).collect();
    let mut changed = false;

    let labels: Vec<String> = cfg.labels().map(String::from).collect();
    for label in labels {
        let phis: Vec<(usize, String, Vec<(Operand, String)>)> = cfg
            .block(&label)?
            .instructions
            .iter()
            .enumerate()
            .filter_map(|(i, instruction)| match &instruction.kind {
                InstructionKind::Phi { dst, args } => Some((i, dst.clone(), args.clone())),
                _ => None,
            })
            .collect();

        for (index, dst, args) in phis {
            changed = true;
            let staging = staging_register(&dst, &mut taken);
            log::debug!("phi-elim: lowering {} through {}", dst, staging);
            for (value, from) in args {
                cfg.block_mut(&from)?
                    .insert_before_terminator(Instruction::mov(staging.clone(), value));
            }
            cfg.block_mut(&label)?.instructions[index] =
                Instruction::mov(dst, Operand::Reg(staging));
        }
    }

    if changed {
        Ok(Preserved::only(&[ID, "domtree", "djgraph"]))
    } else {
        Ok(Preserved::all())
    }
}

fn staging_register(base: &str, taken: &mut BTreeSet<String>) -> String {
    let candidate = format!("{}.phi", base);
    if taken.insert(candidate.clone()) {
        return candidate;
    }
    let mut counter = 0usize;
    loop {
        let candidate = format!("{}.phi.{}", base, counter);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn lower(source: &str) -> Cfg {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        run(&mut cfg, &mut mgr).unwrap();
        cfg.verify().unwrap();
        cfg
    }

    #[test]
    fn test_phi_becomes_moves() {
        let cfg = lower(
            "@e: read %c\n\
             branch %c ? @t : @f\n\
             @t: goto @j\n\
             @f: goto @j\n\
             @j: %x = phi [ 1, @t ], [ 2, @f ]\n\
             write %x\n\
             exit\n",
        );
        assert!(cfg
            .blocks()
            .flat_map(|b| b.instructions.iter())
            .all(|i| !i.is_phi()));
        assert_eq!(ami_interpreter::execute(&cfg, &[1]).unwrap(), vec![1]);
        assert_eq!(ami_interpreter::execute(&cfg, &[0]).unwrap(), vec![2]);
    }

    #[test]
    fn test_loop_phi_lowers_correctly() {
        let source = "@entry: read %n\n\
                      %a = 0\n\
                      %b = 1\n\
                      goto @loop\n\
                      @loop: %a.0 = phi [ %a, @entry ], [ %b.0, @body ]\n\
                      %b.0 = phi [ %b, @entry ], [ %t, @body ]\n\
                      %n.0 = phi [ %n, @entry ], [ %n.1, @body ]\n\
                      %cond = %n.0 <= 0\n\
                      branch %cond ? @end : @body\n\
                      @body: %t = %a.0 + %b.0\n\
                      %n.1 = %n.0 - 1\n\
                      goto @loop\n\
                      @end: write %a.0\n\
                      exit\n";
        let before = CfgBuilder::default().build(source).unwrap();
        let after = lower(source);
        assert_eq!(
            ami_interpreter::execute(&before, &[10]).unwrap(),
            ami_interpreter::execute(&after, &[10]).unwrap()
        );
    }
}
