//! Branch elimination and block merging
//!
//! Folds constant branches, collapses conditionals whose arms coincide,
//! merges single-parent chains, threads empty forwarding blocks out of the
//! graph, and finally drops whatever became unreachable.

use crate::manager::{PassManager, Preserved};
use ami_common::AmiResult;
use ami_ir::{Cfg, InstructionKind, Operand};
use std::collections::BTreeSet;

pub const ID: &str = "branch-elim";

pub fn run(cfg: &mut Cfg, _mgr: &mut PassManager) -> AmiResult<Preserved> {
    let mut changed = false;
    loop {
        log::debug!("branch-elim: cycling through blocks");
        let mut reduced = false;
        let labels: Vec<String> = cfg.labels().map(String::from).collect();

        for label in labels {
            if !cfg.contains(&label) {
                // merged away earlier in this cycle
                continue;
            }

            // fold the terminator where possible
            match cfg.block(&label)?.terminator().map(|t| t.kind.clone()) {
                Some(InstructionKind::Branch { cond, if_true, if_false }) => {
                    if if_true == if_false {
                        reduced = true;
                        cfg.remove_child(&label, &if_true, true)?;
                    } else {
                        match cond {
                            Operand::Const(0) => {
                                reduced = true;
                                cfg.remove_child(&label, &if_true, false)?;
                            }
                            Operand::Const(_) => {
                                reduced = true;
                                cfg.remove_child(&label, &if_false, false)?;
                            }
                            Operand::Reg(_) => {}
                        }
                    }
                }
                Some(InstructionKind::Exit) | None => continue,
                _ => {}
            }

            let Some(InstructionKind::Goto { target }) =
                cfg.block(&label)?.terminator().map(|t| t.kind.clone())
            else {
                continue;
            };
            let child = target;

            let child_parents: Vec<String> =
                cfg.block(&child)?.parents().map(String::from).collect();
            if child_parents == [label.clone()] && child != label && child != cfg.entry_label() {
                log::debug!("branch-elim: merging {} into its parent {}", child, label);
                reduced = true;
                merge_only_child(cfg, &label, &child)?;
            } else if cfg.block(&label)?.len() == 1 {
                if try_thread_empty_block(cfg, &label, &child)? {
                    log::debug!("branch-elim: threading empty block {} into {}", label, child);
                    reduced = true;
                }
            }
        }

        if !reduced {
            break;
        }
        cfg.tidy()?;
        changed = true;
    }

    if changed {
        Ok(Preserved::only(&[ID, "ssa"]))
    } else {
        Ok(Preserved::all())
    }
}

/// Append a single-parent child's instructions onto its parent and delete
/// the child.
fn merge_only_child(cfg: &mut Cfg, label: &str, child: &str) -> AmiResult<()> {
    let moved: Vec<_> = cfg.block_mut(child)?.instructions.drain(..).collect();
    let grandchildren: BTreeSet<String> = moved
        .last()
        .map(|terminator| match &terminator.kind {
            InstructionKind::Goto { target } => BTreeSet::from([target.clone()]),
            InstructionKind::Branch { if_true, if_false, .. } => {
                BTreeSet::from([if_true.clone(), if_false.clone()])
            }
            _ => BTreeSet::new(),
        })
        .unwrap_or_default();

    {
        let block = cfg.block_mut(label)?;
        block.instructions.pop(); // the goto into the child
        block.instructions.extend(moved);
    }
    for grandchild in grandchildren {
        // a phi in a grandchild cannot have depended on the parent before
        // the merge, since the parent's only child was the merged block
        cfg.replace_parent(&grandchild, child, label)?;
    }
    cfg.remove_block(child)?;
    Ok(())
}

/// A block holding only a `goto` forwards its parents directly to its
/// child, if the child's phi nodes do not distinguish the paths.
fn try_thread_empty_block(cfg: &mut Cfg, label: &str, child: &str) -> AmiResult<bool> {
    let parents: Vec<String> = cfg.block(label)?.parents().map(String::from).collect();
    if parents.is_empty() || label == cfg.entry_label() || child == label {
        return Ok(false);
    }

    // a phi in the child may not disagree between this block and this
    // block's parents, since those paths become indistinguishable
    for instruction in &cfg.block(child)?.instructions {
        let InstructionKind::Phi { args, .. } = &instruction.kind else {
            continue;
        };
        let mut through: Option<&Operand> = None;
        for (value, from) in args {
            if from == label || parents.iter().any(|p| p == from) {
                match through {
                    None => through = Some(value),
                    Some(seen) if seen != value => return Ok(false),
                    Some(_) => {}
                }
            }
        }
    }

    for parent in &parents {
        match cfg.block(parent)?.terminator().map(|t| t.kind.clone()) {
            Some(InstructionKind::Goto { .. }) => {
                cfg.remove_child(parent, label, false)?;
                cfg.add_child(parent, child, None, false)?;
            }
            Some(InstructionKind::Branch { cond, if_true, .. }) => {
                let on_true = if_true == label;
                cfg.remove_child(parent, label, false)?;
                if cfg.block(parent)?.children().is_empty() {
                    // both arms pointed here
                    cfg.add_child(parent, child, None, false)?;
                } else {
                    cfg.add_child(parent, child, Some(cond), on_true)?;
                }
            }
            _ => {}
        }
    }

    // expand the phi entries that named this block into one entry per
    // rerouted parent
    let mut rewrites: Vec<(usize, Vec<(Operand, String)>)> = Vec::new();
    for (index, instruction) in cfg.block(child)?.instructions.iter().enumerate() {
        let InstructionKind::Phi { args, .. } = &instruction.kind else {
            continue;
        };
        let mut rewritten: Vec<(Operand, String)> = Vec::new();
        for (value, from) in args {
            if from == label {
                for parent in &parents {
                    rewritten.push((value.clone(), parent.clone()));
                }
            } else if !parents.iter().any(|p| p == from) {
                rewritten.push((value.clone(), from.clone()));
            }
        }
        rewrites.push((index, rewritten));
    }
    for (index, args) in rewrites {
        if let InstructionKind::Phi { args: slot, .. } =
            &mut cfg.block_mut(child)?.instructions[index].kind
        {
            *slot = args;
        }
    }

    cfg.remove_block(label)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn simplify(source: &str) -> Cfg {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        run(&mut cfg, &mut mgr).unwrap();
        cfg.verify().unwrap();
        cfg
    }

    #[test]
    fn test_constant_branch_removes_arm() {
        let cfg = simplify(
            "@e: branch 0 ? @t : @f\n\
             @t: write 1\n\
             exit\n\
             @f: write 2\n\
             exit\n",
        );
        assert!(!cfg.contains("@t"));
        assert_eq!(ami_interpreter::execute(&cfg, &[]).unwrap(), vec![2]);
    }

    #[test]
    fn test_identical_arms_collapse_to_goto() {
        let cfg = simplify(
            "@e: read %c\n\
             branch %c ? @next : @next\n\
             @next: write 7\n\
             exit\n",
        );
        // the branch folds and the chain merges into one block
        assert_eq!(cfg.len(), 1);
        assert_eq!(ami_interpreter::execute(&cfg, &[1]).unwrap(), vec![7]);
    }

    #[test]
    fn test_chain_merges() {
        let cfg = simplify(
            "@a: %x = 1\n\
             goto @b\n\
             @b: %y = %x + 1\n\
             goto @c\n\
             @c: write %y\n\
             exit\n",
        );
        assert_eq!(cfg.len(), 1);
        assert_eq!(ami_interpreter::execute(&cfg, &[]).unwrap(), vec![2]);
    }

    #[test]
    fn test_forwarding_block_with_phi_blocks_threading() {
        // @skip cannot thread away: @j's phi distinguishes @e from @skip
        let source = "@e: read %c\n\
                      branch %c ? @skip : @j\n\
                      @skip: goto @j\n\
                      @j: %x = phi [ 1, @skip ], [ 2, @e ]\n\
                      write %x\n\
                      exit\n";
        let cfg = simplify(source);
        assert!(cfg.contains("@skip"));
        assert_eq!(ami_interpreter::execute(&cfg, &[1]).unwrap(), vec![1]);
        assert_eq!(ami_interpreter::execute(&cfg, &[0]).unwrap(), vec![2]);
    }

    #[test]
    fn test_forwarding_block_threads_when_phi_agrees() {
        let source = "@e: read %c\n\
                      branch %c ? @skip : @j\n\
                      @skip: goto @j\n\
                      @j: %x = phi [ 5, @skip ], [ 5, @e ]\n\
                      write %x\n\
                      exit\n";
        let cfg = simplify(source);
        assert!(!cfg.contains("@skip"));
        assert_eq!(ami_interpreter::execute(&cfg, &[1]).unwrap(), vec![5]);
    }

    #[test]
    fn test_loop_structure_is_kept() {
        let source = "@entry: read %n\n\
                      goto @loop\n\
                      @loop: %c = %n <= 0\n\
                      branch %c ? @end : @body\n\
                      @body: %n = %n - 1\n\
                      goto @loop\n\
                      @end: write %n\n\
                      exit\n";
        let cfg = simplify(source);
        assert_eq!(ami_interpreter::execute(&cfg, &[3]).unwrap(), vec![0]);
    }
}
