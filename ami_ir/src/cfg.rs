//! Control-flow graph with invariant-preserving edge editing
//!
//! Blocks live in an arena keyed by label; edges are stored as label sets,
//! never as direct ownership. After every edit the parent and child
//! relations stay mutually consistent and each block ends in exactly one
//! terminator matching its child arity.

use crate::block::BasicBlock;
use crate::instruction::{Instruction, InstructionKind, Operand};
use crate::metadata::Metadata;
use ami_common::{AmiError, AmiResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cfg {
    blocks: BTreeMap<String, BasicBlock>,
    entrypoint: Option<String>,
    pub meta: Metadata,
}

impl Cfg {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The entrypoint label. Valid on any CFG produced by the reader; an
    /// unloaded CFG reports an empty label that matches no block.
    pub fn entry_label(&self) -> &str {
        self.entrypoint.as_deref().unwrap_or_default()
    }

    pub fn entry(&self) -> AmiResult<&BasicBlock> {
        self.block(self.entrypoint.as_deref().unwrap_or_default())
    }

    pub fn set_entrypoint(&mut self, label: &str) -> AmiResult<()> {
        if !self.blocks.contains_key(label) {
            return Err(AmiError::NoEntryPoint { label: label.to_string() });
        }
        self.entrypoint = Some(label.to_string());
        Ok(())
    }

    pub fn contains(&self, label: &str) -> bool {
        self.blocks.contains_key(label)
    }

    pub fn get(&self, label: &str) -> Option<&BasicBlock> {
        self.blocks.get(label)
    }

    pub fn get_mut(&mut self, label: &str) -> Option<&mut BasicBlock> {
        self.blocks.get_mut(label)
    }

    pub fn block(&self, label: &str) -> AmiResult<&BasicBlock> {
        self.blocks.get(label).ok_or_else(|| AmiError::bad_label(label))
    }

    pub fn block_mut(&mut self, label: &str) -> AmiResult<&mut BasicBlock> {
        self.blocks
            .get_mut(label)
            .ok_or_else(|| AmiError::bad_label(label))
    }

    /// Block labels in sorted order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.blocks.keys().map(String::as_str)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.blocks.values()
    }

    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut BasicBlock> {
        self.blocks.values_mut()
    }

    /// Add a block with the given instruction list. The first block added
    /// becomes the entrypoint. Edges are wired afterwards by [`Cfg::link`]
    /// (the reader) or [`Cfg::add_child`] (passes).
    pub fn add_block(&mut self, label: &str, instructions: Vec<Instruction>) -> AmiResult<()> {
        if !label.starts_with('@') {
            return Err(AmiError::bad_label(label));
        }
        if self.blocks.contains_key(label) {
            return Err(AmiError::BadLabel {
                label: format!("{} (already defined)", label),
            });
        }
        if self.entrypoint.is_none() {
            self.entrypoint = Some(label.to_string());
        }
        self.blocks
            .insert(label.to_string(), BasicBlock::new(label.to_string(), instructions));
        Ok(())
    }

    /// Add an empty exit block; passes grow it with [`Cfg::add_child`].
    pub fn create_block(&mut self, label: &str) -> AmiResult<()> {
        self.add_block(label, vec![Instruction::exit()])
    }

    /// Remove a block, detaching it from its parents and children.
    pub fn remove_block(&mut self, label: &str) -> AmiResult<()> {
        let block = self.blocks.get(label).ok_or_else(|| AmiError::bad_label(label))?;
        let children: Vec<String> = block.child_set().into_iter().map(String::from).collect();
        let parents: Vec<String> = block.parents().map(String::from).collect();

        for child in &children {
            if let Some(c) = self.blocks.get_mut(child) {
                c.parents.remove(label);
            }
        }
        for parent in parents {
            if self.blocks.contains_key(&parent) {
                while self.blocks[&parent].has_child(label) {
                    self.remove_child(&parent, label, false)?;
                }
            }
        }
        self.blocks.remove(label);
        Ok(())
    }

    /// Populate parent sets from the terminators of every block, failing
    /// with `BadLabel` on a dangling target. Called once after the reader
    /// has added all blocks.
    pub fn link(&mut self) -> AmiResult<()> {
        let mut edges: Vec<(String, String)> = Vec::new();
        for block in self.blocks.values() {
            for child in block.children() {
                if !self.blocks.contains_key(child) {
                    return Err(AmiError::bad_label(child));
                }
                edges.push((block.label().to_string(), child.to_string()));
            }
        }
        for (parent, child) in edges {
            if let Some(c) = self.blocks.get_mut(&child) {
                c.parents.insert(parent);
            }
        }
        Ok(())
    }

    /// Grow a block's child descriptor by one arm.
    ///
    /// Arity 0 -> 1 replaces the trailing `exit` with a `goto` (no `cond`
    /// allowed); arity 1 -> 2 turns the `goto` into a `branch` (`cond`
    /// required; the new child lands on the true arm iff `new_if_cond`).
    /// Adding the existing child again is legal and yields a conditional
    /// with both arms identical.
    pub fn add_child(
        &mut self,
        parent: &str,
        child: &str,
        cond: Option<Operand>,
        new_if_cond: bool,
    ) -> AmiResult<()> {
        if !self.blocks.contains_key(child) {
            return Err(AmiError::bad_label(child));
        }
        let block = self
            .blocks
            .get_mut(parent)
            .ok_or_else(|| AmiError::bad_label(parent))?;

        match block.terminator().map(|t| t.kind.clone()) {
            Some(InstructionKind::Exit) => {
                if cond.is_some() {
                    return Err(AmiError::bad_flow(
                        parent,
                        "condition supplied for an unconditional branch",
                    ));
                }
                let last = block.instructions.len() - 1;
                block.instructions[last] = Instruction::goto(child);
            }
            Some(InstructionKind::Goto { target }) => {
                let cond = cond.ok_or_else(|| {
                    AmiError::bad_flow(parent, "condition required for a conditional branch")
                })?;
                let last = block.instructions.len() - 1;
                block.instructions[last] = if new_if_cond {
                    Instruction::branch(cond, child, target)
                } else {
                    Instruction::branch(cond, target, child)
                };
            }
            Some(InstructionKind::Branch { .. }) => {
                return Err(AmiError::bad_flow(
                    parent,
                    "cannot add a third branch target",
                ));
            }
            _ => {
                return Err(AmiError::bad_flow(parent, "block has no terminator"));
            }
        }

        self.blocks
            .get_mut(child)
            .expect("child existence checked above")
            .parents
            .insert(parent.to_string());
        Ok(())
    }

    /// Shrink a block's child descriptor by one arm.
    ///
    /// Arity 2 -> 1 turns the `branch` into a `goto`, arity 1 -> 0 turns
    /// the `goto` into an `exit`. When both arms point at the same child,
    /// `keep_duplicate` collapses the branch to an unconditional edge and
    /// keeps it; otherwise the edge is removed entirely.
    pub fn remove_child(&mut self, parent: &str, child: &str, keep_duplicate: bool) -> AmiResult<()> {
        let block = self
            .blocks
            .get_mut(parent)
            .ok_or_else(|| AmiError::bad_label(parent))?;

        let mut detach = true;
        match block.terminator().map(|t| t.kind.clone()) {
            Some(InstructionKind::Goto { target }) if target == child => {
                let last = block.instructions.len() - 1;
                block.instructions[last] = Instruction::exit();
            }
            Some(InstructionKind::Branch { cond, if_true, if_false }) => {
                if if_true != child && if_false != child {
                    return Err(AmiError::bad_flow(
                        parent,
                        format!("{} is not a branch target", child),
                    ));
                }
                let last = block.instructions.len() - 1;
                if if_true == if_false {
                    if keep_duplicate {
                        block.instructions[last] = Instruction::goto(child);
                        detach = false;
                    } else {
                        block.instructions[last] = Instruction::exit();
                    }
                } else if if_true == child {
                    block.instructions[last] = Instruction::goto(if_false);
                } else {
                    block.instructions[last] = Instruction::goto(if_true);
                }
                let _ = cond;
            }
            _ => {
                return Err(AmiError::bad_flow(
                    parent,
                    format!("{} is not a child", child),
                ));
            }
        }

        if detach {
            if let Some(c) = self.blocks.get_mut(child) {
                c.parents.remove(parent);
            }
        }
        Ok(())
    }

    /// Rewrite one parent reference of a block: the parent set entry and
    /// every phi argument naming the old parent. Used when flow is rerouted
    /// through a different block.
    pub fn replace_parent(&mut self, block: &str, old: &str, new: &str) -> AmiResult<()> {
        let b = self.block_mut(block)?;
        if b.parents.remove(old) {
            b.parents.insert(new.to_string());
        }
        b.retarget_phi_labels(old, new);
        Ok(())
    }

    /// Drop blocks unreachable from the entrypoint and repair phi argument
    /// lists to mention only still-present predecessors.
    pub fn tidy(&mut self) -> AmiResult<()> {
        let reachable: BTreeSet<String> = self.postorder().into_iter().collect();
        let dead: Vec<String> = self
            .blocks
            .keys()
            .filter(|l| !reachable.contains(*l))
            .cloned()
            .collect();
        for label in dead {
            log::debug!("tidy: removing unreachable block {}", label);
            self.remove_block(&label)?;
        }

        let mut repairs: Vec<(String, BTreeSet<String>)> = Vec::new();
        for block in self.blocks.values() {
            repairs.push((
                block.label().to_string(),
                block.parents().map(String::from).collect(),
            ));
        }
        for (label, parents) in repairs {
            let block = self.blocks.get_mut(&label).expect("label from iteration");
            for instruction in &mut block.instructions {
                if let InstructionKind::Phi { args, .. } = &mut instruction.kind {
                    args.retain(|(_, l)| parents.contains(l));
                }
            }
        }
        Ok(())
    }

    /// Check the full structural invariant: consistent parent/child
    /// relations, one terminator per block, and phi arguments naming only
    /// current parents.
    pub fn verify(&self) -> AmiResult<()> {
        for block in self.blocks.values() {
            if block.terminator().is_none() {
                return Err(AmiError::bad_flow(block.label(), "missing terminator"));
            }
            for (i, instruction) in block.instructions.iter().enumerate() {
                if instruction.is_terminator() && i + 1 != block.instructions.len() {
                    return Err(AmiError::bad_flow(
                        block.label(),
                        format!("terminator at index {} is not final", i),
                    ));
                }
                if let InstructionKind::Phi { args, .. } = &instruction.kind {
                    for (_, label) in args {
                        if !block.has_parent(label) {
                            return Err(AmiError::bad_phi(
                                block.label(),
                                format!("argument refers to non-parent {}", label),
                            ));
                        }
                    }
                }
            }
            for child in block.child_set() {
                let c = self.block(child)?;
                if !c.has_parent(block.label()) {
                    return Err(AmiError::bad_flow(
                        block.label(),
                        format!("{} does not list it as parent", child),
                    ));
                }
            }
            for parent in block.parents() {
                let p = self.block(parent)?;
                if !p.has_child(block.label()) {
                    return Err(AmiError::bad_flow(
                        parent,
                        format!("{} claims it as parent", block.label()),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Postorder labels of the blocks reachable from the entrypoint,
    /// visiting branch arms true-then-false.
    pub fn postorder(&self) -> Vec<String> {
        let mut order = Vec::new();
        let mut seen = BTreeSet::new();
        let entry = self.entry_label().to_string();
        if !self.blocks.contains_key(&entry) {
            return order;
        }
        // iterative DFS; (label, child cursor) frames
        let mut stack: Vec<(String, usize)> = vec![(entry.clone(), 0)];
        seen.insert(entry);
        while let Some((label, cursor)) = stack.pop() {
            let children: Vec<String> = self.blocks[&label]
                .children()
                .iter()
                .map(|c| c.to_string())
                .collect();
            if cursor < children.len() {
                stack.push((label.clone(), cursor + 1));
                let child = children[cursor].clone();
                if seen.insert(child.clone()) {
                    stack.push((child, 0));
                }
            } else {
                order.push(label);
            }
        }
        order
    }

    pub fn reverse_postorder(&self) -> Vec<String> {
        let mut order = self.postorder();
        order.reverse();
        order
    }

    /// Generate `count` fresh labels with the given prefix.
    pub fn fresh_labels(&self, count: usize, prefix: &str) -> Vec<String> {
        let prefix = if prefix.starts_with('@') {
            prefix.to_string()
        } else {
            format!("@{}", prefix)
        };
        let mut out = Vec::with_capacity(count);
        let mut counter = 0usize;
        while out.len() < count {
            let label = format!("{}.{}", prefix, counter);
            if !self.blocks.contains_key(&label) {
                out.push(label);
            }
            counter += 1;
        }
        out
    }

    /// Generate a fresh register name with the given prefix, avoiding every
    /// register currently mentioned in the CFG.
    pub fn fresh_register(&self, prefix: &str) -> String {
        let mut used: BTreeSet<&str> = BTreeSet::new();
        for block in self.blocks.values() {
            for instruction in &block.instructions {
                if let Some(dst) = instruction.def() {
                    used.insert(dst);
                }
                for op in instruction.operands() {
                    if let Some(reg) = op.as_reg() {
                        used.insert(reg);
                    }
                }
            }
        }
        let prefix = if prefix.starts_with('%') {
            prefix.to_string()
        } else {
            format!("%{}", prefix)
        };
        let mut counter = 0usize;
        loop {
            let name = format!("{}.{}", prefix, counter);
            if !used.contains(name.as_str()) {
                return name;
            }
            counter += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::BinaryOp;

    fn diamond() -> Cfg {
        let mut cfg = Cfg::new();
        cfg.add_block(
            "@e",
            vec![
                Instruction::read("%c"),
                Instruction::branch(Operand::reg("%c"), "@l", "@r"),
            ],
        )
        .unwrap();
        cfg.add_block("@l", vec![Instruction::goto("@j")]).unwrap();
        cfg.add_block("@r", vec![Instruction::goto("@j")]).unwrap();
        cfg.add_block("@j", vec![Instruction::exit()]).unwrap();
        cfg.link().unwrap();
        cfg
    }

    #[test]
    fn test_link_and_verify() {
        let cfg = diamond();
        cfg.verify().unwrap();
        assert_eq!(cfg.entry_label(), "@e");
        let j = cfg.block("@j").unwrap();
        assert_eq!(j.parents().collect::<Vec<_>>(), ["@l", "@r"]);
    }

    #[test]
    fn test_add_child_arity_transitions() {
        let mut cfg = Cfg::new();
        cfg.add_block("@a", vec![Instruction::exit()]).unwrap();
        cfg.add_block("@b", vec![Instruction::exit()]).unwrap();
        cfg.add_block("@c", vec![Instruction::exit()]).unwrap();

        cfg.add_child("@a", "@b", None, false).unwrap();
        assert!(cfg.get("@a").unwrap().has_child("@b"));

        // arity 1 -> 2 requires a condition
        let err = cfg.add_child("@a", "@c", None, false).unwrap_err();
        assert!(matches!(err, AmiError::BadFlow { .. }));

        cfg.add_child("@a", "@c", Some(Operand::reg("%x")), true)
            .unwrap();
        let children: Vec<String> = cfg
            .get("@a")
            .unwrap()
            .children()
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(children, ["@c", "@b"]);
        cfg.verify().unwrap();

        // arity 2 is full
        let err = cfg
            .add_child("@a", "@b", Some(Operand::reg("%x")), false)
            .unwrap_err();
        assert!(matches!(err, AmiError::BadFlow { .. }));
    }

    #[test]
    fn test_duplicate_arm_add_and_collapse() {
        let mut cfg = Cfg::new();
        cfg.add_block("@a", vec![Instruction::exit()]).unwrap();
        cfg.add_block("@b", vec![Instruction::exit()]).unwrap();
        cfg.add_child("@a", "@b", None, false).unwrap();
        cfg.add_child("@a", "@b", Some(Operand::reg("%x")), false)
            .unwrap();
        assert_eq!(cfg.get("@a").unwrap().children().as_slice(), ["@b", "@b"]);

        cfg.remove_child("@a", "@b", true).unwrap();
        assert_eq!(cfg.get("@a").unwrap().children().as_slice(), ["@b"]);
        assert!(cfg.get("@b").unwrap().has_parent("@a"));
        cfg.verify().unwrap();
    }

    #[test]
    fn test_remove_child_to_exit() {
        let mut cfg = Cfg::new();
        cfg.add_block("@a", vec![Instruction::exit()]).unwrap();
        cfg.add_block("@b", vec![Instruction::exit()]).unwrap();
        cfg.add_child("@a", "@b", None, false).unwrap();
        cfg.remove_child("@a", "@b", false).unwrap();
        assert!(cfg.get("@a").unwrap().children().is_empty());
        assert!(!cfg.get("@b").unwrap().has_parent("@a"));
    }

    #[test]
    fn test_tidy_removes_unreachable_and_repairs_phis() {
        let mut cfg = diamond();
        // detach @l, leaving it unreachable; @j's phi must drop the @l arm
        cfg.block_mut("@j")
            .unwrap()
            .instructions
            .insert(
                0,
                Instruction::phi(
                    "%x",
                    vec![
                        (Operand::Const(1), "@l".to_string()),
                        (Operand::Const(2), "@r".to_string()),
                    ],
                ),
            );
        cfg.remove_child("@e", "@l", false).unwrap();
        cfg.tidy().unwrap();
        assert!(!cfg.contains("@l"));
        let j = cfg.block("@j").unwrap();
        match &j.instructions[0].kind {
            InstructionKind::Phi { args, .. } => {
                assert_eq!(args.len(), 1);
                assert_eq!(args[0].1, "@r");
            }
            other => panic!("expected phi, got {:?}", other),
        }
        cfg.verify().unwrap();
    }

    #[test]
    fn test_postorder_of_diamond() {
        let cfg = diamond();
        let rpo = cfg.reverse_postorder();
        assert_eq!(rpo.first().map(String::as_str), Some("@e"));
        assert_eq!(rpo.last().map(String::as_str), Some("@j"));
        assert_eq!(rpo.len(), 4);
    }

    #[test]
    fn test_fresh_names() {
        let mut cfg = diamond();
        cfg.block_mut("@j")
            .unwrap()
            .instructions
            .insert(0, Instruction::binary("%t.0", BinaryOp::Add, Operand::Const(1), Operand::Const(2)));
        assert_eq!(cfg.fresh_register("%t"), "%t.1");
        assert_eq!(cfg.fresh_labels(1, "l")[0], "@l.0");
    }
}
