//! Basic blocks

use crate::instruction::{Instruction, InstructionKind};
use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// A straight-line instruction sequence ending in exactly one terminator.
///
/// The child descriptor is derived from the terminator: `exit` has arity 0,
/// `goto` arity 1, `branch` arity 2 (both arms may name the same label).
/// The parent set is maintained by the owning [`crate::Cfg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlock {
    label: String,
    pub instructions: Vec<Instruction>,
    pub(crate) parents: BTreeSet<String>,
    pub meta: Metadata,
}

impl BasicBlock {
    pub(crate) fn new(label: String, instructions: Vec<Instruction>) -> Self {
        BasicBlock {
            label,
            instructions,
            parents: BTreeSet::new(),
            meta: Metadata::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Parent labels in sorted order.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.parents.iter().map(String::as_str)
    }

    pub fn parent_count(&self) -> usize {
        self.parents.len()
    }

    pub fn has_parent(&self, label: &str) -> bool {
        self.parents.contains(label)
    }

    pub fn terminator(&self) -> Option<&Instruction> {
        self.instructions.last().filter(|i| i.is_terminator())
    }

    /// Child labels in branch order. A conditional with identical arms
    /// reports the label twice.
    pub fn children(&self) -> SmallVec<[&str; 2]> {
        match self.terminator().map(|t| &t.kind) {
            Some(InstructionKind::Goto { target }) => SmallVec::from_slice(&[target.as_str()]),
            Some(InstructionKind::Branch { if_true, if_false, .. }) => {
                SmallVec::from_slice(&[if_true.as_str(), if_false.as_str()])
            }
            _ => SmallVec::new(),
        }
    }

    /// Distinct child labels.
    pub fn child_set(&self) -> BTreeSet<&str> {
        self.children().into_iter().collect()
    }

    pub fn has_child(&self, label: &str) -> bool {
        self.children().iter().any(|c| *c == label)
    }

    /// Insert an instruction immediately before the terminator.
    pub fn insert_before_terminator(&mut self, instruction: Instruction) {
        let at = if self.terminator().is_some() {
            self.instructions.len() - 1
        } else {
            self.instructions.len()
        };
        self.instructions.insert(at, instruction);
    }

    /// Rewrite every label reference in phi arguments from `old` to `new`.
    pub fn retarget_phi_labels(&mut self, old: &str, new: &str) {
        for instruction in &mut self.instructions {
            if let InstructionKind::Phi { args, .. } = &mut instruction.kind {
                for (_, label) in args.iter_mut() {
                    if label == old {
                        *label = new.to_string();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::Operand;

    #[test]
    fn test_children_follow_terminator() {
        let block = BasicBlock::new(
            "@b".to_string(),
            vec![
                Instruction::mov("%x", Operand::Const(1)),
                Instruction::branch(Operand::reg("%x"), "@t", "@t"),
            ],
        );
        assert_eq!(block.children().as_slice(), ["@t", "@t"]);
        assert_eq!(block.child_set().len(), 1);

        let exit = BasicBlock::new("@e".to_string(), vec![Instruction::exit()]);
        assert!(exit.children().is_empty());
    }

    #[test]
    fn test_insert_before_terminator() {
        let mut block = BasicBlock::new("@b".to_string(), vec![Instruction::goto("@c")]);
        block.insert_before_terminator(Instruction::mov("%x", Operand::Const(2)));
        assert_eq!(block.instructions.len(), 2);
        assert!(block.instructions[1].is_terminator());
    }
}
