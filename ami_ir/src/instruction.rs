//! Instruction and operand definitions

use crate::metadata::Metadata;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// A value operand: a virtual register or an integer literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Operand {
    Reg(String),
    Const(i128),
}

impl Operand {
    /// Parse a `%`-prefixed register or an integer literal.
    pub fn parse(token: &str) -> Option<Operand> {
        if token.starts_with('%') {
            return Some(Operand::Reg(token.to_string()));
        }
        token.parse::<i128>().ok().map(Operand::Const)
    }

    pub fn reg(name: impl Into<String>) -> Operand {
        Operand::Reg(name.into())
    }

    pub fn as_reg(&self) -> Option<&str> {
        match self {
            Operand::Reg(name) => Some(name),
            Operand::Const(_) => None,
        }
    }

    pub fn as_const(&self) -> Option<i128> {
        match self {
            Operand::Reg(_) => None,
            Operand::Const(value) => Some(*value),
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(name) => write!(f, "{}", name),
            Operand::Const(value) => write!(f, "{}", value),
        }
    }
}

/// Binary operations, covering arithmetic, bitwise and comparison families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Neq,
    Lt,
    Leq,
}

impl BinaryOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::And => "&",
            BinaryOp::Or => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::Eq => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Leq => "<=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<BinaryOp> {
        Some(match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Sub,
            "*" => BinaryOp::Mul,
            "/" => BinaryOp::Div,
            "%" => BinaryOp::Mod,
            "&" => BinaryOp::And,
            "|" => BinaryOp::Or,
            "^" => BinaryOp::Xor,
            "<<" => BinaryOp::Shl,
            ">>" => BinaryOp::Shr,
            "==" => BinaryOp::Eq,
            "!=" => BinaryOp::Neq,
            "<" => BinaryOp::Lt,
            "<=" => BinaryOp::Leq,
            _ => return None,
        })
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Neq | BinaryOp::Lt | BinaryOp::Leq
        )
    }
}

/// The instruction variants of A-Mi.
///
/// Definition instructions (`Mov`, `Phi`, `Binary`, `Read`) write one value
/// register; branch instructions (`Goto`, `Branch`, `Exit`) terminate a
/// block; `Write` and `Brkpt` are side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstructionKind {
    Mov {
        dst: String,
        src: Operand,
    },
    /// `dst = phi [v1, @L1], [v2, @L2], ...`; each pair is the value to
    /// adopt when control arrived from the named predecessor.
    Phi {
        dst: String,
        args: Vec<(Operand, String)>,
    },
    Binary {
        dst: String,
        op: BinaryOp,
        lhs: Operand,
        rhs: Operand,
    },
    Read {
        dst: String,
    },
    Goto {
        target: String,
    },
    Branch {
        cond: Operand,
        if_true: String,
        if_false: String,
    },
    Exit,
    Write {
        src: Operand,
    },
    Brkpt {
        name: String,
    },
}

/// An instruction together with its metadata scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub meta: Metadata,
}

impl From<InstructionKind> for Instruction {
    fn from(kind: InstructionKind) -> Self {
        Instruction { kind, meta: Metadata::new() }
    }
}

impl Instruction {
    pub fn mov(dst: impl Into<String>, src: Operand) -> Instruction {
        InstructionKind::Mov { dst: dst.into(), src }.into()
    }

    pub fn phi(dst: impl Into<String>, args: Vec<(Operand, String)>) -> Instruction {
        InstructionKind::Phi { dst: dst.into(), args }.into()
    }

    pub fn binary(dst: impl Into<String>, op: BinaryOp, lhs: Operand, rhs: Operand) -> Instruction {
        InstructionKind::Binary { dst: dst.into(), op, lhs, rhs }.into()
    }

    pub fn read(dst: impl Into<String>) -> Instruction {
        InstructionKind::Read { dst: dst.into() }.into()
    }

    pub fn goto(target: impl Into<String>) -> Instruction {
        InstructionKind::Goto { target: target.into() }.into()
    }

    pub fn branch(cond: Operand, if_true: impl Into<String>, if_false: impl Into<String>) -> Instruction {
        InstructionKind::Branch {
            cond,
            if_true: if_true.into(),
            if_false: if_false.into(),
        }
        .into()
    }

    pub fn exit() -> Instruction {
        InstructionKind::Exit.into()
    }

    pub fn write(src: Operand) -> Instruction {
        InstructionKind::Write { src }.into()
    }

    pub fn brkpt(name: impl Into<String>) -> Instruction {
        InstructionKind::Brkpt { name: name.into() }.into()
    }

    /// The register this instruction defines, if any.
    pub fn def(&self) -> Option<&str> {
        match &self.kind {
            InstructionKind::Mov { dst, .. }
            | InstructionKind::Phi { dst, .. }
            | InstructionKind::Binary { dst, .. }
            | InstructionKind::Read { dst } => Some(dst),
            _ => None,
        }
    }

    pub fn set_def(&mut self, new_dst: impl Into<String>) {
        match &mut self.kind {
            InstructionKind::Mov { dst, .. }
            | InstructionKind::Phi { dst, .. }
            | InstructionKind::Binary { dst, .. }
            | InstructionKind::Read { dst } => *dst = new_dst.into(),
            _ => {}
        }
    }

    pub fn is_def(&self) -> bool {
        self.def().is_some()
    }

    pub fn is_phi(&self) -> bool {
        matches!(self.kind, InstructionKind::Phi { .. })
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self.kind,
            InstructionKind::Goto { .. } | InstructionKind::Branch { .. } | InstructionKind::Exit
        )
    }

    /// All value operands read by this instruction, including phi arguments
    /// and the branch condition.
    pub fn operands(&self) -> SmallVec<[&Operand; 2]> {
        match &self.kind {
            InstructionKind::Mov { src, .. } | InstructionKind::Write { src } => {
                SmallVec::from_slice(&[src])
            }
            InstructionKind::Phi { args, .. } => args.iter().map(|(v, _)| v).collect(),
            InstructionKind::Binary { lhs, rhs, .. } => SmallVec::from_slice(&[lhs, rhs]),
            InstructionKind::Branch { cond, .. } => SmallVec::from_slice(&[cond]),
            _ => SmallVec::new(),
        }
    }

    /// Apply `f` to every non-phi value operand. Phi arguments are tied to
    /// predecessor exits and are rewritten by the passes that understand
    /// them.
    pub fn map_operands(&mut self, mut f: impl FnMut(&mut Operand)) {
        match &mut self.kind {
            InstructionKind::Mov { src, .. } | InstructionKind::Write { src } => f(src),
            InstructionKind::Binary { lhs, rhs, .. } => {
                f(lhs);
                f(rhs);
            }
            InstructionKind::Branch { cond, .. } => f(cond),
            _ => {}
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            InstructionKind::Mov { dst, src } => write!(f, "{} = {}", dst, src),
            InstructionKind::Phi { dst, args } => {
                write!(f, "{} = phi ", dst)?;
                for (i, (value, label)) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "[ {}, {} ]", value, label)?;
                }
                Ok(())
            }
            InstructionKind::Binary { dst, op, lhs, rhs } => {
                write!(f, "{} = {} {} {}", dst, lhs, op.symbol(), rhs)
            }
            InstructionKind::Read { dst } => write!(f, "read {}", dst),
            InstructionKind::Goto { target } => write!(f, "goto {}", target),
            InstructionKind::Branch { cond, if_true, if_false } => {
                write!(f, "branch {} ? {} : {}", cond, if_true, if_false)
            }
            InstructionKind::Exit => write!(f, "exit"),
            InstructionKind::Write { src } => write!(f, "write {}", src),
            InstructionKind::Brkpt { name } => write!(f, "brkpt !{}", name),
        }
    }
}
