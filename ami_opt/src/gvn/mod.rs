//! Global value numbering
//!
//! Three interchangeable algorithms share one output shape: a map from
//! register to the canonical expression standing for its value class.

pub mod gargi;
pub mod simpson;

use crate::expr::Expr;
use ami_ir::{Cfg, Operand};
use hashbrown::HashMap;
use std::collections::{BTreeMap, BTreeSet};

/// Which value-numbering algorithm produced (or should produce) a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GvnChoice {
    Rpo,
    Scc,
    Gargi,
    Any,
}

impl GvnChoice {
    pub fn parse(text: &str) -> Option<GvnChoice> {
        Some(match text {
            "rpo" => GvnChoice::Rpo,
            "scc" => GvnChoice::Scc,
            "gargi" => GvnChoice::Gargi,
            "any" => GvnChoice::Any,
            _ => return None,
        })
    }
}

/// Whether classes are numbered by representative register or by canonical
/// expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Numbering {
    Var,
    Expr,
}

impl Numbering {
    pub fn parse(text: &str) -> Option<Numbering> {
        Some(match text {
            "var" => Numbering::Var,
            "expr" => Numbering::Expr,
            _ => return None,
        })
    }
}

/// Value numbers for every defined register.
#[derive(Debug, Clone, Default)]
pub struct ValueTable {
    vn: HashMap<String, Expr>,
}

impl ValueTable {
    pub fn new(vn: HashMap<String, Expr>) -> Self {
        ValueTable { vn }
    }

    /// The value number of a register; unnumbered registers stand for
    /// themselves.
    pub fn get(&self, register: &str) -> Expr {
        self.vn
            .get(register)
            .cloned()
            .unwrap_or_else(|| Expr::leaf(register))
    }

    pub fn operand(&self, operand: &Operand) -> Expr {
        match operand {
            Operand::Reg(name) => self.get(name),
            Operand::Const(value) => Expr::Const(*value),
        }
    }

    pub fn registers(&self) -> impl Iterator<Item = &str> {
        self.vn.keys().map(String::as_str)
    }

    pub fn insert(&mut self, register: String, value: Expr) {
        self.vn.insert(register, value);
    }

    /// Group registers by value class.
    pub fn classes(&self) -> BTreeMap<Expr, BTreeSet<String>> {
        let mut classes: BTreeMap<Expr, BTreeSet<String>> = BTreeMap::new();
        for (register, value) in &self.vn {
            classes
                .entry(value.clone())
                .or_default()
                .insert(register.clone());
        }
        classes
    }

    /// Persist the classes under the CFG metadata key `<id>/classes` as
    /// alternating Polish expressions and sorted member lists, each class
    /// terminated by `$`.
    pub fn annotate(&self, cfg: &mut Cfg, id: &str) {
        let mut values: Vec<String> = Vec::new();
        for (value, members) in self.classes() {
            values.push(value.polish());
            values.extend(members.into_iter());
            values.push("$".to_string());
        }
        cfg.meta.set(format!("{}/classes", id), values);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classes_group_by_value() {
        let mut table = ValueTable::default();
        table.insert("%a".to_string(), Expr::Const(5));
        table.insert("%b".to_string(), Expr::Const(5));
        table.insert("%c".to_string(), Expr::Atom("%c".to_string()));
        let classes = table.classes();
        assert_eq!(classes.len(), 2);
        assert_eq!(
            classes[&Expr::Const(5)],
            BTreeSet::from(["%a".to_string(), "%b".to_string()])
        );
    }

    #[test]
    fn test_annotate_layout() {
        let mut table = ValueTable::default();
        table.insert("%a".to_string(), Expr::Const(5));
        let mut cfg = Cfg::new();
        cfg.add_block("@e", vec![ami_ir::Instruction::exit()]).unwrap();
        table.annotate(&mut cfg, "gvn-rpo");
        assert_eq!(
            cfg.meta.get("gvn-rpo/classes").unwrap(),
            &["5", "%a", "$"]
        );
    }
}
