//! Simpson's GVN algorithms
//!
//! L.T. Simpson. 1996.
//!     "Value-Driven Redundancy Elimination"
//!     PhD Thesis, Rice University.
//!
//! The RPO algorithm (Fig. 4.3) iterates hash-based value lookup over the
//! blocks in reverse postorder until a fixpoint. The SCC algorithm
//! (Fig. 4.7) confines that iteration to the strongly connected components
//! of the SSA use graph, evaluating trivial components once.

use super::{Numbering, ValueTable};
use crate::expr::{Expr, ExprOp};
use crate::manager::{PassManager, Preserved};
use ami_common::AmiResult;
use ami_ir::{BinaryOp, Cfg, InstructionKind, Operand};
use hashbrown::{HashMap, HashSet};

pub const RPO_ID: &str = "gvn-rpo";
pub const SCC_ID: &str = "gvn-scc";

/// Optimistic value-number read: unnumbered registers are the `?` sentinel.
fn optimistic(vn: &HashMap<String, Expr>, operand: &Operand) -> Expr {
    match operand {
        Operand::Const(value) => Expr::Const(*value),
        Operand::Reg(name) => vn.get(name).cloned().unwrap_or_else(Expr::unknown),
    }
}

/// Build the phi expression for a definition, optimistically discarding
/// unknown arguments.
fn phi_expr(vn: &HashMap<String, Expr>, dst: &str, args: &[(Operand, String)]) -> Expr {
    let mut parts = vec![Expr::Atom(dst.to_string())];
    for (value, from) in args {
        let value = optimistic(vn, value);
        if value.is_unknown() {
            continue;
        }
        parts.push(value);
        parts.push(Expr::Atom(from.clone()));
    }
    Expr::node(ExprOp::Phi, parts)
}

fn keyed<'a>(
    lookup: &'a mut HashMap<Expr, Expr>,
    numbering: Numbering,
    expr: Expr,
    dst: &str,
) -> &'a Expr {
    let by_expr = numbering == Numbering::Expr || expr.is_leaf();
    lookup.entry(expr.clone()).or_insert_with(|| {
        if by_expr {
            expr
        } else {
            Expr::Atom(dst.to_string())
        }
    })
}

/// The RPO fixpoint algorithm.
pub fn run_rpo(
    cfg: &mut Cfg,
    mgr: &mut PassManager,
    numbering: Numbering,
) -> AmiResult<Preserved> {
    mgr.require_ssa(cfg)?;
    let order = cfg.reverse_postorder();
    let mut vn: HashMap<String, Expr> = HashMap::new();

    loop {
        log::debug!("gvn-rpo: updating value numbers");
        let mut lookup: HashMap<Expr, Expr> = HashMap::new();
        let mut changed = false;
        for label in &order {
            let block = cfg.block(label)?;
            for instruction in &block.instructions {
                let Some(dst) = instruction.def() else {
                    continue;
                };
                let expr = match &instruction.kind {
                    InstructionKind::Mov { src, .. } => optimistic(&vn, src),
                    InstructionKind::Phi { args, .. } => phi_expr(&vn, dst, args),
                    InstructionKind::Binary { op, lhs, rhs, .. } => {
                        Expr::binary(*op, optimistic(&vn, lhs), optimistic(&vn, rhs))
                    }
                    // reads (and any future opaque definitions) cannot be
                    // treated optimistically
                    _ => Expr::Atom(dst.to_string()),
                };
                let value = keyed(&mut lookup, numbering, expr, dst).clone();
                if vn.get(dst) != Some(&value) {
                    changed = true;
                    log::debug!("gvn-rpo: {} updated to {}", dst, value);
                    vn.insert(dst.to_string(), value);
                }
            }
        }
        if !changed {
            break;
        }
    }

    let table = ValueTable::new(vn);
    table.annotate(cfg, RPO_ID);
    mgr.cache_gvn(RPO_ID, numbering, table);
    Ok(Preserved::all())
}

/// One definition in the SSA use graph.
enum SsaDef {
    Mov(Operand),
    Phi(Vec<(Operand, String)>),
    Binary(BinaryOp, Operand, Operand),
    Opaque,
}

impl SsaDef {
    fn operands(&self) -> Vec<&Operand> {
        match self {
            SsaDef::Mov(src) => vec![src],
            SsaDef::Phi(args) => args.iter().map(|(v, _)| v).collect(),
            SsaDef::Binary(_, lhs, rhs) => vec![lhs, rhs],
            SsaDef::Opaque => Vec::new(),
        }
    }
}

/// The SCC-driven algorithm.
pub fn run_scc(
    cfg: &mut Cfg,
    mgr: &mut PassManager,
    numbering: Numbering,
) -> AmiResult<Preserved> {
    mgr.require_ssa(cfg)?;

    // SSA use graph in reverse-postorder definition order
    let mut ssa: HashMap<String, SsaDef> = HashMap::new();
    let mut rpo: Vec<String> = Vec::new();
    let mut idx: HashMap<String, usize> = HashMap::new();
    for label in cfg.reverse_postorder() {
        let block = cfg.block(&label)?;
        for instruction in &block.instructions {
            let Some(dst) = instruction.def() else {
                continue;
            };
            idx.insert(dst.to_string(), rpo.len());
            rpo.push(dst.to_string());
            let def = match &instruction.kind {
                InstructionKind::Mov { src, .. } => SsaDef::Mov(src.clone()),
                InstructionKind::Phi { args, .. } => SsaDef::Phi(args.clone()),
                InstructionKind::Binary { op, lhs, rhs, .. } => {
                    SsaDef::Binary(*op, lhs.clone(), rhs.clone())
                }
                _ => SsaDef::Opaque,
            };
            ssa.insert(dst.to_string(), def);
        }
    }

    let mut state = SccState {
        ssa: &ssa,
        numbering,
        vn: HashMap::new(),
        valid: HashMap::new(),
        optimistic: HashMap::new(),
    };

    // Tarjan's algorithm, iteratively; SCCs are numbered the moment they
    // complete
    let mut number: HashMap<String, usize> = HashMap::new();
    let mut low: HashMap<String, usize> = HashMap::new();
    let mut on_stack: HashSet<String> = HashSet::new();
    let mut stack: Vec<String> = Vec::new();
    let mut next = 0usize;

    for root in &rpo {
        if number.contains_key(root) {
            continue;
        }
        // frames: (register, operand cursor)
        let mut frames: Vec<(String, usize)> = vec![(root.clone(), 0)];
        while let Some((var, cursor)) = frames.pop() {
            if cursor == 0 {
                number.insert(var.clone(), next);
                low.insert(var.clone(), next);
                next += 1;
                stack.push(var.clone());
                on_stack.insert(var.clone());
            }
            let children: Vec<String> = ssa[&var]
                .operands()
                .into_iter()
                .filter_map(|o| o.as_reg())
                .filter(|r| ssa.contains_key(*r))
                .map(String::from)
                .collect();
            if cursor < children.len() {
                let child = children[cursor].clone();
                if !number.contains_key(&child) {
                    frames.push((var, cursor + 1));
                    frames.push((child, 0));
                } else {
                    if on_stack.contains(&child) {
                        let bound = number[&child].min(low[&var]);
                        low.insert(var.clone(), bound);
                    }
                    frames.push((var, cursor + 1));
                }
                continue;
            }
            if low[&var] == number[&var] {
                let mut scc = Vec::new();
                loop {
                    let node = stack.pop().expect("stack holds the component");
                    on_stack.remove(&node);
                    scc.push(node.clone());
                    if node == var {
                        break;
                    }
                }
                scc.sort_by_key(|v| idx[v]);
                log::debug!("gvn-scc: processing component {:?}", scc);
                state.process(&scc);
            }
            if let Some((parent, _)) = frames.last() {
                let bound = low[&var].min(low[parent]);
                low.insert(parent.clone(), bound);
            }
        }
    }

    let table = ValueTable::new(state.vn);
    table.annotate(cfg, SCC_ID);
    mgr.cache_gvn(SCC_ID, numbering, table);
    Ok(Preserved::all())
}

struct SccState<'a> {
    ssa: &'a HashMap<String, SsaDef>,
    numbering: Numbering,
    vn: HashMap<String, Expr>,
    valid: HashMap<Expr, Expr>,
    optimistic: HashMap<Expr, Expr>,
}

impl SccState<'_> {
    fn process(&mut self, scc: &[String]) {
        if scc.len() == 1 {
            self.number(&scc[0], true);
            return;
        }
        let mut changed = true;
        while changed {
            changed = false;
            for var in scc {
                changed |= self.number(var, false);
            }
        }
        for var in scc {
            self.number(var, true);
        }
    }

    fn number(&mut self, var: &str, commit: bool) -> bool {
        let expr = match &self.ssa[var] {
            SsaDef::Mov(src) => optimistic(&self.vn, src),
            SsaDef::Phi(args) => phi_expr(&self.vn, var, args),
            SsaDef::Binary(op, lhs, rhs) => {
                Expr::binary(*op, optimistic(&self.vn, lhs), optimistic(&self.vn, rhs))
            }
            SsaDef::Opaque => Expr::Atom(var.to_string()),
        };
        let lookup = if commit {
            &mut self.valid
        } else {
            &mut self.optimistic
        };
        let by_expr = self.numbering == Numbering::Expr || expr.is_leaf();
        let value = lookup
            .entry(expr.clone())
            .or_insert_with(|| {
                if by_expr {
                    expr
                } else {
                    Expr::Atom(var.to_string())
                }
            })
            .clone();
        if self.vn.get(var) != Some(&value) {
            log::debug!("gvn-scc: {} updated to {}", var, value);
            self.vn.insert(var.to_string(), value);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn classes_of(source: &str, scc: bool) -> (Cfg, ValueTable) {
        let mut cfg = CfgBuilder::default().build(source).unwrap();
        let mut mgr = PassManager::new();
        if scc {
            run_scc(&mut cfg, &mut mgr, Numbering::Expr).unwrap();
        } else {
            run_rpo(&mut cfg, &mut mgr, Numbering::Expr).unwrap();
        }
        let table = mgr
            .cached_gvn(if scc { SCC_ID } else { RPO_ID })
            .expect("table cached by the pass");
        (cfg, (*table).clone())
    }

    const REDUNDANT: &str = "@e: read %x\n\
                             read %y\n\
                             %a = %x + %y\n\
                             %b = %y + %x\n\
                             %c = %a - %b\n\
                             write %c\n\
                             exit\n";

    #[test]
    fn test_rpo_identifies_commuted_sums() {
        let (_, table) = classes_of(REDUNDANT, false);
        assert_eq!(table.get("%a"), table.get("%b"));
        assert_eq!(table.get("%c"), Expr::Const(0));
    }

    #[test]
    fn test_scc_matches_rpo_on_straight_line() {
        let (_, rpo) = classes_of(REDUNDANT, false);
        let (_, scc) = classes_of(REDUNDANT, true);
        assert_eq!(rpo.get("%a"), scc.get("%a"));
        assert_eq!(rpo.get("%c"), scc.get("%c"));
    }

    #[test]
    fn test_constant_folding() {
        let (_, table) = classes_of("@e: %a = 2 + 3\nwrite %a\nexit\n", false);
        assert_eq!(table.get("%a"), Expr::Const(5));
    }

    #[test]
    fn test_loop_phi_classes() {
        // two phis cycling the same values collapse into one class
        let source = "@e: read %n\n\
                      %i = 0\n\
                      %j = 0\n\
                      goto @loop\n\
                      @loop: %c = %i < %n\n\
                      branch %c ? @body : @end\n\
                      @body: %i = %i + 1\n\
                      %j = %j + 1\n\
                      goto @loop\n\
                      @end: write %i\n\
                      exit\n";
        let (cfg, rpo) = classes_of(source, false);
        let (_, scc) = classes_of(source, true);
        // after SSA both %i and %j are phi-defined in @loop and should
        // share a value number
        let phis: Vec<&str> = cfg
            .get("@loop")
            .unwrap()
            .instructions
            .iter()
            .filter_map(|i| if i.is_phi() { i.def() } else { None })
            .collect();
        assert_eq!(phis.len(), 2);
        assert_eq!(rpo.get(phis[0]), rpo.get(phis[1]));
        assert_eq!(scc.get(phis[0]), scc.get(phis[1]));
    }

    #[test]
    fn test_classes_metadata_written() {
        let (cfg, _) = classes_of("@e: %a = 1 + 2\nwrite %a\nexit\n", false);
        let classes = cfg.meta.get("gvn-rpo/classes").unwrap();
        assert!(classes.contains(&"%a".to_string()));
        assert!(classes.contains(&"$".to_string()));
    }
}
