//! Canonical algebraic expressions
//!
//! The datatype value numbering works over. Every constructor applies the
//! rewriting system bottom-up, so two expressions that the rules can prove
//! equivalent compare structurally equal. Subtraction is eliminated on
//! construction (`a - b` becomes `a + (-1)*b`), commutative operators keep
//! sorted argument lists, and comparisons are pinned to `0 op (right - left)`.

use ami_common::{ints, AmiError, AmiResult};
use ami_ir::{BinaryOp, Operand};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Operators of the expression algebra, declared in canonical sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExprOp {
    Add,
    Mul,
    And,
    Or,
    Xor,
    Eq,
    Neq,
    Lt,
    Leq,
    Shl,
    Shr,
    Div,
    Mod,
    Phi,
}

impl ExprOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ExprOp::Add => "+",
            ExprOp::Mul => "*",
            ExprOp::And => "&",
            ExprOp::Or => "|",
            ExprOp::Xor => "^",
            ExprOp::Eq => "==",
            ExprOp::Neq => "!=",
            ExprOp::Lt => "<",
            ExprOp::Leq => "<=",
            ExprOp::Shl => "<<",
            ExprOp::Shr => ">>",
            ExprOp::Div => "/",
            ExprOp::Mod => "%",
            ExprOp::Phi => "phi",
        }
    }

    fn from_symbol(symbol: &str) -> Option<ExprOp> {
        Some(match symbol {
            "+" => ExprOp::Add,
            "*" => ExprOp::Mul,
            "&" => ExprOp::And,
            "|" => ExprOp::Or,
            "^" => ExprOp::Xor,
            "==" => ExprOp::Eq,
            "!=" => ExprOp::Neq,
            "<" => ExprOp::Lt,
            "<=" => ExprOp::Leq,
            "<<" => ExprOp::Shl,
            ">>" => ExprOp::Shr,
            "/" => ExprOp::Div,
            "%" => ExprOp::Mod,
            "phi" => ExprOp::Phi,
            _ => return None,
        })
    }

    pub fn is_comparison(&self) -> bool {
        matches!(self, ExprOp::Eq | ExprOp::Neq | ExprOp::Lt | ExprOp::Leq)
    }

    /// The instruction operator that computes this node.
    pub fn binary_op(&self) -> Option<BinaryOp> {
        Some(match self {
            ExprOp::Add => BinaryOp::Add,
            ExprOp::Mul => BinaryOp::Mul,
            ExprOp::And => BinaryOp::And,
            ExprOp::Or => BinaryOp::Or,
            ExprOp::Xor => BinaryOp::Xor,
            ExprOp::Eq => BinaryOp::Eq,
            ExprOp::Neq => BinaryOp::Neq,
            ExprOp::Lt => BinaryOp::Lt,
            ExprOp::Leq => BinaryOp::Leq,
            ExprOp::Shl => BinaryOp::Shl,
            ExprOp::Shr => BinaryOp::Shr,
            ExprOp::Div => BinaryOp::Div,
            ExprOp::Mod => BinaryOp::Mod,
            ExprOp::Phi => return None,
        })
    }
}

/// A canonical algebraic expression tree.
///
/// Leaves are integer constants or string atoms (register names, and the
/// optimistic sentinel `?` during value numbering). Phi nodes carry their
/// target atom first, then alternating value/label-set arguments.
#[derive(Debug, Clone)]
pub enum Expr {
    Const(i128),
    Atom(String),
    Node(ExprOp, Vec<Expr>),
}

impl Expr {
    /// The optimistic "unknown" sentinel used by the GVN fixpoints.
    pub fn unknown() -> Expr {
        Expr::Atom("?".to_string())
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Expr::Atom(s) if s == "?")
    }

    /// Build a leaf from a token: integers become constants, anything else
    /// an atom.
    pub fn leaf(token: &str) -> Expr {
        match token.parse::<i128>() {
            Ok(value) => Expr::Const(value),
            Err(_) => Expr::Atom(token.to_string()),
        }
    }

    pub fn from_operand(operand: &Operand) -> Expr {
        match operand {
            Operand::Reg(name) => Expr::Atom(name.clone()),
            Operand::Const(value) => Expr::Const(*value),
        }
    }

    pub fn as_const(&self) -> Option<i128> {
        match self {
            Expr::Const(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Expr::Atom(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        !matches!(self, Expr::Node(..))
    }

    pub fn op(&self) -> Option<ExprOp> {
        match self {
            Expr::Node(op, _) => Some(*op),
            _ => None,
        }
    }

    pub fn args(&self) -> &[Expr] {
        match self {
            Expr::Node(_, args) => args,
            _ => &[],
        }
    }

    /// Construct an instruction-level binary expression; `sub` is rewritten
    /// away immediately.
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        match op {
            BinaryOp::Add => Expr::node(ExprOp::Add, vec![lhs, rhs]),
            BinaryOp::Sub => Expr::sub(lhs, rhs),
            BinaryOp::Mul => Expr::node(ExprOp::Mul, vec![lhs, rhs]),
            BinaryOp::Div => Expr::node(ExprOp::Div, vec![lhs, rhs]),
            BinaryOp::Mod => Expr::node(ExprOp::Mod, vec![lhs, rhs]),
            BinaryOp::And => Expr::node(ExprOp::And, vec![lhs, rhs]),
            BinaryOp::Or => Expr::node(ExprOp::Or, vec![lhs, rhs]),
            BinaryOp::Xor => Expr::node(ExprOp::Xor, vec![lhs, rhs]),
            BinaryOp::Shl => Expr::node(ExprOp::Shl, vec![lhs, rhs]),
            BinaryOp::Shr => Expr::node(ExprOp::Shr, vec![lhs, rhs]),
            BinaryOp::Eq => Expr::node(ExprOp::Eq, vec![lhs, rhs]),
            BinaryOp::Neq => Expr::node(ExprOp::Neq, vec![lhs, rhs]),
            BinaryOp::Lt => Expr::node(ExprOp::Lt, vec![lhs, rhs]),
            BinaryOp::Leq => Expr::node(ExprOp::Leq, vec![lhs, rhs]),
        }
    }

    /// `a - b` as `a + (-1)*b`.
    pub fn sub(lhs: Expr, rhs: Expr) -> Expr {
        let neg = Expr::node(ExprOp::Mul, vec![Expr::Const(-1), rhs]);
        Expr::node(ExprOp::Add, vec![lhs, neg])
    }

    pub fn neg(expr: Expr) -> Expr {
        Expr::node(ExprOp::Mul, vec![Expr::Const(-1), expr])
    }

    /// Construct a canonical node, applying the rewriting rules. The
    /// operands are assumed to be canonical already.
    pub fn node(op: ExprOp, args: Vec<Expr>) -> Expr {
        reduce(op, args)
    }

    fn raw(op: ExprOp, args: Vec<Expr>) -> Expr {
        debug_assert!(!args.is_empty());
        Expr::Node(op, args)
    }

    /// Serialise in prefix notation: `op`arity child...`.
    pub fn polish(&self) -> String {
        match self {
            Expr::Const(value) => value.to_string(),
            Expr::Atom(name) => name.clone(),
            Expr::Node(op, args) => {
                let mut out = format!("{}`{}", op.symbol(), args.len());
                for arg in args {
                    out.push(' ');
                    out.push_str(&arg.polish());
                }
                out
            }
        }
    }

    /// Parse a Polish-notation expression.
    pub fn read_polish(text: &str) -> AmiResult<Expr> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        let (expr, consumed) = Self::read_polish_tokens(&tokens, 0)?;
        if consumed != tokens.len() {
            return Err(AmiError::load(format!(
                "trailing tokens in polish expression \"{}\"",
                text
            )));
        }
        Ok(expr)
    }

    /// Parse one expression from `tokens[i..]`, returning it and the index
    /// one past its last token.
    pub fn read_polish_tokens(tokens: &[&str], i: usize) -> AmiResult<(Expr, usize)> {
        let token = tokens
            .get(i)
            .ok_or_else(|| AmiError::load("truncated polish expression"))?;
        let Some((symbol, arity)) = token.split_once('`') else {
            return Ok((Expr::leaf(token), i + 1));
        };
        let op = ExprOp::from_symbol(symbol)
            .ok_or_else(|| AmiError::load(format!("unrecognised polish operator {}", symbol)))?;
        let arity: usize = arity
            .parse()
            .map_err(|_| AmiError::load(format!("bad arity in polish token {}", token)))?;
        let mut args = Vec::with_capacity(arity);
        let mut j = i + 1;
        for _ in 0..arity {
            let (arg, next) = Self::read_polish_tokens(tokens, j)?;
            args.push(arg);
            j = next;
        }
        Ok((Expr::node(op, args), j))
    }

    /// The last instruction of a construction of this expression, undoing
    /// the sub/shift canonicalisations for emission.
    pub fn recipe(&self) -> Recipe {
        match self {
            Expr::Const(value) => Recipe::Leaf(Operand::Const(*value)),
            Expr::Atom(name) => Recipe::Leaf(Operand::Reg(name.clone())),
            Expr::Node(ExprOp::Phi, args) => match &args[0] {
                Expr::Atom(name) => Recipe::Leaf(Operand::Reg(name.clone())),
                Expr::Const(value) => Recipe::Leaf(Operand::Const(*value)),
                other => other.recipe(),
            },
            Expr::Node(ExprOp::Add, args) => {
                // a + (-1)*b emits as a - b
                let mut sums = Vec::new();
                let mut subs = Vec::new();
                for arg in args {
                    match arg {
                        Expr::Const(c) if *c < 0 => subs.push(Expr::Const(c.wrapping_neg())),
                        Expr::Node(ExprOp::Mul, margs)
                            if matches!(margs.first(), Some(Expr::Const(c)) if *c < 0) =>
                        {
                            let Some(Expr::Const(c)) = margs.first() else {
                                unreachable!("guard matched a leading constant");
                            };
                            let rest = if margs.len() > 2 {
                                Expr::raw(ExprOp::Mul, margs[1..].to_vec())
                            } else {
                                margs[1].clone()
                            };
                            subs.push(Expr::node(
                                ExprOp::Mul,
                                vec![Expr::Const(c.wrapping_neg()), rest],
                            ));
                        }
                        other => sums.push(other.clone()),
                    }
                }
                if !subs.is_empty() {
                    return Recipe::Binary(
                        BinaryOp::Sub,
                        Box::new(sum_of(sums)),
                        Box::new(sum_of(subs)),
                    );
                }
                self.split_binary(ExprOp::Add, args)
            }
            Expr::Node(op, args) if op.is_comparison() => {
                // canonical form is 0 op (right - left)
                if let Recipe::Binary(BinaryOp::Sub, sums, subs) = args[1].recipe() {
                    return Recipe::Binary(
                        op.binary_op().expect("comparison maps to an instruction"),
                        subs,
                        sums,
                    );
                }
                Recipe::Binary(
                    op.binary_op().expect("comparison maps to an instruction"),
                    Box::new(args[0].clone()),
                    Box::new(args[1].clone()),
                )
            }
            Expr::Node(ExprOp::Mul, args)
                if args.len() == 2 && matches!(args[0], Expr::Const(c) if c > 0 && (c & (c - 1)) == 0) =>
            {
                let Expr::Const(c) = args[0] else {
                    unreachable!("guard matched a constant");
                };
                // 2^n * a emits as a << n
                Recipe::Binary(
                    BinaryOp::Shl,
                    Box::new(args[1].clone()),
                    Box::new(Expr::Const(c.trailing_zeros() as i128)),
                )
            }
            Expr::Node(op, args) => self.split_binary(*op, args),
        }
    }

    fn split_binary(&self, op: ExprOp, args: &[Expr]) -> Recipe {
        let binary = op.binary_op().expect("phi handled by caller");
        if args.len() > 2 {
            Recipe::Binary(
                binary,
                Box::new(args[0].clone()),
                Box::new(Expr::raw(op, args[1..].to_vec())),
            )
        } else {
            Recipe::Binary(binary, Box::new(args[0].clone()), Box::new(args[1].clone()))
        }
    }

    /// Total order: constants < atoms < operator nodes; constants by value,
    /// atoms by string, nodes by operator, then arity, then children. Phi
    /// nodes skip their target argument so that phis differing only in
    /// target identify.
    pub fn compare(&self, other: &Expr) -> Ordering {
        match (self, other) {
            (Expr::Const(a), Expr::Const(b)) => a.cmp(b),
            (Expr::Const(_), _) => Ordering::Less,
            (_, Expr::Const(_)) => Ordering::Greater,
            (Expr::Atom(a), Expr::Atom(b)) => a.cmp(b),
            (Expr::Atom(_), _) => Ordering::Less,
            (_, Expr::Atom(_)) => Ordering::Greater,
            (Expr::Node(op1, args1), Expr::Node(op2, args2)) => {
                if op1 != op2 {
                    return op1.cmp(op2);
                }
                if args1.len() != args2.len() {
                    return args1.len().cmp(&args2.len());
                }
                let skip = usize::from(*op1 == ExprOp::Phi);
                for (a, b) in args1.iter().zip(args2).skip(skip) {
                    let ord = a.compare(b);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            }
        }
    }
}

fn sum_of(mut args: Vec<Expr>) -> Expr {
    match args.len() {
        0 => Expr::Const(0),
        1 => args.pop().expect("length checked"),
        _ => Expr::raw(ExprOp::Add, args),
    }
}

/// How to emit the final instruction computing an expression.
pub enum Recipe {
    Leaf(Operand),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl Eq for Expr {}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.compare(other))
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Expr::Const(value) => {
                0u8.hash(state);
                value.hash(state);
            }
            Expr::Atom(name) => {
                1u8.hash(state);
                name.hash(state);
            }
            Expr::Node(op, args) => {
                2u8.hash(state);
                op.hash(state);
                // consistent with compare: the phi target does not identify
                let skip = usize::from(*op == ExprOp::Phi);
                args.len().hash(state);
                for arg in args.iter().skip(skip) {
                    arg.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(value) if *value < 0 => write!(f, "({})", value),
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Atom(name) => write!(f, "{}", name),
            Expr::Node(ExprOp::Phi, args) => {
                write!(f, "phi[{}](", args[0])?;
                for (i, pair) in args[1..].chunks(2).enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}, {}", pair[0], pair[1])?;
                }
                write!(f, ")")
            }
            Expr::Node(op, args) => {
                write!(f, "(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, " {} ", op.symbol())?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// The rewriting loop. Each round either finishes or rewrites `(op, args)`
/// into another node shape to re-reduce.
fn reduce(mut op: ExprOp, mut args: Vec<Expr>) -> Expr {
    // nested phi nodes are prohibited; a phi argument stands for its target
    for arg in &mut args {
        if let Expr::Node(ExprOp::Phi, pargs) = arg {
            *arg = pargs[0].clone();
        }
    }

    loop {
        match op {
            ExprOp::Phi => return reduce_phi(args),

            ExprOp::Add => {
                flatten(ExprOp::Add, &mut args);
                let mut terms: BTreeMap<Expr, i128> = BTreeMap::new();
                for arg in args.drain(..) {
                    match arg {
                        Expr::Const(0) => {}
                        Expr::Const(c) => {
                            let slot = terms.entry(Expr::Const(1)).or_insert(0);
                            *slot = slot.wrapping_add(c);
                        }
                        Expr::Node(ExprOp::Mul, margs)
                            if matches!(margs.first(), Some(Expr::Const(_))) =>
                        {
                            let Some(Expr::Const(c)) = margs.first().cloned() else {
                                unreachable!("guard matched a leading constant");
                            };
                            let term = if margs.len() > 2 {
                                Expr::raw(ExprOp::Mul, margs[1..].to_vec())
                            } else {
                                margs[1].clone()
                            };
                            let slot = terms.entry(term).or_insert(0);
                            *slot = slot.wrapping_add(c);
                        }
                        other => {
                            let slot = terms.entry(other).or_insert(0);
                            *slot = slot.wrapping_add(1);
                        }
                    }
                }
                let mut rebuilt: Vec<Expr> = terms
                    .into_iter()
                    .filter(|(_, coefficient)| *coefficient != 0)
                    .map(|(term, coefficient)| {
                        Expr::node(ExprOp::Mul, vec![Expr::Const(coefficient), term])
                    })
                    .collect();
                rebuilt.sort();
                return match rebuilt.len() {
                    0 => Expr::Const(0),
                    1 => rebuilt.pop().expect("length checked"),
                    _ => Expr::raw(ExprOp::Add, rebuilt),
                };
            }

            ExprOp::Mul => {
                flatten(ExprOp::Mul, &mut args);
                if let Some(distributed) = distribute(ExprOp::Mul, &args, &[ExprOp::Add]) {
                    (op, args) = distributed;
                    continue;
                }
                let mut constant: i128 = 1;
                let mut kept = Vec::new();
                for arg in args.drain(..) {
                    match arg {
                        Expr::Const(c) => {
                            constant = constant.wrapping_mul(c);
                            if constant == 0 {
                                break;
                            }
                        }
                        other => kept.push(other),
                    }
                }
                if constant == 0 || kept.is_empty() {
                    return Expr::Const(constant);
                }
                if constant != 1 {
                    kept.push(Expr::Const(constant));
                }
                kept.sort();
                return if kept.len() == 1 {
                    kept.pop().expect("length checked")
                } else {
                    Expr::raw(ExprOp::Mul, kept)
                };
            }

            ExprOp::Div => {
                let (lhs, rhs) = two(&mut args);
                // division by zero folds to the sentinel 0; only the
                // interpreter raises for the runtime case
                if rhs == Expr::Const(0) || lhs == Expr::Const(0) {
                    return Expr::Const(0);
                }
                if rhs == Expr::Const(1) {
                    return lhs;
                }
                if rhs == Expr::Const(-1) {
                    op = ExprOp::Mul;
                    args = vec![Expr::Const(-1), lhs];
                    continue;
                }
                if lhs == rhs {
                    return Expr::Const(1);
                }
                if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
                    return Expr::Const(ints::floor_div(a, b));
                }
                return Expr::raw(ExprOp::Div, vec![lhs, rhs]);
            }

            ExprOp::Mod => {
                let (lhs, rhs) = two(&mut args);
                if rhs == Expr::Const(0)
                    || lhs == Expr::Const(0)
                    || rhs == Expr::Const(1)
                    || rhs == Expr::Const(-1)
                    || lhs == rhs
                {
                    return Expr::Const(0);
                }
                if let (Some(a), Some(b)) = (lhs.as_const(), rhs.as_const()) {
                    return Expr::Const(ints::floor_mod(a, b));
                }
                return Expr::raw(ExprOp::Mod, vec![lhs, rhs]);
            }

            ExprOp::And => {
                flatten(ExprOp::And, &mut args);
                if let Some(distributed) =
                    distribute(ExprOp::And, &args, &[ExprOp::Or, ExprOp::Xor])
                {
                    (op, args) = distributed;
                    continue;
                }
                let mut constant: i128 = -1;
                let mut set: BTreeSet<Expr> = BTreeSet::new();
                for arg in args.drain(..) {
                    match arg {
                        Expr::Const(c) => {
                            constant &= c;
                            if constant == 0 {
                                break;
                            }
                        }
                        other => {
                            set.insert(other);
                        }
                    }
                }
                if constant == 0 || set.is_empty() {
                    return Expr::Const(constant);
                }
                if constant != -1 {
                    set.insert(Expr::Const(constant));
                }
                return collapse(ExprOp::And, set);
            }

            ExprOp::Or => {
                flatten(ExprOp::Or, &mut args);
                let mut constant: i128 = 0;
                let mut set: BTreeSet<Expr> = BTreeSet::new();
                for arg in args.drain(..) {
                    match arg {
                        Expr::Const(c) => {
                            constant |= c;
                            if constant == -1 {
                                break;
                            }
                        }
                        other => {
                            set.insert(other);
                        }
                    }
                }
                if constant == -1 || set.is_empty() {
                    return Expr::Const(constant);
                }
                if constant != 0 {
                    set.insert(Expr::Const(constant));
                }
                return collapse(ExprOp::Or, set);
            }

            ExprOp::Xor => {
                flatten(ExprOp::Xor, &mut args);
                let mut constant: i128 = 0;
                let mut set: BTreeSet<Expr> = BTreeSet::new();
                for arg in args.drain(..) {
                    match arg {
                        Expr::Const(c) => constant ^= c,
                        other => {
                            // pairs cancel
                            if !set.remove(&other) {
                                set.insert(other);
                            }
                        }
                    }
                }
                if set.is_empty() {
                    return Expr::Const(constant);
                }
                if constant != 0 {
                    set.insert(Expr::Const(constant));
                }
                return collapse(ExprOp::Xor, set);
            }

            ExprOp::Shl => {
                let (lhs, rhs) = two(&mut args);
                if let Some(distributed) = distribute_left(
                    ExprOp::Shl,
                    &lhs,
                    &rhs,
                    &[ExprOp::Add, ExprOp::And, ExprOp::Or, ExprOp::Xor],
                ) {
                    (op, args) = distributed;
                    continue;
                }
                if let Expr::Node(ExprOp::Shl, inner) = &lhs {
                    // (a << b) << c = a << (b + c)
                    let amount = Expr::node(ExprOp::Add, vec![inner[1].clone(), rhs]);
                    args = vec![inner[0].clone(), amount];
                    continue;
                }
                if let Expr::Node(ExprOp::Shr, inner) = &lhs {
                    // (a >> b) << b = a
                    if inner[1] == rhs {
                        return inner[0].clone();
                    }
                }
                if lhs == Expr::Const(0) {
                    return Expr::Const(0);
                }
                if let Expr::Const(n) = rhs {
                    if let Expr::Const(c) = lhs {
                        return Expr::Const(ints::shl(c, n));
                    }
                    if n >= 0 {
                        // a << n = 2^n * a
                        op = ExprOp::Mul;
                        args = vec![Expr::Const(ints::shl(1, n)), lhs];
                        continue;
                    }
                    op = ExprOp::Shr;
                    args = vec![lhs, Expr::Const(n.wrapping_neg())];
                    continue;
                }
                return Expr::raw(ExprOp::Shl, vec![lhs, rhs]);
            }

            ExprOp::Shr => {
                let (lhs, rhs) = two(&mut args);
                if let Some(distributed) = distribute_left(
                    ExprOp::Shr,
                    &lhs,
                    &rhs,
                    &[ExprOp::And, ExprOp::Or, ExprOp::Xor],
                ) {
                    (op, args) = distributed;
                    continue;
                }
                if let Expr::Node(ExprOp::Shl, inner) = &lhs {
                    // (a << b) >> c = a << (b - c)
                    let amount = Expr::sub(inner[1].clone(), rhs);
                    op = ExprOp::Shl;
                    args = vec![inner[0].clone(), amount];
                    continue;
                }
                if let Expr::Node(ExprOp::Shr, inner) = &lhs {
                    // (a >> b) >> c = a >> (b + c)
                    let amount = Expr::node(ExprOp::Add, vec![inner[1].clone(), rhs]);
                    args = vec![inner[0].clone(), amount];
                    continue;
                }
                if lhs == Expr::Const(0) {
                    return Expr::Const(0);
                }
                if let Expr::Const(n) = rhs {
                    if let Expr::Const(c) = lhs {
                        return Expr::Const(ints::shr(c, n));
                    }
                    if n <= 0 {
                        op = ExprOp::Shl;
                        args = vec![lhs, Expr::Const(n.wrapping_neg())];
                        continue;
                    }
                }
                return Expr::raw(ExprOp::Shr, vec![lhs, rhs]);
            }

            ExprOp::Eq | ExprOp::Neq | ExprOp::Lt | ExprOp::Leq => {
                let (lhs, rhs) = two(&mut args);
                if lhs == rhs {
                    return Expr::Const(matches!(op, ExprOp::Eq | ExprOp::Leq) as i128);
                }
                if let (Expr::Const(a), Expr::Const(b)) = (&lhs, &rhs) {
                    return Expr::Const(match op {
                        ExprOp::Eq => 0,  // structural equality already ruled out
                        ExprOp::Neq => 1,
                        ExprOp::Lt => (a < b) as i128,
                        ExprOp::Leq => (a <= b) as i128,
                        _ => unreachable!("comparison arm"),
                    });
                }
                if lhs != Expr::Const(0) {
                    // pin to 0 op (right - left)
                    let rewritten = Expr::sub(rhs, lhs);
                    args = vec![Expr::Const(0), rewritten];
                    continue;
                }
                return Expr::raw(op, vec![lhs, rhs]);
            }
        }
    }
}

fn reduce_phi(args: Vec<Expr>) -> Expr {
    // layout: [target, v1, labels1, v2, labels2, ...]
    let mut mapping: BTreeMap<Expr, BTreeSet<Expr>> = BTreeMap::new();
    let target = args[0].clone();
    for pair in args[1..].chunks(2) {
        if pair.len() < 2 {
            break;
        }
        mapping
            .entry(pair[0].clone())
            .or_default()
            .insert(pair[1].clone());
    }
    if mapping.len() == 1 {
        // the phi is a copy
        return mapping.into_keys().next().expect("length checked");
    }
    let mut rebuilt = vec![target];
    for (value, labels) in mapping {
        rebuilt.push(value);
        rebuilt.push(Expr::node(ExprOp::Or, labels.into_iter().collect()));
    }
    Expr::raw(ExprOp::Phi, rebuilt)
}

/// Associativity: splice nested nodes of the same operator into the list.
fn flatten(op: ExprOp, args: &mut Vec<Expr>) {
    if !args.iter().any(|a| a.op() == Some(op)) {
        return;
    }
    let mut flat = Vec::with_capacity(args.len());
    for arg in args.drain(..) {
        match arg {
            Expr::Node(inner, sub) if inner == op => flat.extend(sub),
            other => flat.push(other),
        }
    }
    *args = flat;
}

/// Distribute `op` over the first argument that is one of `over`:
/// `a . (b : c) . d = (a . b . d) : (a . c . d)`.
fn distribute(op: ExprOp, args: &[Expr], over: &[ExprOp]) -> Option<(ExprOp, Vec<Expr>)> {
    for (i, arg) in args.iter().enumerate() {
        let Expr::Node(inner, sub) = arg else {
            continue;
        };
        if !over.contains(inner) {
            continue;
        }
        let distributed = sub
            .iter()
            .map(|term| {
                let mut inner_args: Vec<Expr> = args[..i].to_vec();
                inner_args.push(term.clone());
                inner_args.extend(args[i + 1..].iter().cloned());
                Expr::node(op, inner_args)
            })
            .collect();
        return Some((*inner, distributed));
    }
    None
}

/// Distribute a shift over its left operand: `(a : b) . c = (a . c) : (b . c)`.
fn distribute_left(
    op: ExprOp,
    lhs: &Expr,
    rhs: &Expr,
    over: &[ExprOp],
) -> Option<(ExprOp, Vec<Expr>)> {
    let Expr::Node(inner, sub) = lhs else {
        return None;
    };
    if !over.contains(inner) {
        return None;
    }
    let distributed = sub
        .iter()
        .map(|term| Expr::node(op, vec![term.clone(), rhs.clone()]))
        .collect();
    Some((*inner, distributed))
}

fn collapse(op: ExprOp, set: BTreeSet<Expr>) -> Expr {
    let mut args: Vec<Expr> = set.into_iter().collect();
    if args.len() == 1 {
        args.pop().expect("length checked")
    } else {
        Expr::raw(op, args)
    }
}

fn two(args: &mut Vec<Expr>) -> (Expr, Expr) {
    debug_assert_eq!(args.len(), 2);
    let rhs = args.pop().expect("binary node");
    let lhs = args.pop().expect("binary node");
    (lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atom(name: &str) -> Expr {
        Expr::Atom(name.to_string())
    }

    fn add(lhs: Expr, rhs: Expr) -> Expr {
        Expr::node(ExprOp::Add, vec![lhs, rhs])
    }

    fn mul(lhs: Expr, rhs: Expr) -> Expr {
        Expr::node(ExprOp::Mul, vec![lhs, rhs])
    }

    #[test]
    fn test_commutativity_and_associativity() {
        let a = || atom("%a");
        let b = || atom("%b");
        let c = || atom("%c");
        assert_eq!(add(a(), b()), add(b(), a()));
        assert_eq!(add(add(a(), b()), c()), add(a(), add(b(), c())));
        assert_eq!(mul(a(), b()), mul(b(), a()));
        assert_eq!(mul(mul(a(), b()), c()), mul(a(), mul(b(), c())));
    }

    #[test]
    fn test_cancellation_identities() {
        let a = || atom("%a");
        assert_eq!(Expr::sub(a(), a()), Expr::Const(0));
        assert_eq!(Expr::node(ExprOp::Xor, vec![a(), a()]), Expr::Const(0));
        assert_eq!(Expr::node(ExprOp::And, vec![a(), a()]), a());
        assert_eq!(Expr::node(ExprOp::Or, vec![a(), a()]), a());
    }

    #[test]
    fn test_like_term_grouping() {
        // a + a + a = 3a
        let a = || atom("%a");
        let sum = add(add(a(), a()), a());
        assert_eq!(sum, mul(Expr::Const(3), a()));
        // 2a - a = a
        let diff = Expr::sub(mul(Expr::Const(2), a()), a());
        assert_eq!(diff, a());
    }

    #[test]
    fn test_constant_folding() {
        assert_eq!(add(Expr::Const(2), Expr::Const(3)), Expr::Const(5));
        assert_eq!(mul(Expr::Const(4), Expr::Const(-3)), Expr::Const(-12));
        assert_eq!(
            Expr::node(ExprOp::Div, vec![Expr::Const(-7), Expr::Const(2)]),
            Expr::Const(-4)
        );
        assert_eq!(
            Expr::node(ExprOp::Mod, vec![Expr::Const(-7), Expr::Const(2)]),
            Expr::Const(1)
        );
        // the algebra treats zero divisors as the sentinel 0
        assert_eq!(
            Expr::node(ExprOp::Div, vec![atom("%a"), Expr::Const(0)]),
            Expr::Const(0)
        );
        assert_eq!(
            Expr::node(ExprOp::Mod, vec![atom("%a"), Expr::Const(0)]),
            Expr::Const(0)
        );
    }

    #[test]
    fn test_multiplication_absorbers() {
        let a = || atom("%a");
        assert_eq!(mul(Expr::Const(0), a()), Expr::Const(0));
        assert_eq!(mul(Expr::Const(1), a()), a());
    }

    #[test]
    fn test_distribution() {
        // (a + b) * 2 = 2a + 2b
        let a = || atom("%a");
        let b = || atom("%b");
        let lhs = mul(add(a(), b()), Expr::Const(2));
        let rhs = add(mul(Expr::Const(2), a()), mul(Expr::Const(2), b()));
        assert_eq!(lhs, rhs);
    }

    #[test]
    fn test_shift_rules() {
        let a = || atom("%a");
        // constant shift becomes a power-of-two product
        assert_eq!(
            Expr::node(ExprOp::Shl, vec![a(), Expr::Const(3)]),
            mul(Expr::Const(8), a())
        );
        // negative shift mirrors
        assert_eq!(
            Expr::node(ExprOp::Shl, vec![a(), Expr::Const(-2)]),
            Expr::node(ExprOp::Shr, vec![a(), Expr::Const(2)])
        );
        // (a << b) << c = a << (b + c)
        let b = || atom("%b");
        let c = || atom("%c");
        let nested = Expr::node(
            ExprOp::Shl,
            vec![Expr::node(ExprOp::Shl, vec![a(), b()]), c()],
        );
        let flat = Expr::node(ExprOp::Shl, vec![a(), add(b(), c())]);
        assert_eq!(nested, flat);
        // (a >> b) << b = a
        let round = Expr::node(
            ExprOp::Shl,
            vec![Expr::node(ExprOp::Shr, vec![a(), b()]), b()],
        );
        assert_eq!(round, a());
    }

    #[test]
    fn test_comparison_canonicalisation() {
        let a = || atom("%a");
        let b = || atom("%b");
        assert_eq!(Expr::node(ExprOp::Eq, vec![a(), a()]), Expr::Const(1));
        assert_eq!(Expr::node(ExprOp::Lt, vec![a(), a()]), Expr::Const(0));
        // a < b and 0 < b - a identify
        let direct = Expr::node(ExprOp::Lt, vec![a(), b()]);
        let pinned = Expr::node(ExprOp::Lt, vec![Expr::Const(0), Expr::sub(b(), a())]);
        assert_eq!(direct, pinned);
    }

    #[test]
    fn test_phi_collapse_and_target_mulligan() {
        let phi = Expr::node(
            ExprOp::Phi,
            vec![atom("%x"), Expr::Const(5), atom("@a"), Expr::Const(5), atom("@b")],
        );
        assert_eq!(phi, Expr::Const(5));

        let p1 = Expr::node(
            ExprOp::Phi,
            vec![atom("%x"), Expr::Const(1), atom("@a"), Expr::Const(2), atom("@b")],
        );
        let p2 = Expr::node(
            ExprOp::Phi,
            vec![atom("%y"), Expr::Const(1), atom("@a"), Expr::Const(2), atom("@b")],
        );
        assert_eq!(p1, p2);
        assert_ne!(
            p1,
            Expr::node(
                ExprOp::Phi,
                vec![atom("%x"), Expr::Const(1), atom("@a"), Expr::Const(3), atom("@b")],
            )
        );
    }

    #[test]
    fn test_polish_round_trip() {
        let exprs = vec![
            Expr::Const(-17),
            atom("%reg.3"),
            add(atom("%a"), mul(Expr::Const(2), atom("%b"))),
            Expr::node(ExprOp::Lt, vec![atom("%a"), atom("%b")]),
            Expr::node(
                ExprOp::Phi,
                vec![atom("%x"), Expr::Const(1), atom("@a"), atom("%z"), atom("@b")],
            ),
        ];
        for expr in exprs {
            let text = expr.polish();
            assert_eq!(Expr::read_polish(&text).unwrap(), expr, "polish: {}", text);
        }
    }

    #[test]
    fn test_recipe_reconstructs_subtraction() {
        let a = || atom("%a");
        let b = || atom("%b");
        let diff = Expr::sub(a(), b());
        match diff.recipe() {
            Recipe::Binary(BinaryOp::Sub, lhs, rhs) => {
                assert_eq!(*lhs, a());
                assert_eq!(*rhs, b());
            }
            _ => panic!("expected subtraction recipe"),
        }
    }

    #[test]
    fn test_recipe_power_of_two_multiplication() {
        let m = mul(Expr::Const(8), atom("%a"));
        match m.recipe() {
            Recipe::Binary(BinaryOp::Shl, lhs, rhs) => {
                assert_eq!(*lhs, atom("%a"));
                assert_eq!(*rhs, Expr::Const(3));
            }
            _ => panic!("expected shift recipe"),
        }
    }

    #[test]
    fn test_integer_wrapping() {
        let max = Expr::Const(i128::MAX);
        assert_eq!(add(max.clone(), Expr::Const(1)), Expr::Const(i128::MIN));
    }
}
