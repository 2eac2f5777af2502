//! Reference interpreter for A-Mi
//!
//! Simulates the execution of a program encoded as an [`ami_ir::Cfg`],
//! one instruction at a time. Registers hold signed integers reduced
//! modulo `2^bits`. The interpreter is strictly single-threaded; `read`,
//! `write` and `brkpt` are cooperative suspensions returned to the
//! embedder, which services them through [`Interpreter::set_register`] /
//! [`Interpreter::register`] and resumes stepping.

use ami_common::{ints, AmiError, AmiResult};
use ami_ir::{BinaryOp, Cfg, InstructionKind, Operand};
use std::collections::HashMap;

/// Virtual register file. Integer literals read back as themselves.
#[derive(Debug, Clone, Default)]
pub struct RegFile {
    values: HashMap<String, i128>,
    bits: u32,
}

impl RegFile {
    pub fn new(bits: u32) -> Self {
        RegFile { values: HashMap::new(), bits }
    }

    pub fn get(&self, operand: &Operand) -> AmiResult<i128> {
        match operand {
            Operand::Const(value) => Ok(ints::truncate(*value, self.bits)),
            Operand::Reg(name) => self.get_reg(name),
        }
    }

    /// Look up a register by name; integer literals read back as themselves.
    pub fn get_reg(&self, name: &str) -> AmiResult<i128> {
        if let Some(value) = self.values.get(name) {
            return Ok(*value);
        }
        if let Ok(value) = name.parse::<i128>() {
            return Ok(ints::truncate(value, self.bits));
        }
        Err(AmiError::load(format!(
            "{} is not an integer or a defined register",
            name
        )))
    }

    pub fn set(&mut self, name: &str, value: i128) {
        self.values.insert(name.to_string(), ints::truncate(value, self.bits));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Defined register names, sorted.
    pub fn registers(&self) -> Vec<&str> {
        let mut regs: Vec<&str> = self.values.keys().map(String::as_str).collect();
        regs.sort_unstable();
        regs
    }
}

/// Outcome of advancing the interpreter.
///
/// The three suspensions are distinguished exits: the embedder supplies the
/// value for `Read` (via [`Interpreter::set_register`]), consumes the value
/// for `Write` (via [`Interpreter::register`]), and simply observes
/// `Breakpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Continue,
    Exited,
    Read(String),
    Write(String),
    Breakpoint(String),
}

/// Step-wise executor over a loaded CFG.
pub struct Interpreter<'a> {
    cfg: &'a Cfg,
    regs: RegFile,
    block: Option<String>,
    index: usize,
    prev_label: Option<String>,
}

impl<'a> Interpreter<'a> {
    pub fn new(cfg: &'a Cfg) -> Self {
        Self::with_bits(cfg, ints::INT_BITS)
    }

    pub fn with_bits(cfg: &'a Cfg, bits: u32) -> Self {
        Interpreter {
            cfg,
            regs: RegFile::new(bits),
            block: Some(cfg.entry_label().to_string()),
            index: 0,
            prev_label: None,
        }
    }

    pub fn is_executing(&self) -> bool {
        self.block.is_some()
    }

    pub fn block_label(&self) -> Option<&str> {
        self.block.as_deref()
    }

    pub fn register(&self, name: &str) -> AmiResult<i128> {
        self.regs.get_reg(name)
    }

    pub fn operand(&self, operand: &Operand) -> AmiResult<i128> {
        self.regs.get(operand)
    }

    pub fn set_register(&mut self, name: &str, value: i128) {
        self.regs.set(name, value);
    }

    pub fn registers(&self) -> &RegFile {
        &self.regs
    }

    /// Execute a single instruction and advance the program counter.
    pub fn step(&mut self) -> AmiResult<Step> {
        let Some(label) = self.block.clone() else {
            return Err(AmiError::load("program already completed"));
        };
        let block = self.cfg.block(&label)?;
        let Some(instruction) = block.instructions.get(self.index) else {
            return Err(AmiError::load(format!("{} exhausted without terminator", label)));
        };
        let index = self.index;
        self.index += 1;
        log::trace!("[{}:{}] {}", label, index, instruction);

        match &instruction.kind {
            InstructionKind::Mov { dst, src } => {
                let value = self.regs.get(src)?;
                self.regs.set(dst, value);
            }
            InstructionKind::Phi { dst, args } => {
                let prev = self.prev_label.clone().ok_or_else(|| {
                    AmiError::opt(label.as_str(), index, "phi at the entrypoint cannot resolve")
                })?;
                let chosen = args.iter().find(|(_, l)| *l == prev).ok_or_else(|| {
                    AmiError::opt(
                        label.as_str(),
                        index,
                        format!("phi cannot resolve branch from {}", prev),
                    )
                })?;
                let value = self.regs.get(&chosen.0)?;
                self.regs.set(dst, value);
            }
            InstructionKind::Binary { dst, op, lhs, rhs } => {
                let a = self.regs.get(lhs)?;
                let b = self.regs.get(rhs)?;
                let result = self.eval(*op, a, b, &label, index)?;
                self.regs.set(dst, result);
            }
            InstructionKind::Goto { target } => {
                self.jump(&label, target.clone());
            }
            InstructionKind::Branch { cond, if_true, if_false } => {
                let taken = if self.regs.get(cond)? != 0 { if_true } else { if_false };
                let taken = taken.clone();
                self.jump(&label, taken);
            }
            InstructionKind::Exit => {
                self.prev_label = Some(label);
                self.block = None;
                return Ok(Step::Exited);
            }
            InstructionKind::Read { dst } => {
                return Ok(Step::Read(dst.clone()));
            }
            InstructionKind::Write { src } => {
                self.regs.get(src)?;
                let name = match src {
                    Operand::Reg(name) => name.clone(),
                    Operand::Const(value) => value.to_string(),
                };
                return Ok(Step::Write(name));
            }
            InstructionKind::Brkpt { name } => {
                return Ok(Step::Breakpoint(name.clone()));
            }
        }
        Ok(Step::Continue)
    }

    /// Run until the next suspension or exit.
    pub fn run(&mut self) -> AmiResult<Step> {
        loop {
            let step = self.step()?;
            if step != Step::Continue {
                return Ok(step);
            }
        }
    }

    fn jump(&mut self, from: &str, to: String) {
        self.prev_label = Some(from.to_string());
        self.block = Some(to);
        self.index = 0;
    }

    fn eval(&self, op: BinaryOp, a: i128, b: i128, block: &str, index: usize) -> AmiResult<i128> {
        Ok(match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div => {
                if b == 0 {
                    return Err(AmiError::DivisionByZero { block: block.to_string(), index });
                }
                ints::floor_div(a, b)
            }
            BinaryOp::Mod => {
                if b == 0 {
                    return Err(AmiError::DivisionByZero { block: block.to_string(), index });
                }
                ints::floor_mod(a, b)
            }
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => ints::shl(a, b),
            BinaryOp::Shr => ints::shr(a, b),
            BinaryOp::Eq => (a == b) as i128,
            BinaryOp::Neq => (a != b) as i128,
            BinaryOp::Lt => (a < b) as i128,
            BinaryOp::Leq => (a <= b) as i128,
        })
    }
}

/// Run a program to completion, feeding `inputs` to successive `read`s and
/// collecting the values passed to `write`. Breakpoints are skipped.
/// Intended for tests and the CLI's non-interactive mode.
pub fn execute(cfg: &Cfg, inputs: &[i128]) -> AmiResult<Vec<i128>> {
    let mut interp = Interpreter::new(cfg);
    let mut inputs = inputs.iter();
    let mut outputs = Vec::new();
    loop {
        match interp.run()? {
            Step::Exited => return Ok(outputs),
            Step::Read(reg) => {
                let value = inputs
                    .next()
                    .copied()
                    .ok_or_else(|| AmiError::load(format!("no input left for read {}", reg)))?;
                interp.set_register(&reg, value);
            }
            Step::Write(reg) => {
                outputs.push(interp.register(&reg)?);
            }
            Step::Breakpoint(name) => {
                log::debug!("breakpoint !{}", name);
            }
            Step::Continue => unreachable!("run returns only suspensions"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    fn load(source: &str) -> Cfg {
        CfgBuilder::default().build(source).unwrap()
    }

    #[test]
    fn test_arithmetic_and_write() {
        let cfg = load(
            "@main: %a = 7\n\
             %b = %a * 6\n\
             %c = %b - 2\n\
             %d = %c / 8\n\
             %e = %c % 8\n\
             write %d\n\
             write %e\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[]).unwrap(), vec![5, 0]);
    }

    #[test]
    fn test_floor_division_semantics() {
        let cfg = load(
            "@main: %q = -7 / 2\n\
             %r = -7 % 2\n\
             write %q\n\
             write %r\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[]).unwrap(), vec![-4, 1]);
    }

    #[test]
    fn test_division_by_zero() {
        let cfg = load("@main: %x = 1 / 0\nexit\n");
        let err = execute(&cfg, &[]).unwrap_err();
        assert_eq!(
            err,
            AmiError::DivisionByZero { block: "@main".to_string(), index: 0 }
        );
    }

    #[test]
    fn test_branches_and_comparisons() {
        let cfg = load(
            "@main: read %n\n\
             %neg = %n < 0\n\
             branch %neg ? @minus : @plus\n\
             @minus: write -1\n\
             exit\n\
             @plus: write 1\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[-5]).unwrap(), vec![-1]);
        assert_eq!(execute(&cfg, &[5]).unwrap(), vec![1]);
    }

    #[test]
    fn test_phi_resolves_most_recent_predecessor() {
        let cfg = load(
            "@main: read %c\n\
             branch %c ? @t : @f\n\
             @t: goto @join\n\
             @f: goto @join\n\
             @join: %x = phi [ 10, @t ], [ 20, @f ]\n\
             write %x\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[1]).unwrap(), vec![10]);
        assert_eq!(execute(&cfg, &[0]).unwrap(), vec![20]);
    }

    #[test]
    fn test_negative_shift_mirrors() {
        let cfg = load(
            "@main: %a = 3 << 4\n\
             %b = %a >> -1\n\
             %c = %a << -2\n\
             write %b\n\
             write %c\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[]).unwrap(), vec![96, 12]);
    }

    #[test]
    fn test_breakpoint_suspension() {
        let cfg = load("@main: brkpt !check\nexit\n");
        let mut interp = Interpreter::new(&cfg);
        assert_eq!(interp.run().unwrap(), Step::Breakpoint("check".to_string()));
        assert_eq!(interp.run().unwrap(), Step::Exited);
    }

    #[test]
    fn test_fibonacci_loop() {
        let cfg = load(
            "@entry: read %n\n\
             %a = 0\n\
             %b = 1\n\
             goto @loop\n\
             @loop: %cond = %n <= 0\n\
             branch %cond ? @end : @body\n\
             @body: %t = %a + %b\n\
             %a = %b\n\
             %b = %t\n\
             %n = %n - 1\n\
             goto @loop\n\
             @end: write %a\n\
             exit\n",
        );
        assert_eq!(execute(&cfg, &[10]).unwrap(), vec![55]);
    }

    #[test]
    fn test_use_of_undefined_register_fails() {
        let cfg = load("@main: write %ghost\nexit\n");
        assert!(matches!(
            execute(&cfg, &[]).unwrap_err(),
            AmiError::Load { .. }
        ));
    }
}
