//! Textual A-Mi reader
//!
//! Parses line-oriented A-Mi source into a [`Cfg`]. A leading `@L:` starts
//! a block; a block that does not end in a terminator falls through to the
//! next block via a synthesised `goto`. Comments begin with `;`; the forms
//! `;#!key: ...`, `;@!key: ...` and `;%!key: ...` attach metadata at CFG,
//! block and instruction scope respectively.

use crate::cfg::Cfg;
use crate::instruction::{BinaryOp, Instruction, Operand};
use crate::metadata::Metadata;
use ami_common::{AmiError, AmiResult};
use regex::Regex;

const ID: &str = r"[.\w]+";

/// Reader configuration.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Permit blocks without an explicit label (they receive generated
    /// `@._N` labels). When false, such blocks fail with `AnonymousBlock`.
    pub allow_anonymous_blocks: bool,
    /// Entrypoint label; defaults to the first block in the source.
    pub entrypoint: Option<String>,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions { allow_anonymous_blocks: true, entrypoint: None }
    }
}

/// Parses A-Mi source text into a CFG.
pub struct CfgBuilder {
    options: ReaderOptions,
    syntax: Syntax,
}

struct Syntax {
    mov: Regex,
    phi: Regex,
    phi_arg: Regex,
    binary: Regex,
    goto: Regex,
    branch: Regex,
    exit: Regex,
    read: Regex,
    write: Regex,
    brkpt: Regex,
}

impl Syntax {
    fn new() -> Self {
        let reg = format!(r"%{}", ID);
        let num = r"-?\d+";
        let ron = format!(r"(?:{}|{})", reg, num);
        let lbl = format!(r"@{}", ID);
        // ordering matters in the operator alternation: two-character
        // symbols must come before their one-character prefixes
        let op = r"==|!=|<=|<<|>>|[-+*/%&|^<]";

        let build = |pattern: String| {
            // literal spaces in the pattern accept arbitrary whitespace
            Regex::new(&format!("^{}$", pattern.replace(' ', r"\s*"))).expect("static pattern")
        };

        Syntax {
            mov: build(format!(r"({reg}) = ({ron})")),
            phi: build(format!(r"({reg}) = phi ((?: \[ {ron} , {lbl} \] ,?)+)")),
            phi_arg: Regex::new(&format!(r"\[\s*({ron})\s*,\s*({lbl})\s*\]")).expect("static pattern"),
            binary: build(format!(r"({reg}) = ({ron}) ({op}) ({ron})")),
            goto: build(format!(r"goto ({lbl})")),
            branch: build(format!(r"branch ({ron}) \? ({lbl}) : ({lbl})")),
            exit: build("exit".to_string()),
            read: build(format!(r"read ({reg})")),
            write: build(format!(r"write ({ron})")),
            brkpt: build(format!(r"brkpt !({ID})")),
        }
    }

    fn parse(&self, text: &str) -> Option<Instruction> {
        if let Some(m) = self.mov.captures(text) {
            return Some(Instruction::mov(&m[1], Operand::parse(&m[2])?));
        }
        if let Some(m) = self.phi.captures(text) {
            let mut args = Vec::new();
            for arg in self.phi_arg.captures_iter(&m[2]) {
                args.push((Operand::parse(&arg[1])?, arg[2].to_string()));
            }
            return Some(Instruction::phi(&m[1], args));
        }
        if let Some(m) = self.binary.captures(text) {
            return Some(Instruction::binary(
                &m[1],
                BinaryOp::from_symbol(&m[3])?,
                Operand::parse(&m[2])?,
                Operand::parse(&m[4])?,
            ));
        }
        if let Some(m) = self.goto.captures(text) {
            return Some(Instruction::goto(&m[1]));
        }
        if let Some(m) = self.branch.captures(text) {
            return Some(Instruction::branch(Operand::parse(&m[1])?, &m[2], &m[3]));
        }
        if self.exit.is_match(text) {
            return Some(Instruction::exit());
        }
        if let Some(m) = self.read.captures(text) {
            return Some(Instruction::read(&m[1]));
        }
        if let Some(m) = self.write.captures(text) {
            return Some(Instruction::write(Operand::parse(&m[1])?));
        }
        if let Some(m) = self.brkpt.captures(text) {
            return Some(Instruction::brkpt(&m[1]));
        }
        None
    }
}

struct PendingBlock {
    label: Option<String>,
    line: usize,
    instructions: Vec<Instruction>,
    meta: Metadata,
    // a terminator has been seen; the block stays pending only to receive
    // trailing metadata comment lines
    closed: bool,
}

impl PendingBlock {
    fn open(label: Option<String>, line: usize) -> PendingBlock {
        PendingBlock {
            label,
            line,
            instructions: Vec::new(),
            meta: Metadata::new(),
            closed: false,
        }
    }
}

impl CfgBuilder {
    pub fn new(options: ReaderOptions) -> Self {
        CfgBuilder { options, syntax: Syntax::new() }
    }

    /// Build a CFG from A-Mi source text.
    pub fn build(&self, source: &str) -> AmiResult<Cfg> {
        let mut cfg = Cfg::new();
        let mut current: Option<PendingBlock> = None;
        let mut anonymous = 0usize;
        let mut order: Vec<String> = Vec::new();

        for (line_no, raw) in source.lines().enumerate() {
            let (code, comment) = match raw.find(';') {
                Some(at) => (&raw[..at], Some(&raw[at + 1..])),
                None => (raw, None),
            };

            let mut code = code.trim().to_string();
            if code.starts_with('@') {
                if let Some(colon) = code.find(':') {
                    // a new block begins; an unterminated previous one
                    // falls through
                    let label = code[..colon].trim().to_string();
                    let rest = code[colon + 1..].trim().to_string();
                    self.commit(&mut cfg, &mut current, &mut anonymous, &mut order, Some(&label))?;
                    current = Some(PendingBlock::open(Some(label), line_no));
                    code = rest;
                }
            }

            if !code.is_empty() {
                let cleaned: String = code.split_whitespace().collect::<Vec<_>>().join(" ");
                let instruction = self
                    .syntax
                    .parse(&cleaned)
                    .ok_or_else(|| AmiError::parse(line_no, format!("cannot parse \"{}\"", cleaned)))?;
                if current.as_ref().is_some_and(|b| b.closed) {
                    // instructions after a terminator start a fresh block
                    self.commit(&mut cfg, &mut current, &mut anonymous, &mut order, None)?;
                }
                let closed = instruction.is_terminator();
                let block = current.get_or_insert_with(|| PendingBlock::open(None, line_no));
                block.instructions.push(instruction);
                block.closed |= closed;
            }

            // metadata attaches to the pending block, which lingers after
            // its terminator exactly to catch trailing comment lines
            if let Some(comment) = comment {
                Self::attach_metadata(comment, &mut cfg, &mut current);
            }
        }

        self.commit(&mut cfg, &mut current, &mut anonymous, &mut order, None)?;

        if cfg.is_empty() {
            return Err(AmiError::EmptyCfg);
        }

        cfg.link()?;
        match &self.options.entrypoint {
            Some(label) => cfg.set_entrypoint(label)?,
            None => cfg.set_entrypoint(&order[0])?,
        }
        cfg.verify()?;
        Ok(cfg)
    }

    fn commit(
        &self,
        cfg: &mut Cfg,
        current: &mut Option<PendingBlock>,
        anonymous: &mut usize,
        order: &mut Vec<String>,
        next_label: Option<&str>,
    ) -> AmiResult<()> {
        let Some(mut block) = current.take() else {
            return Ok(());
        };
        if block.instructions.is_empty() && block.meta.is_empty() && block.label.is_none() {
            return Ok(());
        }

        let label = match block.label.take() {
            Some(label) => label,
            None => {
                if !self.options.allow_anonymous_blocks {
                    return Err(AmiError::AnonymousBlock { line: block.line });
                }
                let label = format!("@._{}", anonymous);
                *anonymous += 1;
                label
            }
        };

        let ends_in_terminator =
            block.instructions.last().map(|i| i.is_terminator()) == Some(true);
        if !ends_in_terminator {
            match next_label {
                Some(next) => block.instructions.push(Instruction::goto(next)),
                None => block.instructions.push(Instruction::exit()),
            }
        }

        cfg.add_block(&label, block.instructions)?;
        cfg.block_mut(&label)?.meta = block.meta;
        order.push(label);
        Ok(())
    }

    /// Attach a metadata comment to the right scope. Non-metadata comments
    /// are discarded.
    fn attach_metadata(comment: &str, cfg: &mut Cfg, current: &mut Option<PendingBlock>) {
        let Some(scope) = comment.chars().next() else {
            return;
        };
        if !matches!(scope, '#' | '@' | '%') || !comment[1..].starts_with('!') {
            return;
        }
        let Some((key, values)) = comment[2..].split_once(':') else {
            return;
        };
        let key = key.trim().to_string();
        let values: Vec<String> = values.split_whitespace().map(String::from).collect();
        match scope {
            '#' => cfg.meta.append(key, values),
            '@' => {
                if let Some(block) = current {
                    block.meta.append(key, values);
                }
            }
            '%' => {
                if let Some(block) = current {
                    if let Some(instruction) = block.instructions.last_mut() {
                        instruction.meta.append(key, values);
                    }
                }
            }
            _ => {}
        }
    }
}

impl Default for CfgBuilder {
    fn default() -> Self {
        Self::new(ReaderOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::InstructionKind;

    fn read(source: &str) -> Cfg {
        CfgBuilder::default().build(source).unwrap()
    }

    #[test]
    fn test_read_fibonacci() {
        let cfg = read(
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
        assert_eq!(cfg.len(), 4);
        assert_eq!(cfg.entry_label(), "@entry");
        let body = cfg.block("@body").unwrap();
        assert_eq!(body.children().as_slice(), ["@loop"]);
        let lp = cfg.block("@loop").unwrap();
        assert_eq!(lp.parents().collect::<Vec<_>>(), ["@body", "@entry"]);
    }

    #[test]
    fn test_fallthrough_synthesises_goto() {
        let cfg = read("@a: %x = 1\n@b: write %x\nexit");
        let a = cfg.block("@a").unwrap();
        match &a.terminator().unwrap().kind {
            InstructionKind::Goto { target } => assert_eq!(target, "@b"),
            other => panic!("expected goto, got {:?}", other),
        }
    }

    #[test]
    fn test_whitespace_insensitive_parsing() {
        let cfg = read("@a:%x=%y+ -3\nexit");
        let a = cfg.block("@a").unwrap();
        match &a.instructions[0].kind {
            InstructionKind::Binary { op, rhs, .. } => {
                assert_eq!(*op, BinaryOp::Add);
                assert_eq!(rhs, &Operand::Const(-3));
            }
            other => panic!("expected binary, got {:?}", other),
        }
    }

    #[test]
    fn test_phi_parsing() {
        let cfg = read(
            "@a: branch 1 ? @b : @c\n\
             @b: goto @d\n\
             @c: goto @d\n\
             @d: %x = phi [ 5, @b ], [ -1, @c ]\n\
             exit",
        );
        let d = cfg.block("@d").unwrap();
        match &d.instructions[0].kind {
            InstructionKind::Phi { args, .. } => {
                assert_eq!(args.len(), 2);
                assert_eq!(args[0], (Operand::Const(5), "@b".to_string()));
            }
            other => panic!("expected phi, got {:?}", other),
        }
    }

    #[test]
    fn test_metadata_scopes() {
        let cfg = read(
            ";#!passes: ssa $\n\
             @a: ;@!note: hot\n\
             %x = 1 ;%!vn: 1\n\
             exit",
        );
        assert_eq!(cfg.meta.get("passes").unwrap(), &["ssa", "$"]);
        let a = cfg.block("@a").unwrap();
        assert_eq!(a.meta.get("note").unwrap(), &["hot"]);
        assert_eq!(a.instructions[0].meta.get("vn").unwrap(), &["1"]);
    }

    #[test]
    fn test_errors() {
        let builder = CfgBuilder::default();
        assert_eq!(builder.build("").unwrap_err(), AmiError::EmptyCfg);
        assert!(matches!(
            builder.build("@a: %x = %y +\nexit").unwrap_err(),
            AmiError::Parse { line: 0, .. }
        ));
        assert!(matches!(
            builder.build("@a: goto @nowhere").unwrap_err(),
            AmiError::BadLabel { .. }
        ));

        let strict = CfgBuilder::new(ReaderOptions {
            allow_anonymous_blocks: false,
            entrypoint: None,
        });
        assert!(matches!(
            strict.build("%x = 1\nexit").unwrap_err(),
            AmiError::AnonymousBlock { .. }
        ));

        let entry = CfgBuilder::new(ReaderOptions {
            allow_anonymous_blocks: true,
            entrypoint: Some("@missing".to_string()),
        });
        assert!(matches!(
            entry.build("@a: exit").unwrap_err(),
            AmiError::NoEntryPoint { .. }
        ));
    }

    #[test]
    fn test_bad_phi_label_rejected() {
        let err = CfgBuilder::default()
            .build("@a: %x = phi [ 1, @zz ]\nexit\n@zz: exit")
            .unwrap_err();
        assert!(matches!(err, AmiError::BadPhi { .. }));
    }

    #[test]
    fn test_branch_arms_may_coincide() {
        let cfg = read("@a: branch %c ? @b : @b\n@b: exit");
        assert_eq!(cfg.block("@a").unwrap().children().as_slice(), ["@b", "@b"]);
    }
}
