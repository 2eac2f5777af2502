//! Textual A-Mi writer
//!
//! Emits a CFG as plaintext A-Mi source that the reader accepts back.
//! Blocks are written in reverse postorder from the entrypoint, so
//! unreachable blocks are dropped on the way out. Metadata is written as
//! `;#!`/`;@!`/`;%!` comments, split across lines at `$` terminators.

use crate::cfg::Cfg;
use crate::metadata::Metadata;

/// Formats a CFG as A-Mi source text.
pub struct CfgWriter {
    write_meta: bool,
    tabwidth: Option<usize>,
    codewidth: Option<usize>,
}

impl Default for CfgWriter {
    fn default() -> Self {
        CfgWriter { write_meta: true, tabwidth: None, codewidth: None }
    }
}

impl CfgWriter {
    /// `tabwidth` is the indentation before an instruction and `codewidth`
    /// the width of the instruction field before trailing metadata; `None`
    /// sizes either automatically from the CFG.
    pub fn new(write_meta: bool, tabwidth: Option<usize>, codewidth: Option<usize>) -> Self {
        CfgWriter { write_meta, tabwidth, codewidth }
    }

    /// Generate the output lines for a CFG.
    pub fn generate(&self, cfg: &Cfg) -> Vec<String> {
        let tabwidth = self.tabwidth.unwrap_or_else(|| {
            cfg.labels().map(|l| l.len()).max().unwrap_or(0) + 2
        });
        let codewidth = self.codewidth.unwrap_or_else(|| {
            cfg.blocks()
                .flat_map(|b| b.instructions.iter())
                .map(|i| i.to_string().len() + 1)
                .max()
                .unwrap_or(0)
        });
        let width = tabwidth + codewidth;

        let mut lines = Vec::new();
        if self.write_meta {
            for (key, values) in cfg.meta.iter() {
                for comment in meta_comments('#', key, values) {
                    lines.push(comment);
                }
            }
        }

        for label in cfg.reverse_postorder() {
            let block = match cfg.get(&label) {
                Some(block) => block,
                None => continue,
            };
            lines.push(String::new());

            let head = format!("{:<width$}", format!("{}:", label), width = width);
            self.push_annotated(&mut lines, head, &block.meta, '@', width);

            for instruction in &block.instructions {
                let text = format!(
                    "{}{:<codewidth$}",
                    " ".repeat(tabwidth),
                    instruction.to_string(),
                    codewidth = codewidth
                );
                self.push_annotated(&mut lines, text, &instruction.meta, '%', width);
            }
        }
        lines
    }

    /// Write the CFG to a single string.
    pub fn write(&self, cfg: &Cfg) -> String {
        let mut out = self.generate(cfg).join("\n");
        out.push('\n');
        out
    }

    fn push_annotated(
        &self,
        lines: &mut Vec<String>,
        first: String,
        meta: &Metadata,
        scope: char,
        width: usize,
    ) {
        if !self.write_meta || meta.is_empty() {
            lines.push(first.trim_end().to_string());
            return;
        }
        let mut line = first;
        for (key, values) in meta.iter() {
            for comment in meta_comments(scope, key, values) {
                lines.push(format!("{}{}", line, comment));
                line = " ".repeat(width);
            }
        }
    }
}

/// Render one metadata entry as comment fragments, one per line, splitting
/// the value list after each `$`.
fn meta_comments(scope: char, key: &str, values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0usize;
    while start < values.len() || out.is_empty() {
        let end = values[start..]
            .iter()
            .position(|v| v == "$")
            .map(|p| start + p + 1)
            .unwrap_or(values.len());
        out.push(format!(";{}!{}: {}", scope, key, values[start..end].join(" ")).trim_end().to_string());
        if end == values.len() {
            break;
        }
        start = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::CfgBuilder;

    fn round_trip(source: &str) -> (Cfg, Cfg) {
        let builder = CfgBuilder::default();
        let cfg = builder.build(source).unwrap();
        let text = CfgWriter::default().write(&cfg);
        let again = builder.build(&text).unwrap();
        (cfg, again)
    }

    #[test]
    fn test_round_trip_preserves_structure() {
        let (cfg, again) = round_trip(
            "@entry: read %n\n\
             branch %n ? @yes : @no\n\
             @yes: %x = %n + 1\n\
             goto @done\n\
             @no: %x = 0 - %n\n\
             goto @done\n\
             @done: %y = phi [ %x, @yes ], [ %x, @no ]\n\
             write %y\n\
             exit\n",
        );
        assert_eq!(cfg, again);
    }

    #[test]
    fn test_round_trip_preserves_metadata() {
        let (cfg, again) = round_trip(
            ";#!classes: + `2 %a %b $\n\
             @entry: %a = 1 ;%!vn: 1\n\
             exit ;%!note: end\n",
        );
        assert_eq!(cfg.meta, again.meta);
        assert_eq!(
            cfg.block("@entry").unwrap().instructions[0].meta,
            again.block("@entry").unwrap().instructions[0].meta
        );
        assert_eq!(
            cfg.block("@entry").unwrap().instructions[1].meta,
            again.block("@entry").unwrap().instructions[1].meta
        );
    }

    #[test]
    fn test_unreachable_blocks_are_dropped() {
        let builder = CfgBuilder::default();
        let cfg = builder
            .build("@a: exit\n@dead: exit\n")
            .unwrap();
        let text = CfgWriter::default().write(&cfg);
        assert!(!text.contains("@dead"));
    }

    #[test]
    fn test_meta_comment_splitting() {
        let values: Vec<String> = ["1", "%a", "$", "2", "%b", "$"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = meta_comments('#', "classes", &values);
        assert_eq!(out, vec![";#!classes: 1 %a $", ";#!classes: 2 %b $"]);
    }
}
