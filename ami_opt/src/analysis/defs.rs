//! Definition sites
//!
//! Records where every value register is defined. A block defining a
//! register several times appears once per definition.

use ami_ir::Cfg;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct DefsAnalysis {
    sites: BTreeMap<String, Vec<(String, usize)>>,
}

impl DefsAnalysis {
    pub fn compute(cfg: &Cfg) -> DefsAnalysis {
        let mut sites: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
        for block in cfg.blocks() {
            for (i, instruction) in block.instructions.iter().enumerate() {
                if let Some(dst) = instruction.def() {
                    sites
                        .entry(dst.to_string())
                        .or_default()
                        .push((block.label().to_string(), i));
                }
            }
        }
        DefsAnalysis { sites }
    }

    /// All defined registers, sorted.
    pub fn registers(&self) -> impl Iterator<Item = &str> {
        self.sites.keys().map(String::as_str)
    }

    /// `(block, index)` sites defining a register.
    pub fn sites(&self, register: &str) -> &[(String, usize)] {
        self.sites
            .get(register)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Distinct labels of blocks defining a register.
    pub fn blocks(&self, register: &str) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .sites(register)
            .iter()
            .map(|(label, _)| label.as_str())
            .collect();
        labels.dedup();
        labels
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    #[test]
    fn test_collects_definition_sites() {
        let cfg = CfgBuilder::default()
            .build(
                "@a: read %x\n\
                 %y = %x + 1\n\
                 goto @b\n\
                 @b: %x = %y\n\
                 exit\n",
            )
            .unwrap();
        let defs = DefsAnalysis::compute(&cfg);
        assert_eq!(defs.registers().collect::<Vec<_>>(), ["%x", "%y"]);
        assert_eq!(defs.blocks("%x"), ["@a", "@b"]);
        assert_eq!(defs.sites("%y"), [("@a".to_string(), 1)]);
        assert!(defs.sites("%ghost").is_empty());
    }
}
