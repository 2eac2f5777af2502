//! Pass manager
//!
//! Parses pass specifications of the form `id(arg0, key=value)`, runs
//! passes over a CFG in the requested order, caches typed analysis results
//! keyed by pass ID, and tracks validity: when a pass finishes, every
//! cached result it did not explicitly preserve is dropped. Dependent
//! passes obtain their prerequisites through the `require`-style accessors,
//! which reuse a valid cached instance or construct and run a new one.

use crate::analysis::{DefsAnalysis, DjGraph, DomTree, LiveAnalysis};
use crate::dataflow::{AntAnalysis, AvailAnalysis};
use crate::gvn::{gargi, simpson, GvnChoice, Numbering, ValueTable};
use crate::simplify::{branch_elim, dce, phi_elim};
use crate::{regalloc, ssa, vdcm};
use ami_common::{AmiError, AmiResult};
use ami_ir::Cfg;
use hashbrown::HashMap;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

/// A parsed pass invocation: `id`, or `id(arg0, arg1, key=value, ...)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSpec {
    pub id: String,
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
}

impl FromStr for PassSpec {
    type Err = AmiError;

    fn from_str(text: &str) -> AmiResult<PassSpec> {
        let text = text.trim();
        let (id, arguments) = match text.find('(') {
            None => (text, None),
            Some(open) => {
                let Some(inner) = text[open..].strip_prefix('(').and_then(|t| t.strip_suffix(')'))
                else {
                    return Err(AmiError::bad_argument(text, "malformed argument list"));
                };
                (&text[..open], Some(inner))
            }
        };

        let valid_id = !id.is_empty()
            && id.chars().next().is_some_and(|c| c.is_ascii_lowercase())
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_id {
            return Err(AmiError::bad_argument(id, "pass IDs match [a-z][a-z0-9-]*"));
        }

        let mut spec = PassSpec {
            id: id.to_string(),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
        };
        if let Some(arguments) = arguments {
            for piece in arguments.split(',') {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                match piece.split_once('=') {
                    Some((key, value)) => {
                        spec.kwargs
                            .insert(key.trim().to_string(), value.trim().to_string());
                    }
                    None => {
                        if !spec.kwargs.is_empty() {
                            return Err(AmiError::bad_argument(
                                id,
                                "positional arguments precede keyword arguments",
                            ));
                        }
                        spec.args.push(piece.to_string());
                    }
                }
            }
        }
        Ok(spec)
    }
}

impl fmt::Display for PassSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)?;
        if self.args.is_empty() && self.kwargs.is_empty() {
            return Ok(());
        }
        let mut pieces: Vec<String> = self.args.clone();
        pieces.extend(self.kwargs.iter().map(|(k, v)| format!("{}={}", k, v)));
        write!(f, "({})", pieces.join(", "))
    }
}

/// What a pass leaves valid after running. `all` keeps every cached
/// analysis; `only` lists the surviving base IDs (including the pass's own
/// results).
#[derive(Debug, Clone, Copy)]
pub struct Preserved(Option<&'static [&'static str]>);

impl Preserved {
    pub fn all() -> Preserved {
        Preserved(None)
    }

    pub fn only(ids: &'static [&'static str]) -> Preserved {
        Preserved(Some(ids))
    }
}

enum Entry {
    /// Validity marker for a transform with no data (SSA form).
    Marker,
    Dom(Rc<DomTree>),
    Dj(Rc<DjGraph>),
    Defs(Rc<DefsAnalysis>),
    Live(Rc<LiveAnalysis>),
    Gvn(Numbering, Rc<ValueTable>),
    Avail(GvnChoice, Rc<AvailAnalysis>),
    Ant(GvnChoice, Rc<AntAnalysis>),
}

/// IDs of every runnable pass.
pub const PASSES: &[&str] = &[
    "domtree",
    "defs",
    "live",
    "ssa",
    "gvn-rpo",
    "gvn-scc",
    "gargi-gvn",
    "available",
    "anticipatable",
    "vdcm",
    "reg-realloc",
    "branch-elim",
    "dce",
    "phi-elim",
];

#[derive(Default)]
pub struct PassManager {
    cache: HashMap<String, Entry>,
}

impl PassManager {
    pub fn new() -> PassManager {
        PassManager::default()
    }

    /// Run one pass. Explicitly requested passes always execute; their
    /// dependencies are reused from the cache when still valid.
    pub fn run(&mut self, cfg: &mut Cfg, spec: &PassSpec) -> AmiResult<()> {
        log::debug!("running pass {}", spec);
        let preserved = match spec.id.as_str() {
            "domtree" => {
                no_arguments(spec)?;
                self.invalidate("domtree");
                let domtree = self.domtree(cfg)?;
                annotate_domtree(cfg, &domtree);
                Preserved::all()
            }
            "defs" => {
                no_arguments(spec)?;
                self.invalidate("defs");
                let defs = self.defs(cfg)?;
                annotate_defs(cfg, &defs);
                Preserved::all()
            }
            "live" => {
                no_arguments(spec)?;
                self.invalidate("live");
                let live = self.live(cfg)?;
                live.annotate(cfg);
                Preserved::all()
            }
            "ssa" => {
                no_arguments(spec)?;
                self.invalidate("ssa");
                self.require_ssa(cfg)?;
                return Ok(());
            }
            "gvn-rpo" => {
                let numbering = numbering_argument(spec)?;
                let preserved = simpson::run_rpo(cfg, self, numbering)?;
                self.apply(preserved);
                return Ok(());
            }
            "gvn-scc" => {
                let numbering = numbering_argument(spec)?;
                let preserved = simpson::run_scc(cfg, self, numbering)?;
                self.apply(preserved);
                return Ok(());
            }
            "gargi-gvn" => {
                no_arguments(spec)?;
                gargi::run(cfg, self)?
            }
            "available" => {
                let choice = gvn_argument(spec)?;
                self.invalidate("available");
                let avail = self.available(cfg, choice)?;
                avail.annotate(cfg);
                Preserved::all()
            }
            "anticipatable" => {
                let choice = gvn_argument(spec)?;
                self.invalidate("anticipatable");
                let ant = self.anticipatable(cfg, choice)?;
                ant.annotate(cfg);
                Preserved::all()
            }
            "vdcm" => {
                let choice = gvn_argument(spec)?;
                vdcm::run(cfg, self, choice)?
            }
            "reg-realloc" => {
                only_kwargs(spec, &[])?;
                let target = regalloc::parse_target(&spec.args)?;
                regalloc::run(cfg, self, target)?
            }
            "branch-elim" => {
                no_arguments(spec)?;
                branch_elim::run(cfg, self)?
            }
            "dce" => {
                no_arguments(spec)?;
                dce::run(cfg, self)?
            }
            "phi-elim" => {
                no_arguments(spec)?;
                phi_elim::run(cfg, self)?
            }
            other => {
                return Err(AmiError::bad_argument(other, "unrecognised pass"));
            }
        };
        self.apply(preserved);
        Ok(())
    }

    /// Drop everything a pass did not preserve.
    pub fn apply(&mut self, preserved: Preserved) {
        if let Preserved(Some(keep)) = preserved {
            self.cache.retain(|id, _| keep.contains(&id.as_str()));
        }
    }

    pub fn invalidate(&mut self, id: &str) {
        self.cache.remove(id);
    }

    pub fn is_valid(&self, id: &str) -> bool {
        self.cache.contains_key(id)
    }

    pub fn domtree(&mut self, cfg: &Cfg) -> AmiResult<Rc<DomTree>> {
        if let Some(Entry::Dom(domtree)) = self.cache.get("domtree") {
            return Ok(domtree.clone());
        }
        let domtree = Rc::new(DomTree::compute(cfg));
        self.cache
            .insert("domtree".to_string(), Entry::Dom(domtree.clone()));
        Ok(domtree)
    }

    pub fn djgraph(&mut self, cfg: &Cfg) -> AmiResult<Rc<DjGraph>> {
        if let Some(Entry::Dj(djgraph)) = self.cache.get("djgraph") {
            return Ok(djgraph.clone());
        }
        let domtree = self.domtree(cfg)?;
        let djgraph = Rc::new(DjGraph::compute(cfg, &domtree));
        self.cache
            .insert("djgraph".to_string(), Entry::Dj(djgraph.clone()));
        Ok(djgraph)
    }

    pub fn defs(&mut self, cfg: &Cfg) -> AmiResult<Rc<DefsAnalysis>> {
        if let Some(Entry::Defs(defs)) = self.cache.get("defs") {
            return Ok(defs.clone());
        }
        let defs = Rc::new(DefsAnalysis::compute(cfg));
        self.cache
            .insert("defs".to_string(), Entry::Defs(defs.clone()));
        Ok(defs)
    }

    pub fn live(&mut self, cfg: &Cfg) -> AmiResult<Rc<LiveAnalysis>> {
        if let Some(Entry::Live(live)) = self.cache.get("live") {
            return Ok(live.clone());
        }
        let live = Rc::new(LiveAnalysis::compute(cfg)?);
        self.cache
            .insert("live".to_string(), Entry::Live(live.clone()));
        Ok(live)
    }

    /// Ensure the program is in SSA form, converting it if the marker is
    /// not currently valid.
    pub fn require_ssa(&mut self, cfg: &mut Cfg) -> AmiResult<()> {
        if self.cache.contains_key("ssa") {
            return Ok(());
        }
        let preserved = ssa::run(cfg, self)?;
        self.apply(preserved);
        self.cache.insert("ssa".to_string(), Entry::Marker);
        Ok(())
    }

    /// A value table from the requested algorithm, in `expr` numbering.
    /// `Any` reuses whichever variant is valid, preferring an existing one.
    pub fn gvn(&mut self, cfg: &mut Cfg, choice: GvnChoice) -> AmiResult<Rc<ValueTable>> {
        let candidates: &[&str] = match choice {
            GvnChoice::Rpo => &[simpson::RPO_ID],
            GvnChoice::Scc => &[simpson::SCC_ID],
            GvnChoice::Gargi => &[gargi::ID],
            GvnChoice::Any => &[simpson::RPO_ID, simpson::SCC_ID, gargi::ID],
        };
        for id in candidates {
            if let Some(Entry::Gvn(Numbering::Expr, table)) = self.cache.get(*id) {
                return Ok(table.clone());
            }
        }
        let preserved = match choice {
            GvnChoice::Scc => simpson::run_scc(cfg, self, Numbering::Expr)?,
            GvnChoice::Gargi => gargi::run(cfg, self)?,
            _ => simpson::run_rpo(cfg, self, Numbering::Expr)?,
        };
        self.apply(preserved);
        let id = match choice {
            GvnChoice::Scc => simpson::SCC_ID,
            GvnChoice::Gargi => gargi::ID,
            _ => simpson::RPO_ID,
        };
        match self.cache.get(id) {
            Some(Entry::Gvn(_, table)) => Ok(table.clone()),
            _ => Err(AmiError::load("value numbering did not produce a table")),
        }
    }

    pub fn cache_gvn(&mut self, id: &str, numbering: Numbering, table: ValueTable) {
        self.cache
            .insert(id.to_string(), Entry::Gvn(numbering, Rc::new(table)));
    }

    pub fn cached_gvn(&self, id: &str) -> Option<Rc<ValueTable>> {
        match self.cache.get(id) {
            Some(Entry::Gvn(_, table)) => Some(table.clone()),
            _ => None,
        }
    }

    pub fn available(&mut self, cfg: &mut Cfg, choice: GvnChoice) -> AmiResult<Rc<AvailAnalysis>> {
        if let Some(Entry::Avail(cached, avail)) = self.cache.get("available") {
            if *cached == choice {
                return Ok(avail.clone());
            }
        }
        let table = self.gvn(cfg, choice)?;
        let avail = Rc::new(AvailAnalysis::compute(cfg, &table)?);
        self.cache
            .insert("available".to_string(), Entry::Avail(choice, avail.clone()));
        Ok(avail)
    }

    pub fn anticipatable(&mut self, cfg: &mut Cfg, choice: GvnChoice) -> AmiResult<Rc<AntAnalysis>> {
        if let Some(Entry::Ant(cached, ant)) = self.cache.get("anticipatable") {
            if *cached == choice {
                return Ok(ant.clone());
            }
        }
        let table = self.gvn(cfg, choice)?;
        let ant = Rc::new(AntAnalysis::compute(cfg, &table)?);
        self.cache
            .insert("anticipatable".to_string(), Entry::Ant(choice, ant.clone()));
        Ok(ant)
    }
}

fn no_arguments(spec: &PassSpec) -> AmiResult<()> {
    if spec.args.is_empty() && spec.kwargs.is_empty() {
        Ok(())
    } else {
        Err(AmiError::bad_argument(&spec.id, "pass takes no arguments"))
    }
}

fn only_kwargs(spec: &PassSpec, allowed: &[&str]) -> AmiResult<()> {
    for key in spec.kwargs.keys() {
        if !allowed.contains(&key.as_str()) {
            return Err(AmiError::bad_argument(
                &spec.id,
                format!("unrecognised keyword argument {}", key),
            ));
        }
    }
    Ok(())
}

/// The optional positional `var`/`expr` numbering argument of the Simpson
/// passes.
fn numbering_argument(spec: &PassSpec) -> AmiResult<Numbering> {
    only_kwargs(spec, &[])?;
    match spec.args.as_slice() {
        [] => Ok(Numbering::Var),
        [mode] => Numbering::parse(mode).ok_or_else(|| {
            AmiError::bad_argument(&spec.id, "numbering must be \"var\" or \"expr\"")
        }),
        _ => Err(AmiError::bad_argument(&spec.id, "at most one positional argument")),
    }
}

/// The optional `gvn=` keyword of the dataflow and motion passes.
fn gvn_argument(spec: &PassSpec) -> AmiResult<GvnChoice> {
    if !spec.args.is_empty() {
        return Err(AmiError::bad_argument(&spec.id, "pass takes only keyword arguments"));
    }
    only_kwargs(spec, &["gvn"])?;
    match spec.kwargs.get("gvn") {
        None => Ok(GvnChoice::Any),
        Some(choice) => GvnChoice::parse(choice).ok_or_else(|| {
            AmiError::bad_argument(
                &spec.id,
                "gvn must be one of \"rpo\", \"scc\", \"gargi\", or \"any\"",
            )
        }),
    }
}

fn annotate_domtree(cfg: &mut Cfg, domtree: &DomTree) {
    let labels: Vec<String> = cfg.labels().map(String::from).collect();
    for label in labels {
        let idom: Vec<String> = domtree.idom(&label).map(String::from).into_iter().collect();
        let children = domtree.children(&label).to_vec();
        let block = cfg.get_mut(&label).expect("label from iteration");
        block.meta.set("domtree/idom", idom);
        block.meta.set("domtree/children", children);
    }
}

fn annotate_defs(cfg: &mut Cfg, defs: &DefsAnalysis) {
    let registers: Vec<String> = defs.registers().map(String::from).collect();
    for register in &registers {
        let blocks: Vec<String> = defs.blocks(register).into_iter().map(String::from).collect();
        cfg.meta.set(format!("defs/{}", register), blocks);
    }
    cfg.meta.set("defs/registers", registers);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ami_ir::CfgBuilder;

    #[test]
    fn test_spec_parsing() {
        let spec: PassSpec = "gvn-rpo(expr)".parse().unwrap();
        assert_eq!(spec.id, "gvn-rpo");
        assert_eq!(spec.args, ["expr"]);

        let spec: PassSpec = "vdcm(gvn=scc)".parse().unwrap();
        assert_eq!(spec.kwargs["gvn"], "scc");

        let spec: PassSpec = "reg-realloc(3)".parse().unwrap();
        assert_eq!(spec.to_string(), "reg-realloc(3)");

        assert!("Bad".parse::<PassSpec>().is_err());
        assert!("ssa(".parse::<PassSpec>().is_err());
        assert!("0ssa".parse::<PassSpec>().is_err());
    }

    #[test]
    fn test_bad_arguments_are_rejected() {
        let mut cfg = CfgBuilder::default().build("@a: exit\n").unwrap();
        let mut mgr = PassManager::new();
        for bad in ["ssa(1)", "gvn-rpo(sideways)", "vdcm(gvn=what)", "reg-realloc(x)", "nonsense"] {
            let spec: PassSpec = bad.parse().unwrap();
            assert!(
                matches!(mgr.run(&mut cfg, &spec), Err(AmiError::BadArgument { .. })),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_analysis_reuse_and_invalidation() {
        let mut cfg = CfgBuilder::default()
            .build("@a: read %x\n%y = %x\nwrite %y\nexit\n")
            .unwrap();
        let mut mgr = PassManager::new();

        let first = mgr.domtree(&cfg).unwrap();
        let second = mgr.domtree(&cfg).unwrap();
        assert!(Rc::ptr_eq(&first, &second));

        // a transform that changes the program drops unpreserved analyses
        mgr.live(&cfg).unwrap();
        let spec: PassSpec = "reg-realloc".parse().unwrap();
        mgr.run(&mut cfg, &spec).unwrap();
        assert!(mgr.is_valid("domtree"));
        assert!(!mgr.is_valid("live"));
    }

    #[test]
    fn test_ssa_marker_prevents_rerun() {
        let mut cfg = CfgBuilder::default()
            .build(
                "@e: read %c\n\
                 branch %c ? @t : @f\n\
                 @t: %x = 1\n\
                 goto @j\n\
                 @f: %x = 2\n\
                 goto @j\n\
                 @j: write %x\n\
                 exit\n",
            )
            .unwrap();
        let mut mgr = PassManager::new();
        mgr.require_ssa(&mut cfg).unwrap();
        let snapshot = cfg.clone();
        mgr.require_ssa(&mut cfg).unwrap();
        assert_eq!(cfg, snapshot);
        assert!(mgr.is_valid("ssa"));
    }

    #[test]
    fn test_pipeline_constant_folding() {
        // end-to-end: gvn + vdcm reduces 2 + 3 to write 5
        let mut cfg = CfgBuilder::default()
            .build("@e: %a = 2 + 3\nwrite %a\nexit\n")
            .unwrap();
        let mut mgr = PassManager::new();
        for pass in ["gvn-rpo(expr)", "vdcm", "dce"] {
            let spec: PassSpec = pass.parse().unwrap();
            mgr.run(&mut cfg, &spec).unwrap();
        }
        assert_eq!(ami_interpreter::execute(&cfg, &[]).unwrap(), vec![5]);
        let instructions: usize = cfg.blocks().map(|b| b.len()).sum();
        assert_eq!(instructions, 2); // write 5, exit
    }
}
