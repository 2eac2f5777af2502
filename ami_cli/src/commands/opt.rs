//! `ami opt`: run a pass pipeline and write the program back out

use crate::{exit, read_source};
use ami_ir::{CfgBuilder, CfgWriter, ReaderOptions};
use ami_opt::{PassManager, PassSpec};
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::ExitCode;

pub struct Options {
    pub file: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub passes: Vec<String>,
    pub list_passes: bool,
    pub omit_metadata: bool,
    pub frame: Option<String>,
    pub entrypoint: Option<String>,
    pub ban_anonymous_blocks: bool,
}

pub fn execute(options: Options) -> Result<ExitCode> {
    if options.list_passes {
        println!("Available passes:");
        for id in ami_opt::manager::PASSES {
            println!("    {}", id);
        }
        return Ok(ExitCode::SUCCESS);
    }

    // parse every pass spec before touching the program
    let mut specs: Vec<PassSpec> = Vec::with_capacity(options.passes.len());
    for text in &options.passes {
        match text.parse::<PassSpec>() {
            Ok(spec) => specs.push(spec),
            Err(error) => {
                eprintln!("error: {}", error);
                return Ok(ExitCode::from(exit::code_for(&error)));
            }
        }
    }

    let source = read_source(&options.file)?;
    let builder = CfgBuilder::new(ReaderOptions {
        allow_anonymous_blocks: !options.ban_anonymous_blocks,
        entrypoint: options.entrypoint.clone(),
    });
    let mut cfg = match builder.build(&source) {
        Ok(cfg) => cfg,
        Err(error) => {
            eprintln!("error: {}", error);
            return Ok(ExitCode::from(exit::code_for(&error)));
        }
    };

    let mut manager = PassManager::new();
    for spec in &specs {
        if let Err(error) = manager.run(&mut cfg, spec) {
            eprintln!("error in pass {}: {}", spec, error);
            return Ok(ExitCode::from(exit::code_for(&error)));
        }
    }

    let (tabwidth, codewidth) = parse_frame(options.frame.as_deref())?;
    let writer = CfgWriter::new(!options.omit_metadata, tabwidth, codewidth);
    let text = writer.write(&cfg);
    match &options.output {
        Some(path) => std::fs::write(path, text)
            .with_context(|| format!("cannot write {}", path.display()))?,
        None => print!("{}", text),
    }
    Ok(ExitCode::SUCCESS)
}

/// Parse the `--frame "L;W"` geometry; `*` leaves a dimension automatic.
fn parse_frame(frame: Option<&str>) -> Result<(Option<usize>, Option<usize>)> {
    let Some(frame) = frame else {
        return Ok((None, None));
    };
    let (tab, code) = frame
        .split_once(';')
        .with_context(|| format!("frame {:?} is not of the form \"L;W\"", frame))?;
    let parse = |text: &str| -> Result<Option<usize>> {
        if text == "*" {
            return Ok(None);
        }
        Ok(Some(text.parse().with_context(|| {
            format!("frame dimension {:?} is not an integer", text)
        })?))
    };
    Ok((parse(tab)?, parse(code)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parsing() {
        assert_eq!(parse_frame(None).unwrap(), (None, None));
        assert_eq!(parse_frame(Some("4;96")).unwrap(), (Some(4), Some(96)));
        assert_eq!(parse_frame(Some("*;20")).unwrap(), (None, Some(20)));
        assert!(parse_frame(Some("nope")).is_err());
    }
}
