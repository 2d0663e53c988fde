//! Command-line argument parsing for the `tpt` binary.
//!
//! Usage:
//!   tpt [-I<dir>]… [-D<name>=<value>]… [-o <file>] [-q] <template>

use std::path::PathBuf;

// ── Public types ──────────────────────────────────────────────────────────────

/// Parsed command-line arguments.
#[derive(Debug, Default)]
pub struct CliArgs {
    /// Include search directories (`-I<dir>`), in order.
    pub include_dirs: Vec<PathBuf>,
    /// Pre-seeded scalar symbols (`-D<name>=<value>`), in order.
    pub defines: Vec<(String, String)>,
    /// Output file (`-o <file>`); stdout when absent.
    pub output: Option<PathBuf>,
    /// Suppress the error listing on stderr (`-q`).
    pub quiet: bool,
    /// The template file to render.
    pub template: PathBuf,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Parse `std::env::args()` and return [`CliArgs`] or an error message.
pub fn parse_args() -> Result<CliArgs, String> {
    parse_from(std::env::args().skip(1))
}

fn parse_from(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut out = CliArgs::default();
    let mut template: Option<PathBuf> = None;
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if let Some(dir) = arg.strip_prefix("-I") {
            if dir.is_empty() {
                return Err("-I requires a directory".to_owned());
            }
            out.include_dirs.push(PathBuf::from(dir));
        } else if let Some(def) = arg.strip_prefix("-D") {
            let Some((name, value)) = def.split_once('=') else {
                return Err(format!("-D expects name=value, got '{def}'"));
            };
            if name.is_empty() {
                return Err("-D expects a non-empty name".to_owned());
            }
            out.defines.push((name.to_owned(), value.to_owned()));
        } else if arg == "-o" {
            let Some(path) = iter.next() else {
                return Err("-o requires a file name".to_owned());
            };
            out.output = Some(PathBuf::from(path));
        } else if arg == "-q" {
            out.quiet = true;
        } else if arg == "-h" || arg == "--help" {
            return Err("help".to_owned());
        } else if arg.starts_with('-') && arg.len() > 1 {
            return Err(format!("unknown option '{arg}'"));
        } else {
            if template.is_some() {
                return Err("only one template file may be given".to_owned());
            }
            template = Some(PathBuf::from(arg));
        }
    }

    match template {
        Some(t) => {
            out.template = t;
            Ok(out)
        }
        None => Err("no template file given".to_owned()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
