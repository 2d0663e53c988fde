use std::io::Write;

use tpt::cli;
use tpt::Interpreter;

fn main() {
    // Log filtering comes from TPT_LOG (e.g. TPT_LOG=tpt=debug).
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("TPT_LOG"))
        .with_writer(std::io::stderr)
        .init();

    let args = match cli::parse_args() {
        Ok(a) => a,
        Err(e) => {
            if e != "help" {
                eprintln!("tpt: {e}");
            }
            eprintln!("Usage: tpt [-I<dir>]... [-D<name>=<value>]... [-o <file>] [-q] <template>");
            std::process::exit(if e == "help" { 0 } else { 2 });
        }
    };

    let mut interp = Interpreter::new();
    for dir in &args.include_dirs {
        interp.add_include_path(dir);
    }
    for (name, value) in &args.defines {
        if let Err(e) = interp.symbols_mut().set(name, value.as_str()) {
            eprintln!("tpt: -D{name}: {e}");
            std::process::exit(2);
        }
    }

    let result = match &args.output {
        Some(path) => {
            let file = match std::fs::File::create(path) {
                Ok(f) => f,
                Err(e) => {
                    eprintln!("tpt: cannot create {}: {e}", path.display());
                    std::process::exit(1);
                }
            };
            let mut out = std::io::BufWriter::new(file);
            let r = interp.run_file(&args.template, &mut out);
            out.flush().and(r)
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = std::io::BufWriter::new(stdout.lock());
            let r = interp.run_file(&args.template, &mut out);
            out.flush().and(r)
        }
    };

    match result {
        Ok(false) => {}
        Ok(true) => {
            if !args.quiet {
                for error in interp.errors() {
                    eprintln!("tpt: {error}");
                }
            }
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("tpt: {}: {e}", args.template.display());
            std::process::exit(1);
        }
    }
}
