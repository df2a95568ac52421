use std::env;
use std::path::Path;
use std::process;

use memcard::{Config, ImageCard, Session};

fn walk(session: &mut Session<ImageCard>, path: &str, depth: usize) -> memcard::Result<()> {
    for entry in session.list(path)? {
        eprintln!(
            "{:indent$}{} ({:?}, {} bytes, cluster {})",
            "",
            entry.display_name(),
            entry.kind(),
            entry.size,
            entry.cluster,
            indent = depth * 2
        );
        if entry.is_dir() {
            let child = format!("{}/{}", path.trim_end_matches('/'), entry.display_name());
            walk(session, &child, depth + 1)?;
        }
    }
    Ok(())
}

fn main() -> memcard::Result<()> {
    let path = env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: cargo run --example inspect -- <path-to-memcard>");
        process::exit(1);
    });

    let card = ImageCard::open(Path::new(&path))?;
    let mut session = Session::open(card, &Config::default())?;
    eprintln!("{:#?}", session.superblock());
    walk(&mut session, "/", 0)?;

    let report = session.check()?;
    for problem in &report.problems {
        eprintln!("! {problem}");
    }
    Ok(())
}
