//! Line-oriented shell over a single database.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::io::{self, BufRead, Write};

use crate::db::Db;
use crate::index::{IndexType, StoreOp};

#[derive(Parser, Debug)]
#[command(
    name = "kilndb",
    version,
    about = "Embedded KV store with byte-range-locked hash indexes",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Database name; `<name>.idx` / `<name>.dat` (and `<name>.bkt` for
    /// the linear flavor) live next to it.
    name: String,

    /// Index flavor used when the database does not exist yet; an
    /// existing database keeps its stored flavor.
    #[arg(long, value_enum, default_value = "static")]
    index_type: IndexKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IndexKind {
    Static,
    Linear,
}

impl From<IndexKind> for IndexType {
    fn from(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Static => IndexType::Static,
            IndexKind::Linear => IndexType::Linear,
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut db = Db::open(&cli.name, cli.index_type.into())?;

    let stdin = io::stdin();
    let mut out = io::stdout();
    loop {
        print!("> ");
        out.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break; // EOF behaves like quit
        }
        if execute(&mut db, line.trim()) {
            break;
        }
    }
    db.close()
}

/// Run one shell command; returns true when the shell should exit.
/// Command failures are printed, never fatal.
fn execute(db: &mut Db, line: &str) -> bool {
    let args: Vec<&str> = line.split_whitespace().collect();
    let Some(&cmd) = args.first() else {
        return false;
    };
    match (cmd, args.len()) {
        ("put", 3) => {
            if let Err(e) = db.store(args[1], args[2], StoreOp::Insert) {
                println!("put {} failed: {e:#}", args[1]);
            }
        }
        ("update", 3) => {
            if let Err(e) = db.store(args[1], args[2], StoreOp::Update) {
                println!("update {} failed: {e:#}", args[1]);
            }
        }
        ("get", 2) if args[1] == "*" => match db.fetch_all() {
            Ok(records) => {
                let mut items: Vec<_> = records.into_iter().collect();
                items.sort();
                for (k, v) in items {
                    println!("{k}: {v}");
                }
            }
            Err(e) => println!("get * failed: {e:#}"),
        },
        ("get", 2) => match db.fetch(args[1]) {
            Ok(v) if v.is_empty() => println!("key {} not found", args[1]),
            Ok(v) => println!("{v}"),
            Err(e) => println!("get {} failed: {e:#}", args[1]),
        },
        ("delete", 2) => {
            if let Err(e) = db.delete(args[1]) {
                println!("delete {} failed: {e:#}", args[1]);
            }
        }
        ("quit", 1) => return true,
        _ => {
            println!("invalid command: {line}");
            println!("supported: put K V | get K | get * | update K V | delete K | quit");
        }
    }
    false
}
