//! Command-line tool for XIO index files.
//!
//! Usage:
//!   xio_cli <index_path> create <key_len> [dups]
//!   xio_cli <index_path> insert <key> <record>
//!   xio_cli <index_path> find <key>
//!   xio_cli <index_path> find-last <prefix>
//!   xio_cli <index_path> delete <key> [record]
//!   xio_cli <index_path> scan [start] [end]
//!   xio_cli <index_path> stats
//!   xio_cli <index_path> dump
//!   xio_cli <index_path> verify
//!
//! Logging goes to stderr and follows `RUST_LOG` (default `warn`).

use std::env;
use std::process::exit;
use tracing_subscriber::{fmt, EnvFilter};
use xio_index::{
    DeleteOutcome, DuplicatePolicy, IndexFile, InsertOutcome, KeyState, OpenMode, OpenOptions,
    RecordCell,
};

fn usage() -> ! {
    eprintln!("Usage: xio_cli <index_path> <command> [args...]");
    eprintln!("Commands:");
    eprintln!("  create <key_len> [dups]  - Create an empty index");
    eprintln!("  insert <key> <record>    - Index a record position under a key");
    eprintln!("  find <key>               - Look up the first entry for a key");
    eprintln!("  find-last <prefix>       - Look up the last entry with a prefix");
    eprintln!("  delete <key> [record]    - Delete a key, or one key/position pair");
    eprintln!("  scan [start] [end]       - List entries in key order");
    eprintln!("  stats                    - Show block and entry counts");
    eprintln!("  dump                     - Print the tree as JSON");
    eprintln!("  verify                   - Check the tree structure");
    exit(1);
}

fn fail(e: impl std::fmt::Display) -> ! {
    eprintln!("ERROR: {}", e);
    exit(1);
}

fn parse_number(arg: &str, what: &str) -> u64 {
    match arg.parse() {
        Ok(n) => n,
        Err(_) => fail(format!("invalid {}: {}", what, arg)),
    }
}

fn open(path: &str, mode: OpenMode, record: &RecordCell) -> IndexFile {
    let options = OpenOptions::new().mode(mode);
    match IndexFile::open(path, &options, record.clone()) {
        Ok(index) => index,
        Err(e) => fail(format!("failed to open index: {}", e)),
    }
}

fn print_entry(index: &IndexFile, record: &RecordCell) {
    let key = index.current_key().unwrap_or_default();
    println!("{} -> {}", String::from_utf8_lossy(key).trim_end(), record.get());
}

fn state_name(state: KeyState) -> &'static str {
    match state {
        KeyState::OnKey => "FOUND",
        KeyState::BeforeFirst => "BEFORE_FIRST",
        KeyState::Between => "BETWEEN",
        KeyState::AfterLast => "AFTER_LAST",
    }
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }
    let path = &args[1];
    let command = args[2].as_str();
    let record = RecordCell::new();

    match command {
        "create" => {
            let Some(key_len) = args.get(3) else { usage() };
            let mut options = OpenOptions::new()
                .mode(OpenMode::Create)
                .key_length(parse_number(key_len, "key length") as usize);
            if args.get(4).map(String::as_str) == Some("dups") {
                options = options.duplicates(DuplicatePolicy::Allow);
            }
            let index = match IndexFile::open(path, &options, record) {
                Ok(index) => index,
                Err(e) => fail(e),
            };
            println!("TEXT: {}", index.text_name());
            if let Err(e) = index.close() {
                fail(e);
            }
            println!("CREATED");
        }

        "insert" => {
            let (Some(key), Some(pos)) = (args.get(3), args.get(4)) else { usage() };
            let mut index = open(path, OpenMode::Exclusive, &record);
            record.set(parse_number(pos, "record"));
            match index.insert(key.as_bytes()) {
                Ok(InsertOutcome::Inserted) => println!("OK"),
                Ok(InsertOutcome::DuplicateKey) => println!("DUPLICATE_KEY"),
                Ok(InsertOutcome::DuplicateExact) => println!("DUPLICATE_EXACT"),
                Err(e) => fail(e),
            }
            if let Err(e) = index.close() {
                fail(e);
            }
        }

        "find" | "find-last" => {
            let Some(key) = args.get(3) else { usage() };
            let mut index = open(path, OpenMode::ReadOnly, &record);
            let found = if command == "find" {
                index.find(key.as_bytes())
            } else {
                index.find_last(key.as_bytes())
            };
            match found {
                Ok(KeyState::OnKey) => print_entry(&index, &record),
                Ok(state) => println!("{}", state_name(state)),
                Err(e) => fail(e),
            }
        }

        "delete" => {
            let Some(key) = args.get(3) else { usage() };
            let mut index = open(path, OpenMode::Exclusive, &record);
            let by_position = match args.get(4) {
                Some(pos) => {
                    record.set(parse_number(pos, "record"));
                    true
                }
                None => false,
            };
            match index.delete(key.as_bytes(), by_position) {
                Ok(DeleteOutcome::Deleted) => println!("DELETED {}", record.get()),
                Ok(DeleteOutcome::NotFound) => println!("NOT_FOUND"),
                Err(e) => fail(e),
            }
            if let Err(e) = index.close() {
                fail(e);
            }
        }

        "scan" => {
            let mut index = open(path, OpenMode::ReadOnly, &record);
            let end = args.get(4).map(|s| s.trim_end().as_bytes().to_vec());
            let mut state = match args.get(3) {
                Some(start) => match index.find(start.as_bytes()) {
                    Ok(KeyState::OnKey) => Ok(KeyState::OnKey),
                    Ok(_) => index.next(),
                    Err(e) => Err(e),
                },
                None => index.next(),
            };
            let mut count = 0;
            loop {
                match state {
                    Ok(KeyState::OnKey) => {}
                    Ok(_) => break,
                    Err(e) => fail(e),
                }
                if let (Some(end), Some(key)) = (&end, index.current_key()) {
                    let key = &key[..key.len().min(end.len())];
                    if key > end.as_slice() {
                        break;
                    }
                }
                print_entry(&index, &record);
                count += 1;
                state = index.next();
            }
            println!("COUNT: {}", count);
        }

        "stats" => {
            let mut index = open(path, OpenMode::ReadOnly, &record);
            let stats = match index.stats() {
                Ok(stats) => stats,
                Err(e) => fail(e),
            };
            println!("height: {}", stats.height);
            println!("entries: {}", stats.entries);
            println!("leaf_blocks: {}", stats.leaf_blocks);
            println!("branch_blocks: {}", stats.branch_blocks);
            println!("free_blocks: {}", stats.free_blocks);
            println!("free_slots: {}", stats.free_slots);
            println!("total_blocks: {}", stats.total_blocks);
            println!("block_size: {}", stats.block_size);
            println!("key_len: {}", stats.key_len);
        }

        "dump" => {
            let mut index = open(path, OpenMode::ReadOnly, &record);
            let tree = match index.export_tree() {
                Ok(tree) => tree,
                Err(e) => fail(e),
            };
            match serde_json::to_string_pretty(&tree) {
                Ok(json) => println!("{}", json),
                Err(e) => fail(e),
            }
        }

        "verify" => {
            let mut index = open(path, OpenMode::ReadOnly, &record);
            match index.verify() {
                Ok(stats) => println!("OK: {} entries in {} levels", stats.entries, stats.height),
                Err(e) => fail(e),
            }
        }

        _ => {
            eprintln!("Unknown command: {}", command);
            usage();
        }
    }
}
