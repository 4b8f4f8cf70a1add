//! Keeps a counter in a file-backed heap. Every run attaches to the heap left
//! by the previous one, finds the counter by name, and bumps it.
//!
//! Run it a few times, then pass `--reset` to start over.

use std::path::PathBuf;

use persistent_heap::{HeapConfig, HeapError, HeapTable};

const COUNTER: &str = "counter";

fn main() -> Result<(), HeapError> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let path = args
        .iter()
        .skip(1)
        .find(|arg| !arg.starts_with("--"))
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("persistent_heap-attach.heap"));
    if args.contains(&"--reset".to_owned()) {
        let _ = std::fs::remove_file(&path);
        println!("Removed {}", path.display());
        return Ok(());
    }

    let table = HeapTable::new();
    let hd = table.open_file(&path, &HeapConfig::with_blocks(12, 4, 256))?;

    let ptr = match table.lookup(hd, COUNTER) {
        Ok(ptr) => ptr,
        Err(HeapError::NotFound(_)) => {
            println!("New heap at {}", path.display());
            table.allocate_zeroed_named(hd, COUNTER, 1, 8)?
        }
        Err(e) => return Err(e),
    };

    let mut raw = [0; 8];
    table.read(hd, ptr, &mut raw)?;
    let count = u64::from_le_bytes(raw) + 1;
    table.write(hd, ptr, &count.to_le_bytes())?;

    println!("Run number {} (counter at {})", count, ptr);
    println!("    Stats: {}", table.stats(hd)?);
    println!("    Names: {:?}", table.names(hd)?);
    table.close(hd)
}
