//! ngdb-inspect - print table statistics of a database
//!
//! Usage:
//!   ngdb-inspect <db-path> [--check]
//!
//! With `--check` every CSR header is validated and the process exits with
//! status 2 if any node group violates the header invariants.

use std::path::PathBuf;
use std::process::ExitCode;

use ngdb::storage::{RelDataFormat, RelDirection};
use ngdb::{Database, Result};

fn print_usage() {
    eprintln!("Usage: ngdb-inspect <db-path> [--check]");
    eprintln!();
    eprintln!("Arguments:");
    eprintln!("  <db-path>      Path to the database directory");
    eprintln!("  --check        Validate every CSR header");
}

fn inspect(db: &Database, check: bool) -> Result<usize> {
    let config = db.config();
    println!(
        "node group size: {}  leaf region: {}  page size: {}",
        config.node_group_size(),
        config.csr_leaf_region_size(),
        config.page_size()
    );

    for table in db.node_tables() {
        println!(
            "node table {} (id {}): {} rows, {} node groups, {} properties",
            table.name(),
            table.table_id(),
            table.num_rows(),
            table.num_node_groups(),
            table.properties().len()
        );
    }

    let mut violations = 0;
    for table in db.rel_tables() {
        println!(
            "rel table {} (id {}): {} rels, {:?}",
            table.name(),
            table.table_id(),
            table.num_rels(),
            table.multiplicity()
        );
        for direction in [RelDirection::Forward, RelDirection::Backward] {
            let data = table.direction(direction);
            let groups = data.num_node_groups();
            let capacity: u64 = (0..groups).map(|ng| data.csr_capacity(ng)).sum();
            println!(
                "  {} {:?}: {} node groups, {} slots",
                direction.as_str(),
                data.format(),
                groups,
                capacity
            );
            if data.format() != RelDataFormat::Csr {
                continue;
            }
            for ng in 0..groups {
                if let Some((size, slots)) = data.density(ng)? {
                    let density = if slots == 0 { 0.0 } else { size as f64 / slots as f64 };
                    println!("    group {}: {} edges in {} slots ({:.2})", ng, size, slots, density);
                }
            }
        }
        if check {
            for (direction, ng) in table.sanity_check()? {
                eprintln!(
                    "violation: {} {} node group {} has an inconsistent CSR header",
                    table.name(),
                    direction.as_str(),
                    ng
                );
                violations += 1;
            }
        }
    }
    Ok(violations)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return ExitCode::from(1);
    }
    let db_path = PathBuf::from(&args[1]);
    let check = args.iter().skip(2).any(|a| a == "--check");

    let db = match Database::open(&db_path) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("Failed to open {}: {}", db_path.display(), e);
            return ExitCode::from(1);
        }
    };
    match inspect(&db, check) {
        Ok(0) => ExitCode::SUCCESS,
        Ok(violations) => {
            eprintln!("{} CSR header violation(s)", violations);
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Inspection failed: {}", e);
            ExitCode::from(1)
        }
    }
}
