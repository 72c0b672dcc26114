//! Basic usage example for the ngdb storage engine
//!
//! Run: cargo run --example basic_usage

use ngdb::{Database, PhysicalType, RelDirection, RelMultiplicity, StorageConfig, Value};
use tempfile::TempDir;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== ngdb - Basic Usage ===\n");

    let dir = TempDir::new()?;
    let db = Database::create(dir.path().join("shop"), StorageConfig::small())?;

    println!("1. Creating tables...");
    let customers = db.create_node_table("customer", vec![("age".to_string(), PhysicalType::Int64)])?;
    let products = db.create_node_table("product", vec![("price".to_string(), PhysicalType::Double)])?;
    let bought = db.create_rel_table(
        "bought",
        "customer",
        "product",
        RelMultiplicity::ManyToMany,
        vec![("quantity".to_string(), PhysicalType::Int32)],
    )?;

    println!("2. Inserting nodes and edges...");
    let mut txn = db.begin_write_transaction()?;
    let alice = customers.insert(&mut txn, &[Some(Value::Int64(34))])?;
    let bob = customers.insert(&mut txn, &[Some(Value::Int64(27))])?;
    let lamp = products.insert(&mut txn, &[Some(Value::Double(19.5))])?;
    let desk = products.insert(&mut txn, &[Some(Value::Double(240.0))])?;
    bought.insert(&mut txn, alice, lamp, &[Some(Value::Int32(2))])?;
    let order = bought.insert(&mut txn, alice, desk, &[Some(Value::Int32(1))])?;
    bought.insert(&mut txn, bob, lamp, &[Some(Value::Int32(1))])?;
    db.commit(txn)?;
    println!("   {} customers, {} products, {} purchases", customers.num_rows(), products.num_rows(), bought.num_rels());

    println!("3. Reading edges...");
    let reader = db.begin_read_transaction();
    for row in bought.scan(&reader, RelDirection::Forward, alice, &[0])? {
        println!("   alice -> product {} (rel {}), quantity {:?}", row.nbr, row.rel_id, row.properties[0]);
    }
    println!("   lamp buyers: {:?}", bought.neighbors(&reader, RelDirection::Backward, lamp)?);

    println!("4. Updating and deleting...");
    let mut txn = db.begin_write_transaction()?;
    bought.update(&mut txn, alice, desk, order, 0, Some(Value::Int32(3)))?;
    bought.delete(&mut txn, bob, lamp, 2)?;
    db.commit(txn)?;
    let reader = db.begin_read_transaction();
    println!("   lamp buyers now: {:?}", bought.neighbors(&reader, RelDirection::Backward, lamp)?);

    println!("5. Checkpoint and reopen...");
    let path = db.path().map(|p| p.to_path_buf()).ok_or("in-memory database")?;
    db.close()?;
    let db = Database::open(&path)?;
    let bought = db.rel_table("bought")?;
    println!("   reopened with {} purchases", bought.num_rels());

    println!("\n=== Done ===");
    Ok(())
}
