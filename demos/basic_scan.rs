use futures_util::TryStreamExt;
use region_scan::impls::mem_store::MemStore;
use region_scan::ScanError;
use region_scan::Scanner;
use region_scan::Snapshot;

#[tokio::main]
async fn main() -> Result<(), ScanError> {
    // Create a store and write a few keys at version 1
    let store = MemStore::new();
    for (k, v) in [("apple", "1"), ("banana", "2"), ("cherry", "3"), ("melon", "4")] {
        store.put(k, 1, v);
    }

    // Delete a key at version 2 (tombstone)
    store.delete("banana", 2);

    // Another transaction locks a key and commits at version 3
    store.lock("cherry", 3, Some(b"30".to_vec()));
    store.commit(3, 3);

    // Split the key space into two regions
    store.split("m");

    let snapshot = Snapshot::new(10, store);

    // Cursor scan, two entries per page
    let mut scanner = Scanner::new(&snapshot, b"", 2).await?;
    while scanner.valid() {
        println!(
            "Key: {}, Value: {}",
            String::from_utf8_lossy(scanner.key()),
            String::from_utf8_lossy(scanner.value())
        );
        scanner.next().await?;
    }

    // Stream scan from a start key
    let pairs = snapshot
        .iter(b"c")
        .await?
        .into_stream()
        .try_collect::<Vec<_>>()
        .await?;
    println!("{} pairs from \"c\"", pairs.len());

    Ok(())
}
