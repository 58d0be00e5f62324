//! Console example: connect to the catalog device and print its products
//!
//! Run with: cargo run --example catalog_console
//!
//! Optionally apply one command after the catalog is fetched:
//!
//! ```text
//! cargo run --example catalog_console -- add "Widget" 9.99 123
//! cargo run --example catalog_console -- update "Widget" 10.49 123
//! cargo run --example catalog_console -- delete 123
//! ```

use catalog_sync_ble::{CatalogSnapshot, Controller, Error, Price, Result, SyncConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("catalog_sync_ble=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    println!("Looking for the catalog device...");
    println!("Make sure it is powered on and advertising.\n");

    let controller = Controller::with_btleplug(&SyncConfig::default()).await?;
    let mut catalog = controller.watch_catalog();

    controller.connect().await?;

    // Wait for the automatic fetch
    tokio::time::timeout(Duration::from_secs(15), catalog.wait_for(|c| c.fresh))
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(|_| Error::Internal("catalog channel closed".to_string()))?;

    print_catalog(&controller.catalog());

    if let Some(command) = args.first() {
        match (command.as_str(), &args[1..]) {
            ("add", [name, price, barcode]) => {
                controller
                    .add_product(name, price.parse::<Price>()?, barcode)
                    .await?;
            }
            ("update", [name, price, barcode]) => {
                controller
                    .update_price(name, price.parse::<Price>()?, barcode)
                    .await?;
            }
            ("delete", [barcode]) => {
                controller.delete_product(barcode).await?;
            }
            _ => {
                eprintln!("Usage: catalog_console [add NAME PRICE BARCODE | update NAME PRICE BARCODE | delete BARCODE]");
                controller.disconnect().await?;
                return Ok(());
            }
        }

        println!("\nAfter {}:", command);
        print_catalog(&controller.catalog());
    }

    controller.disconnect().await?;
    println!("\nDone.");

    Ok(())
}

fn print_catalog(catalog: &CatalogSnapshot) {
    if catalog.is_empty() {
        println!("Catalog is empty.");
        return;
    }

    println!("{:<24} {:>10}  {}", "Name", "Price", "Barcode");
    for product in &catalog.products {
        println!(
            "{:<24} {:>10}  {}",
            product.name, product.price, product.barcode
        );
    }

    if let Some(synced_at) = catalog.synced_at {
        println!("\n{} products, synced at {}", catalog.len(), synced_at);
    }
}
