//! Reflag Rust SDK Lab
//!
//! Offline verification script for client behaviour.
//! Run with: cargo run --example sdk-lab

use reflag::{
    ClientRegistry, EntityContext, EvaluationContext, FlagsClient, FlagsOptions, MemoryStorage,
    RawFlag, RawFlags,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const PASS: &str = "\x1b[32m[PASS]\x1b[0m";
const FAIL: &str = "\x1b[31m[FAIL]\x1b[0m";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("reflag=debug")),
        )
        .init();

    println!("=== Reflag Rust SDK Lab ===\n");

    let mut passed = 0;
    let mut failed = 0;

    macro_rules! pass {
        ($test:expr) => {{
            println!("{} {}", PASS, $test);
            passed += 1;
        }};
    }

    macro_rules! fail {
        ($test:expr) => {{
            println!("{} {}", FAIL, $test);
            failed += 1;
        }};
    }

    macro_rules! check {
        ($cond:expr, $test:expr) => {{
            if $cond {
                pass!($test);
            } else {
                fail!($test);
            }
        }};
    }

    // Test 1: Construction through the registry with bootstrapped flags
    println!("Testing initialization...");
    let mut bootstrap = RawFlags::new();
    bootstrap.insert("lab-on".to_string(), RawFlag::new("lab-on", true).targeting_version(1));
    bootstrap.insert("lab-off".to_string(), RawFlag::new("lab-off", false).targeting_version(1));

    let options = FlagsOptions::builder("pub_lab_key")
        .offline(true)
        .bootstrapped_flags(bootstrap)
        .build();

    let context = EvaluationContext::builder()
        .user(EntityContext::with_id("lab-user").name("Lab"))
        .company(EntityContext::with_id("lab-co"))
        .build();

    let registry = ClientRegistry::new();
    let client = match registry.get_or_insert_with("pub_lab_key", || {
        FlagsClient::builder(options)
            .context(context)
            .storage(Arc::new(MemoryStorage::new()))
            .build()
    }) {
        Ok(c) => c,
        Err(e) => {
            fail!(format!("Initialization - {}", e));
            print_summary(passed, failed);
            std::process::exit(1);
        }
    };

    let updates = Arc::new(AtomicUsize::new(0));
    let seen = updates.clone();
    client.on_updated(move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    client.initialize().await;
    pass!("initialize()");

    // Test 2: Bootstrapped flags
    println!("\nTesting flag evaluation...");
    check!(
        client.flag("lab-on").map_or(false, |f| f.is_enabled()),
        "Bootstrapped enabled flag"
    );
    check!(
        client.flag("lab-off").map_or(false, |f| !f.is_enabled()),
        "Bootstrapped disabled flag"
    );
    check!(client.flag("lab-missing").is_none(), "Unknown flag is absent");

    // Test 3: Overrides
    println!("\nTesting overrides...");
    client.set_flag_override("lab-off", Some(true));
    check!(
        client.flag("lab-off").map_or(false, |f| f.is_enabled()),
        "Override enables flag"
    );
    check!(updates.load(Ordering::SeqCst) == 1, "Override notified listener");

    client.set_flag_override("lab-off", None);
    check!(
        client.get_flag_override("lab-off").is_none(),
        "Override cleared"
    );

    check!(
        client
            .set_flag_override_json("lab-off", &serde_json::json!("nope"))
            .is_err(),
        "Non-boolean override rejected"
    );

    // Test 4: Offline mode
    println!("\nTesting offline mode...");
    check!(client.refresh_flags().await.is_none(), "refresh_flags() skipped");
    match client.flag("lab-on").map(|f| f.check_is_enabled_event()) {
        Some(event) => {
            let value = client.send_check_event(event, || {}).await;
            check!(value.is_none(), "send_check_event() skipped");
        }
        None => fail!("send_check_event() - missing flag"),
    }

    // Test 5: Cleanup
    println!("\nTesting cleanup...");
    registry.clear();
    check!(client.is_stopped(), "registry.clear() stops client");

    let before = updates.load(Ordering::SeqCst);
    client.set_flag_override("lab-on", Some(false));
    check!(
        updates.load(Ordering::SeqCst) == before,
        "No notifications after stop"
    );

    print_summary(passed, failed);

    if failed > 0 {
        println!("\n\x1b[31mSome verifications failed!\x1b[0m");
        std::process::exit(1);
    } else {
        println!("\n\x1b[32mAll verifications passed!\x1b[0m");
        std::process::exit(0);
    }
}

fn print_summary(passed: i32, failed: i32) {
    println!("\n{}", "=".repeat(40));
    println!("Results: {} passed, {} failed", passed, failed);
    println!("{}", "=".repeat(40));
}
