//! Hot-reload demo.
//!
//! Watches a scripts directory, drives the local host's timers, and fires a
//! `tick` event every second. Edit, add, or delete `.rhai` files in the
//! directory while it runs.
//!
//! ```text
//! cargo run --example hot_reload -- ./scripts
//! ```

use std::sync::Arc;
use std::time::Duration;

use script_runtime::{LocalHost, ManagerConfig, ScriptEvent, ScriptManager};
use serde_json::json;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

const GREETER: &str = r#"
fn onEnable() {
    print("greeter enabled");
}

fn onDisable() {
    print("greeter disabled");
}

addCommand(#{ name: "hello", aliases: ["hi"] }, |sender, label, args| {
    `hello ${sender}, you said ${args}`
});

addEventListener("tick", |event| print(`tick ${event.n}`), "monitor");

setInterval(|| print("interval"), 2500);
"#;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = std::env::args().nth(1).unwrap_or_else(|| "scripts".to_string());
    let config = ManagerConfig::new()
        .with_scripts_dir(&dir)
        .with_debounce(Duration::from_millis(200));

    let host = Arc::new(LocalHost::new());
    let manager = ScriptManager::new(host.clone(), config)?;

    manager.on_event(|event| {
        if let ScriptEvent::Failed { message, .. } = event {
            eprintln!("{} failed: {}", event.script_name(), message);
        }
    });

    let greeter = manager.config().script_path("greeter.rhai");
    if !greeter.exists() {
        std::fs::create_dir_all(&dir)?;
        std::fs::write(&greeter, GREETER)?;
    }

    let added = manager.load_directory(true)?;
    let enabled = manager.enable_all();
    println!("Added {} script(s), enabled {}; watching {}", added, enabled, dir);

    if let Ok(reply) = host.dispatch_command("hi", json!("console"), &["there"]) {
        println!("hi -> {}", reply);
    }

    for n in 0..60 {
        std::thread::sleep(Duration::from_secs(1));
        host.advance(Duration::from_secs(1));
        host.fire_event("tick", json!({ "n": n }));

        if n % 10 == 9 {
            println!("{:?}", manager.stats());
        }
    }

    println!("Shut down {} script(s)", manager.shutdown());
    Ok(())
}
