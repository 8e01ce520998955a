//! Headless client for a live page: bootstraps, loads assets, mounts the
//! layout with logging components and follows the session until it ends.
//!
//! Run with: `cargo run --example headless -- http://127.0.0.1:8000/home`
//!
//! Set `RUST_LOG=aspect_sync=debug` to see every frame being routed.

use std::sync::Arc;

use aspect_sync::{
    AspectStore, Component, ComponentRegistry, FileStorage, SessionBuilder, SessionEvent,
    SessionState,
};
use tracing_subscriber::EnvFilter;

// ---------------------------------------------------------------------------
// Logging component
// ---------------------------------------------------------------------------

/// Prints every aspect change it is told about.
struct Printer {
    label: String,
}

impl Component for Printer {
    fn aspects_changed(&self, store: &AspectStore, names: &[String]) {
        for name in names {
            let value = store.get_aspect(name).unwrap_or_default();
            println!("{}.{name} = {value}", self.label);
        }
    }

    fn unmounted(&self, identity: &str) {
        println!("{} unmounted ({identity})", self.label);
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let page_url = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8000/".to_owned());
    let storage_dir = std::env::temp_dir().join("aspect-sync-headless");

    let components = ComponentRegistry::new().fallback(|store: &AspectStore| {
        let label = format!(
            "{}.{}#{}",
            store.package_name(),
            store.component_name(),
            store.identity()
        );
        Arc::new(Printer { label }) as Arc<dyn Component>
    });

    let session = SessionBuilder::new(page_url)
        .storage(Arc::new(FileStorage::open(storage_dir)?))
        .components(components)
        .spawn()?;

    let mut events = session.events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Ready) => println!("session ready"),
                Ok(SessionEvent::Remount) => println!("code changed, remounting"),
                Ok(SessionEvent::Refresh) => {
                    println!("server requested a full refresh");
                    break;
                }
                Ok(SessionEvent::ConnectionLost) => {
                    println!("connection lost");
                    break;
                }
                Ok(SessionEvent::Failed(reason)) => {
                    eprintln!("session failed: {reason}");
                    break;
                }
                Err(e) => {
                    eprintln!("event stream ended: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let state = session.state();
    session.shutdown().await?;
    println!("stopped in state {state:?}");
    if state == SessionState::Failed {
        std::process::exit(1);
    }
    Ok(())
}
