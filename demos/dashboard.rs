//! Dashboard walkthrough over a scripted transport.
//!
//! Run with `cargo run --example dashboard`.

use query_kit::dependent::{identity_channel, CurrentUser, IdentityState};
use query_kit::error::Result;
use query_kit::transport::InMemoryTransport;
use query_kit::{Dashboard, DashboardConfig, DashboardSnapshot, QueryRunner};
use serde_json::json;
use std::sync::Arc;

fn print_snapshot(snapshot: &DashboardSnapshot) {
    println!(
        "   loading={} teams_loading={} error={}",
        snapshot.is_loading, snapshot.is_teams_loading, snapshot.is_error
    );
    let names: Vec<&str> = snapshot.all_hackathons.iter().map(|h| h.name.as_str()).collect();
    println!("   all hackathons: {:?}", names);
    let mine: Vec<&str> = snapshot.my_hackathons.iter().map(|h| h.name.as_str()).collect();
    println!("   my hackathons:  {:?}", mine);
    match snapshot.my_team.found() {
        Some(team) => println!("   my team:        {} ({})\n", team.name, team.id),
        None => println!("   my team:        none\n"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Debug)
        .try_init()
        .ok();

    println!("\n=== Query Kit - Dashboard Example ===\n");

    // 1. Script the backend
    println!("1. Scripting the hackathon backend...");
    let transport = InMemoryTransport::new();
    transport.respond(
        "/hackathons",
        json!({ "documents": [
            { "$id": "h1", "name": "Rust Hack" },
            { "$id": "h2", "name": "AI Jam" }
        ] }),
    );
    transport.respond(
        "/users/u2/hackathons",
        json!({ "hackathons": [{ "$id": "h1", "name": "Rust Hack" }] }),
    );
    transport.respond(
        "/teams?user_id=u2",
        json!({ "documents": [
            { "$id": "t1", "name": "Borrowers", "members": ["u1", "u2"] },
            { "$id": "t2", "name": "Lenders", "members": ["u3"] }
        ] }),
    );
    println!("   ✓ Backend ready\n");

    let config = DashboardConfig::from_env()?;
    let (provider, identity) = identity_channel(IdentityState::resolving());
    let mut dashboard = Dashboard::new(
        QueryRunner::default(),
        Arc::new(transport.clone()),
        identity,
        &config,
    );

    // 2. Identity still resolving: only the global list is fetched
    println!("2. Loading while identity resolves:");
    let snapshot = dashboard.load().await;
    print_snapshot(&snapshot);

    // 3. Signed in: dependent queries unblock
    println!("3. Signing in as u2:");
    provider
        .send(IdentityState::signed_in(CurrentUser::new("u2")))
        .ok();
    let snapshot = dashboard.load().await;
    print_snapshot(&snapshot);

    // 4. Fresh data is served from the cache
    println!("4. Loading again within the staleness window:");
    let snapshot = dashboard.load().await;
    print_snapshot(&snapshot);
    println!("   ✓ Backend calls so far: {}\n", transport.total_calls());

    // 5. Invalidate forces a re-fetch
    println!("5. Invalidating:");
    dashboard.invalidate();
    let snapshot = dashboard.load().await;
    print_snapshot(&snapshot);
    println!("   ✓ Backend calls so far: {}\n", transport.total_calls());

    println!("=== Example Complete ===\n");

    Ok(())
}
