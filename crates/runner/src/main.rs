//! Spacelink runner
//!
//! This crate is the *composition root*: it loads settings, pools
//! connections to every configured server, subscribes to the game tables
//! and logs what the servers push until Ctrl-C.

mod run;
mod subscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    run::run().await
}
