//! Tracing setup for binaries embedding the client.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset
pub const DEFAULT_DIRECTIVE: &str = "spacelink_client=info,spacelink_runner=info";

/// Install a global subscriber: `EnvFilter` from `RUST_LOG` (or `fallback`)
/// plus a fmt layer.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(fallback: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
