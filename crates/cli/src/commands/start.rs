//! `routecodex start` — run the proxy.

use crate::supervisor::{self, SupervisorOptions};

pub async fn run(opts: SupervisorOptions) -> anyhow::Result<()> {
    println!("routecodex starting");
    if opts.daemon {
        println!("   mode: daemon supervisor");
    }
    supervisor::run(opts).await
}
