//! One-time host setup command

use crate::ctx::Ctx;
use crate::setup;
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn run(ctx: &Ctx, pool: Option<String>, check: bool) -> Result<()> {
    if check {
        setup::verify_host_setup(ctx).await?;
        println!("{} Host setup is in place", "✓".green());
        return Ok(());
    }

    println!("{}", "Setting up host permissions (requires sudo)...".bold());
    setup::run_setup(ctx, pool.as_deref()).await?;
    println!("{} Setup complete", "✓".green());
    println!("  zfs delegation installed, sudoers entry for mounts written");
    println!("  Next: pgbranch project create <name>");
    Ok(())
}
