//! State file recovery

use crate::ctx::Ctx;
use crate::util;
use anyhow::Result;
use owo_colors::OwoColorize;

pub async fn restore(ctx: &Ctx, yes: bool) -> Result<()> {
    let backup = ctx.store.backup_path();
    println!(
        "This replaces {} with the backup at {}.",
        ctx.store.path().display(),
        backup.display()
    );

    if !yes && !util::confirm("Restore state from backup?")? {
        println!("Aborted.");
        return Ok(());
    }

    let state = ctx.store.restore_backup()?;
    println!(
        "{} Restored state: {} project(s), {} snapshot record(s)",
        "✓".green(),
        state.projects.len(),
        state.snapshots.len()
    );
    Ok(())
}
