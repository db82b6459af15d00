//! Health checks over the external subsystems and persisted state

use crate::ctx::Ctx;
use crate::orphan;
use anyhow::Result;
use owo_colors::OwoColorize;

struct Checkup {
    failures: usize,
}

impl Checkup {
    fn pass(&mut self, what: &str, detail: String) {
        println!("  {} {} - {}", "✓".green(), what, detail.dimmed());
    }

    fn fail(&mut self, what: &str, error: String) {
        self.failures += 1;
        println!("  {} {} - {}", "✗".red(), what, error);
    }
}

pub async fn run(ctx: &Ctx) -> Result<()> {
    println!("{}", "Running checks...".bold());
    let mut checkup = Checkup { failures: 0 };

    // zfs reachable
    match ctx.zfs.list_pools().await {
        Ok(pools) => checkup.pass("zfs", format!("pools: {}", pools.join(", "))),
        Err(e) => checkup.fail("zfs", format!("{:#}", e)),
    }

    // docker reachable
    match ctx.docker.list_containers().await {
        Ok(containers) => checkup.pass("docker", format!("{} container(s)", containers.len())),
        Err(e) => checkup.fail("docker", format!("{:#}", e)),
    }

    // host setup marker
    if ctx.setup_has_run() {
        checkup.pass("setup", "one-time host setup complete".to_string());
    } else {
        checkup.fail("setup", "not run - 'pgbranch setup'".to_string());
    }

    // state file parses and satisfies invariants
    let state = match ctx.store.load() {
        Ok(Some(state)) => {
            checkup.pass(
                "state",
                format!(
                    "{} project(s), {} snapshot record(s)",
                    state.projects.len(),
                    state.snapshots.len()
                ),
            );
            Some(state)
        }
        Ok(None) => {
            checkup.pass("state", "uninitialized".to_string());
            None
        }
        Err(e) => {
            checkup.fail("state", format!("{:#}", e));
            None
        }
    };

    if let Some(state) = &state {
        // pool backing the state
        match ctx.zfs.pool_status(&state.zfs_pool).await {
            Ok(status) if status.health == "ONLINE" => {
                checkup.pass("pool", format!("{} ONLINE", state.zfs_pool))
            }
            Ok(status) => checkup.fail("pool", format!("{} is {}", state.zfs_pool, status.health)),
            Err(e) => checkup.fail("pool", format!("{:#}", e)),
        }

        // WAL archive gaps per branch
        for branch in state.all_branches() {
            match ctx.wal.verify_integrity(&branch.zfs_dataset) {
                Ok(gaps) if gaps.is_empty() => {}
                Ok(gaps) => checkup.fail(
                    "wal",
                    format!("{}: {} missing segment(s)", branch.name, gaps.len()),
                ),
                Err(e) => checkup.fail("wal", format!("{}: {:#}", branch.name, e)),
            }
        }

        // untracked resources
        match orphan::detect(ctx, state).await {
            Ok(report) if report.is_clean() => {
                checkup.pass("orphans", "none".to_string())
            }
            Ok(report) => checkup.fail(
                "orphans",
                format!(
                    "{} found - run 'pgbranch cleanup'",
                    report.total_orphans()
                ),
            ),
            Err(e) => checkup.fail("orphans", format!("{:#}", e)),
        }
    }

    println!();
    if checkup.failures == 0 {
        println!("{} All checks passed", "✓".green());
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", checkup.failures)
    }
}
