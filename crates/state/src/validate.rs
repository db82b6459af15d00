//! Load-time invariant validation
//!
//! Runs on every successful parse of the state document. A violation means
//! the document was corrupted or hand-edited; the caller treats it as fatal
//! and points the user at `state restore`.

use crate::model::State;
use anyhow::{bail, Result};
use std::collections::HashSet;

pub fn validate(state: &State) -> Result<()> {
    let mut project_names = HashSet::new();
    let mut branch_names = HashSet::new();
    let mut dataset_names = HashSet::new();

    for project in &state.projects {
        if !project_names.insert(project.name.as_str()) {
            bail!("duplicate project name '{}'", project.name);
        }

        let primaries = project.branches.iter().filter(|b| b.is_primary).count();
        if primaries != 1 {
            bail!(
                "project '{}' has {} primary branches, expected exactly 1",
                project.name,
                primaries
            );
        }

        for branch in &project.branches {
            if !branch_names.insert(branch.name.as_str()) {
                bail!("duplicate branch name '{}'", branch.name);
            }

            match branch.name.split_once('/') {
                Some((left, right))
                    if !right.contains('/') && left == project.name && !right.is_empty() => {}
                _ => bail!(
                    "branch name '{}' does not decompose into {}/<branch>",
                    branch.name,
                    project.name
                ),
            }

            if branch.is_primary {
                if branch.parent_branch_id.is_some() {
                    bail!("primary branch '{}' has a parent reference", branch.name);
                }
            } else {
                match branch.parent_branch_id {
                    Some(parent_id) => {
                        if project.branch_by_id(parent_id).is_none() {
                            bail!(
                                "branch '{}' has parent {} outside project '{}'",
                                branch.name,
                                parent_id,
                                project.name
                            );
                        }
                    }
                    None => bail!("non-primary branch '{}' has no parent", branch.name),
                }
            }

            let expected_dataset = branch.name.replace('/', "-");
            if branch.zfs_dataset != expected_dataset {
                bail!(
                    "branch '{}' has dataset '{}', expected '{}'",
                    branch.name,
                    branch.zfs_dataset,
                    expected_dataset
                );
            }
            if !dataset_names.insert(branch.zfs_dataset.as_str()) {
                bail!("duplicate dataset name '{}'", branch.zfs_dataset);
            }
        }
    }

    Ok(())
}
