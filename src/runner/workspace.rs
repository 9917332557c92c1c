//! Agent workspace provisioning.
//!
//! The runner owns everything on disk an agent needs before its process
//! starts: the role directory, the identity environment, the instruction
//! file, and the startup script the session executes. Crew workspaces
//! persist across restarts; polecat and dog workspaces are torn down with
//! the agent.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::beads::types::RoleType;
use crate::errors::RunnerError;
use crate::runner::AgentSpec;

/// Identity environment propagated to every agent process.
#[derive(Debug, Clone)]
pub struct Identity {
    pub town_root: PathBuf,
    pub town_name: String,
    pub daemon_token: String,
}

/// Files laid down for a provisioned workspace.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub dir: PathBuf,
    pub env_file: PathBuf,
    pub startup_script: PathBuf,
}

/// Create the workspace directory tree and identity files for an agent.
pub fn provision(spec: &AgentSpec, identity: &Identity) -> Result<Workspace, RunnerError> {
    let dir = spec.workspace.clone();
    let io = |source| RunnerError::Workspace {
        path: dir.clone(),
        source,
    };
    std::fs::create_dir_all(&dir).map_err(io)?;

    let env_file = dir.join(".gt-env");
    let env = format!(
        "GT_ROLE={}\nGT_RIG={}\nGT_AGENT={}\nGT_TOWN={}\nGT_TOWN_ROOT={}\nGT_DAEMON_TOKEN={}\n",
        spec.role.as_str(),
        spec.rig,
        spec.name,
        identity.town_name,
        identity.town_root.display(),
        identity.daemon_token,
    );
    std::fs::write(&env_file, env).map_err(io)?;

    let instructions = dir.join("INSTRUCTIONS.md");
    if !instructions.exists() {
        std::fs::write(&instructions, instruction_text(spec)).map_err(io)?;
    }

    let startup_script = dir.join("start.sh");
    std::fs::write(&startup_script, startup_text(spec)).map_err(io)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(&startup_script, perms).map_err(io)?;
    }

    Ok(Workspace {
        dir,
        env_file,
        startup_script,
    })
}

/// Remove an ephemeral workspace. Persistent roles keep theirs; repeated
/// teardown is a no-op.
pub fn teardown(spec: &AgentSpec) -> Result<(), RunnerError> {
    if spec.role.persistent_workspace() || !spec.workspace.exists() {
        return Ok(());
    }
    // Sweep contents first so a partially-removed tree never survives a
    // crash between runs.
    let mut failures = Vec::new();
    for entry in WalkDir::new(&spec.workspace).contents_first(true) {
        let Ok(entry) = entry else { continue };
        let result = if entry.file_type().is_dir() {
            std::fs::remove_dir(entry.path())
        } else {
            std::fs::remove_file(entry.path())
        };
        if let Err(e) = result {
            failures.push((entry.path().to_path_buf(), e));
        }
    }
    if let Some((path, source)) = failures.into_iter().next() {
        return Err(RunnerError::Workspace { path, source });
    }
    Ok(())
}

fn instruction_text(spec: &AgentSpec) -> String {
    let role_blurb = match spec.role {
        RoleType::Mayor => "You coordinate the town. Route work, arbitrate conflicts.",
        RoleType::Deacon => "You run town-level background chores.",
        RoleType::Witness => "You watch this rig's agents and escalate lifecycle problems.",
        RoleType::Refinery => "You process this rig's merge queue.",
        RoleType::Crew => "You are an established worker on this rig.",
        RoleType::Polecat => "You are a transient worker; finish your bead and exit.",
        RoleType::Dog => "You run one chore and exit.",
    };
    format!(
        "# {} — {}/{}\n\n{}\n\nYour identity is in `.gt-env`. Use `gt` to read your hook, \
         your inbox, and to file beads.\n",
        spec.name, spec.rig, spec.role.as_str(), role_blurb
    )
}

fn startup_text(spec: &AgentSpec) -> String {
    format!(
        "#!/bin/sh\n# Session bootstrap for {}.\nset -a\n. ./.gt-env\nset +a\nexec \
         \"${{GT_AGENT_CMD:-claude}}\"\n",
        spec.session_name()
    )
}

/// Best-effort sweep of leftover ephemeral workspaces under a rig's
/// polecat/dog directories that no live agent owns.
pub fn sweep_orphans(base: &Path, live_names: &[String]) -> Vec<PathBuf> {
    let mut removed = Vec::new();
    for sub in ["polecats", "dogs"] {
        let root = base.join(sub);
        let Ok(entries) = std::fs::read_dir(&root) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if live_names.contains(&name) {
                continue;
            }
            if std::fs::remove_dir_all(entry.path()).is_ok() {
                removed.push(entry.path());
            }
        }
    }
    removed
}
