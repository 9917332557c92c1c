//! Integration tests for the gt CLI.
//!
//! These drive the binary end to end against a temporary town root and
//! cover the cross-component scenarios: hook-and-continue, queue claims,
//! decision supersession, and the stable exit-code contract.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::TempDir;

/// Helper to create a gt Command pointed at a town root.
fn gt(town: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("gt");
    cmd.arg("--town").arg(town.path());
    cmd
}

fn init_town(town: &TempDir) {
    gt(town)
        .args(["init", "--name", "bartertown"])
        .assert()
        .success();
}

fn add_rig(town: &TempDir) {
    gt(town)
        .args([
            "rig",
            "add",
            "gastown",
            "https://example.com/gastown.git",
            "--prefix",
            "gt",
        ])
        .assert()
        .success();
}

/// Run a command expecting success and parse its --json envelope.
fn json_ok(cmd: &mut Command) -> Value {
    let output = cmd.arg("--json").assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid JSON envelope")
}

// =============================================================================
// Basic CLI
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_gt_help() {
        cargo_bin_cmd!("gt").arg("--help").assert().success();
    }

    #[test]
    fn test_gt_version() {
        cargo_bin_cmd!("gt").arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_town_layout() {
        let town = TempDir::new().unwrap();
        gt(&town)
            .args(["init", "--name", "bartertown"])
            .assert()
            .success()
            .stdout(predicate::str::contains("bartertown"));

        assert!(town.path().join("mayor/town.json").exists());
        assert!(town.path().join("mayor/rigs.json").exists());
        assert!(town.path().join("mayor/routes.jsonl").exists());
        assert!(town.path().join(".beads").exists());
        assert!(town.path().join(".gastown/daemon.token").exists());
    }

    #[test]
    fn test_commands_fail_without_town() {
        let town = TempDir::new().unwrap();
        gt(&town)
            .args(["bead", "list", "hq"])
            .assert()
            .failure()
            .code(1);
    }

    #[test]
    fn test_json_envelope_has_meta() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        let env = json_ok(gt(&town).args(["routes", "list"]));
        assert_eq!(env["_meta"]["v"], 1);
        assert!(env["routes"].is_array());
    }
}

// =============================================================================
// Routes & rigs
// =============================================================================

mod routing {
    use super::*;

    #[test]
    fn test_rig_add_registers_prefix_route() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_rig(&town);

        let env = json_ok(gt(&town).args(["routes", "list"]));
        let prefixes: Vec<&str> = env["routes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["prefix"].as_str().unwrap())
            .collect();
        assert!(prefixes.contains(&"hq"));
        assert!(prefixes.contains(&"gt"));
        assert!(town.path().join("gastown/.beads").exists());
        assert!(town.path().join("gastown/witness").exists());
    }

    #[test]
    fn test_conflicting_prefix_is_state_conflict() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["routes", "add", "zz", "/tmp/a"])
            .assert()
            .success();
        gt(&town)
            .args(["routes", "add", "zz", "/tmp/b"])
            .assert()
            .failure()
            .code(4);
    }

    #[test]
    fn test_unknown_prefix_is_not_found() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["bead", "create", "zz-1", "nope"])
            .assert()
            .failure()
            .code(3);
    }
}

// =============================================================================
// Beads
// =============================================================================

mod beads {
    use super::*;

    #[test]
    fn test_create_show_close_lifecycle() {
        let town = TempDir::new().unwrap();
        init_town(&town);

        gt(&town)
            .args(["bead", "create", "hq-first", "do the thing", "--priority", "1"])
            .assert()
            .success();

        let shown = json_ok(gt(&town).args(["bead", "show", "hq-first"]));
        assert_eq!(shown["id"], "hq-first");
        assert_eq!(shown["status"], "open");
        assert_eq!(shown["priority"], 1);

        gt(&town)
            .args(["bead", "close", "hq-first", "--reason", "done"])
            .assert()
            .success();

        // Closed beads leave list(open) but stay visible via show.
        let open = json_ok(gt(&town).args(["bead", "list", "hq", "--status", "open"]));
        assert_eq!(open["count"], 0);
        let shown = json_ok(gt(&town).args(["bead", "show", "hq-first"]));
        assert_eq!(shown["status"], "closed");
        assert_eq!(shown["close_reason"], "done");
    }

    #[test]
    fn test_missing_bead_is_exit_three() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["bead", "show", "hq-ghost"])
            .assert()
            .failure()
            .code(3);
    }

    #[test]
    fn test_invalid_id_is_usage_error() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["bead", "create", "NOT_AN_ID", "x"])
            .assert()
            .failure()
            .code(2);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        for id in ["hq-a", "hq-b"] {
            gt(&town).args(["bead", "create", id, id]).assert().success();
        }
        gt(&town)
            .args(["bead", "dep", "hq-b", "hq-a"])
            .assert()
            .success();
        gt(&town)
            .args(["bead", "dep", "hq-a", "hq-b"])
            .assert()
            .failure()
            .code(4);
    }

    #[test]
    fn test_ready_respects_blockers() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        for id in ["hq-a", "hq-b"] {
            gt(&town).args(["bead", "create", id, id]).assert().success();
        }
        gt(&town)
            .args(["bead", "dep", "hq-b", "hq-a"])
            .assert()
            .success();

        let ready = json_ok(gt(&town).args(["bead", "ready", "hq"]));
        let ids: Vec<&str> = ready["beads"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["hq-a"]);

        gt(&town).args(["bead", "close", "hq-a"]).assert().success();
        let ready = json_ok(gt(&town).args(["bead", "ready", "hq"]));
        assert_eq!(ready["count"], 1);
        assert_eq!(ready["beads"][0]["id"], "hq-b");
    }

    #[test]
    fn test_json_error_envelope_carries_code() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        let output = gt(&town)
            .args(["bead", "show", "hq-ghost", "--json"])
            .assert()
            .failure()
            .get_output()
            .stdout
            .clone();
        let env: Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(env["error"]["code"], "E_NOT_FOUND");
        assert_eq!(env["error"]["exit"], 3);
    }
}

// =============================================================================
// S1: hook and continue through a molecule
// =============================================================================

mod molecules {
    use super::*;

    #[test]
    fn test_hook_and_continue_advances_molecule() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_rig(&town);

        gt(&town)
            .args(["agent", "add", "gastown", "crew", "alice"])
            .assert()
            .success();

        gt(&town)
            .args(["bead", "create", "gt-mol1", "the molecule", "--type", "molecule"])
            .assert()
            .success();
        for step in ["gt-mol1_1", "gt-mol1_2", "gt-mol1_3"] {
            gt(&town)
                .args(["bead", "create", step, step, "--parent", "gt-mol1"])
                .assert()
                .success();
        }
        gt(&town)
            .args(["bead", "dep", "gt-mol1_2", "gt-mol1_1"])
            .assert()
            .success();

        gt(&town)
            .args(["hook", "gt-agent-alice", "gt-mol1_1"])
            .assert()
            .success();

        let env = json_ok(gt(&town).args(["continue", "gt-mol1_1"]));
        assert_eq!(env["next"], "gt-mol1_2");

        let agent = json_ok(gt(&town).args(["bead", "show", "gt-agent-alice"]));
        assert_eq!(agent["fields"]["hook_bead"], "gt-mol1_2");
        let step = json_ok(gt(&town).args(["bead", "show", "gt-mol1_2"]));
        assert_eq!(step["status"], "hooked");
    }

    #[test]
    fn test_hooking_hooked_bead_is_conflict() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_rig(&town);
        for name in ["alice", "bob"] {
            gt(&town)
                .args(["agent", "add", "gastown", "crew", name])
                .assert()
                .success();
        }
        gt(&town)
            .args(["bead", "create", "gt-work", "work"])
            .assert()
            .success();
        gt(&town)
            .args(["hook", "gt-agent-alice", "gt-work"])
            .assert()
            .success();
        gt(&town)
            .args(["hook", "gt-agent-bob", "gt-work"])
            .assert()
            .failure()
            .code(4);
    }
}

// =============================================================================
// S4: queue claims are at-most-once, FIFO
// =============================================================================

mod queues {
    use super::*;

    #[test]
    fn test_queue_claims_fifo_exactly_once() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["queue", "create", "build"])
            .assert()
            .success();

        for subject in ["m1", "m2", "m3"] {
            gt(&town)
                .args([
                    "mail", "send", "--from", "hq/deacon", "--to", "queue:build",
                    "--subject", subject,
                ])
                .assert()
                .success();
        }

        let depth = json_ok(gt(&town).args(["queue", "depth", "build"]));
        assert_eq!(depth["depth"], 3);

        let c1 = json_ok(gt(&town).args(["queue", "claim", "build", "w1"]));
        assert_eq!(c1["title"], "m1");
        let c2 = json_ok(gt(&town).args(["queue", "claim", "build", "w2"]));
        assert_eq!(c2["title"], "m2");
        let c3 = json_ok(gt(&town).args(["queue", "claim", "build", "w1"]));
        assert_eq!(c3["title"], "m3");

        let depth = json_ok(gt(&town).args(["queue", "depth", "build"]));
        assert_eq!(depth["depth"], 0);
        let empty = json_ok(gt(&town).args(["queue", "claim", "build", "w1"]));
        assert!(empty["message"].is_null());
    }

    #[test]
    fn test_ambiguous_bare_name_needs_prefix() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["queue", "create", "alerts"])
            .assert()
            .success();
        gt(&town)
            .args(["channel", "create", "alerts"])
            .assert()
            .success();

        gt(&town)
            .args([
                "mail", "send", "--from", "hq/deacon", "--to", "alerts", "--subject", "x",
            ])
            .assert()
            .failure()
            .code(2);

        // Explicit prefix resolves.
        gt(&town)
            .args([
                "mail", "send", "--from", "hq/deacon", "--to", "channel:alerts",
                "--subject", "x",
            ])
            .assert()
            .success();
    }

    #[test]
    fn test_channel_retention_required_without_caps_fails() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        gt(&town)
            .args(["channel", "create", "bad", "--retention-required"])
            .assert()
            .failure()
            .code(4);
    }
}

// =============================================================================
// S5: decision supersession
// =============================================================================

mod decisions {
    use super::*;

    fn request(town: &TempDir, question: &str) -> Value {
        json_ok(gt(town).args([
            "decision",
            "request",
            "--requester",
            "hq-agent-alice",
            "--question",
            question,
            "--option",
            "ship:merge now",
            "--option",
            "wait:hold for review",
        ]))
    }

    fn add_alice(town: &TempDir) {
        gt(town)
            .args(["agent", "add", "gastown", "crew", "alice"])
            .assert()
            .success();
    }

    #[test]
    fn test_newer_decision_supersedes_older() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_alice(&town);

        let d1 = request(&town, "First question about shipping?");
        let d2 = request(&town, "Second question about testing?");

        let old = json_ok(gt(&town).args(["bead", "show", d1["id"].as_str().unwrap()]));
        assert_eq!(old["status"], "closed");
        assert_eq!(old["close_reason"], "superseded");

        let pending = json_ok(gt(&town).args(["decision", "list"]));
        assert_eq!(pending["count"], 1);
        assert_eq!(pending["beads"][0]["id"], d2["id"]);
    }

    #[test]
    fn test_resolution_unblocks_dependents() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_alice(&town);
        gt(&town)
            .args(["bead", "create", "hq-gated", "waiting on human"])
            .assert()
            .success();

        let d = json_ok(gt(&town).args([
            "decision",
            "request",
            "--requester",
            "hq-agent-alice",
            "--question",
            "Proceed with the migration?",
            "--option",
            "yes:go",
            "--option",
            "no:stop",
            "--blocker",
            "hq-gated",
        ]));
        let id = d["id"].as_str().unwrap();

        let ready = json_ok(gt(&town).args(["bead", "ready", "hq"]));
        let ids: Vec<&str> = ready["beads"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert!(!ids.contains(&"hq-gated"));

        let resolved = json_ok(gt(&town).args([
            "decision", "resolve", id, "1", "--rationale", "go for it",
        ]));
        assert_eq!(resolved["fields"]["chosen_index"], 1);
        assert!(resolved["labels"]
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l == "decision:resolved"));

        let ready = json_ok(gt(&town).args(["bead", "ready", "hq"]));
        let ids: Vec<&str> = ready["beads"]
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"hq-gated"));
    }

    #[test]
    fn test_custom_text_response_resolves() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_alice(&town);
        let d = request(&town, "Which path should we take?");
        let id = d["id"].as_str().unwrap();

        let resolved = json_ok(gt(&town).args([
            "decision", "respond", id, "neither, refactor first",
        ]));
        assert!(resolved["labels"]
            .as_array()
            .unwrap()
            .iter()
            .any(|l| l == "implicit:custom_text"));
    }

    #[test]
    fn test_auto_close_sweeps_stale_decisions() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_alice(&town);
        let d = request(&town, "Stale question about nothing?");

        let swept = json_ok(gt(&town).args(["decision", "auto-close", "--threshold-secs", "0"]));
        let closed: Vec<&str> = swept["closed"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert!(closed.contains(&d["id"].as_str().unwrap()));
    }
}

// =============================================================================
// Agents & reconcile surface
// =============================================================================

mod agents {
    use super::*;

    #[test]
    fn test_agent_add_declares_bead() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_rig(&town);

        let env = json_ok(gt(&town).args(["agent", "add", "gastown", "polecat", "nux"]));
        assert_eq!(env["id"], "gt-agent-nux");
        assert_eq!(env["fields"]["role_type"], "polecat");
        assert_eq!(env["fields"]["agent_state"], "spawning");

        let list = json_ok(gt(&town).args(["agent", "list"]));
        assert_eq!(list["count"], 1);
    }

    #[test]
    fn test_nudge_lands_in_injection_queue() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        add_rig(&town);
        gt(&town)
            .args(["agent", "add", "gastown", "crew", "alice"])
            .assert()
            .success();

        gt(&town)
            .args(["agent", "nudge", "gt-agent-alice", "check your hook"])
            .assert()
            .success();

        let drained = json_ok(gt(&town).args(["inject", "drain", "gt-agent-alice"]));
        assert_eq!(drained["count"], 1);
        assert_eq!(drained["entries"][0]["kind"], "nudge");
        assert_eq!(drained["entries"][0]["content"], "check your hook");

        // Drain consumed everything.
        let drained = json_ok(gt(&town).args(["inject", "drain", "gt-agent-alice"]));
        assert_eq!(drained["count"], 0);
    }

    #[test]
    fn test_injection_order_is_preserved() {
        let town = TempDir::new().unwrap();
        init_town(&town);
        for content in ["first", "second", "third"] {
            gt(&town)
                .args(["inject", "enqueue", "session-1", "mail", content])
                .assert()
                .success();
        }
        let drained = json_ok(gt(&town).args(["inject", "drain", "session-1"]));
        let contents: Vec<&str> = drained["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["content"].as_str().unwrap())
            .collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }
}
