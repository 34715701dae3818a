use super::competition::CompetitionCommands;
use super::entry::EntryCommands;
use super::verify::VerifyCommands;
use super::{Cli, Commands, PartialAppConfig, ResolvedCli};
use crate::{AppConfig, SnapshotStore};
use clap::Parser;
use confique::{Config, Layer};
use fairdraw_core::{Actor, EventType, OsEntropy, Prize, Registry};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

/// Test helper that creates a ResolvedCli for one command against a temp snapshot
fn create_test_cli(temp_path: &Path, operator: &str, command: Commands) -> ResolvedCli {
    let mut partial_config = PartialAppConfig::default_values();
    partial_config.store.snapshot_path = Some(temp_path.join("ledger.json"));
    partial_config.operator.operator_id = Some(operator.to_string());

    let config = AppConfig::builder()
        .preloaded(partial_config)
        .load()
        .expect("Failed to load test config")
        .with_resolved_paths()
        .expect("Failed to resolve paths in test config");

    ResolvedCli {
        command,
        config,
        actor: Actor::Operator,
        verbose: true,
    }
}

/// Run one command through the same load/execute/save path as `Cli::run`.
async fn run(temp_path: &Path, operator: &str, command: Commands) -> anyhow::Result<Value> {
    let cli = create_test_cli(temp_path, operator, command);
    cli.apply(&SnapshotStore::new(&cli.config.store.snapshot_path))
        .await
}

async fn seed_competition(temp_path: &Path, operator: &str, entrants: usize) {
    run(
        temp_path,
        operator,
        Commands::Competition {
            command: CompetitionCommands::Create {
                id: "spring".into(),
                title: "Spring Giveaway".into(),
                prizes: vec![Prize::new("first", "Bike"), Prize::new("second", "Helmet")],
            },
        },
    )
    .await
    .unwrap();
    for i in 1..=entrants {
        run(
            temp_path,
            operator,
            Commands::Entry {
                command: EntryCommands::Submit {
                    competition: "spring".into(),
                    external_ref: format!("order-{i}"),
                    free: i % 2 == 0,
                    ineligible: false,
                },
            },
        )
        .await
        .unwrap();
    }
}

#[test]
fn test_parse_draw_command() {
    let cli = Cli::try_parse_from([
        "fairdraw", "--operator", "acme", "draw", "spring", "--prize", "first",
    ])
    .unwrap();
    assert_eq!(cli.config.operator.operator_id.as_deref(), Some("acme"));
    assert!(matches!(
        cli.command,
        Commands::Draw { ref prize, all: false, .. } if prize.as_deref() == Some("first")
    ));

    // --prize and --all are mutually exclusive, and one is required
    assert!(Cli::try_parse_from(["fairdraw", "draw", "spring"]).is_err());
    assert!(Cli::try_parse_from(["fairdraw", "draw", "spring", "--prize", "a", "--all"]).is_err());
}

#[test]
fn test_parse_prize_flags() {
    let cli = Cli::try_parse_from([
        "fairdraw",
        "competition",
        "create",
        "spring",
        "--title",
        "Spring",
        "--prize",
        "first=Bike",
        "--prize",
        "second=Helmet",
    ])
    .unwrap();
    match cli.command {
        Commands::Competition {
            command: CompetitionCommands::Create { prizes, .. },
        } => {
            let ids: Vec<_> = prizes.iter().map(|p| p.id.as_str()).collect();
            assert_eq!(ids, ["first", "second"]);
        }
        _ => panic!("expected competition create"),
    }
    assert!(Cli::try_parse_from(["fairdraw", "competition", "add-prize", "spring", "no-name"]).is_err());
}

#[tokio::test]
async fn test_missing_snapshot_starts_empty() {
    let temp_dir = tempdir().unwrap();
    let store = SnapshotStore::new(temp_dir.path().join("absent.json"));
    let registry = store.load(Arc::new(OsEntropy)).await.unwrap();
    assert!(registry.operators().is_empty());
}

#[tokio::test]
async fn test_draw_survives_reload_and_verifies() {
    let temp_dir = tempdir().unwrap();
    let temp_path = temp_dir.path();
    seed_competition(temp_path, "acme", 4).await;

    let audits = run(
        temp_path,
        "acme",
        Commands::Draw {
            competition: "spring".into(),
            prize: None,
            all: true,
        },
    )
    .await
    .unwrap();
    let audits = audits.as_array().unwrap();
    assert_eq!(audits.len(), 2);
    let draw_id: uuid::Uuid = audits[0]["draw_id"].as_str().unwrap().parse().unwrap();

    // Each run reloads the snapshot written by the previous one
    let check = run(
        temp_path,
        "acme",
        Commands::Verify {
            command: VerifyCommands::Draw { draw_id },
        },
    )
    .await
    .unwrap();
    assert_eq!(check["valid"], Value::Bool(true));

    let report = run(
        temp_path,
        "acme",
        Commands::Verify {
            command: VerifyCommands::Events,
        },
    )
    .await
    .unwrap();
    assert_eq!(report["status"], "valid");
    // created + 4 entries + 3 events per prize
    assert_eq!(report["total"], 11);

    let public = run(temp_path, "acme", Commands::Audit { draw_id }).await.unwrap();
    assert_eq!(public["pool_hash"], audits[0]["pool_hash"]);
    assert!(public["revealed_seed"].as_str().is_some_and(|s| s.len() == 64));
}

#[tokio::test]
async fn test_only_mutating_commands_write_the_snapshot() {
    let temp_dir = tempdir().unwrap();
    let temp_path = temp_dir.path();
    let path = temp_path.join("ledger.json");
    seed_competition(temp_path, "acme", 2).await;
    let before = std::fs::read(&path).unwrap();

    run(
        temp_path,
        "acme",
        Commands::Verify {
            command: VerifyCommands::Events,
        },
    )
    .await
    .unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), before);

    run(
        temp_path,
        "acme",
        Commands::Complaint {
            reference: "case-1".into(),
            summary: "winner not contacted".into(),
            competition: Some("spring".into()),
        },
    )
    .await
    .unwrap();
    assert_ne!(std::fs::read(&path).unwrap(), before);

    let events = run(
        temp_path,
        "acme",
        Commands::Events {
            event_type: Some(EventType::ComplaintSubmitted),
            after: 0,
        },
    )
    .await
    .unwrap();
    assert_eq!(events.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_entry_is_rejected_and_not_saved() {
    let temp_dir = tempdir().unwrap();
    let temp_path = temp_dir.path();
    seed_competition(temp_path, "acme", 1).await;

    let result = run(
        temp_path,
        "acme",
        Commands::Entry {
            command: EntryCommands::Submit {
                competition: "spring".into(),
                external_ref: "order-1".into(),
                free: false,
                ineligible: false,
            },
        },
    )
    .await;
    assert!(result.unwrap_err().to_string().contains("already exists"));

    let entries = run(
        temp_path,
        "acme",
        Commands::Entry {
            command: EntryCommands::List {
                competition: "spring".into(),
            },
        },
    )
    .await
    .unwrap();
    assert_eq!(entries.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_verify_all_covers_every_operator() {
    let temp_dir = tempdir().unwrap();
    let temp_path = temp_dir.path();
    seed_competition(temp_path, "acme", 2).await;
    seed_competition(temp_path, "globex", 3).await;

    let reports = run(
        temp_path,
        "acme",
        Commands::Verify {
            command: VerifyCommands::All,
        },
    )
    .await
    .unwrap();
    let reports = reports.as_object().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports["globex"]["events"]["total"], 4);
    assert!(reports
        .values()
        .all(|r| r["events"]["status"] == "valid" && r["audits"]["status"] == "valid"));
}

#[tokio::test]
async fn test_tampered_snapshot_is_reported() {
    let temp_dir = tempdir().unwrap();
    let temp_path = temp_dir.path();
    seed_competition(temp_path, "acme", 3).await;

    // Edit an entry event directly in the file
    let path = temp_path.join("ledger.json");
    let mut snapshot: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    snapshot["operators"]["acme"]["ledger"]["events"][2]["payload"]["external_ref"] =
        Value::from("someone-else");
    std::fs::write(&path, serde_json::to_vec(&snapshot).unwrap()).unwrap();

    let report = run(
        temp_path,
        "acme",
        Commands::Verify {
            command: VerifyCommands::Events,
        },
    )
    .await
    .unwrap();
    assert_eq!(report["status"], "invalid");
    assert_eq!(report["invalid_hashes"][0]["sequence"], 3);
    assert_eq!(report["broken_links"][0]["sequence"], 4);
}

#[tokio::test]
async fn test_save_leaves_no_temp_file() {
    let temp_dir = tempdir().unwrap();
    let nested = temp_dir.path().join("state").join("ledger.json");
    let store = SnapshotStore::new(&nested);
    let registry = Registry::default();
    registry
        .create_competition("acme", "spring", "Spring", vec![], Actor::Operator)
        .unwrap();
    store.save(&registry).await.unwrap();

    let names: Vec<_> = std::fs::read_dir(nested.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(names, ["ledger.json"]);

    let reloaded = store.load(Arc::new(OsEntropy)).await.unwrap();
    assert_eq!(reloaded.competitions("acme").unwrap().len(), 1);
}

#[tokio::test]
async fn test_corrupt_snapshot_fails_loudly() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("ledger.json");
    std::fs::write(&path, b"{not json").unwrap();
    let err = SnapshotStore::new(&path)
        .load(Arc::new(OsEntropy))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("Invalid snapshot"));
}
