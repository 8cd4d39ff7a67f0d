use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;

use cluster_migrate::config::{ClusterRole, DATA_DIR_SETTING, LISTEN_ADDRESSES, VERSION_MARKER};
use cluster_migrate::fork::ForkStamp;
use cluster_migrate::outcome::{Branch, Phase, Severity};
use cluster_migrate::probe::DataDirectory;
use cluster_migrate::{Error, FinalState};

use crate::common::{make_data_dir, read_catalog, snapshot, Host};

fn set(dbs: &[&str]) -> BTreeSet<String> {
    dbs.iter().map(|s| s.to_string()).collect()
}

fn marker(dir: &Path) -> String {
    fs::read_to_string(dir.join(VERSION_MARKER)).unwrap()
}

/// Entries of `parent` named `<name>.<something>`.
fn moved_aside(parent: &Path, name: &str) -> Vec<PathBuf> {
    let prefix = format!("{name}.");
    fs::read_dir(parent)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            p.file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(&prefix)
        })
        .collect()
}

/// A 9.1 host whose customer cluster holds calendar data and is reachable from anywhere.
fn legacy_host() -> Host {
    let host = Host::new();
    make_data_dir(&host.legacy_root(), "9.1", &["postgres", "caldav", "shop"]);
    host.services.set("postgres", LISTEN_ADDRESSES, "*");
    host.services.mark_running("postgres");
    host
}

#[tokio::test]
async fn legacy_calendar_data_is_upgraded_and_forked() {
    let host = legacy_host();
    let layout = host.config().layout;

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::InPlaceUpgrade));
    assert_eq!(outcome.phase_reached, Phase::Finalized);
    assert!(outcome.diagnostics.is_empty(), "{outcome}");
    assert!(outcome.to_string().starts_with("success\n"));

    // customer keeps its own data, at the new version
    assert_eq!(marker(&layout.customer.data_dir), "9.2\n");
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres", "shop"]));
    assert_eq!(
        read_catalog(&layout.server_services.data_dir),
        set(&["postgres", "caldav", "collab", "device_management"])
    );
    assert!(layout.fork_stamp().is_file());
    assert_eq!(
        outcome.data_directories[&ClusterRole::Customer].path,
        layout.customer.data_dir
    );
    assert_eq!(
        outcome.data_directories[&ClusterRole::ServerServices].path,
        layout.server_services.data_dir
    );

    // legacy data untouched without purge
    assert_eq!(outcome.legacy_directory.as_deref(), Some(host.legacy_root().as_path()));
    assert_eq!(marker(&host.legacy_root()), "9.1\n");
    assert!(read_catalog(&host.legacy_root()).contains("caldav"));

    // the helper ran on the working copy, which is gone now
    let upgrades = host.runner.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(
        upgrades[0].flag_value("-d").unwrap(),
        layout.working_copy_dir().as_os_str()
    );
    assert_eq!(upgrades[0].flag_value("-b").unwrap(), "/opt/pg/9.1/bin");
    assert!(!layout.working_copy_dir().exists());
    assert!(!layout.staging_dir(ClusterRole::Customer).exists());

    // services left running, customer reachable as before
    assert_eq!(host.services.get("postgres", LISTEN_ADDRESSES).unwrap(), "*");
    assert_eq!(
        host.services.get("postgres", DATA_DIR_SETTING).unwrap(),
        layout.customer.data_dir.to_str().unwrap()
    );
    assert!(host.services.is_running("postgres"));
    assert!(host.services.is_running("postgres_server"));
}

#[tokio::test]
async fn second_run_changes_nothing() {
    let host = legacy_host();
    let first = host.orchestrator().run().await;
    assert_eq!(first.final_state, FinalState::Success, "{first}");

    let before = snapshot(host.dir.path());
    let second = host.orchestrator().run().await;

    assert_eq!(second.final_state, FinalState::AlreadyDone, "{second}");
    assert_eq!(second.branch, Some(Branch::AlreadyDone));
    assert!(second.is_success());
    assert!(second.to_string().starts_with("already migrated"));
    assert_eq!(snapshot(host.dir.path()), before);
    assert_eq!(host.runner.upgrades().len(), 1);
    assert_eq!(host.services.get("postgres", LISTEN_ADDRESSES).unwrap(), "*");
}

#[tokio::test]
async fn insufficient_space_stops_before_anything_is_touched() {
    let host = legacy_host();
    host.volumes.free.store(1 << 20, Ordering::SeqCst);
    let legacy_before = snapshot(&host.legacy_root());

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Failed);
    assert!(matches!(outcome.error, Some(Error::InsufficientSpace { .. })));
    assert_eq!(outcome.phase_reached, Phase::Classified);
    assert!(outcome.to_string().starts_with("failed: "));
    assert!(!host.services.called("stop postgres"));
    assert!(!host.target_root().exists());
    assert_eq!(snapshot(&host.legacy_root()), legacy_before);
    assert!(host.services.is_running("postgres"));
}

#[tokio::test]
async fn legacy_data_is_removed_only_when_purge_is_allowed() {
    let mut host = legacy_host();
    host.purge_allowed = true;

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert!(outcome.legacy_directory.is_none());
    assert!(!host.legacy_root().exists());
    let layout = host.config().layout;
    assert_eq!(marker(&layout.customer.data_dir), "9.2\n");
}

#[tokio::test]
async fn failed_upgrade_leaves_customer_reachable() {
    let host = legacy_host();
    host.runner.fail_upgrade.store(true, Ordering::SeqCst);
    let legacy_before = snapshot(&host.legacy_root());

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Failed);
    assert!(
        matches!(outcome.error, Some(Error::ExternalTool { ref tool, .. }) if tool == "pg_upgrade"),
        "{outcome}"
    );
    assert_eq!(outcome.phase_reached, Phase::Relocated);
    assert_eq!(host.runner.upgrades().len(), 1);

    // nothing half-done in the customer path, legacy data as it was
    let layout = host.config().layout;
    assert!(!layout.customer.data_dir.exists());
    assert_eq!(snapshot(&host.legacy_root()), legacy_before);

    assert_eq!(host.services.get("postgres", LISTEN_ADDRESSES).unwrap(), "*");
    assert!(host.services.is_running("postgres"));
    assert!(!host.services.is_running("postgres_server"));
}

#[tokio::test]
async fn old_cluster_in_customer_path_is_moved_aside() {
    let host = Host::new();
    let layout = host.config().layout;
    make_data_dir(&layout.customer.data_dir, "9.1", &["postgres", "caldav"]);
    host.services.mark_running("postgres");

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::InPlaceUpgrade));
    assert_eq!(marker(&layout.customer.data_dir), "9.2\n");
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres"]));

    let aside = moved_aside(&layout.customer.root, "data");
    assert_eq!(aside.len(), 1);
    assert_eq!(outcome.legacy_directory.as_ref(), Some(&aside[0]));
    assert_eq!(marker(&aside[0]), "9.1\n");
    assert!(read_catalog(&aside[0]).contains("caldav"));

    // no listen addresses were configured before
    assert_eq!(
        host.services.get("postgres", LISTEN_ADDRESSES).unwrap(),
        "127.0.0.1,::1"
    );
}

#[tokio::test]
async fn current_version_legacy_is_relocated_without_upgrade() {
    let host = Host::new();
    make_data_dir(&host.legacy_root(), "9.2", &["postgres", "collab"]);

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::Relocation));
    assert!(host.runner.upgrades().is_empty());
    let layout = host.config().layout;
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres"]));
    assert!(read_catalog(&layout.server_services.data_dir).contains("collab"));
    assert!(read_catalog(&host.legacy_root()).contains("collab"));
}

#[tokio::test]
async fn empty_host_gets_fresh_clusters() {
    let host = Host::new();

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::CleanInstall));
    assert!(host.runner.upgrades().is_empty());
    assert_eq!(outcome.data_directories.len(), 2);

    let layout = host.config().layout;
    assert_eq!(marker(&layout.customer.data_dir), "9.2\n");
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres"]));
    assert_eq!(
        read_catalog(&layout.server_services.data_dir),
        set(&["postgres", "caldav", "collab", "device_management"])
    );
    assert!(layout.customer.socket_dir.is_dir());
    assert!(layout.server_services.log_dir.is_dir());
    assert_eq!(
        host.services.get("postgres", LISTEN_ADDRESSES).unwrap(),
        "127.0.0.1,::1"
    );
    assert!(host.services.is_running("postgres"));
    assert!(host.services.is_running("postgres_server"));

    let again = host.orchestrator().run().await;
    assert_eq!(again.final_state, FinalState::AlreadyDone, "{again}");
}

#[tokio::test]
async fn unmarked_server_directory_is_set_aside_and_forked_again() {
    let host = Host::new();
    let layout = host.config().layout;
    make_data_dir(&layout.customer.data_dir, "9.2", &["postgres", "caldav"]);
    fs::create_dir_all(&layout.server_services.data_dir).unwrap();
    fs::write(layout.server_services.data_dir.join("junk"), "half a cluster").unwrap();
    host.services.mark_running("postgres");

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::RepairPriorFailure));
    let aside = moved_aside(&layout.server_services.root, "data");
    assert_eq!(aside.len(), 1);
    assert!(aside[0].join("junk").exists());
    assert!(read_catalog(&layout.server_services.data_dir).contains("caldav"));
    assert!(!read_catalog(&layout.customer.data_dir).contains("caldav"));
}

#[tokio::test]
async fn interrupted_fork_is_resumed() {
    let host = Host::new();
    let layout = host.config().layout;
    make_data_dir(
        &layout.customer.data_dir,
        "9.2",
        &["postgres", "caldav", "collab"],
    );
    // caldav made it halfway, and no stamp was written
    make_data_dir(&layout.server_services.data_dir, "9.2", &["postgres", "caldav"]);
    fs::write(layout.server_services.data_dir.join("keep"), "").unwrap();
    host.services.mark_running("postgres");

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::RepairPriorFailure));
    assert!(layout.server_services.data_dir.join("keep").exists());
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres"]));
    assert_eq!(
        read_catalog(&layout.server_services.data_dir),
        set(&["postgres", "caldav", "collab", "device_management"])
    );
    let stamp = ForkStamp::load(&layout.fork_stamp()).unwrap();
    assert_eq!(stamp.moved, set(&["caldav", "collab"]));
    assert_eq!(stamp.created, set(&["device_management"]));
}

#[tokio::test]
async fn failed_copy_is_a_warning_and_keeps_the_database() {
    let host = legacy_host();
    host.tools
        .failing_dumps
        .lock()
        .unwrap()
        .insert("caldav".to_string());

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.warnings(), 2, "{outcome}");
    assert!(outcome.to_string().starts_with("success with 2 warnings\n"));
    let layout = host.config().layout;
    assert!(read_catalog(&layout.customer.data_dir).contains("caldav"));
}

#[tokio::test]
async fn unreachable_customer_fails_an_otherwise_finished_run() {
    let host = Host::new();
    let first = host.orchestrator().run().await;
    assert_eq!(first.final_state, FinalState::Success, "{first}");

    host.services
        .unresponsive
        .lock()
        .unwrap()
        .insert("postgres".to_string());
    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Failed);
    assert_eq!(outcome.branch, Some(Branch::AlreadyDone));
    assert!(matches!(
        outcome.error,
        Some(Error::HealthCheckTimeout {
            role: ClusterRole::Customer,
            ..
        })
    ));
}

#[tokio::test]
async fn customer_process_comes_back_listening_as_before() {
    let host = legacy_host();

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    // the fork shut the customer off the network while it ran
    assert!(host.services.called("stop postgres"));
    assert_eq!(host.services.live_listen("postgres").as_deref(), Some("*"));
    assert!(host.services.is_running("postgres"));
}

#[tokio::test]
async fn legacy_on_another_volume_is_upgraded_where_it_lies() {
    let host = legacy_host();
    *host.volumes.other_volume.lock().unwrap() = Some(host.legacy_root());
    let config = host.config();
    let legacy = DataDirectory::new(host.legacy_root(), None, None);
    let size = legacy.size_bytes().await.unwrap();
    // room for one copy, not for two
    host.volumes.free.store(
        config.safety_margin.as_u64() + size + size / 2,
        Ordering::SeqCst,
    );

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::AlternateVolumeUpgrade));
    let upgrades = host.runner.upgrades();
    assert_eq!(upgrades.len(), 1);
    assert_eq!(
        upgrades[0].flag_value("-d").unwrap(),
        host.legacy_root().as_os_str()
    );
    assert!(!config.layout.working_copy_dir().exists());
    assert_eq!(marker(&config.layout.customer.data_dir), "9.2\n");
    assert_eq!(
        read_catalog(&config.layout.customer.data_dir),
        set(&["postgres", "shop"])
    );
    assert!(read_catalog(&config.layout.server_services.data_dir).contains("caldav"));
    assert_eq!(marker(&host.legacy_root()), "9.1\n");
}

#[tokio::test]
async fn customer_is_restored_when_the_fork_times_out() {
    let host = legacy_host();
    host.services
        .unresponsive
        .lock()
        .unwrap()
        .insert("postgres_server".to_string());

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Failed);
    assert!(
        matches!(
            outcome.error,
            Some(Error::HealthCheckTimeout {
                role: ClusterRole::ServerServices,
                ..
            })
        ),
        "{outcome}"
    );
    assert_eq!(outcome.phase_reached, Phase::Upgraded);
    assert!(!host.config().layout.fork_stamp().exists());

    assert_eq!(host.services.get("postgres", LISTEN_ADDRESSES).unwrap(), "*");
    assert_eq!(host.services.live_listen("postgres").as_deref(), Some("*"));
    assert!(host.services.is_running("postgres"));
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.severity == Severity::Error && d.message.starts_with("server services")));
}

#[tokio::test]
async fn upgrade_interrupted_after_moving_customer_aside_is_picked_up() {
    let host = Host::new();
    let layout = host.config().layout;
    let aside = layout.customer.root.join("data.2026-10-19_10-00-00");
    make_data_dir(&aside, "9.1", &["postgres", "caldav", "shop"]);

    let outcome = host.orchestrator().run().await;

    assert_eq!(outcome.final_state, FinalState::Success, "{outcome}");
    assert_eq!(outcome.branch, Some(Branch::InPlaceUpgrade));
    assert_eq!(outcome.legacy_directory.as_ref(), Some(&aside));
    assert_eq!(marker(&layout.customer.data_dir), "9.2\n");
    assert_eq!(read_catalog(&layout.customer.data_dir), set(&["postgres", "shop"]));
    assert!(read_catalog(&layout.server_services.data_dir).contains("caldav"));
    assert!(read_catalog(&aside).contains("caldav"));
}
