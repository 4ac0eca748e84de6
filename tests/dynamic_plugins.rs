//! Plugins loaded from shared libraries on disk
//!
//! The fixture libraries live in `test-plugins/` and are built on first use
//! with the same toolchain and profile as this test binary.

mod common;

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use common::{Named, start_server_in, test_config};
use portico::plugins::{PLUGIN_ENTRY_SYMBOL, PLUGIN_SUFFIX, load_plugin};
use portico::proto::plugins::GetConfiguredPluginsRequest;
use portico::proto::plugins::plugins_service_client::PluginsServiceClient;
use portico::{Error, ServerBuilder};

const HELLO: &str = "portico_test_hello";
const NO_ENTRY: &str = "portico_test_no_entry";

/// Build the fixture libraries once and return the directory holding them
fn fixture_dir() -> &'static Path {
    static DIR: OnceLock<PathBuf> = OnceLock::new();

    DIR.get_or_init(|| {
        let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
        let status = Command::new(env!("CARGO"))
            .current_dir(manifest_dir)
            .args([
                "build",
                "--quiet",
                "-p",
                "portico-test-hello",
                "-p",
                "portico-test-no-entry",
            ])
            .status()
            .expect("failed to run cargo");
        assert!(status.success(), "building test plugins failed");

        let target_dir = std::env::var_os("CARGO_TARGET_DIR")
            .map_or_else(|| manifest_dir.join("target"), |dir| manifest_dir.join(dir));
        target_dir.join("debug")
    })
}

/// Copy a fixture library into `dir` under its platform file name
fn install_fixture(name: &str, dir: &Path) -> PathBuf {
    let file_name = format!("{}{name}{PLUGIN_SUFFIX}", std::env::consts::DLL_PREFIX);
    let dest = dir.join(&file_name);
    std::fs::copy(fixture_dir().join(&file_name), &dest).expect("failed to copy fixture");
    dest
}

#[test]
fn loads_exported_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let path = install_fixture(HELLO, dir.path());

    let loaded = load_plugin(&path).unwrap();

    assert_eq!(loaded.path(), path.as_path());
    assert_eq!(loaded.plugin().descriptor().to_string(), "hello.packages/v1alpha1");
}

#[test]
fn library_without_entry_point_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = install_fixture(NO_ENTRY, dir.path());

    match load_plugin(&path) {
        Err(Error::MissingEntryPoint {
            path: reported,
            symbol,
            ..
        }) => {
            assert_eq!(reported, path);
            assert_eq!(symbol, PLUGIN_ENTRY_SYMBOL);
        }
        other => panic!("expected missing entry point, got {other:?}"),
    }
}

#[tokio::test]
async fn discovered_plugin_serves_its_route() {
    let dir = tempfile::tempdir().unwrap();
    install_fixture(HELLO, dir.path());

    let server = start_server_in(dir, vec![Named::boxed("fluxv2.packages", "v1alpha1")]).await;

    let mut client = PluginsServiceClient::new(server.channel().await);
    let plugins: Vec<String> = client
        .get_configured_plugins(GetConfiguredPluginsRequest {})
        .await
        .unwrap()
        .into_inner()
        .plugins
        .into_iter()
        .map(|p| format!("{}/{}", p.name, p.version))
        .collect();
    assert_eq!(plugins, vec!["fluxv2.packages/v1alpha1", "hello.packages/v1alpha1"]);

    let response = reqwest::get(server.url("/hello/v1alpha1/greeting"))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "hello");

    server.shutdown().await;
}

#[tokio::test]
async fn discovered_library_without_entry_point_aborts_startup() {
    let dir = tempfile::tempdir().unwrap();
    install_fixture(HELLO, dir.path());
    // Sorts after the hello fixture, so the good plugin activates first
    let bad = install_fixture(NO_ENTRY, dir.path());

    let result = ServerBuilder::new(test_config(&dir)).activate();

    match result {
        Err(Error::MissingEntryPoint { path, .. }) => assert_eq!(path, bad),
        other => panic!("expected missing entry point, got {other:?}"),
    }
}
