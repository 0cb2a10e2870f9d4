#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Manifest policy tests.
//!
//! These tests parse `Cargo.toml` and verify it still declares the lints and
//! feature layout the crate relies on. If any test fails, the manifest has
//! drifted from the agreed-upon standards.

use std::path::PathBuf;

/// Returns the project root directory (where Cargo.toml lives).
fn project_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

fn manifest() -> toml::Table {
    let path = project_root().join("Cargo.toml");
    let contents = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read '{}': {e}", path.display()));
    contents
        .parse::<toml::Table>()
        .unwrap_or_else(|e| panic!("Cargo.toml is not valid TOML: {e}"))
}

fn table<'a>(parent: &'a toml::Table, key: &str) -> &'a toml::Table {
    parent
        .get(key)
        .and_then(toml::Value::as_table)
        .unwrap_or_else(|| panic!("Cargo.toml is missing the [{key}] table"))
}

mod panic_policy {
    use super::*;

    const REQUIRED_DENY_LINTS: &[&str] = &[
        "unwrap_used",
        "expect_used",
        "panic",
        "todo",
        "unimplemented",
        "indexing_slicing",
    ];

    #[test]
    fn cargo_toml_has_all_panic_free_lints() {
        let manifest = manifest();
        let clippy = table(table(&manifest, "lints"), "clippy");

        for lint in REQUIRED_DENY_LINTS {
            assert_eq!(
                clippy.get(*lint).and_then(toml::Value::as_str),
                Some("deny"),
                "[lints.clippy] must set `{lint} = \"deny\"` to keep library code panic-free."
            );
        }
    }
}

mod feature_policy {
    use super::*;

    #[test]
    fn websocket_store_is_a_default_feature() {
        let manifest = manifest();
        let features = table(&manifest, "features");
        let default = features["default"].as_array().unwrap();
        assert!(default.iter().any(|f| f.as_str() == Some("store-websocket")));
    }

    #[test]
    fn websocket_dependencies_are_optional() {
        let manifest = manifest();
        let deps = table(&manifest, "dependencies");
        for name in ["tokio-tungstenite", "futures-util"] {
            let optional = deps[name]
                .as_table()
                .and_then(|dep| dep.get("optional"))
                .and_then(toml::Value::as_bool);
            assert_eq!(
                optional,
                Some(true),
                "`{name}` must stay optional behind the store-websocket feature"
            );
        }
    }

    #[test]
    fn tokio_test_util_is_dev_only() {
        let manifest = manifest();
        let deps = table(&manifest, "dependencies");
        let features = deps["tokio"]["features"].as_array().unwrap();
        assert!(!features.iter().any(|f| f.as_str() == Some("test-util")));
        assert!(!features.iter().any(|f| f.as_str() == Some("full")));
    }
}

mod package_policy {
    use super::*;

    #[test]
    fn package_declares_msrv_and_readme() {
        let manifest = manifest();
        let package = table(&manifest, "package");
        assert!(package.get("rust-version").is_some());
        let readme = package["readme"].as_str().unwrap();
        assert!(
            project_root().join(readme).is_file(),
            "readme '{readme}' declared in Cargo.toml does not exist"
        );
    }

    #[test]
    fn demos_declared_in_manifest_exist() {
        let manifest = manifest();
        let examples = manifest["example"].as_array().unwrap();
        for example in examples {
            let path = example["path"].as_str().unwrap();
            assert!(
                project_root().join(path).is_file(),
                "demo '{path}' declared in Cargo.toml does not exist"
            );
        }
    }
}
