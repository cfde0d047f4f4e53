mod common;

use assert_matches::assert_matches;

use kira_provisioner::domain::Version;
use kira_provisioner::error::KiraError;
use kira_provisioner::installer::{InstallDispatcher, InstallOutcome, InstallRequest, ProbeHit};
use kira_provisioner::store::{DefaultSwitch, InstallStore};

use common::{MockExecutor, MockRetriever, catalog, tarball, workspace};

const SAMTOOLS: &str = r#"{
    "resources": [{
        "name": "samtools",
        "category": "bio_nextgen",
        "versions": ["1.9", "1.17"],
        "acquisition": [
            "s3://biodata/tools/samtools-{version}.tar.gz",
            "https://github.com/samtools/samtools/releases/samtools-{version}.tar.gz"
        ],
        "probe": {"name": "samtools", "version_args": ["--version"], "version_pattern": "samtools (\\S+)"}
    }]
}"#;

const GITHUB_1_17: &str = "https://github.com/samtools/samtools/releases/samtools-1.17.tar.gz";

#[test]
fn second_ensure_installed_is_a_no_op() {
    let (_temp, config) = workspace();
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new().serve(
        GITHUB_1_17,
        tarball(&[("samtools-1.17/bin/samtools", "#!/bin/sh\n")]),
    );
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let first = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(first, InstallOutcome::Installed { ref version, ref source, default: DefaultSwitch::Created { .. }, .. } => {
        assert_eq!(version, "1.17");
        assert_eq!(source, GITHUB_1_17);
    });
    let version_dir = config.install_root.join("bio_nextgen/samtools/1.17");
    assert!(version_dir.join("bin/samtools").as_std_path().is_file());
    // The object store mirror is tried first and misses.
    assert_eq!(retriever.calls().len(), 2);

    let second = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(second, InstallOutcome::Present { hit: ProbeHit::Layout { .. }, .. });
    assert_eq!(retriever.calls().len(), 2);
}

#[test]
fn binary_probe_hit_skips_network() {
    let (_temp, config) = workspace();
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&["samtools"]).reporting("samtools 1.18\nUsing htslib 1.18\n");
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let outcome = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(outcome, InstallOutcome::Present { version, hit: ProbeHit::Binary { reported, .. } } => {
        assert_eq!(version, "1.18");
        assert_eq!(reported.as_deref(), Some("1.18"));
    });
    assert!(retriever.calls().is_empty());
    assert_eq!(executor.calls(), vec!["samtools --version".to_string()]);
}

#[test]
fn older_host_binary_does_not_count_as_present() {
    let (_temp, config) = workspace();
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new().serve(
        GITHUB_1_17,
        tarball(&[("samtools-1.17/bin/samtools", "#!/bin/sh\n")]),
    );
    let executor = MockExecutor::with_tools(&["samtools"]).reporting("samtools 1.9\n");
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let outcome = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(outcome, InstallOutcome::Installed { .. });
}

#[test]
fn upgrade_switches_default_and_removes_stale_version() {
    let (_temp, config) = workspace();
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new()
        .serve(
            "https://github.com/samtools/samtools/releases/samtools-1.9.tar.gz",
            tarball(&[("samtools-1.9/bin/samtools", "old")]),
        )
        .serve(GITHUB_1_17, tarball(&[("samtools-1.17/bin/samtools", "new")]));
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let old = "1.9".parse().unwrap();
    dispatcher.ensure_installed(resource, Some(&old)).unwrap();
    assert_eq!(
        store.current_default("bio_nextgen", "samtools").unwrap(),
        Some(old.clone())
    );

    let outcome = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(outcome, InstallOutcome::Installed { default: DefaultSwitch::Switched { from, to }, removed, .. } => {
        assert_eq!(from, "1.9");
        assert_eq!(to, "1.17");
        assert_eq!(removed, vec!["1.9".to_string()]);
    });
    assert_eq!(
        store.installed_versions("bio_nextgen", "samtools").unwrap(),
        vec!["1.17".parse::<Version>().unwrap()]
    );
}

#[test]
fn optional_resource_without_sources_is_unavailable() {
    let (_temp, config) = workspace();
    let catalog = catalog(
        r#"{
            "resources": [{
                "name": "gatk-framework",
                "versions": ["3.8"],
                "mandatory": false,
                "acquisition": ["https://downloads.example.org/gatk-{version}.tar.gz"]
            }]
        }"#,
    );
    let resource = catalog.resource("gatk-framework").unwrap();
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let outcome = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(outcome, InstallOutcome::Unavailable { version } if version == "3.8");
    assert!(store.installed_versions("bio_nextgen", "gatk-framework").unwrap().is_empty());
}

#[test]
fn batch_continues_past_failures_and_keeps_first_mandatory_error() {
    let (_temp, config) = workspace();
    let catalog = catalog(
        r#"{
            "resources": [
                {"name": "bwa", "versions": ["0.7.17"],
                 "acquisition": ["https://example.org/bwa-{version}.tar.gz"]},
                {"name": "vep-cache", "versions": ["110"], "mandatory": false,
                 "acquisition": ["https://example.org/vep-{version}.tar.gz"]},
                {"name": "seqtk", "versions": ["1.4"],
                 "acquisition": ["https://example.org/seqtk-{version}.tar.gz"]},
                {"name": "star", "versions": ["2.7.10"],
                 "acquisition": ["https://example.org/star-{version}.tar.gz"]}
            ]
        }"#,
    );
    let retriever = MockRetriever::new().serve(
        "https://example.org/seqtk-1.4.tar.gz",
        tarball(&[("seqtk-1.4/seqtk", "bin")]),
    );
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let requests = catalog
        .resources
        .iter()
        .map(|resource| InstallRequest {
            resource,
            version: None,
        })
        .collect::<Vec<_>>();
    let mut seen = Vec::new();
    let report = dispatcher.install_batch(&requests, |item| seen.push(item.resource.clone()));

    assert_eq!(seen, vec!["bwa", "vep-cache", "seqtk", "star"]);
    assert_eq!(report.failed(), 2);
    assert!(report.items[0].error.is_some());
    assert_matches!(report.items[1].outcome, Some(InstallOutcome::Unavailable { .. }));
    assert_matches!(report.items[2].outcome, Some(InstallOutcome::Installed { .. }));
    assert_matches!(
        report.first_mandatory_failure(),
        Some(KiraError::Exhausted { resource, .. }) if resource == "bwa"
    );
}

#[test]
fn dry_run_plans_without_fetching() {
    let (_temp, mut config) = workspace();
    config.dry_run = true;
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let outcome = dispatcher.ensure_installed(resource, None).unwrap();
    assert_matches!(outcome, InstallOutcome::Planned { attempts, .. } => {
        assert_eq!(attempts, vec![
            "object_store s3://biodata/tools/samtools-1.17.tar.gz".to_string(),
            format!("http {GITHUB_1_17}"),
        ]);
    });
    assert!(retriever.calls().is_empty());
    assert!(!config.install_root.as_std_path().exists());
}

#[test]
fn unknown_pinned_version_is_rejected() {
    let (_temp, config) = workspace();
    let catalog = catalog(SAMTOOLS);
    let resource = catalog.resource("samtools").unwrap();
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&[]);
    let store = InstallStore::new(config.install_root.clone());
    let dispatcher = InstallDispatcher::new(&config, &store, &retriever, &executor);

    let err = dispatcher
        .ensure_installed(resource, Some(&"2.0".parse().unwrap()))
        .unwrap_err();
    assert_matches!(err, KiraError::UnknownVersion { .. });
}
