mod common;

use std::fs;

use assert_matches::assert_matches;

use kira_provisioner::domain::{IndexKind, IndexStatus};
use kira_provisioner::genome::bundles::BundleKind;
use kira_provisioner::genome::{BundleStatus, GenomePipeline, GenomeState};

use common::{MockExecutor, MockRetriever, catalog, gzip, tarball, tarball_bytes, workspace};

const RELEASE_URL: &str = "https://ftp.example.org/release/hg38-mini.fa.gz";

fn release_catalog(indexes: &str, bundles: &str, flags: &str) -> String {
    format!(
        r#"{{
            "genomes": [{{
                "organism": "Hsapiens",
                "id": "hg38-mini",
                "source": {{"kind": "release", "urls": ["https://ftp.example.org/release/{{genome}}.fa.gz"]}},
                "indexes": {indexes}
                {flags}
            }}],
            "bundles": {bundles}
        }}"#
    )
}

fn reference() -> Vec<u8> {
    gzip(b">chr2\nAAAACCCC\nGGGG\n>chrM\nTTTT\n>chr1\nacgtACGT\nACGT\n")
}

#[test]
fn release_genome_is_normalized_and_indexed() {
    let (_temp, config) = workspace();
    let catalog = catalog(&release_catalog(r#"["bwa"]"#, "null", ""));
    let retriever = MockRetriever::new().serve(RELEASE_URL, reference());
    let executor = MockExecutor::with_tools(&["bwa"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg38-mini").unwrap();
    let report = pipeline.prepare(genome, &catalog.genomes).unwrap();

    assert_eq!(report.state, GenomeState::Indexed);
    assert_eq!(report.fetched_from.as_deref(), Some(RELEASE_URL));
    assert!(report.partial.is_none());

    let genome_dir = config.data_root.join("genomes/Hsapiens/hg38-mini");
    let fasta = genome_dir.join("seq/hg38-mini.fa");
    assert_eq!(
        fs::read_to_string(fasta.as_std_path()).unwrap(),
        ">chr1\nacgtACGT\nACGT\n>chr2\nAAAACCCC\nGGGG\n>chrM\nTTTT\n"
    );
    let fai = fs::read_to_string(genome_dir.join("seq/hg38-mini.fa.fai").as_std_path()).unwrap();
    assert_eq!(fai.lines().next(), Some("chr1\t12\t6\t8\t9"));
    assert!(genome_dir.join("bwa/hg38-mini.fa.bwt").as_std_path().is_file());

    let leftovers = fs::read_dir(genome_dir.join("seq").as_std_path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.ends_with(".gz") || name.ends_with(".zip")
        })
        .count();
    assert_eq!(leftovers, 0);

    let kinds = report.indexes.iter().map(|job| job.kind).collect::<Vec<_>>();
    assert_eq!(kinds, vec![IndexKind::Seq, IndexKind::Bwa]);
    assert!(report.indexes.iter().all(|job| matches!(job.status, IndexStatus::Built { .. })));
}

#[test]
fn mirror_archive_is_flattened_in_karyotype_order() {
    let (_temp, config) = workspace();
    let catalog = catalog(
        r#"{
            "genomes": [{
                "organism": "Hsapiens",
                "id": "hg-mirror",
                "indexes": [],
                "source": {"kind": "mirror", "urls": ["https://mirror.example.org/{genome}/chroms.tar.gz"]}
            }]
        }"#,
    );
    let archive = tarball_bytes(&[
        ("chroms/chr10.fa", b">chr10\nGGGG\n".to_vec()),
        ("chroms/chr2.fa", b">chr2\nAAAA\nCC\n".to_vec()),
        ("chroms/chrX.fa", b">chrX\nTTTT\n".to_vec()),
        ("chroms/chrUn_x.fa.gz", gzip(b">chrUn_x\nNNNN\n")),
    ]);
    let retriever =
        MockRetriever::new().serve("https://mirror.example.org/hg-mirror/chroms.tar.gz", archive);
    let executor = MockExecutor::with_tools(&[]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg-mirror").unwrap();
    let report = pipeline.prepare(genome, &catalog.genomes).unwrap();
    assert_eq!(report.state, GenomeState::Indexed);

    let seq = config.data_root.join("genomes/Hsapiens/hg-mirror/seq");
    let fasta = fs::read_to_string(seq.join("hg-mirror.fa").as_std_path()).unwrap();
    let headers = fasta
        .lines()
        .filter(|line| line.starts_with('>'))
        .collect::<Vec<_>>();
    assert_eq!(headers, vec![">chr2", ">chr10", ">chrX", ">chrUn_x"]);
    assert_eq!(
        fasta,
        ">chr2\nAAAA\nCC\n>chr10\nGGGG\n>chrX\nTTTT\n>chrUn_x\nNNNN\n"
    );

    let fai = fs::read_to_string(seq.join("hg-mirror.fa.fai").as_std_path()).unwrap();
    assert_eq!(
        fai.lines().collect::<Vec<_>>(),
        vec![
            "chr2\t6\t6\t4\t5",
            "chr10\t4\t21\t4\t5",
            "chrX\t4\t32\t4\t5",
            "chrUn_x\t4\t46\t4\t5",
        ]
    );
}

#[test]
fn second_prepare_reuses_reference_and_indexes() {
    let (_temp, config) = workspace();
    let catalog = catalog(&release_catalog(r#"["bwa"]"#, "null", ""));
    let retriever = MockRetriever::new().serve(RELEASE_URL, reference());
    let executor = MockExecutor::with_tools(&["bwa"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);
    let genome = catalog.genome("hg38-mini").unwrap();

    pipeline.prepare(genome, &catalog.genomes).unwrap();
    let again = pipeline.prepare(genome, &catalog.genomes).unwrap();

    assert_eq!(retriever.calls().len(), 1);
    assert_eq!(executor.calls().len(), 1);
    assert!(again.fetched_from.is_none());
    assert!(again.indexes.iter().all(|job| matches!(job.status, IndexStatus::Present { .. })));
}

#[test]
fn star_without_annotation_is_skipped_and_reported_partial() {
    let (_temp, config) = workspace();
    let catalog = catalog(&release_catalog(r#"["bwa", "star"]"#, "null", ""));
    let retriever = MockRetriever::new().serve(RELEASE_URL, reference());
    let executor = MockExecutor::with_tools(&["bwa", "STAR"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg38-mini").unwrap();
    let report = pipeline.prepare(genome, &catalog.genomes).unwrap();

    assert_matches!(report.indexes[1].status, IndexStatus::Built { .. });
    assert_matches!(report.indexes[2].status, IndexStatus::Skipped { ref reason } => {
        assert!(reason.contains("ref-transcripts.gtf"));
    });
    assert_matches!(report.partial, Some(ref partial) => {
        assert!(partial.contains("star"));
        assert!(!partial.contains("bwa"));
    });
    assert!(!executor.calls().iter().any(|call| call.starts_with("STAR")));
}

#[test]
fn organism_override_replaces_generic_bundle_source() {
    let (_temp, config) = workspace();
    let bundles = r#"{
        "base": "https://generic.example.org/{genome}/{bundle}.tar.gz",
        "overrides": {"Hsapiens": "https://hsapiens.example.org/{genome}/{bundle}.tar.gz"}
    }"#;
    let catalog = catalog(&release_catalog(
        r#"["star"]"#,
        bundles,
        r#", "rnaseq": true, "dbsnp": true"#,
    ));
    let retriever = MockRetriever::new()
        .serve(RELEASE_URL, reference())
        .serve(
            "https://hsapiens.example.org/hg38-mini/rnaseq.tar.gz",
            tarball(&[("ref-transcripts.gtf", "chr1\tsrc\texon\t1\t4\t.\t+\t.\tgene_id \"g\";\n")]),
        );
    let executor = MockExecutor::with_tools(&["STAR"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg38-mini").unwrap();
    let report = pipeline.prepare(genome, &catalog.genomes).unwrap();

    assert!(
        !retriever
            .calls()
            .iter()
            .any(|url| url.starts_with("https://generic.example.org"))
    );
    let dbsnp = report.bundles.iter().find(|b| b.kind == BundleKind::Dbsnp).unwrap();
    assert_matches!(dbsnp.status, BundleStatus::Unavailable);
    let rnaseq = report.bundles.iter().find(|b| b.kind == BundleKind::Rnaseq).unwrap();
    assert_matches!(rnaseq.status, BundleStatus::Fetched { .. });

    let genome_dir = config.data_root.join("genomes/Hsapiens/hg38-mini");
    assert!(genome_dir.join("rnaseq/ref-transcripts.gtf").as_std_path().is_file());
    assert!(genome_dir.join("star/SA").as_std_path().is_file());
    assert!(report.partial.is_none());
}

#[test]
fn masked_genome_is_derived_from_its_base() {
    let (_temp, config) = workspace();
    let catalog = catalog(
        r#"{
            "genomes": [
                {"organism": "Hsapiens", "id": "hg38-mini", "indexes": [],
                 "source": {"kind": "release", "urls": ["https://ftp.example.org/release/{genome}.fa.gz"]}},
                {"organism": "Hsapiens", "id": "hg38-mini-masked", "indexes": [],
                 "source": {"kind": "masked", "base": "hg38-mini"}}
            ]
        }"#,
    );
    let retriever = MockRetriever::new().serve(RELEASE_URL, reference());
    let executor = MockExecutor::with_tools(&[]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let masked = catalog.genome("hg38-mini-masked").unwrap();
    let report = pipeline.prepare(masked, &catalog.genomes).unwrap();
    assert_eq!(report.state, GenomeState::Indexed);

    let genomes = config.data_root.join("genomes/Hsapiens");
    assert!(genomes.join("hg38-mini/seq/hg38-mini.fa").as_std_path().is_file());
    assert_eq!(
        fs::read_to_string(
            genomes
                .join("hg38-mini-masked/seq/hg38-mini-masked.fa")
                .as_std_path()
        )
        .unwrap(),
        ">chr1\nNNNNACGT\nACGT\n>chr2\nAAAACCCC\nGGGG\n>chrM\nTTTT\n"
    );
}

#[test]
fn dry_run_lists_steps_without_touching_disk() {
    let (_temp, mut config) = workspace();
    config.dry_run = true;
    let catalog = catalog(&release_catalog(r#"["bwa"]"#, "null", ""));
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&["bwa"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg38-mini").unwrap();
    let report = pipeline.prepare(genome, &catalog.genomes).unwrap();

    assert_eq!(report.state, GenomeState::NotDownloaded);
    assert_eq!(
        report.planned,
        vec![
            format!("http {RELEASE_URL}"),
            "index seq".to_string(),
            "index bwa".to_string(),
        ]
    );
    assert!(retriever.calls().is_empty());
    assert!(!config.data_root.as_std_path().exists());
}

#[test]
fn exhausted_sources_fail_the_genome() {
    let (_temp, config) = workspace();
    let catalog = catalog(&release_catalog(r#"["bwa"]"#, "null", ""));
    let retriever = MockRetriever::new();
    let executor = MockExecutor::with_tools(&["bwa"]);
    let pipeline = GenomePipeline::new(&config, &retriever, &executor, &catalog.bundles);

    let genome = catalog.genome("hg38-mini").unwrap();
    let err = pipeline.prepare(genome, &catalog.genomes).unwrap_err();
    assert_matches!(err, kira_provisioner::error::KiraError::Exhausted { .. });
}
