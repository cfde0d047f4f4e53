use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::command::{CommandSpec, ExecutionContext, Executor};
use crate::domain::{IndexJob, IndexKind, IndexStatus};
use crate::error::KiraError;
use crate::genome::fasta;

/// Everything an indexer needs to know about the genome it works on.
#[derive(Debug, Clone)]
pub struct IndexContext<'a> {
    pub genome_id: &'a str,
    pub genome_dir: &'a Utf8Path,
    pub fasta: &'a Utf8Path,
    pub threads: usize,
}

impl IndexContext<'_> {
    pub fn kind_dir(&self, kind: IndexKind) -> Utf8PathBuf {
        self.genome_dir.join(kind.as_str())
    }

    pub fn seq_dir(&self) -> Utf8PathBuf {
        self.genome_dir.join("seq")
    }

    pub fn transcripts(&self) -> Utf8PathBuf {
        self.genome_dir.join("rnaseq").join("ref-transcripts.gtf")
    }
}

pub trait Indexer: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Host tools that must be on `PATH`; a missing one skips the kind.
    fn tools(&self) -> &'static [&'static str];

    /// Directory commands run in and outputs land in.
    fn output_dir(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        ctx.kind_dir(self.kind())
    }

    /// File whose presence means the index is complete.
    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf;

    /// Reason to skip when an input beyond the reference is missing.
    fn missing_prerequisite(&self, _ctx: &IndexContext<'_>) -> Option<String> {
        None
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError>;

    /// Runs after the commands succeeded.
    fn after_build(
        &self,
        _ctx: &IndexContext<'_>,
        _exec_ctx: &ExecutionContext,
        _exec: &dyn Executor,
    ) -> Result<(), KiraError> {
        Ok(())
    }

    /// In-process build for kinds that need no external tool.
    fn build_native(&self, _ctx: &IndexContext<'_>) -> Result<bool, KiraError> {
        Ok(false)
    }
}

fn prefix(ctx: &IndexContext<'_>, kind: IndexKind) -> String {
    ctx.kind_dir(kind).join(ctx.genome_id).to_string()
}

struct SeqIndex;

impl Indexer for SeqIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Seq
    }

    fn tools(&self) -> &'static [&'static str] {
        &[]
    }

    fn output_dir(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        ctx.seq_dir()
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.fai", ctx.fasta))
    }

    fn commands(&self, _ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(Vec::new())
    }

    fn build_native(&self, ctx: &IndexContext<'_>) -> Result<bool, KiraError> {
        fasta::write_fai(ctx.fasta.as_std_path(), self.sentinel(ctx).as_std_path())?;
        Ok(true)
    }
}

struct DictIndex;

impl Indexer for DictIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Dict
    }

    fn tools(&self) -> &'static [&'static str] {
        &["samtools"]
    }

    fn output_dir(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        ctx.seq_dir()
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        ctx.seq_dir().join(format!("{}.dict", ctx.genome_id))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "samtools",
            [
                "dict".to_string(),
                "-o".to_string(),
                self.sentinel(ctx).to_string(),
                ctx.fasta.to_string(),
            ],
        )?])
    }
}

struct BwaIndex;

impl Indexer for BwaIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Bwa
    }

    fn tools(&self) -> &'static [&'static str] {
        &["bwa"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.fa.bwt", prefix(ctx, IndexKind::Bwa)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "bwa",
            [
                "index".to_string(),
                "-a".to_string(),
                "bwtsw".to_string(),
                "-p".to_string(),
                format!("{}.fa", prefix(ctx, IndexKind::Bwa)),
                ctx.fasta.to_string(),
            ],
        )?])
    }
}

struct BowtieIndex;

impl Indexer for BowtieIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Bowtie
    }

    fn tools(&self) -> &'static [&'static str] {
        &["bowtie-build"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.1.ebwt", prefix(ctx, IndexKind::Bowtie)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "bowtie-build",
            [ctx.fasta.to_string(), prefix(ctx, IndexKind::Bowtie)],
        )?])
    }
}

struct Bowtie2Index;

impl Indexer for Bowtie2Index {
    fn kind(&self) -> IndexKind {
        IndexKind::Bowtie2
    }

    fn tools(&self) -> &'static [&'static str] {
        &["bowtie2-build"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.1.bt2", prefix(ctx, IndexKind::Bowtie2)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "bowtie2-build",
            [
                "--threads".to_string(),
                ctx.threads.to_string(),
                ctx.fasta.to_string(),
                prefix(ctx, IndexKind::Bowtie2),
            ],
        )?])
    }

    /// Tools reading bowtie2 indexes look for `<prefix>.fa` beside them.
    fn after_build(
        &self,
        ctx: &IndexContext<'_>,
        _exec_ctx: &ExecutionContext,
        _exec: &dyn Executor,
    ) -> Result<(), KiraError> {
        let companion = Utf8PathBuf::from(format!("{}.fa", prefix(ctx, IndexKind::Bowtie2)));
        if companion.as_std_path().symlink_metadata().is_ok() {
            return Ok(());
        }
        let file_name = ctx
            .fasta
            .file_name()
            .ok_or_else(|| KiraError::Filesystem("reference has no file name".to_string()))?;
        let target = Utf8Path::new("..").join("seq").join(file_name);
        crate::installer::symlink(target.as_std_path(), companion.as_std_path())
    }
}

struct Hisat2Index;

impl Indexer for Hisat2Index {
    fn kind(&self) -> IndexKind {
        IndexKind::Hisat2
    }

    fn tools(&self) -> &'static [&'static str] {
        &["hisat2-build"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.1.ht2", prefix(ctx, IndexKind::Hisat2)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "hisat2-build",
            [
                "-p".to_string(),
                ctx.threads.to_string(),
                ctx.fasta.to_string(),
                prefix(ctx, IndexKind::Hisat2),
            ],
        )?])
    }
}

struct StarIndex;

impl Indexer for StarIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Star
    }

    fn tools(&self) -> &'static [&'static str] {
        &["STAR"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        ctx.kind_dir(IndexKind::Star).join("SA")
    }

    fn missing_prerequisite(&self, ctx: &IndexContext<'_>) -> Option<String> {
        let gtf = ctx.transcripts();
        if gtf.as_std_path().is_file() {
            None
        } else {
            Some(format!("missing transcript annotation {gtf}"))
        }
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "STAR",
            [
                "--runMode".to_string(),
                "genomeGenerate".to_string(),
                "--runThreadN".to_string(),
                ctx.threads.to_string(),
                "--genomeDir".to_string(),
                ctx.kind_dir(IndexKind::Star).to_string(),
                "--genomeFastaFiles".to_string(),
                ctx.fasta.to_string(),
                "--sjdbGTFfile".to_string(),
                ctx.transcripts().to_string(),
                "--sjdbOverhang".to_string(),
                "99".to_string(),
            ],
        )?])
    }
}

struct MosaikIndex;

impl Indexer for MosaikIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Mosaik
    }

    fn tools(&self) -> &'static [&'static str] {
        &["MosaikBuild", "MosaikJump"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}_jump_keys.jmp", prefix(ctx, IndexKind::Mosaik)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "MosaikBuild",
            [
                "-fr".to_string(),
                ctx.fasta.to_string(),
                "-oa".to_string(),
                format!("{}.dat", prefix(ctx, IndexKind::Mosaik)),
            ],
        )?])
    }

    /// Secondary jump database built from the reference archive.
    fn after_build(
        &self,
        ctx: &IndexContext<'_>,
        exec_ctx: &ExecutionContext,
        exec: &dyn Executor,
    ) -> Result<(), KiraError> {
        let base = prefix(ctx, IndexKind::Mosaik);
        let spec = CommandSpec::new(
            "MosaikJump",
            [
                "-ia".to_string(),
                format!("{base}.dat"),
                "-out".to_string(),
                format!("{base}_jump"),
                "-hs".to_string(),
                "15".to_string(),
            ],
        )?;
        exec_ctx.run_checked(exec, spec)?;
        Ok(())
    }
}

struct UcscIndex;

impl Indexer for UcscIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Ucsc
    }

    fn tools(&self) -> &'static [&'static str] {
        &["faToTwoBit"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.2bit", prefix(ctx, IndexKind::Ucsc)))
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "faToTwoBit",
            [ctx.fasta.to_string(), self.sentinel(ctx).to_string()],
        )?])
    }
}

struct RtgIndex;

impl Indexer for RtgIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Rtg
    }

    fn tools(&self) -> &'static [&'static str] {
        &["rtg"]
    }

    fn sentinel(&self, ctx: &IndexContext<'_>) -> Utf8PathBuf {
        Utf8PathBuf::from(format!("{}.sdf", prefix(ctx, IndexKind::Rtg))).join("mainIndex")
    }

    fn commands(&self, ctx: &IndexContext<'_>) -> Result<Vec<CommandSpec>, KiraError> {
        Ok(vec![CommandSpec::new(
            "rtg",
            [
                "format".to_string(),
                "-o".to_string(),
                format!("{}.sdf", prefix(ctx, IndexKind::Rtg)),
                ctx.fasta.to_string(),
            ],
        )?])
    }
}

/// Static table from index kind to its indexer.
pub fn indexer_for(kind: IndexKind) -> &'static dyn Indexer {
    match kind {
        IndexKind::Seq => &SeqIndex,
        IndexKind::Dict => &DictIndex,
        IndexKind::Bwa => &BwaIndex,
        IndexKind::Bowtie => &BowtieIndex,
        IndexKind::Bowtie2 => &Bowtie2Index,
        IndexKind::Hisat2 => &Hisat2Index,
        IndexKind::Star => &StarIndex,
        IndexKind::Mosaik => &MosaikIndex,
        IndexKind::Ucsc => &UcscIndex,
        IndexKind::Rtg => &RtgIndex,
    }
}

pub struct IndexerRegistry<'a> {
    executor: &'a dyn Executor,
    host: &'a str,
}

impl<'a> IndexerRegistry<'a> {
    pub fn new(executor: &'a dyn Executor, host: &'a str) -> Self {
        Self { executor, host }
    }

    /// Builds each requested kind. Failures and skips are recorded on the job
    /// and never stop the remaining kinds.
    pub fn build_all(&self, ctx: &IndexContext<'_>, kinds: &[IndexKind]) -> Vec<IndexJob> {
        let mut exec_ctx = ExecutionContext::new(self.host, ctx.genome_dir);
        kinds
            .iter()
            .map(|kind| {
                let status = match self.build(&mut exec_ctx, ctx, *kind) {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::warn!(genome = ctx.genome_id, kind = %kind, error = %err, "index failed");
                        IndexStatus::Failed {
                            message: err.to_string(),
                        }
                    }
                };
                IndexJob {
                    genome_id: ctx.genome_id.to_string(),
                    kind: *kind,
                    reference: ctx.fasta.to_path_buf(),
                    status,
                }
            })
            .collect()
    }

    fn build(
        &self,
        exec_ctx: &mut ExecutionContext,
        ctx: &IndexContext<'_>,
        kind: IndexKind,
    ) -> Result<IndexStatus, KiraError> {
        let indexer = indexer_for(kind);
        let sentinel = indexer.sentinel(ctx);
        if sentinel.as_std_path().exists() {
            return Ok(IndexStatus::Present {
                path: sentinel.to_string(),
            });
        }
        if let Some(reason) = indexer.missing_prerequisite(ctx) {
            tracing::info!(genome = ctx.genome_id, kind = %kind, reason = %reason, "skipping index");
            return Ok(IndexStatus::Skipped { reason });
        }
        if let Some(tool) = indexer
            .tools()
            .iter()
            .find(|tool| !self.executor.has_tool(tool))
        {
            tracing::debug!(genome = ctx.genome_id, kind = %kind, tool, "tool unavailable");
            return Ok(IndexStatus::Skipped {
                reason: format!("{tool} not installed"),
            });
        }

        let dir = indexer.output_dir(ctx);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        if !indexer.build_native(ctx)? {
            exec_ctx.change_dir(dir.clone());
            for spec in indexer.commands(ctx)? {
                exec_ctx.run_checked(self.executor, spec)?;
            }
            indexer.after_build(ctx, exec_ctx, self.executor)?;
        }

        if !sentinel.as_std_path().exists() {
            return Ok(IndexStatus::Failed {
                message: format!("expected output {sentinel} was not produced"),
            });
        }
        tracing::info!(genome = ctx.genome_id, kind = %kind, "index built");
        Ok(IndexStatus::Built {
            path: sentinel.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(dir: &'a Utf8Path, fasta: &'a Utf8Path) -> IndexContext<'a> {
        IndexContext {
            genome_id: "hg19",
            genome_dir: dir,
            fasta,
            threads: 4,
        }
    }

    #[test]
    fn bwa_command_targets_kind_dir() {
        let dir = Utf8Path::new("/data/genomes/Hsapiens/hg19");
        let fasta = Utf8Path::new("/data/genomes/Hsapiens/hg19/seq/hg19.fa");
        let ctx = ctx(dir, fasta);
        let commands = indexer_for(IndexKind::Bwa).commands(&ctx).unwrap();
        assert_eq!(
            commands[0].to_string(),
            "bwa index -a bwtsw -p /data/genomes/Hsapiens/hg19/bwa/hg19.fa /data/genomes/Hsapiens/hg19/seq/hg19.fa"
        );
        assert_eq!(
            indexer_for(IndexKind::Bwa).sentinel(&ctx),
            Utf8PathBuf::from("/data/genomes/Hsapiens/hg19/bwa/hg19.fa.bwt")
        );
    }

    #[test]
    fn star_requires_transcripts() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fasta = dir.join("seq/hg19.fa");
        let ctx = ctx(&dir, &fasta);
        assert!(indexer_for(IndexKind::Star).missing_prerequisite(&ctx).is_some());

        fs::create_dir_all(dir.join("rnaseq")).unwrap();
        fs::write(dir.join("rnaseq/ref-transcripts.gtf"), b"chr1\tx\texon\t1\t10\n").unwrap();
        assert!(indexer_for(IndexKind::Star).missing_prerequisite(&ctx).is_none());
    }

    struct SentinelWriter {
        dirs: std::sync::Mutex<Vec<String>>,
    }

    impl Executor for SentinelWriter {
        fn run(&self, command: &CommandSpec) -> Result<crate::command::CommandOutput, KiraError> {
            let dir = command.current_dir().unwrap().to_path_buf();
            self.dirs.lock().unwrap().push(dir.to_string());
            let prefix = command
                .args()
                .iter()
                .skip_while(|arg| arg.as_str() != "-p")
                .nth(1)
                .unwrap();
            fs::write(format!("{prefix}.bwt"), b"bwt").unwrap();
            Ok(crate::command::CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        fn has_tool(&self, _program: &str) -> bool {
            true
        }
    }

    #[test]
    fn commands_run_inside_the_index_directory() {
        let temp = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let fasta = dir.join("seq/hg19.fa");
        fs::create_dir_all(dir.join("seq")).unwrap();
        fs::write(&fasta, ">chr1\nACGT\n").unwrap();
        let executor = SentinelWriter {
            dirs: std::sync::Mutex::new(Vec::new()),
        };

        let jobs = IndexerRegistry::new(&executor, "node-1")
            .build_all(&ctx(&dir, &fasta), &[IndexKind::Seq, IndexKind::Bwa]);

        assert!(matches!(jobs[0].status, IndexStatus::Built { .. }));
        assert!(matches!(jobs[1].status, IndexStatus::Built { .. }));
        assert_eq!(*executor.dirs.lock().unwrap(), vec![dir.join("bwa").to_string()]);
    }

    #[test]
    fn table_covers_every_kind() {
        for kind in IndexKind::ALL {
            assert_eq!(indexer_for(kind).kind(), kind);
        }
    }
}
