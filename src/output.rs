use std::io::{self, IsTerminal, Write};

use crossterm::style::{Color, Stylize};

use serde::Serialize;

use crate::app::{GenomesResult, InstallResult, ListResult, ProgressEvent, ProgressSink, UploadResult};
use crate::installer::InstallOutcome;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_install(result: &InstallResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(result: &UploadResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_genomes(result: &GenomesResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Colors summary lines when stdout is a terminal; piped output stays plain.
#[derive(Debug, Clone, Copy)]
struct Palette {
    enabled: bool,
}

impl Palette {
    fn detect() -> Self {
        Self {
            enabled: io::stdout().is_terminal(),
        }
    }

    fn paint(self, text: impl Into<String>, color: Color) -> String {
        let text = text.into();
        if self.enabled {
            text.with(color).to_string()
        } else {
            text
        }
    }
}

/// Progress lines on stderr and a colored summary on stdout.
pub struct TextOutput;

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}

impl TextOutput {
    pub fn print_install(result: &InstallResult) {
        print!("{}", install_summary(result, Palette::detect()));
    }

    pub fn print_upload(result: &UploadResult) {
        print!("{}", upload_summary(result, Palette::detect()));
    }

    pub fn print_genomes(result: &GenomesResult) {
        print!("{}", genomes_summary(result, Palette::detect()));
    }

    pub fn print_list(result: &ListResult) {
        print!("{}", list_summary(result, Palette::detect()));
    }
}

fn push_line(out: &mut String, line: String) {
    out.push_str(&line);
    out.push('\n');
}

fn install_summary(result: &InstallResult, palette: Palette) -> String {
    let mut out = String::new();
    push_line(
        &mut out,
        palette.paint(format!("kira-prov {} summary", result.mode), Color::Cyan),
    );
    for item in &result.items {
        if let Some(error) = &item.error {
            let label = if item.mandatory { "failed" } else { "failed (optional)" };
            push_line(
                &mut out,
                palette.paint(format!("  x {} {label}: {error}", item.resource), Color::Red),
            );
            continue;
        }
        match &item.outcome {
            Some(InstallOutcome::Present { version, .. }) => push_line(
                &mut out,
                palette.paint(format!("  = {} {version} present", item.resource), Color::Green),
            ),
            Some(InstallOutcome::Installed { version, path, .. }) => push_line(
                &mut out,
                palette.paint(format!("  + {} {version} -> {path}", item.resource), Color::Green),
            ),
            Some(InstallOutcome::Unavailable { version }) => push_line(
                &mut out,
                palette.paint(
                    format!("  ? {} {version} unavailable", item.resource),
                    Color::Yellow,
                ),
            ),
            Some(InstallOutcome::Planned { version, attempts }) => {
                push_line(
                    &mut out,
                    palette.paint(format!("  ~ {} {version}", item.resource), Color::Cyan),
                );
                for attempt in attempts {
                    push_line(&mut out, palette.paint(format!("      {attempt}"), Color::Cyan));
                }
            }
            None => {}
        }
    }
    let color = if result.failed > 0 { Color::Yellow } else { Color::Green };
    push_line(
        &mut out,
        palette.paint(
            format!("  {} resource(s), {} failed", result.items.len(), result.failed),
            color,
        ),
    );
    out
}

fn upload_summary(result: &UploadResult, palette: Palette) -> String {
    let mut out = String::new();
    push_line(&mut out, palette.paint("kira-prov snapshot upload", Color::Cyan));
    for item in &result.items {
        let line = match (&item.upload, &item.planned_url, &item.error) {
            (Some(upload), _, _) => palette.paint(
                format!(
                    "  + {} {} ({} bytes) -> {}",
                    item.resource, upload.version, upload.bytes, upload.url
                ),
                Color::Green,
            ),
            (None, Some(url), _) => {
                palette.paint(format!("  ~ {} -> {url}", item.resource), Color::Cyan)
            }
            (None, None, Some(error)) => {
                palette.paint(format!("  x {}: {error}", item.resource), Color::Red)
            }
            (None, None, None) => {
                palette.paint(format!("  ? {} not installed", item.resource), Color::Yellow)
            }
        };
        push_line(&mut out, line);
    }
    out
}

fn genomes_summary(result: &GenomesResult, palette: Palette) -> String {
    let mut out = String::new();
    push_line(&mut out, palette.paint("kira-prov genomes", Color::Cyan));
    for genome in &result.genomes {
        let color = if genome.partial.is_some() { Color::Yellow } else { Color::Green };
        push_line(
            &mut out,
            palette.paint(
                format!(
                    "  {} {} [{:?}] {}",
                    genome.organism, genome.genome_id, genome.state, genome.reference
                ),
                color,
            ),
        );
        for step in &genome.planned {
            push_line(&mut out, palette.paint(format!("      {step}"), Color::Cyan));
        }
        for job in &genome.indexes {
            push_line(
                &mut out,
                palette.paint(format!("      {}: {:?}", job.kind, job.status), color),
            );
        }
    }
    for failure in &result.failures {
        push_line(
            &mut out,
            palette.paint(format!("  x {}: {}", failure.genome_id, failure.error), Color::Red),
        );
    }
    out
}

fn list_summary(result: &ListResult, palette: Palette) -> String {
    let mut out = String::new();
    push_line(&mut out, palette.paint("Installed", Color::Cyan));
    for artifact in &result.installed {
        let marker = if artifact.is_default { "*" } else { " " };
        push_line(
            &mut out,
            format!(
                "  {marker} {}/{} {} {}",
                artifact.category, artifact.resource_name, artifact.version, artifact.install_path
            ),
        );
    }
    push_line(&mut out, palette.paint("Genomes", Color::Cyan));
    for genome in &result.genomes {
        push_line(
            &mut out,
            format!(
                "    {}/{} [{}]",
                genome.organism,
                genome.genome_id,
                genome.components.join(", ")
            ),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::UploadItem;

    fn upload_result() -> UploadResult {
        UploadResult {
            items: vec![UploadItem {
                resource: "picard".to_string(),
                upload: None,
                planned_url: None,
                error: None,
            }],
            failed: 0,
        }
    }

    #[test]
    fn piped_summary_has_no_escape_codes() {
        let text = upload_summary(&upload_result(), Palette { enabled: false });
        assert_eq!(text, "kira-prov snapshot upload\n  ? picard not installed\n");
    }

    #[test]
    fn terminal_summary_keeps_the_text() {
        let text = upload_summary(&upload_result(), Palette { enabled: true });
        assert!(text.contains("picard not installed"));
    }
}
