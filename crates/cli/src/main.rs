use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use opskit_core::EnvironmentContext;
use opskit_search::{Chooser, Resolution};
use opskit_subs::{ensure_fresh, GraphSubscriptions, Outcome, Settings};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "opskitctl", version, about = "Opskit CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a test file by (fuzzy) name, prompting when ambiguous
    Pick {
        /// Search term; a path prefix is stripped before matching
        term: String,
        /// Directory to search for test files
        #[arg(long = "dir", default_value = ".")]
        dir: PathBuf,
        /// File-name suffix to include
        #[arg(long = "suffix", default_value = ".rs")]
        suffix: String,
        /// Allow selecting several files
        #[arg(long = "multi", action = ArgAction::SetTrue)]
        multi: bool,
        /// Menu page size
        #[arg(long = "page-size", default_value_t = 10)]
        page_size: usize,
        /// Take the top-ranked candidate without prompting (CI bypass)
        #[arg(long = "pick-first", action = ArgAction::SetTrue)]
        pick_first: bool,
    },
    /// Collect tag annotations from test files and select among them
    Tags {
        /// Directory to search for test files
        #[arg(long = "dir", default_value = ".")]
        dir: PathBuf,
        /// File-name suffix to include
        #[arg(long = "suffix", default_value = ".rs")]
        suffix: String,
        /// Menu page size
        #[arg(long = "page-size", default_value_t = 10)]
        page_size: usize,
    },
    /// Create or renew the change-notification subscription
    Renew {
        /// Report the intended action without mutating anything
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Override the configured renewal threshold (hours)
        #[arg(long = "threshold-hours")]
        threshold_hours: Option<i64>,
    },
    /// Best-effort removal of scratch/experiment directories
    Clean {
        /// Directories to delete
        dirs: Vec<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("OPSKIT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("OPSKIT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid OPSKIT_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Pick { term, dir, suffix, multi, page_size, pick_first } => {
            let files = collect_files(&dir, &suffix)
                .with_context(|| format!("scanning {}", dir.display()))?;
            info!(term = %term, files = files.len(), "pick invoked");
            let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();

            let resolution = if pick_first {
                let mut chooser = FirstChooser;
                opskit_search::resolve(&term, &names, |n| n.as_str(), multi, &mut chooser)
            } else {
                let mut chooser = MenuChooser { names: &names, page_size };
                opskit_search::resolve(&term, &names, |n| n.as_str(), multi, &mut chooser)
            };

            let picked: Vec<&PathBuf> = match resolution {
                Resolution::Single(i) => vec![&files[i]],
                Resolution::Multiple(is) => is.iter().map(|&i| &files[i]).collect(),
                Resolution::Canceled => {
                    eprintln!("selection canceled");
                    return Ok(());
                }
                Resolution::NotFound => {
                    eprintln!("no files matching '{}'", term);
                    return Ok(());
                }
            };
            match cli.output {
                Output::Human => {
                    for p in picked {
                        println!("{}", p.display());
                    }
                }
                Output::Json => {
                    let paths: Vec<String> = picked.iter().map(|p| p.display().to_string()).collect();
                    println!("{}", serde_json::to_string_pretty(&paths)?);
                }
            }
        }
        Commands::Tags { dir, suffix, page_size } => {
            let files = collect_files(&dir, &suffix)
                .with_context(|| format!("scanning {}", dir.display()))?;
            let tags = extract_tags(&files)?;
            if tags.is_empty() {
                eprintln!("no tag annotations found under {}", dir.display());
                return Ok(());
            }
            let tags: Vec<String> = tags.into_iter().collect();
            let mut stdin = std::io::stdin().lock();
            let mut stdout = std::io::stdout();
            let chosen = opskit_select::select(
                &tags,
                "available tags",
                |t| t.clone(),
                true,
                page_size,
                &mut stdin,
                &mut stdout,
            )?;
            if chosen.is_empty() {
                eprintln!("selection canceled");
                return Ok(());
            }
            let selected: Vec<&String> = chosen.iter().map(|&i| &tags[i]).collect();
            match cli.output {
                Output::Human => {
                    for t in selected {
                        println!("{}", t);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&selected)?),
            }
        }
        Commands::Renew { dry_run, threshold_hours } => {
            let ctx = EnvironmentContext::from_os();
            let mut settings = Settings::resolve(&ctx).map_err(|e| {
                error!(error = %e, "configuration incomplete");
                anyhow::anyhow!(e)
            })?;
            if let Some(hours) = threshold_hours {
                settings.renewal_threshold_hours = hours;
            }
            // Auth failure aborts here, before any discovery
            let api = GraphSubscriptions::connect(&ctx, &settings).await.map_err(|e| {
                error!(error = %e, "could not authenticate to the subscription service");
                anyhow::anyhow!(e)
            })?;
            let outcome =
                ensure_fresh(&api, &settings, chrono::Utc::now(), dry_run).await.map_err(|e| {
                    error!(error = %e, "subscription discovery failed");
                    anyhow::anyhow!(e)
                })?;
            report(&outcome, cli.output)?;
        }
        Commands::Clean { dirs } => {
            for dir in dirs {
                match std::fs::remove_dir_all(&dir) {
                    Ok(()) => info!(dir = %dir.display(), "removed"),
                    Err(e) => warn!(dir = %dir.display(), error = %e, "skipping (best-effort)"),
                }
            }
        }
    }

    Ok(())
}

fn report(outcome: &Outcome, output: Output) -> Result<()> {
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        Output::Human => match outcome {
            Outcome::Created { expiration, dry_run } => {
                let prefix = if *dry_run { "[dry-run] would create" } else { "created" };
                println!("{} subscription expiring {}", prefix, expiration);
            }
            Outcome::Renewed { id, expiration, dry_run } => {
                let prefix = if *dry_run { "[dry-run] would renew" } else { "renewed" };
                println!("{} {} to expire {}", prefix, id, expiration);
            }
            Outcome::RenewalSkipped { id, hours_left } => {
                println!("{} has {:.1}h left; renewal not needed", id, hours_left);
            }
            Outcome::RenewalFailed { id, cause, gone_or_foreign } => {
                if *gone_or_foreign {
                    println!("renewal of {} rejected (gone, expired, or owned elsewhere): {}", id, cause);
                } else {
                    println!("renewal of {} failed: {}", id, cause);
                }
            }
        },
    }
    Ok(())
}

/// Routes ambiguous candidate sets through the paged menu on stdin/stdout.
struct MenuChooser<'a> {
    names: &'a [String],
    page_size: usize,
}

impl Chooser for MenuChooser<'_> {
    fn choose(&mut self, candidates: &[usize], multiple: bool) -> Vec<usize> {
        let mut stdin = std::io::stdin().lock();
        let mut stdout = std::io::stdout();
        let chosen = opskit_select::select(
            candidates,
            "matching files",
            |&i| self.names[i].clone(),
            multiple,
            self.page_size,
            &mut stdin,
            &mut stdout,
        )
        .unwrap_or_default();
        chosen.into_iter().map(|pos| candidates[pos]).collect()
    }
}

/// Non-interactive bypass: always takes the top-ranked candidate.
struct FirstChooser;

impl Chooser for FirstChooser {
    fn choose(&mut self, candidates: &[usize], _multiple: bool) -> Vec<usize> {
        candidates.first().copied().into_iter().collect()
    }
}

fn file_name(p: &Path) -> String {
    p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
}

/// Recursively collect files ending in `suffix`, skipping hidden entries and
/// build output. Order is stable (sorted by path) so menu numbering is
/// reproducible run to run.
fn collect_files(dir: &Path, suffix: &str) -> std::io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    walk(dir, suffix, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(dir: &Path, suffix: &str, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let name = file_name(&path);
        if name.starts_with('.') || name == "target" {
            continue;
        }
        if path.is_dir() {
            walk(&path, suffix, out)?;
        } else if name.ends_with(suffix) {
            out.push(path);
        }
    }
    Ok(())
}

/// Pull `// tags: a, b` annotations out of the given files. Unreadable files
/// are skipped with a warning.
fn extract_tags(files: &[PathBuf]) -> Result<BTreeSet<String>> {
    let re = regex::Regex::new(r"(?m)^\s*(?://|#)\s*tags?:\s*(.+)$").expect("static regex");
    let mut tags = BTreeSet::new();
    for path in files {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unreadable; skipping");
                continue;
            }
        };
        for cap in re.captures_iter(&text) {
            for tag in cap[1].split(',') {
                let tag = tag.trim();
                if !tag.is_empty() {
                    tags.insert(tag.to_string());
                }
            }
        }
    }
    Ok(tags)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn collect_files_filters_and_sorts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        fs::create_dir_all(root.join("nested")).expect("mkdir");
        fs::create_dir_all(root.join(".hidden")).expect("mkdir");
        fs::create_dir_all(root.join("target")).expect("mkdir");
        fs::write(root.join("b_test.rs"), "").expect("write");
        fs::write(root.join("nested/a_test.rs"), "").expect("write");
        fs::write(root.join("notes.md"), "").expect("write");
        fs::write(root.join(".hidden/skip.rs"), "").expect("write");
        fs::write(root.join("target/skip.rs"), "").expect("write");

        let files = collect_files(root, ".rs").expect("collect");
        let names: Vec<String> = files.iter().map(|p| file_name(p)).collect();
        // sorted by full path: "b_test.rs" < "nested/a_test.rs"
        assert_eq!(names, vec!["b_test.rs", "a_test.rs"]);
    }

    #[test]
    fn extract_tags_parses_comment_annotations() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let f1 = tmp.path().join("one.rs");
        let f2 = tmp.path().join("two.rs");
        fs::write(&f1, "// tags: smoke, integration\nfn a() {}\n").expect("write");
        fs::write(&f2, "# tag: slow\n// not a tag line\n").expect("write");

        let tags = extract_tags(&[f1, f2]).expect("tags");
        let got: Vec<&str> = tags.iter().map(|s| s.as_str()).collect();
        assert_eq!(got, vec!["integration", "slow", "smoke"]);
    }

    #[test]
    fn first_chooser_takes_the_top_candidate() {
        let mut c = FirstChooser;
        assert_eq!(c.choose(&[7, 3, 9], true), vec![7]);
        assert!(c.choose(&[], true).is_empty());
    }
}
