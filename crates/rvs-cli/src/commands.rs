use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use colored::Colorize;
use rvs_sdk::{
    ContentKey, DataEntry, Finalized, HistoryEntry, Node, RemoteStore, RepackReport, RepoPathBuf,
    RevisionStore, StoreConfig, StoreRemote,
};
use rvs_store::delta;
use rvs_types::{Compression, DataContent, DeltaAlgorithm};
use serde::Serialize;
use tracing::debug;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli.store)?;
    if let Command::Add(AddArgs {
        target: Some(target),
        ..
    }) = &cli.command
    {
        config.buffer.finalize = (*target).into();
    }
    let format = cli.format;
    if let Command::Config = cli.command {
        return cmd_config(&config, format);
    }

    let store = open_store(config, &cli.store)?;
    match cli.command {
        Command::Get(args) => cmd_get(&store, args, format),
        Command::History(args) => cmd_history(&store, args, format),
        Command::Add(args) => cmd_add(&store, args, format),
        Command::Repack => cmd_repack(&store, format),
        Command::Verify(args) => cmd_verify(&store, args, format),
        Command::Stats => cmd_stats(&store, format),
        Command::Config => cmd_config(store.config(), format),
    }
}

fn load_config(args: &StoreArgs) -> anyhow::Result<StoreConfig> {
    let mut config = match &args.config {
        Some(path) => StoreConfig::load(path)?,
        None => StoreConfig::default(),
    };
    if let Some(local) = &args.local {
        config.local_path = local.clone();
    }
    if let Some(cache) = &args.cache {
        config.cache_path = Some(cache.clone());
    }
    config.validate()?;
    Ok(config)
}

fn open_store(config: StoreConfig, args: &StoreArgs) -> anyhow::Result<RevisionStore> {
    let remote = match &args.remote {
        Some(dir) => {
            debug!(remote = %dir.display(), "fetching misses from another store root");
            let upstream = RevisionStore::open(StoreConfig::at(dir), None)
                .with_context(|| format!("opening remote store {}", dir.display()))?;
            let remote: Arc<dyn RemoteStore> = Arc::new(StoreRemote::new(
                upstream.data_chain().clone(),
                upstream.history_chain().clone(),
            ));
            Some(remote)
        }
        None => None,
    };
    let root = config.local_path.clone();
    RevisionStore::open(config, remote)
        .with_context(|| format!("opening store {}", root.display()))
}

fn parse_key(path: &str, node: &str) -> anyhow::Result<ContentKey> {
    let node = node
        .parse::<Node>()
        .with_context(|| format!("invalid node '{node}'"))?;
    Ok(ContentKey::from_str_path(path, node)?)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[derive(Serialize)]
struct EntryOutput {
    key: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    base: Option<String>,
    compression: Compression,
    payload_len: usize,
}

#[derive(Serialize)]
struct ContentOutput {
    path: String,
    node: String,
    size: usize,
    content: String,
}

fn cmd_get(store: &RevisionStore, args: GetArgs, format: OutputFormat) -> anyhow::Result<()> {
    let key = parse_key(&args.path, &args.node)?;

    if args.raw {
        let entry = store
            .get_entry(&key)?
            .ok_or_else(|| anyhow!("{key} not found"))?;
        let output = EntryOutput {
            key: key.to_string(),
            kind: if entry.is_full() { "full" } else { "delta" },
            base: entry.delta_base().map(|b| format!("{}@{}", b.path, b.node)),
            compression: entry.compression,
            payload_len: entry.payload().len(),
        };
        return match format {
            OutputFormat::Json => print_json(&output),
            OutputFormat::Text => {
                println!("{}", output.key.yellow().bold());
                match &entry.content {
                    DataContent::Full(_) => println!("  kind: {}", "full text".green()),
                    DataContent::Delta { base, algorithm, .. } => {
                        println!("  kind: {} ({algorithm:?})", "delta".cyan());
                        println!("  base: {}@{}", base.path, base.node);
                    }
                }
                println!("  compression: {:?}", output.compression);
                println!("  payload: {}", human_bytes(output.payload_len as u64));
                Ok(())
            }
        };
    }

    let content = store.require(&key)?;
    if let Some(path) = &args.output {
        std::fs::write(path, &content)
            .with_context(|| format!("writing {}", path.display()))?;
        eprintln!(
            "{} wrote {} to {}",
            "✓".green(),
            human_bytes(content.len() as u64),
            path.display()
        );
        return Ok(());
    }
    match format {
        OutputFormat::Json => print_json(&ContentOutput {
            path: args.path,
            node: key.node.to_hex(),
            size: content.len(),
            content: hex::encode(&content),
        }),
        OutputFormat::Text => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct HistoryRow {
    path: String,
    node: String,
    p1: Option<String>,
    p2: Option<String>,
    linknode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    copy_from: Option<String>,
}

fn key_label(key: &ContentKey) -> String {
    format!("{}@{}", key.path, key.node)
}

fn cmd_history(store: &RevisionStore, args: HistoryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let start = parse_key(&args.path, &args.node)?;
    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([start.clone()]);

    while let Some(key) = queue.pop_front() {
        if rows.len() >= args.depth {
            break;
        }
        if !seen.insert(key.clone()) {
            continue;
        }
        let Some(entry) = store.get_history(&key)? else {
            if key == start {
                bail!("no history for {start}");
            }
            continue;
        };
        queue.extend(entry.parents().cloned());
        rows.push(HistoryRow {
            path: key.path.to_string(),
            node: key.node.to_hex(),
            p1: entry.p1.as_ref().map(key_label),
            p2: entry.p2.as_ref().map(key_label),
            linknode: entry.linknode.to_hex(),
            copy_from: entry.copy_from.as_ref().map(|p| p.to_string()),
        });
    }

    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Text => {
            for row in &rows {
                println!("{}@{}", row.path.bold(), row.node.yellow());
                let null = || "null".dimmed().to_string();
                println!("  p1: {}", row.p1.clone().unwrap_or_else(null));
                println!("  p2: {}", row.p2.clone().unwrap_or_else(null));
                println!("  linknode: {}", row.linknode.dimmed());
                if let Some(source) = &row.copy_from {
                    println!("  copied from: {}", source.cyan());
                }
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
struct AddOutput {
    path: String,
    node: String,
    size: usize,
    finalized: Finalized,
}

fn cmd_add(store: &RevisionStore, args: AddArgs, format: OutputFormat) -> anyhow::Result<()> {
    let text = std::fs::read(&args.file)
        .with_context(|| format!("reading {}", args.file.display()))?;
    let p1_path = args.copy_from.as_deref().unwrap_or(&args.path);
    let p1 = args
        .p1
        .as_deref()
        .map(|node| parse_key(p1_path, node))
        .transpose()?;
    let p2 = args
        .p2
        .as_deref()
        .map(|node| parse_key(&args.path, node))
        .transpose()?;
    let linknode = match &args.linknode {
        Some(node) => node
            .parse::<Node>()
            .with_context(|| format!("invalid linknode '{node}'"))?,
        None => Node::null(),
    };

    let null = Node::null();
    let node = Node::hash_revision(
        p1.as_ref().map_or(&null, |k| &k.node),
        p2.as_ref().map_or(&null, |k| &k.node),
        &text,
    );
    let key = ContentKey::from_str_path(&args.path, node)?;

    let mut data = match (&p1, args.delta) {
        (Some(base), true) => {
            let base_text = store
                .require(base)
                .with_context(|| format!("delta base {base} is not available"))?;
            DataEntry::delta(base.clone(), DeltaAlgorithm::Mpatch, delta::diff(&base_text, &text))
        }
        _ => DataEntry::full(text.clone()),
    };
    if args.zstd {
        data = data.with_compression(Compression::Zstd);
    }
    let mut history = HistoryEntry::root(linknode).with_parents(p1, p2);
    if let Some(source) = args.copy_from {
        history = history.with_copy_from(RepoPathBuf::new(source)?);
    }

    store.add(&key, data, history)?;
    let finalized = store.flush()?;

    let output = AddOutput {
        path: args.path,
        node: node.to_hex(),
        size: text.len(),
        finalized,
    };
    match format {
        OutputFormat::Json => print_json(&output),
        OutputFormat::Text => {
            println!(
                "{} Added {}@{} ({})",
                "✓".green().bold(),
                output.path.bold(),
                output.node.yellow(),
                human_bytes(output.size as u64)
            );
            match &output.finalized {
                Finalized::Empty => {}
                Finalized::Log { entries } => {
                    println!("  {} entries appended to the indexed log", entries)
                }
                Finalized::Pack { entries, packs } => {
                    println!("  {} entries written to {} pack file(s)", entries, packs.len());
                    for pack in packs {
                        println!("    {}", pack.display().to_string().dimmed());
                    }
                }
            }
            Ok(())
        }
    }
}

fn print_report(label: &str, report: &RepackReport) {
    println!("{} {}", "✓".green().bold(), label.bold());
    println!("  inputs: {} ({} removed)", report.inputs, report.inputs_removed);
    println!("  entries written: {}", report.entries_written);
    println!("  duplicates dropped: {}", report.duplicates_dropped);
    if report.corrupt_skipped > 0 {
        println!("  corrupt skipped: {}", report.corrupt_skipped.to_string().red());
    }
    if report.rebased > 0 {
        println!("  delta chains rebased: {}", report.rebased);
    }
    println!("  packs written: {}", report.packs_written);
    println!("  reclaimed: {}", human_bytes(report.bytes_reclaimed));
}

fn cmd_repack(store: &RevisionStore, format: OutputFormat) -> anyhow::Result<()> {
    let summary = store.repack()?;
    match format {
        OutputFormat::Json => print_json(&summary),
        OutputFormat::Text => {
            print_report("local root repacked", &summary.local);
            if let Some(shared) = &summary.shared {
                print_report("shared root repacked", shared);
            }
            Ok(())
        }
    }
}

fn cmd_verify(store: &RevisionStore, args: VerifyArgs, format: OutputFormat) -> anyhow::Result<()> {
    let report = store.verify();
    let quarantined = if args.quarantine {
        store.quarantine_corrupt()?
    } else {
        0
    };

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Text => {
            for problem in &report.problems {
                println!(
                    "{} {}: {}",
                    "✗".red().bold(),
                    problem.path.display(),
                    problem.reason
                );
            }
            if report.is_clean() {
                println!(
                    "{} {} packs, {} entries verified",
                    "✓".green().bold(),
                    report.packs_checked,
                    report.entries_checked
                );
            }
            if quarantined > 0 {
                println!("  {} pack(s) moved to corrupt/", quarantined.to_string().yellow());
            }
        }
    }

    if !report.is_clean() {
        bail!("{} problem(s) found", report.problems.len());
    }
    Ok(())
}

fn cmd_stats(store: &RevisionStore, format: OutputFormat) -> anyhow::Result<()> {
    let stats = store.stats();
    match format {
        OutputFormat::Json => print_json(&stats),
        OutputFormat::Text => {
            println!("Chain: {}", stats.chain.join(" → ").cyan());
            println!("Buffered: {}", stats.buffered);
            for root in &stats.roots {
                println!("\n{} ({:?})", root.path.display().to_string().bold(), root.tier);
                println!(
                    "  packs: {} data, {} history, {} entries, {}",
                    root.data_packs,
                    root.history_packs,
                    root.pack_entries,
                    human_bytes(root.pack_bytes)
                );
                if root.corrupt_packs > 0 {
                    println!("  corrupt packs: {}", root.corrupt_packs.to_string().red());
                }
                println!(
                    "  log: {} data, {} history, {} segments, {}",
                    root.data_log_entries,
                    root.history_log_entries,
                    root.log_segments,
                    human_bytes(root.log_bytes)
                );
                let writer = if root.log_writer {
                    "held".green()
                } else {
                    "held elsewhere".yellow()
                };
                println!("  writer lock: {writer}");
            }
            Ok(())
        }
    }
}

fn cmd_config(config: &StoreConfig, format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(config),
        OutputFormat::Text => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
