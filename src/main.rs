use std::process;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::Parser;

use patchtrack::cli::{Args, Command};
use patchtrack::cluster::{diff_partitions, ClusterState};
use patchtrack::config::Config;
use patchtrack::engine::Engine;
use patchtrack::error::Error;
use patchtrack::loader::Loader;
use patchtrack::model::{PatchId, PatchMap, Verdict};
use patchtrack::upstream;

fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .target(env_logger::Target::Stderr)
        .init();

    let start = Instant::now();
    if let Err(e) = run(&args) {
        log::error!("{:#}", e);
        process::exit(1);
    }
    log::debug!("finished in {:.2?}", start.elapsed());
}

fn run(args: &Args) -> anyhow::Result<()> {
    let cfg = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    if cfg.workers > 0 {
        rayon::ThreadPoolBuilder::new()
            .num_threads(cfg.workers)
            .build_global()
            .context("sizing the rating worker pool")?;
    }

    match &args.command {
        Command::Rate { id_a, id_b } => rate(&cfg, id_a, id_b),
        Command::Compare { stack_a, stack_b } => compare(&cfg, stack_a, stack_b),
        Command::CompareClusters { file_a, file_b } => compare_clusters(file_a, file_b),
        Command::Analyse => analyse(&cfg),
        Command::OptimiseCluster { id } => optimise_cluster(&cfg, id),
        Command::Ripup { cold } => ripup(&cfg, *cold),
        Command::UpstreamHistory => upstream_history(&cfg),
        Command::UpstreamDuration => upstream_duration(&cfg),
    }
}

fn rate(cfg: &Config, id_a: &str, id_b: &str) -> anyhow::Result<()> {
    let loader = Loader::open(cfg)?;
    let (_, universe) = loader.load_all_stacks()?;
    let mut engine = Engine::ephemeral(cfg, universe)?;

    let a = resolve_prefix(&engine.patches, id_a)?;
    let b = resolve_prefix(&engine.patches, id_b)?;
    let verdict = engine.rate_pair(&a, &b)?;
    engine.save_cache()?;

    match verdict {
        Verdict::Rated { rating } => {
            println!(
                "{} <-> {}: {:.2} message, {:.2} diff, diff lines ratio {:.2}",
                a.short(),
                b.short(),
                rating.msg,
                rating.diff,
                rating.diff_lines_ratio
            );
            let combined = rating.combined(cfg.rater.message_diff_weight);
            let verdict = if combined >= cfg.equivalence_threshold {
                "equivalent"
            } else {
                "distinct"
            };
            println!("combined {:.2} -> {}", combined, verdict);
        }
        Verdict::Unknown { reason } => {
            println!("{} <-> {}: unknown ({:?})", a.short(), b.short(), reason);
        }
    }
    Ok(())
}

fn compare(cfg: &Config, stack_a: &str, stack_b: &str) -> anyhow::Result<()> {
    let loader = Loader::open(cfg)?;
    let (left, left_patches) = loader.load_stack(stack_a)?;
    let (right, right_patches) = loader.load_stack(stack_b)?;

    let mut universe = PatchMap::new();
    for patch in left_patches.into_iter().chain(right_patches) {
        universe.entry(patch.id.clone()).or_insert(patch);
    }

    // Ad-hoc clustering over just these two snapshots; the persisted
    // partition stays untouched, only the cache grows.
    let mut engine = Engine::ephemeral(cfg, universe)?;
    engine.build()?;
    let result = engine.compare_stacks(&left, &right);
    engine.save_cache()?;

    println!(
        "{} <-> {}: {} matched, {} only in {}, {} only in {}",
        left.name,
        right.name,
        result.matched.len(),
        result.only_left.len(),
        left.name,
        result.only_right.len(),
        right.name
    );
    for (l, r) in &result.matched {
        println!("  {} ~ {}  {}", l.short(), r.short(), subject(&engine.patches, l));
    }
    for l in &result.only_left {
        println!("  - {}  {}", l.short(), subject(&engine.patches, l));
    }
    for r in &result.only_right {
        println!("  + {}  {}", r.short(), subject(&engine.patches, r));
    }
    Ok(())
}

fn compare_clusters(file_a: &std::path::Path, file_b: &std::path::Path) -> anyhow::Result<()> {
    let old = ClusterState::load(file_a)?
        .with_context(|| format!("no cluster state at {}", file_a.display()))?;
    let new = ClusterState::load(file_b)?
        .with_context(|| format!("no cluster state at {}", file_b.display()))?;
    if old.policy_fingerprint != new.policy_fingerprint {
        log::warn!("partitions were built under different merge policies");
    }

    let diff = diff_partitions(&old, &new);
    println!(
        "{} unchanged, {} changed, {} added, {} removed",
        diff.unchanged,
        diff.changed.len(),
        diff.added.len(),
        diff.removed.len()
    );
    for (before, after) in &diff.changed {
        println!("  ~ {} -> {} members", before.len(), after.len());
    }
    for class in &diff.added {
        println!("  + class of {}", class.len());
    }
    for class in &diff.removed {
        println!("  - class of {}", class.len());
    }
    Ok(())
}

fn analyse(cfg: &Config) -> anyhow::Result<()> {
    let loader = Loader::open(cfg)?;
    let (_, universe) = loader.load_all_stacks()?;
    let mut engine = Engine::open(cfg, universe)?;

    let stats = if engine.cluster().is_empty() {
        engine.build()?;
        None
    } else {
        Some(engine.update()?)
    };
    engine.save()?;

    let classes = engine.cluster().classes();
    let multi = classes.iter().filter(|c| c.len() > 1).count();
    println!("{} classes, {} with more than one member", classes.len(), multi);
    if let Some(stats) = stats {
        println!(
            "{} patches added, {} removed, {} comparisons invalidated",
            stats.added, stats.removed, stats.invalidated_comparisons
        );
    }
    let unrated: Vec<&PatchId> = engine
        .cluster()
        .members()
        .filter(|m| engine.cluster().is_unrated(m))
        .collect();
    if !unrated.is_empty() {
        println!("{} patches could not be rated:", unrated.len());
        for id in unrated {
            println!("  ? {}  {}", id.short(), subject(&engine.patches, id));
        }
    }
    Ok(())
}

fn optimise_cluster(cfg: &Config, id: &str) -> anyhow::Result<()> {
    let loader = Loader::open(cfg)?;
    let (_, universe) = loader.load_all_stacks()?;
    let mut engine = Engine::open(cfg, universe)?;

    let id = resolve_prefix(&engine.patches, id)?;
    let classes = engine.optimise_class(&id)?;
    engine.save()?;

    for (i, class) in classes.iter().enumerate() {
        let marker = if i == 0 { "kept" } else { "split" };
        println!("{}: {} members", marker, class.len());
        for member in class {
            println!("  {}  {}", member.short(), subject(&engine.patches, member));
        }
    }
    Ok(())
}

fn ripup(cfg: &Config, cold: bool) -> anyhow::Result<()> {
    let loader = Loader::open(cfg)?;
    let (_, universe) = loader.load_all_stacks()?;
    let mut engine = Engine::open(cfg, universe)?;
    engine.ripup(cold)?;
    engine.save()?;
    println!(
        "rebuilt {} classes over {} patches",
        engine.cluster().classes().len(),
        engine.patches.len()
    );
    Ok(())
}

fn resolve_timelines(cfg: &Config) -> anyhow::Result<(Vec<upstream::ClassTimeline>, PatchMap)> {
    let loader = Loader::open(cfg)?;
    let (_, universe) = loader.load_all_stacks()?;
    let upstream_patches = loader.load_upstream()?;

    let mut engine = Engine::open(cfg, universe)?;
    if engine.cluster().is_empty() {
        engine.build()?;
    } else {
        engine.update()?;
    }
    let timelines = upstream::resolve(&mut engine, &upstream_patches)?;
    engine.save()?;
    Ok((timelines, std::mem::take(&mut engine.patches)))
}

fn upstream_history(cfg: &Config) -> anyhow::Result<()> {
    let (timelines, patches) = resolve_timelines(cfg)?;
    for timeline in &timelines {
        match &timeline.entry {
            Some(entry) => println!(
                "{}  {}  integrated {} as {}",
                timeline.representative.short(),
                subject(&patches, &timeline.representative),
                format_date(entry.integrated_at),
                &entry.commit[..12.min(entry.commit.len())],
            ),
            None => println!(
                "{}  {}  not yet upstream",
                timeline.representative.short(),
                subject(&patches, &timeline.representative),
            ),
        }
    }
    Ok(())
}

fn upstream_duration(cfg: &Config) -> anyhow::Result<()> {
    let (timelines, patches) = resolve_timelines(cfg)?;
    for timeline in &timelines {
        match timeline.duration_secs() {
            Some(secs) => println!(
                "{}  {}  {} days",
                timeline.representative.short(),
                subject(&patches, &timeline.representative),
                secs / 86_400,
            ),
            None => println!(
                "{}  {}  -",
                timeline.representative.short(),
                subject(&patches, &timeline.representative),
            ),
        }
    }
    Ok(())
}

fn resolve_prefix(patches: &PatchMap, prefix: &str) -> anyhow::Result<PatchId> {
    let mut matching = patches.keys().filter(|id| id.as_str().starts_with(prefix));
    match (matching.next(), matching.next()) {
        (Some(id), None) => Ok(id.clone()),
        (Some(_), Some(_)) => bail!(Error::AmbiguousPatch(prefix.to_string())),
        (None, _) => bail!(Error::UnknownPatch(prefix.to_string())),
    }
}

fn subject<'a>(patches: &'a PatchMap, id: &PatchId) -> &'a str {
    patches.get(id).map(|p| p.subject()).unwrap_or("")
}

fn format_date(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
