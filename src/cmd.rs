use anyhow::{Context, Result};
use colored::Colorize;
use rayon::prelude::*;
use std::io::Read;
use std::path::Path;

use skippy::config::{self, Config};
use skippy::coverage::{parse_covered_list, CoverageCollector};
use skippy::fingerprint::{ClassRootSource, Fingerprinter};
use skippy::{AnalysisRepository, Decision, Prediction, Session, TestId};

fn paint(prediction: &Prediction) -> String {
    let decision = format!("{:<4}", prediction.decision);
    match prediction.decision {
        Decision::Run => decision.yellow().bold().to_string(),
        Decision::Skip => decision.green().to_string(),
    }
}

fn source_for(project: &Path, config: &Config) -> ClassRootSource {
    ClassRootSource::new(
        config.class_roots(project),
        config.fingerprint.max_unit_bytes,
    )
}

// ── status ──────────────────────────────────────────────────

pub fn status(project: &Path, config: &Config, json: bool, verbose: u8) -> Result<()> {
    let session = Session::open_project(project, config);
    let snapshot = session.snapshot();
    let path = session.repository().path().display().to_string();

    let delta = session.detector().delta(snapshot);
    let tests: Vec<&TestId> = snapshot.tests.keys().collect();
    let predictions: Vec<(&TestId, Prediction)> = tests
        .par_iter()
        .map(|test| (*test, session.decide(test)))
        .collect();

    if json {
        let tests: Vec<_> = predictions
            .iter()
            .map(|(test, p)| {
                serde_json::json!({
                    "test": test,
                    "decision": p.decision,
                    "reason": p.reason,
                })
            })
            .collect();
        let out = serde_json::json!({
            "snapshot": path,
            "updated_at": snapshot.updated_at,
            "delta": delta,
            "tests": tests,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if snapshot.tests.is_empty() {
        println!("No recorded tests in {path}; every test will run.");
        return Ok(());
    }

    println!(
        "Snapshot: {} ({} tests, {} units)",
        path,
        snapshot.tests.len(),
        snapshot.classes.len()
    );
    println!(
        "Units: {} unchanged, {} changed, {} unknown",
        delta.unchanged, delta.changed, delta.unknown
    );
    if verbose > 0 {
        for change in &delta.changes {
            println!("  {:<9} {}", change.change.as_str(), change.unit);
        }
    }
    println!();

    let mut run = 0usize;
    for (test, prediction) in &predictions {
        if prediction.is_skip() {
            if verbose == 0 {
                continue;
            }
        } else {
            run += 1;
        }
        println!("  {} {}  {}", paint(prediction), test, prediction.reason.to_string().dimmed());
    }
    println!();
    println!(
        "{} to run, {} to skip",
        run.to_string().bold(),
        (predictions.len() - run).to_string().bold()
    );
    Ok(())
}

// ── decide ──────────────────────────────────────────────────

pub fn decide(project: &Path, config: &Config, raw: &str, class: bool, json: bool) -> Result<()> {
    let session = Session::open_project(project, config);
    let prediction = if class {
        session.decide_class(raw.trim())
    } else {
        session.decide(&TestId::parse(raw)?)
    };

    if json {
        println!("{}", serde_json::to_string(&prediction)?);
    } else {
        println!("{prediction}");
    }
    Ok(())
}

// ── record ──────────────────────────────────────────────────

pub fn record(project: &Path, config: &Config, raw: &str, covered: &Path) -> Result<()> {
    let test = TestId::parse(raw)?;
    let text = if covered == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read covered units from stdin")?;
        buf
    } else {
        std::fs::read_to_string(covered)
            .with_context(|| format!("Failed to read {}", covered.display()))?
    };
    let units = CoverageCollector::from_config(&config.coverage).normalize(parse_covered_list(&text));

    let session = Session::open_project(project, config);
    session.record_outcome(&test, &units);
    let report = session.close()?;

    print!("recorded {}: {} units", test, units.len());
    if report.attempts > 1 {
        print!(" ({} attempts)", report.attempts);
    }
    println!();
    if report.best_effort {
        eprintln!(
            "{} snapshot kept changing underneath; wrote best-effort",
            "warning:".yellow().bold()
        );
    }
    Ok(())
}

// ── show ────────────────────────────────────────────────────

pub fn show(project: &Path, config: &Config, json: bool) -> Result<()> {
    let repository = AnalysisRepository::from_config(config, project);
    let snapshot = repository.try_load()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    println!("Snapshot: {}", repository.path().display());
    match snapshot.updated_at {
        Some(at) => println!("Updated:  {}", at.to_rfc3339()),
        None => println!("Updated:  never"),
    }
    println!(
        "{} tests, {} fingerprinted units",
        snapshot.tests.len(),
        snapshot.classes.len()
    );
    for (test, record) in &snapshot.tests {
        println!();
        println!("{}", test.to_string().bold());
        println!("  observed {}", record.observed_at.to_rfc3339());
        for (unit, hash) in &record.covered {
            let hash = hash.map_or_else(|| "unknown".dimmed().to_string(), |h| h.to_string());
            println!("  {hash}  {unit}");
        }
    }
    Ok(())
}

// ── impacted ────────────────────────────────────────────────

pub fn impacted(project: &Path, config: &Config, unit: &str) -> Result<()> {
    let snapshot = AnalysisRepository::from_config(config, project).load();
    let tests = snapshot.tests_covering(unit);
    if tests.is_empty() {
        println!("No recorded test covers {unit}");
        return Ok(());
    }
    for test in tests {
        println!("{test}");
    }
    Ok(())
}

// ── fingerprint ─────────────────────────────────────────────

pub fn fingerprint(project: &Path, config: &Config, unit: Option<&str>) -> Result<()> {
    let source = source_for(project, config);

    if let Some(unit) = unit {
        let fp = Fingerprinter::new(source).fingerprint(unit);
        match fp.hash {
            Some(hash) => println!("{hash}  {unit}"),
            None => println!("{}  {unit}", "unknown         ".dimmed()),
        }
        for dep in &fp.dependencies {
            println!("  -> {dep}");
        }
        return Ok(());
    }

    let units: Vec<String> = source.list_units().into_keys().collect();
    if units.is_empty() {
        let roots: Vec<String> = source.roots().iter().map(|r| r.display().to_string()).collect();
        println!("No compiled units under {}", roots.join(", "));
        return Ok(());
    }
    let fingerprinter = Fingerprinter::new(source);
    let fps: Vec<_> = units
        .par_iter()
        .map(|unit| fingerprinter.fingerprint(unit))
        .collect();
    for fp in fps {
        let hash = fp
            .hash
            .map_or_else(|| "unknown".to_string(), |h| h.to_string());
        println!("{hash:<16}  {}", fp.name);
    }
    Ok(())
}

// ── clean / config ──────────────────────────────────────────

pub fn clean(project: &Path, config: &Config) -> Result<()> {
    let repository = AnalysisRepository::from_config(config, project);
    if repository.clear()? {
        println!("Removed {}", repository.path().display());
    } else {
        println!("No snapshot at {}", repository.path().display());
    }
    Ok(())
}

pub fn show_config(project: &Path) -> Result<()> {
    config::show_config(project)
}
