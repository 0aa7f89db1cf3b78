//! Validate command implementation.

use super::{builtin_plugins, load_jobs};
use regsync_engine::PluginRegistry;
use regsync_model::JobConf;
use std::collections::HashSet;
use std::path::Path;

/// Problems found in one job.
fn check_job(conf: &JobConf, plugins: &PluginRegistry) -> Vec<String> {
    let mut problems = Vec::new();
    if !plugins.has_reader(conf.source.as_str()) {
        problems.push(format!("no reader for source {}", conf.source));
    }
    if !plugins.has_writer(conf.dest.as_str()) {
        problems.push(format!("no writer for dest {}", conf.dest));
    }
    if let Err(err) = plugins.transformer_for(conf.job_type) {
        problems.push(err.to_string());
    }
    problems
}

/// Checks a parsed job list against a plugin registry.
///
/// Returns one message per problem, prefixed with the job id.
pub fn check(jobs: &[JobConf], plugins: &PluginRegistry) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut problems = Vec::new();
    for conf in jobs {
        if !seen.insert(conf.id.as_str()) {
            problems.push(format!("{}: duplicate job id", conf.id));
        }
        for problem in check_job(conf, plugins) {
            problems.push(format!("{}: {problem}", conf.id));
        }
    }
    problems
}

/// Runs the validate command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating jobs in {}", path.display());
    println!();

    let jobs = load_jobs(path)?;
    let plugins = builtin_plugins();
    let problems = check(&jobs, &plugins);

    for conf in &jobs {
        let mark = if problems.iter().any(|p| p.starts_with(&format!("{}:", conf.id))) {
            "✗"
        } else {
            "✓"
        };
        println!(
            "{mark} {} ({}): {} => {}",
            conf.id, conf.job_type, conf.source, conf.dest
        );
    }
    for problem in &problems {
        println!("  - {problem}");
    }

    println!();
    if problems.is_empty() {
        println!("✓ {} job(s) valid", jobs.len());
        Ok(())
    } else {
        println!("✗ {} problem(s) found", problems.len());
        Err("Validation failed".into())
    }
}
