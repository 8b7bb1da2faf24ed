//! Replays a JSON-lines command script through an in-memory engine and prints
//! the resulting read models.
//!
//! ```text
//! folio-demo [SCRIPT]        (reads stdin when SCRIPT is omitted)
//! ```
//!
//! Each line is one of:
//!
//! ```text
//! {"library": {"command": "create_library", "library_id": "lib1", "name": "Central", "occurred_at": "..."}}
//! {"publisher": {"command": "register_publisher", "publisher_id": "pub1", "name": "...", "occurred_at": "..."}}
//! {"tick": {"at": "..."}}
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use folio_infra::config::EngineConfig;
use folio_infra::engine::InMemoryEngine;
use folio_library::LibraryCommand;
use folio_publishing::PublisherCommand;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScriptLine {
    Library(LibraryCommand),
    Publisher(PublisherCommand),
    /// Evaluate saga deadlines as of `at`.
    Tick { at: DateTime<Utc> },
}

fn main() -> Result<()> {
    folio_observability::init();

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    let engine = InMemoryEngine::new(config);

    let input: Box<dyn BufRead> = match std::env::args().nth(1) {
        Some(path) => Box::new(BufReader::new(
            File::open(&path).with_context(|| format!("cannot open script {path}"))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut accepted = 0usize;
    let mut refused = 0usize;
    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let line = line.with_context(|| format!("cannot read line {line_no}"))?;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let entry: ScriptLine =
            serde_json::from_str(&line).with_context(|| format!("line {line_no} is not a valid script entry"))?;

        let result = match entry {
            ScriptLine::Library(command) => engine.submit_library(command).map(|o| o.new_version),
            ScriptLine::Publisher(command) => engine.submit_publisher(command).map(|o| o.new_version),
            ScriptLine::Tick { at } => {
                let fired = engine.tick(at).context("delivery failed after tick")?;
                info!(line = line_no, timed_out = fired, "tick");
                continue;
            }
        };

        match result {
            Ok(version) => {
                accepted += 1;
                info!(line = line_no, version = ?version, "command accepted");
            }
            Err(err) => {
                refused += 1;
                warn!(line = line_no, error = %err, "command refused");
            }
        }

        engine.settle().context("delivery failed")?;
    }

    engine.settle().context("delivery failed")?;

    let report = json!({
        "commands": { "accepted": accepted, "refused": refused },
        "libraries": engine.catalog().list(),
        "publishers": engine.directory().list(),
        "publisher_catalog": engine.publisher_catalog().list(),
        "transfers": engine.transfers().instances(),
        "health": engine.health(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
