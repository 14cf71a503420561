//! `metaclaw capsule list` and `metaclaw capsule diff`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::Subcommand;
use metaclaw_core::capsule;
use serde::Serialize;

/// Capsule browsing subcommands.
#[derive(Subcommand, Debug)]
pub enum CapsuleCommands {
    /// List capsules under the state directory
    List {
        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// Filter by agent name (contains, case-insensitive)
        #[arg(long)]
        agent: Option<String>,

        /// Created-at lower bound (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        since: Option<String>,

        /// Created-at upper bound (RFC3339 or YYYY-MM-DD)
        #[arg(long)]
        until: Option<String>,

        /// Max rows
        #[arg(long, default_value_t = 100)]
        limit: usize,

        /// JSON output
        #[arg(long)]
        json: bool,
    },

    /// Structurally diff two capsules by id or path
    Diff {
        /// First capsule (id or directory)
        left: String,

        /// Second capsule (id or directory)
        right: String,

        /// State directory
        #[arg(long, default_value = ".metaclaw")]
        state_dir: PathBuf,

        /// JSON output
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CapsuleListItem {
    id: String,
    path: PathBuf,
    agent_name: String,
    source_clawfile: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CapsuleMaterial {
    id: String,
    path: PathBuf,
    agent_name: String,
    sections: Vec<(&'static str, serde_json::Value)>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiffResult {
    left: DiffRef,
    right: DiffRef,
    sections: Vec<SectionDiff>,
    equal: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiffRef {
    id: String,
    path: PathBuf,
    agent_name: String,
}

#[derive(Debug, Serialize)]
struct SectionDiff {
    section: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    added: Vec<JsonChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    removed: Vec<JsonChange>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    changed: Vec<JsonChange>,
    equal: bool,
}

#[derive(Debug, Serialize)]
struct JsonChange {
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    old: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new: Option<serde_json::Value>,
}

/// Dispatches the capsule subcommand.
pub fn execute(cmd: CapsuleCommands) -> Result<()> {
    match cmd {
        CapsuleCommands::List {
            state_dir,
            agent,
            since,
            until,
            limit,
            json,
        } => list(&state_dir, agent.as_deref(), since.as_deref(), until.as_deref(), limit, json),
        CapsuleCommands::Diff {
            left,
            right,
            state_dir,
            json,
        } => diff(&state_dir, &left, &right, json),
    }
}

fn list(
    state_dir: &Path,
    agent: Option<&str>,
    since: Option<&str>,
    until: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<()> {
    let since = since.map(|raw| parse_time_filter(raw, false)).transpose()?;
    let until = until.map(|raw| parse_time_filter(raw, true)).transpose()?;

    let mut items = discover_capsules(&state_dir.join("capsules"))?;
    let agent_filter = agent.unwrap_or_default().trim().to_lowercase();
    items.retain(|item| {
        if !agent_filter.is_empty() && !item.agent_name.to_lowercase().contains(&agent_filter) {
            return false;
        }
        if since.is_some_and(|bound| item.created_at < bound) {
            return false;
        }
        if until.is_some_and(|bound| item.created_at > bound) {
            return false;
        }
        true
    });
    if limit > 0 {
        items.truncate(limit);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    for item in items {
        println!(
            "{}\t{}\t{}\t{}",
            item.id,
            item.created_at.to_rfc3339(),
            item.agent_name,
            item.path.display()
        );
    }
    Ok(())
}

fn diff(state_dir: &Path, left_ref: &str, right_ref: &str, json: bool) -> Result<()> {
    let left = resolve_capsule_ref(state_dir, left_ref)
        .with_context(|| format!("resolve {left_ref:?} failed"))?;
    let right = resolve_capsule_ref(state_dir, right_ref)
        .with_context(|| format!("resolve {right_ref:?} failed"))?;

    let result = diff_capsules(&left, &right);
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!(
        "left:  {}\t{}\t{}",
        result.left.id,
        result.left.agent_name,
        result.left.path.display()
    );
    println!(
        "right: {}\t{}\t{}",
        result.right.id,
        result.right.agent_name,
        result.right.path.display()
    );
    for section in &result.sections {
        if section.equal {
            println!("[{}] equal", section.section);
            continue;
        }
        println!(
            "[{}] added={} removed={} changed={}",
            section.section,
            section.added.len(),
            section.removed.len(),
            section.changed.len()
        );
        for change in &section.added {
            println!("+ {} = {}", change.path, render(&change.new));
        }
        for change in &section.removed {
            println!("- {} = {}", change.path, render(&change.old));
        }
        for change in &section.changed {
            println!(
                "~ {}: {} -> {}",
                change.path,
                render(&change.old),
                render(&change.new)
            );
        }
    }
    if result.equal {
        println!("capsule diff: no differences across ir/policy/locks");
    }
    Ok(())
}

fn discover_capsules(capsule_root: &Path) -> Result<Vec<CapsuleListItem>> {
    let entries = match std::fs::read_dir(capsule_root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("read {}", capsule_root.display()));
        }
    };

    let mut items = Vec::new();
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || !name.starts_with("cap_") {
            continue;
        }
        let cap_path = entry.path();
        let manifest = match capsule::load(&cap_path) {
            Ok(manifest) => manifest,
            Err(err) => {
                eprintln!("warning: skipping invalid capsule {}: {err}", cap_path.display());
                continue;
            }
        };
        let agent_name = read_agent_name(&cap_path).unwrap_or_default();
        let created_at = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_default();
        items.push(CapsuleListItem {
            id: manifest.capsule_id,
            path: cap_path,
            agent_name,
            source_clawfile: manifest.source_clawfile,
            created_at,
        });
    }
    items.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
    Ok(items)
}

fn parse_time_filter(raw: &str, end_of_day_for_date: bool) -> Result<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(stamp) = DateTime::parse_from_rfc3339(raw) {
        return Ok(stamp.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day_for_date {
            date.and_hms_opt(23, 59, 59).expect("valid wall clock")
        } else {
            date.and_hms_opt(0, 0, 0).expect("valid wall clock")
        };
        return Ok(time.and_utc());
    }
    if let Ok(stamp) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Ok(stamp.and_utc());
    }
    bail!("unsupported time format {raw:?}")
}

fn resolve_capsule_ref(state_dir: &Path, reference: &str) -> Result<CapsuleMaterial> {
    let as_path = Path::new(reference);
    if as_path.is_dir() {
        return load_capsule_material(as_path);
    }

    let capsule_root = state_dir.join("capsules");
    let mut candidates = vec![format!("cap_{reference}")];
    if reference.starts_with("cap_") {
        candidates.push(reference.to_string());
    }
    for name in &candidates {
        let candidate = capsule_root.join(name);
        if candidate.is_dir() {
            return load_capsule_material(&candidate);
        }
    }

    // Unique-prefix match over the capsule root.
    let entries = std::fs::read_dir(&capsule_root)
        .with_context(|| format!("capsule directory not found: {}", capsule_root.display()))?;
    let mut matches: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .filter(|e| e.path().is_dir())
        .filter(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            candidates.iter().any(|prefix| name.starts_with(prefix))
        })
        .map(|e| e.path())
        .collect();
    matches.sort();
    match matches.len() {
        1 => load_capsule_material(&matches[0]),
        0 => bail!(
            "capsule {:?} not found in {}",
            reference,
            capsule_root.display()
        ),
        _ => bail!(
            "ambiguous capsule reference {:?}; matches: {}",
            reference,
            matches
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

fn load_capsule_material(cap_path: &Path) -> Result<CapsuleMaterial> {
    let manifest = capsule::load(cap_path).context("load manifest")?;
    let agent_name = read_agent_name(cap_path).unwrap_or_default();

    let mut sections = Vec::new();
    for (name, rel) in [
        ("ir", "ir.json"),
        ("policy", "policy.json"),
        ("locks.deps", "locks/deps.lock.json"),
        ("locks.image", "locks/image.lock.json"),
        ("locks.source", "locks/source.lock.json"),
    ] {
        let path = cap_path.join(rel);
        let bytes =
            std::fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        let value: serde_json::Value = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse {}", path.display()))?;
        sections.push((name, value));
    }

    Ok(CapsuleMaterial {
        id: manifest.capsule_id,
        path: cap_path.to_path_buf(),
        agent_name,
        sections,
    })
}

fn read_agent_name(cap_path: &Path) -> Result<String> {
    let bytes = std::fs::read(cap_path.join("ir.json"))?;
    let ir: serde_json::Value = serde_json::from_slice(&bytes)?;
    Ok(ir["clawfile"]["agent"]["name"]
        .as_str()
        .unwrap_or_default()
        .to_string())
}

fn diff_capsules(left: &CapsuleMaterial, right: &CapsuleMaterial) -> DiffResult {
    let mut result = DiffResult {
        left: DiffRef {
            id: left.id.clone(),
            path: left.path.clone(),
            agent_name: left.agent_name.clone(),
        },
        right: DiffRef {
            id: right.id.clone(),
            path: right.path.clone(),
            agent_name: right.agent_name.clone(),
        },
        sections: Vec::new(),
        equal: true,
    };
    for ((name, left_value), (_, right_value)) in left.sections.iter().zip(&right.sections) {
        let section = diff_section(name, left_value, right_value);
        if !section.equal {
            result.equal = false;
        }
        result.sections.push(section);
    }
    result
}

fn diff_section(name: &str, left: &serde_json::Value, right: &serde_json::Value) -> SectionDiff {
    let mut left_flat = BTreeMap::new();
    let mut right_flat = BTreeMap::new();
    flatten("", left, &mut left_flat);
    flatten("", right, &mut right_flat);

    let mut section = SectionDiff {
        section: name.to_string(),
        added: Vec::new(),
        removed: Vec::new(),
        changed: Vec::new(),
        equal: true,
    };
    let keys: std::collections::BTreeSet<&String> =
        left_flat.keys().chain(right_flat.keys()).collect();
    for key in keys {
        match (left_flat.get(key), right_flat.get(key)) {
            (Some(old), None) => {
                section.removed.push(JsonChange {
                    path: key.clone(),
                    old: Some(old.clone()),
                    new: None,
                });
                section.equal = false;
            }
            (None, Some(new)) => {
                section.added.push(JsonChange {
                    path: key.clone(),
                    old: None,
                    new: Some(new.clone()),
                });
                section.equal = false;
            }
            (Some(old), Some(new)) if old != new => {
                section.changed.push(JsonChange {
                    path: key.clone(),
                    old: Some(old.clone()),
                    new: Some(new.clone()),
                });
                section.equal = false;
            }
            _ => {}
        }
    }
    section
}

/// Flattens a JSON tree into `path -> leaf` pairs; empty containers keep
/// their own entry so additions/removals of whole sections still show.
fn flatten(path: &str, value: &serde_json::Value, out: &mut BTreeMap<String, serde_json::Value>) {
    match value {
        serde_json::Value::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let next = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                flatten(&next, child, out);
            }
        }
        serde_json::Value::Array(items) if !items.is_empty() => {
            for (index, item) in items.iter().enumerate() {
                let next = if path.is_empty() {
                    format!("[{index}]")
                } else {
                    format!("{path}[{index}]")
                };
                flatten(&next, item, out);
            }
        }
        other => {
            let key = if path.is_empty() { "$" } else { path };
            out.insert(key.to_string(), other.clone());
        }
    }
}

fn render(value: &Option<serde_json::Value>) -> String {
    value
        .as_ref()
        .map_or_else(|| "null".to_string(), ToString::to_string)
}
