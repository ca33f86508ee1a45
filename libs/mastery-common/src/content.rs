// Challenge content loading
// Static JSON content, loaded once and never mutated at runtime

use crate::types::{Challenge, Track};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

#[derive(Deserialize)]
#[serde(untagged)]
enum ContentFile {
    Many(Vec<Challenge>),
    One(Box<Challenge>),
}

/// Ordered, id-indexed set of challenges
#[derive(Debug, Clone, Default)]
pub struct ChallengeCatalog {
    challenges: Vec<Challenge>,
    by_id: HashMap<String, usize>,
}

impl ChallengeCatalog {
    /// Build a catalog, ordering by (module, day, order) and rejecting duplicate ids.
    /// Modules compare in natural order, so `week-2` comes before `week-10`.
    pub fn from_challenges(mut challenges: Vec<Challenge>) -> Result<Self> {
        challenges.sort_by(|a, b| {
            natural_cmp(&a.module, &b.module).then((a.day, a.order).cmp(&(b.day, b.order)))
        });

        let mut by_id = HashMap::new();
        for (idx, challenge) in challenges.iter().enumerate() {
            if by_id.insert(challenge.id.clone(), idx).is_some() {
                bail!("Duplicate challenge id: {}", challenge.id);
            }
        }

        Ok(Self { challenges, by_id })
    }

    /// Load a single JSON file holding one challenge or an array of them
    pub fn load_file(path: &Path) -> Result<Vec<Challenge>> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let parsed: ContentFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;

        Ok(match parsed {
            ContentFile::Many(list) => list,
            ContentFile::One(challenge) => vec![*challenge],
        })
    }

    /// Load every `*.json` file under a directory (recursively)
    pub fn load_dir(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            bail!("Content directory not found: {}", dir.display());
        }

        let mut challenges = Vec::new();
        collect_json(dir, &mut challenges)?;

        let catalog = Self::from_challenges(challenges)?;
        info!(
            dir = %dir.display(),
            challenges = catalog.len(),
            "Loaded challenge content"
        );
        Ok(catalog)
    }

    pub fn get(&self, id: &str) -> Option<&Challenge> {
        self.by_id.get(id).map(|&idx| &self.challenges[idx])
    }

    pub fn all(&self) -> &[Challenge] {
        &self.challenges
    }

    pub fn by_track(&self, track: Track) -> impl Iterator<Item = &Challenge> {
        self.challenges.iter().filter(move |c| c.track() == track)
    }

    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }

    /// Next challenge on the same track, in catalog order
    pub fn next_id(&self, current: &str) -> Option<&str> {
        let challenge = self.get(current)?;
        let track = challenge.track();
        let ids: Vec<&str> = self.by_track(track).map(|c| c.id.as_str()).collect();
        let idx = ids.iter().position(|id| *id == current)?;
        ids.get(idx + 1).copied()
    }

    /// Previous challenge on the same track, in catalog order
    pub fn previous_id(&self, current: &str) -> Option<&str> {
        let challenge = self.get(current)?;
        let track = challenge.track();
        let ids: Vec<&str> = self.by_track(track).map(|c| c.id.as_str()).collect();
        let idx = ids.iter().position(|id| *id == current)?;
        idx.checked_sub(1).and_then(|prev| ids.get(prev).copied())
    }
}

/// Compare digit runs by value and everything else as text
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut left, mut right) = (a, b);
    loop {
        match (left.is_empty(), right.is_empty()) {
            (true, true) => return a.cmp(b),
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }

        let (l_run, l_rest) = split_run(left);
        let (r_run, r_rest) = split_run(right);
        let both_digits = l_run.starts_with(|c: char| c.is_ascii_digit())
            && r_run.starts_with(|c: char| c.is_ascii_digit());

        let ord = if both_digits {
            let l_num = l_run.trim_start_matches('0');
            let r_num = r_run.trim_start_matches('0');
            l_num.len().cmp(&r_num.len()).then_with(|| l_num.cmp(r_num))
        } else {
            l_run.cmp(r_run)
        };
        if ord != Ordering::Equal {
            return ord;
        }
        left = l_rest;
        right = r_rest;
    }
}

/// Leading run of all-digit or all-non-digit characters
fn split_run(s: &str) -> (&str, &str) {
    let digits = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != digits)
        .unwrap_or(s.len());
    s.split_at(end)
}

fn collect_json(dir: &Path, out: &mut Vec<Challenge>) -> Result<()> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            collect_json(&path, out)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            let loaded = ChallengeCatalog::load_file(&path)?;
            debug!(file = %path.display(), count = loaded.len(), "Loaded content file");
            out.extend(loaded);
        }
    }
    Ok(())
}
