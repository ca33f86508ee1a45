// CLI commands for running and grading challenges locally
use anyhow::{bail, Context, Result};
use mastery_common::content::ChallengeCatalog;
use mastery_common::types::{Challenge, GradeVerdict, Track};
use mastery_sandbox::{SandboxSession, TrackConfigManager};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Load track settings from an explicit file, or the default location
pub fn load_tracks(path: Option<&Path>) -> Result<TrackConfigManager> {
    let tracks = match path {
        Some(path) => TrackConfigManager::load(path)?,
        None => TrackConfigManager::load_default()?,
    };
    Ok(tracks.with_env_overrides())
}

fn read_source(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

async fn open_session(tracks: &TrackConfigManager, track: Track) -> Result<SandboxSession> {
    let session = SandboxSession::for_track(track, tracks)?;
    session
        .initialize()
        .await
        .with_context(|| format!("Failed to start the {} sandbox", track))?;
    Ok(session)
}

/// Execute a file and print the raw execution result
pub async fn run_file(
    tracks: &TrackConfigManager,
    track: Track,
    seed: Option<&Path>,
    file: &Path,
) -> Result<()> {
    let source = read_source(file)?;
    let session = open_session(tracks, track).await?;

    if let Some(seed_path) = seed {
        if track != Track::Sql {
            bail!("--seed only applies to the sql track");
        }
        let seed = read_source(seed_path)?;
        let report = session.initialize_database(&seed).await?;
        eprintln!(
            "🗄️  Database seeded ({}): {}",
            report.checkpoint.describe(),
            report.tables.join(", ")
        );
    }

    let result = session.execute(&source).await?;
    session.close();

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to serialize result")?
    );
    Ok(())
}

/// Pick a challenge by id, or the only/first one when no id is given
pub fn pick_challenge(challenges: Vec<Challenge>, id: Option<&str>) -> Result<Challenge> {
    match id {
        Some(id) => challenges
            .into_iter()
            .find(|c| c.id == id)
            .with_context(|| format!("Challenge '{}' not found in file", id)),
        None => challenges
            .into_iter()
            .next()
            .context("Challenge file holds no challenges"),
    }
}

fn print_verdict(challenge: &Challenge, verdict: &GradeVerdict) {
    let mark = if verdict.passed { "✅" } else { "❌" };
    println!(
        "{} {} [{}] score {}: {}",
        mark, challenge.id, challenge.track(), verdict.score, verdict.feedback
    );
    for test in verdict.tests.iter().filter(|t| !t.passed) {
        println!(
            "  ✗ {}: {}",
            test.name,
            test.error.as_deref().unwrap_or("failed")
        );
    }
    for hint in &verdict.hints {
        println!("  💡 {}", hint);
    }
}

/// Grade a source file against one challenge. Returns whether it passed.
pub async fn grade_file(
    tracks: &TrackConfigManager,
    challenge_file: &Path,
    id: Option<&str>,
    file: &Path,
) -> Result<bool> {
    let challenge = pick_challenge(ChallengeCatalog::load_file(challenge_file)?, id)?;
    let source = read_source(file)?;

    println!("📝 Grading {} against {}", file.display(), challenge.id);

    let session = open_session(tracks, challenge.track()).await?;
    let submission = session.submit(&challenge, &source).await?;
    session.close();

    print_verdict(&challenge, &submission.verdict);
    Ok(submission.verdict.passed)
}

/// Grade every reference solution in a catalog, one session per track.
/// Returns the failing challenges with their verdicts.
pub async fn check_catalog(
    tracks: &TrackConfigManager,
    catalog: &ChallengeCatalog,
) -> Result<Vec<(String, GradeVerdict)>> {
    let mut sessions: HashMap<Track, SandboxSession> = HashMap::new();
    let mut failures = Vec::new();

    for challenge in catalog.all() {
        let track = challenge.track();
        if !sessions.contains_key(&track) {
            sessions.insert(track, open_session(tracks, track).await?);
        }
        let Some(session) = sessions.get(&track) else {
            continue;
        };

        let submission = session
            .submit(challenge, &challenge.solution)
            .await
            .with_context(|| format!("Sandbox failed while checking {}", challenge.id))?;

        print_verdict(challenge, &submission.verdict);
        if !submission.verdict.passed {
            failures.push((challenge.id.clone(), submission.verdict));
        }
    }

    for session in sessions.values() {
        session.close();
    }
    Ok(failures)
}

/// Check a content directory. Returns the number of failing solutions.
pub async fn check_content(tracks: &TrackConfigManager, dir: &Path) -> Result<usize> {
    let catalog = ChallengeCatalog::load_dir(dir)?;
    println!("🔍 Checking {} challenge(s) in {}\n", catalog.len(), dir.display());

    let failures = check_catalog(tracks, &catalog).await?;

    if failures.is_empty() {
        println!("\n✅ All {} reference solution(s) pass", catalog.len());
    } else {
        println!("\n❌ {} of {} reference solution(s) failed:", failures.len(), catalog.len());
        for (id, _) in &failures {
            println!("  - {}", id);
        }
    }
    Ok(failures.len())
}

/// Print the catalog in order
pub fn list_challenges(dir: &Path, track: Option<Track>) -> Result<()> {
    let catalog = ChallengeCatalog::load_dir(dir)?;
    let shown: Vec<&Challenge> = catalog
        .all()
        .iter()
        .filter(|c| track.map_or(true, |t| c.track() == t))
        .collect();

    if shown.is_empty() {
        println!("No challenges found.");
        return Ok(());
    }

    println!("📋 Challenges:\n");
    println!(
        "{:<24} {:<8} {:<12} {:<5} {:<6} {}",
        "ID", "TRACK", "MODULE", "DAY", "TESTS", "TITLE"
    );
    println!("{}", "─".repeat(90));
    for c in &shown {
        println!(
            "{:<24} {:<8} {:<12} {:<5} {:<6} {}",
            c.id,
            c.track().as_str(),
            c.module,
            c.day,
            c.test_count(),
            c.title
        );
    }
    println!("\n✅ Total: {} challenge(s)", shown.len());
    Ok(())
}
