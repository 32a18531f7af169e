//! ID resolver module
//!
//! Resolves job ID prefixes to full UUIDs so users can type short,
//! unambiguous prefixes instead of full IDs.

use anyhow::{Context, Result, anyhow};
use convoy_client::QueueClient;
use uuid::Uuid;

/// Resolve a job ID or prefix to a full UUID
///
/// Full UUIDs are returned as is; prefixes (case-insensitive) are matched
/// against all jobs.
pub async fn resolve_job_id(client: &QueueClient, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let jobs = client
        .list_jobs()
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    match_prefix(jobs.iter().map(|j| j.id), &input.to_lowercase())
}

fn match_prefix(ids: impl Iterator<Item = Uuid>, prefix: &str) -> Result<Uuid> {
    let matches: Vec<Uuid> = ids
        .filter(|id| id.to_string().starts_with(prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Uuid {
        Uuid::parse_str(s).unwrap()
    }

    #[test]
    fn test_prefix_matching() {
        let ids = [
            id("3f1c0000-0000-4000-8000-000000000001"),
            id("3f2d0000-0000-4000-8000-000000000002"),
            id("a0000000-0000-4000-8000-000000000003"),
        ];

        assert_eq!(match_prefix(ids.into_iter(), "a").unwrap(), ids[2]);
        assert_eq!(match_prefix(ids.into_iter(), "3f2").unwrap(), ids[1]);

        let ambiguous = match_prefix(ids.into_iter(), "3f").unwrap_err();
        assert!(ambiguous.to_string().contains("Ambiguous"));

        assert!(match_prefix(ids.into_iter(), "ff").is_err());
    }
}
