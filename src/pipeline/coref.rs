//! Coreference batching: one speaker-tagged blob per cluster, split back into one resolved
//! text per member.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, error};

use super::{Attempt, StageOutcome};
use crate::clients::{CorefEngine, CorefResolution, CorefSegment};
use crate::error::{PipelineError, PipelineResult};
use crate::store::models::{ClusterMember, ResolvedMessage};

static SPEAKER_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^.+ said $").expect("compile speaker tag regex"));

/// Tag used for members whose author has no known display name.
const UNKNOWN_SPEAKER: &str = "Someone";

/// Builds the blob `<speaker> said "<text>." ` for every member, plus the structured segments.
///
/// Double quotes inside names and texts become single quotes so that `"` only delimits turns.
#[must_use]
pub(crate) fn build_blob(members: &[ClusterMember]) -> (String, Vec<CorefSegment>) {
    let mut blob = String::new();
    let mut segments = Vec::with_capacity(members.len());
    for member in members {
        let speaker = if member.speaker.trim().is_empty() {
            UNKNOWN_SPEAKER.to_string()
        } else {
            member.speaker.replace('"', "'")
        };
        let text = member.content.replace('"', "'");
        blob.push_str(&speaker);
        blob.push_str(" said \"");
        blob.push_str(&text);
        blob.push_str(".\" ");
        segments.push(CorefSegment { speaker, text });
    }
    (blob, segments)
}

/// Splits resolved blob text back into exactly `expected` contents, positionally.
///
/// The text must split on `"` into `2 * expected + 1` pieces; every even piece before the
/// trailing remnant must be a speaker tag and every odd piece is content, which loses one
/// trailing period. Content that itself looks like a speaker tag is still content.
///
/// # Errors
/// [`PipelineError::AttributionFailure`] on any count or tag mismatch.
pub fn recombine(resolved: &str, expected: usize) -> PipelineResult<Vec<String>> {
    let pieces: Vec<&str> = resolved.split('"').collect();
    if pieces.len() != 2 * expected + 1 {
        return Err(PipelineError::AttributionFailure(format!(
            "coreference output has {} quote-delimited pieces, expected {} for {expected} messages",
            pieces.len(),
            2 * expected + 1
        )));
    }

    let mut contents = Vec::with_capacity(expected);
    for (index, pair) in pieces[..2 * expected].chunks(2).enumerate() {
        let (tag, content) = (pair[0], pair[1]);
        if !SPEAKER_TAG_RE.is_match(tag) {
            return Err(PipelineError::AttributionFailure(format!(
                "piece before message {index} is not a speaker tag: {tag:?}"
            )));
        }
        contents.push(content.strip_suffix('.').unwrap_or(content).to_string());
    }
    Ok(contents)
}

/// Resolved text for every member, preferring per-segment output when it lines up.
///
/// # Errors
/// [`PipelineError::AttributionFailure`] when neither path yields one text per member.
pub(crate) fn resolved_contents(
    resolution: &CorefResolution,
    expected: usize,
) -> PipelineResult<Vec<String>> {
    match &resolution.segments {
        Some(segments) if segments.len() == expected => Ok(segments
            .iter()
            .map(|segment| segment.text.clone())
            .collect()),
        _ => recombine(&resolution.resolved, expected),
    }
}

/// Stage 4 handler.
pub(crate) struct CorefBatcher {
    engine: Arc<dyn CorefEngine>,
}

impl CorefBatcher {
    pub(crate) fn new(engine: Arc<dyn CorefEngine>) -> Self {
        Self { engine }
    }

    pub(crate) async fn run(&self, attempt: &mut Attempt<'_>) -> PipelineResult<StageOutcome> {
        let clusters = attempt.dao().list_clusters(attempt.channel_id()).await?;

        for cluster in &clusters {
            if attempt.cancelled().await? {
                return Ok(StageOutcome::Stopped);
            }

            let (blob, segments) = build_blob(&cluster.members);
            let resolution = self
                .engine
                .resolve(&blob, &segments)
                .await
                .map_err(PipelineError::external("coref"))?;

            let contents = resolved_contents(&resolution, cluster.members.len()).inspect_err(
                |err| {
                    attempt.metrics().attribution_failures.inc();
                    error!(
                        channel_id = %attempt.channel_id(),
                        cluster_id = cluster.id,
                        error = %err,
                        "coreference output could not be attributed"
                    );
                },
            )?;

            let resolved: Vec<ResolvedMessage> = cluster
                .members
                .iter()
                .zip(contents)
                .map(|(member, content)| ResolvedMessage {
                    message_id: member.message_id.clone(),
                    author_id: member.author_id.clone(),
                    content,
                })
                .collect();

            attempt
                .dao()
                .insert_resolved(attempt.lease(), cluster.id, &resolved)
                .await?;
            attempt
                .metrics()
                .messages_resolved
                .inc_by(resolved.len() as f64);
            attempt.commit_unit().await?;
            debug!(
                channel_id = %attempt.channel_id(),
                cluster_id = cluster.id,
                members = resolved.len(),
                "cluster resolved"
            );
        }

        Ok(StageOutcome::Completed)
    }
}
