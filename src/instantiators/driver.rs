//! Tuple generation: base questions in, one tuple file per checker out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::Instantiator;
use crate::checkers::pipeline::{instantiate_batch, seed_bundles};
use crate::checkers::Checker;
use crate::data::tuples::{read_jsonl, tuple_path, JsonlWriter};
use crate::data::types::Question;
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstantiationReport {
    pub path: PathBuf,
    pub written: usize,
    /// skip reason -> count.
    pub skipped: BTreeMap<String, usize>,
}

/// Build up to `limit` tuples for `checker` from the questions in
/// `base_path` and write them to `<tuple_dir>/<Checker>.jsonl`.
///
/// Bundles whose instantiation fails locally are discarded; other errors
/// abort and leave the tuples written so far on disk.
pub async fn generate_tuples(
    checker: &dyn Checker,
    base_path: &Path,
    tuple_dir: &Path,
    instantiator: &Instantiator,
    limit: Option<usize>,
) -> Result<InstantiationReport> {
    let questions: Vec<Question> = read_jsonl(base_path)?;
    let mut bundles = seed_bundles(checker, &questions);
    if let Some(limit) = limit {
        bundles.truncate(limit);
    }
    info!(
        "{}: instantiating {} tuples from {} base questions",
        checker.name(),
        bundles.len(),
        questions.len()
    );

    let path = tuple_path(tuple_dir, checker.name());
    let mut writer = JsonlWriter::create(&path)?;
    let mut report = InstantiationReport {
        path: path.clone(),
        ..Default::default()
    };

    for result in instantiate_batch(checker, &bundles, instantiator).await {
        match result {
            Ok(tuple) => {
                writer.append(&tuple)?;
                report.written += 1;
            }
            Err(e) if e.is_local() => {
                warn!("{}: discarding bundle: {}", checker.name(), e);
                *report.skipped.entry(e.kind_label().to_string()).or_default() += 1;
            }
            Err(e) => return Err(e),
        }
    }

    info!("{}: wrote {} tuples to {}", checker.name(), report.written, path.display());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkers::CheckerKind;
    use crate::config::InstantiationConfig;
    use crate::data::types::ForecastTuple;
    use crate::llm::generator::testing::FnGenerator;
    use crate::llm::GenerationRequest;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_generate_discards_unverifiable_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.jsonl");
        let mut writer = JsonlWriter::create(&base_path).unwrap();
        for title in ["Will A happen?", "Will B happen?", "Will C happen?"] {
            let q = Question::binary(title, "Resolves as stated.", Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap());
            writer.append(&q).unwrap();
        }

        // Negations of B never verify
        let generator = FnGenerator::new(|request: &GenerationRequest| {
            if request.schema.name == "VerificationResult" {
                let ok = !request.prompt.contains("Will B happen?");
                return Ok(json!({"valid": ok, "score": if ok { 1.0 } else { 0.0 }}));
            }
            Ok(json!({"title": "Negated?", "body": "Resolves yes if not."}))
        });
        let instantiator = Instantiator::new(Arc::new(generator), InstantiationConfig::default());

        let report = generate_tuples(
            CheckerKind::Neg.checker(),
            &base_path,
            &dir.path().join("tuples"),
            &instantiator,
            None,
        )
        .await
        .unwrap();
        assert_eq!(report.written, 2);
        assert_eq!(report.skipped["instantiation_failed"], 1);

        let tuples: Vec<ForecastTuple> = read_jsonl(&report.path).unwrap();
        assert_eq!(tuples[0].get("P").unwrap().title, "Will A happen?");
        assert_eq!(tuples[1].get("P").unwrap().title, "Will C happen?");
        assert_eq!(tuples[1].metadata.checker, "NegChecker");
    }
}
