//! # Gemini Analysis Adapter
//!
//! Talks to the Gemini `generateContent` REST endpoint for the three analysis calls
//! of a session: live chunk scoring (with the slide image as inline data), the final
//! qualitative report, and rubric scoring.
//!
//! ## Response Handling:
//! Models often wrap JSON in code fences or add prose around it. The adapter pulls
//! out the first `{...}` span, deserializes it, and fills every missing or malformed
//! score field with the neutral value. Callers never see a partially-typed result:
//! they get either a complete value or an `EvaluationError`. Live scoring is the
//! exception: a reply with no usable JSON becomes neutral scores, so only a failed
//! request surfaces as an error.

use super::{Analyzer, LiveAnalysis, QualitativeReport, RubricAssessment};
use crate::config::ServicesConfig;
use crate::error::{EvalResult, EvaluationError};
use crate::scoring::rubric::RubricCategory;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, warn};

const LIVE_PROMPT: &str = "You are evaluating a student presentation while it is being given.\n\
Rate the transcript excerpt for content, delivery and engagement on a 0-10 scale, \
taking the attached slide into account when present.\n\
Ask ONE short follow-up question that checks the student's understanding.\n\
Respond with JSON only:\n\
{\"content_score\": number, \"delivery_score\": number, \"engagement_score\": number, \"question\": string}";

const FULL_REPORT_PROMPT: &str = "You are reviewing the complete transcript of a student presentation.\n\
List exactly three strengths and exactly three improvements, each tied to one of the \
metrics content, delivery or engagement.\n\
Respond with JSON only:\n\
{\"strengths\": [{\"metric\": string, \"observation\": string}], \
\"improvements\": [{\"metric\": string, \"recommendation\": string}]}";

/// Analyzer backed by the Gemini REST API.
pub struct GeminiAnalyzer {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    neutral_score: f64,
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum Part {
    Text(String),
    InlineData(InlineData),
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GeminiAnalyzer {
    pub fn new(services: &ServicesConfig, neutral_score: f64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(services.request_timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: services.analysis_base_url.trim_end_matches('/').to_string(),
            model: services.analysis_model.clone(),
            api_key: services.analysis_api_key.trim().to_string(),
            neutral_score,
        })
    }

    /// Send one prompt and return the concatenated text of the first candidate.
    async fn generate(&self, parts: Vec<Part>) -> EvalResult<String> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);
        let body = GenerateRequest {
            contents: vec![Content { parts }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EvaluationError::TransientUpstreamFailure(format!("analysis request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(EvaluationError::TransientUpstreamFailure(format!(
                "analysis service returned {}: {}",
                status, error_text
            )));
        }

        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| EvaluationError::MalformedUpstreamResponse(format!("analysis body: {}", e)))?;

        let text: String = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| {
                content
                    .parts
                    .into_iter()
                    .filter_map(|part| part.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(EvaluationError::MalformedUpstreamResponse(
                "analysis response contained no text".to_string(),
            ));
        }

        debug!(chars = text.len(), "Analysis response received");
        Ok(text)
    }

    async fn generate_json(&self, parts: Vec<Part>) -> EvalResult<Value> {
        let text = self.generate(parts).await?;
        extract_json(&text).ok_or_else(|| {
            EvaluationError::MalformedUpstreamResponse("no JSON object in analysis response".to_string())
        })
    }
}

#[async_trait]
impl Analyzer for GeminiAnalyzer {
    async fn analyze_chunk(&self, fragment: &str, slide: Option<&str>) -> EvalResult<LiveAnalysis> {
        if !self.is_configured() {
            return Ok(LiveAnalysis::neutral(self.neutral_score));
        }

        let mut parts = vec![Part::Text(format!("{}\n\nTranscript: {}", LIVE_PROMPT, fragment))];
        if let Some(slide) = slide.filter(|s| !s.trim().is_empty()) {
            let (mime_type, data) = split_data_url(slide);
            parts.push(Part::InlineData(InlineData {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            }));
        }

        // An empty or unparsable reply still yields scores; only transport and
        // HTTP status failures reach the worker as errors.
        match self.generate_json(parts).await {
            Ok(value) => Ok(parse_live_analysis(&value, self.neutral_score)),
            Err(EvaluationError::MalformedUpstreamResponse(reason)) => {
                warn!(reason = %reason, "Live analysis reply unusable, using neutral scores");
                Ok(LiveAnalysis::neutral(self.neutral_score))
            }
            Err(e) => Err(e),
        }
    }

    async fn analyze_full(&self, transcript: &str) -> EvalResult<QualitativeReport> {
        if !self.is_configured() {
            return Err(EvaluationError::TransientUpstreamFailure(
                "analysis service not configured".to_string(),
            ));
        }

        let prompt = format!("{}\n\nTranscript: {}", FULL_REPORT_PROMPT, transcript);
        let value = self.generate_json(vec![Part::Text(prompt)]).await?;
        parse_qualitative_report(&value)
    }

    async fn score_rubric(
        &self,
        transcript: &str,
        questions: &[String],
        rubric: &[RubricCategory],
    ) -> EvalResult<RubricAssessment> {
        if !self.is_configured() {
            return Err(EvaluationError::TransientUpstreamFailure(
                "analysis service not configured".to_string(),
            ));
        }

        let value = self
            .generate_json(vec![Part::Text(rubric_prompt(transcript, questions, rubric))])
            .await?;
        parse_rubric_assessment(&value)
    }

    fn is_configured(&self) -> bool {
        !self.api_key.is_empty()
    }
}

fn rubric_prompt(transcript: &str, questions: &[String], rubric: &[RubricCategory]) -> String {
    let categories = rubric
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {} ({} points)", i + 1, c.name, c.max_score))
        .collect::<Vec<_>>()
        .join("\n");

    let questions = if questions.is_empty() {
        "none".to_string()
    } else {
        questions.join("\n- ")
    };

    format!(
        "Score this presentation against the rubric below, never exceeding a category's points.\n\
         Give one sentence of feedback per category.\n\n\
         Transcript:\n{}\n\nQuestions asked during the presentation:\n- {}\n\nRubric:\n{}\n\n\
         Respond with JSON only, using the category names as keys:\n\
         {{\"scores\": {{\"<category>\": number}}, \"feedback\": {{\"<category>\": string}}}}",
        transcript, questions, categories
    )
}

/// Find the JSON object in a model reply.
///
/// Accepts a bare object, an object inside a code fence, or an object surrounded
/// by prose. Only objects are returned.
pub(crate) fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }

    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Read a score that may arrive as a number or a numeric string.
fn score_field(value: &Value, key: &str) -> Option<f64> {
    numeric(value.get(key)?)
}

fn numeric(raw: &Value) -> Option<f64> {
    let score = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    score.is_finite().then_some(score)
}

pub(crate) fn parse_live_analysis(value: &Value, neutral: f64) -> LiveAnalysis {
    let question = value
        .get("question")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string);

    LiveAnalysis {
        content_score: score_field(value, "content_score").unwrap_or(neutral),
        delivery_score: score_field(value, "delivery_score").unwrap_or(neutral),
        engagement_score: score_field(value, "engagement_score").unwrap_or(neutral),
        question,
    }
}

pub(crate) fn parse_qualitative_report(value: &Value) -> EvalResult<QualitativeReport> {
    let mut report: QualitativeReport = serde_json::from_value(value.clone())
        .map_err(|e| EvaluationError::MalformedUpstreamResponse(format!("final report: {}", e)))?;

    report.strengths.truncate(QualitativeReport::ITEMS);
    report.improvements.truncate(QualitativeReport::ITEMS);

    if !report.is_complete() {
        warn!(
            strengths = report.strengths.len(),
            improvements = report.improvements.len(),
            "Final report is missing items"
        );
        return Err(EvaluationError::MalformedUpstreamResponse(
            "final report needs three strengths and three improvements".to_string(),
        ));
    }

    Ok(report)
}

pub(crate) fn parse_rubric_assessment(value: &Value) -> EvalResult<RubricAssessment> {
    let scores_obj = value
        .get("scores")
        .and_then(Value::as_object)
        .ok_or_else(|| EvaluationError::MalformedUpstreamResponse("rubric reply has no scores".to_string()))?;

    let scores: HashMap<String, f64> = scores_obj
        .iter()
        .filter_map(|(name, raw)| numeric(raw).map(|s| (name.clone(), s)))
        .collect();

    let feedback: BTreeMap<String, String> = value
        .get("feedback")
        .and_then(Value::as_object)
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(RubricAssessment { scores, feedback })
}

/// Split `data:image/png;base64,AAAA` into its mime type and payload.
/// Anything that is not a data URL is treated as a base64 PNG.
pub(crate) fn split_data_url(input: &str) -> (&str, &str) {
    if let Some(rest) = input.strip_prefix("data:") {
        if let Some((header, data)) = rest.split_once(',') {
            let mime = header.split(';').next().filter(|m| !m.is_empty()).unwrap_or("image/png");
            return (mime, data);
        }
    }
    ("image/png", input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;

    #[test]
    fn test_extract_json_from_code_fence() {
        let reply = "Here you go:\n```json\n{\"content_score\": 7.5}\n```\nThanks";
        let value = extract_json(reply).unwrap();
        assert_eq!(value["content_score"], json!(7.5));
    }

    #[test]
    fn test_extract_json_rejects_prose() {
        assert!(extract_json("I cannot score this.").is_none());
        assert!(extract_json("} backwards {").is_none());
        assert!(extract_json("[1, 2, 3]").is_none());
    }

    #[test]
    fn test_live_analysis_defaults_missing_fields() {
        let value = json!({
            "content_score": 8,
            "delivery_score": "6.5",
            "engagement_score": "lots",
            "question": "   "
        });
        let analysis = parse_live_analysis(&value, 5.0);
        assert_eq!(analysis.content_score, 8.0);
        assert_eq!(analysis.delivery_score, 6.5);
        assert_eq!(analysis.engagement_score, 5.0);
        assert_eq!(analysis.question, None);
    }

    #[test]
    fn test_qualitative_report_requires_three_items() {
        let short = json!({
            "strengths": [{"metric": "content", "observation": "Solid"}],
            "improvements": []
        });
        assert!(matches!(
            parse_qualitative_report(&short),
            Err(EvaluationError::MalformedUpstreamResponse(_))
        ));

        let fallback = QualitativeReport::fallback();
        let value = serde_json::to_value(&fallback).unwrap();
        assert_eq!(parse_qualitative_report(&value).unwrap(), fallback);
    }

    #[test]
    fn test_rubric_assessment_parsing() {
        let value = json!({
            "scores": {"Project Content": 25, "Algorithm Used": "12", "Bogus": null},
            "feedback": {"Project Content": "Deep coverage"}
        });
        let assessment = parse_rubric_assessment(&value).unwrap();
        assert_eq!(assessment.scores["Project Content"], 25.0);
        assert_eq!(assessment.scores["Algorithm Used"], 12.0);
        assert!(!assessment.scores.contains_key("Bogus"));
        assert_eq!(assessment.feedback["Project Content"], "Deep coverage");

        assert!(parse_rubric_assessment(&json!({"total": 10})).is_err());
    }

    #[test]
    fn test_split_data_url() {
        assert_eq!(split_data_url("data:image/jpeg;base64,QUJD"), ("image/jpeg", "QUJD"));
        assert_eq!(split_data_url("QUJD"), ("image/png", "QUJD"));
    }

    #[tokio::test]
    async fn test_unconfigured_analyzer_degrades() {
        let config = AppConfig::default();
        let analyzer = GeminiAnalyzer::new(&config.services, 5.0).unwrap();
        assert!(!analyzer.is_configured());

        let live = analyzer.analyze_chunk("hello", None).await.unwrap();
        assert_eq!(live, LiveAnalysis::neutral(5.0));

        assert!(analyzer.analyze_full("hello").await.is_err());
        assert!(analyzer.score_rubric("hello", &[], &config.evaluation.rubric).await.is_err());
    }

    /// Answer a single HTTP request with `status` and a JSON `body`, returning the base URL.
    async fn serve_once(status: u16, body: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            // Read the whole request so the client never sees a reset mid-upload.
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request);
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let content_length = text[..header_end]
                        .lines()
                        .filter_map(|line| line.split_once(':'))
                        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
                        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= header_end + 4 + content_length {
                        break;
                    }
                }
            }

            let response = format!(
                "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });

        format!("http://{}", addr)
    }

    fn configured_analyzer(base_url: String) -> GeminiAnalyzer {
        let mut config = AppConfig::default();
        config.services.analysis_base_url = base_url;
        config.services.analysis_api_key = "test-key".to_string();
        GeminiAnalyzer::new(&config.services, 5.0).unwrap()
    }

    #[tokio::test]
    async fn test_prose_reply_yields_neutral_live_scores() {
        let base_url = serve_once(
            200,
            r#"{"candidates":[{"content":{"parts":[{"text":"Sorry, I cannot score this."}]}}]}"#,
        )
        .await;
        let analyzer = configured_analyzer(base_url);

        let live = analyzer.analyze_chunk("hello", None).await.unwrap();
        assert_eq!(live, LiveAnalysis::neutral(5.0));
    }

    #[tokio::test]
    async fn test_empty_reply_yields_neutral_live_scores() {
        let base_url = serve_once(200, r#"{"candidates":[]}"#).await;
        let analyzer = configured_analyzer(base_url);

        let live = analyzer.analyze_chunk("hello", None).await.unwrap();
        assert_eq!(live, LiveAnalysis::neutral(5.0));
    }

    #[tokio::test]
    async fn test_json_reply_is_parsed() {
        let base_url = serve_once(
            200,
            r#"{"candidates":[{"content":{"parts":[{"text":"```json\n{\"content_score\": 9, \"delivery_score\": 4, \"question\": \"How?\"}\n```"}]}}]}"#,
        )
        .await;
        let analyzer = configured_analyzer(base_url);

        let live = analyzer.analyze_chunk("hello", None).await.unwrap();
        assert_eq!(live.content_score, 9.0);
        assert_eq!(live.delivery_score, 4.0);
        assert_eq!(live.engagement_score, 5.0);
        assert_eq!(live.question.as_deref(), Some("How?"));
    }

    #[tokio::test]
    async fn test_http_failure_is_transient_error() {
        let base_url = serve_once(503, r#"{"error":"overloaded"}"#).await;
        let analyzer = configured_analyzer(base_url);

        let err = analyzer.analyze_chunk("hello", None).await.unwrap_err();
        assert!(matches!(err, EvaluationError::TransientUpstreamFailure(_)));
    }
}
