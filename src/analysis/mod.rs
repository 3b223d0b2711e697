pub mod contract;
pub mod upload;

use base64::{ engine::general_purpose::STANDARD, Engine as _ };
use chrono::{ DateTime, Local, SecondsFormat, Utc };
use log::{ error, info, warn };
use std::sync::atomic::{ AtomicI64, Ordering };
use std::sync::Arc;
use std::time::Duration;

use crate::error::AppError;
use crate::llm::{ StructuredRequest, VisionClient };
use crate::models::report::AnalysisReport;
use self::contract::{ parse_report_body, response_schema, ANALYSIS_INSTRUCTIONS };
use self::upload::validate_upload;

pub use self::upload::{ ALLOWED_MIME_TYPES, MAX_UPLOAD_BYTES };

pub const ANALYSIS_FAILED_MESSAGE: &str =
    "Failed to analyze the image. The model may be unable to process this specific image or there might be a network issue.";

/// Hands out strictly increasing creation instants so report ids stay unique
/// even when two analyses finish within the clock's resolution.
#[derive(Default)]
struct ReportClock {
    last_nanos: AtomicI64,
}

impl ReportClock {
    fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = self.last_nanos.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match
                self.last_nanos.compare_exchange_weak(
                    last,
                    candidate,
                    Ordering::Relaxed,
                    Ordering::Relaxed
                )
            {
                Ok(_) => {
                    return DateTime::from_timestamp_nanos(candidate);
                }
                Err(actual) => {
                    last = actual;
                }
            }
        }
    }
}

fn display_date(created: DateTime<Utc>) -> String {
    created.with_timezone(&Local).format("%-m/%-d/%Y, %-I:%M:%S %p").to_string()
}

/// Turns an uploaded photo into an [`AnalysisReport`] via the external
/// classification capability. Holds no queue: each call is one request.
pub struct AnalysisGateway {
    client: Arc<dyn VisionClient>,
    max_upload_bytes: usize,
    timeout: Option<Duration>,
    clock: ReportClock,
}

impl AnalysisGateway {
    /// `max_upload_bytes` may tighten the upload limit but never raise it past
    /// [`MAX_UPLOAD_BYTES`].
    pub fn new(client: Arc<dyn VisionClient>, max_upload_bytes: usize, timeout: Option<Duration>) -> Self {
        if max_upload_bytes > MAX_UPLOAD_BYTES {
            warn!(
                "Upload limit {} exceeds the {} byte ceiling; using the ceiling",
                max_upload_bytes,
                MAX_UPLOAD_BYTES
            );
        }
        Self {
            client,
            max_upload_bytes: max_upload_bytes.min(MAX_UPLOAD_BYTES),
            timeout,
            clock: ReportClock::default(),
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    pub async fn analyze(&self, image: &[u8], mime_type: &str) -> Result<AnalysisReport, AppError> {
        let mime_type = validate_upload(image, mime_type, self.max_upload_bytes)?;
        let image_base64 = STANDARD.encode(image);
        info!("Analyzing {} byte {} image", image.len(), mime_type);

        let request = StructuredRequest {
            instructions: ANALYSIS_INSTRUCTIONS.to_string(),
            image_base64: image_base64.clone(),
            mime_type: mime_type.clone(),
            response_schema: response_schema(),
        };

        let call = self.client.generate_structured(request);
        let reply = match self.timeout {
            Some(limit) =>
                match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(format!("no reply within {:?}", limit).into()),
                }
            None => call.await,
        };
        let text = reply.map_err(|e| {
            error!("Error analyzing skin condition: {}", e);
            AppError::AnalysisFailed(ANALYSIS_FAILED_MESSAGE.to_string())
        })?;

        let body = parse_report_body(&text).map_err(|e| {
            error!("Error analyzing skin condition: non-conforming reply: {}", e);
            AppError::AnalysisFailed(ANALYSIS_FAILED_MESSAGE.to_string())
        })?;

        let created = self.clock.next();
        let report = AnalysisReport {
            id: created.to_rfc3339_opts(SecondsFormat::Nanos, true),
            date: display_date(created),
            image: format!("data:{};base64,{}", mime_type, image_base64),
            possible_conditions: body.possible_conditions,
            disclaimer: body.disclaimer,
        };
        info!(
            "Analysis {} produced {} possible condition(s)",
            report.id,
            report.possible_conditions.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::BoxError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    struct ScriptedVision {
        reply: Result<String, String>,
        calls: AtomicUsize,
        last_request: Mutex<Option<StructuredRequest>>,
    }

    impl ScriptedVision {
        fn replying(reply: Result<&str, &str>) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.map(str::to_string).map_err(str::to_string),
                calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
            })
        }
    }

    #[async_trait]
    impl VisionClient for ScriptedVision {
        async fn generate_structured(&self, request: StructuredRequest) -> Result<String, BoxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);
            self.reply.clone().map_err(|e| e.into())
        }
    }

    const GOOD_REPLY: &str = r#"{
        "possible_conditions": [
            {"name": "Acne", "confidence_score": 140, "description": "Clogged pores."},
            {"name": "Rosacea", "confidence_score": -5, "description": "Facial redness."}
        ],
        "disclaimer": "This is not a medical diagnosis."
    }"#;

    #[tokio::test]
    async fn builds_a_complete_report() {
        let vision = ScriptedVision::replying(Ok(GOOD_REPLY));
        let gateway = AnalysisGateway::new(vision.clone(), MAX_UPLOAD_BYTES, None);

        let report = gateway.analyze(&[0xFF, 0xD8, 0xFF], "image/jpeg").await.unwrap();
        assert_eq!(report.image, "data:image/jpeg;base64,/9j/");
        assert_eq!(report.possible_conditions[0].confidence_score, 100.0);
        assert_eq!(report.possible_conditions[1].confidence_score, 0.0);
        assert_eq!(report.disclaimer, "This is not a medical diagnosis.");
        assert!(!report.date.is_empty());

        let request = vision.last_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.image_base64, "/9j/");
        assert_eq!(request.mime_type, "image/jpeg");
    }

    #[tokio::test]
    async fn report_ids_are_unique() {
        let gateway = AnalysisGateway::new(ScriptedVision::replying(Ok(GOOD_REPLY)), MAX_UPLOAD_BYTES, None);
        let first = gateway.analyze(&[1], "image/png").await.unwrap();
        let second = gateway.analyze(&[1], "image/png").await.unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id < second.id);
    }

    #[tokio::test]
    async fn oversized_images_never_reach_the_provider() {
        let vision = ScriptedVision::replying(Ok(GOOD_REPLY));
        let gateway = AnalysisGateway::new(vision.clone(), MAX_UPLOAD_BYTES, None);

        let image = vec![0u8; MAX_UPLOAD_BYTES + 1];
        let err = gateway.analyze(&image, "image/png").await.unwrap_err();
        assert!(matches!(err, AppError::OversizedInput { .. }));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn configured_limit_cannot_exceed_the_ceiling() {
        let vision = ScriptedVision::replying(Ok(GOOD_REPLY));
        let gateway = AnalysisGateway::new(vision.clone(), 2 * MAX_UPLOAD_BYTES, None);
        assert_eq!(gateway.max_upload_bytes(), MAX_UPLOAD_BYTES);

        let image = vec![0u8; MAX_UPLOAD_BYTES + 1024 * 1024];
        let err = gateway.analyze(&image, "image/png").await.unwrap_err();
        assert!(matches!(err, AppError::OversizedInput { .. }));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_types_never_reach_the_provider() {
        let vision = ScriptedVision::replying(Ok(GOOD_REPLY));
        let gateway = AnalysisGateway::new(vision.clone(), MAX_UPLOAD_BYTES, None);

        let err = gateway.analyze(&[1, 2], "application/pdf").await.unwrap_err();
        assert!(matches!(err, AppError::UnsupportedMediaType(_)));
        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_errors_become_one_user_safe_failure() {
        let gateway = AnalysisGateway::new(
            ScriptedVision::replying(Err("503 upstream timeout with secret detail")),
            MAX_UPLOAD_BYTES,
            None
        );
        let err = gateway.analyze(&[1], "image/png").await.unwrap_err();
        match err {
            AppError::AnalysisFailed(message) => assert_eq!(message, ANALYSIS_FAILED_MESSAGE),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_replies_become_analysis_failures() {
        for reply in ["not json", r#"{"possible_conditions": "x", "disclaimer": "d"}"#, "{}"] {
            let gateway = AnalysisGateway::new(ScriptedVision::replying(Ok(reply)), MAX_UPLOAD_BYTES, None);
            let err = gateway.analyze(&[1], "image/png").await.unwrap_err();
            assert!(matches!(err, AppError::AnalysisFailed(_)), "{}", reply);
        }
    }

    struct StalledVision;

    #[async_trait]
    impl VisionClient for StalledVision {
        async fn generate_structured(&self, _request: StructuredRequest) -> Result<String, BoxError> {
            futures::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn optional_timeout_turns_a_stall_into_a_failure() {
        let gateway = AnalysisGateway::new(
            Arc::new(StalledVision),
            MAX_UPLOAD_BYTES,
            Some(Duration::from_millis(20))
        );
        let err = gateway.analyze(&[1], "image/png").await.unwrap_err();
        assert!(matches!(err, AppError::AnalysisFailed(_)));
    }

    #[test]
    fn clock_never_repeats() {
        let clock = ReportClock::default();
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }
}
