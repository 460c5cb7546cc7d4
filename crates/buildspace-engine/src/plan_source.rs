use std::time::Duration;

use async_trait::async_trait;
use buildspace_core::plan::{parse_plan_context, LearningPlan};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum PlanSourceError {
    #[error("invalid plan id: {0:?}")]
    InvalidPlanId(String),
    #[error("backend returned {status}")]
    Status { status: reqwest::StatusCode },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Where learning-plan context comes from.
#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn fetch(&self, plan_id: &str) -> Result<LearningPlan, PlanSourceError>;
}

/// Fetches `GET <backend>/api/context/learning-plan/<plan_id>` and parses the
/// plain-text context it returns.
pub struct HttpPlanSource {
    client: reqwest::Client,
    backend_url: String,
}

impl HttpPlanSource {
    pub fn new(backend_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("buildspace/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            backend_url: backend_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn backend_url(&self) -> &str {
        &self.backend_url
    }

    fn plan_url(&self, plan_id: &str) -> Result<String, PlanSourceError> {
        let valid = !plan_id.is_empty()
            && plan_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PlanSourceError::InvalidPlanId(plan_id.to_string()));
        }
        Ok(format!("{}/api/context/learning-plan/{}", self.backend_url, plan_id))
    }
}

#[async_trait]
impl PlanSource for HttpPlanSource {
    #[tracing::instrument(skip(self), fields(backend = %self.backend_url))]
    async fn fetch(&self, plan_id: &str) -> Result<LearningPlan, PlanSourceError> {
        let url = self.plan_url(plan_id)?;
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PlanSourceError::Status { status });
        }

        let body = response.text().await?;
        // Some backends wrap the context in a JSON string.
        let text = match serde_json::from_str::<String>(&body) {
            Ok(inner) => inner,
            Err(_) => body,
        };

        let plan = parse_plan_context(&text);
        tracing::debug!(milestones = plan.milestones.len(), "Plan context fetched");
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::Router;

    const PLAN: &str = "Project: Todo App\nDuration: 5 days\nSkill Level: Beginner\nMilestones so far:\nM1 [DONE]: Setup -> Initialize repo\nM2 [PENDING]: API -> Build REST endpoints\n";

    async fn serve_backend() -> String {
        async fn plan(Path(id): Path<String>) -> Result<String, StatusCode> {
            match id.as_str() {
                "plan-1" => Ok(PLAN.to_string()),
                "quoted" => Ok(serde_json::to_string(PLAN).unwrap()),
                _ => Err(StatusCode::NOT_FOUND),
            }
        }

        let app = Router::new().route("/api/context/learning-plan/{id}", get(plan));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn fetches_and_parses_plan() {
        let source = HttpPlanSource::new(serve_backend().await);
        let plan = source.fetch("plan-1").await.unwrap();
        assert_eq!(plan.project_name, "Todo App");
        assert_eq!(plan.milestones.len(), 2);
        assert_eq!(plan.current_milestone().unwrap().sequence_number, 2);
    }

    #[tokio::test]
    async fn unwraps_json_string_bodies() {
        let source = HttpPlanSource::new(serve_backend().await);
        let plan = source.fetch("quoted").await.unwrap();
        assert_eq!(plan.duration_days, 5);
    }

    #[tokio::test]
    async fn non_success_status_is_error() {
        let source = HttpPlanSource::new(serve_backend().await);
        let err = source.fetch("missing").await.unwrap_err();
        assert!(matches!(err, PlanSourceError::Status { status } if status == StatusCode::NOT_FOUND));
    }

    #[tokio::test]
    async fn plan_ids_are_validated() {
        let source = HttpPlanSource::new("http://127.0.0.1:9");
        for bad in ["", "../admin", "a/b", "id?x=1"] {
            assert!(matches!(
                source.fetch(bad).await,
                Err(PlanSourceError::InvalidPlanId(_))
            ));
        }
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let source = HttpPlanSource::new("http://backend:3000/");
        assert_eq!(
            source.plan_url("abc").unwrap(),
            "http://backend:3000/api/context/learning-plan/abc"
        );
    }
}
