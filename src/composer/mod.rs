pub mod encoding;

use anyhow::{Context as AnyhowContext, Result};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// One backend call in a sequential chain. URL, header values, and body are
/// templates rendered against the accumulated [`StepContext`].
#[derive(Debug, Clone, serde::Deserialize, Serialize)]
pub struct StepConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
    /// `no-op | string | xml | yaml | safejson | rss | json` (default json).
    #[serde(default)]
    pub encoding: String,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_step_timeout_secs() -> u64 {
    10
}

/// Inbound request facts exposed to step templates.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub host: String,
    pub path: String,
    pub path_params: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
}

/// Accumulated template context: the inbound request, every decoded step
/// response under `responses.Resp<i>`, and pipeline variables.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StepContext {
    pub request: RequestInfo,
    pub responses: serde_json::Map<String, serde_json::Value>,
    pub variables: HashMap<String, String>,
}

/// What the last step produced, passed through to the client.
#[derive(Debug)]
pub struct ComposerResponse {
    pub status: u16,
    pub headers: http::HeaderMap,
    pub body: Bytes,
}

/// A step failure. Identifies the step so the 502 can say which backend in
/// the chain broke.
#[derive(Debug)]
pub struct ComposerError {
    pub step: usize,
    pub message: String,
}

impl fmt::Display for ComposerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {} failed: {}", self.step, self.message)
    }
}

impl std::error::Error for ComposerError {}

#[derive(Debug, Default)]
pub struct StepMetrics {
    pub requests: AtomicU64,
    pub errors: AtomicU64,
    pub total_latency_us: AtomicU64,
}

struct CompiledStep {
    method: http::Method,
    url_template: String,
    header_templates: Vec<(String, String)>,
    body_template: Option<String>,
    timeout: Duration,
    encoding: String,
}

/// Sequential multi-step backend composer.
///
/// Templates are compiled once at construction (a bad template refuses the
/// route); at request time each step renders its URL/headers/body against
/// the context, calls the backend, and stores the decoded response as
/// `Resp<i>` for the steps after it. The first failure short-circuits — no
/// retries, no compensation.
pub struct SequentialComposer {
    env: minijinja::Environment<'static>,
    steps: Vec<CompiledStep>,
    metrics: Vec<StepMetrics>,
    http: reqwest::Client,
}

impl SequentialComposer {
    pub fn new(steps: &[StepConfig]) -> Result<Self> {
        let mut env = minijinja::Environment::new();
        env.add_filter("json", |value: minijinja::value::Value| {
            serde_json::to_string(&value).unwrap_or_default()
        });

        let mut compiled = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let url_template = format!("step{}.url", i);
            env.add_template_owned(url_template.clone(), step.url.clone())
                .with_context(|| format!("step {} URL template", i))?;

            let mut header_templates = Vec::with_capacity(step.headers.len());
            for (name, value) in &step.headers {
                let template = format!("step{}.header.{}", i, name.to_ascii_lowercase());
                env.add_template_owned(template.clone(), value.clone())
                    .with_context(|| format!("step {} header {:?} template", i, name))?;
                header_templates.push((name.clone(), template));
            }

            let body_template = match &step.body {
                Some(body) => {
                    let template = format!("step{}.body", i);
                    env.add_template_owned(template.clone(), body.clone())
                        .with_context(|| format!("step {} body template", i))?;
                    Some(template)
                }
                None => None,
            };

            compiled.push(CompiledStep {
                method: http::Method::from_bytes(step.method.as_bytes())
                    .with_context(|| format!("step {} method {:?}", i, step.method))?,
                url_template,
                header_templates,
                body_template,
                timeout: Duration::from_secs(step.timeout_secs),
                encoding: step.encoding.clone(),
            });
        }

        Ok(Self {
            env,
            metrics: (0..compiled.len()).map(|_| StepMetrics::default()).collect(),
            steps: compiled,
            http: reqwest::Client::new(),
        })
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn metrics(&self) -> &[StepMetrics] {
        &self.metrics
    }

    /// Run the chain. The returned response is the final step's verbatim
    /// status, headers, and body.
    pub async fn execute(&self, mut ctx: StepContext) -> Result<ComposerResponse, ComposerError> {
        let mut last: Option<ComposerResponse> = None;

        for (i, step) in self.steps.iter().enumerate() {
            let started = Instant::now();
            self.metrics[i].requests.fetch_add(1, Ordering::Relaxed);

            let result = self.run_step(i, step, &ctx).await;
            self.metrics[i]
                .total_latency_us
                .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);

            let response = match result {
                Ok(response) => response,
                Err(message) => {
                    self.metrics[i].errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("composer: step {} failed: {}", i, message);
                    return Err(ComposerError { step: i, message });
                }
            };

            let decoded = encoding::decode_body(
                &step.encoding,
                &response.body,
                response.status,
                &response.headers,
            );
            ctx.responses.insert(format!("Resp{}", i), decoded);
            last = Some(response);
        }

        last.ok_or_else(|| ComposerError {
            step: 0,
            message: "no steps configured".into(),
        })
    }

    async fn run_step(
        &self,
        index: usize,
        step: &CompiledStep,
        ctx: &StepContext,
    ) -> Result<ComposerResponse, String> {
        let context = minijinja::value::Value::from_serialize(ctx);

        let url = self
            .render(&step.url_template, &context)
            .map_err(|e| format!("rendering URL: {}", e))?;

        let mut request = self
            .http
            .request(step.method.clone(), url.as_str())
            .timeout(step.timeout);

        for (name, template) in &step.header_templates {
            let value = self
                .render(template, &context)
                .map_err(|e| format!("rendering header {:?}: {}", name, e))?;
            request = request.header(name.as_str(), value);
        }

        if let Some(template) = &step.body_template {
            let body = self
                .render(template, &context)
                .map_err(|e| format!("rendering body: {}", e))?;
            request = request.body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("calling {}: {}", url, e))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| format!("reading step {} response: {}", index, e))?;

        Ok(ComposerResponse {
            status,
            headers,
            body,
        })
    }

    fn render(
        &self,
        template: &str,
        context: &minijinja::value::Value,
    ) -> Result<String, minijinja::Error> {
        self.env.get_template(template)?.render(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 responder: records request lines and answers each
    /// connection with the next canned JSON body.
    async fn spawn_backend(bodies: Vec<&'static str>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_writer = seen.clone();
        tokio::spawn(async move {
            for body in bodies {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut buf = vec![0u8; 4096];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).into_owned();
                if let Some(line) = request.lines().next() {
                    seen_writer.lock().unwrap().push(line.to_string());
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            }
        });

        (format!("http://{}", addr), seen)
    }

    fn seed() -> StepContext {
        StepContext {
            request: RequestInfo {
                method: "GET".into(),
                path: "/compose".into(),
                path_params: HashMap::from([("id".to_string(), "42".to_string())]),
                ..RequestInfo::default()
            },
            ..StepContext::default()
        }
    }

    #[test]
    fn test_bad_template_fails_construction() {
        let steps = vec![StepConfig {
            name: String::new(),
            method: "GET".into(),
            url: "http://x/{{ unclosed".into(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: 1,
            encoding: String::new(),
        }];
        assert!(SequentialComposer::new(&steps).is_err());
    }

    #[test]
    fn test_bad_method_fails_construction() {
        let steps = vec![StepConfig {
            name: String::new(),
            method: "NOT A METHOD".into(),
            url: "http://x/".into(),
            headers: HashMap::new(),
            body: None,
            timeout_secs: 1,
            encoding: String::new(),
        }];
        assert!(SequentialComposer::new(&steps).is_err());
    }

    #[tokio::test]
    async fn test_response_feeds_next_step_url() {
        let (base, seen) = spawn_backend(vec![r#"{"name":"alice"}"#, r#"{"ok":true}"#]).await;

        let steps = vec![
            StepConfig {
                name: "lookup".into(),
                method: "GET".into(),
                url: format!("{}/users/{{{{ request.path_params.id }}}}", base),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
                encoding: String::new(),
            },
            StepConfig {
                name: "posts".into(),
                method: "GET".into(),
                url: format!("{}/posts?author={{{{ responses.Resp0.name }}}}", base),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
                encoding: String::new(),
            },
        ];
        let composer = SequentialComposer::new(&steps).unwrap();

        let response = composer.execute(seed()).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_ref(), br#"{"ok":true}"#);

        let lines = seen.lock().unwrap().clone();
        assert_eq!(lines[0], "GET /users/42 HTTP/1.1");
        assert_eq!(lines[1], "GET /posts?author=alice HTTP/1.1");
    }

    #[tokio::test]
    async fn test_templated_body_and_headers() {
        let (base, seen) = spawn_backend(vec![r#"{"token":"t-9"}"#, r#"{}"#]).await;

        let steps = vec![
            StepConfig {
                name: String::new(),
                method: "GET".into(),
                url: format!("{}/token", base),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
                encoding: String::new(),
            },
            StepConfig {
                name: String::new(),
                method: "POST".into(),
                url: format!("{}/submit", base),
                headers: HashMap::from([(
                    "Authorization".to_string(),
                    "Bearer {{ responses.Resp0.token }}".to_string(),
                )]),
                body: Some(r#"{"from":"{{ request.path }}"}"#.to_string()),
                timeout_secs: 5,
                encoding: String::new(),
            },
        ];
        let composer = SequentialComposer::new(&steps).unwrap();
        composer.execute(seed()).await.unwrap();

        assert_eq!(seen.lock().unwrap()[1], "POST /submit HTTP/1.1");
    }

    #[tokio::test]
    async fn test_unreachable_backend_names_failing_step() {
        let (base, _) = spawn_backend(vec![r#"{"ok":1}"#]).await;
        let steps = vec![
            StepConfig {
                name: String::new(),
                method: "GET".into(),
                url: format!("{}/first", base),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
                encoding: String::new(),
            },
            StepConfig {
                name: String::new(),
                method: "GET".into(),
                // Closed port: the dial fails.
                url: "http://127.0.0.1:1/second".into(),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 1,
                encoding: String::new(),
            },
        ];
        let composer = SequentialComposer::new(&steps).unwrap();

        let err = composer.execute(seed()).await.unwrap_err();
        assert_eq!(err.step, 1);
        assert_eq!(
            composer.metrics()[1].errors.load(Ordering::Relaxed),
            1
        );
        // Step 0 completed before the short-circuit.
        assert_eq!(composer.metrics()[0].requests.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_step_latency_accumulates() {
        let (base, _) = spawn_backend(vec![r#"{}"#]).await;
        let steps = vec![StepConfig {
            name: String::new(),
            method: "GET".into(),
            url: base,
            headers: HashMap::new(),
            body: None,
            timeout_secs: 5,
            encoding: String::new(),
        }];
        let composer = SequentialComposer::new(&steps).unwrap();
        composer.execute(seed()).await.unwrap();

        assert!(composer.metrics()[0].total_latency_us.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_json_filter_available() {
        let (base, seen) = spawn_backend(vec![r#"{"a":{"b":1}}"#, r#"{}"#]).await;
        let steps = vec![
            StepConfig {
                name: String::new(),
                method: "GET".into(),
                url: format!("{}/a", base),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
                encoding: String::new(),
            },
            StepConfig {
                name: String::new(),
                method: "POST".into(),
                url: format!("{}/b", base),
                headers: HashMap::new(),
                body: Some("{{ responses.Resp0.a | json }}".to_string()),
                timeout_secs: 5,
                encoding: String::new(),
            },
        ];
        let composer = SequentialComposer::new(&steps).unwrap();
        composer.execute(seed()).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }
}
