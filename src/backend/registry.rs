use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::api::ApiExecutor;
use super::claudecode::{ClaudeCodeExecutor, ExecutableResolver};
use super::events::ExecutionObserver;
use super::station::StationExecutor;
use super::{BackendFamily, BackendKind, ExecutionRequest, ExecutionResult, Executor};
use crate::config::Config;
use crate::llm::{AnthropicClient, OllamaClient, OpenAiClient};

/// Routes requests to the executor registered for their backend family.
pub struct Dispatcher {
    executors: HashMap<BackendFamily, Arc<dyn Executor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            executors: HashMap::new(),
        }
    }

    /// Register every built-in executor using `config`.
    pub fn from_config(config: &Config) -> Self {
        let mut dispatcher = Self::new();

        let resolver = Arc::new(ExecutableResolver::new(config.claude_cli_path.clone()));
        dispatcher.register(
            BackendFamily::ClaudeCode,
            Arc::new(ClaudeCodeExecutor::new(resolver, config.kill_grace)),
        );
        dispatcher.register(
            BackendFamily::Station,
            Arc::new(StationExecutor::new(
                config.stations.clone(),
                config.kill_grace,
            )),
        );

        let openai = match &config.openai_api_key {
            Some(key) => ApiExecutor::new(
                "openai",
                Arc::new(OpenAiClient::new(key.clone(), config.openai_base_url.clone())),
            ),
            None => ApiExecutor::unconfigured("openai", "OPENAI_API_KEY"),
        };
        dispatcher.register(BackendFamily::OpenAi, Arc::new(openai));

        let anthropic = match &config.anthropic_api_key {
            Some(key) => ApiExecutor::new(
                "anthropic",
                Arc::new(AnthropicClient::new(
                    key.clone(),
                    config.anthropic_base_url.clone(),
                )),
            ),
            None => ApiExecutor::unconfigured("anthropic", "ANTHROPIC_API_KEY"),
        };
        dispatcher.register(BackendFamily::Anthropic, Arc::new(anthropic));

        dispatcher.register(
            BackendFamily::Ollama,
            Arc::new(ApiExecutor::local(Arc::new(OllamaClient::new(
                config.ollama_url.clone(),
            )))),
        );

        dispatcher
    }

    /// Register (or replace) the executor for a family.
    pub fn register(&mut self, family: BackendFamily, executor: Arc<dyn Executor>) {
        self.executors.insert(family, executor);
    }

    pub fn get(&self, family: BackendFamily) -> Option<Arc<dyn Executor>> {
        self.executors.get(&family).cloned()
    }

    /// Parse the request's model identifier and run it on the matching executor.
    pub async fn dispatch(
        &self,
        request: ExecutionRequest,
        observer: Arc<dyn ExecutionObserver>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let started = Instant::now();
        let target = match BackendKind::parse(&request.model) {
            Ok(target) => target,
            Err(e) => {
                warn!("Cannot dispatch: {}", e);
                return ExecutionResult::failure(e.to_string(), started.elapsed());
            }
        };

        let Some(executor) = self.get(target.family()) else {
            return ExecutionResult::failure(
                format!("No executor registered for {}", target.family()),
                started.elapsed(),
            );
        };

        debug!("Dispatching {} to executor {}", target, executor.id());
        executor.execute(&target, request, observer, cancel).await
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullObserver;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl Executor for Recording {
        fn id(&self) -> &str {
            "recording"
        }

        async fn execute(
            &self,
            target: &BackendKind,
            request: ExecutionRequest,
            _observer: Arc<dyn ExecutionObserver>,
            _cancel: CancellationToken,
        ) -> ExecutionResult {
            self.0.lock().unwrap().push(target.to_string());
            ExecutionResult {
                output: request.prompt,
                ..Default::default()
            }
        }
    }

    fn request(model: &str) -> ExecutionRequest {
        ExecutionRequest::new("p", model, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn routes_by_family_and_overrides_replace() {
        let recording = Arc::new(Recording(Mutex::new(Vec::new())));
        let mut dispatcher = Dispatcher::from_config(&Config::default());
        dispatcher.register(BackendFamily::Ollama, recording.clone());

        let result = dispatcher
            .dispatch(
                request("ollama:qwen2"),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert!(result.is_success());
        assert_eq!(*recording.0.lock().unwrap(), vec!["ollama:qwen2"]);
    }

    #[tokio::test]
    async fn unknown_model_is_a_failure_result() {
        let dispatcher = Dispatcher::from_config(&Config::default());
        let result = dispatcher
            .dispatch(
                request("mystery-model"),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.exit_code, 1);
        assert_eq!(result.output, "Unknown model identifier: mystery-model");
    }

    #[tokio::test]
    async fn missing_key_executor_is_registered_by_default() {
        let dispatcher = Dispatcher::from_config(&Config::default());
        let result = dispatcher
            .dispatch(
                request("openai:gpt-4o"),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert!(result.output.contains("Missing API key: OPENAI_API_KEY"));
    }

    #[tokio::test]
    async fn empty_dispatcher_reports_missing_executor() {
        let dispatcher = Dispatcher::new();
        let result = dispatcher
            .dispatch(
                request("claude"),
                Arc::new(NullObserver),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.output, "No executor registered for claudecode");
    }
}
